//! Execution lanes
//!
//! Contexts are confined, not locked. The root context runs on a private
//! [`SerialLane`] (a dedicated thread draining a FIFO of jobs). The main
//! context belongs to the thread that owns the UI; work for it is queued on
//! the [`MainQueue`] and runs when the host drains the queue on that thread.

use std::io;
use std::sync::mpsc::{self, Receiver, Sender, TryRecvError};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle, ThreadId};

use tracing::{debug, warn};

use crate::error::StackError;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// A named background thread that runs jobs one at a time, in order
pub struct SerialLane {
    name: String,
    thread_id: ThreadId,
    sender: Mutex<Option<Sender<Job>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl SerialLane {
    pub fn spawn(name: impl Into<String>) -> io::Result<Self> {
        let name = name.into();
        let (sender, receiver) = mpsc::channel::<Job>();

        let handle = thread::Builder::new().name(name.clone()).spawn(move || {
            for job in receiver {
                job();
            }
        })?;
        debug!(lane = %name, "Spawned execution lane");

        Ok(Self {
            thread_id: handle.thread().id(),
            name,
            sender: Mutex::new(Some(sender)),
            handle: Mutex::new(Some(handle)),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the calling thread is this lane
    pub fn is_current(&self) -> bool {
        thread::current().id() == self.thread_id
    }

    /// Queue a job and return immediately
    pub fn perform(&self, job: impl FnOnce() + Send + 'static) -> Result<(), StackError> {
        let sender = self
            .sender
            .lock()
            .map_err(|_| StackError::LaneClosed(self.name.clone()))?;
        match sender.as_ref() {
            Some(tx) => tx
                .send(Box::new(job))
                .map_err(|_| StackError::LaneClosed(self.name.clone())),
            None => Err(StackError::LaneClosed(self.name.clone())),
        }
    }

    /// Run a job on the lane and wait for its result
    ///
    /// Runs inline when already on the lane, so nested calls cannot deadlock.
    pub fn perform_and_wait<R: Send + 'static>(
        &self,
        job: impl FnOnce() -> R + Send + 'static,
    ) -> Result<R, StackError> {
        if self.is_current() {
            return Ok(job());
        }

        let (tx, rx) = mpsc::sync_channel(1);
        self.perform(move || {
            let _ = tx.send(job());
        })?;
        rx.recv()
            .map_err(|_| StackError::LaneClosed(self.name.clone()))
    }

    /// Stop accepting jobs and wait for queued ones to finish
    pub fn shutdown(&self) {
        if let Ok(mut sender) = self.sender.lock() {
            sender.take();
        }
        if self.is_current() {
            return;
        }
        let handle = self.handle.lock().ok().and_then(|mut h| h.take());
        if let Some(handle) = handle {
            if handle.join().is_err() {
                warn!(lane = %self.name, "Execution lane panicked");
            }
        }
    }
}

impl Drop for SerialLane {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct MainQueueInner {
    owner: ThreadId,
    sender: Sender<Job>,
    receiver: Mutex<Receiver<Job>>,
}

/// FIFO of jobs that must run on the UI-owning thread
#[derive(Clone)]
pub struct MainQueue {
    inner: Arc<MainQueueInner>,
}

impl MainQueue {
    /// Create a queue owned by the calling thread
    pub fn for_current_thread() -> Self {
        let (sender, receiver) = mpsc::channel();
        Self {
            inner: Arc::new(MainQueueInner {
                owner: thread::current().id(),
                sender,
                receiver: Mutex::new(receiver),
            }),
        }
    }

    pub fn owner(&self) -> ThreadId {
        self.inner.owner
    }

    pub fn is_current(&self) -> bool {
        thread::current().id() == self.inner.owner
    }

    pub fn dispatch(&self, job: impl FnOnce() + Send + 'static) {
        if self.inner.sender.send(Box::new(job)).is_err() {
            warn!("Main queue is closed; dropped a job");
        }
    }

    /// Run every queued job; must be called from the owning thread
    ///
    /// Returns the number of jobs run, including jobs queued while draining.
    pub fn run_pending(&self) -> Result<usize, StackError> {
        if !self.is_current() {
            return Err(StackError::Confinement {
                context: "main queue".to_string(),
            });
        }

        let receiver = self
            .inner
            .receiver
            .lock()
            .map_err(|_| StackError::LaneClosed("main queue".to_string()))?;
        let mut ran = 0;
        loop {
            match receiver.try_recv() {
                Ok(job) => {
                    job();
                    ran += 1;
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }
        Ok(ran)
    }

    /// Drop queued jobs without running them; callable from any thread
    pub fn discard_pending(&self) -> usize {
        let discarded: Vec<Job> = match self.inner.receiver.lock() {
            Ok(receiver) => receiver.try_iter().collect(),
            Err(_) => Vec::new(),
        };
        discarded.len()
    }
}
