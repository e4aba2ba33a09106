//! Change merging between contexts
//!
//! A typed event bus: subscribers register against a source context and
//! receive its [`ChangeEvent`]s after every successful commit. Deliveries to
//! the main context are queued on the [`MainQueue`]; background deliveries
//! run inline. Delivery from one source to one subscriber is FIFO.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, trace};

use crate::context::{Context, ContextId};
use crate::error::ErrorHandler;
use crate::lane::MainQueue;
use crate::object::ChangeEvent;

/// Where a subscriber receives its events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Queued for the UI-owning thread
    MainThread,
    /// Applied on the committing thread
    Inline,
}

struct Registration {
    subscriber: Context,
    delivery: Delivery,
}

pub struct ChangeMergeBroker {
    main_queue: MainQueue,
    errors: Arc<dyn ErrorHandler>,
    /// Registrations keyed by source context
    registrations: Mutex<HashMap<ContextId, Vec<Registration>>>,
}

impl ChangeMergeBroker {
    pub fn new(main_queue: MainQueue, errors: Arc<dyn ErrorHandler>) -> Self {
        Self {
            main_queue,
            errors,
            registrations: Mutex::new(HashMap::new()),
        }
    }

    fn registrations(&self) -> MutexGuard<'_, HashMap<ContextId, Vec<Registration>>> {
        self.registrations
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Deliver `source`'s commits to `subscriber`
    ///
    /// Registering the same pair twice has no effect.
    pub fn observe(&self, subscriber: &Context, source: ContextId, on_main_thread: bool) {
        let delivery = if on_main_thread {
            Delivery::MainThread
        } else {
            Delivery::Inline
        };

        let mut registrations = self.registrations();
        let list = registrations.entry(source).or_default();
        if list.iter().any(|r| r.subscriber.id() == subscriber.id()) {
            return;
        }
        list.push(Registration {
            subscriber: subscriber.clone(),
            delivery,
        });
        debug!(
            subscriber = %subscriber.name(),
            source = %source,
            ?delivery,
            "Observing commits"
        );
    }

    /// Returns whether a registration was removed
    pub fn stop_observing(&self, subscriber: ContextId, source: ContextId) -> bool {
        // Registrations hold contexts; they are dropped after the lock is released
        let removed = {
            let mut registrations = self.registrations();
            let Some(list) = registrations.get_mut(&source) else {
                return false;
            };
            let removed = list
                .iter()
                .position(|r| r.subscriber.id() == subscriber)
                .map(|index| list.remove(index));
            if list.is_empty() {
                registrations.remove(&source);
            }
            removed
        };
        removed.is_some()
    }

    /// Drop every registration against `source`
    pub fn forget_source(&self, source: ContextId) -> usize {
        let removed = self.registrations().remove(&source);
        removed.map_or(0, |list| list.len())
    }

    /// Drop every registration
    pub fn clear(&self) -> usize {
        let drained = std::mem::take(&mut *self.registrations());
        let count = drained.values().map(Vec::len).sum();
        if count > 0 {
            debug!(registrations = count, "Cleared merge broker");
        }
        count
    }

    pub fn subscription_count(&self) -> usize {
        self.registrations().values().map(Vec::len).sum()
    }

    /// Subscribers registered against `source`
    pub fn subscribers_of(&self, source: ContextId) -> Vec<ContextId> {
        self.registrations()
            .get(&source)
            .map(|list| list.iter().map(|r| r.subscriber.id()).collect())
            .unwrap_or_default()
    }

    /// Fan a committed event out to the source's subscribers
    pub fn on_commit(&self, source: ContextId, event: ChangeEvent) {
        self.publish(source, event).deliver();
    }

    /// Queue main-thread deliveries now and hand back the inline ones
    ///
    /// Inline deliveries must run on the committing thread, where the
    /// background subscribers are confined.
    pub(crate) fn publish(&self, source: ContextId, event: ChangeEvent) -> InlineDeliveries {
        let targets: Vec<(Context, Delivery)> = self
            .registrations()
            .get(&source)
            .map(|list| {
                list.iter()
                    .map(|r| (r.subscriber.clone(), r.delivery))
                    .collect()
            })
            .unwrap_or_default();

        let mut inline = Vec::new();
        for (subscriber, delivery) in targets {
            trace!(subscriber = %subscriber.name(), source = %source, ?delivery, "Delivering changes");
            match delivery {
                Delivery::MainThread => {
                    let errors = Arc::clone(&self.errors);
                    let event = event.clone();
                    self.main_queue.dispatch(move || {
                        if let Err(e) = subscriber.merge_changes(event) {
                            errors.handle(&e);
                        }
                    });
                }
                Delivery::Inline => inline.push(subscriber),
            }
        }

        InlineDeliveries {
            targets: inline,
            event,
            errors: Arc::clone(&self.errors),
        }
    }
}

/// Inline deliveries of one commit, not yet applied
pub(crate) struct InlineDeliveries {
    targets: Vec<Context>,
    event: ChangeEvent,
    errors: Arc<dyn ErrorHandler>,
}

impl InlineDeliveries {
    pub(crate) fn deliver(self) {
        let InlineDeliveries {
            targets,
            event,
            errors,
        } = self;
        for subscriber in targets {
            if let Err(e) = subscriber.merge_changes(event.clone()) {
                errors.handle(&e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ContextRole;
    use crate::error::LoggingErrorHandler;
    use crate::lane::SerialLane;
    use crate::storage::{PersistentStore, StoreOptions};
    use std::thread;
    use tempfile::TempDir;

    fn setup() -> (TempDir, MainQueue, Arc<ChangeMergeBroker>, Context) {
        let temp_dir = TempDir::new().unwrap();
        let store = PersistentStore::attach(
            &temp_dir.path().join("sugar.sqlite"),
            None,
            &StoreOptions::plain(),
        )
        .unwrap();
        let queue = MainQueue::for_current_thread();
        let errors: Arc<dyn ErrorHandler> = Arc::new(LoggingErrorHandler);
        let broker = Arc::new(ChangeMergeBroker::new(queue.clone(), Arc::clone(&errors)));
        let lane = Arc::new(SerialLane::spawn("merge-test-root").unwrap());
        let root = Context::root(store, lane, None, Arc::clone(&broker), errors);
        (temp_dir, queue, broker, root)
    }

    #[test]
    fn test_observe_is_idempotent_and_stoppable() {
        let (_dir, _queue, broker, root) = setup();
        let main = Context::child(ContextRole::Main, &root, thread::current().id());

        broker.observe(&main, root.id(), true);
        broker.observe(&main, root.id(), true);
        assert_eq!(broker.subscription_count(), 1);
        assert_eq!(broker.subscribers_of(root.id()), vec![main.id()]);

        assert!(broker.stop_observing(main.id(), root.id()));
        assert!(!broker.stop_observing(main.id(), root.id()));
        assert_eq!(broker.subscription_count(), 0);
    }

    #[test]
    fn test_main_thread_delivery_waits_for_the_queue() {
        let (_dir, queue, broker, root) = setup();
        let main = Context::child(ContextRole::Main, &root, queue.owner());
        broker.observe(&main, root.id(), true);

        root.insert("Person").unwrap();
        root.commit().unwrap();

        // Reads go through to the root until the merge registers the object
        let before = main.fetch_all("Person").unwrap();
        assert_eq!(before.len(), 1);
        assert_eq!(queue.run_pending().unwrap(), 1);
        assert_eq!(main.fetch_all("Person").unwrap(), before);
    }

    #[test]
    fn test_fifo_per_source_and_subscriber() {
        let (_dir, queue, broker, root) = setup();
        let main = Context::child(ContextRole::Main, &root, queue.owner());
        broker.observe(&main, root.id(), true);

        let id = root.insert("Person").unwrap();
        root.commit().unwrap();
        let id = root.resolve_id(id).unwrap();
        for n in 0..5 {
            root.set(id, "n", serde_json::json!(n)).unwrap();
            root.commit().unwrap();
        }

        assert_eq!(queue.run_pending().unwrap(), 6);
        let merged = main.object(id).unwrap().unwrap();
        assert_eq!(merged.get("n"), Some(&serde_json::json!(4)));
    }

    #[test]
    fn test_inline_delivery_on_a_worker() {
        let (_dir, _queue, broker, root) = setup();
        let worker = Context::child(ContextRole::Worker, &root, thread::current().id());
        broker.observe(&worker, root.id(), false);

        root.insert("Person").unwrap();
        root.commit().unwrap();

        // Delivered before commit returned
        assert_eq!(worker.fetch_all("Person").unwrap().len(), 1);
        assert_eq!(broker.clear(), 1);
    }

    #[test]
    fn test_dropping_a_source_forgets_its_registrations() {
        let (_dir, queue, broker, root) = setup();
        let main = Context::child(ContextRole::Main, &root, queue.owner());
        let worker = Context::child(ContextRole::Worker, &root, thread::current().id());
        broker.observe(&main, worker.id(), true);
        assert_eq!(broker.subscription_count(), 1);

        drop(worker);
        assert_eq!(broker.subscription_count(), 0);
    }
}
