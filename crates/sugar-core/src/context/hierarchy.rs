//! The context tree
//!
//! ```text
//!            root (private lane, owns the store)
//!           /     \
//!        main     worker, worker, ...
//! ```
//!
//! Main and every worker are direct children of the root. Main observes the
//! root's commits and every worker's commits, delivered on its own thread.

use std::sync::Arc;
use std::thread::{self, ThreadId};

use tracing::info;

use crate::context::{CommitOutcome, Context, ContextRole};
use crate::error::{ErrorHandler, StackError, StackResult};
use crate::lane::SerialLane;
use crate::merge::ChangeMergeBroker;
use crate::model::Model;
use crate::storage::PersistentStore;

/// Name of the root context's lane thread
pub const ROOT_LANE_NAME: &str = "sugar-root";

fn missing_root(requested: ContextRole) -> StackError {
    StackError::Configuration(format!(
        "cannot create the {} context before the root context exists",
        requested
    ))
}

pub struct ContextHierarchy {
    root: Context,
    main: Context,
    broker: Arc<ChangeMergeBroker>,
}

impl std::fmt::Debug for ContextHierarchy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContextHierarchy")
            .field("root", &self.root)
            .field("main", &self.main)
            .finish()
    }
}

impl ContextHierarchy {
    /// Root context over `store`, running on its own lane
    pub fn create_root(
        store: PersistentStore,
        model: Option<Arc<Model>>,
        broker: &Arc<ChangeMergeBroker>,
        errors: Arc<dyn ErrorHandler>,
    ) -> StackResult<Context> {
        let lane = SerialLane::spawn(ROOT_LANE_NAME).map_err(|e| {
            StackError::Configuration(format!("could not start the root lane: {}", e))
        })?;
        Ok(Context::root(
            store,
            Arc::new(lane),
            model,
            Arc::clone(broker),
            errors,
        ))
    }

    /// Main context, confined to `owner` and fed by the root's commits
    pub fn create_main(root: Option<&Context>, owner: ThreadId) -> StackResult<Context> {
        let root = root
            .filter(|root| root.role() == ContextRole::Root)
            .ok_or_else(|| missing_root(ContextRole::Main))?;

        let main = Context::child(ContextRole::Main, root, owner);
        root.broker().observe(&main, root.id(), true);
        Ok(main)
    }

    /// New worker confined to the calling thread
    ///
    /// When `main` is given it observes the worker's commits.
    pub fn create_worker(root: Option<&Context>, main: Option<&Context>) -> StackResult<Context> {
        let root = root
            .filter(|root| root.role() == ContextRole::Root)
            .ok_or_else(|| missing_root(ContextRole::Worker))?;

        let worker = Context::child(ContextRole::Worker, root, thread::current().id());
        if let Some(main) = main {
            root.broker().observe(main, worker.id(), true);
        }
        Ok(worker)
    }

    /// Root and main over a freshly opened store
    pub fn build(
        store: PersistentStore,
        model: Option<Arc<Model>>,
        broker: Arc<ChangeMergeBroker>,
        main_thread: ThreadId,
        errors: Arc<dyn ErrorHandler>,
    ) -> StackResult<Self> {
        let root = Self::create_root(store, model, &broker, errors)?;
        let main = Self::create_main(Some(&root), main_thread)?;
        info!("Context hierarchy ready");
        Ok(Self { root, main, broker })
    }

    pub fn root(&self) -> &Context {
        &self.root
    }

    pub fn main(&self) -> &Context {
        &self.main
    }

    /// A fresh worker for the calling thread
    pub fn worker(&self) -> StackResult<Context> {
        Self::create_worker(Some(&self.root), Some(&self.main))
    }

    pub fn commit(&self, context: &Context) -> StackResult<CommitOutcome> {
        context.commit()
    }
}

impl Drop for ContextHierarchy {
    fn drop(&mut self) {
        // Main is held by its registrations
        self.broker.clear();
    }
}
