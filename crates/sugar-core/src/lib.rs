//! Sugar Core Library
//!
//! A persistence stack over a single SQLite store: a root writer context on
//! a private lane owns the store, a main context lives on the UI thread and
//! any number of worker contexts are confined to the threads that create
//! them.
//!
//! # Architecture
//!
//! - Committing a worker or the main context pushes its changes into the root
//! - Committing the root writes them to disk in one transaction
//! - Every commit is published to the merge broker, which folds the changes
//!   into the main context on its own thread
//!
//! # Quick Start
//!
//! ```text
//! let stack = Stack::new(StackConfig::named("sugar.sqlite"), Some(model));
//! stack.initialize()?;
//!
//! let worker = stack.worker_context()?;
//! let id = worker.insert("Person")?;
//! worker.set(id, "name", json!("Ada"))?;
//! worker.commit()?;
//! stack.commit_root()?;
//!
//! // On the UI thread
//! stack.main_queue().run_pending()?;
//! let people = stack.main_context()?.fetch_all("Person")?;
//! ```
//!
//! # Modules
//!
//! - `stack`: the facade (main entry point)
//! - `context`: working contexts and their hierarchy
//! - `merge`: change merging between contexts
//! - `storage`: store location, opening and migration recovery
//! - `cloud`: cloud-synced store location
//! - `config`: stack configuration

pub mod cloud;
pub mod config;
pub mod context;
pub mod error;
pub mod lane;
pub mod merge;
pub mod model;
pub mod object;
pub mod stack;
pub mod storage;

pub use cloud::{CloudContainerResolver, CloudLocator, DirectoryContainerResolver};
pub use config::{CloudDescriptor, StackConfig};
pub use context::{CommitOutcome, Context, ContextHierarchy, ContextId, ContextRole};
pub use error::{
    ErrorHandler, LoggingErrorHandler, StackError, StackResult, StoreOpenError,
    StoreOpenErrorKind,
};
pub use lane::{MainQueue, SerialLane};
pub use merge::ChangeMergeBroker;
pub use model::Model;
pub use object::{ChangeEvent, ManagedObject, ObjectId, Properties};
pub use stack::{Initialization, Stack, StackBuilder, StackStatus, StoreOpenStrategy};
pub use storage::{InitializerState, MigrationOutcome, StoreLocator};
