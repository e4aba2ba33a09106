//! Storage layer
//!
//! Locates, opens and recovers the single SQLite store behind a stack.
//!
//! ## Architecture
//!
//! - **locator**: resolves where the store file lives
//! - **initializer**: opens it, recreating it on schema incompatibility
//! - **coordinator**: serializes attach and detach
//! - **store**: the opened store, owned by the root context

pub mod coordinator;
pub mod files;
pub mod initializer;
pub mod locator;
pub mod schema;
pub mod store;

pub use coordinator::StoreCoordinator;
pub use files::remove_store_files;
pub use initializer::{InitializerState, MigrationOutcome, OpenedStore, StoreInitializer};
pub use locator::{StoreLocator, DEFAULT_APP_NAME};
pub use schema::{init_schema, needs_init, SCHEMA_VERSION};
pub use store::{CloudContentOptions, JournalMode, PersistentStore, StoreOptions};
