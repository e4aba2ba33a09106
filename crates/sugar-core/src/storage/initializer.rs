//! Store initialization and migration recovery
//!
//! ```text
//! Unopened -> Opening -> Open
//!                     -> MigrationFailed -> Recreating -> Open
//! ```
//!
//! Only schema incompatibilities lead to `MigrationFailed`. Recovering from
//! one deletes the store with its sidecars and starts over with an empty
//! store: existing data is discarded. A failure anywhere else ends in
//! `Failed` and is returned to the caller.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::error::StoreOpenError;
use crate::storage::coordinator::StoreCoordinator;
use crate::storage::store::{PersistentStore, StoreOptions};

/// Where the initializer is in its state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum InitializerState {
    Unopened,
    Opening,
    Open,
    MigrationFailed,
    Recreating,
    Failed,
}

/// How the store ended up open (or not)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MigrationOutcome {
    Opened,
    RecreatedAfterIncompatibility,
    FatalOpenError,
}

/// A live store and how it was obtained
#[derive(Debug)]
pub struct OpenedStore {
    pub store: PersistentStore,
    pub outcome: MigrationOutcome,
}

pub struct StoreInitializer {
    coordinator: Arc<StoreCoordinator>,
    path: PathBuf,
    options: StoreOptions,
    state: InitializerState,
}

impl StoreInitializer {
    pub fn new(coordinator: Arc<StoreCoordinator>, path: PathBuf, options: StoreOptions) -> Self {
        Self {
            coordinator,
            path,
            options,
            state: InitializerState::Unopened,
        }
    }

    pub fn state(&self) -> InitializerState {
        self.state
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn transition(&mut self, next: InitializerState) {
        debug!("Store initializer {:?} -> {:?}", self.state, next);
        self.state = next;
    }

    /// Open the store, recreating it once if its schema is incompatible
    pub fn open(&mut self) -> Result<OpenedStore, StoreOpenError> {
        self.transition(InitializerState::Opening);

        match self.coordinator.attach(&self.path, &self.options) {
            Ok(store) => {
                self.transition(InitializerState::Open);
                info!("Opened store {:?}", self.path);
                Ok(OpenedStore {
                    store,
                    outcome: MigrationOutcome::Opened,
                })
            }
            Err(e) if e.is_migration_failure() => {
                self.transition(InitializerState::MigrationFailed);
                warn!(
                    "Store {:?} is incompatible with the current model: {}. Deleting it and starting empty; existing data is lost",
                    self.path, e
                );
                self.recreate()
            }
            Err(e) => {
                self.transition(InitializerState::Failed);
                error!("Failed to open store {:?}: {}", self.path, e);
                Err(e)
            }
        }
    }

    fn recreate(&mut self) -> Result<OpenedStore, StoreOpenError> {
        self.transition(InitializerState::Recreating);

        match self
            .coordinator
            .recreate(&self.path, &self.options.without_migration())
        {
            Ok(store) => {
                self.transition(InitializerState::Open);
                info!("Recreated empty store {:?}", self.path);
                Ok(OpenedStore {
                    store,
                    outcome: MigrationOutcome::RecreatedAfterIncompatibility,
                })
            }
            Err(e) => {
                self.transition(InitializerState::Failed);
                error!("Failed to recreate store {:?}: {}", self.path, e);
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Model;
    use crate::object::{ChangeSet, ManagedObject, ObjectId};
    use tempfile::TempDir;

    fn seed(path: &Path, model: Model) {
        let coordinator = StoreCoordinator::new(Some(Arc::new(model)));
        let store = coordinator.attach(path, &StoreOptions::plain()).unwrap();
        let mut changes = ChangeSet::default();
        changes.record_insert(ManagedObject::new(ObjectId::new_permanent(), "Person"));
        store.apply(&changes).unwrap();
    }

    #[test]
    fn test_fresh_store_opens() {
        let temp_dir = TempDir::new().unwrap();
        let coordinator = Arc::new(StoreCoordinator::new(None));
        let mut initializer = StoreInitializer::new(
            coordinator,
            temp_dir.path().join("sugar.sqlite"),
            StoreOptions::for_automigration(true),
        );
        assert_eq!(initializer.state(), InitializerState::Unopened);

        let opened = initializer.open().unwrap();
        assert_eq!(opened.outcome, MigrationOutcome::Opened);
        assert_eq!(initializer.state(), InitializerState::Open);
    }

    #[test]
    fn test_incompatible_store_is_recreated_once() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("sugar.sqlite");
        seed(&path, Model::new().entity("Person", &["name"]));

        let current = Model::new().entity("Person", &["name", "email"]);
        let coordinator = Arc::new(StoreCoordinator::new(Some(Arc::new(current))));
        let mut initializer =
            StoreInitializer::new(coordinator, path, StoreOptions::for_automigration(false));

        let opened = initializer.open().unwrap();
        assert_eq!(opened.outcome, MigrationOutcome::RecreatedAfterIncompatibility);
        assert_eq!(initializer.state(), InitializerState::Open);
        assert_eq!(opened.store.count("Person").unwrap(), 0);
    }

    #[test]
    fn test_missing_source_model_is_recreated() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("sugar.sqlite");
        seed(&path, Model::new().entity("Person", &["name"]));

        let current = Model::new().entity("Person", &["name", "email"]);
        let coordinator = Arc::new(StoreCoordinator::new(Some(Arc::new(current))));
        let mut initializer =
            StoreInitializer::new(coordinator, path, StoreOptions::for_automigration(true));

        let opened = initializer.open().unwrap();
        assert_eq!(opened.outcome, MigrationOutcome::RecreatedAfterIncompatibility);
    }

    #[test]
    fn test_corrupt_file_is_fatal() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("sugar.sqlite");
        std::fs::write(&path, vec![0x42u8; 4096]).unwrap();

        let coordinator = Arc::new(StoreCoordinator::new(None));
        let mut initializer =
            StoreInitializer::new(coordinator, path.clone(), StoreOptions::for_automigration(false));

        let err = initializer.open().unwrap_err();
        assert!(!err.is_migration_failure());
        assert_eq!(initializer.state(), InitializerState::Failed);
        // Fatal errors leave the file alone
        assert!(path.exists());
    }
}
