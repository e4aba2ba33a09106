//! Store coordinator
//!
//! Every attach, recreate and detach of the on-disk store goes through the
//! coordinator's exclusive section, so no two of them ever overlap.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, warn};

use crate::error::StoreOpenError;
use crate::model::Model;
use crate::storage::files::remove_store_files;
use crate::storage::store::{PersistentStore, StoreOptions};

/// Serializes store attachment for one stack
#[derive(Debug, Default)]
pub struct StoreCoordinator {
    model: Option<Arc<Model>>,
    attached: Mutex<Option<PathBuf>>,
}

impl StoreCoordinator {
    pub fn new(model: Option<Arc<Model>>) -> Self {
        Self {
            model,
            attached: Mutex::new(None),
        }
    }

    pub fn model(&self) -> Option<&Arc<Model>> {
        self.model.as_ref()
    }

    fn exclusive(&self) -> MutexGuard<'_, Option<PathBuf>> {
        self.attached
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Path of the currently attached store, if any
    pub fn attached_path(&self) -> Option<PathBuf> {
        self.exclusive().clone()
    }

    /// Open the store at `path`
    pub fn attach(
        &self,
        path: &Path,
        options: &StoreOptions,
    ) -> Result<PersistentStore, StoreOpenError> {
        let mut attached = self.exclusive();
        if let Some(previous) = attached.as_ref() {
            warn!("Attaching {:?} while {:?} is still attached", path, previous);
        }

        let store = PersistentStore::attach(path, self.model.as_deref(), options)?;
        debug!("Attached store {:?}", path);
        *attached = Some(path.to_path_buf());
        Ok(store)
    }

    /// Delete the store files at `path` and attach an empty store there
    pub fn recreate(
        &self,
        path: &Path,
        options: &StoreOptions,
    ) -> Result<PersistentStore, StoreOpenError> {
        let mut attached = self.exclusive();
        if attached.as_deref() == Some(path) {
            *attached = None;
        }

        let failures = remove_store_files(path);
        if !failures.is_empty() {
            warn!(
                "{} store file(s) could not be removed before recreating {:?}",
                failures.len(),
                path
            );
        }

        let store = PersistentStore::attach(path, self.model.as_deref(), options)?;
        debug!("Recreated store {:?}", path);
        *attached = Some(path.to_path_buf());
        Ok(store)
    }

    /// Forget the attached store
    pub fn detach(&self) -> Option<PathBuf> {
        let detached = self.exclusive().take();
        if let Some(ref path) = detached {
            debug!("Detached store {:?}", path);
        }
        detached
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_attach_and_detach_track_path() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("sugar.sqlite");
        let coordinator = StoreCoordinator::new(None);

        assert!(coordinator.attached_path().is_none());
        let _store = coordinator.attach(&path, &StoreOptions::plain()).unwrap();
        assert_eq!(coordinator.attached_path(), Some(path.clone()));

        assert_eq!(coordinator.detach(), Some(path));
        assert!(coordinator.attached_path().is_none());
    }

    #[test]
    fn test_recreate_replaces_garbage_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("sugar.sqlite");
        std::fs::write(&path, b"not a database").unwrap();
        std::fs::write(temp_dir.path().join("sugar.sqlite-wal"), b"stale").unwrap();

        let coordinator = StoreCoordinator::new(None);
        assert!(coordinator.attach(&path, &StoreOptions::plain()).is_err());

        let store = coordinator.recreate(&path, &StoreOptions::plain()).unwrap();
        assert_eq!(store.count("Anything").unwrap(), 0);
    }
}
