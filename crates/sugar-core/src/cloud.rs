//! Cloud-synced store location
//!
//! A cloud-backed stack keeps its store inside a container resolved from an
//! identity token. When no container is available the stack falls back to
//! the local store.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::config::CloudDescriptor;
use crate::error::{StackError, StackResult};
use crate::storage::StoreOptions;

/// Looks up the local directory backing a cloud container
pub trait CloudContainerResolver: Send + Sync {
    /// `None` when the container is not available on this machine
    fn container_for(&self, identity_token: &str) -> Option<PathBuf>;
}

/// Containers are subdirectories of one root, named after their identity
#[derive(Debug, Clone)]
pub struct DirectoryContainerResolver {
    root: PathBuf,
}

impl DirectoryContainerResolver {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl Default for DirectoryContainerResolver {
    fn default() -> Self {
        Self::new(
            dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("sugar-cloud"),
        )
    }
}

impl CloudContainerResolver for DirectoryContainerResolver {
    fn container_for(&self, identity_token: &str) -> Option<PathBuf> {
        let container = self.root.join(identity_token);
        if container.is_dir() {
            Some(container)
        } else {
            debug!("No cloud container at {:?}", container);
            None
        }
    }
}

/// Result of moving a store into a cloud container
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloudRelocation {
    pub store_path: PathBuf,
    pub data_path: PathBuf,
    pub logs_path: PathBuf,
    pub options: StoreOptions,
}

pub struct CloudLocator {
    resolver: Arc<dyn CloudContainerResolver>,
    descriptor: CloudDescriptor,
}

impl CloudLocator {
    pub fn new(resolver: Arc<dyn CloudContainerResolver>, descriptor: CloudDescriptor) -> Self {
        Self {
            resolver,
            descriptor,
        }
    }

    pub fn descriptor(&self) -> &CloudDescriptor {
        &self.descriptor
    }

    /// Compute the cloud location of the store file `file_name`
    ///
    /// Creates the container's data directory. Fails with
    /// [`StackError::CloudUnavailable`] when there is no usable container.
    pub fn relocate(&self, file_name: &str) -> StackResult<CloudRelocation> {
        let identity = &self.descriptor.identity_token;
        let unavailable = || StackError::CloudUnavailable {
            identity: identity.clone(),
        };

        let container = self.resolver.container_for(identity).ok_or_else(unavailable)?;
        let data_path = container.join(&self.descriptor.data_directory_name);
        let logs_path = container.join(&self.descriptor.logs_directory_name);

        if !data_path.exists() {
            if let Err(e) = std::fs::create_dir_all(&data_path) {
                warn!("Could not create cloud data directory {:?}: {}", data_path, e);
                return Err(unavailable());
            }
        }

        let store_path = data_path.join(file_name);
        info!("Store relocated to cloud container: {:?}", store_path);
        Ok(CloudRelocation {
            options: StoreOptions::cloud(identity.clone(), logs_path.clone()),
            store_path,
            data_path,
            logs_path,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_relocate_into_existing_container() {
        let temp_dir = TempDir::new().unwrap();
        std::fs::create_dir(temp_dir.path().join("com.example.app")).unwrap();
        let resolver = Arc::new(DirectoryContainerResolver::new(temp_dir.path()));
        let locator = CloudLocator::new(resolver, CloudDescriptor::new("com.example.app"));

        let relocation = locator.relocate("sugar.sqlite").unwrap();
        let container = temp_dir.path().join("com.example.app");
        assert_eq!(relocation.data_path, container.join("Data"));
        assert_eq!(relocation.logs_path, container.join("Logs"));
        assert_eq!(relocation.store_path, container.join("Data").join("sugar.sqlite"));
        assert!(relocation.data_path.is_dir());

        let cloud = relocation.options.cloud_content.unwrap();
        assert_eq!(cloud.content_name, "com.example.app");
        assert_eq!(cloud.content_location, container.join("Logs"));
        assert!(relocation.options.automatic_migration);
        assert!(relocation.options.infer_mapping);
    }

    #[test]
    fn test_missing_container_is_unavailable() {
        let temp_dir = TempDir::new().unwrap();
        let resolver = Arc::new(DirectoryContainerResolver::new(temp_dir.path()));
        let locator = CloudLocator::new(resolver, CloudDescriptor::new("com.example.absent"));

        let err = locator.relocate("sugar.sqlite").unwrap_err();
        assert!(matches!(
            err,
            StackError::CloudUnavailable { ref identity } if identity == "com.example.absent"
        ));
        assert!(err.is_recoverable());
    }
}
