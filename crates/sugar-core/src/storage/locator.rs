//! Store file location

use std::path::{Path, PathBuf};

/// Directory name used when no application name is configured
pub const DEFAULT_APP_NAME: &str = "sugar";

/// Resolves the on-disk path of a named store
///
/// Looks in the user data directory first, then in an app-named
/// subdirectory of it. Nothing is created here; parent directories are made
/// when the store is attached.
#[derive(Debug, Clone)]
pub struct StoreLocator {
    base: PathBuf,
    app_name: String,
}

impl StoreLocator {
    /// Locator rooted at the platform's user data directory
    pub fn new(app_name: Option<&str>) -> Self {
        let base = dirs::data_dir().unwrap_or_else(|| PathBuf::from("."));
        Self::with_base(base, app_name)
    }

    pub fn with_base(base: impl Into<PathBuf>, app_name: Option<&str>) -> Self {
        let app_name = app_name
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .unwrap_or(DEFAULT_APP_NAME)
            .to_string();
        Self {
            base: base.into(),
            app_name,
        }
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    pub fn app_name(&self) -> &str {
        &self.app_name
    }

    /// Directories searched, in order
    pub fn search_paths(&self) -> Vec<PathBuf> {
        vec![self.base.clone(), self.base.join(&self.app_name)]
    }

    /// First existing `<dir>/<name>`, else the path under the app directory
    pub fn resolve(&self, name: &str) -> PathBuf {
        self.search_paths()
            .into_iter()
            .map(|dir| dir.join(name))
            .find(|candidate| candidate.exists())
            .unwrap_or_else(|| self.base.join(&self.app_name).join(name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_resolve_defaults_to_app_directory() {
        let temp_dir = TempDir::new().unwrap();
        let locator = StoreLocator::with_base(temp_dir.path(), Some("notes"));

        let path = locator.resolve("sugar.sqlite");
        assert_eq!(path, temp_dir.path().join("notes").join("sugar.sqlite"));
        assert!(!path.parent().unwrap().exists());
    }

    #[test]
    fn test_resolve_prefers_existing_file_in_base() {
        let temp_dir = TempDir::new().unwrap();
        std::fs::write(temp_dir.path().join("sugar.sqlite"), b"").unwrap();
        let locator = StoreLocator::with_base(temp_dir.path(), Some("notes"));

        assert_eq!(
            locator.resolve("sugar.sqlite"),
            temp_dir.path().join("sugar.sqlite")
        );
    }

    #[test]
    fn test_missing_app_name_uses_default() {
        let locator = StoreLocator::with_base("/data", None);
        assert_eq!(locator.app_name(), DEFAULT_APP_NAME);

        let locator = StoreLocator::with_base("/data", Some("  "));
        assert_eq!(
            locator.search_paths(),
            vec![PathBuf::from("/data"), PathBuf::from("/data/sugar")]
        );
    }
}
