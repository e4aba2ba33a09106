//! Store file housekeeping
//!
//! A store is one primary SQLite file plus two sidecars sharing its base
//! name: `<file>-wal` and `<file>-shm`.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

/// Suffixes of the write-ahead-log and shared-memory sidecar files
pub const SIDECAR_SUFFIXES: [&str; 2] = ["-wal", "-shm"];

/// Paths of the sidecar files of a store
pub fn sidecar_paths(path: &Path) -> Vec<PathBuf> {
    SIDECAR_SUFFIXES
        .iter()
        .map(|suffix| {
            let mut name = path.as_os_str().to_owned();
            name.push(suffix);
            PathBuf::from(name)
        })
        .collect()
}

/// Primary file followed by its sidecars
pub fn store_files(path: &Path) -> Vec<PathBuf> {
    let mut files = vec![path.to_path_buf()];
    files.extend(sidecar_paths(path));
    files
}

/// Create the directory that will hold `path`
pub fn create_parent_dir(path: &Path) -> io::Result<()> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => fs::create_dir_all(parent),
        _ => Ok(()),
    }
}

/// Delete the store and its sidecars, best effort
///
/// Missing files are ignored. Other failures are logged and returned; they
/// never stop the remaining files from being removed.
pub fn remove_store_files(path: &Path) -> Vec<(PathBuf, io::Error)> {
    let mut failures = Vec::new();
    for file in store_files(path) {
        match fs::remove_file(&file) {
            Ok(()) => debug!("Removed {:?}", file),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => {
                warn!("Could not remove {:?}: {}", file, e);
                failures.push((file, e));
            }
        }
    }
    failures
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_sidecar_paths() {
        let sidecars = sidecar_paths(Path::new("/data/sugar.sqlite"));
        assert_eq!(
            sidecars,
            vec![
                PathBuf::from("/data/sugar.sqlite-wal"),
                PathBuf::from("/data/sugar.sqlite-shm"),
            ]
        );
    }

    #[test]
    fn test_remove_store_files_removes_all_three() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("sugar.sqlite");
        for file in store_files(&path) {
            fs::write(&file, b"x").unwrap();
        }

        let failures = remove_store_files(&path);
        assert!(failures.is_empty());
        for file in store_files(&path) {
            assert!(!file.exists());
        }
    }

    #[test]
    fn test_remove_store_files_tolerates_missing_sidecars() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("sugar.sqlite");
        fs::write(&path, b"x").unwrap();

        assert!(remove_store_files(&path).is_empty());
        assert!(!path.exists());
    }

    #[cfg(unix)]
    #[test]
    fn test_remove_store_files_with_non_utf8_name() {
        use std::ffi::OsStr;
        use std::os::unix::ffi::OsStrExt;

        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir
            .path()
            .join(OsStr::from_bytes(b"st\xffre.sqlite"));
        let wal = temp_dir
            .path()
            .join(OsStr::from_bytes(b"st\xffre.sqlite-wal"));
        assert_eq!(sidecar_paths(&path)[0], wal);

        fs::write(&path, b"x").unwrap();
        fs::write(&wal, b"x").unwrap();
        assert!(remove_store_files(&path).is_empty());
        assert!(!path.exists());
        assert!(!wal.exists());
    }

    #[test]
    fn test_create_parent_dir() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("a").join("b").join("sugar.sqlite");
        create_parent_dir(&path).unwrap();
        assert!(path.parent().unwrap().is_dir());
    }
}
