//! Data directory layout.
//!
//! ```text
//! <data_dir>/
//! ├─ pmse_identlist.pool   # metadata list: ident -> namespace, shutdown flag
//! ├─ <ident>.pool          # one pool per collection
//! └─ <ident>.pool.creating # staging file of a pool being created
//! ```
//!
//! Index trees live inside their collection's pool and have no file of
//! their own.

use crate::error::{CoreError, CoreResult};
use crate::identlist::IDENTLIST_FILE;
use crate::pool::STAGING_SUFFIX;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Extension of collection pool files.
pub const POOL_EXTENSION: &str = "pool";

const MAX_IDENT_LEN: usize = 200;

/// The engine's data directory.
#[derive(Debug, Clone)]
pub struct DataDir {
    path: PathBuf,
}

impl DataDir {
    /// Opens or creates a data directory.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the directory is missing and
    /// `create_if_missing` is false, or `InvalidOperation` if `path` is not
    /// a directory.
    pub fn open(path: &Path, create_if_missing: bool) -> CoreResult<Self> {
        if !path.exists() {
            if create_if_missing {
                fs::create_dir_all(path)?;
            } else {
                return Err(CoreError::not_found(format!(
                    "data directory {}",
                    path.display()
                )));
            }
        }

        if !path.is_dir() {
            return Err(CoreError::invalid_operation(format!(
                "path is not a directory: {}",
                path.display()
            )));
        }

        Ok(Self {
            path: path.to_path_buf(),
        })
    }

    /// Root path of the directory.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Path of the metadata pool.
    #[must_use]
    pub fn identlist_path(&self) -> PathBuf {
        self.path.join(IDENTLIST_FILE)
    }

    /// Path of the pool file of collection `ident`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidOperation` if `ident` cannot be used as a file name.
    pub fn pool_path(&self, ident: &str) -> CoreResult<PathBuf> {
        validate_ident(ident)?;
        Ok(self.path.join(format!("{ident}.{POOL_EXTENSION}")))
    }

    /// Identifiers of every collection pool file present on disk, sorted.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the directory cannot be listed.
    pub fn pool_files(&self) -> CoreResult<Vec<String>> {
        let suffix = format!(".{POOL_EXTENSION}");
        let mut idents = Vec::new();
        for entry in fs::read_dir(&self.path)? {
            let name = entry?.file_name();
            let Some(name) = name.to_str() else { continue };
            if name == IDENTLIST_FILE {
                continue;
            }
            if let Some(ident) = name.strip_suffix(&suffix) {
                idents.push(ident.to_string());
            }
        }
        idents.sort();
        Ok(idents)
    }

    /// Deletes staging files left behind by interrupted pool creation.
    ///
    /// Returns the number of files removed.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the directory cannot be listed or a file
    /// cannot be removed.
    pub fn clean_staging(&self) -> CoreResult<usize> {
        let mut removed = 0;
        for entry in fs::read_dir(&self.path)? {
            let entry = entry?;
            let is_staging = entry
                .file_name()
                .to_str()
                .is_some_and(|name| name.ends_with(STAGING_SUFFIX));
            if is_staging {
                tracing::warn!(path = %entry.path().display(), "removing interrupted pool creation");
                fs::remove_file(entry.path())?;
                removed += 1;
            }
        }
        if removed > 0 {
            self.sync_directory()?;
        }
        Ok(removed)
    }

    /// Deletes the pool file of `ident`. A missing file is not an error.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the file exists but cannot be removed.
    pub fn remove_pool(&self, ident: &str) -> CoreResult<()> {
        let path = self.pool_path(ident)?;
        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        }
        self.sync_directory()
    }

    /// Syncs the directory so renames and deletions are durable.
    #[cfg(unix)]
    pub fn sync_directory(&self) -> CoreResult<()> {
        let dir = fs::File::open(&self.path)?;
        dir.sync_all()?;
        Ok(())
    }

    /// Syncs the directory so renames and deletions are durable.
    #[cfg(not(unix))]
    pub fn sync_directory(&self) -> CoreResult<()> {
        Ok(())
    }
}

/// Checks that `ident` is usable as a pool file name.
///
/// # Errors
///
/// Returns `InvalidOperation` for empty, over-long, or path-like identifiers.
pub fn validate_ident(ident: &str) -> CoreResult<()> {
    let valid = !ident.is_empty()
        && ident.len() <= MAX_IDENT_LEN
        && ident != "."
        && ident != ".."
        && ident
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '$'));
    if valid {
        Ok(())
    } else {
        Err(CoreError::invalid_operation(format!(
            "invalid identifier {ident:?}"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn create_new_directory() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("data");
        let dir = DataDir::open(&path, true).unwrap();
        assert!(path.is_dir());
        assert_eq!(dir.identlist_path(), path.join(IDENTLIST_FILE));
    }

    #[test]
    fn missing_directory_without_create() {
        let temp = tempdir().unwrap();
        let result = DataDir::open(&temp.path().join("data"), false);
        assert!(matches!(result, Err(CoreError::NotFound { .. })));
    }

    #[test]
    fn file_is_not_a_directory() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("file");
        fs::write(&path, b"x").unwrap();
        assert!(matches!(
            DataDir::open(&path, true),
            Err(CoreError::InvalidOperation { .. })
        ));
    }

    #[test]
    fn ident_validation() {
        assert!(validate_ident("collection-7--123").is_ok());
        assert!(validate_ident("index-1.$id_").is_ok());
        assert!(validate_ident("").is_err());
        assert!(validate_ident("..").is_err());
        assert!(validate_ident("a/b").is_err());
        assert!(validate_ident(&"x".repeat(MAX_IDENT_LEN + 1)).is_err());
    }

    #[test]
    fn pool_files_and_staging() {
        let temp = tempdir().unwrap();
        let dir = DataDir::open(temp.path(), true).unwrap();
        fs::write(dir.pool_path("b").unwrap(), b"").unwrap();
        fs::write(dir.pool_path("a").unwrap(), b"").unwrap();
        fs::write(dir.identlist_path(), b"").unwrap();
        fs::write(temp.path().join("c.pool.creating"), b"").unwrap();

        assert_eq!(dir.pool_files().unwrap(), vec!["a".to_string(), "b".to_string()]);
        assert_eq!(dir.clean_staging().unwrap(), 1);
        assert_eq!(dir.clean_staging().unwrap(), 0);
    }

    #[test]
    fn pool_file_is_named_after_ident() {
        let temp = tempdir().unwrap();
        let dir = DataDir::open(temp.path(), true).unwrap();
        assert_eq!(dir.pool_path("coll-1").unwrap(), temp.path().join("coll-1.pool"));

        // Files without the extension are never taken for pools.
        fs::write(temp.path().join("coll-2"), b"").unwrap();
        fs::write(temp.path().join("notes.txt"), b"").unwrap();
        fs::write(dir.pool_path("coll-1").unwrap(), b"").unwrap();
        assert_eq!(dir.pool_files().unwrap(), vec!["coll-1".to_string()]);
    }

    #[test]
    fn remove_pool_is_idempotent() {
        let temp = tempdir().unwrap();
        let dir = DataDir::open(temp.path(), true).unwrap();
        let path = dir.pool_path("a").unwrap();
        fs::write(&path, b"").unwrap();

        dir.remove_pool("a").unwrap();
        assert!(!path.exists());
        dir.remove_pool("a").unwrap();
    }
}
