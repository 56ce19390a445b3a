//! Listing Store over the shared directory.
//!
//! The listing is recomputed from the filesystem on every call and never
//! cached, so it always matches the directory at read time. That makes each
//! connect and each broadcast O(directory size), which is fine for a folder
//! shared by hand on a local network.

use crate::error::{Result, ShareError};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Read-only view of the shared directory
#[async_trait]
pub trait SharedDirectory: Send + Sync {
    /// Names of the files currently present, sorted
    async fn list_names(&self) -> Result<Vec<String>>;

    /// Full contents of the named file
    ///
    /// Fails with a not-found error (see [`ShareError::is_not_found`]) when the
    /// name does not resolve to a file inside the directory.
    async fn read(&self, name: &str) -> Result<Vec<u8>>;
}

/// Check that `name` is a plain file name with no path components
pub fn validate_name(name: &str) -> Result<&str> {
    let invalid = name.is_empty()
        || name == "."
        || name == ".."
        || name.contains(['/', '\\', '\0']);

    if invalid {
        return Err(ShareError::InvalidName(name.to_string()));
    }
    Ok(name)
}

/// Shared directory backed by a folder on the local filesystem
#[derive(Debug, Clone)]
pub struct FsDirectory {
    root: PathBuf,
    max_file_size: u64,
}

impl FsDirectory {
    /// Open (creating if needed) the shared folder at `root`
    ///
    /// # Errors
    ///
    /// Returns an error if the folder cannot be created.
    pub fn open(root: impl Into<PathBuf>, max_file_size: u64) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            max_file_size,
        })
    }

    /// Folder being shared
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Copy `source` into the folder under its own file name
    ///
    /// Returns the stored name. An existing file with the same name is
    /// overwritten.
    ///
    /// # Errors
    ///
    /// Returns an error if `source` has no usable file name or the copy fails.
    pub async fn import(&self, source: &Path) -> Result<String> {
        let name = source
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| ShareError::InvalidName(source.display().to_string()))?;
        let name = validate_name(name)?.to_string();

        tokio::fs::copy(source, self.root.join(&name)).await?;
        Ok(name)
    }

    fn resolve(&self, name: &str) -> Result<PathBuf> {
        Ok(self.root.join(validate_name(name)?))
    }
}

#[async_trait]
impl SharedDirectory for FsDirectory {
    async fn list_names(&self) -> Result<Vec<String>> {
        let mut entries = tokio::fs::read_dir(&self.root).await?;
        let mut names = Vec::new();

        while let Some(entry) = entries.next_entry().await? {
            // Follows symlinks, like read() does
            let is_file = match tokio::fs::metadata(entry.path()).await {
                Ok(meta) => meta.is_file(),
                Err(_) => false,
            };
            if !is_file {
                continue;
            }

            match entry.file_name().into_string() {
                Ok(name) => names.push(name),
                Err(raw) => debug!("Skipping non UTF-8 file name {:?}", raw),
            }
        }

        names.sort();
        Ok(names)
    }

    async fn read(&self, name: &str) -> Result<Vec<u8>> {
        let path = self.resolve(name)?;

        let meta = match tokio::fs::metadata(&path).await {
            Ok(meta) if meta.is_file() => meta,
            Ok(_) => return Err(ShareError::NotFound(name.to_string())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ShareError::NotFound(name.to_string()));
            }
            Err(e) => return Err(e.into()),
        };

        if meta.len() > self.max_file_size {
            return Err(ShareError::FileTooLarge {
                name: name.to_string(),
                size: meta.len(),
                limit: self.max_file_size,
            });
        }

        Ok(tokio::fs::read(&path).await?)
    }
}
