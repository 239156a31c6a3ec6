//! Content-addressed disk storage.
//!
//! Each cached body is written to `<root>/<sha256-hex>` as raw bytes with no
//! header. Writes go through a temporary file and a rename so a reader never
//! sees a partially written body under its final name.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use tracing::info;

use crate::error::{Result, StorageError};

/// Directory of content files named by their SHA-256 hex digest.
#[derive(Debug, Clone)]
pub struct DiskStore {
    root: PathBuf,
}

impl DiskStore {
    /// Opens a store rooted at `root`, creating the directory if needed.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        if root.as_os_str().is_empty() {
            return Err(StorageError::Config("cache disk path is empty".into()));
        }

        fs::create_dir_all(&root)?;
        info!("Opening content store at: {:?}", root);

        Ok(Self { root })
    }

    /// Root directory of the store.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of the file holding content with the given hash.
    pub fn path_for(&self, content_hash: &str) -> PathBuf {
        self.root.join(content_hash)
    }

    /// Returns true if content with this hash is on disk.
    pub fn contains(&self, content_hash: &str) -> bool {
        self.path_for(content_hash).is_file()
    }

    /// Writes `content` under `content_hash`.
    ///
    /// Identical content always maps to the same file, so an existing file is
    /// left in place.
    pub fn write(&self, content_hash: &str, content: &[u8]) -> Result<()> {
        let target = self.path_for(content_hash);
        if target.is_file() {
            return Ok(());
        }

        let staging = self.root.join(format!(".{}.tmp", content_hash));
        {
            let mut file = fs::File::create(&staging)?;
            file.write_all(content)?;
            file.sync_data()?;
        }

        if let Err(e) = fs::rename(&staging, &target) {
            let _ = fs::remove_file(&staging);
            return Err(e.into());
        }

        Ok(())
    }

    /// Reads content back by hash.
    pub fn read(&self, content_hash: &str) -> Result<Bytes> {
        Ok(Bytes::from(fs::read(self.path_for(content_hash))?))
    }
}
