//! Upload directory on the local filesystem

use super::FileStore;
use async_trait::async_trait;
use std::io;
use std::path::{Path, PathBuf};
use tracing::debug;

/// File store rooted at an upload directory
///
/// Item ids are plain file names inside the root.
#[derive(Debug, Clone)]
pub struct LocalFileStore {
    root: PathBuf,
}

impl LocalFileStore {
    /// Create a store over `root`
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        Self { root: root.into() }
    }

    /// Upload directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve an item id to its path, rejecting anything but a plain file name
    pub fn resolve(&self, item_id: &str) -> io::Result<PathBuf> {
        let is_plain = !item_id.is_empty()
            && item_id != "."
            && item_id != ".."
            && !item_id.contains(['/', '\\', '\0']);
        if !is_plain {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid item id: {item_id:?}"),
            ));
        }
        Ok(self.root.join(item_id))
    }

    /// File names in the upload directory, sorted
    pub async fn list(&self) -> io::Result<Vec<String>> {
        let mut entries = tokio::fs::read_dir(&self.root).await?;
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_file() {
                if let Some(name) = entry.file_name().to_str() {
                    if !name.starts_with('.') {
                        names.push(name.to_string());
                    }
                }
            }
        }
        names.sort();
        Ok(names)
    }
}

#[async_trait]
impl FileStore for LocalFileStore {
    async fn read(&self, item_id: &str) -> io::Result<Vec<u8>> {
        let path = self.resolve(item_id)?;
        tokio::fs::read(&path).await
    }

    async fn delete(&self, item_id: &str) -> io::Result<()> {
        let path = self.resolve(item_id)?;
        tokio::fs::remove_file(&path).await?;
        debug!(path = %path.display(), "Deleted item file");
        Ok(())
    }
}
