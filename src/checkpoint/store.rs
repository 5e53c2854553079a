//! Checkpoint store trait and its file-backed implementation
//!
//! Layout under the store root:
//!
//! ```text
//! <root>/extraction/<encoded item id>.json
//! <root>/structuring/<encoded item id>.json
//! <root>/batches/<encoded batch id>.json
//! <root>/.checkpoints.lock
//! ```
//!
//! Item ids whose escaped form is too long for a file name are stored under
//! `~<sha256 of the id>.json`.
//!
//! Writes go through a temp file in the target directory and an atomic rename,
//! so readers never observe a partially written entry.

use super::{BatchManifest, CheckpointEntry, CheckpointError, MAX_ENTRY_FILE_SIZE};
use crate::Stage;
use fd_lock::RwLock;
use sha2::{Digest, Sha256};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

const LOCK_FILE_NAME: &str = ".checkpoints.lock";
pub(super) const BATCHES_DIR: &str = "batches";
/// Leaves room for the `.json` suffix within common 255-byte name limits
const MAX_ENCODED_KEY_LEN: usize = 240;
/// Marks a hashed stem; `~` never survives escaping, so it cannot clash
const HASHED_KEY_PREFIX: char = '~';

/// Durable key-value storage of stage results
///
/// Entries are addressed by the exact `(item_id, stage)` pair. A `get` after a
/// `put` for the same key returns the stored entry, including after a restart.
pub trait CheckpointStore: Send + Sync {
    /// Verify the storage can be read and written
    fn ensure_available(&self) -> Result<(), CheckpointError>;

    /// Write or overwrite the entry for its `(item_id, stage)` key
    fn put(&self, entry: &CheckpointEntry) -> Result<(), CheckpointError>;

    /// Latest entry for the key, if any
    fn get(&self, item_id: &str, stage: Stage) -> Result<Option<CheckpointEntry>, CheckpointError>;

    /// Remove the entry for the key. Returns whether an entry existed.
    fn delete(&self, item_id: &str, stage: Stage) -> Result<bool, CheckpointError>;

    /// Persist a batch manifest
    fn put_manifest(&self, manifest: &BatchManifest) -> Result<(), CheckpointError>;

    /// Load a batch manifest by id
    fn get_manifest(&self, batch_id: &str) -> Result<Option<BatchManifest>, CheckpointError>;
}

/// File-per-key checkpoint store
#[derive(Debug, Clone)]
pub struct FileCheckpointStore {
    root: PathBuf,
}

impl FileCheckpointStore {
    /// Open (creating if needed) a store rooted at `root`
    pub fn open<P: Into<PathBuf>>(root: P) -> Result<Self, CheckpointError> {
        let root = root.into();
        for dir in [
            root.join(Stage::Extraction.as_str()),
            root.join(Stage::Structuring.as_str()),
            root.join(BATCHES_DIR),
        ] {
            std::fs::create_dir_all(&dir).map_err(|e| {
                CheckpointError::Unavailable(format!("cannot create {}: {e}", dir.display()))
            })?;
        }
        debug!(root = %root.display(), "Opened checkpoint store");
        Ok(Self { root })
    }

    /// Store root directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn entry_path(&self, item_id: &str, stage: Stage) -> Result<PathBuf, CheckpointError> {
        let key = encode_key(item_id)?;
        Ok(self.root.join(stage.as_str()).join(format!("{key}.json")))
    }

    fn manifest_path(&self, batch_id: &str) -> Result<PathBuf, CheckpointError> {
        let key = encode_key(batch_id)?;
        Ok(self.root.join(BATCHES_DIR).join(format!("{key}.json")))
    }

    fn open_lock_file(&self) -> Result<File, CheckpointError> {
        OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(self.root.join(LOCK_FILE_NAME))
            .map_err(|e| CheckpointError::LockError(format!("Failed to open lock file: {e}")))
    }

    pub(super) fn with_write_lock<T>(
        &self,
        f: impl FnOnce() -> Result<T, CheckpointError>,
    ) -> Result<T, CheckpointError> {
        let mut lock = RwLock::new(self.open_lock_file()?);
        let _guard = lock
            .write()
            .map_err(|e| CheckpointError::LockError(format!("Failed to acquire write lock: {e}")))?;
        f()
    }

    pub(super) fn with_read_lock<T>(
        &self,
        f: impl FnOnce() -> Result<T, CheckpointError>,
    ) -> Result<T, CheckpointError> {
        let lock = RwLock::new(self.open_lock_file()?);
        let _guard = lock
            .read()
            .map_err(|e| CheckpointError::LockError(format!("Failed to acquire read lock: {e}")))?;
        f()
    }
}

impl CheckpointStore for FileCheckpointStore {
    fn ensure_available(&self) -> Result<(), CheckpointError> {
        if !self.root.is_dir() {
            return Err(CheckpointError::Unavailable(format!(
                "{} is not a directory",
                self.root.display()
            )));
        }
        let probe = tempfile::NamedTempFile::new_in(&self.root).map_err(|e| {
            CheckpointError::Unavailable(format!("{} is not writable: {e}", self.root.display()))
        })?;
        drop(probe);
        self.open_lock_file().map(|_| ())
    }

    fn put(&self, entry: &CheckpointEntry) -> Result<(), CheckpointError> {
        let path = self.entry_path(entry.item_id(), entry.stage())?;
        let json = serde_json::to_vec_pretty(entry)
            .map_err(|e| CheckpointError::SerializationError(e.to_string()))?;

        self.with_write_lock(|| {
            persist_atomically(&path, &json).map_err(|e| CheckpointError::IoError(e.to_string()))
        })?;

        debug!(
            item_id = entry.item_id(),
            stage = %entry.stage(),
            success = entry.is_success(),
            "Checkpoint written"
        );
        Ok(())
    }

    fn get(&self, item_id: &str, stage: Stage) -> Result<Option<CheckpointEntry>, CheckpointError> {
        let path = self.entry_path(item_id, stage)?;
        let entry: Option<CheckpointEntry> = self.with_read_lock(|| read_json(&path))?;

        match entry {
            Some(entry) => {
                entry.validate_schema_version()?;
                // Guards against a file that was copied or renamed by hand.
                if entry.item_id() != item_id || entry.stage() != stage {
                    warn!(
                        path = %path.display(),
                        stored_item = entry.item_id(),
                        requested_item = item_id,
                        "Checkpoint key mismatch, ignoring entry"
                    );
                    return Ok(None);
                }
                Ok(Some(entry))
            }
            None => Ok(None),
        }
    }

    fn delete(&self, item_id: &str, stage: Stage) -> Result<bool, CheckpointError> {
        let path = self.entry_path(item_id, stage)?;
        let removed = self.with_write_lock(|| match std::fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(CheckpointError::IoError(e.to_string())),
        })?;

        if removed {
            info!(item_id = item_id, stage = %stage, "Checkpoint invalidated");
        }
        Ok(removed)
    }

    fn put_manifest(&self, manifest: &BatchManifest) -> Result<(), CheckpointError> {
        let path = self.manifest_path(manifest.batch_id())?;
        let json = serde_json::to_vec_pretty(manifest)
            .map_err(|e| CheckpointError::SerializationError(e.to_string()))?;

        self.with_write_lock(|| {
            persist_atomically(&path, &json).map_err(|e| CheckpointError::IoError(e.to_string()))
        })?;

        info!(
            batch_id = manifest.batch_id(),
            items = manifest.item_ids().len(),
            "Batch manifest saved"
        );
        Ok(())
    }

    fn get_manifest(&self, batch_id: &str) -> Result<Option<BatchManifest>, CheckpointError> {
        let path = self.manifest_path(batch_id)?;
        let manifest: Option<BatchManifest> = self.with_read_lock(|| read_json(&path))?;
        if let Some(manifest) = &manifest {
            manifest.validate_schema_version()?;
        }
        Ok(manifest)
    }
}

/// Map a key to a file stem, escaping every byte outside `[A-Za-z0-9._-]` as `%XX`.
///
/// Escaped stems longer than the file name limit are replaced by `~` plus the
/// SHA-256 of the key. Escaped stems are injective; hashed ones rely on the
/// item id stored in the entry, which `get` compares against the requested key.
pub fn encode_key(key: &str) -> Result<String, CheckpointError> {
    if key.is_empty() {
        return Err(CheckpointError::InvalidKey("key cannot be empty".to_string()));
    }

    let mut encoded = String::with_capacity(key.len());
    for byte in key.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'.' | b'_' | b'-' => {
                encoded.push(byte as char)
            }
            _ => encoded.push_str(&format!("%{byte:02X}")),
        }
    }

    if encoded.len() > MAX_ENCODED_KEY_LEN {
        let digest = Sha256::digest(key.as_bytes());
        return Ok(format!("{HASHED_KEY_PREFIX}{digest:x}"));
    }
    Ok(encoded)
}

/// Write `contents` to `path` through a synced temp file and an atomic rename.
pub(crate) fn persist_atomically(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let parent_dir = path.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(parent_dir)?;

    let mut temp_file = tempfile::NamedTempFile::new_in(parent_dir)?;
    temp_file.write_all(contents)?;
    temp_file.flush()?;
    temp_file.as_file().sync_all()?;
    temp_file.persist(path).map_err(|e| e.error)?;

    if let Ok(dir) = File::open(parent_dir) {
        let _ = dir.sync_all();
    }
    Ok(())
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Option<T>, CheckpointError> {
    let metadata = match std::fs::metadata(path) {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(CheckpointError::IoError(e.to_string())),
    };
    if metadata.len() > MAX_ENTRY_FILE_SIZE {
        return Err(CheckpointError::EntryTooLarge {
            size: metadata.len(),
            max: MAX_ENTRY_FILE_SIZE,
        });
    }

    let contents = match std::fs::read(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(CheckpointError::IoError(e.to_string())),
    };
    serde_json::from_slice(&contents)
        .map(Some)
        .map_err(|e| CheckpointError::DeserializationError(e.to_string()))
}
