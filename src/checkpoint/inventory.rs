//! Listing, summarizing and pruning the files of a checkpoint store
//!
//! Age is judged by file modification time, so an entry rewritten by a later
//! run counts as fresh again.

use super::store::{FileCheckpointStore, BATCHES_DIR};
use super::{BatchManifest, CheckpointEntry, CheckpointError, MAX_ENTRY_FILE_SIZE};
use crate::Stage;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// What a checkpoint file holds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckpointKind {
    /// Extraction stage entry
    Extraction,
    /// Structuring stage entry
    Structuring,
    /// Batch manifest
    Batch,
}

impl CheckpointKind {
    const ALL: [CheckpointKind; 3] = [
        CheckpointKind::Extraction,
        CheckpointKind::Structuring,
        CheckpointKind::Batch,
    ];

    /// Directory name under the store root
    pub fn dir_name(self) -> &'static str {
        match self {
            CheckpointKind::Extraction => Stage::Extraction.as_str(),
            CheckpointKind::Structuring => Stage::Structuring.as_str(),
            CheckpointKind::Batch => BATCHES_DIR,
        }
    }
}

impl std::fmt::Display for CheckpointKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.dir_name())
    }
}

/// One file in the store
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CheckpointFile {
    /// Entry kind
    pub kind: CheckpointKind,
    /// Item id (entries) or batch id (manifests); `None` when the file is unreadable
    pub key: Option<String>,
    /// Stage outcome for entries
    #[serde(skip_serializing_if = "Option::is_none")]
    pub success: Option<bool>,
    /// File location
    pub path: PathBuf,
    /// File size
    pub size_bytes: u64,
    /// Last modification time
    pub modified: DateTime<Utc>,
}

/// Counts and sizes per kind
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CheckpointSummary {
    /// Store root
    pub root: PathBuf,
    /// All checkpoint files
    pub total_files: usize,
    /// Extraction entries
    pub extraction_files: usize,
    /// Structuring entries
    pub structuring_files: usize,
    /// Batch manifests
    pub batch_files: usize,
    /// Entries recording a failed stage
    pub failed_entries: usize,
    /// Files that could not be parsed
    pub unreadable_files: usize,
    /// Combined size of all files
    pub total_size_bytes: u64,
    /// Combined size in MB, two decimals
    pub total_size_mb: f64,
}

/// Outcome of [`FileCheckpointStore::prune_older_than`]
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PruneReport {
    /// Files removed
    pub removed: usize,
    /// Bytes freed
    pub freed_bytes: u64,
    /// Files that were due but could not be removed
    pub failed: usize,
}

impl FileCheckpointStore {
    /// Every checkpoint file, newest first
    pub fn list(&self) -> Result<Vec<CheckpointFile>, CheckpointError> {
        let mut files = self.with_read_lock(|| {
            let mut files = Vec::new();
            for kind in CheckpointKind::ALL {
                scan_dir(&self.root().join(kind.dir_name()), kind, &mut files)?;
            }
            Ok(files)
        })?;
        files.sort_by(|a, b| b.modified.cmp(&a.modified).then_with(|| a.path.cmp(&b.path)));
        Ok(files)
    }

    /// Counts by kind and total size
    pub fn summary(&self) -> Result<CheckpointSummary, CheckpointError> {
        let files = self.list()?;
        let count = |kind: CheckpointKind| files.iter().filter(|f| f.kind == kind).count();
        let total_size_bytes = files.iter().map(|f| f.size_bytes).sum::<u64>();

        Ok(CheckpointSummary {
            root: self.root().to_path_buf(),
            total_files: files.len(),
            extraction_files: count(CheckpointKind::Extraction),
            structuring_files: count(CheckpointKind::Structuring),
            batch_files: count(CheckpointKind::Batch),
            failed_entries: files.iter().filter(|f| f.success == Some(false)).count(),
            unreadable_files: files.iter().filter(|f| f.key.is_none()).count(),
            total_size_bytes,
            total_size_mb: (total_size_bytes as f64 / (1024.0 * 1024.0) * 100.0).round() / 100.0,
        })
    }

    /// Remove checkpoint files not modified within `max_age`
    pub fn prune_older_than(&self, max_age: ChronoDuration) -> Result<PruneReport, CheckpointError> {
        self.prune_older_than_at(Utc::now(), max_age)
    }

    /// Remove checkpoint files last modified before `now - max_age`
    pub fn prune_older_than_at(
        &self,
        now: DateTime<Utc>,
        max_age: ChronoDuration,
    ) -> Result<PruneReport, CheckpointError> {
        let cutoff = now - max_age;
        let due: Vec<CheckpointFile> = self
            .list()?
            .into_iter()
            .filter(|file| file.modified < cutoff)
            .collect();

        let report = self.with_write_lock(|| {
            let mut report = PruneReport::default();
            for file in &due {
                match std::fs::remove_file(&file.path) {
                    Ok(()) => {
                        report.removed += 1;
                        report.freed_bytes += file.size_bytes;
                        info!(
                            kind = %file.kind,
                            key = file.key.as_deref().unwrap_or("<unreadable>"),
                            "Pruned checkpoint"
                        );
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => {
                        report.failed += 1;
                        warn!(path = %file.path.display(), error = %e, "Failed to prune checkpoint");
                    }
                }
            }
            Ok(report)
        })?;

        info!(
            removed = report.removed,
            freed_bytes = report.freed_bytes,
            failed = report.failed,
            max_age_hours = max_age.num_hours(),
            "Checkpoint pruning finished"
        );
        Ok(report)
    }
}

fn scan_dir(
    dir: &Path,
    kind: CheckpointKind,
    files: &mut Vec<CheckpointFile>,
) -> Result<(), CheckpointError> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(CheckpointError::IoError(e.to_string())),
    };

    for entry in entries {
        let entry = entry.map_err(|e| CheckpointError::IoError(e.to_string()))?;
        let path = entry.path();
        if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
            continue;
        }
        let metadata = match entry.metadata() {
            Ok(metadata) if metadata.is_file() => metadata,
            Ok(_) => continue,
            // Removed between read_dir and stat
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => return Err(CheckpointError::IoError(e.to_string())),
        };
        let modified = metadata
            .modified()
            .map(DateTime::<Utc>::from)
            .map_err(|e| CheckpointError::IoError(e.to_string()))?;
        let (key, success) = describe(&path, kind, metadata.len());

        files.push(CheckpointFile {
            kind,
            key,
            success,
            path,
            size_bytes: metadata.len(),
            modified,
        });
    }
    Ok(())
}

fn describe(path: &Path, kind: CheckpointKind, size: u64) -> (Option<String>, Option<bool>) {
    let bytes = (size <= MAX_ENTRY_FILE_SIZE)
        .then(|| std::fs::read(path).ok())
        .flatten();
    let parsed = bytes.and_then(|bytes| match kind {
        CheckpointKind::Batch => serde_json::from_slice::<BatchManifest>(&bytes)
            .ok()
            .map(|manifest| (manifest.batch_id().to_string(), None)),
        CheckpointKind::Extraction | CheckpointKind::Structuring => {
            serde_json::from_slice::<CheckpointEntry>(&bytes)
                .ok()
                .map(|entry| (entry.item_id().to_string(), Some(entry.is_success())))
        }
    });

    match parsed {
        Some((key, success)) => (Some(key), success),
        None => {
            warn!(path = %path.display(), "Unreadable checkpoint file");
            (None, None)
        }
    }
}
