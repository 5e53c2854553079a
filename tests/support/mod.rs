//! Shared in-memory collaborators for pipeline tests
//!
//! Item bytes are the item id itself, so the extraction mock knows which item
//! it is looking at. Call logs use `tokio::time::Instant` and are meant to be
//! read under paused time.

#![allow(dead_code)]

use async_trait::async_trait;
use receipt_batch::checkpoint::{BatchManifest, CheckpointEntry, CheckpointError, CheckpointStore};
use receipt_batch::output::{Exporter, OutputError, OutputResult};
use receipt_batch::pipeline::{Pipeline, PipelineConfig, Services};
use receipt_batch::quota::{QuotaLimits, QuotaTracker};
use receipt_batch::services::{ExtractionService, FileStore, ServiceError, StructuringService};
use receipt_batch::{ExtractedText, Stage, StructuredRecord, StructuringHints};
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

/// Item ids `receipt_001.jpg`, `receipt_002.jpg`, ...
pub fn item_ids(count: usize) -> Vec<String> {
    (1..=count).map(|i| format!("receipt_{i:03}.jpg")).collect()
}

/// Start time of every call, per item
#[derive(Default)]
struct CallLog {
    calls: Mutex<Vec<(String, Instant)>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl CallLog {
    fn enter(&self, item_id: &str) {
        self.calls
            .lock()
            .unwrap()
            .push((item_id.to_string(), Instant::now()));
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
    }

    fn exit(&self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }

    fn all(&self) -> Vec<(String, Instant)> {
        self.calls.lock().unwrap().clone()
    }

    fn starts_for(&self, item_id: &str) -> Vec<Instant> {
        self.all()
            .into_iter()
            .filter(|(id, _)| id == item_id)
            .map(|(_, at)| at)
            .collect()
    }
}

/// Scripted failures: queued errors are returned first, then the permanent one
#[derive(Default)]
struct Script {
    queued: Mutex<HashMap<String, VecDeque<ServiceError>>>,
    permanent: Mutex<HashMap<String, ServiceError>>,
}

impl Script {
    fn next_error(&self, item_id: &str) -> Option<ServiceError> {
        if let Some(err) = self
            .queued
            .lock()
            .unwrap()
            .get_mut(item_id)
            .and_then(VecDeque::pop_front)
        {
            return Some(err);
        }
        self.permanent.lock().unwrap().get(item_id).cloned()
    }
}

/// Extraction service double
#[derive(Default)]
pub struct MockExtraction {
    latency: Duration,
    script: Script,
    log: CallLog,
}

impl MockExtraction {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_latency(latency: Duration) -> Self {
        Self {
            latency,
            ..Self::default()
        }
    }

    /// Fail the next calls for `item_id` with `errors`, in order
    pub fn fail_first(&self, item_id: &str, errors: Vec<ServiceError>) {
        self.script
            .queued
            .lock()
            .unwrap()
            .insert(item_id.to_string(), errors.into());
    }

    /// Fail every call for `item_id`
    pub fn fail_always(&self, item_id: &str, error: ServiceError) {
        self.script
            .permanent
            .lock()
            .unwrap()
            .insert(item_id.to_string(), error);
    }

    pub fn call_count(&self) -> usize {
        self.log.all().len()
    }

    pub fn calls(&self) -> Vec<(String, Instant)> {
        self.log.all()
    }

    pub fn call_starts(&self, item_id: &str) -> Vec<Instant> {
        self.log.starts_for(item_id)
    }

    pub fn max_in_flight(&self) -> usize {
        self.log.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ExtractionService for MockExtraction {
    async fn extract_text(&self, image: &[u8]) -> Result<ExtractedText, ServiceError> {
        let item_id = String::from_utf8_lossy(image).to_string();
        self.log.enter(&item_id);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        self.log.exit();

        if let Some(err) = self.script.next_error(&item_id) {
            return Err(err);
        }
        Ok(ExtractedText {
            text: format!("ACME STORE\nTOTAL 1200\n{item_id}"),
            confidence: 0.9,
            words: Vec::new(),
        })
    }
}

/// Structuring service double
#[derive(Default)]
pub struct MockStructuring {
    latency: Duration,
    script: Script,
    log: CallLog,
}

impl MockStructuring {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_latency(latency: Duration) -> Self {
        Self {
            latency,
            ..Self::default()
        }
    }

    pub fn fail_first(&self, item_id: &str, errors: Vec<ServiceError>) {
        self.script
            .queued
            .lock()
            .unwrap()
            .insert(item_id.to_string(), errors.into());
    }

    pub fn fail_always(&self, item_id: &str, error: ServiceError) {
        self.script
            .permanent
            .lock()
            .unwrap()
            .insert(item_id.to_string(), error);
    }

    pub fn call_count(&self) -> usize {
        self.log.all().len()
    }

    pub fn call_starts(&self, item_id: &str) -> Vec<Instant> {
        self.log.starts_for(item_id)
    }

    pub fn max_in_flight(&self) -> usize {
        self.log.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StructuringService for MockStructuring {
    async fn structure(
        &self,
        text: &ExtractedText,
        hints: &StructuringHints,
    ) -> Result<serde_json::Value, ServiceError> {
        self.log.enter(&hints.item_id);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        self.log.exit();

        if let Some(err) = self.script.next_error(&hints.item_id) {
            return Err(err);
        }
        Ok(serde_json::json!({
            "source_image": hints.item_id,
            "merchant": "ACME STORE",
            "total": 1200,
            "line_count": text.text.lines().count(),
        }))
    }
}

/// File store holding item bytes in memory
#[derive(Default)]
pub struct MemoryFileStore {
    files: Mutex<HashMap<String, Vec<u8>>>,
    deleted: Mutex<Vec<String>>,
}

impl MemoryFileStore {
    /// Store whose items contain their own id
    pub fn with_items(item_ids: &[String]) -> Self {
        let files = item_ids
            .iter()
            .map(|id| (id.clone(), id.as_bytes().to_vec()))
            .collect();
        Self {
            files: Mutex::new(files),
            deleted: Mutex::new(Vec::new()),
        }
    }

    pub fn contains(&self, item_id: &str) -> bool {
        self.files.lock().unwrap().contains_key(item_id)
    }

    pub fn remove(&self, item_id: &str) {
        self.files.lock().unwrap().remove(item_id);
    }

    pub fn deleted(&self) -> Vec<String> {
        let mut deleted = self.deleted.lock().unwrap().clone();
        deleted.sort();
        deleted
    }
}

#[async_trait]
impl FileStore for MemoryFileStore {
    async fn read(&self, item_id: &str) -> std::io::Result<Vec<u8>> {
        self.files
            .lock()
            .unwrap()
            .get(item_id)
            .cloned()
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotFound, "no such item"))
    }

    async fn delete(&self, item_id: &str) -> std::io::Result<()> {
        match self.files.lock().unwrap().remove(item_id) {
            Some(_) => {
                self.deleted.lock().unwrap().push(item_id.to_string());
                Ok(())
            }
            None => Err(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "no such item",
            )),
        }
    }
}

/// Exporter that keeps what it was given
#[derive(Default)]
pub struct RecordingExporter {
    exports: Mutex<Vec<(String, Vec<StructuredRecord>)>>,
    fail: AtomicBool,
}

impl RecordingExporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        let exporter = Self::default();
        exporter.fail.store(true, Ordering::SeqCst);
        exporter
    }

    pub fn exports(&self) -> Vec<(String, Vec<StructuredRecord>)> {
        self.exports.lock().unwrap().clone()
    }
}

impl Exporter for RecordingExporter {
    fn export(&self, batch_id: &str, records: &[StructuredRecord]) -> OutputResult<Vec<PathBuf>> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(OutputError::IoError("disk full".to_string()));
        }
        self.exports
            .lock()
            .unwrap()
            .push((batch_id.to_string(), records.to_vec()));
        Ok(vec![PathBuf::from(format!("receipts_{batch_id}.csv"))])
    }
}

/// Checkpoint store held in memory
#[derive(Default)]
pub struct MemoryCheckpointStore {
    entries: Mutex<HashMap<(String, Stage), CheckpointEntry>>,
    manifests: Mutex<HashMap<String, BatchManifest>>,
    unavailable: AtomicBool,
    failing_puts: AtomicBool,
    puts: AtomicUsize,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Keep reads and availability checks working but reject every write
    pub fn set_failing_puts(&self, failing: bool) {
        self.failing_puts.store(failing, Ordering::SeqCst);
    }

    pub fn put_count(&self) -> usize {
        self.puts.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    fn check(&self) -> Result<(), CheckpointError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(CheckpointError::Unavailable("store offline".to_string()));
        }
        Ok(())
    }
}

impl CheckpointStore for MemoryCheckpointStore {
    fn ensure_available(&self) -> Result<(), CheckpointError> {
        self.check()
    }

    fn put(&self, entry: &CheckpointEntry) -> Result<(), CheckpointError> {
        self.check()?;
        self.puts.fetch_add(1, Ordering::SeqCst);
        if self.failing_puts.load(Ordering::SeqCst) {
            return Err(CheckpointError::IoError("No space left on device".to_string()));
        }
        self.entries.lock().unwrap().insert(
            (entry.item_id().to_string(), entry.stage()),
            entry.clone(),
        );
        Ok(())
    }

    fn get(&self, item_id: &str, stage: Stage) -> Result<Option<CheckpointEntry>, CheckpointError> {
        self.check()?;
        Ok(self
            .entries
            .lock()
            .unwrap()
            .get(&(item_id.to_string(), stage))
            .cloned())
    }

    fn delete(&self, item_id: &str, stage: Stage) -> Result<bool, CheckpointError> {
        self.check()?;
        Ok(self
            .entries
            .lock()
            .unwrap()
            .remove(&(item_id.to_string(), stage))
            .is_some())
    }

    fn put_manifest(&self, manifest: &BatchManifest) -> Result<(), CheckpointError> {
        self.check()?;
        self.manifests
            .lock()
            .unwrap()
            .insert(manifest.batch_id().to_string(), manifest.clone());
        Ok(())
    }

    fn get_manifest(&self, batch_id: &str) -> Result<Option<BatchManifest>, CheckpointError> {
        self.check()?;
        Ok(self.manifests.lock().unwrap().get(batch_id).cloned())
    }
}

/// Pipeline wired to in-memory collaborators
pub struct Harness {
    pub pipeline: Pipeline,
    pub extraction: Arc<MockExtraction>,
    pub structuring: Arc<MockStructuring>,
    pub files: Arc<MemoryFileStore>,
    pub exporter: Arc<RecordingExporter>,
    pub checkpoints: Arc<dyn CheckpointStore>,
    pub quota: Arc<QuotaTracker>,
}

/// Builder for [`Harness`]
pub struct HarnessBuilder {
    items: Vec<String>,
    extraction: MockExtraction,
    structuring: MockStructuring,
    exporter: RecordingExporter,
    checkpoints: Arc<dyn CheckpointStore>,
}

impl HarnessBuilder {
    pub fn new(items: &[String]) -> Self {
        Self {
            items: items.to_vec(),
            extraction: MockExtraction::new(),
            structuring: MockStructuring::new(),
            exporter: RecordingExporter::new(),
            checkpoints: Arc::new(MemoryCheckpointStore::new()),
        }
    }

    pub fn extraction(mut self, extraction: MockExtraction) -> Self {
        self.extraction = extraction;
        self
    }

    pub fn structuring(mut self, structuring: MockStructuring) -> Self {
        self.structuring = structuring;
        self
    }

    pub fn exporter(mut self, exporter: RecordingExporter) -> Self {
        self.exporter = exporter;
        self
    }

    pub fn checkpoints(mut self, checkpoints: Arc<dyn CheckpointStore>) -> Self {
        self.checkpoints = checkpoints;
        self
    }

    pub fn build(self) -> Harness {
        let extraction = Arc::new(self.extraction);
        let structuring = Arc::new(self.structuring);
        let files = Arc::new(MemoryFileStore::with_items(&self.items));
        let exporter = Arc::new(self.exporter);
        let quota = Arc::new(QuotaTracker::in_memory(QuotaLimits::default()));

        let services = Services {
            extraction: extraction.clone(),
            structuring: structuring.clone(),
            files: files.clone(),
            exporter: exporter.clone(),
        };
        let pipeline = Pipeline::new(services, self.checkpoints.clone(), quota.clone());

        Harness {
            pipeline,
            extraction,
            structuring,
            files,
            exporter,
            checkpoints: self.checkpoints,
            quota,
        }
    }
}

impl Harness {
    /// Harness with default mocks over `items`
    pub fn new(items: &[String]) -> Self {
        HarnessBuilder::new(items).build()
    }
}

/// Default configuration with pacing and chunk delays switched off
pub fn unpaced_config() -> PipelineConfig {
    let mut config = PipelineConfig::default();
    config.pacing_secs.extraction = 0.0;
    config.pacing_secs.structuring = 0.0;
    config.chunk_delay.min_secs = 0.0;
    config.chunk_delay.max_secs = 0.0;
    config.chunk_delay.safety_margin_secs = 0.0;
    config
}
