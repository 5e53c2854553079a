//! Run progress that can be polled while a run is in flight
//!
//! The state exists only between `start_run` and `finish_run`; it is never
//! persisted. Estimated completion is
//! `items_remaining * avg_time_per_item + chunks_remaining * chunk_delay`,
//! where the per-item average leaves out time spent waiting between chunks.

use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;

/// Mutable progress of the current run
#[derive(Debug, Clone)]
struct ProgressState {
    current_progress: usize,
    total_items: usize,
    current_chunk: usize,
    total_chunks: usize,
    start_time: Instant,
    chunk_delay: Duration,
    waited: Duration,
    chunk_ended_at: Option<Instant>,
}

impl ProgressState {
    fn percentage(&self) -> f64 {
        if self.total_items == 0 {
            return 100.0;
        }
        (self.current_progress as f64 / self.total_items as f64) * 100.0
    }

    /// Elapsed time minus inter-chunk waits, including one still in progress
    fn working_time(&self, now: Instant) -> Duration {
        let pending_wait = self
            .chunk_ended_at
            .map(|ended| now.saturating_duration_since(ended))
            .unwrap_or_default();
        now.saturating_duration_since(self.start_time)
            .saturating_sub(self.waited + pending_wait)
    }

    fn estimate_remaining(&self, now: Instant) -> Option<Duration> {
        if self.current_progress == 0 {
            return None;
        }
        let avg = self.working_time(now).as_secs_f64() / self.current_progress as f64;
        let items_left = self.total_items.saturating_sub(self.current_progress) as f64;
        let chunks_left = self.total_chunks.saturating_sub(self.current_chunk) as f64;
        let secs = items_left * avg + chunks_left * self.chunk_delay.as_secs_f64();
        Duration::try_from_secs_f64(secs).ok()
    }
}

/// Point-in-time copy of run progress
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressSnapshot {
    /// Whether a run is executing
    pub running: bool,
    /// Items in a terminal state
    pub current_progress: usize,
    /// Items in the run
    pub total_items: usize,
    /// One-based index of the chunk being processed
    pub current_chunk: usize,
    /// Chunks in the run
    pub total_chunks: usize,
    /// Completion percentage (0-100)
    pub percentage: f64,
    /// Time since the run started
    pub elapsed: Duration,
    /// Estimated time to completion
    pub estimated_remaining: Option<Duration>,
}

impl ProgressSnapshot {
    fn idle() -> Self {
        Self {
            running: false,
            current_progress: 0,
            total_items: 0,
            current_chunk: 0,
            total_chunks: 0,
            percentage: 0.0,
            elapsed: Duration::ZERO,
            estimated_remaining: None,
        }
    }

    /// Human-readable progress line
    pub fn format_progress(&self) -> String {
        if !self.running {
            return "[PROGRESS] idle".to_string();
        }

        let mut parts = vec![format!(
            "[PROGRESS] {}/{} items - {:.1}% complete (chunk {}/{})",
            self.current_progress,
            self.total_items,
            self.percentage,
            self.current_chunk,
            self.total_chunks
        )];
        if let Some(remaining) = self.estimated_remaining {
            parts.push(format!("- ~{} remaining", format_duration(remaining)));
        }
        parts.join(" ")
    }
}

/// Shared progress counters
///
/// Cloning yields another handle to the same counters, so the engine and any
/// number of pollers can hold one.
#[derive(Debug, Clone, Default)]
pub struct ProgressReporter {
    state: Arc<Mutex<Option<ProgressState>>>,
}

impl ProgressReporter {
    /// Reporter with no run in progress
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Option<ProgressState>> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Begin tracking a run
    pub fn start_run(&self, total_items: usize, total_chunks: usize, chunk_delay: Duration) {
        *self.lock() = Some(ProgressState {
            current_progress: 0,
            total_items,
            current_chunk: 0,
            total_chunks,
            start_time: Instant::now(),
            chunk_delay,
            waited: Duration::ZERO,
            chunk_ended_at: None,
        });
    }

    /// Mark chunk `index` (zero-based) as started
    pub fn start_chunk(&self, index: usize) {
        if let Some(state) = self.lock().as_mut() {
            state.current_chunk = index + 1;
            if let Some(ended) = state.chunk_ended_at.take() {
                state.waited += ended.elapsed();
            }
        }
    }

    /// Mark the current chunk as done; time until the next `start_chunk` is
    /// inter-chunk waiting
    pub fn finish_chunk(&self) {
        if let Some(state) = self.lock().as_mut() {
            state.chunk_ended_at = Some(Instant::now());
        }
    }

    /// Count one item reaching a terminal state
    pub fn item_finished(&self) {
        if let Some(state) = self.lock().as_mut() {
            state.current_progress = (state.current_progress + 1).min(state.total_items);
        }
    }

    /// Discard the run state
    pub fn finish_run(&self) {
        *self.lock() = None;
    }

    /// Current progress
    pub fn snapshot(&self) -> ProgressSnapshot {
        let guard = self.lock();
        let Some(state) = guard.as_ref() else {
            return ProgressSnapshot::idle();
        };
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(state.start_time);
        ProgressSnapshot {
            running: true,
            current_progress: state.current_progress,
            total_items: state.total_items,
            current_chunk: state.current_chunk,
            total_chunks: state.total_chunks,
            percentage: state.percentage(),
            elapsed,
            estimated_remaining: state.estimate_remaining(now),
        }
    }
}

/// Compact duration for progress lines ("45s", "12m", "1.5h")
pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    if secs < 60 {
        format!("{secs}s")
    } else if secs < 3600 {
        format!("{}m", secs / 60)
    } else {
        format!("{:.1}h", secs as f64 / 3600.0)
    }
}
