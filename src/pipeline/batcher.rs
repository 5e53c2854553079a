//! Chunk planning and sequencing

use crate::cancel::CancelSignal;
use std::future::Future;
use std::time::Duration;
use tracing::{info, info_span, Instrument};

/// An ordered slice of the submitted items
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk<T> {
    /// Zero-based chunk index
    pub index: usize,
    /// Items in submission order
    pub items: Vec<T>,
}

/// Partitions items into fixed-size chunks and runs them one after another
#[derive(Debug, Clone, Copy)]
pub struct Batcher {
    chunk_size: usize,
}

impl Batcher {
    /// Create a batcher. A zero chunk size is treated as one.
    pub fn new(chunk_size: usize) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
        }
    }

    /// Items per chunk
    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Number of chunks for `item_count` items
    pub fn chunk_count(&self, item_count: usize) -> usize {
        item_count.div_ceil(self.chunk_size)
    }

    /// Split `items` into `ceil(len / chunk_size)` chunks preserving order
    pub fn partition<T: Clone>(&self, items: &[T]) -> Vec<Chunk<T>> {
        items
            .chunks(self.chunk_size)
            .enumerate()
            .map(|(index, items)| Chunk {
                index,
                items: items.to_vec(),
            })
            .collect()
    }

    /// Run every chunk in order and collect the per-item results.
    ///
    /// `run_chunk` must resolve only once every item of its chunk reached a
    /// terminal state. Between chunks the batcher waits `delay_after(len)` of
    /// the chunk just finished; no delay follows the last chunk. After
    /// cancellation the remaining chunks still run (so each item gets an
    /// outcome) but the delays are skipped.
    pub async fn run<T, R, F, Fut>(
        &self,
        items: &[T],
        cancel: &CancelSignal,
        delay_after: impl Fn(usize) -> Duration,
        mut run_chunk: F,
    ) -> Vec<R>
    where
        T: Clone,
        F: FnMut(Chunk<T>) -> Fut,
        Fut: Future<Output = Vec<R>>,
    {
        let chunks = self.partition(items);
        let total = chunks.len();
        let mut results = Vec::with_capacity(items.len());

        for chunk in chunks {
            let index = chunk.index;
            let len = chunk.items.len();
            let span = info_span!("chunk", chunk = index + 1, total_chunks = total, items = len);

            let chunk_results = async {
                info!("Starting chunk");
                let out = run_chunk(chunk).await;
                info!("Chunk finished");
                out
            }
            .instrument(span)
            .await;
            results.extend(chunk_results);

            let is_last = index + 1 == total;
            if !is_last && !cancel.is_cancelled() {
                let delay = delay_after(len);
                info!(
                    chunk = index + 1,
                    delay_ms = delay.as_millis() as u64,
                    "Waiting before next chunk"
                );
                cancel.sleep(delay).await;
            }
        }

        results
    }
}
