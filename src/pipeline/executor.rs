//! Stage executor: bounded-concurrency, paced, retrying invoker of one stage
//!
//! For every item the executor:
//!
//! 1. Looks up the `(item, stage)` checkpoint and reuses a successful entry
//! 2. Prepares the call input (only on a checkpoint miss)
//! 3. Acquires one of `concurrency` slots
//! 4. Invokes the remote call, retrying rate limits and transient errors
//! 5. Records every attempt with the quota tracker
//! 6. Writes the outcome to the checkpoint store
//! 7. Waits the pacing delay, then releases the slot
//!
//! The executor never returns an error to its caller. Every outcome, including
//! cancellation, is a [`StageOutcome`].

use super::config::StagePolicy;
use crate::cancel::CancelSignal;
use crate::checkpoint::{CheckpointEntry, CheckpointStore};
use crate::metrics::{self, StageCallMetrics};
use crate::quota::QuotaTracker;
use crate::services::{ErrorClass, ServiceError};
use crate::{Stage, StageResult};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// One remote-call stage as seen by the executor
#[async_trait]
pub trait StageCall: Send + Sync {
    /// Per-item data handed in by the caller
    type Seed: Send + Sync;
    /// Prepared input of one remote call
    type Input: Send + Sync;
    /// Stage output, persisted as the checkpoint payload
    type Output: Serialize + DeserializeOwned + Send;

    /// Stage this call implements
    fn stage(&self) -> Stage;

    /// Build the call input. Runs only when no usable checkpoint exists.
    async fn prepare(&self, item_id: &str, seed: &Self::Seed) -> Result<Self::Input, ServiceError>;

    /// Perform one remote attempt
    async fn invoke(&self, input: &Self::Input) -> Result<Self::Output, ServiceError>;

    /// Size reported to the quota tracker for one attempt
    fn payload_size(&self, input: &Self::Input) -> u64;
}

/// Why an item failed a stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Rate limited on every attempt
    RateLimited,
    /// Transient failure on the last attempt
    Transient,
    /// Non-retryable failure
    Fatal,
    /// Run cancelled before the stage could finish
    Cancelled,
}

impl From<ErrorClass> for FailureKind {
    fn from(class: ErrorClass) -> Self {
        match class {
            ErrorClass::RateLimited => Self::RateLimited,
            ErrorClass::Transient => Self::Transient,
            ErrorClass::Fatal => Self::Fatal,
        }
    }
}

impl FailureKind {
    /// Label used in logs, metrics and exports
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RateLimited => "rate_limited",
            Self::Transient => "transient",
            Self::Fatal => "fatal",
            Self::Cancelled => "cancelled",
        }
    }
}

/// Terminal failure of one stage for one item
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageFailure {
    /// Failure classification
    pub kind: FailureKind,
    /// Last error message
    pub message: String,
}

impl StageFailure {
    fn cancelled(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Cancelled,
            message: message.into(),
        }
    }
}

impl From<&ServiceError> for StageFailure {
    fn from(err: &ServiceError) -> Self {
        Self {
            kind: err.class().into(),
            message: err.message().to_string(),
        }
    }
}

/// Tagged result of one stage for one item
#[derive(Debug, Clone)]
pub struct StageOutcome<T> {
    /// Item id
    pub item_id: String,
    /// Stage
    pub stage: Stage,
    /// Output or terminal failure
    pub result: Result<T, StageFailure>,
    /// Remote attempts behind the result (from the checkpoint when cached)
    pub attempts: u32,
    /// Whether the result came from the checkpoint store
    pub cached: bool,
}

impl<T> StageOutcome<T> {
    /// Whether the stage succeeded
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }
}

/// Executes one stage under a concurrency cap, pacing and retry policy
pub struct StageExecutor {
    stage: Stage,
    policy: StagePolicy,
    semaphore: Arc<Semaphore>,
    checkpoints: Arc<dyn CheckpointStore>,
    quota: Option<Arc<QuotaTracker>>,
    cancel: CancelSignal,
}

impl StageExecutor {
    /// Create an executor for `stage`
    pub fn new(stage: Stage, policy: StagePolicy, checkpoints: Arc<dyn CheckpointStore>) -> Self {
        Self {
            stage,
            policy,
            semaphore: Arc::new(Semaphore::new(policy.concurrency.max(1))),
            checkpoints,
            quota: None,
            cancel: CancelSignal::new(),
        }
    }

    /// Record every remote attempt with `quota`
    pub fn with_quota(mut self, quota: Arc<QuotaTracker>) -> Self {
        self.quota = Some(quota);
        self
    }

    /// Stop dispatching calls once `cancel` trips
    pub fn with_cancel(mut self, cancel: CancelSignal) -> Self {
        self.cancel = cancel;
        self
    }

    /// Stage this executor runs
    pub fn stage(&self) -> Stage {
        self.stage
    }

    /// Policy in effect
    pub fn policy(&self) -> &StagePolicy {
        &self.policy
    }

    /// Run the stage for one item
    pub async fn execute<C>(&self, call: &C, item_id: &str, seed: &C::Seed) -> StageOutcome<C::Output>
    where
        C: StageCall,
    {
        debug_assert_eq!(call.stage(), self.stage);

        if let Some(outcome) = self.cached_outcome::<C::Output>(item_id) {
            return outcome;
        }

        if self.cancel.is_cancelled() {
            return self.outcome(item_id, Err(StageFailure::cancelled("run cancelled")), 0);
        }

        let input = match call.prepare(item_id, seed).await {
            Ok(input) => input,
            Err(e) => {
                warn!(
                    item_id = item_id,
                    stage = %self.stage,
                    error = %e,
                    "Failed to prepare stage input"
                );
                let failure = StageFailure {
                    kind: FailureKind::Fatal,
                    message: e.message().to_string(),
                };
                self.store_failure(item_id, &failure, 0);
                return self.outcome(item_id, Err(failure), 0);
            }
        };

        let _permit = tokio::select! {
            permit = self.semaphore.acquire() => match permit {
                Ok(permit) => permit,
                Err(_) => {
                    return self.outcome(item_id, Err(StageFailure::cancelled("executor closed")), 0);
                }
            },
            _ = self.cancel.cancelled() => {
                return self.outcome(item_id, Err(StageFailure::cancelled("run cancelled")), 0);
            }
        };
        if self.cancel.is_cancelled() {
            return self.outcome(item_id, Err(StageFailure::cancelled("run cancelled")), 0);
        }

        let payload_size = call.payload_size(&input);
        let max_retries = self.policy.retry.max_retries;
        let mut attempt: u32 = 0;

        loop {
            let call_metrics = StageCallMetrics::start(self.stage, attempt);
            let started = Instant::now();
            let result = call.invoke(&input).await;
            let elapsed = started.elapsed();

            if let Some(quota) = &self.quota {
                quota.record_call(payload_size, elapsed, result.is_ok());
            }

            match result {
                Ok(output) => {
                    call_metrics.record_success();
                    info!(
                        item_id = item_id,
                        stage = %self.stage,
                        attempt = attempt,
                        duration_ms = elapsed.as_millis() as u64,
                        "Stage call succeeded"
                    );
                    self.store_success(item_id, &output, attempt + 1);
                    self.pace().await;
                    return self.outcome(item_id, Ok(output), attempt + 1);
                }
                Err(err) => {
                    let class = err.class();
                    call_metrics.record_failure(class);

                    let backoff = if attempt < max_retries {
                        self.policy.retry.delay_for(class, attempt)
                    } else {
                        None
                    };

                    let Some(backoff) = backoff else {
                        warn!(
                            item_id = item_id,
                            stage = %self.stage,
                            attempt = attempt,
                            class = class.as_str(),
                            error = %err,
                            "Stage call failed permanently"
                        );
                        let failure = StageFailure::from(&err);
                        self.store_failure(item_id, &failure, attempt + 1);
                        self.pace().await;
                        return self.outcome(item_id, Err(failure), attempt + 1);
                    };

                    // The slot stays held while backing off so pacing holds across retries.
                    let wait = backoff.max(self.policy.pacing);
                    metrics::record_retry_backoff(self.stage, wait, attempt);
                    warn!(
                        item_id = item_id,
                        stage = %self.stage,
                        attempt = attempt,
                        class = class.as_str(),
                        backoff_ms = wait.as_millis() as u64,
                        error = %err,
                        "Stage call failed, retrying after backoff"
                    );

                    if !self.cancel.sleep(wait).await {
                        let failure = StageFailure::cancelled(format!(
                            "cancelled while retrying: {}",
                            err.message()
                        ));
                        self.store_failure(item_id, &StageFailure::from(&err), attempt + 1);
                        return self.outcome(item_id, Err(failure), attempt + 1);
                    }
                    attempt += 1;
                }
            }
        }
    }

    /// Run the stage for many items at once; outcomes keep the input order
    pub async fn execute_all<C>(
        &self,
        call: &C,
        items: &[(String, C::Seed)],
    ) -> Vec<StageOutcome<C::Output>>
    where
        C: StageCall,
    {
        let tasks = items
            .iter()
            .map(|(item_id, seed)| self.execute(call, item_id, seed));
        futures::future::join_all(tasks).await
    }

    fn outcome<T>(
        &self,
        item_id: &str,
        result: Result<T, StageFailure>,
        attempts: u32,
    ) -> StageOutcome<T> {
        StageOutcome {
            item_id: item_id.to_string(),
            stage: self.stage,
            result,
            attempts,
            cached: false,
        }
    }

    async fn pace(&self) {
        if !self.policy.pacing.is_zero() {
            self.cancel.sleep(self.policy.pacing).await;
        }
    }

    fn cached_outcome<T: DeserializeOwned>(&self, item_id: &str) -> Option<StageOutcome<T>> {
        let entry = match self.checkpoints.get(item_id, self.stage) {
            Ok(Some(entry)) => entry,
            Ok(None) => return None,
            Err(e) => {
                warn!(
                    item_id = item_id,
                    stage = %self.stage,
                    error = %e,
                    "Checkpoint lookup failed, treating as miss"
                );
                return None;
            }
        };

        if !entry.is_success() {
            debug!(
                item_id = item_id,
                stage = %self.stage,
                "Previous attempt failed, running stage again"
            );
            return None;
        }

        match entry.decode_payload::<T>() {
            Ok(output) => {
                metrics::record_cache_hit(self.stage);
                info!(
                    item_id = item_id,
                    stage = %self.stage,
                    "Reusing checkpointed result"
                );
                Some(StageOutcome {
                    item_id: item_id.to_string(),
                    stage: self.stage,
                    result: Ok(output),
                    attempts: entry.attempts(),
                    cached: true,
                })
            }
            Err(e) => {
                warn!(
                    item_id = item_id,
                    stage = %self.stage,
                    error = %e,
                    "Checkpoint payload unreadable, running stage again"
                );
                None
            }
        }
    }

    fn store_success<T: Serialize>(&self, item_id: &str, output: &T, attempts: u32) {
        match serde_json::to_value(output) {
            Ok(payload) => {
                let entry = CheckpointEntry::new(
                    StageResult::succeeded(item_id, self.stage, payload),
                    attempts,
                );
                self.write_entry(&entry);
            }
            Err(e) => {
                metrics::record_checkpoint_write_failure(self.stage);
                warn!(
                    item_id = item_id,
                    stage = %self.stage,
                    error = %e,
                    "Failed to serialize stage output, result not checkpointed"
                );
            }
        }
    }

    fn store_failure(&self, item_id: &str, failure: &StageFailure, attempts: u32) {
        let entry = CheckpointEntry::new(
            StageResult::failed(item_id, self.stage, failure.message.clone()),
            attempts,
        );
        self.write_entry(&entry);
    }

    fn write_entry(&self, entry: &CheckpointEntry) {
        if let Err(e) = self.checkpoints.put(entry) {
            metrics::record_checkpoint_write_failure(self.stage);
            warn!(
                item_id = entry.item_id(),
                stage = %self.stage,
                error = %e,
                "Checkpoint write failed, continuing uncached"
            );
        }
    }
}
