//! Retry and ignore wrappers (spec §4.3) guarding every database
//! round-trip. Grounded on `DbExecutable::execute_or_retry_cleaned` in the
//! teacher's `db_writer.rs` (retry-count loop with per-attempt metrics and
//! a classify-then-retry branch) and `utils/database.rs::execute_in_chunks`
//! (batch-exec with a cleaned-and-retried fallback), re-expressed to match
//! the exact composition and row-level fallback semantics this spec
//! requires rather than the teacher's byte-cleaning fallback.

use crate::config::RetryPolicy;
use crate::error::EngineError;
use crate::record::Record;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Classifies whether a given error is worth retrying at all. Concrete
/// drivers implement this (`IsRetryErr` in spec terms); the engine only
/// defines the shape.
pub trait RetryClassifier {
    fn is_retryable(&self, error: &EngineError) -> bool;
}

/// Retries transient failures, honouring cancellation. Composition order
/// is `Retry(OneByOne(ExecBatch))`: a transient connection blip retries
/// the whole batch, only permanent row errors reach one-by-one.
pub struct RetryWrapper<C: RetryClassifier> {
    policy: RetryPolicy,
    classifier: C,
    cancel: CancellationToken,
}

impl<C: RetryClassifier> RetryWrapper<C> {
    pub fn new(policy: RetryPolicy, classifier: C, cancel: CancellationToken) -> Self {
        Self {
            policy,
            classifier,
            cancel,
        }
    }

    /// Repeatedly invokes `f` until it succeeds or the retry budget is
    /// exhausted. Returns the number of invocations made, for callers
    /// that need to verify idempotence (spec §8).
    pub async fn call<F, Fut, T>(&self, mut f: F) -> Result<T, EngineError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, EngineError>>,
    {
        let (mut attempts_left, backoff) = self.budget();
        let mut attempt: u32 = 0;
        loop {
            if self.cancel.is_cancelled() {
                return Err(EngineError::Cancelled);
            }
            attempt += 1;
            match f().await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    if matches!(err, EngineError::Cancelled) {
                        return Err(err);
                    }
                    let retryable = self.classifier.is_retryable(&err);
                    if !retryable || attempts_left == 0 {
                        return Err(err);
                    }
                    attempts_left -= 1;
                    let wait = backoff(attempt);
                    tokio::select! {
                        _ = tokio::time::sleep(wait) => {},
                        _ = self.cancel.cancelled() => return Err(EngineError::Cancelled),
                    }
                },
            }
        }
    }

    /// Returns (max retries, a fn from 1-indexed attempt number to the
    /// backoff duration before the *next* attempt).
    fn budget(&self) -> (u32, Box<dyn Fn(u32) -> Duration + Send + Sync + '_>) {
        match &self.policy {
            RetryPolicy::NoRetry => (0, Box::new(|_| Duration::ZERO)),
            RetryPolicy::NTimes { n, wait } => {
                let wait = *wait;
                (*n, Box::new(move |_| wait))
            },
            RetryPolicy::ExponentialBackoff { base, max, cap } => {
                let base = *base;
                let max = *max;
                // Perturb the wait a little so a burst of Tasks that fail
                // at the same moment don't all retry in lockstep.
                (*cap, Box::new(move |attempt| {
                    let scaled = base.saturating_mul(1u32.checked_shl(attempt).unwrap_or(u32::MAX));
                    let capped = scaled.min(max);
                    let jitter = rand::random::<f64>() * capped.as_secs_f64() * 0.1;
                    capped + Duration::from_secs_f64(jitter)
                }))
            },
        }
    }
}

/// A row the writer rejected and the engine chose to skip.
#[derive(Debug, Clone)]
pub struct DirtyRecord {
    pub record: Record,
    pub error: String,
    pub message: String,
}

/// Write-only sink for dirty records (spec §6: "the core must not assume
/// filesystem"). The host binds this to a file, a log, or discards it.
pub trait DirtySink: Send + Sync {
    fn record(&self, dirty: DirtyRecord);

    /// Running count of dirty records routed so far, used by `Job` to
    /// derive `JobSummary::records_dirty` without threading the count
    /// through every Task. Sinks that don't track a count (a write-only
    /// log, say) can leave this at the default.
    fn count(&self) -> u64 {
        0
    }
}

/// Discards every dirty record. Used when the host opts out.
pub struct DiscardingSink;
impl DirtySink for DiscardingSink {
    fn record(&self, _dirty: DirtyRecord) {}
}

/// Logs dirty records via `tracing::warn!`. The default binding spec §6
/// describes ("a log").
pub struct TracingSink;
impl DirtySink for TracingSink {
    fn record(&self, dirty: DirtyRecord) {
        tracing::warn!(error = %dirty.error, message = %dirty.message, "dirty record");
    }
}

/// Collects dirty records in memory; used by tests and by hosts that want
/// to inspect the dirty set after a Job completes.
#[derive(Default)]
pub struct InMemoryDirtySink {
    records: std::sync::Mutex<Vec<DirtyRecord>>,
}

impl InMemoryDirtySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn take(&self) -> Vec<DirtyRecord> {
        std::mem::take(&mut self.records.lock().unwrap())
    }

    pub fn len(&self) -> usize {
        self.records.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl DirtySink for InMemoryDirtySink {
    fn record(&self, dirty: DirtyRecord) {
        self.records.lock().unwrap().push(dirty);
    }

    fn count(&self) -> u64 {
        self.len() as u64
    }
}

/// Wraps a batch exec with row-by-row fallback on failure.
pub struct OneByOneWrapper<'a> {
    pub ignore_one_by_one_error: bool,
    pub dirty_quota: u64,
    pub sink: &'a dyn DirtySink,
}

impl<'a> OneByOneWrapper<'a> {
    pub fn new(ignore_one_by_one_error: bool, dirty_quota: u64, sink: &'a dyn DirtySink) -> Self {
        Self {
            ignore_one_by_one_error,
            dirty_quota,
            sink,
        }
    }

    /// Executes `batch_exec` against the whole batch first. On failure,
    /// if `ignore_one_by_one_error` is set, re-executes `row_exec` against
    /// each row individually; rows that still fail are routed to the
    /// dirty sink and do not fail the call, unless the dirty quota is
    /// exceeded. Returns the count of rows actually applied.
    ///
    /// `batch_exec`/`row_exec` take their records by value rather than by
    /// reference: a closure that calls an async method borrowing `self`
    /// and returns that borrowed future can't be expressed as a single
    /// `FnMut(&[Record]) -> B` for a fixed `B`, since the future's type
    /// would depend on the borrow's lifetime at each call site.
    pub async fn exec<B, R, BF, RF>(
        &self,
        batch: Vec<Record>,
        mut batch_exec: BF,
        mut row_exec: RF,
    ) -> Result<usize, EngineError>
    where
        BF: FnMut(Vec<Record>) -> B,
        RF: FnMut(Record) -> R,
        B: Future<Output = Result<(), EngineError>>,
        R: Future<Output = Result<(), EngineError>>,
    {
        let len = batch.len();
        match batch_exec(batch.clone()).await {
            Ok(()) => Ok(len),
            Err(batch_err) => {
                if !self.ignore_one_by_one_error {
                    return Err(batch_err);
                }
                let mut applied = 0usize;
                let mut dirty_count: u64 = 0;
                for record in batch {
                    match row_exec(record.clone()).await {
                        Ok(()) => applied += 1,
                        Err(row_err) => {
                            dirty_count += 1;
                            if dirty_count > self.dirty_quota {
                                return Err(EngineError::Data {
                                    component: "one_by_one".to_string(),
                                    message: format!(
                                        "dirty record quota ({}) exceeded",
                                        self.dirty_quota
                                    ),
                                });
                            }
                            self.sink.record(DirtyRecord {
                                record,
                                error: format!("{row_err}"),
                                message: "row rejected by sink".to_string(),
                            });
                        },
                    }
                }
                Ok(applied)
            },
        }
    }
}
