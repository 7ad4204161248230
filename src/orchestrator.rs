use std::collections::HashSet;
use std::path::PathBuf;
use std::pin::pin;
use std::sync::Arc;

use futures::{Stream, StreamExt};
use tokio::task::{JoinError, JoinSet};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};
use uuid::Uuid;

use crate::checkpoint::{CheckpointEntry, CheckpointStore};
use crate::concurrency::{ConcurrencyController, Slot};
use crate::error::BatchError;
use crate::executor::Executor;
use crate::input::{NullRejectionSink, RejectedRow, RejectionSink};
use crate::ratelimit::{RateLimiter, default_burst};
use crate::retry::RetryPolicy;
use crate::state_machine::{JobOutcome, JobRecord, JobRun, StateMachine, Transition};
use crate::summary::{BatchSummary, SummaryBuilder};

/// Knobs for one orchestrator.
#[derive(Debug, Clone)]
pub struct BatchSettings {
    pub output_dir: PathBuf,
    /// Jobs in flight at once.
    pub concurrency: usize,
    /// Requests per minute sent to the executor.
    pub rate_limit: u32,
    /// Tokens available instantly; `rate_limit / 10` when unset.
    pub burst_capacity: Option<u32>,
    pub resume: bool,
    pub dry_run: bool,
    pub retry: RetryPolicy,
}

impl Default for BatchSettings {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("output"),
            concurrency: 10,
            rate_limit: 60,
            burst_capacity: None,
            resume: false,
            dry_run: false,
            retry: RetryPolicy::default(),
        }
    }
}

/// Notified as jobs reach a terminal outcome, in completion order.
pub trait BatchObserver: Send + Sync {
    fn job_finished(&self, _request_id: &str, _outcome: &JobOutcome) {}
}

struct NoopObserver;

impl BatchObserver for NoopObserver {}

/// Streams jobs through the rate limiter and concurrency controller to an
/// [`Executor`], checkpointing each terminal outcome.
pub struct BatchOrchestrator<E> {
    executor: Arc<E>,
    settings: BatchSettings,
    limiter: Arc<RateLimiter>,
    rejects: Arc<dyn RejectionSink>,
    observer: Arc<dyn BatchObserver>,
}

// State shared by every job task of one run.
struct JobContext<E> {
    executor: Arc<E>,
    store: Arc<CheckpointStore>,
    limiter: Arc<RateLimiter>,
    policy: RetryPolicy,
}

enum JobReport {
    Finished { request_id: String, outcome: JobOutcome },
    Cancelled { request_id: String },
    Fatal(BatchError),
}

impl<E: Executor + 'static> BatchOrchestrator<E> {
    pub fn new(executor: E, settings: BatchSettings) -> Self {
        let burst = settings
            .burst_capacity
            .unwrap_or_else(|| default_burst(settings.rate_limit));
        Self {
            executor: Arc::new(executor),
            limiter: Arc::new(RateLimiter::with_burst(settings.rate_limit, burst)),
            settings,
            rejects: Arc::new(NullRejectionSink),
            observer: Arc::new(NoopObserver),
        }
    }

    /// Where rows with duplicate ids are reported.
    pub fn with_rejection_sink(mut self, sink: Arc<dyn RejectionSink>) -> Self {
        self.rejects = sink;
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn BatchObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn settings(&self) -> &BatchSettings {
        &self.settings
    }

    pub fn checkpoint_path(&self) -> PathBuf {
        CheckpointStore::path_in(&self.settings.output_dir)
    }

    /// Runs the batch to completion, or until `cancel` fires.
    ///
    /// Cancellation stops new dispatch at once, abandons in-flight attempts
    /// and returns a summary with `interrupted` set that counts only jobs
    /// whose outcome was checkpointed. A fatal environment error stops the
    /// run the same way and is returned instead of a summary.
    pub async fn run<S>(
        &self,
        jobs: S,
        cancel: CancellationToken,
    ) -> Result<BatchSummary, BatchError>
    where
        S: Stream<Item = Result<JobRecord, BatchError>>,
    {
        let run_id = Uuid::new_v4();
        let span = info_span!("batch", %run_id);
        async {
            let summary =
                SummaryBuilder::start(run_id, self.checkpoint_path(), self.settings.dry_run);
            if self.settings.dry_run {
                self.plan(jobs, summary, cancel).await
            } else {
                self.execute(jobs, summary, cancel).await
            }
        }
        .instrument(span)
        .await
    }

    async fn execute<S>(
        &self,
        jobs: S,
        mut summary: SummaryBuilder,
        cancel: CancellationToken,
    ) -> Result<BatchSummary, BatchError>
    where
        S: Stream<Item = Result<JobRecord, BatchError>>,
    {
        let output_dir = &self.settings.output_dir;
        tokio::fs::create_dir_all(output_dir)
            .await
            .map_err(|source| BatchError::OutputDir {
                path: output_dir.clone(),
                source,
            })?;
        let store =
            CheckpointStore::open(self.checkpoint_path(), self.settings.resume).await?;
        let store = Arc::new(store);
        let completed = store.completed_ids();

        info!(
            concurrency = self.settings.concurrency,
            rate_limit = self.limiter.rate_per_minute(),
            burst = self.limiter.burst_capacity(),
            resume = self.settings.resume,
            already_completed = completed.len(),
            "Starting batch"
        );

        let ctx = Arc::new(JobContext {
            executor: Arc::clone(&self.executor),
            store: Arc::clone(&store),
            limiter: Arc::clone(&self.limiter),
            policy: self.settings.retry.clone(),
        });
        let slots = ConcurrencyController::new(self.settings.concurrency);
        // Cancelled on interrupt (through the parent) or by a fatal error.
        let halt = cancel.child_token();
        let mut tasks: JoinSet<JobReport> = JoinSet::new();
        let mut seen = HashSet::new();
        let mut fatal: Option<BatchError> = None;
        let mut jobs = pin!(jobs);

        loop {
            while let Some(joined) = tasks.try_join_next() {
                self.fold(joined, &mut summary, &mut fatal);
            }
            if fatal.is_some() {
                halt.cancel();
            }
            if halt.is_cancelled() {
                break;
            }

            let next = tokio::select! {
                biased;
                _ = halt.cancelled() => break,
                next = jobs.next() => next,
            };
            let record = match next {
                None => break,
                Some(Ok(record)) => record,
                Some(Err(e)) => {
                    fatal.get_or_insert(e);
                    halt.cancel();
                    break;
                }
            };

            if !seen.insert(record.request_id.clone()) {
                self.reject_duplicate(&record, &mut summary, &mut fatal).await;
                continue;
            }
            if completed.contains(&record.request_id) {
                debug!(request_id = %record.request_id, "Already completed, skipping");
                let mut run = JobRun::new(&record.request_id);
                if let Transition::Complete(outcome) = StateMachine::skip(&mut run) {
                    self.observer.job_finished(&record.request_id, &outcome);
                }
                summary.skipped += 1;
                continue;
            }

            let slot = tokio::select! {
                biased;
                _ = halt.cancelled() => None,
                slot = slots.acquire_slot() => slot,
            };
            let Some(slot) = slot else { break };
            let permitted = tokio::select! {
                biased;
                _ = halt.cancelled() => false,
                _ = self.limiter.acquire() => true,
            };
            if !permitted {
                break;
            }

            let span = info_span!("job", request_id = %record.request_id);
            tasks.spawn(run_job(Arc::clone(&ctx), record, slot, halt.clone()).instrument(span));
        }

        slots.close();
        while let Some(joined) = tasks.join_next().await {
            self.fold(joined, &mut summary, &mut fatal);
        }
        if let Some(e) = fatal {
            error!(error = %e, "Batch aborted");
            return Err(e);
        }

        let interrupted = cancel.is_cancelled();
        let summary = summary.finish(interrupted);
        if interrupted {
            warn!(
                succeeded = summary.succeeded,
                failed = summary.failed,
                skipped = summary.skipped,
                "Batch interrupted"
            );
        } else {
            info!(
                succeeded = summary.succeeded,
                failed = summary.failed,
                skipped = summary.skipped,
                elapsed_seconds = summary.elapsed_seconds,
                "Batch finished"
            );
        }
        Ok(summary)
    }

    /// Dry run: walks the input and counts what would be dispatched without
    /// touching the executor or the checkpoint file.
    async fn plan<S>(
        &self,
        jobs: S,
        mut summary: SummaryBuilder,
        cancel: CancellationToken,
    ) -> Result<BatchSummary, BatchError>
    where
        S: Stream<Item = Result<JobRecord, BatchError>>,
    {
        let completed = if self.settings.resume {
            CheckpointStore::load_completed_ids(&self.checkpoint_path()).await?
        } else {
            HashSet::new()
        };
        let mut seen = HashSet::new();
        let mut fatal = None;
        let mut jobs = pin!(jobs);

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                next = jobs.next() => next,
            };
            let record = match next {
                None => break,
                Some(record) => record?,
            };
            if !seen.insert(record.request_id.clone()) {
                self.reject_duplicate(&record, &mut summary, &mut fatal).await;
                if let Some(e) = fatal.take() {
                    return Err(e);
                }
            } else if completed.contains(&record.request_id) {
                summary.skipped += 1;
            } else {
                summary.planned += 1;
            }
        }

        let summary = summary.finish(cancel.is_cancelled());
        info!(
            planned = summary.planned,
            skipped = summary.skipped,
            rejected = summary.rejected,
            "Dry run complete, nothing dispatched"
        );
        Ok(summary)
    }

    async fn reject_duplicate(
        &self,
        record: &JobRecord,
        summary: &mut SummaryBuilder,
        fatal: &mut Option<BatchError>,
    ) {
        warn!(request_id = %record.request_id, "Duplicate request_id in input, ignoring row");
        summary.rejected += 1;
        let row = RejectedRow {
            row_number: record.row_number.unwrap_or(0),
            error_type: "duplicate_request_id".to_string(),
            error_message: format!("request_id {} appears more than once", record.request_id),
            raw_data: serde_json::to_value(record).unwrap_or(serde_json::Value::Null),
        };
        if let Err(e) = self.rejects.reject(&row).await {
            fatal.get_or_insert(e);
        }
    }

    fn fold(
        &self,
        joined: Result<JobReport, JoinError>,
        summary: &mut SummaryBuilder,
        fatal: &mut Option<BatchError>,
    ) {
        match joined {
            Ok(JobReport::Finished { request_id, outcome }) => {
                match &outcome {
                    JobOutcome::Succeeded(result) => {
                        summary.succeeded += 1;
                        info!(
                            request_id = %request_id,
                            output = %result.output_path.display(),
                            "Job succeeded"
                        );
                    }
                    JobOutcome::Failed(reason) => {
                        summary.failed += 1;
                        warn!(request_id = %request_id, error = %reason, "Job failed");
                    }
                    JobOutcome::Skipped => unreachable!("skips are counted at dispatch"),
                }
                self.observer.job_finished(&request_id, &outcome);
            }
            Ok(JobReport::Cancelled { request_id }) => {
                debug!(request_id = %request_id, "Job cancelled before a terminal outcome");
            }
            Ok(JobReport::Fatal(e)) => {
                fatal.get_or_insert(e);
            }
            Err(e) => {
                // The job's slot was released on unwind; it has no checkpoint
                // entry and will run again on resume.
                error!(error = %e, "Job task panicked");
            }
        }
    }
}

async fn run_job<E: Executor>(
    ctx: Arc<JobContext<E>>,
    record: JobRecord,
    slot: Slot,
    halt: CancellationToken,
) -> JobReport {
    let mut run = JobRun::new(&record.request_id);
    let outcome = loop {
        let attempt = StateMachine::dispatch(&mut run);
        debug!(attempt = attempt.number, "Dispatching");

        let result = tokio::select! {
            biased;
            _ = halt.cancelled() => None,
            result = ctx.executor.execute(&record) => Some(result),
        };
        let Some(result) = result else {
            return JobReport::Cancelled {
                request_id: record.request_id,
            };
        };

        match StateMachine::next(&mut run, attempt, result, &ctx.policy) {
            Transition::Complete(outcome) => break outcome,
            Transition::Retry {
                next_attempt,
                delay,
                reason,
            } => {
                warn!(
                    attempt = next_attempt - 1,
                    max_attempts = ctx.policy.max_attempts(),
                    delay_ms = delay.as_millis() as u64,
                    error = %reason,
                    "Attempt failed, retrying"
                );
                let resumed = tokio::select! {
                    biased;
                    _ = halt.cancelled() => false,
                    _ = async {
                        sleep(delay).await;
                        ctx.limiter.acquire().await;
                    } => true,
                };
                if !resumed {
                    return JobReport::Cancelled {
                        request_id: record.request_id,
                    };
                }
            }
        }
    };

    let elapsed = run.elapsed_seconds();
    let entry = match &outcome {
        JobOutcome::Succeeded(result) => Some(
            CheckpointEntry::success(
                &record.request_id,
                result.output_path.display().to_string(),
                elapsed,
            )
            .with_file_size(result.file_size_bytes),
        ),
        JobOutcome::Failed(reason) => Some(CheckpointEntry::failure(
            &record.request_id,
            reason.to_string(),
            elapsed,
        )),
        JobOutcome::Skipped => None,
    };

    // Written outside any cancellable section so an interrupt never leaves
    // half an entry behind.
    if let Some(entry) = entry
        && let Err(e) = ctx.store.record(&entry.with_attempts(run.attempts)).await
    {
        halt.cancel();
        return JobReport::Fatal(e);
    }
    slot.release();

    JobReport::Finished {
        request_id: record.request_id,
        outcome,
    }
}
