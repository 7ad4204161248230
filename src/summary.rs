//! Aggregate counters for one batch run.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use uuid::Uuid;

/// Final (or partial, when interrupted) result of a batch run.
///
/// `succeeded + failed + skipped + planned == total` always holds, and
/// `planned` is non-zero only for dry runs. Jobs that never reached a
/// terminal outcome are not counted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchSummary {
    pub run_id: Uuid,
    pub total: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub skipped: u64,
    pub planned: u64,
    /// Rows refused because their `request_id` was already seen in the input.
    pub rejected: u64,
    pub elapsed_seconds: f64,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub checkpoint_path: PathBuf,
    pub dry_run: bool,
    pub interrupted: bool,
}

impl BatchSummary {
    /// Percentage of `total` that succeeded; `0.0` for an empty batch.
    pub fn success_rate(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        self.succeeded as f64 / self.total as f64 * 100.0
    }

    /// Jobs that reached a terminal outcome through execution, per minute.
    pub fn throughput_per_minute(&self) -> f64 {
        if self.elapsed_seconds <= 0.0 {
            return 0.0;
        }
        (self.succeeded + self.failed) as f64 / (self.elapsed_seconds / 60.0)
    }

    pub fn is_clean(&self) -> bool {
        self.failed == 0 && !self.interrupted
    }
}

/// Running counters, folded into a [`BatchSummary`] when the run ends.
#[derive(Debug)]
pub struct SummaryBuilder {
    run_id: Uuid,
    started: Instant,
    started_at: DateTime<Utc>,
    checkpoint_path: PathBuf,
    dry_run: bool,
    pub succeeded: u64,
    pub failed: u64,
    pub skipped: u64,
    pub planned: u64,
    pub rejected: u64,
}

impl SummaryBuilder {
    pub fn start(run_id: Uuid, checkpoint_path: PathBuf, dry_run: bool) -> Self {
        Self {
            run_id,
            started: Instant::now(),
            started_at: Utc::now(),
            checkpoint_path,
            dry_run,
            succeeded: 0,
            failed: 0,
            skipped: 0,
            planned: 0,
            rejected: 0,
        }
    }

    pub fn finish(self, interrupted: bool) -> BatchSummary {
        BatchSummary {
            run_id: self.run_id,
            total: self.succeeded + self.failed + self.skipped + self.planned,
            succeeded: self.succeeded,
            failed: self.failed,
            skipped: self.skipped,
            planned: self.planned,
            rejected: self.rejected,
            elapsed_seconds: self.started.elapsed().as_secs_f64(),
            started_at: self.started_at,
            finished_at: Utc::now(),
            checkpoint_path: self.checkpoint_path,
            dry_run: self.dry_run,
            interrupted,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn summary(succeeded: u64, failed: u64, skipped: u64) -> BatchSummary {
        let mut builder =
            SummaryBuilder::start(Uuid::new_v4(), PathBuf::from("out/_batch_state.jsonl"), false);
        builder.succeeded = succeeded;
        builder.failed = failed;
        builder.skipped = skipped;
        builder.finish(false)
    }

    #[tokio::test]
    async fn total_is_sum_of_outcomes() {
        let s = summary(85, 10, 5);
        assert_eq!(s.total, 100);
        assert_eq!(s.success_rate(), 85.0);
    }

    #[tokio::test]
    async fn empty_batch_has_zero_rate() {
        let s = summary(0, 0, 0);
        assert_eq!(s.total, 0);
        assert_eq!(s.success_rate(), 0.0);
        assert!(s.is_clean());
    }

    #[tokio::test]
    async fn two_of_three_is_two_thirds() {
        let s = summary(2, 1, 0);
        assert!((s.success_rate() - 66.666).abs() < 0.01);
        assert!(!s.is_clean());
    }

    #[tokio::test(start_paused = true)]
    async fn throughput_uses_executed_jobs_only() {
        let mut builder = SummaryBuilder::start(Uuid::new_v4(), PathBuf::new(), false);
        builder.succeeded = 20;
        builder.skipped = 100;
        tokio::time::advance(std::time::Duration::from_secs(60)).await;
        let s = builder.finish(false);
        assert!((s.throughput_per_minute() - 20.0).abs() < 0.01);
    }

    #[test]
    fn summary_serializes_counts() {
        let s = BatchSummary {
            run_id: Uuid::nil(),
            total: 3,
            succeeded: 2,
            failed: 1,
            skipped: 0,
            planned: 0,
            rejected: 0,
            elapsed_seconds: 1.5,
            started_at: Utc::now(),
            finished_at: Utc::now(),
            checkpoint_path: PathBuf::from("out/_batch_state.jsonl"),
            dry_run: false,
            interrupted: false,
        };
        let json = serde_json::to_value(&s).unwrap();
        assert_eq!(json["succeeded"], 2);
        assert_eq!(json["checkpoint_path"], "out/_batch_state.jsonl");
    }
}
