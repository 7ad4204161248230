use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ExecutionError;
use crate::executor::GenerationResult;
use crate::retry::{RetryClassifier, RetryDecision, RetryPolicy};

use super::job::{Attempt, JobOutcome, JobRun};

/// Lifecycle of a job within one batch run.
///
/// `Pending → Dispatched → {Succeeded, Retrying → Dispatched, Failed}`, with
/// `Skipped` reachable from `Pending` only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobState {
    Pending,
    Dispatched,
    Retrying,
    Succeeded,
    Failed,
    Skipped,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Succeeded | JobState::Failed | JobState::Skipped)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobState::Pending => write!(f, "PENDING"),
            JobState::Dispatched => write!(f, "DISPATCHED"),
            JobState::Retrying => write!(f, "RETRYING"),
            JobState::Succeeded => write!(f, "SUCCEEDED"),
            JobState::Failed => write!(f, "FAILED"),
            JobState::Skipped => write!(f, "SKIPPED"),
        }
    }
}

/// What the orchestrator must do after an attempt finishes.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    /// Wait `delay`, then dispatch attempt `next_attempt`.
    Retry {
        next_attempt: u32,
        delay: Duration,
        reason: ExecutionError,
    },
    /// The job reached a terminal outcome.
    Complete(JobOutcome),
}

/// Drives a [`JobRun`] through its states.
pub struct StateMachine;

impl StateMachine {
    /// `Pending → Skipped`, for jobs already completed in a previous run.
    pub fn skip(run: &mut JobRun) -> Transition {
        debug_assert_eq!(run.state, JobState::Pending);
        run.move_to(JobState::Skipped);
        Transition::Complete(JobOutcome::Skipped)
    }

    /// `Pending | Retrying → Dispatched`, creating the next [`Attempt`].
    pub fn dispatch(run: &mut JobRun) -> Attempt {
        debug_assert!(matches!(run.state, JobState::Pending | JobState::Retrying));
        run.attempts += 1;
        run.move_to(JobState::Dispatched);
        Attempt::start(run.attempts)
    }

    /// Folds a finished attempt into the run.
    ///
    /// - Success moves to `Succeeded`.
    /// - A permanent failure moves to `Failed` without retrying.
    /// - A retryable failure moves to `Retrying` while attempts remain under
    ///   `policy`, otherwise to `Failed`.
    pub fn next(
        run: &mut JobRun,
        mut attempt: Attempt,
        result: Result<GenerationResult, ExecutionError>,
        policy: &RetryPolicy,
    ) -> Transition {
        debug_assert_eq!(run.state, JobState::Dispatched);
        attempt.finish(&result);

        let error = match result {
            Ok(output) => {
                run.move_to(JobState::Succeeded);
                return Transition::Complete(JobOutcome::Succeeded(output));
            }
            Err(error) => error,
        };

        let retries_used = attempt.number.saturating_sub(1);
        match RetryClassifier::classify(&error) {
            RetryDecision::Retryable if retries_used < policy.max_retries => {
                run.move_to(JobState::Retrying);
                let retry = retries_used + 1;
                Transition::Retry {
                    next_attempt: attempt.number + 1,
                    delay: policy.delay_after(retry, &error),
                    reason: error,
                }
            }
            _ => {
                run.move_to(JobState::Failed);
                Transition::Complete(JobOutcome::Failed(error))
            }
        }
    }
}
