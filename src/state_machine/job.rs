use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::error::{ErrorKind, ExecutionError};
use crate::executor::GenerationResult;

use super::state::JobState;

/// Kind of artifact a job asks the service for.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaType {
    #[default]
    Image,
    Video,
}

impl MediaType {
    /// File extension used for the written artifact.
    pub fn extension(&self) -> &'static str {
        match self {
            MediaType::Image => "png",
            MediaType::Video => "mp4",
        }
    }
}

/// Request fields forwarded untouched to the executor.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerationPayload {
    pub prompt: String,
    #[serde(default)]
    pub media_type: MediaType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub negative_prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quality: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aspect_ratio: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub video_model: Option<String>,
}

/// One unit of work read from the input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    /// Stable identifier; the checkpoint is keyed by it.
    pub request_id: String,
    pub payload: GenerationPayload,
    /// Preferred artifact file stem.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_name: Option<String>,
    /// Line of the input file the record came from, when known.
    #[serde(skip)]
    pub row_number: Option<usize>,
}

impl JobRecord {
    pub fn new(request_id: impl Into<String>, payload: GenerationPayload) -> Self {
        Self {
            request_id: request_id.into(),
            payload,
            output_name: None,
            row_number: None,
        }
    }

    pub fn with_output_name(mut self, name: impl Into<String>) -> Self {
        self.output_name = Some(name.into());
        self
    }

    pub fn with_row_number(mut self, row_number: usize) -> Self {
        self.row_number = Some(row_number);
        self
    }
}

/// Outcome of a single attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    Pending,
    Success,
    Failure(ErrorKind),
}

/// A single try at executing a job.
#[derive(Debug, Clone)]
pub struct Attempt {
    /// 1-based attempt number.
    pub number: u32,
    pub started_at: Instant,
    pub outcome: AttemptOutcome,
}

impl Attempt {
    pub fn start(number: u32) -> Self {
        Self {
            number,
            started_at: Instant::now(),
            outcome: AttemptOutcome::Pending,
        }
    }

    pub fn finish(&mut self, result: &Result<GenerationResult, ExecutionError>) {
        self.outcome = match result {
            Ok(_) => AttemptOutcome::Success,
            Err(e) => AttemptOutcome::Failure(e.kind),
        };
    }
}

/// Terminal result of a job in this run.
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Succeeded(GenerationResult),
    Failed(ExecutionError),
    Skipped,
}

/// Progress of one job through the state machine.
#[derive(Debug, Clone)]
pub struct JobRun {
    pub request_id: String,
    pub state: JobState,
    pub state_history: Vec<JobState>,
    /// Attempts dispatched so far.
    pub attempts: u32,
    pub started_at: Instant,
}

impl JobRun {
    pub fn new(request_id: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            state: JobState::Pending,
            state_history: Vec::new(),
            attempts: 0,
            started_at: Instant::now(),
        }
    }

    /// Seconds since the job was first dispatched.
    pub fn elapsed_seconds(&self) -> f64 {
        self.started_at.elapsed().as_secs_f64()
    }

    pub(super) fn move_to(&mut self, next: JobState) {
        self.state_history.push(self.state);
        self.state = next;
    }
}
