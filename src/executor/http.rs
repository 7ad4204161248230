//! Executor that posts each job to an HTTP generation endpoint.
//!
//! The payload is sent as JSON; a successful response body is the artifact
//! and is written to `<output_dir>/<stem>.<ext>`. Status codes are mapped to
//! an [`ErrorKind`](crate::error::ErrorKind) so the retry classifier can act
//! on them.

use std::path::{Path, PathBuf};
use std::time::Duration;

use reqwest::{Client, StatusCode};
use serde::Serialize;

use super::{Executor, GenerationResult};
use crate::error::{BatchError, ExecutionError};
use crate::state_machine::{GenerationPayload, JobRecord};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

pub struct HttpExecutor {
    client: Client,
    endpoint: String,
    output_dir: PathBuf,
}

#[derive(Serialize)]
struct GenerationRequest<'a> {
    request_id: &'a str,
    #[serde(flatten)]
    payload: &'a GenerationPayload,
}

impl HttpExecutor {
    /// `timeout` bounds each call, connection included.
    pub fn new(
        endpoint: impl Into<String>,
        output_dir: impl Into<PathBuf>,
        timeout: Duration,
    ) -> Result<Self, BatchError> {
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT.min(timeout))
            .timeout(timeout)
            .build()
            .map_err(|e| BatchError::Config(format!("cannot build HTTP client: {e}")))?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
            output_dir: output_dir.into(),
        })
    }

    fn artifact_path(&self, job: &JobRecord) -> PathBuf {
        let stem = job.output_name.as_deref().unwrap_or(&job.request_id);
        self.output_dir.join(format!(
            "{}.{}",
            sanitize_stem(stem),
            job.payload.media_type.extension()
        ))
    }
}

impl Executor for HttpExecutor {
    async fn execute(&self, job: &JobRecord) -> Result<GenerationResult, ExecutionError> {
        let body = GenerationRequest {
            request_id: &job.request_id,
            payload: &job.payload,
        };
        let response = self
            .client
            .post(&self.endpoint)
            .json(&body)
            .send()
            .await
            .map_err(request_error)?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(Duration::from_secs);
            let message = response
                .text()
                .await
                .unwrap_or_else(|_| "unknown error".to_string());
            return Err(status_error(status, message, retry_after));
        }

        let bytes = response.bytes().await.map_err(request_error)?;
        let path = self.artifact_path(job);
        write_artifact(&path, &bytes).await?;
        Ok(GenerationResult {
            output_path: path,
            file_size_bytes: Some(bytes.len() as u64),
        })
    }
}

fn request_error(e: reqwest::Error) -> ExecutionError {
    if e.is_timeout() {
        ExecutionError::timeout(e.to_string())
    } else {
        ExecutionError::transport(e.to_string())
    }
}

fn status_error(status: StatusCode, body: String, retry_after: Option<Duration>) -> ExecutionError {
    let message = format!("service returned {status}: {body}");
    match status {
        StatusCode::TOO_MANY_REQUESTS => ExecutionError {
            message,
            ..ExecutionError::rate_limited(retry_after)
        },
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ExecutionError::authentication(message),
        StatusCode::BAD_REQUEST
        | StatusCode::NOT_FOUND
        | StatusCode::PAYLOAD_TOO_LARGE
        | StatusCode::UNPROCESSABLE_ENTITY => ExecutionError::invalid_request(message),
        StatusCode::REQUEST_TIMEOUT => ExecutionError::transport(message),
        s if s.is_server_error() => ExecutionError::transport(message),
        _ => ExecutionError::from_message(message),
    }
}

async fn write_artifact(path: &Path, bytes: &[u8]) -> Result<(), ExecutionError> {
    tokio::fs::write(path, bytes).await.map_err(|e| {
        ExecutionError::new(
            crate::error::ErrorKind::Other,
            format!("cannot write {}: {e}", path.display()),
        )
    })
}

// Keeps the artifact inside the output directory.
fn sanitize_stem(stem: &str) -> String {
    let cleaned: String = stem
        .trim()
        .chars()
        .map(|c| {
            if c.is_control() || "<>:\"/\\|?*".contains(c) {
                '_'
            } else {
                c
            }
        })
        .collect();
    if cleaned.is_empty() || cleaned.chars().all(|c| c == '.') {
        "output".to_string()
    } else {
        cleaned
    }
}
