pub mod http;

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use crate::error::ExecutionError;
use crate::state_machine::JobRecord;

pub use http::HttpExecutor;

/// What a successful generation call produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationResult {
    pub output_path: PathBuf,
    pub file_size_bytes: Option<u64>,
}

/// Performs the actual generation call for one job.
///
/// The returned future must be cancel-safe: the orchestrator drops it when
/// the batch is interrupted, and that must abandon the call cleanly. Per-call
/// timeouts are the executor's responsibility.
pub trait Executor: Send + Sync {
    fn execute(
        &self,
        job: &JobRecord,
    ) -> impl Future<Output = Result<GenerationResult, ExecutionError>> + Send;
}

impl<E: Executor> Executor for Arc<E> {
    fn execute(
        &self,
        job: &JobRecord,
    ) -> impl Future<Output = Result<GenerationResult, ExecutionError>> + Send {
        (**self).execute(job)
    }
}
