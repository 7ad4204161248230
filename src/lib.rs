//! Resumable, rate-limited batch runner for generation jobs.
//!
//! Jobs are streamed from an input source, admitted through a token bucket
//! and a concurrency bound, executed with retries, and every terminal
//! outcome is appended to a checkpoint so an interrupted batch can resume
//! where it left off.

pub mod checkpoint;
pub mod concurrency;
pub mod config;
pub mod error;
pub mod executor;
pub mod input;
pub mod orchestrator;
pub mod ratelimit;
pub mod retry;
pub mod state_machine;
pub mod summary;
pub mod ui;

pub use checkpoint::{CheckpointEntry, CheckpointStatus, CheckpointStore};
pub use error::{BatchError, ErrorKind, ExecutionError};
pub use executor::{Executor, GenerationResult, HttpExecutor};
pub use orchestrator::{BatchObserver, BatchOrchestrator, BatchSettings};
pub use summary::BatchSummary;
