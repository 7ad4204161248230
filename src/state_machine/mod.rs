mod job;
mod state;

pub use job::{
    Attempt, AttemptOutcome, GenerationPayload, JobOutcome, JobRecord, JobRun, MediaType,
};
pub use state::{JobState, StateMachine, Transition};
