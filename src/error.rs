use thiserror::Error;

use crate::submission::SubmissionStatus;

/// Operational errors of the judge, surfaced to callers of the scheduler
#[derive(Error, Debug)]
pub enum JudgeError {
    /// The queue is saturated; the caller should try again later
    #[error("submission queue is full ({capacity} waiting), try again")]
    Backpressure { capacity: usize },

    /// The problem or language setup makes judging impossible
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The same user resubmitted to a problem too soon
    #[error("resubmitted too soon, try again in {retry_after_ms} ms")]
    Cooldown { retry_after_ms: u64 },

    #[error("{0} not found")]
    NotFound(String),

    #[error("submission {id} is {status}")]
    InvalidState { id: u32, status: SubmissionStatus },

    #[error("sandbox unavailable: {0}")]
    SandboxUnavailable(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Failures of the sandbox infrastructure itself, never of the judged program
#[derive(Error, Debug)]
pub enum SandboxError {
    #[error("failed to spawn sandboxed process: {0}")]
    Spawn(String),

    #[error("sandbox I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type JudgeResult<T> = Result<T, JudgeError>;
