use std::path::PathBuf;
use std::process::ExitStatus;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Scheduler gate unavailable: {0}")]
    Gate(String),

    #[error("Could not access {}: {source}", path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("{} is corrupt: {reason}", path.display())]
    Corrupt { path: PathBuf, reason: String },

    #[error("No job with id {0} in the queue")]
    JobNotFound(u32),

    #[error("No job named {0} in the queue")]
    UnknownJobName(String),

    #[error("User {0} is not registered in the queue")]
    UnknownUser(String),

    #[error("User {0} still has jobs in the queue")]
    UserHasJobs(String),

    #[error("Requested {what} ({requested}) exceeds machine capacity ({available})")]
    CapacityExceeded {
        what: &'static str,
        requested: u32,
        available: u32,
    },

    #[error("{action} failed with {status}")]
    ActionFailed { action: String, status: ExitStatus },

    #[error("{0}")]
    InvalidRequest(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, QueueError>;
