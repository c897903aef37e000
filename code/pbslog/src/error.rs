// Everything that can go wrong in a collection cycle or a stats query.  All of these are fatal to
// the operation that hit them, except `Backup`, which the collector logs and swallows.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum MonitorError {
    #[error("Scheduler command `{command}` failed: {reason}")]
    ExternalCommand { command: String, reason: String },

    #[error("Malformed {what} snapshot: {reason}")]
    MalformedSnapshot { what: &'static str, reason: String },

    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Previous cycle still in progress: {0} is locked")]
    LockContention(String),

    #[error("Invalid argument: {0}")]
    ArgumentValidation(String),

    #[error("Backup to {path} failed: {source}")]
    Backup {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

impl From<rusqlite::Error> for MonitorError {
    fn from(e: rusqlite::Error) -> Self {
        MonitorError::StoreUnavailable(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, MonitorError>;
