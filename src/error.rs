use crate::download::DownloadId;
use thiserror::Error;

/// Failures of a single [`Download`](crate::download::Download) engine.
///
/// Cancellation is not represented here: a stopped engine reports it through
/// the `stopped` event instead.
#[derive(Error, Debug)]
pub enum DownloadError {
    #[error("download {0} has already been started")]
    AlreadyStarted(DownloadId),

    #[error("download {id} stream failed: {message}")]
    Stream { id: DownloadId, message: String },
}

#[derive(Error, Debug)]
pub enum RegistryError {
    /// A second engine was requested for an identifier that is still active.
    #[error("download {0} is already active")]
    AlreadyActive(DownloadId),

    #[error("{op} failed: {source}")]
    Transport {
        op: &'static str,
        #[source]
        source: reqwest::Error,
    },

    #[error("{op} rejected by server with status {status}")]
    Rejected {
        op: &'static str,
        status: reqwest::StatusCode,
    },

    #[error("{op} returned an unreadable body: {source}")]
    Decode {
        op: &'static str,
        #[source]
        source: reqwest::Error,
    },

    #[error("{op} was cancelled")]
    Cancelled { op: &'static str },

    #[error("invalid url: {0}")]
    Url(String),
}

#[derive(Error, Debug)]
pub enum HistoryError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("name is too long ({0} characters, max 255)")]
    NameTooLong(usize),

    #[error("invalid status: {0}")]
    InvalidStatus(String),

    #[error("invalid id: {0}")]
    InvalidId(String),

    #[error("failed to prepare database directory: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T, E = RegistryError> = std::result::Result<T, E>;
