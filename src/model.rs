//! Wire types shared by the server and the registry client.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::download::DownloadId;
use crate::error::HistoryError;

/// Header carrying the client-generated key that makes recording calls safe
/// to retry.
pub const IDEMPOTENCY_HEADER: &str = "idempotency-key";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DownloadStatus {
    Pending,
    Complete,
    Canceled,
    Failed,
}

impl DownloadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DownloadStatus::Pending => "pending",
            DownloadStatus::Complete => "complete",
            DownloadStatus::Canceled => "canceled",
            DownloadStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for DownloadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DownloadStatus {
    type Err = HistoryError;

    /// `true` is accepted as an alias for `complete`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(DownloadStatus::Pending),
            "complete" | "true" => Ok(DownloadStatus::Complete),
            "canceled" => Ok(DownloadStatus::Canceled),
            "failed" => Ok(DownloadStatus::Failed),
            other => Err(HistoryError::InvalidStatus(other.to_string())),
        }
    }
}

/// One row of the download log. `name` is always a basename.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub id: DownloadId,
    pub name: String,
    pub status: DownloadStatus,
}

/// Response of `request-file`: the new row's id plus the refreshed log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordedDownload {
    pub ndx: DownloadId,
    pub downloads: Vec<HistoryRecord>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    pub name: String,
    pub path: String,
    pub size: u64,
    /// Seconds since the Unix epoch.
    pub modified: u64,
}
