//! Blob metadata and maintenance reports

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::BlobId;

/// A blob row without its content
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobInfo {
    pub id: BlobId,
    /// Hex SHA-256 of the exact stored bytes
    pub sha256: String,
    /// Tombstone time
    pub deleted: Option<DateTime<Utc>>,
    /// Stored size; `None` once garbage collection erased the content
    pub size: Option<i64>,
}

impl BlobInfo {
    pub fn is_erased(&self) -> bool {
        self.size.is_none()
    }
}

/// Outcome of a garbage collection run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GcStats {
    /// Tombstoned blobs past the grace interval that were looked at
    pub examined: usize,
    /// Blobs whose content was erased
    pub erased: usize,
    /// Blobs left alone because a live message still references them
    pub referenced: usize,
    /// The run stopped early on request
    pub cancelled: bool,
}

/// Outcome of tombstoning the content of expunged messages
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepStats {
    pub tombstoned: usize,
}
