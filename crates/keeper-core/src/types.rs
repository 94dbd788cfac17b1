use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// A named blob in the local vault namespace.
///
/// `path` is always `root.join(name)`; it is derived on listing, never stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct File {
    pub name: String,
    pub size: u64,
    pub path: PathBuf,
}

impl File {
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>, size: u64) -> Self {
        Self {
            name: name.into(),
            size,
            path: path.into(),
        }
    }
}

/// One row of the remote `/uploads` listing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteRow {
    pub uuid: String,
    pub name: String,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub size: i64,
    #[serde(default)]
    pub content_type: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pagination {
    pub size: u32,
    pub page: u32,
    pub total: u32,
}

/// Response body of `GET /uploads`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UploadsPage {
    #[serde(default)]
    pub pagination: Pagination,
    #[serde(default)]
    pub rows: Vec<RemoteRow>,
}

/// Boundary up to which remote changes have been reconciled for one owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncCheckpoint {
    pub owner: String,
    pub last_sync: DateTime<Utc>,
}

impl SyncCheckpoint {
    pub fn new(owner: impl Into<String>, last_sync: DateTime<Utc>) -> Self {
        Self {
            owner: owner.into(),
            last_sync,
        }
    }

    /// Checkpoint for an owner that has never synced.
    pub fn beginning_of_time(owner: impl Into<String>) -> Self {
        Self::new(owner, DateTime::<Utc>::UNIX_EPOCH)
    }

    /// Parse the stored representation (RFC 3339, or a bare `YYYY-MM-DD` date).
    pub fn parse(owner: impl Into<String>, stored: &str) -> Option<Self> {
        let stored = stored.trim();
        let last_sync = DateTime::parse_from_rfc3339(stored)
            .map(|t| t.with_timezone(&Utc))
            .ok()
            .or_else(|| {
                NaiveDate::parse_from_str(stored, "%Y-%m-%d")
                    .ok()
                    .and_then(|d| d.and_hms_opt(0, 0, 0))
                    .map(|dt| dt.and_utc())
            })?;
        Some(Self::new(owner, last_sync))
    }

    /// Stored representation: RFC 3339 UTC with second precision.
    pub fn encode(&self) -> String {
        self.last_sync.to_rfc3339_opts(SecondsFormat::Secs, true)
    }

    /// Calendar date used for the remote `uploaded_at` filter.
    pub fn query_date(&self) -> String {
        self.last_sync.format("%Y-%m-%d").to_string()
    }
}
