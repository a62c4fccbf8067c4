//! Cross-replica consistency tracking
//!
//! One row per (file, replica) holding the reported checksum, upload
//! lifecycle state, presence in the latest file listing and the outcome of
//! the last checksum vote.

pub mod store;
pub mod vote;

pub use store::{ConsistencyStore, ReplicaSummary};
pub use vote::{VoteOutcome, vote};

use crate::error::{FixityError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplicaType {
    Bitarchive,
    Checksum,
}

impl ReplicaType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReplicaType::Bitarchive => "BITARCHIVE",
            ReplicaType::Checksum => "CHECKSUM",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Replica {
    pub id: String,
    pub name: String,
    pub replica_type: ReplicaType,
}

impl Replica {
    pub fn new(id: impl Into<String>, name: impl Into<String>, replica_type: ReplicaType) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            replica_type,
        }
    }

    pub fn bitarchive(id: impl Into<String>) -> Self {
        let id = id.into();
        Self::new(id.clone(), id, ReplicaType::Bitarchive)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UploadState {
    UploadStarted,
    DataUploaded,
    UploadCompleted,
    UploadFailed,
}

impl UploadState {
    pub fn as_str(&self) -> &'static str {
        match self {
            UploadState::UploadStarted => "UPLOAD_STARTED",
            UploadState::DataUploaded => "DATA_UPLOADED",
            UploadState::UploadCompleted => "UPLOAD_COMPLETED",
            UploadState::UploadFailed => "UPLOAD_FAILED",
        }
    }

    /// Whether the upload lifecycle allows moving from `from` to `to`.
    /// `None` is a row without any upload attempt.
    pub fn can_transition(from: Option<UploadState>, to: UploadState) -> bool {
        use UploadState::*;

        match (from, to) {
            (_, UploadFailed) => true,
            (None, UploadStarted) => true,
            (None, _) => false,
            (Some(UploadStarted), DataUploaded) => true,
            (Some(DataUploaded), UploadCompleted) => true,
            (Some(UploadFailed), UploadStarted) => true,
            (Some(current), next) => current == next,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChecksumStatus {
    #[default]
    Unknown,
    Ok,
    Corrupt,
}

impl ChecksumStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChecksumStatus::Unknown => "UNKNOWN",
            ChecksumStatus::Ok => "OK",
            ChecksumStatus::Corrupt => "CORRUPT",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FileListStatus {
    #[default]
    NoFilelistStatus,
    Ok,
    Missing,
}

impl FileListStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileListStatus::NoFilelistStatus => "NO_FILELIST_STATUS",
            FileListStatus::Ok => "OK",
            FileListStatus::Missing => "MISSING",
        }
    }
}

macro_rules! impl_status_text {
    ($ty:ident { $($variant:ident),+ $(,)? }) => {
        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $ty {
            type Err = FixityError;

            fn from_str(value: &str) -> Result<Self> {
                $(
                    if value.eq_ignore_ascii_case($ty::$variant.as_str()) {
                        return Ok($ty::$variant);
                    }
                )+
                Err(FixityError::InvalidRequest(format!(
                    "unknown {}: {}",
                    stringify!($ty),
                    value
                )))
            }
        }
    };
}

impl_status_text!(ReplicaType { Bitarchive, Checksum });
impl_status_text!(UploadState {
    UploadStarted,
    DataUploaded,
    UploadCompleted,
    UploadFailed,
});
impl_status_text!(ChecksumStatus { Unknown, Ok, Corrupt });
impl_status_text!(FileListStatus {
    NoFilelistStatus,
    Ok,
    Missing,
});

/// State of one file on one replica.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaFileInfo {
    pub filename: String,
    pub replica_id: String,
    /// Last reported checksum, the one that takes part in votes.
    pub checksum: Option<String>,
    /// Checksum fixed when the upload last reached UPLOAD_COMPLETED.
    pub completed_checksum: Option<String>,
    pub upload_state: Option<UploadState>,
    pub checksum_status: ChecksumStatus,
    pub filelist_status: FileListStatus,
    pub last_checksum_update: Option<DateTime<Utc>>,
    pub last_filelist_update: Option<DateTime<Utc>>,
}
