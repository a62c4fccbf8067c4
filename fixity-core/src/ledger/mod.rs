//! Per-replica checksum ledgers
//!
//! A ledger is the authoritative filename -> checksum table of one replica.
//! Two backends implement the same [`ChecksumLedger`] contract:
//! - [`FileLedger`]: a plain `filename##checksum` file with append-only uploads
//!   and an atomic rewrite after corrections
//! - [`SqliteLedger`]: a transactional SQLite table

pub mod factory;
pub mod file_ledger;
pub mod sqlite_ledger;

pub use factory::{LedgerBackend, LedgerBuilder};
pub use file_ledger::FileLedger;
pub use sqlite_ledger::SqliteLedger;

use crate::checksum::{CHECKSUM_SEPARATOR, ChecksumEntry};
use crate::error::Result;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::Read;
use std::path::Path;

pub trait ChecksumLedger: Send + Sync {
    /// Archive the checksum of `content` under `filename`.
    ///
    /// Returns `true` when a new entry was stored. Re-uploading identical
    /// content is a no-op returning `false`. Uploading different content
    /// under a known filename fails with `InconsistentUpload`.
    fn upload(&self, filename: &str, content: &mut dyn Read) -> Result<bool>;

    /// Same contract as [`ChecksumLedger::upload`] with a precomputed checksum.
    fn upload_checksum(&self, filename: &str, checksum: &str) -> Result<bool>;

    /// Replace the checksum of an existing entry with the checksum of
    /// `replacement`, recording the superseded value in the dead-letter log.
    fn correct(&self, filename: &str, replacement: &mut dyn Read) -> Result<RemovedEntryRecord>;

    fn get_checksum(&self, filename: &str) -> Result<Option<String>>;

    fn has_entry(&self, filename: &str) -> Result<bool> {
        Ok(self.get_checksum(filename)?.is_some())
    }

    /// All entries as `filename##checksum` lines.
    fn export_ledger(&self) -> Result<Bytes>;

    /// All filenames, one per line.
    fn export_filenames(&self) -> Result<Bytes>;

    fn has_enough_space(&self) -> bool;

    fn dead_entries(&self) -> Result<Vec<DeadEntry>>;
}

/// A superseded ledger line, kept for auditing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadEntry {
    pub timestamp: String,
    pub filename: String,
    pub superseded_checksum: String,
}

impl DeadEntry {
    pub fn new(filename: &str, superseded_checksum: &str, at: DateTime<Utc>) -> Self {
        Self {
            timestamp: at.to_rfc3339(),
            filename: filename.to_string(),
            superseded_checksum: superseded_checksum.to_string(),
        }
    }

    pub fn to_line(&self) -> String {
        format!(
            "{} : {}{}{}",
            self.timestamp, self.filename, CHECKSUM_SEPARATOR, self.superseded_checksum
        )
    }

    /// Quarantined raw lines do not split into filename and checksum; they
    /// come back with the whole line as the filename and an empty checksum.
    pub fn parse_line(line: &str) -> Option<Self> {
        let (timestamp, record) = line.split_once(" : ")?;
        match ChecksumEntry::parse_line(record) {
            Some(entry) => Some(Self {
                timestamp: timestamp.to_string(),
                filename: entry.filename,
                superseded_checksum: entry.checksum,
            }),
            None => Some(Self {
                timestamp: timestamp.to_string(),
                filename: record.to_string(),
                superseded_checksum: String::new(),
            }),
        }
    }
}

/// Returned from a correction so the caller can forward the removed pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemovedEntryRecord {
    pub filename: String,
    pub checksum: String,
    pub replacement_checksum: String,
    pub corrected_at: DateTime<Utc>,
}

impl RemovedEntryRecord {
    /// The removed pair in ledger line format.
    pub fn to_line(&self) -> String {
        format!("{}{}{}", self.filename, CHECKSUM_SEPARATOR, self.checksum)
    }
}

/// Name of the dead-letter file kept next to a replica's ledger.
pub fn dead_letter_filename(replica_id: &str) -> String {
    format!("removed_{}.checksum", replica_id)
}

pub(crate) fn read_dead_letter_file(path: &Path) -> Result<Vec<DeadEntry>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let content = std::fs::read_to_string(path)?;
    Ok(content
        .lines()
        .filter(|line| !line.trim().is_empty())
        .filter_map(DeadEntry::parse_line)
        .collect())
}

pub(crate) fn lines_to_bytes<I, S>(lines: I) -> Bytes
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut out = String::new();
    for line in lines {
        out.push_str(line.as_ref());
        out.push('\n');
    }
    Bytes::from(out)
}
