//! Fixity Core - checksum-based replica consistency for archive storage
//!
//! - Per-replica checksum ledgers with crash-safe correction
//! - A SQLite consistency store that votes on reported checksums
//! - Ingestion of batch-job checksum and file list reports
//! - Async operation objects for message handlers

pub mod checksum;
pub mod consistency;
pub mod error;
pub mod ingest;
pub mod ledger;
pub mod operations;

pub use checksum::{CHECKSUM_SEPARATOR, ChecksumAlgorithm, ChecksumEntry};
pub use consistency::{
    ChecksumStatus, ConsistencyStore, FileListStatus, Replica, ReplicaFileInfo, ReplicaSummary,
    ReplicaType, UploadState, VoteOutcome,
};
pub use error::{FixityError, Result};
pub use ingest::{IngestSummary, ReportKind};
pub use ledger::{
    ChecksumLedger, DeadEntry, FileLedger, LedgerBackend, LedgerBuilder, RemovedEntryRecord,
    SqliteLedger,
};
