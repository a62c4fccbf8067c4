pub mod correct;
pub mod export_ledger;
pub mod find_good_replica;
pub mod get_checksum;
pub mod ingest_report;
pub mod update_checksum_status;
pub mod upload;

pub use correct::{CorrectOperation, CorrectOperationRequest, CorrectOperationResult};
pub use export_ledger::{
    ExportKind, ExportLedgerOperation, ExportLedgerOperationRequest, ExportLedgerOperationResult,
};
pub use find_good_replica::{
    FindGoodReplicaOperation, FindGoodReplicaOperationOutcome, FindGoodReplicaOperationRequest,
};
pub use get_checksum::{
    GetChecksumOperation, GetChecksumOperationOutcome, GetChecksumOperationRequest,
    GetChecksumOperationResult,
};
pub use ingest_report::{
    IngestReportOperation, IngestReportOperationRequest, IngestReportOperationResult,
};
pub use update_checksum_status::{
    UpdateChecksumStatusOperation, UpdateChecksumStatusOperationRequest,
    UpdateChecksumStatusOperationResult,
};
pub use upload::{
    UploadOperation, UploadOperationOutcome, UploadOperationRequest, UploadOperationResult,
};

use crate::error::{FixityError, Result};
use crate::ledger::ChecksumLedger;

/// Run a blocking store call on the blocking thread pool.
pub(crate) async fn run_blocking<T, F>(task: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(task)
        .await
        .map_err(|e| FixityError::Internal(format!("blocking task failed: {}", e)))?
}

pub(crate) fn ensure_space(ledger: &dyn ChecksumLedger) -> Result<()> {
    if !ledger.has_enough_space() {
        return Err(FixityError::InsufficientSpace(
            "not enough free space left for the checksum ledger".to_string(),
        ));
    }
    Ok(())
}
