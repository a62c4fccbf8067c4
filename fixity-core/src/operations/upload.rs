use super::{ensure_space, run_blocking};
use crate::error::{FixityError, Result};
use crate::ledger::ChecksumLedger;
use std::io::Read;
use std::sync::Arc;

#[derive(Clone)]
pub struct UploadOperation {
    ledger: Arc<dyn ChecksumLedger>,
}

pub struct UploadOperationRequest {
    pub filename: String,
    /// Archive file content, read once to compute the checksum.
    pub content: Box<dyn Read + Send>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadOperationResult {
    pub filename: String,
    pub checksum: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadOperationOutcome {
    Archived(UploadOperationResult),
    /// The same content was archived before.
    AlreadyArchived(UploadOperationResult),
}

impl UploadOperation {
    pub fn new(ledger: Arc<dyn ChecksumLedger>) -> Self {
        Self { ledger }
    }

    pub async fn run(&self, request: UploadOperationRequest) -> Result<UploadOperationOutcome> {
        let UploadOperationRequest {
            filename,
            mut content,
        } = request;
        let ledger = self.ledger.clone();

        run_blocking(move || {
            ensure_space(ledger.as_ref())?;

            let inserted = ledger.upload(&filename, &mut content)?;
            let checksum = ledger.get_checksum(&filename)?.ok_or_else(|| {
                FixityError::Internal(format!("'{}' missing from ledger after upload", filename))
            })?;

            let result = UploadOperationResult { filename, checksum };
            if inserted {
                tracing::info!("Archived checksum of '{}'", result.filename);
                Ok(UploadOperationOutcome::Archived(result))
            } else {
                Ok(UploadOperationOutcome::AlreadyArchived(result))
            }
        })
        .await
    }
}
