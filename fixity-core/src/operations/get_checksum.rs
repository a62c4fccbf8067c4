use super::run_blocking;
use crate::error::Result;
use crate::ledger::ChecksumLedger;
use std::sync::Arc;

#[derive(Clone)]
pub struct GetChecksumOperation {
    ledger: Arc<dyn ChecksumLedger>,
}

#[derive(Debug, Clone)]
pub struct GetChecksumOperationRequest {
    pub filename: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetChecksumOperationResult {
    pub filename: String,
    pub checksum: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GetChecksumOperationOutcome {
    Found(GetChecksumOperationResult),
    NotFound,
}

impl GetChecksumOperation {
    pub fn new(ledger: Arc<dyn ChecksumLedger>) -> Self {
        Self { ledger }
    }

    pub async fn run(
        &self,
        request: GetChecksumOperationRequest,
    ) -> Result<GetChecksumOperationOutcome> {
        let ledger = self.ledger.clone();
        let filename = request.filename;

        run_blocking(move || match ledger.get_checksum(&filename)? {
            Some(checksum) => Ok(GetChecksumOperationOutcome::Found(
                GetChecksumOperationResult { filename, checksum },
            )),
            None => Ok(GetChecksumOperationOutcome::NotFound),
        })
        .await
    }
}
