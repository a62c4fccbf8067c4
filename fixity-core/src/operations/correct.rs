use super::{ensure_space, run_blocking};
use crate::error::Result;
use crate::ledger::{ChecksumLedger, RemovedEntryRecord};
use std::io::Read;
use std::sync::Arc;

#[derive(Clone)]
pub struct CorrectOperation {
    ledger: Arc<dyn ChecksumLedger>,
}

pub struct CorrectOperationRequest {
    pub filename: String,
    /// Content of the good copy the entry should describe.
    pub content: Box<dyn Read + Send>,
}

#[derive(Debug, Clone)]
pub struct CorrectOperationResult {
    pub removed: RemovedEntryRecord,
}

impl CorrectOperation {
    pub fn new(ledger: Arc<dyn ChecksumLedger>) -> Self {
        Self { ledger }
    }

    pub async fn run(&self, request: CorrectOperationRequest) -> Result<CorrectOperationResult> {
        let CorrectOperationRequest {
            filename,
            mut content,
        } = request;
        let ledger = self.ledger.clone();

        run_blocking(move || {
            // a correction rewrites the whole ledger
            ensure_space(ledger.as_ref())?;
            let removed = ledger.correct(&filename, &mut content)?;
            Ok(CorrectOperationResult { removed })
        })
        .await
    }
}
