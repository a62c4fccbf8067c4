use super::run_blocking;
use crate::error::Result;
use crate::ledger::ChecksumLedger;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportKind {
    #[default]
    Checksums,
    Filenames,
}

#[derive(Clone)]
pub struct ExportLedgerOperation {
    ledger: Arc<dyn ChecksumLedger>,
}

#[derive(Debug, Clone, Default)]
pub struct ExportLedgerOperationRequest {
    pub kind: ExportKind,
}

#[derive(Debug, Clone)]
pub struct ExportLedgerOperationResult {
    pub kind: ExportKind,
    pub body: Bytes,
    pub entries: usize,
}

impl ExportLedgerOperation {
    pub fn new(ledger: Arc<dyn ChecksumLedger>) -> Self {
        Self { ledger }
    }

    pub async fn run(
        &self,
        request: ExportLedgerOperationRequest,
    ) -> Result<ExportLedgerOperationResult> {
        let ledger = self.ledger.clone();
        let kind = request.kind;

        run_blocking(move || {
            let body = match kind {
                ExportKind::Checksums => ledger.export_ledger()?,
                ExportKind::Filenames => ledger.export_filenames()?,
            };
            let entries = body.iter().filter(|byte| **byte == b'\n').count();
            Ok(ExportLedgerOperationResult {
                kind,
                body,
                entries,
            })
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksum::ChecksumAlgorithm;
    use crate::ledger::FileLedger;

    #[tokio::test]
    async fn test_export_both_kinds() {
        let temp_dir = tempfile::tempdir().unwrap();
        let ledger = FileLedger::open(
            temp_dir.path().join("ONE.checksum"),
            "ONE",
            0,
            ChecksumAlgorithm::Md5,
        )
        .unwrap();
        ledger.upload_checksum("b.warc", "bbb").unwrap();
        ledger.upload_checksum("a.warc", "aaa").unwrap();
        let operation = ExportLedgerOperation::new(Arc::new(ledger));

        let checksums = operation
            .run(ExportLedgerOperationRequest::default())
            .await
            .unwrap();
        assert_eq!(checksums.entries, 2);
        assert_eq!(checksums.body, Bytes::from("a.warc##aaa\nb.warc##bbb\n"));

        let filenames = operation
            .run(ExportLedgerOperationRequest {
                kind: ExportKind::Filenames,
            })
            .await
            .unwrap();
        assert_eq!(filenames.body, Bytes::from("a.warc\nb.warc\n"));
    }
}
