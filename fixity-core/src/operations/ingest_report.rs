use super::run_blocking;
use crate::consistency::ConsistencyStore;
use crate::error::Result;
use crate::ingest::{IngestSummary, ReportKind, ingest_checksum_report, ingest_filelist_report};
use bytes::Bytes;
use std::io::Cursor;
use std::sync::Arc;

/// Feeds a batch-job report for one replica into the consistency store.
#[derive(Clone)]
pub struct IngestReportOperation {
    store: Arc<ConsistencyStore>,
}

#[derive(Debug, Clone)]
pub struct IngestReportOperationRequest {
    pub replica_id: String,
    pub kind: ReportKind,
    pub body: Bytes,
}

#[derive(Debug, Clone)]
pub struct IngestReportOperationResult {
    pub replica_id: String,
    pub kind: ReportKind,
    pub summary: IngestSummary,
}

impl IngestReportOperation {
    pub fn new(store: Arc<ConsistencyStore>) -> Self {
        Self { store }
    }

    pub async fn run(
        &self,
        request: IngestReportOperationRequest,
    ) -> Result<IngestReportOperationResult> {
        let IngestReportOperationRequest {
            replica_id,
            kind,
            body,
        } = request;
        let store = self.store.clone();

        run_blocking(move || {
            let reader = Cursor::new(body);
            let summary = match kind {
                ReportKind::Checksum => ingest_checksum_report(&store, reader, &replica_id)?,
                ReportKind::Filelist => ingest_filelist_report(&store, reader, &replica_id)?,
            };

            tracing::info!(
                "Ingested {:?} report for replica {}: {} accepted, {} skipped, {} duplicates, {} conflicts",
                kind,
                replica_id,
                summary.accepted,
                summary.skipped,
                summary.duplicates,
                summary.conflicts
            );

            Ok(IngestReportOperationResult {
                replica_id,
                kind,
                summary,
            })
        })
        .await
    }
}
