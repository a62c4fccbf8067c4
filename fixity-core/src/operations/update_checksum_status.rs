use super::run_blocking;
use crate::consistency::ConsistencyStore;
use crate::error::Result;
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Clone)]
pub struct UpdateChecksumStatusOperation {
    store: Arc<ConsistencyStore>,
}

#[derive(Debug, Clone, Default)]
pub struct UpdateChecksumStatusOperationRequest {
    /// Vote only this file instead of every file with a reported checksum.
    pub filename: Option<String>,
}

#[derive(Debug, Clone)]
pub struct UpdateChecksumStatusOperationResult {
    pub files_voted: usize,
    /// Number of CORRUPT rows per replica after the vote.
    pub wrong_files: BTreeMap<String, u64>,
}

impl UpdateChecksumStatusOperation {
    pub fn new(store: Arc<ConsistencyStore>) -> Self {
        Self { store }
    }

    pub async fn run(
        &self,
        request: UpdateChecksumStatusOperationRequest,
    ) -> Result<UpdateChecksumStatusOperationResult> {
        let store = self.store.clone();

        run_blocking(move || {
            let files_voted = match request.filename {
                Some(filename) => {
                    store.update_checksum_status_for_file(&filename)?;
                    1
                }
                None => store.update_checksum_status()?,
            };

            let mut wrong_files = BTreeMap::new();
            for replica in store.replicas() {
                wrong_files.insert(replica.id.clone(), store.number_of_wrong_files(&replica.id)?);
            }

            Ok(UpdateChecksumStatusOperationResult {
                files_voted,
                wrong_files,
            })
        })
        .await
    }
}
