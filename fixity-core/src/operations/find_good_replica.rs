use super::run_blocking;
use crate::consistency::{ConsistencyStore, Replica};
use crate::error::Result;
use std::sync::Arc;

#[derive(Clone)]
pub struct FindGoodReplicaOperation {
    store: Arc<ConsistencyStore>,
}

#[derive(Debug, Clone)]
pub struct FindGoodReplicaOperationRequest {
    pub filename: String,
    /// Usually the replica that needs repairing.
    pub exclude_replica: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FindGoodReplicaOperationOutcome {
    Found(Replica),
    NoneAvailable,
}

impl FindGoodReplicaOperation {
    pub fn new(store: Arc<ConsistencyStore>) -> Self {
        Self { store }
    }

    pub async fn run(
        &self,
        request: FindGoodReplicaOperationRequest,
    ) -> Result<FindGoodReplicaOperationOutcome> {
        let store = self.store.clone();

        run_blocking(move || {
            let FindGoodReplicaOperationRequest {
                filename,
                exclude_replica,
            } = request;

            match store.get_bitarchive_with_good_file(&filename, exclude_replica.as_deref())? {
                Some(replica) => Ok(FindGoodReplicaOperationOutcome::Found(replica)),
                None => {
                    tracing::warn!("No bitarchive holds a verified copy of '{}'", filename);
                    Ok(FindGoodReplicaOperationOutcome::NoneAvailable)
                }
            }
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksum::ChecksumEntry;

    #[tokio::test]
    async fn test_find_good_copy_elsewhere() {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = Arc::new(
            ConsistencyStore::open(
                temp_dir.path().join("consistency.db"),
                vec![
                    Replica::bitarchive("ONE"),
                    Replica::bitarchive("TWO"),
                    Replica::bitarchive("THREE"),
                ],
            )
            .unwrap(),
        );
        for (replica, checksum) in [("ONE", "bad"), ("TWO", "good"), ("THREE", "good")] {
            store
                .add_checksum_information(&[ChecksumEntry::new("a.warc", checksum)], replica)
                .unwrap();
        }
        store.update_checksum_status().unwrap();

        let operation = FindGoodReplicaOperation::new(store);
        let found = operation
            .run(FindGoodReplicaOperationRequest {
                filename: "a.warc".to_string(),
                exclude_replica: Some("TWO".to_string()),
            })
            .await
            .unwrap();
        assert_eq!(
            found,
            FindGoodReplicaOperationOutcome::Found(Replica::bitarchive("THREE"))
        );

        let unknown_file = operation
            .run(FindGoodReplicaOperationRequest {
                filename: "b.warc".to_string(),
                exclude_replica: None,
            })
            .await
            .unwrap();
        assert_eq!(unknown_file, FindGoodReplicaOperationOutcome::NoneAvailable);
    }
}
