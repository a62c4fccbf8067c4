use super::{ChecksumLedger, FileLedger, SqliteLedger};
use crate::checksum::ChecksumAlgorithm;
use crate::error::{FixityError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LedgerBackend {
    #[default]
    File,
    Sqlite,
}

impl FromStr for LedgerBackend {
    type Err = FixityError;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "file" => Ok(LedgerBackend::File),
            "sqlite" => Ok(LedgerBackend::Sqlite),
            other => Err(FixityError::Config(format!(
                "unsupported ledger backend: {}",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct LedgerBuilder {
    backend: Option<LedgerBackend>,
    path: Option<PathBuf>,
    replica_id: Option<String>,
    min_space_left: u64,
    algorithm: ChecksumAlgorithm,
}

impl LedgerBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn backend(mut self, backend: LedgerBackend) -> Self {
        self.backend = Some(backend);
        self
    }

    pub fn path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn replica_id(mut self, replica_id: impl Into<String>) -> Self {
        self.replica_id = Some(replica_id.into());
        self
    }

    pub fn min_space_left(mut self, bytes: u64) -> Self {
        self.min_space_left = bytes;
        self
    }

    pub fn algorithm(mut self, algorithm: ChecksumAlgorithm) -> Self {
        self.algorithm = algorithm;
        self
    }

    fn resolve_replica_id(&self) -> Result<String> {
        let replica_id = self
            .replica_id
            .as_deref()
            .unwrap_or_default()
            .trim()
            .to_string();
        if replica_id.is_empty() {
            return Err(FixityError::Config(
                "ledger replica id cannot be empty".to_string(),
            ));
        }

        Ok(replica_id)
    }

    fn resolve_path(&self) -> Result<PathBuf> {
        match &self.path {
            Some(path) if !path.as_os_str().is_empty() => Ok(path.clone()),
            _ => Err(FixityError::Config(
                "ledger path cannot be empty".to_string(),
            )),
        }
    }

    pub fn build(&self) -> Result<Arc<dyn ChecksumLedger>> {
        let replica_id = self.resolve_replica_id()?;
        let path = self.resolve_path()?;

        match self.backend.unwrap_or_default() {
            LedgerBackend::File => {
                let ledger =
                    FileLedger::open(path, &replica_id, self.min_space_left, self.algorithm)?;
                tracing::info!(
                    "Opened file ledger {:?} for replica {}",
                    ledger.path(),
                    replica_id
                );
                Ok(Arc::new(ledger))
            }
            LedgerBackend::Sqlite => {
                let ledger = SqliteLedger::open(&path, self.min_space_left, self.algorithm)?;
                tracing::info!("Opened sqlite ledger {:?} for replica {}", path, replica_id);
                Ok(Arc::new(ledger))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_requires_replica_and_path() {
        let temp_dir = tempfile::tempdir().unwrap();

        let missing_replica = LedgerBuilder::new()
            .path(temp_dir.path().join("ledger.checksum"))
            .build();
        assert!(matches!(missing_replica, Err(FixityError::Config(_))));

        let missing_path = LedgerBuilder::new().replica_id("ONE").build();
        assert!(matches!(missing_path, Err(FixityError::Config(_))));
    }

    #[test]
    fn test_backends_share_contract() {
        let temp_dir = tempfile::tempdir().unwrap();

        for (backend, name) in [
            (LedgerBackend::File, "ledger.checksum"),
            (LedgerBackend::Sqlite, "ledger.db"),
        ] {
            let ledger = LedgerBuilder::new()
                .backend(backend)
                .path(temp_dir.path().join(name))
                .replica_id("ONE")
                .build()
                .unwrap();

            ledger.upload_checksum("a.warc", "aaa").unwrap();
            assert_eq!(ledger.get_checksum("a.warc").unwrap().as_deref(), Some("aaa"));
            assert!(!ledger.has_entry("b.warc").unwrap());
        }
    }

    #[test]
    fn test_backend_from_str() {
        assert_eq!("SQLite".parse::<LedgerBackend>().unwrap(), LedgerBackend::Sqlite);
        assert!("redis".parse::<LedgerBackend>().is_err());
    }
}
