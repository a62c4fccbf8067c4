use fixity_core::{
    ChecksumAlgorithm, ChecksumLedger, ConsistencyStore, FixityError, LedgerBackend,
    LedgerBuilder, Replica, ReplicaType, Result,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Replica served by the local ledger.
    pub replica_id: String,
    pub replicas: Vec<ReplicaConfig>,
    pub ledger: LedgerConfig,
    #[serde(default)]
    pub consistency: Option<ConsistencyConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicaConfig {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default = "default_replica_type")]
    pub replica_type: ReplicaType,
}

fn default_replica_type() -> ReplicaType {
    ReplicaType::Bitarchive
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerConfig {
    #[serde(default)]
    pub backend: LedgerBackend,
    pub path: PathBuf,
    #[serde(default = "default_min_space_left")]
    pub min_space_left: u64,
    #[serde(default)]
    pub algorithm: ChecksumAlgorithm,
}

fn default_min_space_left() -> u64 {
    100 * 1024 * 1024
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsistencyConfig {
    pub database_path: PathBuf,
}

impl Config {
    pub fn from_file(path: &str) -> Result<Self> {
        let settings = ::config::Config::builder()
            .add_source(::config::File::with_name(path))
            .add_source(::config::Environment::with_prefix("FIXITY"))
            .build()
            .map_err(|e| FixityError::Config(e.to_string()))?;

        let config: Config = settings
            .try_deserialize()
            .map_err(|e| FixityError::Config(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let mut ids = HashSet::new();
        for replica in &self.replicas {
            if !ids.insert(replica.id.as_str()) {
                return Err(FixityError::Config(format!(
                    "replica '{}' is configured twice",
                    replica.id
                )));
            }
        }

        if !ids.contains(self.replica_id.as_str()) {
            return Err(FixityError::Config(format!(
                "replica_id '{}' not found in replicas",
                self.replica_id
            )));
        }

        Ok(())
    }

    pub fn topology(&self) -> Vec<Replica> {
        self.replicas
            .iter()
            .map(|replica| {
                Replica::new(
                    replica.id.clone(),
                    replica.name.clone().unwrap_or_else(|| replica.id.clone()),
                    replica.replica_type,
                )
            })
            .collect()
    }

    pub fn open_ledger(&self) -> Result<Arc<dyn ChecksumLedger>> {
        LedgerBuilder::new()
            .backend(self.ledger.backend)
            .path(&self.ledger.path)
            .replica_id(&self.replica_id)
            .min_space_left(self.ledger.min_space_left)
            .algorithm(self.ledger.algorithm)
            .build()
    }

    pub fn open_consistency_store(&self) -> Result<Arc<ConsistencyStore>> {
        let consistency = self.consistency.as_ref().ok_or_else(|| {
            FixityError::Config("consistency section is required for replica commands".to_string())
        })?;

        let store = ConsistencyStore::open(&consistency.database_path, self.topology())?;
        Ok(Arc::new(store))
    }
}
