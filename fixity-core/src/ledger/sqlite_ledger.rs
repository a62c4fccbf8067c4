use super::{ChecksumLedger, DeadEntry, RemovedEntryRecord, lines_to_bytes};
use crate::checksum::{ChecksumAlgorithm, ChecksumEntry, validate_checksum, validate_filename};
use crate::error::{FixityError, Result};
use bytes::Bytes;
use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Duration;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Ledger backed by a SQLite database. Writers are serialized by the
/// database, corrections run in a single transaction.
pub struct SqliteLedger {
    db_path: PathBuf,
    min_space_left: u64,
    algorithm: ChecksumAlgorithm,
}

impl SqliteLedger {
    pub fn open(
        db_path: impl Into<PathBuf>,
        min_space_left: u64,
        algorithm: ChecksumAlgorithm,
    ) -> Result<Self> {
        let db_path = db_path.into();
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let ledger = Self {
            db_path,
            min_space_left,
            algorithm,
        };
        ledger.init_schema()?;
        Ok(ledger)
    }

    fn get_conn(&self) -> Result<Connection> {
        let conn = Connection::open(&self.db_path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        Ok(conn)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.get_conn()?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS checksums (
                filename TEXT PRIMARY KEY,
                checksum TEXT NOT NULL,
                archived_at TEXT NOT NULL
            )",
            [],
        )?;

        // Append-only audit trail of superseded checksums
        conn.execute(
            "CREATE TABLE IF NOT EXISTS removed_checksums (
                pk INTEGER PRIMARY KEY AUTOINCREMENT,
                removed_at TEXT NOT NULL,
                filename TEXT NOT NULL,
                checksum TEXT NOT NULL
            )",
            [],
        )?;

        Ok(())
    }

    fn lookup(conn: &Connection, filename: &str) -> Result<Option<String>> {
        let checksum = conn
            .query_row(
                "SELECT checksum FROM checksums WHERE filename = ?1",
                [filename],
                |row| row.get(0),
            )
            .optional()?;
        Ok(checksum)
    }
}

impl ChecksumLedger for SqliteLedger {
    fn upload(&self, filename: &str, content: &mut dyn Read) -> Result<bool> {
        validate_filename(filename)?;
        let checksum = self.algorithm.compute(content)?;
        self.upload_checksum(filename, &checksum)
    }

    fn upload_checksum(&self, filename: &str, checksum: &str) -> Result<bool> {
        validate_filename(filename)?;
        validate_checksum(checksum)?;

        let mut conn = self.get_conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        if let Some(archived) = Self::lookup(&tx, filename)? {
            if archived == checksum {
                tracing::warn!(
                    "File '{}' is already archived with the same checksum '{}'",
                    filename,
                    archived
                );
                return Ok(false);
            }
            return Err(FixityError::InconsistentUpload {
                filename: filename.to_string(),
                archived,
                uploaded: checksum.to_string(),
            });
        }

        tx.execute(
            "INSERT INTO checksums (filename, checksum, archived_at) VALUES (?1, ?2, ?3)",
            params![filename, checksum, Utc::now().to_rfc3339()],
        )?;
        tx.commit()?;
        Ok(true)
    }

    fn correct(&self, filename: &str, replacement: &mut dyn Read) -> Result<RemovedEntryRecord> {
        validate_filename(filename)?;
        let new_checksum = self.algorithm.compute(replacement)?;

        let mut conn = self.get_conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let current = Self::lookup(&tx, filename)?
            .ok_or_else(|| FixityError::NotFound(filename.to_string()))?;
        if current == new_checksum {
            return Err(FixityError::NoOpCorrection {
                filename: filename.to_string(),
                checksum: current,
            });
        }

        let corrected_at = Utc::now();
        tx.execute(
            "INSERT INTO removed_checksums (removed_at, filename, checksum) VALUES (?1, ?2, ?3)",
            params![corrected_at.to_rfc3339(), filename, current],
        )?;
        tx.execute(
            "UPDATE checksums SET checksum = ?1, archived_at = ?2 WHERE filename = ?3",
            params![new_checksum, corrected_at.to_rfc3339(), filename],
        )?;
        tx.commit()?;

        tracing::info!(
            "Corrected checksum of '{}' from '{}' to '{}'",
            filename,
            current,
            new_checksum
        );

        Ok(RemovedEntryRecord {
            filename: filename.to_string(),
            checksum: current,
            replacement_checksum: new_checksum,
            corrected_at,
        })
    }

    fn get_checksum(&self, filename: &str) -> Result<Option<String>> {
        validate_filename(filename)?;
        let conn = self.get_conn()?;
        Self::lookup(&conn, filename)
    }

    fn export_ledger(&self) -> Result<Bytes> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare("SELECT filename, checksum FROM checksums ORDER BY filename")?;
        let rows = stmt.query_map([], |row| {
            Ok(ChecksumEntry::new(
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
            ))
        })?;

        let mut lines = Vec::new();
        for row in rows {
            lines.push(row?.to_line());
        }
        Ok(lines_to_bytes(lines))
    }

    fn export_filenames(&self) -> Result<Bytes> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare("SELECT filename FROM checksums ORDER BY filename")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;

        let mut names = Vec::new();
        for row in rows {
            names.push(row?);
        }
        Ok(lines_to_bytes(names))
    }

    fn has_enough_space(&self) -> bool {
        let dir = self.db_path.parent().unwrap_or_else(|| Path::new("."));
        let writable = std::fs::metadata(dir)
            .map(|meta| meta.is_dir() && !meta.permissions().readonly())
            .unwrap_or(false);
        if !writable {
            tracing::warn!("The directory {:?} is not a writable directory", dir);
            return false;
        }

        match fs2::available_space(dir) {
            Ok(free) => free > self.min_space_left,
            Err(error) => {
                tracing::warn!("Cannot determine free space of {:?}: {}", dir, error);
                false
            }
        }
    }

    fn dead_entries(&self) -> Result<Vec<DeadEntry>> {
        let conn = self.get_conn()?;
        let mut stmt = conn
            .prepare("SELECT removed_at, filename, checksum FROM removed_checksums ORDER BY pk")?;
        let rows = stmt.query_map([], |row| {
            Ok(DeadEntry {
                timestamp: row.get(0)?,
                filename: row.get(1)?,
                superseded_checksum: row.get(2)?,
            })
        })?;

        let mut entries = Vec::new();
        for row in rows {
            entries.push(row?);
        }
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn sha(data: &[u8]) -> String {
        ChecksumAlgorithm::Sha256.compute_bytes(data)
    }

    #[test]
    fn test_upload_and_correct() {
        let temp_dir = tempfile::tempdir().unwrap();
        let ledger = SqliteLedger::open(
            temp_dir.path().join("checksum.db"),
            0,
            ChecksumAlgorithm::Sha256,
        )
        .unwrap();

        assert!(ledger.upload("a.warc", &mut Cursor::new(b"v1")).unwrap());
        assert!(!ledger.upload("a.warc", &mut Cursor::new(b"v1")).unwrap());
        assert!(matches!(
            ledger.upload("a.warc", &mut Cursor::new(b"v2")),
            Err(FixityError::InconsistentUpload { .. })
        ));

        let removed = ledger.correct("a.warc", &mut Cursor::new(b"v2")).unwrap();
        assert_eq!(removed.checksum, sha(b"v1"));
        assert_eq!(ledger.get_checksum("a.warc").unwrap(), Some(sha(b"v2")));
        assert!(matches!(
            ledger.correct("a.warc", &mut Cursor::new(b"v2")),
            Err(FixityError::NoOpCorrection { .. })
        ));
        assert!(matches!(
            ledger.correct("b.warc", &mut Cursor::new(b"v2")),
            Err(FixityError::NotFound(_))
        ));

        let dead = ledger.dead_entries().unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].superseded_checksum, sha(b"v1"));
    }

    #[test]
    fn test_exports_survive_reopen() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("checksum.db");
        {
            let ledger = SqliteLedger::open(&path, 0, ChecksumAlgorithm::Md5).unwrap();
            ledger.upload_checksum("b.warc", "bbb").unwrap();
            ledger.upload_checksum("a.warc", "aaa").unwrap();
        }

        let ledger = SqliteLedger::open(&path, 0, ChecksumAlgorithm::Md5).unwrap();
        assert_eq!(
            ledger.export_ledger().unwrap(),
            Bytes::from("a.warc##aaa\nb.warc##bbb\n")
        );
        assert_eq!(
            ledger.export_filenames().unwrap(),
            Bytes::from("a.warc\nb.warc\n")
        );
        assert!(ledger.has_entry("a.warc").unwrap());
        assert!(ledger.has_enough_space());
    }
}
