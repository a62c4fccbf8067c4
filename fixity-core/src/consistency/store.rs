use super::vote::{VoteOutcome, vote};
use super::{ChecksumStatus, FileListStatus, Replica, ReplicaFileInfo, ReplicaType, UploadState};
use crate::checksum::{ChecksumEntry, validate_checksum, validate_filename};
use crate::error::{FixityError, Result};
use chrono::{DateTime, Utc};
use rusqlite::{
    Connection, OptionalExtension, Params, Row, Transaction, TransactionBehavior, params,
};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::time::Duration;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const INFO_COLUMNS: &str = "filename, replica_id, checksum, completed_checksum, upload_state, \
     checksum_status, filelist_status, checksum_checkdatetime, filelist_checkdatetime";

type RawInfoRow = (
    String,
    String,
    Option<String>,
    Option<String>,
    Option<String>,
    String,
    String,
    Option<String>,
    Option<String>,
);

/// Per-replica counters shown by status reports.
#[derive(Debug, Clone, Serialize)]
pub struct ReplicaSummary {
    pub replica: Replica,
    pub number_of_files: u64,
    pub missing_files: u64,
    pub wrong_files: u64,
    pub last_filelist_update: Option<DateTime<Utc>>,
    pub last_checksum_update: Option<DateTime<Utc>>,
}

/// SQLite-backed table of (file, replica) states for a fixed topology.
pub struct ConsistencyStore {
    db_path: PathBuf,
    replicas: Vec<Replica>,
}

impl ConsistencyStore {
    pub fn open(db_path: impl Into<PathBuf>, replicas: Vec<Replica>) -> Result<Self> {
        if replicas.is_empty() {
            return Err(FixityError::Config(
                "consistency store needs at least one replica".to_string(),
            ));
        }
        let mut ids = HashSet::new();
        for replica in &replicas {
            if replica.id.trim().is_empty() {
                return Err(FixityError::Config("replica id cannot be empty".to_string()));
            }
            if !ids.insert(replica.id.as_str()) {
                return Err(FixityError::Config(format!(
                    "duplicate replica id: {}",
                    replica.id
                )));
            }
        }

        let db_path = db_path.into();
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let store = Self { db_path, replicas };
        store.init_schema()?;
        store.register_replicas()?;
        Ok(store)
    }

    fn get_conn(&self) -> Result<Connection> {
        let conn = Connection::open(&self.db_path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        Ok(conn)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.get_conn()?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS replica (
                replica_id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                replica_type TEXT NOT NULL,
                checksum_updated TEXT,
                filelist_updated TEXT
            )",
            [],
        )?;

        // upload_checksum holds a pending upload registration
        conn.execute(
            "CREATE TABLE IF NOT EXISTS file (
                file_id INTEGER PRIMARY KEY AUTOINCREMENT,
                filename TEXT NOT NULL UNIQUE,
                upload_checksum TEXT
            )",
            [],
        )?;

        // checksum is the last reported value, completed_checksum the one
        // fixed when the upload completed
        conn.execute(
            "CREATE TABLE IF NOT EXISTS replicafileinfo (
                filename TEXT NOT NULL,
                replica_id TEXT NOT NULL,
                checksum TEXT,
                completed_checksum TEXT,
                upload_state TEXT,
                checksum_status TEXT NOT NULL DEFAULT 'UNKNOWN',
                filelist_status TEXT NOT NULL DEFAULT 'NO_FILELIST_STATUS',
                checksum_checkdatetime TEXT,
                filelist_checkdatetime TEXT,
                PRIMARY KEY (filename, replica_id),
                FOREIGN KEY (filename) REFERENCES file(filename),
                FOREIGN KEY (replica_id) REFERENCES replica(replica_id)
            )",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_replicafileinfo_replica
             ON replicafileinfo(replica_id, filelist_status, checksum_status)",
            [],
        )?;

        Ok(())
    }

    fn register_replicas(&self) -> Result<()> {
        let mut conn = self.get_conn()?;
        let tx = write_tx(&mut conn)?;
        for replica in &self.replicas {
            tx.execute(
                "INSERT INTO replica (replica_id, name, replica_type) VALUES (?1, ?2, ?3)
                 ON CONFLICT(replica_id) DO UPDATE SET
                    name = excluded.name,
                    replica_type = excluded.replica_type",
                params![replica.id, replica.name, replica.replica_type.as_str()],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn replicas(&self) -> &[Replica] {
        &self.replicas
    }

    pub fn replica(&self, replica_id: &str) -> Result<&Replica> {
        self.replicas
            .iter()
            .find(|replica| replica.id == replica_id)
            .ok_or_else(|| FixityError::UnknownReplica(replica_id.to_string()))
    }

    /// Record a replica's full checksum report. Reported files are present on
    /// the replica and a changed checksum invalidates the previous vote
    /// result. Files of the replica absent from the report become MISSING.
    pub fn add_checksum_information(&self, entries: &[ChecksumEntry], replica_id: &str) -> Result<()> {
        self.replica(replica_id)?;
        for entry in entries {
            validate_filename(&entry.filename)?;
            validate_checksum(&entry.checksum)?;
        }

        tracing::info!(
            "Ingesting {} checksum entries for replica {}",
            entries.len(),
            replica_id
        );

        let now = Utc::now().to_rfc3339();
        let mut seen: HashMap<&str, &str> = HashMap::new();
        let mut conn = self.get_conn()?;
        let tx = write_tx(&mut conn)?;

        for entry in entries {
            if let Some(first) = seen.get(entry.filename.as_str()) {
                if *first != entry.checksum {
                    tracing::warn!(
                        "Replica {} reported '{}' twice with different checksums ('{}' and '{}'), keeping the first",
                        replica_id,
                        entry.filename,
                        first,
                        entry.checksum
                    );
                }
                continue;
            }
            seen.insert(&entry.filename, &entry.checksum);

            ensure_row(&tx, &entry.filename, replica_id)?;
            tx.execute(
                "UPDATE replicafileinfo SET
                    checksum_status = CASE WHEN checksum IS ?1 THEN checksum_status ELSE ?2 END,
                    checksum = ?1,
                    filelist_status = ?3,
                    checksum_checkdatetime = ?4,
                    filelist_checkdatetime = ?4
                 WHERE filename = ?5 AND replica_id = ?6",
                params![
                    entry.checksum,
                    ChecksumStatus::Unknown.as_str(),
                    FileListStatus::Ok.as_str(),
                    now,
                    entry.filename,
                    replica_id
                ],
            )?;
        }

        let listed: HashSet<&str> = seen.keys().copied().collect();
        mark_unlisted(&tx, replica_id, &listed, &now)?;
        tx.execute(
            "UPDATE replica SET checksum_updated = ?1, filelist_updated = ?1 WHERE replica_id = ?2",
            params![now, replica_id],
        )?;
        tx.commit()?;

        tracing::info!(
            "Stored checksums of {} files for replica {}",
            seen.len(),
            replica_id
        );
        Ok(())
    }

    /// Replace the known inventory of a replica. Files not listed become
    /// MISSING and their upload is considered failed.
    pub fn add_file_list_information(&self, filenames: &[String], replica_id: &str) -> Result<()> {
        self.replica(replica_id)?;
        for filename in filenames {
            validate_filename(filename)?;
        }

        tracing::info!(
            "Ingesting file list of {} entries for replica {}",
            filenames.len(),
            replica_id
        );

        let now = Utc::now().to_rfc3339();
        let mut conn = self.get_conn()?;
        let tx = write_tx(&mut conn)?;

        let mut listed = HashSet::new();
        for filename in filenames {
            if !listed.insert(filename.as_str()) {
                tracing::warn!(
                    "File '{}' is listed twice for replica {}",
                    filename,
                    replica_id
                );
                continue;
            }

            ensure_row(&tx, filename, replica_id)?;
            tx.execute(
                "UPDATE replicafileinfo SET filelist_status = ?1, filelist_checkdatetime = ?2
                 WHERE filename = ?3 AND replica_id = ?4",
                params![FileListStatus::Ok.as_str(), now, filename, replica_id],
            )?;
        }

        mark_unlisted(&tx, replica_id, &listed, &now)?;
        tx.execute(
            "UPDATE replica SET filelist_updated = ?1 WHERE replica_id = ?2",
            params![now, replica_id],
        )?;
        tx.commit()?;

        Ok(())
    }

    /// Re-vote every file with at least one reported checksum. Returns the
    /// number of files voted.
    pub fn update_checksum_status(&self) -> Result<usize> {
        let filenames = self.query_names(
            "SELECT DISTINCT filename FROM replicafileinfo
             WHERE checksum IS NOT NULL ORDER BY filename",
            [],
        )?;

        let mut conn = self.get_conn()?;
        for filename in &filenames {
            let tx = write_tx(&mut conn)?;
            vote_file(&tx, filename)?;
            tx.commit()?;
        }

        tracing::info!("Updated checksum status of {} files", filenames.len());
        Ok(filenames.len())
    }

    pub fn update_checksum_status_for_file(&self, filename: &str) -> Result<VoteOutcome> {
        validate_filename(filename)?;

        let mut conn = self.get_conn()?;
        let tx = write_tx(&mut conn)?;
        let outcome = vote_file(&tx, filename)?;
        tx.commit()?;
        Ok(outcome)
    }

    /// Register the intent to upload `filename` with `checksum` to every replica.
    pub fn insert_new_file_for_upload(&self, filename: &str, checksum: &str) -> Result<()> {
        validate_filename(filename)?;
        validate_checksum(checksum)?;

        let mut conn = self.get_conn()?;
        let tx = write_tx(&mut conn)?;

        tx.execute(
            "INSERT OR IGNORE INTO file (filename) VALUES (?1)",
            [filename],
        )?;

        let completed: Vec<String> = {
            let mut stmt = tx.prepare(
                "SELECT completed_checksum FROM replicafileinfo
                 WHERE filename = ?1 AND upload_state = ?2 AND completed_checksum IS NOT NULL",
            )?;
            let rows = stmt.query_map(
                params![filename, UploadState::UploadCompleted.as_str()],
                |row| row.get::<_, String>(0),
            )?;
            let mut checksums = Vec::new();
            for row in rows {
                checksums.push(row?);
            }
            checksums
        };

        if let Some(existing) = completed.iter().find(|existing| existing.as_str() != checksum) {
            return Err(FixityError::ChecksumConflict {
                filename: filename.to_string(),
                existing: existing.clone(),
                requested: checksum.to_string(),
            });
        }

        let pending: Option<String> = tx.query_row(
            "SELECT upload_checksum FROM file WHERE filename = ?1",
            [filename],
            |row| row.get(0),
        )?;
        if let Some(existing) = pending {
            if existing != checksum {
                return Err(FixityError::ChecksumConflict {
                    filename: filename.to_string(),
                    existing,
                    requested: checksum.to_string(),
                });
            }
        }

        if !completed.is_empty() {
            tracing::debug!(
                "File '{}' already completed on {} replicas with checksum '{}'",
                filename,
                completed.len(),
                checksum
            );
        }

        tx.execute(
            "UPDATE file SET upload_checksum = ?1 WHERE filename = ?2",
            params![checksum, filename],
        )?;
        for replica in &self.replicas {
            ensure_row(&tx, filename, &replica.id)?;
        }
        tx.commit()?;

        Ok(())
    }

    pub fn change_state_of_replica_file_info(
        &self,
        filename: &str,
        replica_id: &str,
        new_state: UploadState,
    ) -> Result<()> {
        self.transition(filename, None, replica_id, new_state)
    }

    pub fn change_state_with_checksum(
        &self,
        filename: &str,
        checksum: &str,
        replica_id: &str,
        new_state: UploadState,
    ) -> Result<()> {
        validate_checksum(checksum)?;
        self.transition(filename, Some(checksum), replica_id, new_state)
    }

    fn transition(
        &self,
        filename: &str,
        checksum: Option<&str>,
        replica_id: &str,
        new_state: UploadState,
    ) -> Result<()> {
        self.replica(replica_id)?;
        validate_filename(filename)?;

        let mut conn = self.get_conn()?;
        let tx = write_tx(&mut conn)?;

        let info = fetch_info(&tx, filename, replica_id)?.ok_or_else(|| {
            FixityError::NotFound(format!("{} on replica {}", filename, replica_id))
        })?;

        if !UploadState::can_transition(info.upload_state, new_state) {
            return Err(FixityError::InvalidStateTransition {
                filename: filename.to_string(),
                replica_id: replica_id.to_string(),
                from: info
                    .upload_state
                    .map(|state| state.to_string())
                    .unwrap_or_else(|| "NONE".to_string()),
                to: new_state.to_string(),
            });
        }

        let already_completed = info.upload_state == Some(UploadState::UploadCompleted);
        if let (true, Some(requested), Some(existing)) =
            (already_completed, checksum, info.completed_checksum.as_deref())
        {
            if existing != requested {
                return Err(FixityError::ChecksumConflict {
                    filename: filename.to_string(),
                    existing: existing.to_string(),
                    requested: requested.to_string(),
                });
            }
        }

        // Completion fixes the checksum: explicit, else the registration,
        // else the last reported one.
        let mut completed_checksum = info.completed_checksum.clone();
        if new_state == UploadState::UploadCompleted
            && !(already_completed && completed_checksum.is_some())
        {
            let pending: Option<String> = tx.query_row(
                "SELECT upload_checksum FROM file WHERE filename = ?1",
                [filename],
                |row| row.get(0),
            )?;
            completed_checksum = checksum
                .map(str::to_string)
                .or(pending)
                .or_else(|| info.checksum.clone());
            if completed_checksum.is_none() {
                return Err(FixityError::InvalidRequest(format!(
                    "cannot complete upload of '{}' on replica {} without a known checksum",
                    filename, replica_id
                )));
            }
        }

        let mut new_checksum = checksum
            .map(str::to_string)
            .or_else(|| info.checksum.clone());
        if new_checksum.is_none() && new_state == UploadState::UploadCompleted {
            new_checksum = completed_checksum.clone();
        }

        let checksum_changed = new_checksum != info.checksum;
        let checksum_status = if checksum_changed {
            ChecksumStatus::Unknown
        } else {
            info.checksum_status
        };
        let checked_at = checksum_changed.then(|| Utc::now().to_rfc3339());

        tx.execute(
            "UPDATE replicafileinfo SET
                upload_state = ?1,
                checksum = ?2,
                completed_checksum = ?3,
                checksum_status = ?4,
                checksum_checkdatetime = COALESCE(?5, checksum_checkdatetime)
             WHERE filename = ?6 AND replica_id = ?7",
            params![
                new_state.as_str(),
                new_checksum,
                completed_checksum,
                checksum_status.as_str(),
                checked_at,
                filename,
                replica_id
            ],
        )?;
        tx.commit()?;

        tracing::debug!(
            "Upload of '{}' on replica {} moved to {}",
            filename,
            replica_id,
            new_state
        );
        Ok(())
    }

    /// The completion checksum every replica that completed the upload
    /// agrees on. Later reports do not change it.
    pub fn get_checksum(&self, filename: &str) -> Result<Option<String>> {
        validate_filename(filename)?;

        let checksums = self.query_names(
            "SELECT DISTINCT completed_checksum FROM replicafileinfo
             WHERE filename = ?1 AND upload_state = ?2 AND completed_checksum IS NOT NULL",
            params![filename, UploadState::UploadCompleted.as_str()],
        )?;

        match checksums.as_slice() {
            [] => Ok(None),
            [checksum] => Ok(Some(checksum.clone())),
            _ => {
                tracing::warn!(
                    "Replicas disagree on the checksum of '{}': {:?}",
                    filename,
                    checksums
                );
                Ok(None)
            }
        }
    }

    /// First bitarchive replica, in topology order, whose copy of `filename`
    /// passed the last vote.
    pub fn get_bitarchive_with_good_file(
        &self,
        filename: &str,
        exclude_replica: Option<&str>,
    ) -> Result<Option<Replica>> {
        validate_filename(filename)?;
        if let Some(excluded) = exclude_replica {
            self.replica(excluded)?;
        }

        let good: HashSet<String> = self
            .query_names(
                "SELECT replica_id FROM replicafileinfo
                 WHERE filename = ?1 AND checksum_status = ?2",
                params![filename, ChecksumStatus::Ok.as_str()],
            )?
            .into_iter()
            .collect();

        Ok(self
            .replicas
            .iter()
            .filter(|replica| replica.replica_type == ReplicaType::Bitarchive)
            .filter(|replica| Some(replica.id.as_str()) != exclude_replica)
            .find(|replica| good.contains(&replica.id))
            .cloned())
    }

    /// Overwrite what is known about one file on one replica and re-vote it.
    /// `None` records that the replica no longer holds the file.
    pub fn update_checksum_information_for_file_on_replica(
        &self,
        filename: &str,
        checksum: Option<&str>,
        replica_id: &str,
    ) -> Result<()> {
        self.replica(replica_id)?;
        validate_filename(filename)?;
        if let Some(checksum) = checksum {
            validate_checksum(checksum)?;
        }

        let now = Utc::now().to_rfc3339();
        let mut conn = self.get_conn()?;
        let tx = write_tx(&mut conn)?;
        ensure_row(&tx, filename, replica_id)?;

        match checksum {
            Some(checksum) => {
                tx.execute(
                    "UPDATE replicafileinfo SET
                        checksum = ?1,
                        checksum_status = ?2,
                        filelist_status = ?3,
                        checksum_checkdatetime = ?4,
                        filelist_checkdatetime = ?4
                     WHERE filename = ?5 AND replica_id = ?6",
                    params![
                        checksum,
                        ChecksumStatus::Unknown.as_str(),
                        FileListStatus::Ok.as_str(),
                        now,
                        filename,
                        replica_id
                    ],
                )?;
            }
            None => {
                tx.execute(
                    "UPDATE replicafileinfo SET
                        checksum_status = ?1,
                        filelist_status = ?2,
                        filelist_checkdatetime = ?3
                     WHERE filename = ?4 AND replica_id = ?5",
                    params![
                        ChecksumStatus::Unknown.as_str(),
                        FileListStatus::Missing.as_str(),
                        now,
                        filename,
                        replica_id
                    ],
                )?;
            }
        }
        vote_file(&tx, filename)?;
        tx.commit()?;
        Ok(())
    }

    pub fn get_replica_file_info(
        &self,
        filename: &str,
        replica_id: &str,
    ) -> Result<Option<ReplicaFileInfo>> {
        self.replica(replica_id)?;
        let conn = self.get_conn()?;
        fetch_info(&conn, filename, replica_id)
    }

    pub fn get_replica_file_infos(&self, filename: &str) -> Result<Vec<ReplicaFileInfo>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM replicafileinfo WHERE filename = ?1 ORDER BY replica_id",
            INFO_COLUMNS
        ))?;
        let rows = stmt.query_map([filename], read_raw_info)?;

        let mut infos = Vec::new();
        for row in rows {
            infos.push(into_info(row?)?);
        }
        Ok(infos)
    }

    pub fn get_filelist_status(&self, filename: &str, replica_id: &str) -> Result<FileListStatus> {
        Ok(self
            .get_replica_file_info(filename, replica_id)?
            .map(|info| info.filelist_status)
            .unwrap_or_default())
    }

    pub fn exists_file(&self, filename: &str) -> Result<bool> {
        let conn = self.get_conn()?;
        let found = conn
            .query_row(
                "SELECT 1 FROM file WHERE filename = ?1",
                [filename],
                |row| row.get::<_, i64>(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    pub fn retrieve_all_filenames(&self) -> Result<Vec<String>> {
        self.query_names("SELECT filename FROM file ORDER BY filename", [])
    }

    pub fn retrieve_filenames_for_replica_entries(
        &self,
        replica_id: &str,
        state: UploadState,
    ) -> Result<Vec<String>> {
        self.replica(replica_id)?;
        self.query_names(
            "SELECT filename FROM replicafileinfo
             WHERE replica_id = ?1 AND upload_state = ?2 ORDER BY filename",
            params![replica_id, state.as_str()],
        )
    }

    pub fn number_of_missing_files(&self, replica_id: &str) -> Result<u64> {
        self.replica(replica_id)?;
        self.count(
            "SELECT COUNT(*) FROM replicafileinfo
             WHERE replica_id = ?1 AND filelist_status IN (?2, ?3)",
            params![
                replica_id,
                FileListStatus::Missing.as_str(),
                FileListStatus::NoFilelistStatus.as_str()
            ],
        )
    }

    pub fn missing_files(&self, replica_id: &str) -> Result<Vec<String>> {
        self.replica(replica_id)?;
        self.query_names(
            "SELECT filename FROM replicafileinfo
             WHERE replica_id = ?1 AND filelist_status IN (?2, ?3) ORDER BY filename",
            params![
                replica_id,
                FileListStatus::Missing.as_str(),
                FileListStatus::NoFilelistStatus.as_str()
            ],
        )
    }

    pub fn number_of_wrong_files(&self, replica_id: &str) -> Result<u64> {
        self.replica(replica_id)?;
        self.count(
            "SELECT COUNT(*) FROM replicafileinfo WHERE replica_id = ?1 AND checksum_status = ?2",
            params![replica_id, ChecksumStatus::Corrupt.as_str()],
        )
    }

    pub fn wrong_files(&self, replica_id: &str) -> Result<Vec<String>> {
        self.replica(replica_id)?;
        self.query_names(
            "SELECT filename FROM replicafileinfo
             WHERE replica_id = ?1 AND checksum_status = ?2 ORDER BY filename",
            params![replica_id, ChecksumStatus::Corrupt.as_str()],
        )
    }

    pub fn number_of_files(&self, replica_id: &str) -> Result<u64> {
        self.replica(replica_id)?;
        self.count(
            "SELECT COUNT(*) FROM replicafileinfo WHERE replica_id = ?1 AND filelist_status = ?2",
            params![replica_id, FileListStatus::Ok.as_str()],
        )
    }

    /// Time of the last file list ingested for the replica.
    pub fn date_of_last_missing_files_update(
        &self,
        replica_id: &str,
    ) -> Result<Option<DateTime<Utc>>> {
        self.replica_timestamp(replica_id, "filelist_updated")
    }

    /// Time of the last checksum report ingested for the replica.
    pub fn date_of_last_wrong_files_update(
        &self,
        replica_id: &str,
    ) -> Result<Option<DateTime<Utc>>> {
        self.replica_timestamp(replica_id, "checksum_updated")
    }

    pub fn replica_summary(&self, replica_id: &str) -> Result<ReplicaSummary> {
        let replica = self.replica(replica_id)?.clone();
        Ok(ReplicaSummary {
            number_of_files: self.number_of_files(replica_id)?,
            missing_files: self.number_of_missing_files(replica_id)?,
            wrong_files: self.number_of_wrong_files(replica_id)?,
            last_filelist_update: self.date_of_last_missing_files_update(replica_id)?,
            last_checksum_update: self.date_of_last_wrong_files_update(replica_id)?,
            replica,
        })
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.count("SELECT COUNT(*) FROM file", [])? == 0)
    }

    /// Dump of every (file, replica) row, one per line.
    pub fn retrieve_as_text(&self) -> Result<String> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM replicafileinfo ORDER BY filename, replica_id",
            INFO_COLUMNS
        ))?;
        let rows = stmt.query_map([], read_raw_info)?;

        let mut out = String::new();
        for row in rows {
            let info = into_info(row?)?;
            out.push_str(&format!(
                "{} {} {} {} {} {}\n",
                info.filename,
                info.replica_id,
                info.checksum.as_deref().unwrap_or("-"),
                info.upload_state
                    .map(|state| state.as_str())
                    .unwrap_or("-"),
                info.checksum_status,
                info.filelist_status
            ));
        }
        Ok(out)
    }

    fn replica_timestamp(&self, replica_id: &str, column: &str) -> Result<Option<DateTime<Utc>>> {
        self.replica(replica_id)?;
        let conn = self.get_conn()?;
        let value: Option<String> = conn.query_row(
            &format!("SELECT {} FROM replica WHERE replica_id = ?1", column),
            [replica_id],
            |row| row.get(0),
        )?;
        parse_timestamp(value)
    }

    fn query_names<P: Params>(&self, sql: &str, params: P) -> Result<Vec<String>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map(params, |row| row.get::<_, String>(0))?;

        let mut names = Vec::new();
        for row in rows {
            names.push(row?);
        }
        Ok(names)
    }

    fn count<P: Params>(&self, sql: &str, params: P) -> Result<u64> {
        let conn = self.get_conn()?;
        let count: i64 = conn.query_row(sql, params, |row| row.get(0))?;
        Ok(count as u64)
    }
}

fn write_tx(conn: &mut Connection) -> Result<Transaction<'_>> {
    Ok(conn.transaction_with_behavior(TransactionBehavior::Immediate)?)
}

/// Mark every row of `replica_id` not in `listed` as MISSING with a failed
/// upload. Returns the number of rows marked.
fn mark_unlisted(
    conn: &Connection,
    replica_id: &str,
    listed: &HashSet<&str>,
    now: &str,
) -> Result<usize> {
    conn.execute(
        "CREATE TEMP TABLE IF NOT EXISTS listed_files (filename TEXT PRIMARY KEY)",
        [],
    )?;
    conn.execute("DELETE FROM listed_files", [])?;
    {
        let mut insert = conn.prepare("INSERT INTO listed_files (filename) VALUES (?1)")?;
        for filename in listed {
            insert.execute([filename])?;
        }
    }

    let missing = {
        let mut stmt = conn.prepare(
            "SELECT filename FROM replicafileinfo
             WHERE replica_id = ?1 AND filename NOT IN (SELECT filename FROM listed_files)
             ORDER BY filename",
        )?;
        let rows = stmt.query_map([replica_id], |row| row.get::<_, String>(0))?;
        let mut names = Vec::new();
        for row in rows {
            names.push(row?);
        }
        names
    };

    if !missing.is_empty() {
        tracing::warn!(
            "{} files are missing on replica {}",
            missing.len(),
            replica_id
        );
        for filename in &missing {
            tracing::debug!("Missing on replica {}: {}", replica_id, filename);
        }
    }

    conn.execute(
        "UPDATE replicafileinfo SET
            filelist_status = ?1,
            upload_state = ?2,
            filelist_checkdatetime = ?3
         WHERE replica_id = ?4 AND filename NOT IN (SELECT filename FROM listed_files)",
        params![
            FileListStatus::Missing.as_str(),
            UploadState::UploadFailed.as_str(),
            now,
            replica_id
        ],
    )?;
    conn.execute("DROP TABLE listed_files", [])?;
    Ok(missing.len())
}

/// Vote on the reported checksums of one file and label every row holding a
/// checksum. Only rows confirmed present by the latest listing vote.
fn vote_file(conn: &Connection, filename: &str) -> Result<VoteOutcome> {
    let rows: Vec<(String, String, String)> = {
        let mut stmt = conn.prepare(
            "SELECT replica_id, checksum, filelist_status FROM replicafileinfo
             WHERE filename = ?1 AND checksum IS NOT NULL",
        )?;
        let mapped = stmt.query_map([filename], |row| {
            Ok((row.get(0)?, row.get(1)?, row.get(2)?))
        })?;
        let mut rows = Vec::new();
        for row in mapped {
            rows.push(row?);
        }
        rows
    };

    let present = FileListStatus::Ok.as_str();
    let outcome = vote(
        rows.iter()
            .filter(|(_, _, filelist_status)| filelist_status.as_str() == present)
            .map(|(_, checksum, _)| checksum.as_str()),
    );

    for (replica_id, checksum, _) in &rows {
        let status = match &outcome {
            VoteOutcome::Consensus(consensus) if checksum == consensus => ChecksumStatus::Ok,
            VoteOutcome::Consensus(consensus) => {
                tracing::warn!(
                    "File '{}' on replica {} has checksum '{}', expected '{}'",
                    filename,
                    replica_id,
                    checksum,
                    consensus
                );
                ChecksumStatus::Corrupt
            }
            VoteOutcome::Tie | VoteOutcome::NoVotes => ChecksumStatus::Unknown,
        };
        conn.execute(
            "UPDATE replicafileinfo SET checksum_status = ?1
             WHERE filename = ?2 AND replica_id = ?3",
            params![status.as_str(), filename, replica_id],
        )?;
    }

    if outcome == VoteOutcome::Tie {
        tracing::warn!(
            "No checksum of '{}' has a plurality among replicas, status left unknown",
            filename
        );
    }

    conn.execute(
        "UPDATE replicafileinfo SET checksum_status = ?1
         WHERE filename = ?2 AND checksum IS NULL",
        params![ChecksumStatus::Unknown.as_str(), filename],
    )?;

    Ok(outcome)
}

fn ensure_row(conn: &Connection, filename: &str, replica_id: &str) -> Result<()> {
    conn.execute(
        "INSERT OR IGNORE INTO file (filename) VALUES (?1)",
        [filename],
    )?;
    conn.execute(
        "INSERT OR IGNORE INTO replicafileinfo (filename, replica_id) VALUES (?1, ?2)",
        params![filename, replica_id],
    )?;
    Ok(())
}

fn fetch_info(conn: &Connection, filename: &str, replica_id: &str) -> Result<Option<ReplicaFileInfo>> {
    let raw = conn
        .query_row(
            &format!(
                "SELECT {} FROM replicafileinfo WHERE filename = ?1 AND replica_id = ?2",
                INFO_COLUMNS
            ),
            params![filename, replica_id],
            read_raw_info,
        )
        .optional()?;
    raw.map(into_info).transpose()
}

fn read_raw_info(row: &Row<'_>) -> rusqlite::Result<RawInfoRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
        row.get(8)?,
    ))
}

fn into_info(raw: RawInfoRow) -> Result<ReplicaFileInfo> {
    let (
        filename,
        replica_id,
        checksum,
        completed_checksum,
        upload_state,
        checksum_status,
        filelist_status,
        checksum_checkdatetime,
        filelist_checkdatetime,
    ) = raw;

    Ok(ReplicaFileInfo {
        filename,
        replica_id,
        checksum,
        completed_checksum,
        upload_state: upload_state
            .map(|state| state.parse::<UploadState>())
            .transpose()?,
        checksum_status: checksum_status.parse::<ChecksumStatus>()?,
        filelist_status: filelist_status.parse::<FileListStatus>()?,
        last_checksum_update: parse_timestamp(checksum_checkdatetime)?,
        last_filelist_update: parse_timestamp(filelist_checkdatetime)?,
    })
}

fn parse_timestamp(value: Option<String>) -> Result<Option<DateTime<Utc>>> {
    Ok(value
        .map(|t| DateTime::parse_from_rfc3339(&t))
        .transpose()
        .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?
        .map(|t| t.with_timezone(&Utc)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::TempDir;

    const R1: [(&str, &str); 4] = [
        ("TEST1", "1234567890"),
        ("TEST2", "0987654321"),
        ("TEST3", "1029384756"),
        ("TEST4", "0192837465"),
    ];
    const R2: [(&str, &str); 4] = [
        ("TEST1", "ABCDEFGHIJ"),
        ("TEST2", "JIHGFEDCBA"),
        ("TEST3", "AJIBHCGDFE"),
        ("TEST4", "JABICHDGEF"),
    ];

    fn open_store() -> (TempDir, ConsistencyStore) {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = ConsistencyStore::open(
            temp_dir.path().join("consistency.db"),
            vec![
                Replica::bitarchive("ONE"),
                Replica::bitarchive("TWO"),
                Replica::bitarchive("THREE"),
                Replica::new("CS", "checksum replica", ReplicaType::Checksum),
            ],
        )
        .unwrap();
        (temp_dir, store)
    }

    fn report(pairs: &[(&str, &str)]) -> Vec<ChecksumEntry> {
        pairs
            .iter()
            .map(|(filename, checksum)| ChecksumEntry::new(*filename, *checksum))
            .collect()
    }

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|name| name.to_string()).collect()
    }

    fn load_scenario(store: &ConsistencyStore) {
        store.add_checksum_information(&report(&R1), "ONE").unwrap();
        store.add_checksum_information(&report(&R1), "TWO").unwrap();
        store.add_checksum_information(&report(&R2), "THREE").unwrap();
    }

    #[test]
    fn test_consensus_flags_divergent_replica() {
        let (_dir, store) = open_store();
        load_scenario(&store);

        assert_eq!(store.update_checksum_status().unwrap(), 4);
        assert_eq!(store.number_of_wrong_files("THREE").unwrap(), 4);
        assert_eq!(store.number_of_wrong_files("ONE").unwrap(), 0);
        assert_eq!(store.number_of_wrong_files("TWO").unwrap(), 0);
        assert_eq!(
            store.wrong_files("THREE").unwrap(),
            names(&["TEST1", "TEST2", "TEST3", "TEST4"])
        );

        let good = store
            .get_bitarchive_with_good_file("TEST1", None)
            .unwrap()
            .unwrap();
        assert!(good.id == "ONE" || good.id == "TWO");
        let other = store
            .get_bitarchive_with_good_file("TEST1", Some("ONE"))
            .unwrap()
            .unwrap();
        assert_eq!(other.id, "TWO");
    }

    #[test]
    fn test_consensus_is_idempotent() {
        let (_dir, store) = open_store();
        load_scenario(&store);

        store.update_checksum_status().unwrap();
        let first = store.retrieve_as_text().unwrap();
        store.update_checksum_status().unwrap();
        assert_eq!(store.retrieve_as_text().unwrap(), first);
        assert_eq!(store.number_of_wrong_files("THREE").unwrap(), 4);
    }

    #[test]
    fn test_tie_leaves_status_unknown() {
        let (_dir, store) = open_store();
        store
            .add_checksum_information(&report(&[("a.warc", "xxx")]), "ONE")
            .unwrap();
        store
            .add_checksum_information(&report(&[("a.warc", "yyy")]), "TWO")
            .unwrap();

        let outcome = store.update_checksum_status_for_file("a.warc").unwrap();
        assert_eq!(outcome, VoteOutcome::Tie);
        for replica in ["ONE", "TWO"] {
            let info = store.get_replica_file_info("a.warc", replica).unwrap().unwrap();
            assert_eq!(info.checksum_status, ChecksumStatus::Unknown);
        }
        assert!(store.get_bitarchive_with_good_file("a.warc", None).unwrap().is_none());
    }

    #[test]
    fn test_missing_rows_do_not_vote() {
        let (_dir, store) = open_store();
        store
            .add_checksum_information(&report(&[("a.warc", "good")]), "ONE")
            .unwrap();
        store
            .add_checksum_information(&report(&[("a.warc", "stale")]), "TWO")
            .unwrap();
        store
            .add_checksum_information(&report(&[("a.warc", "stale")]), "THREE")
            .unwrap();
        store.add_file_list_information(&[], "TWO").unwrap();
        store.add_file_list_information(&[], "THREE").unwrap();

        store.update_checksum_status().unwrap();
        let one = store.get_replica_file_info("a.warc", "ONE").unwrap().unwrap();
        let two = store.get_replica_file_info("a.warc", "TWO").unwrap().unwrap();
        assert_eq!(one.checksum_status, ChecksumStatus::Ok);
        assert_eq!(two.checksum_status, ChecksumStatus::Corrupt);
        assert_eq!(two.filelist_status, FileListStatus::Missing);
    }

    #[test]
    fn test_unconfirmed_rows_do_not_vote() {
        let (_dir, store) = open_store();
        store.insert_new_file_for_upload("a.warc", "bad").unwrap();
        for state in [
            UploadState::UploadStarted,
            UploadState::DataUploaded,
            UploadState::UploadCompleted,
        ] {
            store
                .change_state_of_replica_file_info("a.warc", "THREE", state)
                .unwrap();
        }
        store
            .add_checksum_information(&report(&[("a.warc", "good")]), "ONE")
            .unwrap();

        let outcome = store.update_checksum_status_for_file("a.warc").unwrap();
        assert_eq!(outcome, VoteOutcome::Consensus("good".to_string()));
        let three = store.get_replica_file_info("a.warc", "THREE").unwrap().unwrap();
        assert_eq!(three.filelist_status, FileListStatus::NoFilelistStatus);
        assert_eq!(three.checksum_status, ChecksumStatus::Corrupt);
    }

    #[test]
    fn test_checksum_report_replaces_inventory() {
        let (_dir, store) = open_store();
        store
            .add_checksum_information(&report(&[("a.warc", "aaa"), ("b.warc", "bbb")]), "ONE")
            .unwrap();
        store
            .add_checksum_information(&report(&[("a.warc", "aaa")]), "ONE")
            .unwrap();

        let dropped = store.get_replica_file_info("b.warc", "ONE").unwrap().unwrap();
        assert_eq!(dropped.filelist_status, FileListStatus::Missing);
        assert_eq!(dropped.upload_state, Some(UploadState::UploadFailed));
        assert_eq!(store.get_filelist_status("a.warc", "ONE").unwrap(), FileListStatus::Ok);
        assert_eq!(store.number_of_files("ONE").unwrap(), 1);
        assert!(store.date_of_last_missing_files_update("ONE").unwrap().is_some());
    }

    #[test]
    fn test_filelist_replaces_inventory() {
        let (_dir, store) = open_store();
        store
            .add_file_list_information(&names(&["a.warc", "b.warc"]), "ONE")
            .unwrap();
        assert_eq!(store.number_of_files("ONE").unwrap(), 2);
        assert_eq!(store.number_of_missing_files("ONE").unwrap(), 0);

        store
            .add_file_list_information(&names(&["a.warc"]), "ONE")
            .unwrap();
        assert_eq!(store.get_filelist_status("a.warc", "ONE").unwrap(), FileListStatus::Ok);
        assert_eq!(
            store.get_filelist_status("b.warc", "ONE").unwrap(),
            FileListStatus::Missing
        );
        let dropped = store.get_replica_file_info("b.warc", "ONE").unwrap().unwrap();
        assert_eq!(dropped.upload_state, Some(UploadState::UploadFailed));
        assert_eq!(store.missing_files("ONE").unwrap(), names(&["b.warc"]));
        assert_eq!(store.number_of_files("ONE").unwrap(), 1);
        assert!(store.date_of_last_missing_files_update("ONE").unwrap().is_some());
        assert!(store.date_of_last_wrong_files_update("ONE").unwrap().is_none());

        // never listed on TWO
        assert_eq!(
            store.get_filelist_status("a.warc", "TWO").unwrap(),
            FileListStatus::NoFilelistStatus
        );
    }

    #[test]
    fn test_upload_registration_conflicts() {
        let (_dir, store) = open_store();
        store.insert_new_file_for_upload("a.warc", "xxx").unwrap();
        store.insert_new_file_for_upload("a.warc", "xxx").unwrap();
        assert!(matches!(
            store.insert_new_file_for_upload("a.warc", "yyy"),
            Err(FixityError::ChecksumConflict { .. })
        ));
        assert_eq!(store.get_replica_file_infos("a.warc").unwrap().len(), 4);

        for state in [
            UploadState::UploadStarted,
            UploadState::DataUploaded,
            UploadState::UploadCompleted,
        ] {
            store
                .change_state_of_replica_file_info("a.warc", "ONE", state)
                .unwrap();
        }
        assert_eq!(store.get_checksum("a.warc").unwrap().as_deref(), Some("xxx"));
        assert!(matches!(
            store.change_state_with_checksum("a.warc", "yyy", "ONE", UploadState::UploadCompleted),
            Err(FixityError::ChecksumConflict { .. })
        ));

        // completed without any registration
        store
            .add_checksum_information(&report(&[("b.warc", "bbb")]), "TWO")
            .unwrap();
        store
            .change_state_of_replica_file_info("b.warc", "TWO", UploadState::UploadStarted)
            .unwrap();
        store
            .change_state_of_replica_file_info("b.warc", "TWO", UploadState::DataUploaded)
            .unwrap();
        store
            .change_state_with_checksum("b.warc", "bbb", "TWO", UploadState::UploadCompleted)
            .unwrap();
        assert!(matches!(
            store.insert_new_file_for_upload("b.warc", "ccc"),
            Err(FixityError::ChecksumConflict { .. })
        ));
        store.insert_new_file_for_upload("b.warc", "bbb").unwrap();
        assert_eq!(
            store
                .retrieve_filenames_for_replica_entries("TWO", UploadState::UploadCompleted)
                .unwrap(),
            names(&["b.warc"])
        );
    }

    #[test]
    fn test_completion_needs_a_checksum() {
        let (_dir, store) = open_store();
        store
            .add_file_list_information(&names(&["a.warc"]), "ONE")
            .unwrap();
        store
            .change_state_of_replica_file_info("a.warc", "ONE", UploadState::UploadStarted)
            .unwrap();
        store
            .change_state_of_replica_file_info("a.warc", "ONE", UploadState::DataUploaded)
            .unwrap();

        assert!(matches!(
            store.change_state_of_replica_file_info("a.warc", "ONE", UploadState::UploadCompleted),
            Err(FixityError::InvalidRequest(_))
        ));
        let info = store.get_replica_file_info("a.warc", "ONE").unwrap().unwrap();
        assert_eq!(info.upload_state, Some(UploadState::DataUploaded));
        assert_eq!(info.checksum, None);

        store
            .change_state_with_checksum("a.warc", "aaa", "ONE", UploadState::UploadCompleted)
            .unwrap();
        assert_eq!(store.get_checksum("a.warc").unwrap().as_deref(), Some("aaa"));
    }

    #[test]
    fn test_reports_keep_completion_checksum() {
        let (_dir, store) = open_store();
        store.insert_new_file_for_upload("x.warc", "aaa").unwrap();
        for state in [
            UploadState::UploadStarted,
            UploadState::DataUploaded,
            UploadState::UploadCompleted,
        ] {
            store
                .change_state_of_replica_file_info("x.warc", "ONE", state)
                .unwrap();
        }

        store
            .add_checksum_information(&report(&[("x.warc", "zzz")]), "ONE")
            .unwrap();
        assert_eq!(store.get_checksum("x.warc").unwrap().as_deref(), Some("aaa"));

        let info = store.get_replica_file_info("x.warc", "ONE").unwrap().unwrap();
        assert_eq!(info.checksum.as_deref(), Some("zzz"));
        assert_eq!(info.completed_checksum.as_deref(), Some("aaa"));
        assert!(matches!(
            store.change_state_with_checksum("x.warc", "zzz", "ONE", UploadState::UploadCompleted),
            Err(FixityError::ChecksumConflict { .. })
        ));
    }

    #[test]
    fn test_concurrent_upload_lifecycles() {
        let (_dir, store) = open_store();
        let store = Arc::new(store);
        let files: Vec<String> = (0..25).map(|i| format!("f{:02}.warc", i)).collect();
        for filename in &files {
            store.insert_new_file_for_upload(filename, "abc").unwrap();
        }

        let handles: Vec<_> = ["ONE", "TWO", "THREE", "CS"]
            .into_iter()
            .map(|replica| {
                let store = store.clone();
                let files = files.clone();
                std::thread::spawn(move || {
                    for filename in &files {
                        for state in [
                            UploadState::UploadStarted,
                            UploadState::DataUploaded,
                            UploadState::UploadCompleted,
                        ] {
                            store
                                .change_state_of_replica_file_info(filename, replica, state)
                                .unwrap();
                        }
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        for replica in ["ONE", "TWO", "THREE", "CS"] {
            assert_eq!(
                store
                    .retrieve_filenames_for_replica_entries(replica, UploadState::UploadCompleted)
                    .unwrap(),
                files
            );
        }
        assert_eq!(store.get_checksum("f07.warc").unwrap().as_deref(), Some("abc"));
    }

    #[test]
    fn test_illegal_transitions_are_rejected() {
        let (_dir, store) = open_store();
        store.insert_new_file_for_upload("a.warc", "xxx").unwrap();

        assert!(matches!(
            store.change_state_of_replica_file_info("a.warc", "ONE", UploadState::UploadCompleted),
            Err(FixityError::InvalidStateTransition { .. })
        ));
        store
            .change_state_of_replica_file_info("a.warc", "ONE", UploadState::UploadFailed)
            .unwrap();
        assert!(matches!(
            store.change_state_of_replica_file_info("a.warc", "ONE", UploadState::UploadCompleted),
            Err(FixityError::InvalidStateTransition { .. })
        ));
        store
            .change_state_of_replica_file_info("a.warc", "ONE", UploadState::UploadStarted)
            .unwrap();

        assert!(matches!(
            store.change_state_of_replica_file_info("nope.warc", "ONE", UploadState::UploadStarted),
            Err(FixityError::NotFound(_))
        ));
        assert!(matches!(
            store.change_state_of_replica_file_info("a.warc", "FOUR", UploadState::UploadStarted),
            Err(FixityError::UnknownReplica(_))
        ));
    }

    #[test]
    fn test_get_checksum_requires_agreement() {
        let (_dir, store) = open_store();
        store
            .add_checksum_information(&report(&[("a.warc", "xxx")]), "ONE")
            .unwrap();
        store
            .add_checksum_information(&report(&[("a.warc", "yyy")]), "TWO")
            .unwrap();
        assert_eq!(store.get_checksum("a.warc").unwrap(), None);

        for replica in ["ONE", "TWO"] {
            store
                .change_state_of_replica_file_info("a.warc", replica, UploadState::UploadStarted)
                .unwrap();
            store
                .change_state_of_replica_file_info("a.warc", replica, UploadState::DataUploaded)
                .unwrap();
            store
                .change_state_of_replica_file_info("a.warc", replica, UploadState::UploadCompleted)
                .unwrap();
        }
        assert_eq!(store.get_checksum("a.warc").unwrap(), None);
    }

    #[test]
    fn test_correcting_one_replica_revotes() {
        let (_dir, store) = open_store();
        load_scenario(&store);
        store.update_checksum_status().unwrap();

        store
            .update_checksum_information_for_file_on_replica("TEST1", Some("1234567890"), "THREE")
            .unwrap();
        assert_eq!(store.number_of_wrong_files("THREE").unwrap(), 3);

        store
            .update_checksum_information_for_file_on_replica("TEST2", None, "ONE")
            .unwrap();
        assert_eq!(
            store.get_filelist_status("TEST2", "ONE").unwrap(),
            FileListStatus::Missing
        );
    }

    #[test]
    fn test_duplicate_report_lines_keep_first() {
        let (_dir, store) = open_store();
        store
            .add_checksum_information(&report(&[("a.warc", "first"), ("a.warc", "second")]), "ONE")
            .unwrap();
        let info = store.get_replica_file_info("a.warc", "ONE").unwrap().unwrap();
        assert_eq!(info.checksum.as_deref(), Some("first"));
        assert_eq!(info.filelist_status, FileListStatus::Ok);
    }

    #[test]
    fn test_unknown_replica_and_text_dump() {
        let (dir, store) = open_store();
        assert!(store.is_empty().unwrap());
        assert!(matches!(
            store.add_checksum_information(&report(&[("a.warc", "xxx")]), "FOUR"),
            Err(FixityError::UnknownReplica(_))
        ));
        assert!(store.is_empty().unwrap());

        store
            .add_checksum_information(&report(&[("a.warc", "xxx")]), "ONE")
            .unwrap();
        assert!(store.exists_file("a.warc").unwrap());
        assert_eq!(store.retrieve_all_filenames().unwrap(), names(&["a.warc"]));
        assert_eq!(
            store.retrieve_as_text().unwrap(),
            "a.warc ONE xxx - UNKNOWN OK\n"
        );

        // reopening keeps the rows
        drop(store);
        let reopened = ConsistencyStore::open(
            dir.path().join("consistency.db"),
            vec![Replica::bitarchive("ONE")],
        )
        .unwrap();
        assert!(!reopened.is_empty().unwrap());
        assert_eq!(reopened.replica_summary("ONE").unwrap().number_of_files, 1);
    }
}
