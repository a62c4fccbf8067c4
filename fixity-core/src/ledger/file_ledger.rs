use super::{
    ChecksumLedger, DeadEntry, RemovedEntryRecord, dead_letter_filename, lines_to_bytes,
    read_dead_letter_file,
};
use crate::checksum::{ChecksumAlgorithm, ChecksumEntry, validate_checksum, validate_filename};
use crate::error::{FixityError, Result};
use bytes::Bytes;
use chrono::Utc;
use fs2::FileExt;
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

/// Ledger kept in a plain `filename##checksum` file.
///
/// Uploads are appended. Corrections, and saves after a reload found bad
/// lines, rewrite the whole file through a temporary file that is renamed
/// over the ledger. Every mutation holds an exclusive lock on the sidecar
/// `<ledger>.lock` file, reloads hold a shared one.
pub struct FileLedger {
    ledger_path: PathBuf,
    dead_letter_path: PathBuf,
    lock_path: PathBuf,
    min_space_left: u64,
    algorithm: ChecksumAlgorithm,
    state: RwLock<LedgerState>,
}

#[derive(Default)]
struct LedgerState {
    entries: HashMap<String, String>,
    synced: Option<FileStamp>,
    needs_rewrite: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FileStamp {
    modified: SystemTime,
    len: u64,
}

impl FileStamp {
    fn of(path: &Path) -> Result<Self> {
        let meta = fs::metadata(path)?;
        Ok(Self {
            modified: meta.modified()?,
            len: meta.len(),
        })
    }
}

enum FileLock {
    Shared,
    Exclusive,
}

impl FileLedger {
    pub fn open(
        ledger_path: impl Into<PathBuf>,
        replica_id: &str,
        min_space_left: u64,
        algorithm: ChecksumAlgorithm,
    ) -> Result<Self> {
        let ledger_path = ledger_path.into();
        let base_dir = ledger_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        fs::create_dir_all(&base_dir)?;

        if !ledger_path.exists() {
            File::create(&ledger_path)?;
            tracing::info!("Created empty checksum ledger {:?}", ledger_path);
        }

        let ledger = Self {
            dead_letter_path: base_dir.join(dead_letter_filename(replica_id)),
            lock_path: path_with_suffix(&ledger_path, ".lock"),
            ledger_path,
            min_space_left,
            algorithm,
            state: RwLock::new(LedgerState::default()),
        };

        {
            let mut state = ledger.state.write();
            let _lock = ledger.lock_file(FileLock::Shared)?;
            ledger.reload(&mut *state)?;
        }

        Ok(ledger)
    }

    pub fn path(&self) -> &Path {
        &self.ledger_path
    }

    pub fn dead_letter_path(&self) -> &Path {
        &self.dead_letter_path
    }

    fn lock_file(&self, mode: FileLock) -> Result<LockGuard> {
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&self.lock_path)?;
        match mode {
            FileLock::Shared => FileExt::lock_shared(&file)?,
            FileLock::Exclusive => FileExt::lock_exclusive(&file)?,
        }
        Ok(LockGuard { file })
    }

    /// Read access to a table that matches the file on disk.
    fn fresh_state(&self) -> Result<RwLockReadGuard<'_, LedgerState>> {
        let stamp = FileStamp::of(&self.ledger_path)?;
        {
            let state = self.state.read();
            if state.synced == Some(stamp) {
                return Ok(state);
            }
        }

        let mut state = self.state.write();
        if state.synced != Some(FileStamp::of(&self.ledger_path)?) {
            let _lock = self.lock_file(FileLock::Shared)?;
            self.reload(&mut *state)?;
        }
        Ok(RwLockWriteGuard::downgrade(state))
    }

    /// Run a mutation under both the in-process and the cross-process lock.
    fn mutate<T>(&self, op: impl FnOnce(&Self, &mut LedgerState) -> Result<T>) -> Result<T> {
        let mut state = self.state.write();
        let _lock = self.lock_file(FileLock::Exclusive)?;
        if state.synced != Some(FileStamp::of(&self.ledger_path)?) {
            self.reload(&mut *state)?;
        }
        op(self, &mut *state)
    }

    fn reload(&self, state: &mut LedgerState) -> Result<()> {
        let raw = fs::read(&self.ledger_path)?;
        let content = String::from_utf8_lossy(&raw);

        let mut entries: HashMap<String, String> = HashMap::new();
        let mut quarantined = Vec::new();
        let mut needs_rewrite = false;

        for line in content.lines() {
            if line.trim().is_empty() {
                continue;
            }
            let Some(entry) = ChecksumEntry::parse_line(line) else {
                tracing::warn!(
                    "Unparsable line in checksum ledger {:?}: '{}'",
                    self.ledger_path,
                    line
                );
                quarantined.push(line.to_string());
                continue;
            };

            match entries.get(&entry.filename) {
                Some(existing) if *existing == entry.checksum => {
                    tracing::debug!("Duplicate ledger entry for '{}'", entry.filename);
                    needs_rewrite = true;
                }
                Some(existing) => {
                    tracing::warn!(
                        "Conflicting ledger entry for '{}': keeping '{}', quarantining '{}'",
                        entry.filename,
                        existing,
                        entry.checksum
                    );
                    quarantined.push(line.to_string());
                }
                None => {
                    entries.insert(entry.filename, entry.checksum);
                }
            }
        }

        if !quarantined.is_empty() {
            let now = Utc::now().to_rfc3339();
            let lines: Vec<String> = quarantined
                .iter()
                .map(|line| format!("{} : {}", now, line))
                .collect();
            self.append_dead_letter(&lines)?;
            needs_rewrite = true;
        }

        tracing::debug!(
            "Loaded {} entries from checksum ledger {:?}",
            entries.len(),
            self.ledger_path
        );

        state.entries = entries;
        state.needs_rewrite = needs_rewrite;
        state.synced = Some(FileStamp::of(&self.ledger_path)?);
        Ok(())
    }

    fn append_dead_letter(&self, lines: &[String]) -> Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.dead_letter_path)?;
        let mut payload = String::new();
        for line in lines {
            payload.push_str(line);
            payload.push('\n');
        }
        file.write_all(payload.as_bytes())?;
        file.sync_data()?;
        Ok(())
    }

    fn append_entry(&self, state: &mut LedgerState, entry: &ChecksumEntry) -> Result<()> {
        let mut file = OpenOptions::new()
            .read(true)
            .append(true)
            .open(&self.ledger_path)?;

        // a torn earlier append must not swallow this record
        let mut line = String::new();
        if !ends_with_newline(&mut file)? {
            tracing::warn!(
                "Checksum ledger {:?} ends in a partial line, terminating it",
                self.ledger_path
            );
            line.push('\n');
        }
        line.push_str(&entry.to_line());
        line.push('\n');
        file.write_all(line.as_bytes())?;
        file.sync_data()?;
        drop(file);

        state.synced = Some(FileStamp::of(&self.ledger_path)?);
        Ok(())
    }

    /// Write `entries` to a temporary file and rename it over the ledger.
    fn rewrite(&self, state: &mut LedgerState, entries: &HashMap<String, String>) -> Result<()> {
        let temp_path = path_with_suffix(&self.ledger_path, ".tmp");
        if let Err(error) = self.write_snapshot(&temp_path, entries) {
            let _ = fs::remove_file(&temp_path);
            tracing::warn!(
                "Rewrite of checksum ledger {:?} failed, keeping previous file: {}",
                self.ledger_path,
                error
            );
            return Err(error);
        }

        fs::rename(&temp_path, &self.ledger_path)?;
        state.synced = Some(FileStamp::of(&self.ledger_path)?);

        tracing::debug!(
            "Rewrote checksum ledger {:?} with {} entries",
            self.ledger_path,
            entries.len()
        );
        Ok(())
    }

    fn write_snapshot(&self, temp_path: &Path, entries: &HashMap<String, String>) -> Result<()> {
        let file = File::create(temp_path)?;
        let mut writer = BufWriter::new(file);
        for (filename, checksum) in sorted(entries) {
            writeln!(writer, "{}", ChecksumEntry::new(filename, checksum).to_line())?;
        }
        let file = writer.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()?;
        Ok(())
    }

    fn store_new_entry(&self, state: &mut LedgerState, entry: ChecksumEntry) -> Result<()> {
        if state.needs_rewrite {
            let mut entries = state.entries.clone();
            entries.insert(entry.filename.clone(), entry.checksum.clone());
            self.rewrite(state, &entries)?;
            state.entries = entries;
            state.needs_rewrite = false;
        } else {
            self.append_entry(state, &entry)?;
            state.entries.insert(entry.filename, entry.checksum);
        }
        Ok(())
    }
}

impl ChecksumLedger for FileLedger {
    fn upload(&self, filename: &str, content: &mut dyn Read) -> Result<bool> {
        validate_filename(filename)?;
        let checksum = self.algorithm.compute(content)?;
        self.upload_checksum(filename, &checksum)
    }

    fn upload_checksum(&self, filename: &str, checksum: &str) -> Result<bool> {
        validate_filename(filename)?;
        validate_checksum(checksum)?;

        self.mutate(|ledger, state| {
            if let Some(archived) = state.entries.get(filename) {
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
                    archived: archived.clone(),
                    uploaded: checksum.to_string(),
                });
            }

            ledger.store_new_entry(state, ChecksumEntry::new(filename, checksum))?;
            tracing::debug!("Archived checksum '{}' for '{}'", checksum, filename);
            Ok(true)
        })
    }

    fn correct(&self, filename: &str, replacement: &mut dyn Read) -> Result<RemovedEntryRecord> {
        validate_filename(filename)?;
        let new_checksum = self.algorithm.compute(replacement)?;

        self.mutate(|ledger, state| {
            let current = state
                .entries
                .get(filename)
                .cloned()
                .ok_or_else(|| FixityError::NotFound(filename.to_string()))?;

            if current == new_checksum {
                return Err(FixityError::NoOpCorrection {
                    filename: filename.to_string(),
                    checksum: current,
                });
            }

            // Dead entry before the rewrite. If the rewrite fails the dead
            // entry stays and the ledger keeps the old checksum.
            let corrected_at = Utc::now();
            let dead = DeadEntry::new(filename, &current, corrected_at);
            ledger.append_dead_letter(&[dead.to_line()])?;

            let mut entries = state.entries.clone();
            entries.insert(filename.to_string(), new_checksum.clone());
            if let Err(error) = ledger.rewrite(state, &entries) {
                tracing::error!(
                    "Correction of '{}' not applied, dead entry '{}' still describes the live checksum",
                    filename,
                    dead.to_line()
                );
                return Err(error);
            }
            state.entries = entries;
            state.needs_rewrite = false;

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
        })
    }

    fn get_checksum(&self, filename: &str) -> Result<Option<String>> {
        validate_filename(filename)?;
        let state = self.fresh_state()?;
        Ok(state.entries.get(filename).cloned())
    }

    fn export_ledger(&self) -> Result<Bytes> {
        let state = self.fresh_state()?;
        Ok(lines_to_bytes(sorted(&state.entries).map(
            |(filename, checksum)| ChecksumEntry::new(filename, checksum).to_line(),
        )))
    }

    fn export_filenames(&self) -> Result<Bytes> {
        let state = self.fresh_state()?;
        let mut names: Vec<&String> = state.entries.keys().collect();
        names.sort();
        Ok(lines_to_bytes(names))
    }

    fn has_enough_space(&self) -> bool {
        let writable = match fs::metadata(&self.ledger_path) {
            Ok(meta) => meta.is_file() && !meta.permissions().readonly(),
            Err(error) => {
                tracing::warn!("Cannot stat ledger {:?}: {}", self.ledger_path, error);
                false
            }
        };
        if !writable {
            tracing::warn!("Ledger {:?} is not a writable file", self.ledger_path);
            return false;
        }

        let dir = self.ledger_path.parent().unwrap_or_else(|| Path::new("."));
        match fs2::available_space(dir) {
            Ok(free) => free > self.min_space_left,
            Err(error) => {
                tracing::warn!("Cannot determine free space of {:?}: {}", dir, error);
                false
            }
        }
    }

    fn dead_entries(&self) -> Result<Vec<DeadEntry>> {
        read_dead_letter_file(&self.dead_letter_path)
    }
}

struct LockGuard {
    file: File,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

/// True for an empty file or one whose last byte is a newline.
fn ends_with_newline(file: &mut File) -> Result<bool> {
    if file.metadata()?.len() == 0 {
        return Ok(true);
    }
    file.seek(SeekFrom::End(-1))?;
    let mut last = [0u8; 1];
    file.read_exact(&mut last)?;
    Ok(last[0] == b'\n')
}

fn sorted(entries: &HashMap<String, String>) -> impl Iterator<Item = (&String, &String)> {
    let mut pairs: Vec<(&String, &String)> = entries.iter().collect();
    pairs.sort();
    pairs.into_iter()
}

fn path_with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(suffix);
    PathBuf::from(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::sync::Arc;

    fn open_ledger(dir: &Path) -> FileLedger {
        FileLedger::open(dir.join("checksum.md5"), "CS", 0, ChecksumAlgorithm::Md5).unwrap()
    }

    fn md5(data: &[u8]) -> String {
        ChecksumAlgorithm::Md5.compute_bytes(data)
    }

    #[test]
    fn test_upload_is_idempotent() {
        let temp_dir = tempfile::tempdir().unwrap();
        let ledger = open_ledger(temp_dir.path());

        assert!(ledger.upload("a.warc", &mut Cursor::new(b"content")).unwrap());
        assert!(!ledger.upload("a.warc", &mut Cursor::new(b"content")).unwrap());

        let raw = fs::read_to_string(ledger.path()).unwrap();
        assert_eq!(raw.lines().count(), 1);
        assert_eq!(ledger.get_checksum("a.warc").unwrap(), Some(md5(b"content")));
        assert!(ledger.has_entry("a.warc").unwrap());
        assert!(!ledger.has_entry("b.warc").unwrap());
    }

    #[test]
    fn test_upload_with_different_content_is_rejected() {
        let temp_dir = tempfile::tempdir().unwrap();
        let ledger = open_ledger(temp_dir.path());

        ledger.upload("a.warc", &mut Cursor::new(b"one")).unwrap();
        let err = ledger
            .upload("a.warc", &mut Cursor::new(b"two"))
            .unwrap_err();
        assert!(matches!(err, FixityError::InconsistentUpload { .. }));
        assert_eq!(ledger.get_checksum("a.warc").unwrap(), Some(md5(b"one")));
    }

    #[test]
    fn test_correct_replaces_checksum_and_records_dead_entry() {
        let temp_dir = tempfile::tempdir().unwrap();
        let ledger = open_ledger(temp_dir.path());
        ledger.upload("a.warc", &mut Cursor::new(b"bad")).unwrap();
        ledger.upload("b.warc", &mut Cursor::new(b"other")).unwrap();

        let removed = ledger.correct("a.warc", &mut Cursor::new(b"good")).unwrap();
        assert_eq!(removed.checksum, md5(b"bad"));
        assert_eq!(removed.replacement_checksum, md5(b"good"));
        assert_eq!(removed.to_line(), format!("a.warc##{}", md5(b"bad")));

        assert_eq!(ledger.get_checksum("a.warc").unwrap(), Some(md5(b"good")));
        assert_eq!(ledger.get_checksum("b.warc").unwrap(), Some(md5(b"other")));

        let dead = ledger.dead_entries().unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].filename, "a.warc");
        assert_eq!(dead[0].superseded_checksum, md5(b"bad"));

        let err = ledger
            .correct("a.warc", &mut Cursor::new(b"good"))
            .unwrap_err();
        assert!(matches!(err, FixityError::NoOpCorrection { .. }));
        assert_eq!(ledger.dead_entries().unwrap().len(), 1);
    }

    #[test]
    fn test_correct_unknown_file() {
        let temp_dir = tempfile::tempdir().unwrap();
        let ledger = open_ledger(temp_dir.path());
        let err = ledger
            .correct("missing.warc", &mut Cursor::new(b"x"))
            .unwrap_err();
        assert!(matches!(err, FixityError::NotFound(_)));
    }

    #[test]
    fn test_export_and_reload_round_trip() {
        let temp_dir = tempfile::tempdir().unwrap();
        let ledger = open_ledger(temp_dir.path());
        for (name, body) in [("a.warc", "1"), ("b.warc", "2"), ("c.arc", "3")] {
            ledger
                .upload(name, &mut Cursor::new(body.as_bytes()))
                .unwrap();
        }
        ledger.correct("b.warc", &mut Cursor::new(b"22")).unwrap();

        let exported = ledger.export_ledger().unwrap();
        let copy_path = temp_dir.path().join("copy").join("checksum.md5");
        fs::create_dir_all(copy_path.parent().unwrap()).unwrap();
        fs::write(&copy_path, &exported).unwrap();

        let copy = FileLedger::open(&copy_path, "CS", 0, ChecksumAlgorithm::Md5).unwrap();
        assert_eq!(copy.export_ledger().unwrap(), exported);
        for name in ["a.warc", "b.warc", "c.arc"] {
            assert_eq!(
                copy.get_checksum(name).unwrap(),
                ledger.get_checksum(name).unwrap()
            );
        }

        let names = String::from_utf8(ledger.export_filenames().unwrap().to_vec()).unwrap();
        assert_eq!(names, "a.warc\nb.warc\nc.arc\n");
    }

    #[test]
    fn test_failed_rewrite_leaves_ledger_untouched() {
        let temp_dir = tempfile::tempdir().unwrap();
        let ledger = open_ledger(temp_dir.path());
        ledger.upload("a.warc", &mut Cursor::new(b"bad")).unwrap();
        ledger.upload("b.warc", &mut Cursor::new(b"fine")).unwrap();
        let before = fs::read(ledger.path()).unwrap();

        // A directory squatting on the temporary path makes the snapshot fail.
        fs::create_dir(path_with_suffix(ledger.path(), ".tmp")).unwrap();

        let err = ledger
            .correct("a.warc", &mut Cursor::new(b"good"))
            .unwrap_err();
        assert!(err.is_storage_failure());
        assert_eq!(fs::read(ledger.path()).unwrap(), before);
        assert_eq!(ledger.get_checksum("a.warc").unwrap(), Some(md5(b"bad")));

        // the audit line was written ahead of the failed rewrite
        let dead = ledger.dead_entries().unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].superseded_checksum, md5(b"bad"));
    }

    #[test]
    fn test_external_modification_triggers_reload() {
        let temp_dir = tempfile::tempdir().unwrap();
        let ledger = open_ledger(temp_dir.path());
        ledger.upload("a.warc", &mut Cursor::new(b"1")).unwrap();

        let mut file = OpenOptions::new().append(true).open(ledger.path()).unwrap();
        writeln!(file, "late.warc##cafebabe").unwrap();
        drop(file);

        assert_eq!(
            ledger.get_checksum("late.warc").unwrap(),
            Some("cafebabe".to_string())
        );
    }

    #[test]
    fn test_bad_lines_are_quarantined_and_compacted() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("checksum.md5");
        fs::write(
            &path,
            "a.warc##aaa\nthis line is broken\nb.warc##bbb\na.warc##zzz\n",
        )
        .unwrap();

        let ledger = FileLedger::open(&path, "CS", 0, ChecksumAlgorithm::Md5).unwrap();
        assert_eq!(ledger.get_checksum("a.warc").unwrap(), Some("aaa".to_string()));
        assert_eq!(ledger.get_checksum("b.warc").unwrap(), Some("bbb".to_string()));

        let dead = ledger.dead_entries().unwrap();
        assert_eq!(dead.len(), 2);
        assert_eq!(dead[0].filename, "this line is broken");
        assert_eq!(dead[1].superseded_checksum, "zzz");

        // The next save rewrites the file without the quarantined lines.
        ledger.upload_checksum("c.warc", "ccc").unwrap();
        let raw = fs::read_to_string(&path).unwrap();
        assert_eq!(raw, "a.warc##aaa\nb.warc##bbb\nc.warc##ccc\n");
    }

    #[test]
    fn test_append_after_partial_last_line() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("checksum.md5");
        fs::write(&path, "a.warc##aaa\nb.warc##bbb").unwrap();

        let ledger = FileLedger::open(&path, "CS", 0, ChecksumAlgorithm::Md5).unwrap();
        ledger.upload_checksum("c.warc", "ccc").unwrap();
        assert_eq!(
            fs::read_to_string(&path).unwrap(),
            "a.warc##aaa\nb.warc##bbb\nc.warc##ccc\n"
        );

        let reopened = FileLedger::open(&path, "CS", 0, ChecksumAlgorithm::Md5).unwrap();
        assert_eq!(reopened.get_checksum("b.warc").unwrap().as_deref(), Some("bbb"));
        assert_eq!(reopened.get_checksum("c.warc").unwrap().as_deref(), Some("ccc"));
        assert!(reopened.dead_entries().unwrap().is_empty());
    }

    #[test]
    fn test_concurrent_uploads_are_all_persisted() {
        let temp_dir = tempfile::tempdir().unwrap();
        let ledger = Arc::new(open_ledger(temp_dir.path()));

        let handles: Vec<_> = (0..8)
            .map(|worker| {
                let ledger = ledger.clone();
                std::thread::spawn(move || {
                    for i in 0..25 {
                        let name = format!("w{}-{}.warc", worker, i);
                        ledger.upload_checksum(&name, &format!("{:032x}", i)).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let reopened = open_ledger(temp_dir.path());
        let exported = reopened.export_filenames().unwrap();
        assert_eq!(exported.iter().filter(|b| **b == b'\n').count(), 200);
    }

    #[test]
    fn test_has_enough_space() {
        let temp_dir = tempfile::tempdir().unwrap();
        let ledger = open_ledger(temp_dir.path());
        assert!(ledger.has_enough_space());

        let greedy = FileLedger::open(
            temp_dir.path().join("checksum.md5"),
            "CS",
            u64::MAX,
            ChecksumAlgorithm::Md5,
        )
        .unwrap();
        assert!(!greedy.has_enough_space());
    }
}
