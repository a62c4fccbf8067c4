//! Translators from batch-job report files to store calls.

use crate::checksum::{ChecksumEntry, validate_filename};
use crate::consistency::ConsistencyStore;
use crate::error::{FixityError, Result};
use crate::ledger::ChecksumLedger;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::BufRead;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportKind {
    Checksum,
    Filelist,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestSummary {
    pub accepted: usize,
    /// Malformed lines.
    pub skipped: usize,
    /// Repeated filenames carrying the same value as their first occurrence,
    /// or entries the ledger already holds.
    pub duplicates: usize,
    /// Repeated filenames with a different checksum, or ledger entries that
    /// disagree with the report.
    pub conflicts: usize,
}

fn read_lines<R: BufRead>(mut reader: R) -> Result<Vec<String>> {
    let mut lines = Vec::new();
    let mut buffer = Vec::new();
    loop {
        buffer.clear();
        if reader.read_until(b'\n', &mut buffer)? == 0 {
            break;
        }
        let line = String::from_utf8_lossy(&buffer);
        let line = line.trim_end_matches(['\r', '\n']);
        if !line.trim().is_empty() {
            lines.push(line.to_string());
        }
    }
    Ok(lines)
}

/// Parse a `filename##checksum` report. The first occurrence of a filename
/// wins.
pub fn parse_checksum_report<R: BufRead>(reader: R) -> Result<(Vec<ChecksumEntry>, IngestSummary)> {
    let mut summary = IngestSummary::default();
    let mut entries: Vec<ChecksumEntry> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();

    for line in read_lines(reader)? {
        let Some(entry) = ChecksumEntry::parse_line(&line) else {
            tracing::warn!("Skipping malformed checksum line: {}", line);
            summary.skipped += 1;
            continue;
        };

        match index.get(&entry.filename) {
            Some(&position) if entries[position].checksum == entry.checksum => {
                tracing::debug!("Duplicate checksum line for '{}'", entry.filename);
                summary.duplicates += 1;
            }
            Some(&position) => {
                tracing::warn!(
                    "Conflicting checksums for '{}' in report: '{}' and '{}', keeping the first",
                    entry.filename,
                    entries[position].checksum,
                    entry.checksum
                );
                summary.conflicts += 1;
            }
            None => {
                index.insert(entry.filename.clone(), entries.len());
                entries.push(entry);
                summary.accepted += 1;
            }
        }
    }

    Ok((entries, summary))
}

/// Parse a file listing, one filename per line.
pub fn parse_filelist_report<R: BufRead>(reader: R) -> Result<(Vec<String>, IngestSummary)> {
    let mut summary = IngestSummary::default();
    let mut filenames = Vec::new();
    let mut seen = std::collections::HashSet::new();

    for line in read_lines(reader)? {
        let filename = line.trim();
        if validate_filename(filename).is_err() {
            tracing::warn!("Skipping malformed file list line: {}", line);
            summary.skipped += 1;
            continue;
        }
        if !seen.insert(filename.to_string()) {
            tracing::warn!("File '{}' is listed more than once", filename);
            summary.duplicates += 1;
            continue;
        }
        filenames.push(filename.to_string());
        summary.accepted += 1;
    }

    Ok((filenames, summary))
}

pub fn ingest_checksum_report<R: BufRead>(
    store: &ConsistencyStore,
    reader: R,
    replica_id: &str,
) -> Result<IngestSummary> {
    store.replica(replica_id)?;
    let (entries, summary) = parse_checksum_report(reader)?;
    store.add_checksum_information(&entries, replica_id)?;
    Ok(summary)
}

pub fn ingest_filelist_report<R: BufRead>(
    store: &ConsistencyStore,
    reader: R,
    replica_id: &str,
) -> Result<IngestSummary> {
    store.replica(replica_id)?;
    let (filenames, summary) = parse_filelist_report(reader)?;
    store.add_file_list_information(&filenames, replica_id)?;
    Ok(summary)
}

/// Seed a ledger from a checksum report. Entries that disagree with the
/// ledger are counted, not fatal.
pub fn load_checksum_report_into_ledger<R: BufRead>(
    ledger: &dyn ChecksumLedger,
    reader: R,
) -> Result<IngestSummary> {
    let (entries, mut summary) = parse_checksum_report(reader)?;
    summary.accepted = 0;

    for entry in &entries {
        match ledger.upload_checksum(&entry.filename, &entry.checksum) {
            Ok(true) => summary.accepted += 1,
            Ok(false) => summary.duplicates += 1,
            Err(FixityError::InconsistentUpload {
                filename, archived, ..
            }) => {
                tracing::warn!(
                    "Ledger already holds '{}' with checksum '{}', report says '{}'",
                    filename,
                    archived,
                    entry.checksum
                );
                summary.conflicts += 1;
            }
            Err(e) => return Err(e),
        }
    }

    tracing::info!(
        "Loaded {} of {} report entries into the ledger",
        summary.accepted,
        entries.len()
    );
    Ok(summary)
}
