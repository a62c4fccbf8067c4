use crate::error::{FixityError, Result};
use md5::Md5;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::io::Read;
use std::str::FromStr;

/// Separator between filename and checksum in ledger files and checksum reports.
pub const CHECKSUM_SEPARATOR: &str = "##";

const READ_BUFFER_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChecksumAlgorithm {
    #[default]
    Md5,
    Sha256,
}

impl ChecksumAlgorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChecksumAlgorithm::Md5 => "md5",
            ChecksumAlgorithm::Sha256 => "sha256",
        }
    }

    /// Stream `reader` to the end and return the lowercase hex digest.
    pub fn compute<R: Read + ?Sized>(&self, reader: &mut R) -> Result<String> {
        match self {
            ChecksumAlgorithm::Md5 => digest_reader::<Md5, R>(reader),
            ChecksumAlgorithm::Sha256 => digest_reader::<Sha256, R>(reader),
        }
    }

    pub fn compute_bytes(&self, data: &[u8]) -> String {
        match self {
            ChecksumAlgorithm::Md5 => hex::encode(Md5::digest(data)),
            ChecksumAlgorithm::Sha256 => hex::encode(Sha256::digest(data)),
        }
    }
}

impl fmt::Display for ChecksumAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChecksumAlgorithm {
    type Err = FixityError;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "md5" => Ok(ChecksumAlgorithm::Md5),
            "sha256" | "sha-256" => Ok(ChecksumAlgorithm::Sha256),
            other => Err(FixityError::Config(format!(
                "unsupported checksum algorithm: {}",
                other
            ))),
        }
    }
}

fn digest_reader<D: Digest, R: Read + ?Sized>(reader: &mut R) -> Result<String> {
    let mut hasher = D::new();
    let mut buffer = vec![0u8; READ_BUFFER_SIZE];
    loop {
        let read = reader.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// One `filename##checksum` pair, as found in ledgers and checksum reports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChecksumEntry {
    pub filename: String,
    pub checksum: String,
}

impl ChecksumEntry {
    pub fn new(filename: impl Into<String>, checksum: impl Into<String>) -> Self {
        Self {
            filename: filename.into(),
            checksum: checksum.into(),
        }
    }

    /// Parse a single line. Returns `None` for lines without a filename part
    /// and a checksum part.
    pub fn parse_line(line: &str) -> Option<Self> {
        let line = line.trim_end_matches(['\r', '\n']);
        let (filename, checksum) = line.split_once(CHECKSUM_SEPARATOR)?;
        let checksum = checksum.trim();
        if filename.is_empty() || checksum.is_empty() || checksum.contains(CHECKSUM_SEPARATOR) {
            return None;
        }
        Some(Self::new(filename, checksum))
    }

    /// Format without the trailing newline.
    pub fn to_line(&self) -> String {
        format!("{}{}{}", self.filename, CHECKSUM_SEPARATOR, self.checksum)
    }
}

impl fmt::Display for ChecksumEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.filename, CHECKSUM_SEPARATOR, self.checksum)
    }
}

pub(crate) fn validate_filename(filename: &str) -> Result<()> {
    if filename.trim().is_empty() {
        return Err(FixityError::InvalidRequest(
            "filename cannot be empty".to_string(),
        ));
    }
    if filename.contains(CHECKSUM_SEPARATOR) || filename.contains('\n') {
        return Err(FixityError::InvalidRequest(format!(
            "filename contains a reserved sequence: {}",
            filename
        )));
    }
    Ok(())
}

pub(crate) fn validate_checksum(checksum: &str) -> Result<()> {
    if checksum.trim().is_empty() {
        return Err(FixityError::InvalidRequest(
            "checksum cannot be empty".to_string(),
        ));
    }
    if checksum.contains(CHECKSUM_SEPARATOR) || checksum.contains('\n') {
        return Err(FixityError::InvalidRequest(format!(
            "checksum contains a reserved sequence: {}",
            checksum
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_md5_matches_known_digest() {
        let mut input = Cursor::new(b"hello world".to_vec());
        let digest = ChecksumAlgorithm::Md5.compute(&mut input).unwrap();
        assert_eq!(digest, "5eb63bbbe01eeed093cb22bb8f5acdc3");
    }

    #[test]
    fn test_streaming_and_in_memory_agree() {
        let data = vec![7u8; READ_BUFFER_SIZE * 2 + 13];
        let streamed = ChecksumAlgorithm::Sha256
            .compute(&mut Cursor::new(data.clone()))
            .unwrap();
        assert_eq!(streamed, ChecksumAlgorithm::Sha256.compute_bytes(&data));
        assert_eq!(streamed.len(), 64);
    }

    #[test]
    fn test_parse_line() {
        let entry = ChecksumEntry::parse_line("1-1-20090101-0.arc##abc123\r\n").unwrap();
        assert_eq!(entry.filename, "1-1-20090101-0.arc");
        assert_eq!(entry.checksum, "abc123");
        assert_eq!(entry.to_line(), "1-1-20090101-0.arc##abc123");

        assert!(ChecksumEntry::parse_line("no separator here").is_none());
        assert!(ChecksumEntry::parse_line("##abc").is_none());
        assert!(ChecksumEntry::parse_line("file.arc##").is_none());
        assert!(ChecksumEntry::parse_line("file.arc##a##b").is_none());
    }

    #[test]
    fn test_algorithm_from_str() {
        assert_eq!("MD5".parse::<ChecksumAlgorithm>().unwrap(), ChecksumAlgorithm::Md5);
        assert_eq!(
            "sha256".parse::<ChecksumAlgorithm>().unwrap(),
            ChecksumAlgorithm::Sha256
        );
        assert!("crc32".parse::<ChecksumAlgorithm>().is_err());
    }
}
