//! Persisted integrity records, one YAML file per images directory.
//!
//! The file (`integrity.yaml`) maps image file names to the result of their
//! last check:
//!
//! ```yaml
//! files:
//!   ubuntu.img:
//!     type: raw
//!     method: sha256sum
//!     status: ok
//!     checked_at: 2025-03-01T10:12:44Z
//!     expected: 9f86d0...
//!     actual: 9f86d0...
//! ```
//!
//! Writes go to a temporary file in the same directory that is then renamed
//! over the record file, so a crash never leaves a torn file behind.
use crate::error::EngineError;
use crate::image::sidecar_path;
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use tempfile::NamedTempFile;

/// Name of the record file inside an images directory.
pub const RECORD_FILE_NAME: &str = "integrity.yaml";

static SHA256_HEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[0-9a-fA-F]{64}$").expect("valid digest regex"));
static DIGEST_PREFIX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[0-9a-fA-F]{64}\b").expect("valid digest regex"));

/// Whether the checked image was stored compressed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageType {
    Raw,
    Compressed,
}

/// The verdict of a check.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IntegrityStatus {
    /// Verified: the container checked out, or the digest matched the sidecar.
    Ok,
    /// Verification failed or the digest did not match.
    Failed,
    /// A digest was computed but there was nothing to compare it with.
    Computed,
}

impl IntegrityStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::Failed => "failed",
            Self::Computed => "computed",
        }
    }
}

/// The stored result of checking one image.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntegrityRecord {
    #[serde(rename = "type")]
    pub image_type: ImageType,
    pub method: String,
    pub status: IntegrityStatus,
    pub checked_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actual: Option<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct RecordFile {
    #[serde(default)]
    files: BTreeMap<String, IntegrityRecord>,
}

/// The record store of one images directory.
#[derive(Clone, Debug)]
pub struct IntegrityStore {
    path: PathBuf,
}

impl IntegrityStore {
    /// The store of the directory `dir`.
    pub fn in_dir(dir: &Path) -> Self {
        Self {
            path: dir.join(RECORD_FILE_NAME),
        }
    }

    /// The store holding records for `image`.
    pub fn for_image(image: &Path) -> Self {
        Self::in_dir(image.parent().unwrap_or_else(|| Path::new(".")))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// All records. A missing file is an empty store; an unreadable or
    /// malformed one is reported.
    pub fn load(&self) -> Result<BTreeMap<String, IntegrityRecord>, EngineError> {
        let text = match fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(e) => return Err(self.error(e)),
        };
        if text.trim().is_empty() {
            return Ok(BTreeMap::new());
        }
        let file: RecordFile = serde_yaml_ng::from_str(&text).map_err(|e| self.error(e))?;
        Ok(file.files)
    }

    /// The record of `image`, if one exists and the store is readable.
    pub fn lookup(&self, image: &Path) -> Option<IntegrityRecord> {
        let name = image.file_name()?.to_string_lossy().to_string();
        match self.load() {
            Ok(mut records) => records.remove(&name),
            Err(e) => {
                tracing::warn!(error = %e, "cannot read integrity records");
                None
            }
        }
    }

    /// Inserts or replaces the record of `image` and rewrites the file atomically.
    ///
    /// A malformed existing file is replaced rather than blocking the write.
    pub fn save(&self, image: &Path, record: IntegrityRecord) -> Result<(), EngineError> {
        let name = image
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .ok_or_else(|| self.error("image path has no file name"))?;

        let mut files = self.load().unwrap_or_else(|e| {
            tracing::warn!(error = %e, "replacing unreadable integrity records");
            BTreeMap::new()
        });
        files.insert(name, record);

        let yaml = serde_yaml_ng::to_string(&RecordFile { files }).map_err(|e| self.error(e))?;
        let dir = self.path.parent().unwrap_or_else(|| Path::new("."));
        let mut tmp = NamedTempFile::new_in(dir).map_err(|e| self.error(e))?;
        tmp.write_all(yaml.as_bytes()).map_err(|e| self.error(e))?;
        tmp.as_file().sync_all().map_err(|e| self.error(e))?;
        tmp.persist(&self.path).map_err(|e| self.error(e.error))?;
        tracing::info!(path = %self.path.display(), "integrity record saved");
        Ok(())
    }

    fn error(&self, reason: impl std::fmt::Display) -> EngineError {
        EngineError::Record {
            path: self.path.clone(),
            reason: reason.to_string(),
        }
    }
}

/// What the sidecar next to a raw image says about its expected digest.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Sidecar {
    /// A well-formed 64-hex-character SHA-256, lowercased.
    Expected(String),
    /// The sidecar exists but does not start with a SHA-256 value.
    Malformed,
    /// There is no readable sidecar.
    Missing,
}

/// Reads the `<image>.checksum` sidecar.
///
/// The first whitespace-separated field is used, so both a bare digest and
/// `sha256sum` output (`<digest>  <name>`) are accepted.
pub fn read_sidecar(image: &Path) -> Sidecar {
    let Ok(text) = fs::read_to_string(sidecar_path(image)) else {
        return Sidecar::Missing;
    };
    match text.split_whitespace().next() {
        Some(field) if SHA256_HEX.is_match(field) => Sidecar::Expected(field.to_ascii_lowercase()),
        _ => Sidecar::Malformed,
    }
}

/// Extracts a digest from a line of hasher output such as
/// `e3b0c442...b855  -`.
pub fn digest_from_line(line: &str) -> Option<String> {
    let line = line.trim();
    if !DIGEST_PREFIX.is_match(line) {
        return None;
    }
    line.split_whitespace().next().map(str::to_ascii_lowercase)
}
