//! File operations on the flat photo directory.
//!
//! Every function here is blocking; handlers call them through
//! `tokio::task::spawn_blocking`. The directory is shared with the capture
//! pipeline and with other clients, so a file may disappear between any two
//! calls and callers treat that as "not found".

use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::io::{self, Cursor, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use chrono::{DateTime, Local, Utc};
use tracing::{debug, error, info, warn};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

/// A persisted capture in the output directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhotoFile {
    pub filename: String,
    pub modified_ms: i64,
}

impl PhotoFile {
    /// Local wall-clock modification time, `yyyy/MM/dd HH:mm:ss`.
    pub fn formatted_date(&self) -> String {
        DateTime::from_timestamp_millis(self.modified_ms)
            .map(|dt| dt.with_timezone(&Local).format("%Y/%m/%d %H:%M:%S").to_string())
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum PhotoLookupError {
    #[error("invalid filename")]
    InvalidName,
    #[error("not found or access denied")]
    NotFound,
}

/// Full match of `^[A-Za-z0-9._-]+$`.
pub fn is_valid_filename(name: &str) -> bool {
    !name.is_empty()
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'-'))
}

/// Resolve `name` to a regular file directly inside `dir`.
///
/// The joined path is canonicalized, so `..` components and symlinks that
/// lead outside the directory fail the parent check.
pub fn resolve_photo(dir: &Path, name: &str) -> Result<PathBuf, PhotoLookupError> {
    if !is_valid_filename(name) {
        return Err(PhotoLookupError::InvalidName);
    }
    let canonical_dir = dir.canonicalize().map_err(|_| PhotoLookupError::NotFound)?;
    resolve_in(&canonical_dir, name)
}

fn resolve_in(canonical_dir: &Path, name: &str) -> Result<PathBuf, PhotoLookupError> {
    if !is_valid_filename(name) {
        return Err(PhotoLookupError::InvalidName);
    }
    let resolved = canonical_dir
        .join(name)
        .canonicalize()
        .map_err(|_| PhotoLookupError::NotFound)?;
    if resolved.parent() != Some(canonical_dir) || !resolved.is_file() {
        return Err(PhotoLookupError::NotFound);
    }
    Ok(resolved)
}

fn has_jpg_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("jpg"))
}

fn modified_ms(modified: io::Result<SystemTime>) -> i64 {
    modified
        .map(|t| DateTime::<Utc>::from(t).timestamp_millis())
        .unwrap_or(0)
}

/// All `*.jpg` files in `dir`, newest first. `None` if `dir` does not exist.
///
/// Only names that [`resolve_photo`] accepts are listed, so every entry can
/// be fetched by name.
pub fn list_photos(dir: &Path) -> io::Result<Option<Vec<PhotoFile>>> {
    if !dir.is_dir() {
        return Ok(None);
    }
    let canonical_dir = dir.canonicalize()?;
    let mut photos = Vec::new();
    for entry in fs::read_dir(&canonical_dir)?.flatten() {
        let path = entry.path();
        if !has_jpg_extension(&path) {
            continue;
        }
        let Some(filename) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        let resolved = match resolve_in(&canonical_dir, filename) {
            Ok(p) => p,
            Err(e) => {
                debug!(filename, reason = %e, "not listed");
                continue;
            }
        };
        // Entries deleted since read_dir started simply drop out.
        let Ok(metadata) = fs::metadata(&resolved) else {
            continue;
        };
        photos.push(PhotoFile {
            filename: filename.to_string(),
            modified_ms: modified_ms(metadata.modified()),
        });
    }
    photos.sort_by(|a, b| {
        b.modified_ms
            .cmp(&a.modified_ms)
            .then_with(|| b.filename.cmp(&a.filename))
    });
    Ok(Some(photos))
}

/// Most recently modified photo. `None` if `dir` is missing or holds no photos.
pub fn latest_photo(dir: &Path) -> io::Result<Option<PhotoFile>> {
    Ok(list_photos(dir)?.and_then(|photos| photos.into_iter().next()))
}

/// In-memory archive of the requested photos.
#[derive(Debug)]
pub struct ZipBundle {
    pub bytes: Vec<u8>,
    /// Entry names in archive order.
    pub entries: Vec<String>,
}

/// Zip every valid, existing, in-directory file named in `names`.
///
/// Names that fail lookup or cannot be read are logged and skipped. Only a
/// failure of the archive writer itself is returned.
pub fn zip_photos(dir: &Path, names: &[String]) -> io::Result<ZipBundle> {
    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
    let mut entries = Vec::new();
    let mut seen = HashSet::new();

    for name in names {
        let path = match resolve_photo(dir, name) {
            Ok(p) => p,
            Err(e) => {
                warn!(filename = name, reason = %e, "skipping file for zip");
                continue;
            }
        };
        if !seen.insert(name.as_str()) {
            debug!(filename = name, "duplicate zip entry ignored");
            continue;
        }
        let data = match fs::read(&path) {
            Ok(d) => d,
            Err(e) => {
                error!(error = %e, filename = name, "failed to read file for zip");
                continue;
            }
        };
        writer
            .start_file(name.as_str(), options)
            .map_err(io::Error::other)?;
        writer.write_all(&data)?;
        entries.push(name.clone());
        debug!(filename = name, bytes = data.len(), "added to zip");
    }

    let bytes = writer.finish().map_err(io::Error::other)?.into_inner();
    Ok(ZipBundle { bytes, entries })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeletionStatus {
    Deleted,
    Failed,
    SkippedInvalid,
    NotFoundOrDenied,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeletionOutcome {
    pub filename: String,
    pub status: DeletionStatus,
}

impl fmt::Display for DeletionOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self.status {
            DeletionStatus::Deleted => "Deleted",
            DeletionStatus::Failed => "Failed to delete",
            DeletionStatus::SkippedInvalid => "Skipped invalid filename",
            DeletionStatus::NotFoundOrDenied => "Not found or access denied",
        };
        write!(f, "{label}: {}", self.filename)
    }
}

/// Delete each named file, one outcome per requested name in request order.
pub fn delete_photos(dir: &Path, names: &[String]) -> Vec<DeletionOutcome> {
    names
        .iter()
        .map(|name| DeletionOutcome {
            filename: name.clone(),
            status: delete_one(dir, name),
        })
        .collect()
}

fn delete_one(dir: &Path, name: &str) -> DeletionStatus {
    let path = match resolve_photo(dir, name) {
        Ok(p) => p,
        Err(PhotoLookupError::InvalidName) => {
            warn!(filename = name, "skipping invalid filename for deletion");
            return DeletionStatus::SkippedInvalid;
        }
        Err(PhotoLookupError::NotFound) => {
            warn!(filename = name, dir = %dir.display(), "image not found for deletion");
            return DeletionStatus::NotFoundOrDenied;
        }
    };
    match fs::remove_file(&path) {
        Ok(()) => {
            info!(path = %path.display(), "image deleted");
            DeletionStatus::Deleted
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => DeletionStatus::NotFoundOrDenied,
        Err(e) => {
            error!(error = %e, path = %path.display(), "failed to delete image");
            DeletionStatus::Failed
        }
    }
}

pub fn deletion_summary(outcomes: &[DeletionOutcome]) -> &'static str {
    if outcomes.iter().all(|o| o.status == DeletionStatus::Deleted) {
        "All selected images processed successfully."
    } else {
        "Batch deletion process completed with some issues."
    }
}
