//! Content-Addressed Archive Store
//!
//! Persists each [`Envelope`] as exactly one JSON file whose name embeds the
//! SHA-256 of the envelope's canonical content:
//!
//! ```text
//! {venue}-{kind}-{YYYY-MM-DDTHH-MM-SS}-{sha256}.json
//! ```
//!
//! Re-archiving the same event lands on the same file name, so the directory
//! itself is the deduplication index. Writes go to a hidden temp file in the
//! same directory and are renamed into place, so a reader never observes a
//! half-written entry and concurrent writers never corrupt each other.
//!
//! The hash covers `venue`, `kind`, `timestamp` and `raw`; `meta` is stored in
//! the body but not hashed.

use chrono::{DateTime, NaiveDateTime, SubsecRound, TimeZone, Utc};
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info, warn};

use crate::envelope::{to_canonical_json, Envelope, StoredEnvelope};
use crate::error::{ArchiveWriteError, CorruptArchiveEntry, CorruptReason};

/// File name timestamp format (one-second granularity, no colons).
pub const FILE_TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H-%M-%S";

const FILE_EXTENSION: &str = "json";
const HASH_HEX_LEN: usize = 64;
const FILE_TIMESTAMP_LEN: usize = 19;

static TEMP_SEQ: AtomicU64 = AtomicU64::new(0);

// =============================================================================
// ADDRESSING
// =============================================================================

/// SHA-256 (lowercase hex) of the envelope's canonical content document.
pub fn content_hash(envelope: &Envelope) -> Result<String, serde_json::Error> {
    let canonical = to_canonical_json(&envelope.content_document())?;
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    Ok(format!("{:x}", hasher.finalize()))
}

/// Everything an archive file name says about its entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveKey {
    pub venue: String,
    pub kind: String,
    /// Event time truncated to the second.
    pub timestamp: DateTime<Utc>,
    pub hash: String,
}

impl ArchiveKey {
    pub fn for_envelope(envelope: &Envelope) -> Result<Self, serde_json::Error> {
        Ok(Self {
            venue: envelope.venue().to_string(),
            kind: envelope.kind().as_str().to_string(),
            timestamp: envelope.timestamp().trunc_subsecs(0),
            hash: content_hash(envelope)?,
        })
    }

    pub fn file_name(&self) -> String {
        format!(
            "{}-{}-{}-{}.{}",
            self.venue,
            self.kind,
            self.timestamp.format(FILE_TIMESTAMP_FORMAT),
            self.hash,
            FILE_EXTENSION
        )
    }

    /// Decode a file name produced by [`ArchiveKey::file_name`].
    ///
    /// The venue may contain dashes; kinds may not, so the kind is whatever
    /// follows the last dash before the timestamp.
    pub fn from_file_name(name: &str) -> Option<Self> {
        let stem = name.strip_suffix(&format!(".{}", FILE_EXTENSION))?;

        let (rest, hash) = stem.rsplit_once('-')?;
        if hash.len() != HASH_HEX_LEN || !hash.chars().all(|c| c.is_ascii_hexdigit()) {
            return None;
        }

        if rest.len() < FILE_TIMESTAMP_LEN + 1 {
            return None;
        }
        let split = rest.len() - FILE_TIMESTAMP_LEN;
        let (head, ts) = rest.split_at(split);
        let head = head.strip_suffix('-')?;
        let timestamp =
            Utc.from_utc_datetime(&NaiveDateTime::parse_from_str(ts, FILE_TIMESTAMP_FORMAT).ok()?);

        let (venue, kind) = head.rsplit_once('-')?;
        if venue.is_empty() || kind.is_empty() {
            return None;
        }

        Some(Self {
            venue: venue.to_string(),
            kind: kind.to_string(),
            timestamp,
            hash: hash.to_string(),
        })
    }
}

// =============================================================================
// STORE
// =============================================================================

/// What happened when an envelope was archived.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// New file.
    Created,
    /// File already held identical bytes; nothing written.
    Unchanged,
    /// Same content address, different body (only `meta` can differ).
    Replaced,
}

#[derive(Debug, Clone)]
pub struct ArchivedEntry {
    pub path: PathBuf,
    pub key: ArchiveKey,
    pub outcome: WriteOutcome,
}

/// Counts for a batch of archive writes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ArchiveSummary {
    pub created: usize,
    pub unchanged: usize,
    pub replaced: usize,
}

impl ArchiveSummary {
    pub fn record(&mut self, outcome: WriteOutcome) {
        match outcome {
            WriteOutcome::Created => self.created += 1,
            WriteOutcome::Unchanged => self.unchanged += 1,
            WriteOutcome::Replaced => self.replaced += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.created + self.unchanged + self.replaced
    }
}

/// Directory of content-addressed envelope files.
#[derive(Debug, Clone)]
pub struct ArchiveStore {
    root: PathBuf,
}

impl ArchiveStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for(&self, envelope: &Envelope) -> Result<PathBuf, ArchiveWriteError> {
        let key = ArchiveKey::for_envelope(envelope)?;
        Ok(self.root.join(key.file_name()))
    }

    /// Persist one envelope. Safe to call repeatedly and concurrently.
    pub fn archive(&self, envelope: &Envelope) -> Result<ArchivedEntry, ArchiveWriteError> {
        let key = ArchiveKey::for_envelope(envelope)?;
        let body = to_canonical_json(&envelope.document())?;
        let path = self.root.join(key.file_name());

        fs::create_dir_all(&self.root).map_err(|source| ArchiveWriteError::CreateDir {
            path: self.root.clone(),
            source,
        })?;

        let outcome = match fs::read(&path) {
            Ok(existing) if existing == body.as_bytes() => {
                debug!(path = %path.display(), "entry already archived");
                return Ok(ArchivedEntry {
                    path,
                    key,
                    outcome: WriteOutcome::Unchanged,
                });
            }
            Ok(_) => WriteOutcome::Replaced,
            Err(e) if e.kind() == io::ErrorKind::NotFound => WriteOutcome::Created,
            Err(source) => return Err(ArchiveWriteError::Write { path, source }),
        };

        write_atomic(&path, body.as_bytes())?;

        if outcome == WriteOutcome::Replaced {
            warn!(path = %path.display(), "archived entry body changed (meta differs)");
        } else {
            debug!(path = %path.display(), "archived entry");
        }

        Ok(ArchivedEntry { path, key, outcome })
    }

    /// Archive a batch, stopping at the first disk failure.
    pub fn archive_all<'a, I>(&self, envelopes: I) -> Result<ArchiveSummary, ArchiveWriteError>
    where
        I: IntoIterator<Item = &'a Envelope>,
    {
        let mut summary = ArchiveSummary::default();
        for envelope in envelopes {
            summary.record(self.archive(envelope)?.outcome);
        }
        info!(
            root = %self.root.display(),
            created = summary.created,
            unchanged = summary.unchanged,
            replaced = summary.replaced,
            "archive batch written"
        );
        Ok(summary)
    }

    /// Regular, non-hidden files in the archive. A missing directory is an
    /// empty archive. Sorted by name for stable reporting only.
    pub fn list(&self) -> io::Result<Vec<PathBuf>> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let mut paths = Vec::new();
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let hidden = entry.file_name().to_string_lossy().starts_with('.');
            if !hidden {
                paths.push(entry.path());
            }
        }
        paths.sort();
        Ok(paths)
    }

    /// Decode one stored file. Venue and kind stay plain strings until the
    /// registry resolves them.
    pub fn read(&self, path: &Path) -> Result<StoredEnvelope, CorruptArchiveEntry> {
        let bytes = fs::read(path).map_err(|e| CorruptArchiveEntry::new(path, CorruptReason::Io(e)))?;
        StoredEnvelope::from_slice(&bytes).map_err(|reason| CorruptArchiveEntry::new(path, reason))
    }
}

/// Write to a uniquely named hidden sibling, then rename over `path`.
fn write_atomic(path: &Path, contents: &[u8]) -> Result<(), ArchiveWriteError> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let temp_path = dir.join(format!(
        ".{}.{}.{}.tmp",
        name,
        std::process::id(),
        TEMP_SEQ.fetch_add(1, Ordering::Relaxed)
    ));

    let written = File::create(&temp_path).and_then(|mut file| {
        file.write_all(contents)?;
        file.sync_all()
    });
    if let Err(source) = written {
        let _ = fs::remove_file(&temp_path);
        return Err(ArchiveWriteError::Write {
            path: temp_path,
            source,
        });
    }

    if let Err(source) = fs::rename(&temp_path, path) {
        let _ = fs::remove_file(&temp_path);
        return Err(ArchiveWriteError::Rename {
            path: path.to_path_buf(),
            source,
        });
    }

    Ok(())
}
