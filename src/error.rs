//! Error taxonomy for the fetch and replay pipelines.
//!
//! Per-venue and per-entry failures ([`FetchError`], [`CorruptArchiveEntry`],
//! [`UnroutableEnvelope`], [`UnparseableEnvelope`]) are collected into run
//! reports. [`ArchiveWriteError`] is fatal: once the destination cannot be
//! written, nothing else in the run can be trusted.

use std::fmt;
use std::path::PathBuf;

// =============================================================================
// FETCH
// =============================================================================

/// Failure while fetching from one venue.
#[derive(Debug)]
pub enum FetchError {
    /// Transport-level failure (connect, TLS, body read).
    Http { venue: String, source: reqwest::Error },
    /// Request did not complete within the configured timeout.
    Timeout { venue: String, url: String },
    /// Credentials were rejected (401/403).
    Auth { venue: String, status: u16, body: String },
    /// Venue kept answering 429 after all retries.
    RateLimited { venue: String, url: String },
    /// Any other non-success response.
    Api { venue: String, status: u16, body: String },
    /// Response decoded but did not have the expected shape.
    Malformed { venue: String, reason: String },
    /// Adapter could not be set up from its configuration block.
    Config { venue: String, reason: String },
}

impl FetchError {
    pub fn malformed(venue: &str, reason: impl Into<String>) -> Self {
        Self::Malformed {
            venue: venue.to_string(),
            reason: reason.into(),
        }
    }

    /// Venue the failure belongs to.
    pub fn venue(&self) -> &str {
        match self {
            Self::Http { venue, .. }
            | Self::Timeout { venue, .. }
            | Self::Auth { venue, .. }
            | Self::RateLimited { venue, .. }
            | Self::Api { venue, .. }
            | Self::Malformed { venue, .. }
            | Self::Config { venue, .. } => venue,
        }
    }
}

impl fmt::Display for FetchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Http { venue, source } => write!(f, "{}: HTTP error: {}", venue, source),
            Self::Timeout { venue, url } => write!(f, "{}: request timed out: {}", venue, url),
            Self::Auth {
                venue,
                status,
                body,
            } => write!(f, "{}: authentication failed ({}): {}", venue, status, body),
            Self::RateLimited { venue, url } => {
                write!(f, "{}: rate limited after retries: {}", venue, url)
            }
            Self::Api {
                venue,
                status,
                body,
            } => write!(f, "{}: API error {}: {}", venue, status, body),
            Self::Malformed { venue, reason } => {
                write!(f, "{}: malformed vendor response: {}", venue, reason)
            }
            Self::Config { venue, reason } => write!(f, "{}: bad configuration: {}", venue, reason),
        }
    }
}

impl std::error::Error for FetchError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Http { source, .. } => Some(source),
            _ => None,
        }
    }
}

// =============================================================================
// ARCHIVE WRITE
// =============================================================================

/// Disk-level failure while persisting an envelope. Fatal to the run.
#[derive(Debug)]
pub enum ArchiveWriteError {
    CreateDir { path: PathBuf, source: std::io::Error },
    Write { path: PathBuf, source: std::io::Error },
    Rename { path: PathBuf, source: std::io::Error },
    Serialize { source: serde_json::Error },
}

impl fmt::Display for ArchiveWriteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CreateDir { path, source } => {
                write!(f, "failed to create archive dir {}: {}", path.display(), source)
            }
            Self::Write { path, source } => {
                write!(f, "failed to write {}: {}", path.display(), source)
            }
            Self::Rename { path, source } => {
                write!(f, "failed to move entry into place at {}: {}", path.display(), source)
            }
            Self::Serialize { source } => write!(f, "failed to serialize envelope: {}", source),
        }
    }
}

impl std::error::Error for ArchiveWriteError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::CreateDir { source, .. }
            | Self::Write { source, .. }
            | Self::Rename { source, .. } => Some(source),
            Self::Serialize { source } => Some(source),
        }
    }
}

impl From<serde_json::Error> for ArchiveWriteError {
    fn from(source: serde_json::Error) -> Self {
        Self::Serialize { source }
    }
}

// =============================================================================
// ARCHIVE READ
// =============================================================================

/// Why a stored file could not be turned back into an envelope.
#[derive(Debug)]
pub enum CorruptReason {
    Io(std::io::Error),
    InvalidJson(serde_json::Error),
    MissingField(&'static str),
    WrongType { field: &'static str, expected: &'static str },
    UnknownKind { venue: String, kind: String },
    InvalidTimestamp(String),
}

impl fmt::Display for CorruptReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "unreadable: {}", e),
            Self::InvalidJson(e) => write!(f, "invalid JSON: {}", e),
            Self::MissingField(field) => write!(f, "missing field `{}`", field),
            Self::WrongType { field, expected } => {
                write!(f, "field `{}` is not a {}", field, expected)
            }
            Self::UnknownKind { venue, kind } => {
                write!(f, "`{}` is not a kind of venue `{}`", kind, venue)
            }
            Self::InvalidTimestamp(ts) => write!(f, "invalid timestamp `{}`", ts),
        }
    }
}

/// A stored archive file that fails to deserialize.
#[derive(Debug)]
pub struct CorruptArchiveEntry {
    pub path: PathBuf,
    pub reason: CorruptReason,
}

impl CorruptArchiveEntry {
    pub fn new(path: impl Into<PathBuf>, reason: CorruptReason) -> Self {
        Self {
            path: path.into(),
            reason,
        }
    }
}

impl fmt::Display for CorruptArchiveEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "corrupt archive entry {}: {}", self.path.display(), self.reason)
    }
}

impl std::error::Error for CorruptArchiveEntry {}

// =============================================================================
// ROUTING / PARSING
// =============================================================================

/// No registered adapter claims the envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnroutableEnvelope {
    pub venue: String,
    pub kind: String,
}

impl fmt::Display for UnroutableEnvelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "no adapter handles venue `{}` kind `{}`",
            self.venue, self.kind
        )
    }
}

impl std::error::Error for UnroutableEnvelope {}

/// An adapter cannot turn an envelope into a ledger entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnparseableEnvelope {
    pub venue: String,
    pub kind: String,
    pub reason: String,
}

impl fmt::Display for UnparseableEnvelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "cannot parse {} {}: {}",
            self.venue, self.kind, self.reason
        )
    }
}

impl std::error::Error for UnparseableEnvelope {}

// =============================================================================
// CONFIG
// =============================================================================

#[derive(Debug)]
pub enum ConfigError {
    Io { path: PathBuf, source: std::io::Error },
    Toml(toml::de::Error),
    MissingCredential { venue: &'static str, field: &'static str, env: &'static str },
    Invalid(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io { path, source } => {
                write!(f, "cannot read config {}: {}", path.display(), source)
            }
            Self::Toml(e) => write!(f, "invalid config: {}", e),
            Self::MissingCredential { venue, field, env } => write!(
                f,
                "[{}] {} not set in config and {} not in environment",
                venue, field, env
            ),
            Self::Invalid(reason) => write!(f, "invalid config: {}", reason),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        Self::Toml(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fetch_error_carries_venue() {
        let err = FetchError::malformed("coinbasepro", "fills is not an array");
        assert_eq!(err.venue(), "coinbasepro");
        assert!(err.to_string().contains("fills is not an array"));
    }

    #[test]
    fn test_corrupt_entry_display_names_path() {
        let err = CorruptArchiveEntry::new("/tmp/a.json", CorruptReason::MissingField("raw"));
        let msg = err.to_string();
        assert!(msg.contains("/tmp/a.json"));
        assert!(msg.contains("`raw`"));
    }
}
