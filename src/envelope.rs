//! Canonical Envelope
//!
//! The single normalized record every venue produces and every other part of
//! the system consumes. An [`Envelope`] is immutable: adapters build it in
//! `fetch`, the archive persists it verbatim, replay reconstructs it unchanged
//! and exactly one adapter consumes it in `parse`.
//!
//! # Document form
//!
//! ```text
//! {
//!     "kind": "buy",
//!     "meta": { "account_id": "1" },            // or null
//!     "raw": { ...venue-native payload... },
//!     "timestamp": "2024-01-01T00:00:00.000000Z",
//!     "venue": "coinbase"
//! }
//! ```
//!
//! Keys are sorted recursively and the document is pretty-printed with a
//! four-space indent, so the same envelope always serializes to the same bytes.

use chrono::{DateTime, NaiveDateTime, SubsecRound, TimeZone, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;

use crate::error::CorruptReason;

/// Body timestamp format: RFC 3339, UTC, microsecond precision.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6fZ";

/// Legacy body format without zone designator (interpreted as UTC).
const LEGACY_TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.f";

/// Auxiliary, non-authoritative key/value fields.
pub type Meta = BTreeMap<String, String>;

// =============================================================================
// VENUE-SCOPED KINDS
// =============================================================================

/// A closed, venue-scoped vocabulary of transaction kinds.
///
/// Each adapter defines one enum implementing this trait. The string lookup is
/// total over `ALL` and returns `None` for anything else, so an unknown string
/// is always surfaced instead of being coerced.
pub trait VenueKind: Copy + Eq + fmt::Debug + Send + Sync + 'static {
    /// Identifier of the venue owning this vocabulary.
    const VENUE: &'static str;

    /// Every member of the vocabulary.
    const ALL: &'static [Self];

    fn as_str(self) -> &'static str;

    fn from_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|k| k.as_str() == name)
    }

    /// Type-erased tag carried by [`Envelope`].
    fn tag(self) -> Kind {
        Kind(self.as_str())
    }
}

/// Type-erased member of some venue's kind vocabulary.
///
/// Only obtainable through [`VenueKind::tag`], so every `Kind` in circulation
/// belongs to a declared vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Kind(&'static str);

impl Kind {
    pub fn as_str(&self) -> &'static str {
        self.0
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0)
    }
}

// =============================================================================
// ENVELOPE
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    venue: &'static str,
    kind: Kind,
    timestamp: DateTime<Utc>,
    raw: Value,
    meta: Option<Meta>,
}

impl Envelope {
    /// Build an envelope stamped with the venue owning `kind`.
    ///
    /// The timestamp is truncated to microseconds, the precision of the stored
    /// document.
    pub fn new<K: VenueKind>(
        kind: K,
        timestamp: DateTime<Utc>,
        raw: Value,
        meta: Option<Meta>,
    ) -> Self {
        Self::from_parts(K::VENUE, kind.tag(), timestamp, raw, meta)
    }

    pub(crate) fn from_parts(
        venue: &'static str,
        kind: Kind,
        timestamp: DateTime<Utc>,
        raw: Value,
        meta: Option<Meta>,
    ) -> Self {
        Self {
            venue,
            kind,
            timestamp: timestamp.trunc_subsecs(6),
            raw,
            meta,
        }
    }

    pub fn venue(&self) -> &'static str {
        self.venue
    }

    pub fn kind(&self) -> Kind {
        self.kind
    }

    /// Recover the adapter's own kind enum, if this envelope belongs to it.
    pub fn kind_as<K: VenueKind>(&self) -> Option<K> {
        if self.venue != K::VENUE {
            return None;
        }
        K::from_name(self.kind.as_str())
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn raw(&self) -> &Value {
        &self.raw
    }

    pub fn meta(&self) -> Option<&Meta> {
        self.meta.as_ref()
    }

    pub fn meta_value(&self, key: &str) -> Option<&str> {
        self.meta.as_ref()?.get(key).map(String::as_str)
    }

    /// Authoritative content: venue, kind, timestamp and raw. `meta` is left
    /// out, so two observations of the same event that differ only in
    /// auxiliary fields share a content hash.
    pub fn content_document(&self) -> Value {
        Value::Object(self.content_map())
    }

    /// Full stored document, `meta` included.
    pub fn document(&self) -> Value {
        let mut doc = self.content_map();
        let meta = match &self.meta {
            Some(meta) => Value::Object(
                meta.iter()
                    .map(|(k, v)| (k.clone(), Value::String(v.clone())))
                    .collect(),
            ),
            None => Value::Null,
        };
        doc.insert("meta".to_string(), meta);
        canonicalize(&Value::Object(doc))
    }

    fn content_map(&self) -> Map<String, Value> {
        let mut doc = Map::new();
        doc.insert("kind".to_string(), Value::String(self.kind.as_str().to_string()));
        doc.insert("raw".to_string(), canonicalize(&self.raw));
        doc.insert("timestamp".to_string(), Value::String(format_timestamp(&self.timestamp)));
        doc.insert("venue".to_string(), Value::String(self.venue.to_string()));
        doc
    }
}

impl fmt::Display for Envelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{} @ {}",
            self.venue,
            self.kind,
            format_timestamp(&self.timestamp)
        )
    }
}

// =============================================================================
// CANONICAL SERIALIZATION
// =============================================================================

/// Rebuild `value` with every object's keys in sorted order.
///
/// Holds regardless of whether serde_json's map preserves insertion order.
pub fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            let mut sorted = Map::with_capacity(entries.len());
            for (k, v) in entries {
                sorted.insert(k.clone(), canonicalize(v));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

/// Pretty-print a document in canonical form (sorted keys, four-space indent,
/// trailing newline).
pub fn to_canonical_json(value: &Value) -> Result<String, serde_json::Error> {
    let canonical = canonicalize(value);
    let mut buf = Vec::with_capacity(256);
    let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
    let mut ser = serde_json::Serializer::with_formatter(&mut buf, formatter);
    canonical.serialize(&mut ser)?;
    buf.push(b'\n');
    // serde_json only ever emits UTF-8
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.format(TIMESTAMP_FORMAT).to_string()
}

/// Parse a body timestamp. Accepts RFC 3339 with any offset (normalized to
/// UTC) and the zone-less legacy form.
pub fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(s) {
        return Some(ts.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(s, LEGACY_TIMESTAMP_FORMAT)
        .ok()
        .map(|naive| Utc.from_utc_datetime(&naive))
}

// =============================================================================
// STORED FORM
// =============================================================================

/// An archive document decoded field by field, before its venue and kind are
/// resolved against the registered adapters.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredEnvelope {
    pub venue: String,
    pub kind: String,
    pub timestamp: DateTime<Utc>,
    pub raw: Value,
    pub meta: Option<Meta>,
}

impl StoredEnvelope {
    pub fn from_slice(bytes: &[u8]) -> Result<Self, CorruptReason> {
        let value: Value = serde_json::from_slice(bytes).map_err(CorruptReason::InvalidJson)?;
        Self::from_value(value)
    }

    pub fn from_value(value: Value) -> Result<Self, CorruptReason> {
        let mut doc = match value {
            Value::Object(map) => map,
            _ => {
                return Err(CorruptReason::WrongType {
                    field: "<root>",
                    expected: "object",
                })
            }
        };

        let venue = take_string(&mut doc, "venue")?;
        let kind = take_string(&mut doc, "kind")?;
        let ts_raw = take_string(&mut doc, "timestamp")?;
        let timestamp =
            parse_timestamp(&ts_raw).ok_or(CorruptReason::InvalidTimestamp(ts_raw))?;

        // a present `null` is a legitimate payload; only an absent key is corrupt
        let raw = doc.remove("raw").ok_or(CorruptReason::MissingField("raw"))?;

        let meta = match doc.remove("meta") {
            None | Some(Value::Null) => None,
            Some(Value::Object(map)) => {
                let mut meta = Meta::new();
                for (k, v) in map {
                    match v {
                        Value::String(s) => {
                            meta.insert(k, s);
                        }
                        _ => {
                            return Err(CorruptReason::WrongType {
                                field: "meta",
                                expected: "mapping of strings",
                            })
                        }
                    }
                }
                Some(meta)
            }
            Some(_) => {
                return Err(CorruptReason::WrongType {
                    field: "meta",
                    expected: "mapping of strings",
                })
            }
        };

        Ok(Self {
            venue,
            kind,
            timestamp,
            raw,
            meta,
        })
    }
}

fn take_string(doc: &mut Map<String, Value>, field: &'static str) -> Result<String, CorruptReason> {
    match doc.remove(field) {
        None | Some(Value::Null) => Err(CorruptReason::MissingField(field)),
        Some(Value::String(s)) => Ok(s),
        Some(_) => Err(CorruptReason::WrongType {
            field,
            expected: "string",
        }),
    }
}
