//! bean-fetch library
//!
//! Venue adapters, the canonical envelope, the content-addressed archive and
//! the fetch / replay pipelines. The `bean-fetch` binary is a thin CLI over
//! [`pipeline`].

pub mod archive;
pub mod config;
pub mod envelope;
pub mod error;
pub mod ledger;
pub mod pipeline;
pub mod venues;

pub use archive::{ArchiveKey, ArchiveStore, ArchiveSummary, WriteOutcome};
pub use config::Config;
pub use envelope::{Envelope, Kind, Meta, StoredEnvelope, VenueKind};
pub use error::{
    ArchiveWriteError, ConfigError, CorruptArchiveEntry, FetchError, UnparseableEnvelope,
    UnroutableEnvelope,
};
pub use ledger::{LedgerEntry, Posting};
pub use pipeline::{fetch_and_archive, replay_and_parse, FetchReport, ParseReport};
pub use venues::{Venue, VenueRegistry};
