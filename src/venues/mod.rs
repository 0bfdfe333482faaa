//! Venue adapters and the registry that routes envelopes between them.
//!
//! Each adapter owns one venue id and one closed kind vocabulary, and exposes
//! the capability set fetch / handles / parse. The registry is an ordered list
//! of adapters built from configuration; both pipeline flows walk it in that
//! order.

pub mod coinbase;
pub mod coinbase_api;
pub mod coinbasepro;
pub mod coinbasepro_api;
pub mod ethereum;
pub mod ethereum_rpc;
pub mod http;

use async_trait::async_trait;
use std::fmt;

use crate::config::Config;
use crate::envelope::{Envelope, Kind, StoredEnvelope, VenueKind};
use crate::error::{FetchError, UnparseableEnvelope, UnroutableEnvelope};
use crate::ledger::LedgerEntry;

/// Capability contract every venue implements.
#[async_trait]
pub trait Venue: Send + Sync {
    /// Stable lowercase venue identifier.
    fn id(&self) -> &'static str;

    /// The adapter's closed kind vocabulary.
    fn kinds(&self) -> Vec<Kind>;

    /// Look up a stored kind string in this adapter's vocabulary.
    fn resolve_kind(&self, name: &str) -> Option<Kind> {
        self.kinds().into_iter().find(|k| k.as_str() == name)
    }

    /// True iff the envelope carries this venue's id and one of its kinds.
    fn handles(&self, envelope: &Envelope) -> bool {
        envelope.venue() == self.id() && self.kinds().contains(&envelope.kind())
    }

    /// Pull freshly observed events. "Nothing new" is `Ok(vec![])`.
    async fn fetch(&self) -> Result<Vec<Envelope>, FetchError>;

    /// Turn one owned envelope into a ledger entry.
    fn parse(&self, envelope: &Envelope) -> Result<LedgerEntry, UnparseableEnvelope>;
}

/// Vocabulary of a kind enum as type-erased tags.
pub fn vocabulary<K: VenueKind>() -> Vec<Kind> {
    K::ALL.iter().map(|k| k.tag()).collect()
}

/// The adapter's own kind for `envelope`, or the error `parse` must return
/// when handed an envelope it does not own.
pub fn owned_kind<K: VenueKind>(envelope: &Envelope) -> Result<K, UnparseableEnvelope> {
    envelope.kind_as::<K>().ok_or_else(|| UnparseableEnvelope {
        venue: envelope.venue().to_string(),
        kind: envelope.kind().as_str().to_string(),
        reason: format!("not a {} envelope", K::VENUE),
    })
}

/// Why a stored document could not become an [`Envelope`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolveError {
    /// No adapter is registered for the venue.
    Unroutable(UnroutableEnvelope),
    /// The venue is known but the kind is outside its vocabulary.
    UnknownKind { venue: String, kind: String },
}

impl fmt::Display for ResolveError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unroutable(e) => write!(f, "{}", e),
            Self::UnknownKind { venue, kind } => {
                write!(f, "`{}` is not a kind of venue `{}`", kind, venue)
            }
        }
    }
}

impl std::error::Error for ResolveError {}

/// Ordered set of configured adapters.
#[derive(Default)]
pub struct VenueRegistry {
    venues: Vec<Box<dyn Venue>>,
}

impl VenueRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build adapters for every configured venue, in schema order:
    /// coinbase, coinbasepro, ethereum.
    pub fn from_config(config: &Config) -> Result<Self, FetchError> {
        let mut registry = Self::new();
        if let Some(cfg) = &config.coinbase {
            registry.register(Box::new(coinbase::CoinbaseVenue::new(
                cfg.clone(),
                config.http.clone(),
            )?));
        }
        if let Some(cfg) = &config.coinbasepro {
            registry.register(Box::new(coinbasepro::CoinbaseProVenue::new(
                cfg.clone(),
                config.http.clone(),
            )?));
        }
        if let Some(cfg) = &config.ethereum {
            registry.register(Box::new(ethereum::EthereumVenue::new(
                cfg.clone(),
                config.http.clone(),
            )?));
        }
        Ok(registry)
    }

    /// Append an adapter. Registration order is routing order.
    pub fn register(&mut self, venue: Box<dyn Venue>) {
        debug_assert!(
            self.get(venue.id()).is_none(),
            "venue `{}` registered twice",
            venue.id()
        );
        self.venues.push(venue);
    }

    pub fn venues(&self) -> impl Iterator<Item = &dyn Venue> {
        self.venues.iter().map(|v| v.as_ref())
    }

    pub fn len(&self) -> usize {
        self.venues.len()
    }

    pub fn is_empty(&self) -> bool {
        self.venues.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&dyn Venue> {
        self.venues().find(|v| v.id() == id)
    }

    /// Turn a stored document into an envelope by resolving its venue and
    /// kind strings against the registered vocabularies.
    pub fn resolve(&self, stored: StoredEnvelope) -> Result<Envelope, ResolveError> {
        let venue = match self.get(&stored.venue) {
            Some(venue) => venue,
            None => {
                return Err(ResolveError::Unroutable(UnroutableEnvelope {
                    venue: stored.venue,
                    kind: stored.kind,
                }))
            }
        };
        let kind = venue
            .resolve_kind(&stored.kind)
            .ok_or_else(|| ResolveError::UnknownKind {
                venue: stored.venue.clone(),
                kind: stored.kind.clone(),
            })?;
        Ok(Envelope::from_parts(
            venue.id(),
            kind,
            stored.timestamp,
            stored.raw,
            stored.meta,
        ))
    }

    /// First adapter (in registration order) whose `handles` accepts the
    /// envelope.
    pub fn route(&self, envelope: &Envelope) -> Result<&dyn Venue, UnroutableEnvelope> {
        self.venues()
            .find(|v| v.handles(envelope))
            .ok_or_else(|| UnroutableEnvelope {
                venue: envelope.venue().to_string(),
                kind: envelope.kind().as_str().to_string(),
            })
    }

    /// Every adapter claiming the envelope. More than one means the
    /// vocabularies overlap, which is a configuration bug.
    pub fn claimants(&self, envelope: &Envelope) -> Vec<&'static str> {
        self.venues()
            .filter(|v| v.handles(envelope))
            .map(|v| v.id())
            .collect()
    }
}

impl fmt::Debug for VenueRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.venues().map(|v| v.id())).finish()
    }
}
