//! End-to-end runs of both pipeline flows against a temp archive, using
//! in-memory venues so no network is involved.

use async_trait::async_trait;
use bean_fetch::archive::{ArchiveKey, ArchiveStore, WriteOutcome};
use bean_fetch::envelope::{Envelope, Kind, Meta, VenueKind};
use bean_fetch::error::{ArchiveWriteError, CorruptReason, FetchError, UnparseableEnvelope};
use bean_fetch::ledger::{LedgerEntry, Posting, RawFields};
use bean_fetch::pipeline::{fetch_and_archive, replay_and_parse};
use bean_fetch::venues::coinbase::CoinbaseKind;
use bean_fetch::venues::{owned_kind, vocabulary, Venue, VenueRegistry};
use chrono::{DateTime, TimeZone, Utc};
use serde_json::{json, Value};
use std::marker::PhantomData;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AlphaKind {
    Deposit,
}

impl VenueKind for AlphaKind {
    const VENUE: &'static str = "alpha";
    const ALL: &'static [Self] = &[Self::Deposit];

    fn as_str(self) -> &'static str {
        "deposit"
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BetaKind {
    Trade,
    Transfer,
}

impl VenueKind for BetaKind {
    const VENUE: &'static str = "beta";
    const ALL: &'static [Self] = &[Self::Trade, Self::Transfer];

    fn as_str(self) -> &'static str {
        match self {
            Self::Trade => "trade",
            Self::Transfer => "transfer",
        }
    }
}

/// Venue serving a fixed batch, or failing with an auth error.
struct FakeVenue<K> {
    envelopes: Vec<Envelope>,
    fail: bool,
    fetches: Arc<AtomicUsize>,
    _kind: PhantomData<K>,
}

impl<K: VenueKind> FakeVenue<K> {
    fn serving(envelopes: Vec<Envelope>) -> Self {
        Self {
            envelopes,
            fail: false,
            fetches: Arc::new(AtomicUsize::new(0)),
            _kind: PhantomData,
        }
    }

    fn failing() -> Self {
        Self {
            envelopes: Vec::new(),
            fail: true,
            fetches: Arc::new(AtomicUsize::new(0)),
            _kind: PhantomData,
        }
    }

    /// Shared handle on the number of `fetch` calls, readable after the venue
    /// has moved into a registry.
    fn fetch_counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.fetches)
    }
}

#[async_trait]
impl<K: VenueKind> Venue for FakeVenue<K> {
    fn id(&self) -> &'static str {
        K::VENUE
    }

    fn kinds(&self) -> Vec<Kind> {
        vocabulary::<K>()
    }

    async fn fetch(&self) -> Result<Vec<Envelope>, FetchError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(FetchError::Auth {
                venue: K::VENUE.to_string(),
                status: 401,
                body: "invalid api key".to_string(),
            });
        }
        Ok(self.envelopes.clone())
    }

    fn parse(&self, envelope: &Envelope) -> Result<LedgerEntry, UnparseableEnvelope> {
        let kind = owned_kind::<K>(envelope)?;
        let f = RawFields::new(envelope);
        let id = f.str("id")?;
        let amount = f.decimal("amount")?;
        Ok(LedgerEntry::new(envelope, format!("{} {}", kind.as_str(), id))
            .post(Posting::new("Assets:Fake", amount, "USD"))
            .post(Posting::new("Equity:Transfers", -amount, "USD")))
    }
}

fn at(hour: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, hour, 0, 0).unwrap()
}

fn alpha_batch() -> Vec<Envelope> {
    vec![Envelope::new(
        AlphaKind::Deposit,
        at(1),
        json!({"id": "a1", "amount": "10"}),
        None,
    )]
}

fn beta_batch() -> Vec<Envelope> {
    let mut meta = Meta::new();
    meta.insert("account_id".to_string(), "acct-9".to_string());
    vec![
        Envelope::new(
            BetaKind::Transfer,
            at(5),
            json!({"id": "b2", "amount": "-3.25"}),
            Some(meta),
        ),
        Envelope::new(
            BetaKind::Trade,
            at(2),
            json!({"id": "b1", "amount": "7.5", "nested": {"z": 1, "a": [1, 2]}}),
            None,
        ),
    ]
}

fn registry(alpha: FakeVenue<AlphaKind>, beta: FakeVenue<BetaKind>) -> VenueRegistry {
    let mut registry = VenueRegistry::new();
    registry.register(Box::new(alpha));
    registry.register(Box::new(beta));
    registry
}

fn file_count(dir: &Path) -> usize {
    std::fs::read_dir(dir).map(|d| d.count()).unwrap_or(0)
}

#[tokio::test]
async fn test_failed_venue_does_not_block_others() {
    let dir = tempfile::tempdir().unwrap();
    let store = ArchiveStore::new(dir.path());
    let registry = registry(FakeVenue::failing(), FakeVenue::serving(beta_batch()));

    let report = fetch_and_archive(&registry, &store).await.unwrap();

    assert_eq!(report.outcomes.len(), 2);
    assert_eq!(report.succeeded(), 1);
    let failures: Vec<_> = report.failures().collect();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].0, "alpha");
    assert!(matches!(failures[0].1, FetchError::Auth { status: 401, .. }));
    assert_eq!(report.archived().created, 2);
    assert_eq!(file_count(dir.path()), 2);
    assert!(report
        .to_string()
        .contains("1 of 2 venues fetched successfully"));
}

#[tokio::test]
async fn test_archive_failure_aborts_run() {
    let dir = tempfile::tempdir().unwrap();
    let blocker = dir.path().join("archive");
    std::fs::write(&blocker, b"not a directory").unwrap();
    let store = ArchiveStore::new(blocker.clone());

    let alpha = FakeVenue::serving(alpha_batch());
    let beta = FakeVenue::serving(beta_batch());
    let alpha_fetches = alpha.fetch_counter();
    let beta_fetches = beta.fetch_counter();
    let registry = registry(alpha, beta);

    let err = fetch_and_archive(&registry, &store).await.unwrap_err();

    match err {
        ArchiveWriteError::CreateDir { path, .. } => assert_eq!(path, blocker),
        other => panic!("expected CreateDir, got {:?}", other),
    }
    assert_eq!(alpha_fetches.load(Ordering::SeqCst), 1);
    assert_eq!(beta_fetches.load(Ordering::SeqCst), 0);
    assert_eq!(std::fs::read(&blocker).unwrap(), b"not a directory");
}

#[tokio::test]
async fn test_refetch_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let store = ArchiveStore::new(dir.path().join("archive"));
    let registry = registry(
        FakeVenue::serving(alpha_batch()),
        FakeVenue::serving(beta_batch()),
    );

    let first = fetch_and_archive(&registry, &store).await.unwrap();
    let snapshot: Vec<_> = store
        .list()
        .unwrap()
        .into_iter()
        .map(|p| (p.clone(), std::fs::read(&p).unwrap()))
        .collect();

    let second = fetch_and_archive(&registry, &store).await.unwrap();

    assert_eq!(first.archived().created, 3);
    assert_eq!(second.archived().created, 0);
    assert_eq!(second.archived().unchanged, 3);
    assert_eq!(snapshot.len(), 3);
    for (path, bytes) in snapshot {
        assert_eq!(std::fs::read(&path).unwrap(), bytes);
    }
}

#[tokio::test]
async fn test_fetch_then_replay_round_trips() {
    let dir = tempfile::tempdir().unwrap();
    let store = ArchiveStore::new(dir.path());
    let registry = registry(
        FakeVenue::serving(alpha_batch()),
        FakeVenue::serving(beta_batch()),
    );
    fetch_and_archive(&registry, &store).await.unwrap();

    let mut originals = alpha_batch();
    originals.extend(beta_batch());
    for original in &originals {
        let stored = store.read(&store.path_for(original).unwrap()).unwrap();
        assert_eq!(&registry.resolve(stored).unwrap(), original);
    }

    let report = replay_and_parse(&registry, &store).unwrap();
    assert!(report.is_clean(), "{}", report);
    let narrations: Vec<_> = report.ledger().iter().map(|e| e.narration.clone()).collect();
    assert_eq!(narrations, vec!["deposit a1", "trade b1", "transfer b2"]);
}

#[test]
fn test_unknown_venue_is_reported_and_replay_continues() {
    let dir = tempfile::tempdir().unwrap();
    let store = ArchiveStore::new(dir.path());
    for env in beta_batch() {
        store.archive(&env).unwrap();
    }
    std::fs::write(
        dir.path().join("unknown-venue-buy-2024-01-01T00-00-00-0000.json"),
        serde_json::to_string_pretty(&json!({
            "venue": "unknown-venue",
            "kind": "buy",
            "timestamp": "2024-01-01T00:00:00.000000Z",
            "raw": {"id": "x"},
            "meta": null
        }))
        .unwrap(),
    )
    .unwrap();

    let registry = registry(FakeVenue::serving(vec![]), FakeVenue::serving(vec![]));
    let report = replay_and_parse(&registry, &store).unwrap();

    assert_eq!(report.unroutable.len(), 1);
    assert_eq!(report.unroutable[0].1.venue, "unknown-venue");
    assert_eq!(report.parsed.len(), 2);
    assert!(report.corrupt.is_empty());
    // nothing is removed from the archive
    assert_eq!(file_count(dir.path()), 3);
}

#[test]
fn test_corrupt_and_unparseable_entries_are_collected() {
    let dir = tempfile::tempdir().unwrap();
    let store = ArchiveStore::new(dir.path());

    store
        .archive(&Envelope::new(AlphaKind::Deposit, at(3), json!({"id": "a9"}), None))
        .unwrap();
    std::fs::write(dir.path().join("alpha-deposit-garbage.json"), b"{not json").unwrap();
    std::fs::write(
        dir.path().join("alpha-withdraw-2024-01-01T00-00-00-ff.json"),
        json!({
            "venue": "alpha",
            "kind": "withdraw",
            "timestamp": "2024-01-01T00:00:00Z",
            "raw": {},
            "meta": null
        })
        .to_string(),
    )
    .unwrap();

    let registry = registry(FakeVenue::serving(vec![]), FakeVenue::serving(vec![]));
    let report = replay_and_parse(&registry, &store).unwrap();

    assert_eq!(report.parsed.len(), 0);
    assert_eq!(report.unparseable.len(), 1);
    assert!(report.unparseable[0].1.reason.contains("amount"));
    assert_eq!(report.corrupt.len(), 2);
    assert!(report
        .corrupt
        .iter()
        .any(|c| matches!(c.reason, CorruptReason::InvalidJson(_))));
    assert!(report.corrupt.iter().any(|c| matches!(
        &c.reason,
        CorruptReason::UnknownKind { venue, kind } if venue == "alpha" && kind == "withdraw"
    )));
    assert_eq!(report.failed(), 3);
}

#[test]
fn test_meta_only_change_keeps_the_address() {
    let dir = tempfile::tempdir().unwrap();
    let store = ArchiveStore::new(dir.path());
    let raw = json!({"id": "abc"});

    let mut first_meta = Meta::new();
    first_meta.insert("account_id".to_string(), "1".to_string());
    let mut second_meta = Meta::new();
    second_meta.insert("account_id".to_string(), "2".to_string());

    let first = Envelope::new(CoinbaseKind::Buy, at(0), raw.clone(), Some(first_meta));
    let second = Envelope::new(CoinbaseKind::Buy, at(0), raw, Some(second_meta));

    let a = store.archive(&first).unwrap();
    let b = store.archive(&second).unwrap();

    assert_eq!(a.path, b.path);
    assert_eq!(a.outcome, WriteOutcome::Created);
    assert_eq!(b.outcome, WriteOutcome::Replaced);
    assert_eq!(file_count(dir.path()), 1);

    let stored: Value = serde_json::from_slice(&std::fs::read(&b.path).unwrap()).unwrap();
    assert_eq!(stored["meta"]["account_id"], "2");
}

#[test]
fn test_coinbase_buy_file_name() {
    let dir = tempfile::tempdir().unwrap();
    let store = ArchiveStore::new(dir.path());
    let mut meta = Meta::new();
    meta.insert("account_id".to_string(), "1".to_string());
    let env = Envelope::new(CoinbaseKind::Buy, at(0), json!({"id": "abc"}), Some(meta));

    store.archive(&env).unwrap();
    store.archive(&env).unwrap();

    let paths = store.list().unwrap();
    assert_eq!(paths.len(), 1);
    let name = paths[0].file_name().unwrap().to_string_lossy().into_owned();
    assert!(name.starts_with("coinbase-buy-2024-01-01T00-00-00-"), "{}", name);
    assert!(name.ends_with(".json"));

    let key = ArchiveKey::from_file_name(&name).unwrap();
    assert_eq!(key.venue, "coinbase");
    assert_eq!(key.kind, "buy");
    assert_eq!(key.hash.len(), 64);
}
