//! The two pipeline flows.
//!
//! * fetch-and-archive: every registered venue in order, fetch then archive.
//!   A venue that fails to fetch is recorded and skipped; a disk failure
//!   aborts the run.
//! * replay-and-parse: every archive file, decode, resolve, route, parse.
//!   Each entry is independent and every failure is collected.

use std::fmt;
use std::io;
use std::path::PathBuf;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::archive::{ArchiveStore, ArchiveSummary};
use crate::envelope::Envelope;
use crate::error::{
    ArchiveWriteError, CorruptArchiveEntry, CorruptReason, FetchError, UnparseableEnvelope,
    UnroutableEnvelope,
};
use crate::ledger::LedgerEntry;
use crate::venues::{ResolveError, VenueRegistry};

// =============================================================================
// FETCH AND ARCHIVE
// =============================================================================

/// Result of one venue's fetch-and-archive step.
#[derive(Debug)]
pub struct VenueOutcome {
    pub venue: &'static str,
    pub result: Result<ArchiveSummary, FetchError>,
}

#[derive(Debug, Default)]
pub struct FetchReport {
    pub outcomes: Vec<VenueOutcome>,
}

impl FetchReport {
    pub fn succeeded(&self) -> usize {
        self.outcomes.iter().filter(|o| o.result.is_ok()).count()
    }

    pub fn failures(&self) -> impl Iterator<Item = (&'static str, &FetchError)> {
        self.outcomes
            .iter()
            .filter_map(|o| o.result.as_ref().err().map(|e| (o.venue, e)))
    }

    pub fn is_complete(&self) -> bool {
        self.succeeded() == self.outcomes.len()
    }

    /// Archive counts summed over successful venues.
    pub fn archived(&self) -> ArchiveSummary {
        let mut total = ArchiveSummary::default();
        for summary in self.outcomes.iter().filter_map(|o| o.result.as_ref().ok()) {
            total.created += summary.created;
            total.unchanged += summary.unchanged;
            total.replaced += summary.replaced;
        }
        total
    }
}

impl fmt::Display for FetchReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for outcome in &self.outcomes {
            match &outcome.result {
                Ok(s) => writeln!(
                    f,
                    "  {:<12} ok      {} envelopes ({} new, {} already archived, {} updated)",
                    outcome.venue,
                    s.total(),
                    s.created,
                    s.unchanged,
                    s.replaced
                )?,
                Err(e) => writeln!(f, "  {:<12} FAILED  {}", outcome.venue, e)?,
            }
        }
        let archived = self.archived();
        write!(
            f,
            "{} of {} venues fetched successfully, {} envelopes archived ({} new)",
            self.succeeded(),
            self.outcomes.len(),
            archived.total(),
            archived.created
        )
    }
}

/// Fetch every registered venue in registration order and archive what each
/// returns. Only an archive write failure ends the run early.
pub async fn fetch_and_archive(
    registry: &VenueRegistry,
    store: &ArchiveStore,
) -> Result<FetchReport, ArchiveWriteError> {
    let mut report = FetchReport::default();

    for venue in registry.venues() {
        let id = venue.id();
        let fetched = venue
            .fetch()
            .instrument(info_span!("fetch", venue = id))
            .await
            .and_then(|envelopes| check_stamps(id, envelopes));

        let result = match fetched {
            Ok(envelopes) => {
                info!(venue = id, count = envelopes.len(), "fetched");
                match store.archive_all(&envelopes) {
                    Ok(summary) => Ok(summary),
                    Err(e) => {
                        error!(venue = id, error = %e, "archive write failed, aborting run");
                        return Err(e);
                    }
                }
            }
            Err(e) => {
                warn!(venue = id, error = %e, "fetch failed, continuing with remaining venues");
                Err(e)
            }
        };
        report.outcomes.push(VenueOutcome { venue: id, result });
    }

    info!(
        succeeded = report.succeeded(),
        venues = report.outcomes.len(),
        "fetch run finished"
    );
    Ok(report)
}

/// An adapter may only emit envelopes carrying its own venue id.
fn check_stamps(venue: &'static str, envelopes: Vec<Envelope>) -> Result<Vec<Envelope>, FetchError> {
    match envelopes.iter().find(|e| e.venue() != venue) {
        Some(stray) => Err(FetchError::malformed(
            venue,
            format!("adapter produced an envelope stamped `{}`", stray.venue()),
        )),
        None => Ok(envelopes),
    }
}

// =============================================================================
// REPLAY AND PARSE
// =============================================================================

#[derive(Debug)]
pub struct ParsedEntry {
    pub path: PathBuf,
    pub entry: LedgerEntry,
}

#[derive(Debug, Default)]
pub struct ParseReport {
    pub parsed: Vec<ParsedEntry>,
    pub corrupt: Vec<CorruptArchiveEntry>,
    pub unroutable: Vec<(PathBuf, UnroutableEnvelope)>,
    pub unparseable: Vec<(PathBuf, UnparseableEnvelope)>,
}

impl ParseReport {
    pub fn failed(&self) -> usize {
        self.corrupt.len() + self.unroutable.len() + self.unparseable.len()
    }

    pub fn is_clean(&self) -> bool {
        self.failed() == 0
    }

    /// Parsed entries ordered by (date, narration), independent of the order
    /// files were listed in.
    pub fn ledger(&self) -> Vec<&LedgerEntry> {
        let mut entries: Vec<&LedgerEntry> = self.parsed.iter().map(|p| &p.entry).collect();
        entries.sort_by(|a, b| (a.date, &a.narration).cmp(&(b.date, &b.narration)));
        entries
    }
}

impl fmt::Display for ParseReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{} parsed, {} unroutable, {} corrupt, {} unparseable",
            self.parsed.len(),
            self.unroutable.len(),
            self.corrupt.len(),
            self.unparseable.len()
        )?;
        for parsed in &self.parsed {
            writeln!(f, "  parsed       {}", file_name(&parsed.path))?;
        }
        for (path, e) in &self.unroutable {
            writeln!(f, "  unroutable   {}: {}", file_name(path), e)?;
        }
        for e in &self.corrupt {
            writeln!(f, "  corrupt      {}: {}", file_name(&e.path), e.reason)?;
        }
        for (path, e) in &self.unparseable {
            writeln!(f, "  unparseable  {}: {}", file_name(path), e)?;
        }
        Ok(())
    }
}

fn file_name(path: &std::path::Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

/// Replay the whole archive. Files stay on disk whatever happens to them.
pub fn replay_and_parse(registry: &VenueRegistry, store: &ArchiveStore) -> io::Result<ParseReport> {
    let paths = store.list()?;
    let mut report = ParseReport::default();

    for path in paths {
        let stored = match store.read(&path) {
            Ok(stored) => stored,
            Err(e) => {
                warn!(error = %e, "skipping corrupt entry");
                report.corrupt.push(e);
                continue;
            }
        };

        let envelope = match registry.resolve(stored) {
            Ok(envelope) => envelope,
            Err(ResolveError::Unroutable(e)) => {
                warn!(path = %path.display(), error = %e, "unroutable entry");
                report.unroutable.push((path, e));
                continue;
            }
            Err(ResolveError::UnknownKind { venue, kind }) => {
                let e = CorruptArchiveEntry::new(&path, CorruptReason::UnknownKind { venue, kind });
                warn!(error = %e, "skipping corrupt entry");
                report.corrupt.push(e);
                continue;
            }
        };

        let adapter = match registry.route(&envelope) {
            Ok(adapter) => adapter,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "unroutable entry");
                report.unroutable.push((path, e));
                continue;
            }
        };

        match adapter.parse(&envelope) {
            Ok(entry) => {
                debug!(path = %path.display(), date = %entry.date, "parsed entry");
                report.parsed.push(ParsedEntry { path, entry });
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "unparseable entry");
                report.unparseable.push((path, e));
            }
        }
    }

    info!(
        parsed = report.parsed.len(),
        failed = report.failed(),
        "replay finished"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::VenueKind;
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Foreign {
        Thing,
    }

    impl VenueKind for Foreign {
        const VENUE: &'static str = "elsewhere";
        const ALL: &'static [Self] = &[Self::Thing];
        fn as_str(self) -> &'static str {
            "thing"
        }
    }

    #[test]
    fn test_check_stamps_rejects_foreign_venue() {
        let ts = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let envelopes = vec![Envelope::new(Foreign::Thing, ts, json!({}), None)];
        let err = check_stamps("coinbase", envelopes).unwrap_err();
        assert_eq!(err.venue(), "coinbase");
        assert!(check_stamps("elsewhere", vec![Envelope::new(Foreign::Thing, ts, json!({}), None)]).is_ok());
    }

    #[test]
    fn test_fetch_report_summary_line() {
        let report = FetchReport {
            outcomes: vec![
                VenueOutcome {
                    venue: "coinbase",
                    result: Ok(ArchiveSummary {
                        created: 2,
                        unchanged: 1,
                        replaced: 0,
                    }),
                },
                VenueOutcome {
                    venue: "ethereum",
                    result: Err(FetchError::malformed("ethereum", "bad block")),
                },
            ],
        };
        assert_eq!(report.succeeded(), 1);
        assert!(!report.is_complete());
        assert_eq!(report.failures().map(|(v, _)| v).collect::<Vec<_>>(), vec!["ethereum"]);
        let text = report.to_string();
        assert!(text.ends_with("1 of 2 venues fetched successfully, 3 envelopes archived (2 new)"));
    }

    #[test]
    fn test_parse_report_names_every_entry() {
        let ts = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let envelope = Envelope::new(Foreign::Thing, ts, json!({}), None);
        let report = ParseReport {
            parsed: vec![ParsedEntry {
                path: PathBuf::from("/archive/elsewhere-thing-a.json"),
                entry: LedgerEntry::new(&envelope, "thing"),
            }],
            unparseable: vec![(
                PathBuf::from("/archive/elsewhere-thing-b.json"),
                UnparseableEnvelope {
                    venue: "elsewhere".to_string(),
                    kind: "thing".to_string(),
                    reason: "missing `amount`".to_string(),
                },
            )],
            ..ParseReport::default()
        };

        let text = report.to_string();
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines[0], "1 parsed, 0 unroutable, 0 corrupt, 1 unparseable");
        assert_eq!(lines[1], "  parsed       elsewhere-thing-a.json");
        assert!(lines[2].starts_with("  unparseable  elsewhere-thing-b.json: "));
        assert!(!report.is_clean());
    }

    #[test]
    fn test_replay_of_missing_archive_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArchiveStore::new(dir.path().join("absent"));
        let report = replay_and_parse(&VenueRegistry::new(), &store).unwrap();
        assert!(report.parsed.is_empty());
        assert!(report.is_clean());
    }
}
