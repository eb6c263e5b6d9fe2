//! Decides which candidates are new before anything is written.

use std::collections::HashSet;

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, warn};

use crate::error::Result;
use crate::models::{DedupStrategy, IdentityKey, ListeningEvent, SourceKind};
use crate::store::EventStore;
use crate::timestamp;

pub struct DedupEngine<'a> {
    store: &'a dyn EventStore,
    /// Window content-keyed sources are matched against.
    lookback: Duration,
}

#[derive(Debug, Default)]
pub struct DedupOutcome {
    pub fresh: Vec<ListeningEvent>,
    pub duplicates: usize,
}

impl<'a> DedupEngine<'a> {
    pub fn new(store: &'a dyn EventStore, lookback: Duration) -> Self {
        Self { store, lookback }
    }

    /// Candidates not yet stored, in their original order.
    ///
    /// A failed existence check other than an auth failure lets every
    /// candidate through: a duplicate row is preferred over a lost play.
    pub async fn filter_new(
        &self,
        kind: SourceKind,
        candidates: Vec<ListeningEvent>,
        now: DateTime<Utc>,
    ) -> Result<DedupOutcome> {
        let total = candidates.len();
        let candidates = match kind.dedup_strategy() {
            DedupStrategy::Timestamp => collapse_batch(kind, candidates),
            DedupStrategy::Content => candidates,
        };
        if candidates.is_empty() {
            return Ok(DedupOutcome {
                fresh: candidates,
                duplicates: total,
            });
        }

        let known = match kind.dedup_strategy() {
            DedupStrategy::Timestamp => self.stored_timestamps(&candidates).await,
            DedupStrategy::Content => self.stored_identities(kind, now).await,
        };
        let known = match known {
            Ok(known) => known,
            Err(err) if err.is_auth() => return Err(err),
            Err(err) => {
                warn!(
                    source = %kind,
                    %err,
                    "existence check failed, treating all candidates as new"
                );
                HashSet::new()
            }
        };

        let fresh: Vec<ListeningEvent> = candidates
            .into_iter()
            .filter(|event| !known.contains(&kind.identity_key_for(event)))
            .collect();
        debug!(source = %kind, candidates = total, fresh = fresh.len(), "dedup done");

        Ok(DedupOutcome {
            duplicates: total - fresh.len(),
            fresh,
        })
    }

    async fn stored_timestamps(
        &self,
        candidates: &[ListeningEvent],
    ) -> Result<HashSet<IdentityKey>> {
        let keys: Vec<String> = candidates
            .iter()
            .map(ListeningEvent::canonical_played_at)
            .collect();
        let echoed = self.store.existing_timestamps(&keys).await?;

        // The store answers in its own spelling.
        let mut known = HashSet::with_capacity(echoed.len());
        for value in echoed {
            match timestamp::normalize(&value) {
                Ok(canonical) => {
                    known.insert(IdentityKey::Timestamp(canonical));
                }
                Err(err) => warn!(%err, "ignoring unreadable stored timestamp"),
            }
        }
        Ok(known)
    }

    async fn stored_identities(
        &self,
        kind: SourceKind,
        now: DateTime<Utc>,
    ) -> Result<HashSet<IdentityKey>> {
        let rows = self.store.recent_identities(kind, now - self.lookback).await?;
        Ok(rows
            .into_iter()
            .map(|(title, artist)| IdentityKey::Content { title, artist })
            .collect())
    }
}

/// Keeps the first of several candidates sharing one identity.
fn collapse_batch(kind: SourceKind, candidates: Vec<ListeningEvent>) -> Vec<ListeningEvent> {
    let mut seen = HashSet::with_capacity(candidates.len());
    candidates
        .into_iter()
        .filter(|event| seen.insert(kind.identity_key_for(event)))
        .collect()
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use super::*;
    use crate::analysis::tests::event;
    use crate::error::Error;
    use crate::store::memory::MemoryStore;

    fn scraped(title: &str, artist: &str, played_at: &str) -> ListeningEvent {
        let mut event = event(title, artist, played_at, 200.0);
        event.source = SourceKind::ScrapedHistory;
        event
    }

    fn now() -> DateTime<Utc> {
        timestamp::parse_instant("2025-03-01T12:00:00Z").unwrap()
    }

    #[tokio::test]
    async fn stored_and_repeated_timestamps_are_dropped() {
        let store = MemoryStore::with_rows(vec![event(
            "360",
            "Charli xcx",
            "2025-02-12T21:39:48.911Z",
            133.8,
        )]);
        let engine = DedupEngine::new(&store, Duration::minutes(120));

        let outcome = engine
            .filter_new(
                SourceKind::StreamServiceExact,
                vec![
                    // Same instant, different spelling.
                    event("360", "Charli xcx", "2025-02-12 21:39:48.911+00", 133.8),
                    event("Apple", "Charli xcx", "2025-02-12T21:42:03Z", 151.0),
                    event("Apple", "Charli xcx", "2025-02-12T21:42:03.000000+00:00", 151.0),
                ],
                now(),
            )
            .await
            .unwrap();

        assert_eq!(outcome.duplicates, 2);
        assert_eq!(outcome.fresh.len(), 1);
        assert_eq!(outcome.fresh[0].title, "Apple");
    }

    #[tokio::test]
    async fn failed_existence_check_fails_open() {
        let store = MemoryStore::with_rows(vec![event(
            "360",
            "Charli xcx",
            "2025-02-12T21:39:48.911Z",
            133.8,
        )]);
        store.fail_existence.store(true, Ordering::SeqCst);
        let engine = DedupEngine::new(&store, Duration::minutes(120));

        let outcome = engine
            .filter_new(
                SourceKind::StreamServiceExact,
                vec![
                    event("360", "Charli xcx", "2025-02-12T21:39:48.911Z", 133.8),
                    event("Apple", "Charli xcx", "2025-02-12T21:42:03Z", 151.0),
                ],
                now(),
            )
            .await
            .unwrap();
        assert_eq!(outcome.fresh.len(), 2);
        assert_eq!(outcome.duplicates, 0);
    }

    #[tokio::test]
    async fn auth_failure_is_not_swallowed() {
        let store = MemoryStore::default();
        store.fail_auth.store(true, Ordering::SeqCst);
        let engine = DedupEngine::new(&store, Duration::minutes(120));

        let err = engine
            .filter_new(
                SourceKind::StreamServiceExact,
                vec![event("360", "Charli xcx", "2025-02-12T21:39:48.911Z", 133.8)],
                now(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Auth { .. }));
    }

    #[tokio::test]
    async fn content_keys_match_within_lookback_only() {
        let mut exact = event("Pink Pony Club", "Chappell Roan", "2025-03-01T11:50:00Z", 258.0);
        exact.source = SourceKind::StreamServiceExact;
        let store = MemoryStore::with_rows(vec![
            scraped("Espresso", "Sabrina Carpenter", "2025-03-01T11:30:00Z"),
            scraped("Good Luck, Babe!", "Chappell Roan", "2025-03-01T08:00:00Z"),
            exact,
        ]);
        let engine = DedupEngine::new(&store, Duration::minutes(120));

        let outcome = engine
            .filter_new(
                SourceKind::ScrapedHistory,
                vec![
                    scraped("Espresso", "Sabrina Carpenter", "2025-03-01T12:00:00Z"),
                    scraped("Good Luck, Babe!", "Chappell Roan", "2025-03-01T11:59:59.999999Z"),
                    scraped("Pink Pony Club", "Chappell Roan", "2025-03-01T11:59:59.999998Z"),
                ],
                now(),
            )
            .await
            .unwrap();

        let titles: Vec<&str> = outcome.fresh.iter().map(|event| event.title.as_str()).collect();
        assert_eq!(titles, vec!["Good Luck, Babe!", "Pink Pony Club"]);
        assert_eq!(outcome.duplicates, 1);
    }

    #[tokio::test]
    async fn empty_batch_skips_the_store() {
        let store = MemoryStore::default();
        store.fail_auth.store(true, Ordering::SeqCst);
        let engine = DedupEngine::new(&store, Duration::minutes(120));

        let outcome = engine
            .filter_new(SourceKind::StreamServiceExact, Vec::new(), now())
            .await
            .unwrap();
        assert!(outcome.fresh.is_empty());
    }
}
