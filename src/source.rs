use chrono::{DateTime, Duration, Utc};
use tracing::{debug, warn};

use crate::error::Result;
use crate::history::HistoryClient;
use crate::models::{ListeningEvent, SourceKind, SINGLE_ALBUM};
use crate::spotify::{SourceBatch, SpotifyClient};
use crate::store::EventStore;

/// The adapters a run can pull from.
pub enum Source {
    Spotify {
        client: SpotifyClient,
        limit: usize,
        audio_features: bool,
    },
    History {
        client: HistoryClient,
        limit: usize,
        /// Fills release date and popularity from Spotify search.
        enricher: Option<SpotifyClient>,
    },
}

/// Validated events from one fetch, with the count of records dropped.
#[derive(Debug, Default)]
pub struct Collected {
    pub events: Vec<ListeningEvent>,
    pub malformed: usize,
}

impl Source {
    pub fn kind(&self) -> SourceKind {
        match self {
            Source::Spotify { .. } => SourceKind::StreamServiceExact,
            Source::History { .. } => SourceKind::ScrapedHistory,
        }
    }

    pub fn fetch_limit(&self) -> usize {
        match self {
            Source::Spotify { limit, .. } | Source::History { limit, .. } => *limit,
        }
    }

    /// Raw records played after `since`. Scraped history has no play times,
    /// so it ignores `since` and returns the newest `limit` entries.
    pub async fn fetch(&self, since: DateTime<Utc>, limit: usize) -> Result<SourceBatch> {
        match self {
            Source::Spotify { client, .. } => client.recently_played(since, limit).await,
            Source::History { client, .. } => client.recent(limit).await,
        }
    }

    /// Fetches, validates and enriches. Malformed records are skipped;
    /// auth failures anywhere abort.
    pub async fn collect(
        &self,
        since: DateTime<Utc>,
        started_at: DateTime<Utc>,
    ) -> Result<Collected> {
        let batch = self.fetch(since, self.fetch_limit()).await?;
        let kind = self.kind();

        let mut collected = Collected {
            events: Vec::with_capacity(batch.events.len()),
            malformed: batch.malformed,
        };
        let mut track_ids = Vec::new();

        for (index, raw) in batch.events.into_iter().enumerate() {
            let synthesized = match kind {
                // Newest entry first; step back a microsecond per entry so
                // synthesized times stay distinct and ordered.
                SourceKind::ScrapedHistory => {
                    Some(started_at - Duration::microseconds(index as i64))
                }
                _ => None,
            };
            let track_id = raw.track_id.clone();
            match ListeningEvent::from_raw(raw, kind, synthesized) {
                Ok(event) => {
                    collected.events.push(event);
                    track_ids.push(track_id);
                }
                Err(err) => {
                    warn!(source = %kind, %err, "skipping malformed event");
                    collected.malformed += 1;
                }
            }
        }

        match self {
            Source::Spotify {
                client,
                audio_features: true,
                ..
            } => add_audio_features(client, &mut collected.events, &track_ids).await?,
            Source::History {
                enricher: Some(client),
                ..
            } => add_track_metadata(client, &mut collected.events).await?,
            _ => {}
        }

        Ok(collected)
    }
}

async fn add_audio_features(
    client: &SpotifyClient,
    events: &mut [ListeningEvent],
    track_ids: &[Option<String>],
) -> Result<()> {
    let ids: Vec<String> = track_ids.iter().flatten().cloned().collect();
    if ids.is_empty() {
        return Ok(());
    }

    let features = match client.audio_features(&ids).await {
        Ok(features) => features,
        Err(err) if err.is_auth() => return Err(err),
        Err(err) => {
            warn!(%err, "audio features unavailable, keeping events without them");
            return Ok(());
        }
    };

    for (event, id) in events.iter_mut().zip(track_ids) {
        if let Some(found) = id.as_ref().and_then(|id| features.get(id)) {
            event.energy = found.energy;
            event.valence = found.valence;
        }
    }
    Ok(())
}

async fn add_track_metadata(client: &SpotifyClient, events: &mut [ListeningEvent]) -> Result<()> {
    for event in events.iter_mut() {
        let album = (event.album != SINGLE_ALBUM).then_some(event.album.as_str());
        match client.find_track(&event.title, &event.artist, album).await {
            Ok(Some(hit)) => {
                event.release_date = hit.release_date;
                event.popularity = hit.popularity;
            }
            Ok(None) => debug!(title = %event.title, "no metadata match"),
            Err(err) if err.is_auth() => return Err(err),
            Err(err) => warn!(title = %event.title, %err, "metadata lookup failed"),
        }
    }
    Ok(())
}

/// Where the previous run left off, read back from the store.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Checkpoint {
    pub source: SourceKind,
    pub latest: Option<DateTime<Utc>>,
}

impl Checkpoint {
    pub async fn load(store: &dyn EventStore, source: SourceKind) -> Result<Self> {
        Ok(Self {
            source,
            latest: store.latest_played_at(source).await?,
        })
    }

    /// Lower bound for the next fetch: the checkpoint, else `fallback`.
    /// Narrows the window only; the dedup engine still decides what is new.
    pub fn fetch_since(&self, fallback: DateTime<Utc>) -> DateTime<Utc> {
        self.latest.unwrap_or(fallback)
    }
}
