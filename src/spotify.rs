//! Spotify Web API client: recently-played history, audio features and the
//! track search used to enrich events from other sources.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::error::{check_response, Error, Result};
use crate::models::RawEvent;
use crate::timestamp;

const SERVICE: &str = "spotify";
pub const MAX_RECENT_LIMIT: usize = 50;
const AUDIO_FEATURE_BATCH: usize = 100;
const SEARCH_LIMIT: usize = 5;

pub struct SpotifyClient {
    client: Client,
    api_base: String,
    token: String,
}

/// Raw records plus the number of items that could not be decoded at all.
#[derive(Debug, Default)]
pub struct SourceBatch {
    pub events: Vec<RawEvent>,
    pub malformed: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct AudioFeatures {
    pub energy: Option<f64>,
    pub valence: Option<f64>,
}

/// Metadata a search hit contributes to an event.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackMatch {
    pub release_date: String,
    pub popularity: u8,
}

#[derive(Deserialize)]
struct RecentlyPlayedPage {
    #[serde(default)]
    items: Vec<serde_json::Value>,
}

#[derive(Deserialize)]
struct PlayHistoryItem {
    track: Track,
    played_at: Option<String>,
}

#[derive(Deserialize)]
struct Track {
    id: Option<String>,
    name: String,
    duration_ms: Option<f64>,
    popularity: Option<u32>,
    album: Album,
    #[serde(default)]
    artists: Vec<Artist>,
}

#[derive(Deserialize)]
struct Album {
    name: Option<String>,
    release_date: Option<String>,
    #[serde(default)]
    artists: Vec<Artist>,
}

#[derive(Deserialize)]
struct Artist {
    name: String,
}

#[derive(Deserialize)]
struct AudioFeaturesPage {
    #[serde(default)]
    audio_features: Vec<Option<AudioFeatureRow>>,
}

#[derive(Deserialize)]
struct AudioFeatureRow {
    id: String,
    energy: Option<f64>,
    valence: Option<f64>,
}

#[derive(Deserialize)]
struct SearchPage {
    tracks: Option<SearchTracks>,
}

#[derive(Deserialize)]
struct SearchTracks {
    #[serde(default)]
    items: Vec<Track>,
}

impl From<Track> for RawEvent {
    fn from(track: Track) -> Self {
        // Album artists first, like the listening history has always been keyed.
        let artists = if track.album.artists.is_empty() {
            track.artists
        } else {
            track.album.artists
        };
        RawEvent {
            track_id: track.id,
            title: track.name,
            artists: artists.into_iter().map(|artist| artist.name).collect(),
            album: track.album.name,
            duration_seconds: track.duration_ms.map(|ms| ms / 1000.0),
            popularity: track.popularity,
            release_date: track.album.release_date,
            played_at: None,
        }
    }
}

impl SpotifyClient {
    pub fn new(client: Client, api_base: &str, token: &str) -> Self {
        Self {
            client,
            api_base: api_base.trim_end_matches('/').to_string(),
            token: token.to_string(),
        }
    }

    async fn get<T: for<'de> Deserialize<'de>>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T> {
        let response = self
            .client
            .get(format!("{}{}", self.api_base, path))
            .bearer_auth(&self.token)
            .query(query)
            .send()
            .await
            .map_err(|err| Error::network(SERVICE, err))?;
        let response = check_response(SERVICE, response).await?;
        response.json::<T>().await.map_err(|err| Error::Payload {
            service: SERVICE,
            detail: err.to_string(),
        })
    }

    /// Plays after `since`, newest first, at most `limit` (capped at 50).
    pub async fn recently_played(&self, since: DateTime<Utc>, limit: usize) -> Result<SourceBatch> {
        let page: RecentlyPlayedPage = self
            .get(
                "/me/player/recently-played",
                &[
                    ("limit", limit.clamp(1, MAX_RECENT_LIMIT).to_string()),
                    ("after", since.timestamp_millis().to_string()),
                ],
            )
            .await?;

        let mut batch = SourceBatch::default();
        for item in page.items {
            match serde_json::from_value::<PlayHistoryItem>(item) {
                Ok(item) => {
                    let mut raw = RawEvent::from(item.track);
                    raw.played_at = item.played_at;
                    batch.events.push(raw);
                }
                Err(err) => {
                    warn!(%err, "skipping malformed recently-played item");
                    batch.malformed += 1;
                }
            }
        }
        debug!(count = batch.events.len(), "fetched recently played");
        Ok(batch)
    }

    pub async fn audio_features(
        &self,
        track_ids: &[String],
    ) -> Result<HashMap<String, AudioFeatures>> {
        let mut features = HashMap::new();
        for chunk in track_ids.chunks(AUDIO_FEATURE_BATCH) {
            let page: AudioFeaturesPage = self
                .get("/audio-features", &[("ids", chunk.join(","))])
                .await?;
            for row in page.audio_features.into_iter().flatten() {
                features.insert(
                    row.id,
                    AudioFeatures {
                        energy: row.energy,
                        valence: row.valence,
                    },
                );
            }
        }
        Ok(features)
    }

    async fn search(&self, query: String) -> Result<Option<Track>> {
        let page: SearchPage = self
            .get(
                "/search",
                &[
                    ("q", query),
                    ("type", "track".to_string()),
                    ("limit", SEARCH_LIMIT.to_string()),
                    ("market", "US".to_string()),
                ],
            )
            .await?;
        Ok(page.tracks.and_then(|tracks| tracks.items.into_iter().next()))
    }

    /// First search hit for a track, retried without the album because
    /// album names rarely agree across services.
    pub async fn find_track(
        &self,
        title: &str,
        artist: &str,
        album: Option<&str>,
    ) -> Result<Option<TrackMatch>> {
        let base = format!("track:{title} artist:{artist}");
        let mut hit = match album {
            Some(album) => self.search(format!("{base} album:{album}")).await?,
            None => None,
        };
        if hit.is_none() {
            hit = self.search(base).await?;
        }

        Ok(hit.map(|track| TrackMatch {
            release_date: timestamp::release_date_or_unknown(track.album.release_date.as_deref()),
            popularity: track.popularity.unwrap_or(0).min(100) as u8,
        }))
    }
}
