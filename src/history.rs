//! Scraped listening history. Entries carry no play time, so the caller
//! synthesizes one at ingestion.

use reqwest::Client;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::error::{check_response, Error, Result};
use crate::models::RawEvent;
use crate::spotify::SourceBatch;

const SERVICE: &str = "history";

/// Entries fetched per hour of `history.hours_back`.
pub const ENTRIES_PER_HOUR: usize = 20;

pub struct HistoryClient {
    client: Client,
    url: String,
}

#[derive(Deserialize)]
struct HistoryEntry {
    title: String,
    #[serde(default)]
    artists: Vec<NamedRef>,
    album: Option<NamedRef>,
    duration_seconds: Option<f64>,
}

#[derive(Deserialize)]
struct NamedRef {
    name: String,
}

impl From<HistoryEntry> for RawEvent {
    fn from(entry: HistoryEntry) -> Self {
        RawEvent {
            title: entry.title,
            artists: entry.artists.into_iter().map(|artist| artist.name).collect(),
            album: entry.album.map(|album| album.name),
            duration_seconds: entry.duration_seconds,
            ..RawEvent::default()
        }
    }
}

impl HistoryClient {
    pub fn new(client: Client, url: &str) -> Self {
        Self {
            client,
            url: url.to_string(),
        }
    }

    /// Newest entries first, at most `limit`.
    pub async fn recent(&self, limit: usize) -> Result<SourceBatch> {
        let response = self
            .client
            .get(&self.url)
            .send()
            .await
            .map_err(|err| Error::network(SERVICE, err))?;
        let response = check_response(SERVICE, response).await?;
        let entries: Vec<serde_json::Value> = response.json().await.map_err(|err| Error::Payload {
            service: SERVICE,
            detail: err.to_string(),
        })?;

        let mut batch = SourceBatch::default();
        for entry in entries.into_iter().take(limit) {
            match serde_json::from_value::<HistoryEntry>(entry) {
                Ok(entry) => batch.events.push(entry.into()),
                Err(err) => {
                    warn!(%err, "skipping malformed history entry");
                    batch.malformed += 1;
                }
            }
        }
        debug!(count = batch.events.len(), "fetched scraped history");
        Ok(batch)
    }
}
