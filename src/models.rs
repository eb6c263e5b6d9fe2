use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Deserializer, Serialize};

use crate::error::FormatError;
use crate::timestamp::{self, canonical_instant};

pub const UNKNOWN_ARTIST: &str = "Unknown Artist";
pub const SINGLE_ALBUM: &str = "Single";

/// Where an event came from. Decides how it is deduplicated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SourceKind {
    /// Provider reports the real play instant (recently-played APIs).
    #[default]
    StreamServiceExact,
    /// Scraped history without per-play times; `played_at` is synthesized.
    #[serde(alias = "YoutubeMusic")]
    ScrapedHistory,
    #[serde(alias = "Excel")]
    SpreadsheetImport,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DedupStrategy {
    Timestamp,
    Content,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum IdentityKey {
    Timestamp(String),
    Content { title: String, artist: String },
}

impl SourceKind {
    pub fn as_str(self) -> &'static str {
        match self {
            SourceKind::StreamServiceExact => "stream-service-exact",
            SourceKind::ScrapedHistory => "scraped-history",
            SourceKind::SpreadsheetImport => "spreadsheet-import",
        }
    }

    /// Every spelling of this source found in stored rows, including the
    /// names older rows were written with.
    pub fn stored_names(self) -> &'static [&'static str] {
        match self {
            SourceKind::StreamServiceExact => &["stream-service-exact"],
            SourceKind::ScrapedHistory => &["scraped-history", "YoutubeMusic"],
            SourceKind::SpreadsheetImport => &["spreadsheet-import", "Excel"],
        }
    }

    /// Reads a stored `source` column. Rows written before the column
    /// existed (and unknown names) count as the exact-timestamp source.
    pub fn from_stored(name: Option<&str>) -> SourceKind {
        let Some(name) = name else {
            return SourceKind::default();
        };
        [
            SourceKind::StreamServiceExact,
            SourceKind::ScrapedHistory,
            SourceKind::SpreadsheetImport,
        ]
        .into_iter()
        .find(|kind| kind.stored_names().iter().any(|stored| *stored == name))
        .unwrap_or_default()
    }

    /// Whether rows with no `source` at all belong to this source.
    pub fn includes_unlabeled(self) -> bool {
        self == SourceKind::default()
    }

    pub fn dedup_strategy(self) -> DedupStrategy {
        match self {
            SourceKind::StreamServiceExact | SourceKind::SpreadsheetImport => {
                DedupStrategy::Timestamp
            }
            SourceKind::ScrapedHistory => DedupStrategy::Content,
        }
    }

    pub fn identity_key_for(self, event: &ListeningEvent) -> IdentityKey {
        match self.dedup_strategy() {
            DedupStrategy::Timestamp => IdentityKey::Timestamp(event.canonical_played_at()),
            DedupStrategy::Content => IdentityKey::Content {
                title: event.title.clone(),
                artist: event.artist.clone(),
            },
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One play as an adapter saw it, before any validation.
#[derive(Debug, Clone, Default)]
pub struct RawEvent {
    pub track_id: Option<String>,
    pub title: String,
    pub artists: Vec<String>,
    pub album: Option<String>,
    pub duration_seconds: Option<f64>,
    pub popularity: Option<u32>,
    pub release_date: Option<String>,
    pub played_at: Option<String>,
}

/// A persisted play. The serde names match the `songs` table columns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListeningEvent {
    #[serde(rename = "song")]
    pub title: String,
    #[serde(deserialize_with = "null_as_default")]
    pub artist: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub album: String,
    /// Seconds.
    pub duration: f64,
    #[serde(default = "unknown_release_date", deserialize_with = "release_date_or_unknown")]
    pub release_date: String,
    #[serde(with = "canonical_instant")]
    pub played_at: DateTime<Utc>,
    #[serde(rename = "song_popularity", default, deserialize_with = "null_as_default")]
    pub popularity: u8,
    #[serde(default, deserialize_with = "stored_source")]
    pub source: SourceKind,
    #[serde(default)]
    pub energy: Option<f64>,
    #[serde(default)]
    pub valence: Option<f64>,
}

impl ListeningEvent {
    /// Validates a raw record. `synthesized` replaces the raw play time for
    /// sources that cannot report one.
    pub fn from_raw(
        raw: RawEvent,
        source: SourceKind,
        synthesized: Option<DateTime<Utc>>,
    ) -> Result<Self, FormatError> {
        let title = raw.title.trim().to_string();
        if title.is_empty() {
            return Err(FormatError::new("song", raw.title, "empty title"));
        }

        let played_at = match (synthesized, raw.played_at.as_deref()) {
            (Some(instant), _) => instant,
            (None, Some(value)) => timestamp::parse_instant(value)?,
            (None, None) => return Err(FormatError::new("played_at", "", "missing play time")),
        };

        let duration = match raw.duration_seconds {
            Some(value) if value.is_finite() && value >= 0.0 => value,
            Some(value) => {
                return Err(FormatError::new("duration", value.to_string(), "not a duration"))
            }
            None => return Err(FormatError::new("duration", "", "missing duration")),
        };

        let artist = raw
            .artists
            .into_iter()
            .map(|name| name.trim().to_string())
            .find(|name| !name.is_empty())
            .unwrap_or_else(|| UNKNOWN_ARTIST.to_string());

        Ok(Self {
            title,
            artist,
            album: raw
                .album
                .filter(|album| !album.trim().is_empty())
                .unwrap_or_else(|| SINGLE_ALBUM.to_string()),
            duration,
            release_date: timestamp::release_date_or_unknown(raw.release_date.as_deref()),
            played_at,
            popularity: raw.popularity.unwrap_or(0).min(100) as u8,
            source,
            energy: None,
            valence: None,
        })
    }

    pub fn canonical_played_at(&self) -> String {
        timestamp::canonical(&self.played_at)
    }
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

fn stored_source<'de, D: Deserializer<'de>>(deserializer: D) -> Result<SourceKind, D::Error> {
    let raw = Option::<String>::deserialize(deserializer)?;
    Ok(SourceKind::from_stored(raw.as_deref()))
}

fn unknown_release_date() -> String {
    timestamp::UNKNOWN_RELEASE_DATE.to_string()
}

fn release_date_or_unknown<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    let raw = Option::<String>::deserialize(deserializer)?;
    Ok(timestamp::release_date_or_unknown(raw.as_deref()))
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlayCount {
    pub label: String,
    pub count: usize,
}

/// Events whose local instant falls inside one clock hour.
#[derive(Debug, Clone, Serialize)]
pub struct HourBucket {
    pub label: String,
    #[serde(skip)]
    pub events: Vec<ListeningEvent>,
    pub total_seconds: f64,
}

impl HourBucket {
    pub fn new(label: String) -> Self {
        Self {
            label,
            events: Vec::new(),
            total_seconds: 0.0,
        }
    }

    pub fn push(&mut self, event: ListeningEvent) {
        self.total_seconds += event.duration;
        self.events.push(event);
    }

    /// Whole seconds, the unit `minutes_listened` displays.
    pub fn whole_seconds(&self) -> u64 {
        self.total_seconds.max(0.0) as u64
    }

    pub fn minutes_listened(&self) -> String {
        crate::analysis::format_minutes(self.whole_seconds())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PeakHour {
    pub label: String,
    pub seconds: u64,
    pub minutes_listened: String,
}

/// Derived on demand; never persisted.
#[derive(Debug, Clone, Serialize)]
pub struct DaySummary {
    pub total_songs: usize,
    pub total_seconds: u64,
    pub total_time: String,
    pub total_time_verbose: String,
    pub hours: Vec<HourSlot>,
    pub top_songs: Vec<PlayCount>,
    pub top_artists: Vec<PlayCount>,
    pub top_albums: Vec<PlayCount>,
    pub most_popular: Option<ListeningEvent>,
    pub peak_hour: Option<PeakHour>,
    pub energy_level: f64,
    pub mood_level: f64,
}

/// Serialized view of an [`HourBucket`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HourSlot {
    pub label: String,
    pub songs: usize,
    pub seconds: u64,
    pub minutes_listened: String,
}

impl From<&HourBucket> for HourSlot {
    fn from(bucket: &HourBucket) -> Self {
        Self {
            label: bucket.label.clone(),
            songs: bucket.events.len(),
            seconds: bucket.whole_seconds(),
            minutes_listened: bucket.minutes_listened(),
        }
    }
}

/// Handoff to the reporting layer.
#[derive(Debug, Clone, Serialize)]
pub struct DayReport {
    pub window_start: String,
    pub window_end: String,
    pub summary: DaySummary,
    pub events: Vec<ListeningEvent>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DailyTotal {
    pub date: NaiveDate,
    pub songs: usize,
    pub total_seconds: f64,
    pub formatted_time: String,
}

impl DailyTotal {
    pub fn total_minutes(&self) -> f64 {
        self.total_seconds / 60.0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DayHighlight {
    pub date: NaiveDate,
    pub minutes: f64,
    pub formatted: String,
    pub songs: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WeeklyPatterns {
    pub total_minutes: f64,
    pub total_songs: usize,
    pub total_formatted: String,
    pub average_minutes: f64,
    pub average_formatted: String,
    pub peak_day: Option<DayHighlight>,
    pub quietest_day: Option<DayHighlight>,
    pub active_days: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ArtistTime {
    pub artist: String,
    pub seconds: f64,
    pub songs: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AlbumBinge {
    pub date: NaiveDate,
    pub album: String,
    pub artist: String,
    pub song_count: usize,
    pub total_seconds: f64,
    pub formatted_duration: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct WeekSummary {
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub daily: Vec<DailyTotal>,
    pub patterns: WeeklyPatterns,
    pub top_artists: Vec<ArtistTime>,
    pub album_binges: Vec<AlbumBinge>,
    pub streak: usize,
}

/// Per-source ingestion outcome.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct IngestReport {
    pub source: SourceKind,
    pub fetched: usize,
    pub malformed: usize,
    pub duplicates: usize,
    pub inserted: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn raw(title: &str) -> RawEvent {
        RawEvent {
            title: title.to_string(),
            artists: vec!["Charli xcx".to_string(), "Lorde".to_string()],
            album: Some("BRAT".to_string()),
            duration_seconds: Some(133.805),
            popularity: Some(80),
            release_date: Some("2024-06".to_string()),
            played_at: Some("2025-02-12T21:39:48.911Z".to_string()),
            ..RawEvent::default()
        }
    }

    #[test]
    fn from_raw_fills_every_field() {
        let event =
            ListeningEvent::from_raw(raw("360"), SourceKind::StreamServiceExact, None).unwrap();
        assert_eq!(event.artist, "Charli xcx");
        assert_eq!(event.release_date, "2024-06-01");
        assert_eq!(event.canonical_played_at(), "2025-02-12T21:39:48.911000+00:00");
        assert_eq!(event.popularity, 80);
    }

    #[test]
    fn from_raw_rejects_bad_payloads() {
        let mut bad_time = raw("360");
        bad_time.played_at = Some("not a time".to_string());
        assert!(ListeningEvent::from_raw(bad_time, SourceKind::StreamServiceExact, None).is_err());

        let mut no_duration = raw("360");
        no_duration.duration_seconds = None;
        assert!(
            ListeningEvent::from_raw(no_duration, SourceKind::StreamServiceExact, None).is_err()
        );

        assert!(ListeningEvent::from_raw(raw("  "), SourceKind::StreamServiceExact, None).is_err());
    }

    #[test]
    fn from_raw_defaults_missing_metadata() {
        let sparse = RawEvent {
            title: "Untitled".to_string(),
            duration_seconds: Some(60.0),
            popularity: Some(250),
            ..RawEvent::default()
        };
        let now = Utc::now();
        let event =
            ListeningEvent::from_raw(sparse, SourceKind::ScrapedHistory, Some(now)).unwrap();
        assert_eq!(event.artist, UNKNOWN_ARTIST);
        assert_eq!(event.album, SINGLE_ALBUM);
        assert_eq!(event.release_date, timestamp::UNKNOWN_RELEASE_DATE);
        assert_eq!(event.popularity, 100);
        assert_eq!(event.played_at, now);
    }

    #[test]
    fn stored_rows_decode_with_legacy_columns() {
        let row = json!({
            "song": "With You",
            "artist": "Jimin",
            "album": null,
            "duration": 200,
            "release_date": "2024",
            "played_at": "2024-10-08T12:42:49.161+00:00",
            "song_popularity": null,
            "source": "YoutubeMusic"
        });
        let event: ListeningEvent = serde_json::from_value(row).unwrap();
        assert_eq!(event.source, SourceKind::ScrapedHistory);
        assert_eq!(event.popularity, 0);
        assert_eq!(event.release_date, "2024-01-01");
        assert_eq!(event.duration, 200.0);

        let legacy = json!({
            "song": "360",
            "artist": "Charli xcx",
            "duration": 133.8,
            "played_at": "2025-02-12T21:39:48.911Z",
            "source": null
        });
        let event: ListeningEvent = serde_json::from_value(legacy).unwrap();
        assert_eq!(event.source, SourceKind::StreamServiceExact);

        let unknown = json!({
            "song": "360",
            "artist": "Charli xcx",
            "duration": 133.8,
            "played_at": "2025-02-12T21:39:48.911Z",
            "source": "vinyl"
        });
        let event: ListeningEvent = serde_json::from_value(unknown).unwrap();
        assert_eq!(event.source, SourceKind::from_stored(Some("vinyl")));
    }

    #[test]
    fn stored_source_names_map_back() {
        assert_eq!(
            SourceKind::from_stored(Some("YoutubeMusic")),
            SourceKind::ScrapedHistory
        );
        assert_eq!(
            SourceKind::from_stored(Some("spreadsheet-import")),
            SourceKind::SpreadsheetImport
        );
        assert!(SourceKind::StreamServiceExact.includes_unlabeled());
        assert!(!SourceKind::ScrapedHistory.includes_unlabeled());
        assert_eq!(SourceKind::from_stored(None), SourceKind::StreamServiceExact);
        assert_eq!(SourceKind::from_stored(Some("vinyl")), SourceKind::StreamServiceExact);
    }

    #[test]
    fn identity_key_follows_source_strategy() {
        let event =
            ListeningEvent::from_raw(raw("360"), SourceKind::StreamServiceExact, None).unwrap();
        assert_eq!(
            SourceKind::StreamServiceExact.identity_key_for(&event),
            IdentityKey::Timestamp("2025-02-12T21:39:48.911000+00:00".to_string())
        );
        assert_eq!(
            SourceKind::ScrapedHistory.identity_key_for(&event),
            IdentityKey::Content {
                title: "360".to_string(),
                artist: "Charli xcx".to_string()
            }
        );
    }
}
