//! One command's worth of work: ingest from the configured sources, or read
//! stored events back for the day and week rollups.

use std::sync::Arc;

use chrono::{DateTime, Duration, FixedOffset, NaiveDate, Utc};
use clap::ValueEnum;
use reqwest::Client;
use tracing::{debug, error, info, warn};

use crate::analysis;
use crate::config::{AppConfig, StoreBackend};
use crate::db::PgStore;
use crate::dedup::DedupEngine;
use crate::error::{Error, Result};
use crate::history::HistoryClient;
use crate::models::{DayReport, IngestReport, SourceKind, WeekSummary};
use crate::rest::RestStore;
use crate::source::{Checkpoint, Source};
use crate::spotify::SpotifyClient;
use crate::store::EventStore;
use crate::timestamp;
use crate::weekly;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum SourceSelection {
    Spotify,
    History,
    #[default]
    All,
}

/// Built at the start of a command and dropped at its end.
pub struct RunContext {
    pub config: AppConfig,
    pub http: Client,
    pub store: Arc<dyn EventStore>,
    pub started_at: DateTime<Utc>,
    pub offset: FixedOffset,
}

/// Per-source results of one ingestion run.
#[derive(Debug, Default)]
pub struct RunSummary {
    pub reports: Vec<IngestReport>,
    pub failures: Vec<(SourceKind, String)>,
}

impl RunSummary {
    pub fn inserted(&self) -> usize {
        self.reports.iter().map(|report| report.inserted).sum()
    }

    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }
}

impl RunContext {
    pub async fn connect(config: AppConfig) -> Result<Self> {
        let http = Client::builder()
            .timeout(config.http_timeout)
            .build()
            .map_err(|err| Error::network("http", err))?;

        let store: Arc<dyn EventStore> = match config.store.backend {
            StoreBackend::Rest => {
                let (Some(url), Some(key)) = (&config.store.rest_url, &config.store.rest_key) else {
                    return Err(Error::Config("rest store url and key are required".to_string()));
                };
                Arc::new(RestStore::new(http.clone(), url, key, &config.store.table))
            }
            StoreBackend::Postgres => {
                let Some(url) = &config.store.database_url else {
                    return Err(Error::Config("database url is required".to_string()));
                };
                Arc::new(PgStore::connect(url, config.http_timeout).await?)
            }
        };

        Self::with_store(config, http, store, Utc::now())
    }

    pub fn with_store(
        config: AppConfig,
        http: Client,
        store: Arc<dyn EventStore>,
        started_at: DateTime<Utc>,
    ) -> Result<Self> {
        let offset = timestamp::reporting_offset(config.utc_offset_hours).ok_or_else(|| {
            Error::Config(format!("invalid utc offset {}", config.utc_offset_hours))
        })?;
        Ok(Self {
            config,
            http,
            store,
            started_at,
            offset,
        })
    }

    fn spotify_client(&self, token: &str) -> SpotifyClient {
        SpotifyClient::new(self.http.clone(), &self.config.spotify.api_base, token)
    }

    /// Adapters for the selection; unconfigured ones are skipped with a warning.
    pub fn sources(&self, selection: SourceSelection) -> Vec<Source> {
        let token = self.config.spotify.access_token.as_deref();
        let mut sources = Vec::new();

        if matches!(selection, SourceSelection::Spotify | SourceSelection::All) {
            match token {
                Some(token) => sources.push(Source::Spotify {
                    client: self.spotify_client(token),
                    limit: self.config.spotify.fetch_limit,
                    audio_features: self.config.spotify.audio_features,
                }),
                None => warn!("spotify source skipped: no access token configured"),
            }
        }

        if matches!(selection, SourceSelection::History | SourceSelection::All) {
            match &self.config.history.url {
                Some(url) => sources.push(Source::History {
                    client: HistoryClient::new(self.http.clone(), url),
                    limit: self.config.history.fetch_limit(),
                    enricher: token.map(|token| self.spotify_client(token)),
                }),
                None => warn!("history source skipped: no history url configured"),
            }
        }

        sources
    }

    /// `started_at` minus `hours`, refusing windows chrono cannot represent.
    fn hours_back(&self, hours: u32) -> Result<DateTime<Utc>> {
        Duration::try_hours(i64::from(hours))
            .and_then(|window| self.started_at.checked_sub_signed(window))
            .ok_or_else(|| Error::Config(format!("lookback of {hours} hours is out of range")))
    }

    async fn fetch_since(
        &self,
        kind: SourceKind,
        hours_override: Option<u32>,
    ) -> Result<DateTime<Utc>> {
        if let Some(hours) = hours_override {
            return self.hours_back(hours);
        }
        let fallback = self.hours_back(self.config.default_lookback_hours)?;
        match Checkpoint::load(self.store.as_ref(), kind).await {
            Ok(checkpoint) => {
                debug!(
                    source = %checkpoint.source,
                    latest = ?checkpoint.latest,
                    "loaded checkpoint"
                );
                Ok(checkpoint.fetch_since(fallback))
            }
            Err(err) if err.is_auth() => Err(err),
            Err(err) => {
                warn!(source = %kind, %err, "checkpoint unavailable, using default lookback");
                Ok(fallback)
            }
        }
    }

    /// fetch, validate, dedup, insert. Nothing is written unless every
    /// earlier step succeeded, and a rejected insert is not retried.
    pub async fn ingest_source(
        &self,
        source: &Source,
        hours_override: Option<u32>,
    ) -> Result<IngestReport> {
        let kind = source.kind();
        let since = self.fetch_since(kind, hours_override).await?;
        let collected = source.collect(since, self.started_at).await?;
        let fetched = collected.events.len() + collected.malformed;

        let lookback = Duration::minutes(i64::from(self.config.history.lookback_minutes));
        let outcome = DedupEngine::new(self.store.as_ref(), lookback)
            .filter_new(kind, collected.events, self.started_at)
            .await?;

        if !outcome.fresh.is_empty() {
            self.store.insert(&outcome.fresh).await?;
        }

        let report = IngestReport {
            source: kind,
            fetched,
            malformed: collected.malformed,
            duplicates: outcome.duplicates,
            inserted: outcome.fresh.len(),
        };
        info!(
            source = %kind,
            fetched = report.fetched,
            malformed = report.malformed,
            duplicates = report.duplicates,
            inserted = report.inserted,
            "ingest finished"
        );
        Ok(report)
    }

    /// Runs every source in turn. An auth failure stops the run; any other
    /// failure is recorded and the remaining sources still run.
    pub async fn ingest_all(
        &self,
        sources: &[Source],
        hours_override: Option<u32>,
    ) -> Result<RunSummary> {
        let mut summary = RunSummary::default();
        for source in sources {
            match self.ingest_source(source, hours_override).await {
                Ok(report) => summary.reports.push(report),
                Err(err) if err.is_auth() => return Err(err),
                Err(err) => {
                    error!(source = %source.kind(), %err, "ingest failed");
                    summary.failures.push((source.kind(), err.to_string()));
                }
            }
        }
        Ok(summary)
    }

    /// A local calendar day when `date` is given, otherwise the 24 hours
    /// ending at the start of this run.
    pub async fn analyze_day(&self, date: Option<NaiveDate>) -> Result<DayReport> {
        let (start, end) = match date {
            Some(date) => analysis::local_day_bounds(date, &self.offset),
            None => (self.started_at - Duration::hours(24), self.started_at),
        };
        let events = self.store.events_between(start, end).await?;
        let summary = analysis::summarize_day(&events, &self.offset);

        Ok(DayReport {
            window_start: timestamp::canonical(&start),
            window_end: timestamp::canonical(&end),
            summary,
            events,
        })
    }

    /// Seven local days ending with `end_date`, today by default.
    pub async fn analyze_week(&self, end_date: Option<NaiveDate>) -> Result<WeekSummary> {
        let end = end_date.unwrap_or_else(|| analysis::local_date(&self.started_at, &self.offset));
        let first = end - Duration::days(weekly::WEEK_DAYS - 1);
        let (start, _) = analysis::local_day_bounds(first, &self.offset);
        let (_, stop) = analysis::local_day_bounds(end, &self.offset);

        let events = self.store.events_between(start, stop).await?;
        Ok(weekly::summarize_week(&events, end, &self.offset))
    }
}
