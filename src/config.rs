use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::ValueEnum;
use serde::Deserialize;

use crate::spotify::MAX_RECENT_LIMIT;

pub const DEFAULT_SPOTIFY_API: &str = "https://api.spotify.com/v1";
pub const DEFAULT_TABLE: &str = "songs";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// PostgREST / Supabase over HTTP.
    #[default]
    Rest,
    /// Direct Postgres connection.
    Postgres,
}

/// Values that came from command-line flags or their env fallbacks.
#[derive(Debug, Clone, Default)]
pub struct CliConfig {
    pub store: Option<StoreBackend>,
    pub rest_url: Option<String>,
    pub rest_key: Option<String>,
    pub database_url: Option<String>,
    pub spotify_token: Option<String>,
    pub history_url: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct FileConfig {
    pub store: Option<StoreFileConfig>,
    pub spotify: Option<SpotifyFileConfig>,
    pub history: Option<HistoryFileConfig>,
    pub utc_offset_hours: Option<i32>,
    pub http_timeout_secs: Option<u64>,
    pub default_lookback_hours: Option<u32>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct StoreFileConfig {
    pub backend: Option<StoreBackend>,
    pub rest_url: Option<String>,
    pub rest_key: Option<String>,
    pub table: Option<String>,
    pub database_url: Option<String>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct SpotifyFileConfig {
    pub access_token: Option<String>,
    pub api_base: Option<String>,
    pub fetch_limit: Option<usize>,
    pub audio_features: Option<bool>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct HistoryFileConfig {
    pub url: Option<String>,
    pub hours_back: Option<u32>,
    pub lookback_minutes: Option<u32>,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        toml::from_str(&content)
            .with_context(|| format!("failed to parse config file {}", path.display()))
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub store: StoreSettings,
    pub spotify: SpotifySettings,
    pub history: HistorySettings,
    pub utc_offset_hours: i32,
    pub http_timeout: Duration,
    pub default_lookback_hours: u32,
}

#[derive(Debug, Clone)]
pub struct StoreSettings {
    pub backend: StoreBackend,
    pub rest_url: Option<String>,
    pub rest_key: Option<String>,
    pub table: String,
    pub database_url: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SpotifySettings {
    /// Source and search enrichment are both off without a token.
    pub access_token: Option<String>,
    pub api_base: String,
    pub fetch_limit: usize,
    pub audio_features: bool,
}

#[derive(Debug, Clone)]
pub struct HistorySettings {
    /// Scraped history is disabled when unset.
    pub url: Option<String>,
    pub hours_back: u32,
    pub lookback_minutes: u32,
}

impl HistorySettings {
    pub fn fetch_limit(&self) -> usize {
        self.hours_back as usize * crate::history::ENTRIES_PER_HOUR
    }
}

impl AppConfig {
    /// Resolve configuration from CLI arguments and an optional TOML file.
    /// File values override CLI values where present.
    pub fn resolve(cli: &CliConfig, file_config: Option<FileConfig>) -> Result<Self> {
        let file = file_config.unwrap_or_default();

        let store_file = file.store.unwrap_or_default();
        let store = StoreSettings {
            backend: store_file.backend.or(cli.store).unwrap_or_default(),
            rest_url: store_file.rest_url.or_else(|| cli.rest_url.clone()),
            rest_key: store_file.rest_key.or_else(|| cli.rest_key.clone()),
            table: store_file.table.unwrap_or_else(|| DEFAULT_TABLE.to_string()),
            database_url: store_file.database_url.or_else(|| cli.database_url.clone()),
        };
        match store.backend {
            StoreBackend::Rest if store.rest_url.is_none() || store.rest_key.is_none() => {
                bail!(
                    "the rest store needs SUPABASE_URL and SUPABASE_KEY \
                     (or [store] rest_url / rest_key)"
                )
            }
            StoreBackend::Postgres if store.database_url.is_none() => {
                bail!("the postgres store needs DATABASE_URL (or [store] database_url)")
            }
            _ => {}
        }
        if store.table.trim().is_empty() {
            bail!("store table name must not be empty");
        }

        let spotify_file = file.spotify.unwrap_or_default();
        let spotify = SpotifySettings {
            access_token: spotify_file
                .access_token
                .or_else(|| cli.spotify_token.clone())
                .filter(|token| !token.trim().is_empty()),
            api_base: spotify_file
                .api_base
                .unwrap_or_else(|| DEFAULT_SPOTIFY_API.to_string()),
            fetch_limit: spotify_file
                .fetch_limit
                .unwrap_or(MAX_RECENT_LIMIT)
                .clamp(1, MAX_RECENT_LIMIT),
            audio_features: spotify_file.audio_features.unwrap_or(false),
        };

        let history_file = file.history.unwrap_or_default();
        let history = HistorySettings {
            url: history_file
                .url
                .or_else(|| cli.history_url.clone())
                .filter(|url| !url.trim().is_empty()),
            hours_back: history_file.hours_back.unwrap_or(2),
            lookback_minutes: history_file.lookback_minutes.unwrap_or(120),
        };
        if history.hours_back == 0 {
            bail!("history.hours_back must be at least 1");
        }

        let utc_offset_hours = file.utc_offset_hours.unwrap_or(-5);
        if !(-12..=14).contains(&utc_offset_hours) {
            bail!("utc_offset_hours must be between -12 and 14, got {utc_offset_hours}");
        }

        let http_timeout_secs = file.http_timeout_secs.unwrap_or(10);
        if http_timeout_secs == 0 {
            bail!("http_timeout_secs must be positive");
        }

        Ok(Self {
            store,
            spotify,
            history,
            utc_offset_hours,
            http_timeout: Duration::from_secs(http_timeout_secs),
            default_lookback_hours: file.default_lookback_hours.unwrap_or(1),
        })
    }
}
