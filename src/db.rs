use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use tracing::warn;
use uuid::Uuid;

use crate::error::Result;
use crate::models::{ListeningEvent, SourceKind};
use crate::store::EventStore;
use crate::timestamp;

/// Direct Postgres backend. Uses the `songs` table from `./migrations`.
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str, timeout: Duration) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .acquire_timeout(timeout)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub async fn init_db(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(sqlx::Error::from)?;
        Ok(())
    }
}

fn event_from_row(row: &PgRow) -> std::result::Result<ListeningEvent, sqlx::Error> {
    let popularity: i16 = row.try_get("song_popularity")?;
    let source: Option<String> = row.try_get("source")?;
    let release_date: Option<String> = row.try_get("release_date")?;

    Ok(ListeningEvent {
        title: row.try_get("song")?,
        artist: row.try_get("artist")?,
        album: row.try_get("album")?,
        duration: row.try_get("duration")?,
        release_date: timestamp::release_date_or_unknown(release_date.as_deref()),
        played_at: row.try_get("played_at")?,
        popularity: popularity.clamp(0, 100) as u8,
        source: SourceKind::from_stored(source.as_deref()),
        energy: row.try_get("energy")?,
        valence: row.try_get("valence")?,
    })
}

#[async_trait]
impl EventStore for PgStore {
    async fn existing_timestamps(&self, timestamps: &[String]) -> Result<HashSet<String>> {
        if timestamps.is_empty() {
            return Ok(HashSet::new());
        }
        let instants = timestamps
            .iter()
            .map(|value| timestamp::parse_instant(value))
            .collect::<std::result::Result<Vec<DateTime<Utc>>, _>>()?;

        let rows = sqlx::query("SELECT played_at FROM songs WHERE played_at = ANY($1)")
            .bind(instants)
            .fetch_all(&self.pool)
            .await?;

        let mut found = HashSet::new();
        for row in rows {
            let played_at: DateTime<Utc> = row.try_get("played_at")?;
            found.insert(played_at.to_rfc3339());
        }
        Ok(found)
    }

    async fn recent_identities(
        &self,
        source: SourceKind,
        since: DateTime<Utc>,
    ) -> Result<Vec<(String, String)>> {
        let rows = sqlx::query(
            r#"
            SELECT song, artist FROM songs
            WHERE (source = ANY($1) OR ($2 AND source IS NULL)) AND played_at >= $3
            "#,
        )
        .bind(source.stored_names().to_vec())
        .bind(source.includes_unlabeled())
        .bind(since)
        .fetch_all(&self.pool)
        .await?;

        let mut identities = Vec::with_capacity(rows.len());
        for row in rows {
            identities.push((row.try_get("song")?, row.try_get("artist")?));
        }
        Ok(identities)
    }

    async fn insert(&self, events: &[ListeningEvent]) -> Result<()> {
        if events.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;

        for event in events {
            sqlx::query(
                r#"
                INSERT INTO songs
                (id, song, artist, album, duration, release_date, played_at,
                 song_popularity, source, energy, valence)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(&event.title)
            .bind(&event.artist)
            .bind(&event.album)
            .bind(event.duration)
            .bind(&event.release_date)
            .bind(event.played_at)
            .bind(i16::from(event.popularity))
            .bind(event.source.as_str())
            .bind(event.energy)
            .bind(event.valence)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn events_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<ListeningEvent>> {
        let rows = sqlx::query(
            r#"
            SELECT song, artist, album, duration, release_date, played_at,
                   song_popularity, source, energy, valence
            FROM songs
            WHERE played_at >= $1 AND played_at < $2
            ORDER BY played_at ASC
            "#,
        )
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await?;

        let mut events = Vec::with_capacity(rows.len());
        for row in rows {
            match event_from_row(&row) {
                Ok(event) => events.push(event),
                Err(err) => warn!(%err, "skipping undecodable stored row"),
            }
        }
        Ok(events)
    }

    async fn latest_played_at(&self, source: SourceKind) -> Result<Option<DateTime<Utc>>> {
        let row = sqlx::query(
            r#"
            SELECT max(played_at) AS latest FROM songs
            WHERE source = ANY($1) OR ($2 AND source IS NULL)
            "#,
        )
        .bind(source.stored_names().to_vec())
        .bind(source.includes_unlabeled())
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get("latest")?)
    }
}
