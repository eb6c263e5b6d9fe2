//! Persistence gateway.
//!
//! Stores are append-only from this crate's point of view: rows are never
//! updated or deleted. Existence checks and inserts are separate calls, so
//! two overlapping runs can both pass the check before either inserts. Only
//! a uniqueness constraint on `played_at` in the store itself (or an
//! external lock around runs) closes that window.

use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::models::{ListeningEvent, SourceKind};

#[async_trait]
pub trait EventStore: Send + Sync {
    /// Which of `timestamps` are already stored, as the store spells them.
    /// Callers must normalize the answer before comparing.
    async fn existing_timestamps(&self, timestamps: &[String]) -> Result<HashSet<String>>;

    /// `(title, artist)` of rows from `source` played at or after `since`.
    async fn recent_identities(
        &self,
        source: SourceKind,
        since: DateTime<Utc>,
    ) -> Result<Vec<(String, String)>>;

    /// Appends the whole batch or nothing.
    async fn insert(&self, events: &[ListeningEvent]) -> Result<()>;

    /// Rows with `start <= played_at < end`, oldest first.
    async fn events_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<ListeningEvent>>;

    /// Newest stored `played_at` for a source; the checkpoint.
    async fn latest_played_at(&self, source: SourceKind) -> Result<Option<DateTime<Utc>>>;
}
