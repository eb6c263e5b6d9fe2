//! PostgREST (Supabase) backend for the event store.

use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, RequestBuilder};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::error::{check_response, Error, Result};
use crate::models::{ListeningEvent, SourceKind};
use crate::store::EventStore;
use crate::timestamp;

const SERVICE: &str = "store";
const PAGE_SIZE: usize = 1000;

pub struct RestStore {
    client: Client,
    endpoint: String,
    key: String,
}

#[derive(Deserialize)]
struct TimestampRow {
    played_at: String,
}

#[derive(Deserialize)]
struct IdentityRow {
    song: String,
    artist: Option<String>,
}

/// `in.("a","b")`
fn in_list<'a>(values: impl IntoIterator<Item = &'a str>) -> String {
    let quoted: Vec<String> = values.into_iter().map(|value| format!("\"{value}\"")).collect();
    format!("in.({})", quoted.join(","))
}

/// Rows stored under any name of `source`, plus unlabeled rows when they
/// belong to it.
fn source_filter(source: SourceKind) -> (&'static str, String) {
    let names = in_list(source.stored_names().iter().copied());
    if source.includes_unlabeled() {
        ("or", format!("(source.{names},source.is.null)"))
    } else {
        ("source", names)
    }
}

impl RestStore {
    pub fn new(client: Client, base_url: &str, key: &str, table: &str) -> Self {
        Self {
            client,
            endpoint: format!("{}/rest/v1/{}", base_url.trim_end_matches('/'), table),
            key: key.to_string(),
        }
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        request.header("apikey", &self.key).bearer_auth(&self.key)
    }

    async fn select<T: DeserializeOwned>(&self, query: &[(&str, String)]) -> Result<Vec<T>> {
        let response = self
            .authorized(self.client.get(&self.endpoint))
            .query(query)
            .send()
            .await
            .map_err(|err| Error::network(SERVICE, err))?;
        let response = check_response(SERVICE, response).await?;
        response.json::<Vec<T>>().await.map_err(|err| Error::Payload {
            service: SERVICE,
            detail: err.to_string(),
        })
    }
}

#[async_trait]
impl EventStore for RestStore {
    async fn existing_timestamps(&self, timestamps: &[String]) -> Result<HashSet<String>> {
        if timestamps.is_empty() {
            return Ok(HashSet::new());
        }
        let rows: Vec<TimestampRow> = self
            .select(&[
                ("played_at", in_list(timestamps.iter().map(String::as_str))),
                ("select", "played_at".to_string()),
            ])
            .await?;
        debug!(checked = timestamps.len(), found = rows.len(), "existence query");
        Ok(rows.into_iter().map(|row| row.played_at).collect())
    }

    async fn recent_identities(
        &self,
        source: SourceKind,
        since: DateTime<Utc>,
    ) -> Result<Vec<(String, String)>> {
        let rows: Vec<IdentityRow> = self
            .select(&[
                source_filter(source),
                ("played_at", format!("gte.{}", timestamp::canonical(&since))),
                ("select", "song,artist".to_string()),
            ])
            .await?;
        Ok(rows
            .into_iter()
            .map(|row| (row.song, row.artist.unwrap_or_default()))
            .collect())
    }

    async fn insert(&self, events: &[ListeningEvent]) -> Result<()> {
        if events.is_empty() {
            return Ok(());
        }
        // One POST is one statement on the server side: all rows or none.
        let response = self
            .authorized(self.client.post(&self.endpoint))
            .header("Prefer", "return=minimal")
            .json(events)
            .send()
            .await
            .map_err(|err| Error::network(SERVICE, err))?;

        match check_response(SERVICE, response).await {
            Ok(_) => Ok(()),
            Err(Error::Payload { detail, .. }) => Err(Error::Rejected {
                count: events.len(),
                detail,
            }),
            Err(err) => Err(err),
        }
    }

    async fn events_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<ListeningEvent>> {
        let mut events = Vec::new();
        let mut offset = 0;

        loop {
            let page: Vec<serde_json::Value> = self
                .select(&[
                    ("played_at", format!("gte.{}", timestamp::canonical(&start))),
                    ("played_at", format!("lt.{}", timestamp::canonical(&end))),
                    ("order", "played_at.asc".to_string()),
                    ("limit", PAGE_SIZE.to_string()),
                    ("offset", offset.to_string()),
                ])
                .await?;
            let fetched = page.len();

            for row in page {
                match serde_json::from_value::<ListeningEvent>(row) {
                    Ok(event) => events.push(event),
                    Err(err) => warn!(%err, "skipping undecodable stored row"),
                }
            }

            if fetched < PAGE_SIZE {
                break;
            }
            offset += fetched;
        }

        Ok(events)
    }

    async fn latest_played_at(&self, source: SourceKind) -> Result<Option<DateTime<Utc>>> {
        let rows: Vec<TimestampRow> = self
            .select(&[
                source_filter(source),
                ("select", "played_at".to_string()),
                ("order", "played_at.desc".to_string()),
                ("limit", "1".to_string()),
            ])
            .await?;
        match rows.into_iter().next() {
            Some(row) => Ok(Some(timestamp::parse_instant(&row.played_at)?)),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn store(server: &MockServer) -> RestStore {
        RestStore::new(Client::new(), &server.uri(), "secret-key", "songs")
    }

    fn sample() -> ListeningEvent {
        crate::analysis::tests::event("360", "Charli xcx", "2025-02-12T21:39:48.911Z", 133.805)
    }

    #[tokio::test]
    async fn existence_query_uses_in_filter() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/rest/v1/songs"))
            .and(header("apikey", "secret-key"))
            .and(header("authorization", "Bearer secret-key"))
            .and(query_param(
                "played_at",
                "in.(\"2025-02-12T21:39:48.911000+00:00\")",
            ))
            .and(query_param("select", "played_at"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!([{ "played_at": "2025-02-12T21:39:48.911+00:00" }])),
            )
            .mount(&server)
            .await;

        let found = store(&server)
            .existing_timestamps(&["2025-02-12T21:39:48.911000+00:00".to_string()])
            .await
            .unwrap();
        assert!(found.contains("2025-02-12T21:39:48.911+00:00"));
    }

    #[tokio::test]
    async fn empty_existence_check_skips_the_request() {
        let server = MockServer::start().await;
        let found = store(&server).existing_timestamps(&[]).await.unwrap();
        assert!(found.is_empty());
        assert!(server.received_requests().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn server_errors_are_network_errors() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let err = store(&server)
            .existing_timestamps(&["2025-02-12T21:39:48.911000+00:00".to_string()])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Network { .. }));
    }

    #[tokio::test]
    async fn insert_posts_the_whole_batch() {
        let server = MockServer::start().await;
        let event = sample();
        Mock::given(method("POST"))
            .and(path("/rest/v1/songs"))
            .and(header("prefer", "return=minimal"))
            .and(body_json(json!([{
                "song": "360",
                "artist": "Charli xcx",
                "album": "360 (album)",
                "duration": 133.805,
                "release_date": "2024-06-07",
                "played_at": "2025-02-12T21:39:48.911000+00:00",
                "song_popularity": 50,
                "source": "stream-service-exact",
                "energy": null,
                "valence": null
            }])))
            .respond_with(ResponseTemplate::new(201))
            .expect(1)
            .mount(&server)
            .await;

        store(&server).insert(&[event]).await.unwrap();
    }

    #[tokio::test]
    async fn rejected_insert_is_a_batch_failure() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(400).set_body_string("column \"energy\" does not exist"),
            )
            .mount(&server)
            .await;

        let err = store(&server).insert(&[sample(), sample()]).await.unwrap_err();
        assert!(matches!(err, Error::Rejected { count: 2, .. }));
    }

    #[tokio::test]
    async fn expired_key_is_an_auth_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let err = store(&server).insert(&[sample()]).await.unwrap_err();
        assert!(err.is_auth());
    }

    #[tokio::test]
    async fn range_query_skips_undecodable_rows_only() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(query_param("order", "played_at.asc"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {
                    "song": "360",
                    "artist": "Charli xcx",
                    "album": "BRAT",
                    "duration": 133.805,
                    "release_date": "2024-06-07",
                    "played_at": "2025-02-12T21:39:48.911+00:00",
                    "song_popularity": 80,
                    "source": null
                },
                {
                    "song": "Apple",
                    "artist": "Charli xcx",
                    "album": "BRAT",
                    "duration": 151.0,
                    "played_at": "2025-02-12T21:42:03+00:00",
                    "source": "vinyl"
                },
                { "song": "Broken", "artist": "Nobody", "duration": 10, "played_at": "whenever" }
            ])))
            .mount(&server)
            .await;

        let start = timestamp::parse_instant("2025-02-12T00:00:00Z").unwrap();
        let end = timestamp::parse_instant("2025-02-13T00:00:00Z").unwrap();
        let events = store(&server).events_between(start, end).await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].album, "BRAT");
        assert_eq!(events[1].source, SourceKind::from_stored(Some("vinyl")));
    }

    #[tokio::test]
    async fn exact_source_queries_include_unlabeled_rows() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(query_param(
                "or",
                "(source.in.(\"stream-service-exact\"),source.is.null)",
            ))
            .and(query_param("order", "played_at.desc"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!([{ "played_at": "2025-02-12T21:39:48.911+00:00" }])),
            )
            .expect(1)
            .mount(&server)
            .await;

        let latest = store(&server)
            .latest_played_at(SourceKind::StreamServiceExact)
            .await
            .unwrap();
        assert_eq!(
            latest.map(|at| timestamp::canonical(&at)),
            Some("2025-02-12T21:39:48.911000+00:00".to_string())
        );
    }

    #[tokio::test]
    async fn checkpoint_reads_newest_row() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(query_param("source", "in.(\"scraped-history\",\"YoutubeMusic\")"))
            .and(query_param("order", "played_at.desc"))
            .and(query_param("limit", "1"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!([{ "played_at": "2025-03-01T10:00:00Z" }])),
            )
            .mount(&server)
            .await;

        let latest = store(&server)
            .latest_played_at(SourceKind::ScrapedHistory)
            .await
            .unwrap();
        assert_eq!(
            latest.map(|at| timestamp::canonical(&at)),
            Some("2025-03-01T10:00:00.000000+00:00".to_string())
        );
    }
}
