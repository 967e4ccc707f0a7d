//! `SyncRemote` over the feedlog HTTP API.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::json;
use tracing::debug;
use uuid::Uuid;

use feedlog_core::migration::{BackfillReport, MigrationCounts, MigrationReport};
use feedlog_core::models::{DeleteOutcome, FeedingPayload, FeedingRecord, PullBatch, UpdateOutcome};
use feedlog_core::sync::SyncRemote;
use feedlog_core::time::format_timestamp;
use feedlog_core::{Error, Result};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

pub struct HttpRemote {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

#[derive(Deserialize)]
struct FeedingEnvelope {
    feeding: FeedingRecord,
}

/// Every error body the server sends, flattened.
#[derive(Debug, Default, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    conflict: bool,
    #[serde(default)]
    server_record: Option<FeedingRecord>,
}

impl HttpRemote {
    pub fn new(base_url: &str, api_key: Option<String>) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(format!("feedlog-cli/{}", env!("CARGO_PKG_VERSION")))
            .timeout(REQUEST_TIMEOUT)
            .connect_timeout(CONNECT_TIMEOUT)
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
        })
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let builder = self.client.request(method, format!("{}{path}", self.base_url));
        match self.api_key {
            Some(ref key) => builder.bearer_auth(key),
            None => builder,
        }
    }

    pub async fn backfill_client_ids(&self) -> Result<BackfillReport> {
        let resp = send(self.request(Method::POST, "/api/feedings/backfill-client-ids")).await?;
        if !resp.status().is_success() {
            return Err(error_from(resp).await);
        }
        read_json(resp).await
    }
}

#[async_trait]
impl SyncRemote for HttpRemote {
    async fn push_create(&self, client_id: Uuid, payload: &FeedingPayload) -> Result<FeedingRecord> {
        let body = json!({
            "client_id": client_id,
            "feeding_time": format_timestamp(payload.feeding_time),
            "food_type": payload.food_type,
            "notes": payload.notes,
        });
        let resp = send(self.request(Method::POST, "/api/feedings").json(&body)).await?;
        if resp.status() == StatusCode::CONFLICT {
            let body = error_body(resp).await;
            if body.code.as_deref() == Some("duplicate_client_id") {
                return Err(Error::DuplicateClientId(client_id));
            }
            return Err(Error::Remote(format!(
                "unexpected conflict on create: {}",
                body.error.unwrap_or_default()
            )));
        }
        if !resp.status().is_success() {
            return Err(error_from(resp).await);
        }
        Ok(read_json::<FeedingEnvelope>(resp).await?.feeding)
    }

    async fn push_update(
        &self,
        client_id: Uuid,
        payload: &FeedingPayload,
        base: Option<DateTime<Utc>>,
    ) -> Result<UpdateOutcome> {
        let body = json!({
            "feeding_time": format_timestamp(payload.feeding_time),
            "food_type": payload.food_type,
            "notes": payload.notes,
            "updated_at": base.map(format_timestamp),
        });
        let path = format!("/api/feedings/{client_id}");
        let resp = send(self.request(Method::PUT, &path).json(&body)).await?;
        if resp.status() == StatusCode::CONFLICT {
            let body = error_body(resp).await;
            return match body.server_record {
                Some(server_record) if body.conflict => {
                    Ok(UpdateOutcome::Conflict { server_record })
                }
                _ => Err(Error::Remote(format!(
                    "conflict response without a server record: {}",
                    body.error.unwrap_or_default()
                ))),
            };
        }
        if !resp.status().is_success() {
            return Err(error_from(resp).await);
        }
        let feeding = read_json::<FeedingEnvelope>(resp).await?.feeding;
        Ok(UpdateOutcome::Updated { feeding })
    }

    async fn push_delete(&self, client_id: Uuid) -> Result<DeleteOutcome> {
        let path = format!("/api/feedings/{client_id}");
        let resp = send(self.request(Method::DELETE, &path)).await?;
        match resp.status() {
            s if s.is_success() => Ok(DeleteOutcome::Deleted),
            StatusCode::NOT_FOUND => Ok(DeleteOutcome::NotFound),
            _ => Err(error_from(resp).await),
        }
    }

    async fn pull(&self, since: DateTime<Utc>, limit: Option<i64>) -> Result<PullBatch> {
        let mut query = vec![("since", format_timestamp(since))];
        if let Some(limit) = limit {
            query.push(("limit", limit.to_string()));
        }
        let resp = send(
            self.request(Method::GET, "/api/feedings/sync")
                .query(&query),
        )
        .await?;
        if !resp.status().is_success() {
            return Err(error_from(resp).await);
        }
        let batch: PullBatch = read_json(resp).await?;
        debug!(records = batch.records.len(), deleted = batch.deleted.len(), "pulled page");
        Ok(batch)
    }

    async fn migration_status(&self) -> Result<MigrationCounts> {
        let resp = send(self.request(Method::GET, "/api/feedings/migration-status")).await?;
        if !resp.status().is_success() {
            return Err(error_from(resp).await);
        }
        read_json(resp).await
    }

    /// A failed migration still answers with a report, under a 500.
    async fn run_migration(&self) -> Result<MigrationReport> {
        let resp = send(self.request(Method::POST, "/api/feedings/auto-migrate")).await?;
        let status = resp.status();
        if status.is_success() || status == StatusCode::INTERNAL_SERVER_ERROR {
            let text = resp.text().await.map_err(transport_error)?;
            if let Ok(report) = serde_json::from_str::<MigrationReport>(&text) {
                return Ok(report);
            }
            return Err(Error::Remote(format!("{status}: {text}")));
        }
        Err(error_from(resp).await)
    }
}

async fn send(builder: RequestBuilder) -> Result<Response> {
    builder.send().await.map_err(transport_error)
}

fn transport_error(err: reqwest::Error) -> Error {
    if err.is_connect() || err.is_timeout() {
        Error::Unavailable(err.to_string())
    } else {
        Error::Remote(err.to_string())
    }
}

async fn read_json<T: DeserializeOwned>(resp: Response) -> Result<T> {
    resp.json()
        .await
        .map_err(|e| Error::Remote(format!("invalid response body: {e}")))
}

async fn error_body(resp: Response) -> ErrorBody {
    resp.json().await.unwrap_or_default()
}

/// Map a non-success response onto the shared error taxonomy.
async fn error_from(resp: Response) -> Error {
    let status = resp.status();
    let body = error_body(resp).await;
    let message = body
        .error
        .unwrap_or_else(|| status.canonical_reason().unwrap_or("request failed").to_string());
    match status {
        StatusCode::SERVICE_UNAVAILABLE | StatusCode::BAD_GATEWAY | StatusCode::GATEWAY_TIMEOUT => {
            Error::Unavailable(message)
        }
        StatusCode::NOT_FOUND => Error::NotFound(message),
        StatusCode::BAD_REQUEST if body.code.as_deref() == Some("migration_required") => {
            Error::MigrationRequired
        }
        StatusCode::BAD_REQUEST => Error::Validation(message),
        StatusCode::UNAUTHORIZED => Error::Remote(format!("unauthorized: {message}")),
        _ => Error::Remote(format!("{status}: {message}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use feedlog_core::db::Database;
    use feedlog_core::server::ServerStore;
    use feedlog_core::sync::SyncEngine;

    use crate::server::{router, tests::store};

    async fn serve(store: ServerStore, api_key: Option<String>) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router(store, api_key)).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn payload(food: &str) -> FeedingPayload {
        FeedingPayload::new(
            feedlog_core::time::parse_timestamp("2024-01-01T10:00:00Z").unwrap(),
            Some(food.to_string()),
            None,
        )
    }

    #[tokio::test]
    async fn two_devices_converge_over_http() {
        let (_dir, server) = store(true).await;
        let url = serve(server.clone(), Some("secret".to_string())).await;
        let remote = HttpRemote::new(&url, Some("secret".to_string())).unwrap();

        let phone = Database::open_in_memory().unwrap();
        let tablet = Database::open_in_memory().unwrap();
        let record = phone.create_feeding(&payload("formula")).unwrap();
        tablet.create_feeding(&payload("banana")).unwrap();

        SyncEngine::new(&phone, &remote).sync().await.unwrap();
        let summary = SyncEngine::new(&tablet, &remote).sync().await.unwrap();
        assert_eq!(summary.push.pushed, 1);
        SyncEngine::new(&phone, &remote).sync().await.unwrap();

        assert_eq!(phone.stats().unwrap().feeding_records, 2);
        assert_eq!(tablet.stats().unwrap().feeding_records, 2);

        assert!(phone.delete_feeding(record.client_id).unwrap());
        SyncEngine::new(&phone, &remote).sync().await.unwrap();
        SyncEngine::new(&tablet, &remote).sync().await.unwrap();
        assert!(tablet.get_feeding(record.client_id).unwrap().is_none());
        assert!(server.get_by_client_id(record.client_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn stale_update_comes_back_as_conflict() {
        let (_dir, server) = store(true).await;
        let url = serve(server.clone(), None).await;
        let remote = HttpRemote::new(&url, None).unwrap();

        let client_id = Uuid::new_v4();
        let created = remote.push_create(client_id, &payload("formula")).await.unwrap();
        let base = created.updated_at;
        let outcome = remote
            .push_update(client_id, &payload("banana"), Some(base))
            .await
            .unwrap();
        assert!(matches!(outcome, UpdateOutcome::Updated { .. }));

        let outcome = remote
            .push_update(client_id, &payload("apple"), Some(base))
            .await
            .unwrap();
        match outcome {
            UpdateOutcome::Conflict { server_record } => {
                assert_eq!(server_record.food_type, "banana");
            }
            UpdateOutcome::Updated { .. } => panic!("expected a conflict"),
        }

        let err = remote.push_create(client_id, &payload("x")).await.unwrap_err();
        assert!(matches!(err, Error::DuplicateClientId(id) if id == client_id));
    }

    #[tokio::test]
    async fn double_delete_is_not_found() {
        let (_dir, server) = store(true).await;
        let url = serve(server, None).await;
        let remote = HttpRemote::new(&url, None).unwrap();

        let client_id = Uuid::new_v4();
        remote.push_create(client_id, &payload("formula")).await.unwrap();
        assert_eq!(remote.push_delete(client_id).await.unwrap(), DeleteOutcome::Deleted);
        assert_eq!(remote.push_delete(client_id).await.unwrap(), DeleteOutcome::NotFound);
    }

    #[tokio::test]
    async fn migration_over_http() {
        let (_dir, server) = store(false).await;
        let url = serve(server, None).await;
        let remote = HttpRemote::new(&url, None).unwrap();

        let counts = remote.migration_status().await.unwrap();
        assert!(!counts.column_exists);
        assert!(matches!(
            remote.backfill_client_ids().await.unwrap_err(),
            Error::MigrationRequired
        ));
        assert!(matches!(
            remote.pull(feedlog_core::time::epoch(), None).await.unwrap_err(),
            Error::MigrationRequired
        ));

        let report = remote.run_migration().await.unwrap();
        assert!(report.success);
        assert!(report.column_added);
        let report = remote.backfill_client_ids().await.unwrap();
        assert_eq!(report.updated_count, 0);
    }

    #[tokio::test]
    async fn wrong_key_is_not_retryable() {
        let (_dir, server) = store(true).await;
        let url = serve(server, Some("secret".to_string())).await;
        let remote = HttpRemote::new(&url, Some("wrong".to_string())).unwrap();
        let err = remote.migration_status().await.unwrap_err();
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn unreachable_server_interrupts_push() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let remote = HttpRemote::new(&format!("http://{addr}"), None).unwrap();

        let err = remote.migration_status().await.unwrap_err();
        assert!(err.is_retryable());

        let db = Database::open_in_memory().unwrap();
        db.create_feeding(&payload("formula")).unwrap();
        let summary = SyncEngine::new(&db, &remote).sync().await.unwrap();
        assert!(summary.push.interrupted);
        assert!(summary.pull.is_none());
        assert_eq!(db.stats().unwrap().queued_operations, 1);
    }
}
