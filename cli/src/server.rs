use std::str::FromStr;

use anyhow::Context;
use axum::{
    Json, Router,
    extract::{Path, Query, Request, State},
    http::{HeaderValue, StatusCode, header},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post, put},
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use uuid::Uuid;

use feedlog_core::Error;
use feedlog_core::migration::{self, MigrationReport};
use feedlog_core::models::{
    FeedingInput, FeedingRecord, ListQuery, SortOrder, UpdateOutcome, parse_client_id,
};
use feedlog_core::server::ServerStore;
use feedlog_core::time::parse_timestamp;

const BODY_LIMIT: usize = 1024 * 1024; // 1 MB
const DEFAULT_FOOD_TYPE_LIMIT: i64 = 20;

#[derive(Clone)]
struct AppState {
    store: ServerStore,
    api_key: Option<String>,
}

// --- Request / Response types ---

#[derive(Deserialize)]
struct CreateFeedingRequest {
    client_id: Option<String>,
    #[serde(flatten)]
    feeding: FeedingInput,
}

#[derive(Deserialize)]
struct UpdateFeedingRequest {
    #[serde(flatten)]
    feeding: FeedingInput,
    /// The caller's base version. Only honoured for client-id updates.
    updated_at: Option<String>,
}

#[derive(Deserialize)]
struct ListParams {
    sort: Option<String>,
    limit: Option<i64>,
    offset: Option<i64>,
    search: Option<String>,
}

#[derive(Deserialize)]
struct SyncParams {
    since: Option<String>,
    limit: Option<i64>,
}

#[derive(Deserialize)]
struct FoodTypeParams {
    search: Option<String>,
    limit: Option<i64>,
}

#[derive(Serialize)]
struct FeedingResponse {
    success: bool,
    feeding: FeedingRecord,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

/// Path key for a single feeding: an integer server id or a client UUID.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RecordKey {
    Id(i64),
    ClientId(Uuid),
}

impl FromStr for RecordKey {
    type Err = ApiError;

    fn from_str(s: &str) -> Result<Self, ApiError> {
        if let Ok(id) = s.parse::<i64>() {
            return Ok(Self::Id(id));
        }
        parse_client_id(s)
            .map(Self::ClientId)
            .map_err(|_| ApiError::BadRequest(format!("Invalid feeding id '{s}'")))
    }
}

// --- Error handling ---

#[derive(Debug)]
enum ApiError {
    NotFound(String),
    BadRequest(String),
    MigrationRequired(String),
    Conflict(Box<FeedingRecord>),
    Duplicate(String),
    Unavailable(String),
    Internal(anyhow::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            Self::NotFound(msg) => (StatusCode::NOT_FOUND, json!({ "error": msg })),
            Self::BadRequest(msg) => (StatusCode::BAD_REQUEST, json!({ "error": msg })),
            Self::MigrationRequired(msg) => (
                StatusCode::BAD_REQUEST,
                json!({ "error": msg, "code": "migration_required" }),
            ),
            Self::Conflict(server_record) => (
                StatusCode::CONFLICT,
                json!({ "success": false, "conflict": true, "server_record": server_record }),
            ),
            Self::Duplicate(msg) => (
                StatusCode::CONFLICT,
                json!({ "success": false, "error": msg, "code": "duplicate_client_id" }),
            ),
            Self::Unavailable(msg) => {
                warn!("store unavailable: {msg}");
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    json!({ "error": "Service temporarily unavailable" }),
                )
            }
            Self::Internal(err) => {
                error!("internal server error: {err:#}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    json!({ "error": "Internal server error" }),
                )
            }
        };
        (status, Json(body)).into_response()
    }
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        match err {
            Error::Validation(msg) => Self::BadRequest(msg),
            Error::NotFound(msg) => Self::NotFound(msg),
            Error::MigrationRequired => Self::MigrationRequired(err.to_string()),
            Error::DuplicateClientId(_) => Self::Duplicate(err.to_string()),
            Error::Unavailable(msg) => Self::Unavailable(msg),
            other @ (Error::Database(_) | Error::Remote(_)) => Self::Internal(other.into()),
        }
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        Self::Internal(err)
    }
}

// --- Middleware ---

async fn require_auth(State(state): State<AppState>, request: Request, next: Next) -> Response {
    if let Some(ref expected_key) = state.api_key {
        let authorized = request
            .headers()
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .is_some_and(|token| token == expected_key);

        if !authorized {
            return (
                StatusCode::UNAUTHORIZED,
                Json(ErrorResponse {
                    error: "Invalid or missing API key".to_string(),
                }),
            )
                .into_response();
        }
    }
    next.run(request).await
}

async fn security_headers(request: Request, next: Next) -> Response {
    let mut response = next.run(request).await;
    let headers = response.headers_mut();
    headers.insert(
        header::X_CONTENT_TYPE_OPTIONS,
        HeaderValue::from_static("nosniff"),
    );
    headers.insert(header::X_FRAME_OPTIONS, HeaderValue::from_static("DENY"));
    headers.insert(
        header::CONTENT_SECURITY_POLICY,
        HeaderValue::from_static("default-src 'none'"),
    );
    response
}

// --- Health ---

async fn health(State(state): State<AppState>) -> Response {
    match state.store.health().await {
        Ok(()) => Json(json!({ "status": "ok", "database": "connected" })).into_response(),
        Err(e) => {
            warn!("health check failed: {e}");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "status": "error", "database": "disconnected" })),
            )
                .into_response()
        }
    }
}

// --- Feedings ---

async fn list_feedings(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> Result<impl IntoResponse, ApiError> {
    let sort = params
        .sort
        .as_deref()
        .map(SortOrder::from_str)
        .transpose()?
        .unwrap_or_default();
    let query = ListQuery {
        sort,
        limit: params.limit,
        offset: params.offset,
        search: params.search,
    };
    let page = state.store.list(&query).await?;
    Ok(Json(page))
}

async fn create_feeding(
    State(state): State<AppState>,
    Json(req): Json<CreateFeedingRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let client_id = req
        .client_id
        .as_deref()
        .map(parse_client_id)
        .transpose()?;
    let payload = req.feeding.into_payload()?;
    let feeding = state.store.create(client_id, &payload).await?;
    Ok((
        StatusCode::CREATED,
        Json(FeedingResponse {
            success: true,
            feeding,
        }),
    ))
}

async fn update_feeding(
    State(state): State<AppState>,
    Path(key): Path<String>,
    Json(req): Json<UpdateFeedingRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let payload = req.feeding.into_payload()?;
    let feeding = match key.parse::<RecordKey>()? {
        RecordKey::Id(id) => state
            .store
            .update_by_id(id, &payload)
            .await?
            .ok_or_else(|| ApiError::NotFound(format!("Feeding {id} not found")))?,
        RecordKey::ClientId(client_id) => {
            let base = req.updated_at.as_deref().map(parse_timestamp).transpose()?;
            match state
                .store
                .update_by_client_id(client_id, &payload, base)
                .await?
            {
                UpdateOutcome::Updated { feeding } => feeding,
                UpdateOutcome::Conflict { server_record } => {
                    return Err(ApiError::Conflict(Box::new(server_record)));
                }
            }
        }
    };
    Ok(Json(FeedingResponse {
        success: true,
        feeding,
    }))
}

async fn delete_feeding(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let deleted = match key.parse::<RecordKey>()? {
        RecordKey::Id(id) => state.store.delete_by_id(id).await?,
        RecordKey::ClientId(client_id) => state.store.delete_by_client_id(client_id).await?,
    };
    if !deleted {
        return Err(ApiError::NotFound(format!("Feeding {key} not found")));
    }
    Ok(Json(json!({ "success": true })))
}

async fn sync_feedings(
    State(state): State<AppState>,
    Query(params): Query<SyncParams>,
) -> Result<impl IntoResponse, ApiError> {
    let since = params
        .since
        .as_deref()
        .ok_or_else(|| ApiError::BadRequest("since parameter is required".to_string()))?;
    let since = parse_timestamp(since)?;
    let batch = state.store.changes_since(since, params.limit).await?;
    Ok(Json(batch))
}

// --- Migration ---

async fn migration_status(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let counts = migration::migration_status(&state.store).await?;
    Ok(Json(counts))
}

fn report_response(report: MigrationReport) -> Response {
    let status = if report.success {
        StatusCode::OK
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    };
    (status, Json(report)).into_response()
}

async fn run_migration(State(state): State<AppState>) -> Response {
    report_response(migration::run_migration(&state.store).await)
}

async fn backfill_client_ids(
    State(state): State<AppState>,
) -> Result<impl IntoResponse, ApiError> {
    let report = migration::backfill_client_ids(&state.store).await?;
    Ok(Json(report))
}

// --- Food types ---

async fn food_types(
    State(state): State<AppState>,
    Query(params): Query<FoodTypeParams>,
) -> Result<impl IntoResponse, ApiError> {
    let limit = params.limit.unwrap_or(DEFAULT_FOOD_TYPE_LIMIT);
    let types = state
        .store
        .food_types(params.search.as_deref(), limit)
        .await?;
    Ok(Json(json!({ "food_types": types })))
}

async fn recent_food_types(
    State(state): State<AppState>,
    Query(params): Query<FoodTypeParams>,
) -> Result<impl IntoResponse, ApiError> {
    let limit = params.limit.unwrap_or(DEFAULT_FOOD_TYPE_LIMIT);
    let types = state.store.recent_food_types(limit).await?;
    Ok(Json(json!({ "food_types": types })))
}

// --- Router builder ---

fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/feedings", get(list_feedings).post(create_feeding))
        .route("/api/feedings/sync", get(sync_feedings))
        .route("/api/feedings/migration-status", get(migration_status))
        .route("/api/feedings/auto-migrate", post(run_migration))
        .route("/api/feedings/run-migration", post(run_migration))
        .route("/api/feedings/backfill-client-ids", post(backfill_client_ids))
        .route(
            "/api/feedings/{key}",
            put(update_feeding).delete(delete_feeding),
        )
        .route("/api/food-types", get(food_types))
        .route("/api/food-types/recent", get(recent_food_types))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_auth))
        .layer(RequestBodyLimitLayer::new(BODY_LIMIT))
        .layer(middleware::from_fn(security_headers))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub(crate) fn router(store: ServerStore, api_key: Option<String>) -> Router {
    build_router(AppState { store, api_key })
}

// --- Server startup ---

pub async fn start_server(
    store: ServerStore,
    port: u16,
    bind: &str,
    api_key: Option<String>,
    auto_migrate: bool,
) -> anyhow::Result<()> {
    if auto_migrate {
        let report = migration::run_migration(&store).await;
        if !report.success {
            anyhow::bail!(
                "Startup migration failed: {}",
                report.error.unwrap_or(report.message)
            );
        }
        info!(
            status = %report.counts.migration_status,
            backfilled = report.backfilled,
            "startup migration finished"
        );
    }

    let app = router(store.clone(), api_key.clone());

    if let Some(ref key) = api_key {
        eprintln!(
            "API key: {} (see api_key file in data directory)",
            key_hint(key)
        );
    } else {
        eprintln!("Warning: Authentication disabled (--no-auth). API is open to anyone.");
    }

    if bind != "127.0.0.1" && bind != "localhost" && api_key.is_none() {
        eprintln!(
            "Warning: Listening on {bind} with no authentication. Any device on your network can access this API."
        );
    }

    let listener = tokio::net::TcpListener::bind(format!("{bind}:{port}"))
        .await
        .with_context(|| format!("failed to bind {bind}:{port}"))?;
    info!("listening on http://{bind}:{port}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    store.close().await;
    info!("server stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("failed to listen for Ctrl-C: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("failed to listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
    info!("shutdown signal received");
}

/// First and last four characters of the key, or a mask when the key is too
/// short to abbreviate.
fn key_hint(key: &str) -> String {
    let chars: Vec<char> = key.chars().collect();
    if chars.len() < 8 {
        return "****".to_string();
    }
    let head: String = chars[..4].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{head}...{tail}")
}
