mod classify;
mod config;
mod http;
mod idempotency;
mod ingest;
mod jobs;
mod llm;
mod metrics;
mod models;
mod pipeline;
mod pricing;
mod probability;
mod security;
mod store;

use axum::{
    Json, Router,
    body::Bytes,
    extract::{DefaultBodyLimit, Path, Query, State},
    http::{HeaderMap, StatusCode, header},
    middleware,
    response::{Html, IntoResponse, Response},
    routing::{get, post},
};
use classify::Classifier;
use config::{ClassifierConfig, ServerConfig};
use eyre::WrapErr;
use idempotency::IdempotencyCache;
use llm::{LlmClient, LlmConfig};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use models::{
    ApiError, BatchRequest, ListingDraft, ListingFilters, ListingPatch, PostcodeStatsInput,
};
use pipeline::{Pipeline, PipelineError, PipelineErrorKind};
use security::{AuthContext, AuthState, Caller, Role, identify_caller};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::{net::SocketAddr, sync::Arc, time::Duration};
use store::{MemoryStore, RowStore, SupabaseClient};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt};
use uuid::Uuid;

const ADMIN_ONLY: &[Role] = &[Role::Admin];
const LISTING_MANAGERS: &[Role] = &[Role::Admin, Role::Agent];

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        error!(target = "fixedprice.api", "server crashed: {err:?}");
    }
}

async fn run() -> eyre::Result<()> {
    let _ = dotenvy::dotenv();
    init_tracing();

    let config = ServerConfig::from_env();
    let prometheus_handle = PrometheusBuilder::new()
        .install_recorder()
        .wrap_err("install prometheus recorder")?;
    metrics::describe();

    let store: Arc<dyn RowStore> = match SupabaseClient::from_env() {
        Some(client) => {
            info!(target = "fixedprice.store", "using supabase row store");
            Arc::new(client)
        }
        None => {
            warn!(
                target = "fixedprice.store",
                "SUPABASE_URL or service key unset; using in-memory store"
            );
            Arc::new(MemoryStore::new())
        }
    };
    let classifier = Classifier::new(
        Arc::new(LlmClient::new(LlmConfig::from_env())),
        ClassifierConfig::from_env(),
    );
    let pipeline = Pipeline::new(store, classifier);
    let (queue, _worker) = jobs::JobQueue::spawn(pipeline.clone());

    let state = AppState {
        pipeline,
        queue,
        openapi: Arc::new(load_openapi()),
        idempotency: IdempotencyCache::new(
            config.redis_url.as_deref(),
            Duration::from_secs(config.idempotency_ttl_secs),
        ),
        prometheus_handle,
        metrics_key: config.metrics_key.clone(),
        openapi_key: config.openapi_key.clone(),
    };
    let app = router(state, AuthState::from_env(), config.body_limit);

    let addr: SocketAddr = ([0, 0, 0, 0], config.port).into();
    info!(target = "fixedprice.api", "listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .wrap_err_with(|| format!("bind {addr}"))?;
    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .wrap_err("serve")?;
    Ok(())
}

fn router(state: AppState, auth_state: AuthState, body_limit: usize) -> Router {
    let cors = CorsLayer::new()
        .allow_headers(Any)
        .allow_methods(Any)
        .allow_origin(Any);

    let api = Router::new()
        .route("/listings", get(list_listings).post(create_listing))
        .route(
            "/listings/{id}",
            get(get_listing).put(update_listing).delete(remove_listing),
        )
        .nest(
            "/ingestion",
            Router::new()
                .route("/manual", post(ingest_manual))
                .route("/stats", get(ingestion_stats))
                .route(
                    "/postcode-stats",
                    get(list_postcode_stats).post(upsert_postcode_stats),
                )
                .route("/postcode-stats/{postcode}", get(get_postcode_stats)),
        )
        .nest(
            "/classifications",
            Router::new()
                .route("/manual/{id}", post(classify_listing))
                .route("/batch", post(classify_batch))
                .route("/stats", get(classification_stats)),
        )
        .nest(
            "/jobs",
            Router::new()
                .route("/classifications", post(enqueue_classification_job))
                .route("/{id}", get(get_job_status)),
        )
        .route_layer(middleware::from_fn_with_state(auth_state, identify_caller));

    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics_endpoint))
        .route("/openapi.json", get(openapi_json))
        .route("/docs", get(swagger_ui))
        .nest("/api/v1", api)
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .layer(DefaultBodyLimit::max(body_limit))
}

#[derive(Clone)]
struct AppState {
    pipeline: Pipeline,
    queue: jobs::JobQueue,
    openapi: Arc<serde_json::Value>,
    idempotency: IdempotencyCache,
    prometheus_handle: PrometheusHandle,
    metrics_key: Option<String>,
    openapi_key: Option<String>,
}

/// Health and readiness check.
///
/// - Method: `GET`
/// - Path: `/health`
/// - Auth: none
async fn health() -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "service": "fixedprice-api-rs",
    }))
}

fn load_openapi() -> serde_json::Value {
    serde_yaml::from_str(include_str!("../docs/openapi.yaml"))
        .unwrap_or_else(|_| json!({"openapi": "3.0.3"}))
}

async fn openapi_json(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, AppError> {
    if let Some(key) = &state.openapi_key
        && presented(&headers, "X-Docs-Key") != key.as_str()
    {
        return Err(AppError::Unauthenticated);
    }
    Ok(Json((*state.openapi).clone()))
}

async fn swagger_ui() -> Html<&'static str> {
    Html(
        r#"<!doctype html>
<html>
<head>
  <meta charset='utf-8'/>
  <title>Fixed Price API Docs</title>
  <link rel="stylesheet" href="https://unpkg.com/swagger-ui-dist@5/swagger-ui.css" />
</head>
<body>
  <div id="swagger-ui"></div>
  <script src="https://unpkg.com/swagger-ui-dist@5/swagger-ui-bundle.js"></script>
  <script>
    window.onload = () => {
      window.ui = SwaggerUIBundle({ url: '/openapi.json', dom_id: '#swagger-ui' });
    };
  </script>
</body>
</html>"#,
    )
}

async fn metrics_endpoint(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Some(secret) = &state.metrics_key
        && presented(&headers, "X-Metrics-Key") != secret.as_str()
    {
        return (StatusCode::UNAUTHORIZED, "unauthorized").into_response();
    }
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.prometheus_handle.render(),
    )
        .into_response()
}

fn presented<'a>(headers: &'a HeaderMap, name: &str) -> &'a str {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
}

/// Public listing feed.
///
/// - Method: `GET`
/// - Path: `/api/v1/listings`
/// - Auth: optional; `confidence_level` needs an admin or subscriber key
async fn list_listings(
    State(state): State<AppState>,
    caller: Caller,
    Query(filters): Query<ListingFilters>,
) -> Result<Json<Vec<models::ListingView>>, AppError> {
    crate::metrics::inc_requests("/api/v1/listings");
    let views = state.pipeline.list_listings(filters, caller.0.as_ref()).await?;
    Ok(Json(views))
}

#[derive(Debug, Deserialize)]
struct BudgetQuery {
    #[serde(default)]
    user_budget: Option<f64>,
}

async fn get_listing(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(query): Query<BudgetQuery>,
) -> Result<Json<models::ListingView>, AppError> {
    crate::metrics::inc_requests("/api/v1/listings/{id}");
    let view = state.pipeline.get_listing(id, query.user_budget).await?;
    Ok(Json(view))
}

async fn create_listing(
    State(state): State<AppState>,
    caller: Caller,
    Json(draft): Json<ListingDraft>,
) -> Result<(StatusCode, Json<models::Listing>), AppError> {
    crate::metrics::inc_requests("/api/v1/listings");
    let context = require_role(caller, LISTING_MANAGERS)?;
    let listing = state.pipeline.create_listing(draft, &context).await?;
    Ok((StatusCode::CREATED, Json(listing)))
}

async fn update_listing(
    State(state): State<AppState>,
    caller: Caller,
    Path(id): Path<Uuid>,
    Json(patch): Json<ListingPatch>,
) -> Result<Json<models::Listing>, AppError> {
    crate::metrics::inc_requests("/api/v1/listings/{id}");
    let context = require_role(caller, LISTING_MANAGERS)?;
    let listing = state.pipeline.update_listing(id, patch, &context).await?;
    Ok(Json(listing))
}

async fn remove_listing(
    State(state): State<AppState>,
    caller: Caller,
    Path(id): Path<Uuid>,
) -> Result<Json<models::RemovalOutcome>, AppError> {
    crate::metrics::inc_requests("/api/v1/listings/{id}");
    let context = require_role(caller, LISTING_MANAGERS)?;
    let outcome = state.pipeline.remove_listing(id, &context).await?;
    Ok(Json(outcome))
}

/// Validate, store and classify a single listing.
///
/// - Method: `POST`
/// - Path: `/api/v1/ingestion/manual`
/// - Auth: admin or agent key
/// - Honours `Idempotency-Key`; a repeated key from the same caller replays
///   the first response without touching the store.
async fn ingest_manual(
    State(state): State<AppState>,
    caller: Caller,
    headers: HeaderMap,
    Json(draft): Json<ListingDraft>,
) -> Result<(StatusCode, Json<models::IngestOutcome>), AppError> {
    crate::metrics::inc_requests("/api/v1/ingestion/manual");
    let context = require_role(caller, LISTING_MANAGERS)?;
    info!(
        target = "fixedprice.api",
        user_id = %context.user_id,
        key_id = %context.key_id,
        "manual ingestion invoked",
    );

    let key = headers
        .get("Idempotency-Key")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty());

    if let Some(key) = &key
        && let Some(existing) = state
            .idempotency
            .get::<models::IngestOutcome>(&context.user_id, key)
            .await
    {
        return Ok((StatusCode::CREATED, Json(existing)));
    }

    let outcome = state.pipeline.ingest(draft, &context).await?;
    if let Some(key) = &key {
        state.idempotency.put(&context.user_id, key, &outcome).await;
    }
    Ok((StatusCode::CREATED, Json(outcome)))
}

async fn ingestion_stats(
    State(state): State<AppState>,
    caller: Caller,
) -> Result<Json<models::IngestionStats>, AppError> {
    crate::metrics::inc_requests("/api/v1/ingestion/stats");
    require_role(caller, ADMIN_ONLY)?;
    Ok(Json(state.pipeline.ingestion_stats().await?))
}

async fn upsert_postcode_stats(
    State(state): State<AppState>,
    caller: Caller,
    Json(input): Json<PostcodeStatsInput>,
) -> Result<Json<models::PostcodeStatsSaved>, AppError> {
    crate::metrics::inc_requests("/api/v1/ingestion/postcode-stats");
    require_role(caller, ADMIN_ONLY)?;
    Ok(Json(state.pipeline.upsert_postcode_stats(input).await?))
}

async fn list_postcode_stats(
    State(state): State<AppState>,
    caller: Caller,
) -> Result<Json<models::PostcodeStatsList>, AppError> {
    crate::metrics::inc_requests("/api/v1/ingestion/postcode-stats");
    require_role(caller, ADMIN_ONLY)?;
    Ok(Json(state.pipeline.list_postcode_stats().await?))
}

async fn get_postcode_stats(
    State(state): State<AppState>,
    caller: Caller,
    Path(postcode): Path<String>,
) -> Result<Json<models::PostcodeStats>, AppError> {
    crate::metrics::inc_requests("/api/v1/ingestion/postcode-stats/{postcode}");
    require_role(caller, ADMIN_ONLY)?;
    Ok(Json(state.pipeline.get_postcode_stats(&postcode).await?))
}

async fn classify_listing(
    State(state): State<AppState>,
    caller: Caller,
    Path(id): Path<Uuid>,
) -> Result<Json<models::ClassifyOutcome>, AppError> {
    crate::metrics::inc_requests("/api/v1/classifications/manual/{id}");
    require_role(caller, ADMIN_ONLY)?;
    Ok(Json(state.pipeline.classify_listing(id).await?))
}

async fn classify_batch(
    State(state): State<AppState>,
    caller: Caller,
    body: Bytes,
) -> Result<Json<models::BatchReport>, AppError> {
    crate::metrics::inc_requests("/api/v1/classifications/batch");
    require_role(caller, ADMIN_ONLY)?;
    let request = batch_request(&body)?;
    Ok(Json(state.pipeline.classify_batch(request).await?))
}

async fn classification_stats(
    State(state): State<AppState>,
    caller: Caller,
) -> Result<Json<models::ClassificationStats>, AppError> {
    crate::metrics::inc_requests("/api/v1/classifications/stats");
    require_role(caller, ADMIN_ONLY)?;
    Ok(Json(state.pipeline.classification_stats().await?))
}

#[derive(Debug, Serialize)]
struct EnqueueResponse {
    job_id: String,
}

async fn enqueue_classification_job(
    State(state): State<AppState>,
    caller: Caller,
    body: Bytes,
) -> Result<(StatusCode, Json<EnqueueResponse>), AppError> {
    crate::metrics::inc_requests("/api/v1/jobs/classifications");
    let context = require_role(caller, ADMIN_ONLY)?;
    let request = batch_request(&body)?;
    let id = state
        .queue
        .enqueue_batch(request, &context)
        .await
        .map_err(|err| AppError::Pipeline(PipelineError::internal("enqueue", err.error)))?;
    Ok((
        StatusCode::ACCEPTED,
        Json(EnqueueResponse {
            job_id: id.to_string(),
        }),
    ))
}

async fn get_job_status(
    State(state): State<AppState>,
    caller: Caller,
    Path(id): Path<String>,
) -> Result<Json<jobs::JobInfo>, AppError> {
    require_role(caller, ADMIN_ONLY)?;
    let Ok(uuid) = Uuid::parse_str(&id) else {
        return Err(AppError::Pipeline(PipelineError::invalid_input(
            "jobs",
            "invalid_job_id",
        )));
    };
    state
        .queue
        .get(uuid)
        .await
        .map(Json)
        .ok_or_else(|| AppError::Pipeline(PipelineError::not_found("jobs", "not_found")))
}

/// An empty body means the default batch.
fn batch_request(body: &[u8]) -> Result<BatchRequest, AppError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(BatchRequest::default());
    }
    serde_json::from_slice(body).map_err(|err| {
        AppError::Pipeline(PipelineError::invalid_input("batch", err.to_string()))
    })
}

fn require_role(caller: Caller, allowed: &[Role]) -> Result<AuthContext, AppError> {
    let Caller(Some(context)) = caller else {
        return Err(AppError::Unauthenticated);
    };
    if context.has_role(allowed) {
        Ok(context)
    } else {
        Err(AppError::Pipeline(PipelineError::forbidden(
            "authorize",
            "Insufficient role for this operation",
        )))
    }
}

#[derive(Debug)]
enum AppError {
    Unauthenticated,
    Pipeline(PipelineError),
}

impl From<PipelineError> for AppError {
    fn from(value: PipelineError) -> Self {
        Self::Pipeline(value)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match self {
            AppError::Unauthenticated => (
                StatusCode::UNAUTHORIZED,
                Json(ApiError {
                    error: "unauthorized".into(),
                    detail: Some("Missing or invalid API key".into()),
                    existing_listing: None,
                }),
            )
                .into_response(),
            AppError::Pipeline(err) => {
                let status = match err.kind() {
                    PipelineErrorKind::InvalidInput => StatusCode::BAD_REQUEST,
                    PipelineErrorKind::NotFound => StatusCode::NOT_FOUND,
                    PipelineErrorKind::Forbidden => StatusCode::FORBIDDEN,
                    PipelineErrorKind::Conflict => StatusCode::CONFLICT,
                    PipelineErrorKind::Internal => {
                        error!(target = "fixedprice.api", stage = err.stage(), error = %err, "request_failed");
                        StatusCode::INTERNAL_SERVER_ERROR
                    }
                };
                let payload = ApiError {
                    error: err.stage().to_string(),
                    detail: Some(err.detail().to_string()),
                    existing_listing: err.existing().cloned(),
                };
                (status, Json(payload)).into_response()
            }
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tower_http=debug"));
    let _ = fmt().with_env_filter(filter).try_init();
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(target = "fixedprice.api", error = %err, "ctrl_c handler unavailable");
        std::future::pending::<()>().await;
    }
    info!(target = "fixedprice.api", "shutdown signal received");
}
