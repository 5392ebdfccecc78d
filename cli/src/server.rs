use anyhow::Result;
use axum::{
    extract::rejection::{JsonRejection, QueryRejection},
    extract::{Path, Query, Request, State},
    http::{HeaderValue, Method, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use chrono::{DateTime, Utc};
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use serde::{Deserialize, Serialize};
use spangraph_core::engine::EngineStats;
use spangraph_core::{Config, ErrorKind, Span, SpanGraphEngine, SpanGraphError, TraceId};
use std::num::NonZeroU32;
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;

type Limiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

#[derive(Clone)]
struct AppState {
    engine: Arc<SpanGraphEngine>,
    verbose: bool,
    started_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct SpanBatch {
    spans: Vec<Span>,
}

#[derive(Debug, Deserialize)]
struct SearchParams {
    query: Option<String>,
    limit: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct OperationParams {
    span_kind: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AskRequest {
    trace_id: String,
    question: String,
    hop: Option<i64>,
}

#[derive(Debug, Serialize)]
struct ApiResponse<T: Serialize> {
    success: bool,
    data: Option<T>,
    error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }
}

impl ApiResponse<String> {
    fn error(message: String) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message),
        }
    }
}

#[derive(Debug, Serialize)]
struct ServerStatus {
    version: String,
    uptime_seconds: i64,
    #[serde(flatten)]
    stats: EngineStats,
}

type ApiError = (StatusCode, Json<ApiResponse<String>>);

/// Response status for each error class
pub fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::Validation => StatusCode::BAD_REQUEST,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::DualWrite => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn api_error(e: SpanGraphError) -> ApiError {
    (status_for(e.kind()), Json(ApiResponse::error(e.to_string())))
}

fn bad_request(message: String) -> ApiError {
    (StatusCode::BAD_REQUEST, Json(ApiResponse::error(message)))
}

fn parse_trace_id(raw: &str) -> Result<TraceId, ApiError> {
    raw.parse::<TraceId>()
        .map_err(|e| bad_request(format!("Invalid trace ID '{}': {}", raw, e)))
}

pub async fn start_server(config: Config) -> Result<()> {
    let log_level = match config.logging.level.to_lowercase().as_str() {
        "trace" => tracing::Level::TRACE,
        "debug" => tracing::Level::DEBUG,
        "info" => tracing::Level::INFO,
        "warn" => tracing::Level::WARN,
        "error" => tracing::Level::ERROR,
        _ => tracing::Level::INFO,
    };

    tracing_subscriber::fmt()
        .with_target(config.logging.include_modules)
        .with_max_level(log_level)
        .compact()
        .init();

    let engine = init_engine(&config).await?;
    let app = build_router(&config, Arc::clone(&engine));

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    println!(
        "\n🕸  Spangraph Server Started!\n━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━\n   🌐 Server:        http://{}\n   📥 Ingest:        http://{}/api/spans\n   📊 Status:        http://{}/status\n   🔍 Search:        http://{}/api/search?query=...\n   💬 Ask:           http://{}/api/ask\n   🎯 Get trace:     http://{}/api/traces/:id\n   🧭 Services:      http://{}/api/services\n━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━\n",
        addr, addr, addr, addr, addr, addr, addr
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    engine.stop().await;
    tracing::info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
    }
}

pub async fn init_engine(config: &Config) -> Result<Arc<SpanGraphEngine>> {
    let engine = Arc::new(SpanGraphEngine::new(config.clone()).await?);
    engine.start().await?;
    Ok(engine)
}

pub fn build_router(config: &Config, engine: Arc<SpanGraphEngine>) -> Router {
    let state = AppState {
        engine,
        verbose: config.server.verbose,
        started_at: Utc::now(),
    };

    let mut router = Router::new()
        .route("/health", get(health_handler))
        .route("/status", get(status_handler))
        .route("/api/spans", post(ingest_spans_handler))
        .route("/api/search", get(search_handler))
        .route("/api/ask", post(ask_handler))
        .route("/api/traces/:trace_id", get(get_trace_handler))
        .route("/api/pending", get(pending_handler))
        .route("/api/services", get(services_handler))
        .route("/api/services/:name/operations", get(operations_handler))
        .with_state(state);

    if config.server.rate_limit_enabled {
        if let Some(rpm) = NonZeroU32::new(config.server.rate_limit_rpm) {
            let limiter = Arc::new(RateLimiter::direct(Quota::per_minute(rpm)));
            router = router.layer(middleware::from_fn_with_state(limiter, rate_limit));
        }
    }

    if config.server.cors_enabled {
        router = router.layer(build_cors(config));
    }

    router.layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
}

fn build_cors(config: &Config) -> CorsLayer {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any);

    if config.server.cors_origins.iter().any(|o| o == "*") {
        return cors.allow_origin(Any);
    }

    let origins: Vec<HeaderValue> = config
        .server
        .cors_origins
        .iter()
        .filter_map(|origin| match origin.parse::<HeaderValue>() {
            Ok(value) => Some(value),
            Err(_) => {
                tracing::warn!("Ignoring invalid CORS origin: {}", origin);
                None
            }
        })
        .collect();
    cors.allow_origin(AllowOrigin::list(origins))
}

async fn rate_limit(State(limiter): State<Arc<Limiter>>, request: Request, next: Next) -> Response {
    if limiter.check().is_err() {
        tracing::warn!("Rate limit exceeded for {}", request.uri().path());
        return (
            StatusCode::TOO_MANY_REQUESTS,
            Json(ApiResponse::error("Rate limit exceeded".to_string())),
        )
            .into_response();
    }
    next.run(request).await
}

async fn health_handler() -> impl IntoResponse {
    Json(ApiResponse::success("ok"))
}

async fn status_handler(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let stats = state.engine.stats().await.map_err(api_error)?;
    let status = ServerStatus {
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: (Utc::now() - state.started_at).num_seconds(),
        stats,
    };
    Ok(Json(ApiResponse::success(status)))
}

async fn ingest_spans_handler(
    State(state): State<AppState>,
    batch: Result<Json<SpanBatch>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(batch) = batch.map_err(|e| bad_request(format!("Invalid span batch: {}", e)))?;

    if state.verbose {
        tracing::info!("ingest_spans_handler -> {} spans", batch.spans.len());
    }

    let report = state.engine.write_spans(batch.spans).await;
    let Some(first) = report.failures.first() else {
        return Ok((StatusCode::OK, Json(ApiResponse::success(report))).into_response());
    };

    let status = status_for(first.kind);
    let message = format!(
        "{} of {} spans failed: {}",
        report.failures.len(),
        report.written + report.skipped + report.failures.len(),
        first.error
    );
    let body = ApiResponse {
        success: false,
        data: Some(report),
        error: Some(message),
    };
    Ok((status, Json(body)).into_response())
}

async fn search_handler(
    State(state): State<AppState>,
    params: Result<Query<SearchParams>, QueryRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Query(params) =
        params.map_err(|e| bad_request(format!("Invalid search parameters: {}", e)))?;
    let query = params.query.unwrap_or_default();

    if state.verbose {
        tracing::info!("search_handler -> query: {:?}, limit: {:?}", query, params.limit);
    }

    let results = state
        .engine
        .search(&query, params.limit)
        .await
        .map_err(api_error)?;
    Ok(Json(ApiResponse::success(results)))
}

async fn ask_handler(
    State(state): State<AppState>,
    request: Result<Json<AskRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Json(request) = request.map_err(|e| bad_request(format!("Invalid ask request: {}", e)))?;
    let trace_id = parse_trace_id(&request.trace_id)?;

    if state.verbose {
        tracing::info!(
            "ask_handler -> trace: {}, hop: {:?}, question: {:?}",
            trace_id,
            request.hop,
            request.question
        );
    }

    let answer = state
        .engine
        .ask(trace_id, &request.question, request.hop)
        .await
        .map_err(api_error)?;
    Ok(Json(ApiResponse::success(answer)))
}

async fn get_trace_handler(
    State(state): State<AppState>,
    Path(trace_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let trace_id = parse_trace_id(&trace_id)?;
    let record = state.engine.get_trace(trace_id).await.map_err(api_error)?;
    Ok(Json(ApiResponse::success(record)))
}

async fn services_handler(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let services = state.engine.services().await.map_err(api_error)?;
    Ok(Json(ApiResponse::success(services)))
}

async fn operations_handler(
    State(state): State<AppState>,
    Path(name): Path<String>,
    params: Result<Query<OperationParams>, QueryRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Query(params) =
        params.map_err(|e| bad_request(format!("Invalid operation parameters: {}", e)))?;

    if state.verbose {
        tracing::info!(
            "operations_handler -> service: {}, span_kind: {:?}",
            name,
            params.span_kind
        );
    }

    let operations = state
        .engine
        .operations(&name, params.span_kind.as_deref())
        .await
        .map_err(api_error)?;
    Ok(Json(ApiResponse::success(operations)))
}

async fn pending_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(ApiResponse::success(state.engine.pending_edges().await))
}
