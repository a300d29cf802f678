use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use axum::extract::multipart::MultipartRejection;
use axum::extract::rejection::JsonRejection;
use axum::extract::{DefaultBodyLimit, Multipart, Request, State};
use axum::http::{header, HeaderName, HeaderValue, Method, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use screening_api::{
    default_upload_tmp_dir, parse_bool_flag, render_bulk, render_individual, ApiError, AppState,
    BulkReportRequest, BulkSummary, DataModeReport, ErrorKind, HealthReport, RefreshReport,
    ReportRequest, ReportResponse, ServiceConfig,
};
use screening_core::{ScreeningOutcome, SubjectInput};
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const SERVICE_CONTRACT_VERSION: &str = "service.v1";
const OPENAPI_YAML: &str = include_str!("../../../openapi/openapi.yaml");
const API_KEY_HEADER: &str = "x-api-key";
const LATENCY_HEADER: &str = "x-processing-time-ms";
const UPLOAD_FIELD: &str = "file";

type SharedState = Arc<AppState>;

#[derive(Debug, Parser)]
#[command(name = "screening-service")]
#[command(about = "HTTP service for sanctions screening")]
struct Args {
    #[arg(long, env = "API_HOST", default_value = "127.0.0.1")]
    host: String,
    #[arg(long, env = "API_PORT", default_value_t = 8000)]
    port: u16,
    #[arg(long, env = "DATA_DIR", default_value = "sanctions_data")]
    data_dir: PathBuf,
    #[arg(long, env = "MAX_UPLOAD_SIZE_MB", default_value_t = 10)]
    max_upload_size_mb: u64,
    #[arg(long, env = "CONFIG_PATH", default_value = "config.yaml")]
    config_path: PathBuf,
    #[arg(long, env = "API_KEY", hide_env_values = true)]
    api_key: Option<String>,
    #[arg(
        long,
        env = "USE_DATABASE",
        default_value = "false",
        action = clap::ArgAction::Set,
        value_parser = flag_value
    )]
    use_database: bool,
    #[arg(long, env = "DATABASE_URL", hide_env_values = true)]
    database_url: Option<String>,
    #[arg(long, env = "BLOCKING_WORKERS", default_value_t = 4)]
    blocking_workers: usize,
    #[arg(long, env = "UPLOAD_TMP_DIR")]
    upload_tmp_dir: Option<PathBuf>,
    /// Comma-separated browser origins; empty or `*` allows any origin.
    #[arg(long, env = "CORS_ORIGINS", value_delimiter = ',')]
    cors_origins: Vec<String>,
}

#[allow(clippy::unnecessary_wraps)]
fn flag_value(raw: &str) -> Result<bool, String> {
    Ok(parse_bool_flag(raw))
}

impl Args {
    fn into_config(self) -> (ServiceConfig, Vec<String>) {
        let config = ServiceConfig {
            host: self.host,
            port: self.port,
            data_dir: self.data_dir,
            max_upload_size_mb: self.max_upload_size_mb,
            config_path: self.config_path,
            api_key: self.api_key,
            use_database: self.use_database,
            database_url: self.database_url,
            blocking_workers: self.blocking_workers,
            upload_tmp_dir: self.upload_tmp_dir.unwrap_or_else(default_upload_tmp_dir),
        };
        (config, self.cors_origins)
    }
}

/// Transport wrapper: picks the status code and logs what the body hides.
#[derive(Debug)]
struct ServiceError(ApiError);

impl From<ApiError> for ServiceError {
    fn from(value: ApiError) -> Self {
        Self(value)
    }
}

fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::InvalidUpload => StatusCode::BAD_REQUEST,
        ErrorKind::UnsupportedMediaType => StatusCode::UNSUPPORTED_MEDIA_TYPE,
        ErrorKind::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
        ErrorKind::Unauthenticated => StatusCode::UNAUTHORIZED,
        ErrorKind::Forbidden => StatusCode::FORBIDDEN,
        ErrorKind::InvalidSubject => StatusCode::UNPROCESSABLE_ENTITY,
        ErrorKind::ProviderUnavailable => StatusCode::SERVICE_UNAVAILABLE,
        ErrorKind::RefreshFailed => StatusCode::BAD_GATEWAY,
        ErrorKind::Configuration | ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = status_for(self.0.kind());
        if status.is_server_error() {
            error!(error = %self.0, code = self.0.code(), "request failed");
        } else {
            info!(error = %self.0, code = self.0.code(), "request rejected");
        }
        (status, Json(self.0.body())).into_response()
    }
}

fn invalid_json(rejection: &JsonRejection) -> ServiceError {
    ServiceError(ApiError::Validation(rejection.body_text()))
}

/// Build the CORS policy. An empty list or `*` allows any origin.
fn cors_layer(origins: &[String]) -> Result<CorsLayer> {
    let layer = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, HeaderName::from_static(API_KEY_HEADER)])
        .expose_headers([HeaderName::from_static(LATENCY_HEADER)]);

    let mut allowed = Vec::new();
    for origin in origins.iter().map(|origin| origin.trim()).filter(|origin| !origin.is_empty()) {
        if origin == "*" {
            return Ok(layer.allow_origin(Any));
        }
        allowed.push(
            HeaderValue::from_str(origin)
                .with_context(|| format!("invalid CORS origin `{origin}`"))?,
        );
    }
    if allowed.is_empty() {
        return Ok(layer.allow_origin(Any));
    }
    Ok(layer.allow_origin(AllowOrigin::list(allowed)))
}

fn app(state: SharedState, cors: CorsLayer) -> Router {
    let protected = Router::new()
        .route("/api/v1/screen", post(screen))
        .route(
            "/api/v1/screen/bulk",
            post(screen_bulk).layer(DefaultBodyLimit::disable()),
        )
        .route("/api/v1/data/update", post(data_update))
        .route_layer(middleware::from_fn_with_state(Arc::clone(&state), require_api_key));

    Router::new()
        .route("/api/v1/health", get(health))
        .route("/api/v1/openapi", get(openapi))
        .route("/api/v1/reports/generate", post(report_individual))
        .route("/api/v1/reports/generate-bulk", post(report_bulk))
        .route("/api/v1/debug/data-mode", get(debug_data_mode))
        .merge(protected)
        .layer(middleware::from_fn(track_latency))
        .layer(cors)
        .with_state(state)
}

/// Runs before any body extractor, so unauthenticated callers never see
/// validation errors.
async fn require_api_key(
    State(state): State<SharedState>,
    request: Request,
    next: Next,
) -> Result<Response, ServiceError> {
    let provided = request.headers().get(API_KEY_HEADER).and_then(|value| value.to_str().ok());
    state.authorize(provided)?;
    Ok(next.run(request).await)
}

async fn track_latency(request: Request, next: Next) -> Response {
    let started = Instant::now();
    let method = request.method().clone();
    let path = request.uri().path().to_string();

    let mut response = next.run(request).await;
    let elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
    response.headers_mut().insert(LATENCY_HEADER, HeaderValue::from(elapsed_ms));
    info!(
        method = %method,
        path = %path,
        status = response.status().as_u16(),
        latency_ms = elapsed_ms,
        "request handled"
    );
    response
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("screening_service=info,screening_api=info")),
        )
        .init();

    let (config, cors_origins) = Args::parse().into_config();
    let cors = cors_layer(&cors_origins)?;
    let bind = format!("{}:{}", config.host, config.port);
    let state = Arc::new(AppState::initialize(config).await.context("startup failed")?);

    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("cannot bind {bind}"))?;
    info!(bind = %bind, contract = SERVICE_CONTRACT_VERSION, "listening");
    axum::serve(listener, app(Arc::clone(&state), cors))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    state.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "cannot listen for ctrl-c; shutting down");
    }
    info!("shutdown requested; draining in-flight requests");
}

async fn health(State(state): State<SharedState>) -> Json<HealthReport> {
    Json(state.health().await)
}

async fn openapi() -> impl IntoResponse {
    (StatusCode::OK, [("content-type", "application/yaml; charset=utf-8")], OPENAPI_YAML)
}

async fn screen(
    State(state): State<SharedState>,
    input: Result<Json<SubjectInput>, JsonRejection>,
) -> Result<Json<ScreeningOutcome>, ServiceError> {
    let Json(input) = input.map_err(|rejection| invalid_json(&rejection))?;
    Ok(Json(state.screen(input).await?))
}

async fn screen_bulk(
    State(state): State<SharedState>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Json<BulkSummary>, ServiceError> {
    let mut multipart = multipart.map_err(|rejection| {
        ApiError::InvalidCsv(format!("malformed multipart body: {}", rejection.body_text()))
    })?;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|err| ApiError::InvalidCsv(format!("malformed multipart body: {err}")))?
    {
        if field.name() != Some(UPLOAD_FIELD) {
            continue;
        }
        let content_type = field.content_type().map(str::to_string);
        let summary = state.screen_upload(field, content_type.as_deref()).await?;
        return Ok(Json(summary));
    }
    Err(ApiError::InvalidCsv(format!("multipart body has no `{UPLOAD_FIELD}` field")).into())
}

async fn data_update(
    State(state): State<SharedState>,
) -> Result<Json<RefreshReport>, ServiceError> {
    Ok(Json(state.refresh().await?))
}

async fn report_individual(
    request: Result<Json<ReportRequest>, JsonRejection>,
) -> Result<Json<ReportResponse>, ServiceError> {
    let Json(request) = request.map_err(|rejection| invalid_json(&rejection))?;
    Ok(Json(render_individual(&request.screening_data)))
}

async fn report_bulk(
    request: Result<Json<BulkReportRequest>, JsonRejection>,
) -> Result<Json<ReportResponse>, ServiceError> {
    let Json(request) = request.map_err(|rejection| invalid_json(&rejection))?;
    Ok(Json(render_bulk(&request.results)))
}

async fn debug_data_mode(State(state): State<SharedState>) -> Json<DataModeReport> {
    Json(state.data_mode_report().await)
}
