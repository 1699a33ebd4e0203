use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, Path, State},
    http::{header, HeaderMap, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use log::{error, info};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::{Stream, StreamExt};
use tower_http::cors::{Any, CorsLayer};

use crate::api::{ErrorBody, RecordingBody, TokenRequest};
use crate::chunk_wire::{self, decode_chunk};
use crate::config::ServerConfig;
use crate::error::{AuthError, ProctorError, Result};
use crate::registry::{qr_payload, DeviceEntry};
use crate::service::ProctorService;
use crate::types::{
    AnalysisSample, Calibration, CalibrationAck, ChunkManifestEntry, CreatedSession,
    DataLossRisk, DeviceRole, JoinGrant, RoleConfig, SessionReport, UploadAck, Violation,
};

/// Largest accepted chunk upload body
const MAX_CHUNK_BODY: usize = 64 * 1024 * 1024;

// State for API handlers
pub struct AppState {
    pub service: Arc<ProctorService>,
    pub public_url: Option<String>,
}

impl IntoResponse for ProctorError {
    fn into_response(self) -> Response {
        let status = match &self {
            ProctorError::Auth(AuthError::RoleNotPermitted(_)) => StatusCode::FORBIDDEN,
            ProctorError::Auth(AuthError::SessionEnded) => StatusCode::CONFLICT,
            ProctorError::Auth(_) => StatusCode::UNAUTHORIZED,
            ProctorError::NotFound(_) => StatusCode::NOT_FOUND,
            ProctorError::Conflict(_) => StatusCode::CONFLICT,
            ProctorError::InvalidInput(_) | ProctorError::Json(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!("[Serve] {}", self);
        }
        let body = ErrorBody {
            code: ErrorBody::code_for(&self).to_string(),
            error: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

/// Response to session creation
#[derive(Debug, Serialize, Deserialize)]
pub struct CreateSessionResponse {
    #[serde(flatten)]
    pub session: CreatedSession,
    /// Join link for the secondary device, when one was requested and a public URL is configured
    pub secondary_qr: Option<String>,
}

#[derive(Serialize)]
struct Done {
    ok: bool,
}

const DONE: Done = Done { ok: true };

fn bearer(headers: &HeaderMap) -> Result<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|credential| !credential.is_empty())
        .ok_or_else(|| AuthError::CredentialInvalid.into())
}

/// Build the API router over a service
pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_handler))
        .route("/api/sessions", post(create_session_handler))
        .route("/api/join", post(join_handler))
        .route(
            "/api/recording",
            get(get_recording_handler).put(set_recording_handler),
        )
        .route(
            "/api/chunks",
            post(upload_chunk_handler).layer(DefaultBodyLimit::max(MAX_CHUNK_BODY)),
        )
        .route("/api/violations", post(violation_handler))
        .route("/api/analysis", post(analysis_handler))
        .route("/api/calibration", post(calibration_handler))
        .route("/api/data-loss", post(data_loss_handler))
        .route("/api/disconnect", post(disconnect_handler))
        .route("/api/end", post(end_handler))
        .route("/api/sessions/{id}/end", post(end_by_id_handler))
        .route("/api/sessions/{id}/violations", get(violations_handler))
        .route("/api/sessions/{id}/chunks", get(chunks_handler))
        .route("/api/sessions/{id}/devices", get(devices_handler))
        .route("/api/sessions/{id}/report", get(report_handler))
        .route("/api/sessions/{id}/feed", get(feed_handler))
        .layer(cors)
        .with_state(state)
}

/// Run the API server until it fails
pub async fn serve(config: ServerConfig) -> Result<()> {
    let service = Arc::new(ProctorService::open(&config).await?);
    let state = Arc::new(AppState {
        service,
        public_url: config.public_url.clone(),
    });

    println!("Starting proctoring server");
    println!("Database: {}", config.database_path.display());
    println!("Relay: {}", config.relay_url);
    println!("Listening on: http://[::]:{} (IPv4 + IPv6)", config.port);

    let listener = tokio::net::TcpListener::bind(format!("[::]:{}", config.port))
        .await
        .map_err(|e| {
            ProctorError::Config(format!("failed to bind to port {}: {}", config.port, e))
        })?;
    info!("[Serve] API server started on port {}", config.port);
    axum::serve(listener, router(state)).await?;
    Ok(())
}

async fn health_handler() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

async fn create_session_handler(
    State(state): State<Arc<AppState>>,
    Json(roles): Json<RoleConfig>,
) -> Result<Json<CreateSessionResponse>> {
    let session = state.service.create_session(roles).await?;
    let secondary_qr = match (&state.public_url, session.token_for(DeviceRole::Secondary)) {
        (Some(url), Some(token)) => Some(qr_payload(url, token)),
        _ => None,
    };
    Ok(Json(CreateSessionResponse {
        session,
        secondary_qr,
    }))
}

async fn join_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<TokenRequest>,
) -> Result<Json<JoinGrant>> {
    Ok(Json(state.service.exchange_token(&request.token).await?))
}

async fn get_recording_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<RecordingBody>> {
    let recording = state.service.get_recording(bearer(&headers)?).await?;
    Ok(Json(RecordingBody { recording }))
}

async fn set_recording_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<RecordingBody>,
) -> Result<Json<RecordingBody>> {
    let recording = state
        .service
        .set_recording(bearer(&headers)?, body.recording)
        .await?;
    Ok(Json(RecordingBody { recording }))
}

async fn upload_chunk_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<UploadAck>> {
    let credential = bearer(&headers)?;
    if let Some(content_type) = headers.get(header::CONTENT_TYPE) {
        if content_type.as_bytes() != chunk_wire::CONTENT_TYPE.as_bytes() {
            return Err(ProctorError::InvalidInput(format!(
                "expected content type {}",
                chunk_wire::CONTENT_TYPE
            )));
        }
    }
    let chunk = decode_chunk(&body).map_err(|e| ProctorError::InvalidInput(e.to_string()))?;
    Ok(Json(state.service.upload_chunk(credential, chunk).await?))
}

async fn violation_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(violation): Json<Violation>,
) -> Result<Json<Done>> {
    state
        .service
        .report_violation(bearer(&headers)?, &violation)
        .await?;
    Ok(Json(DONE))
}

async fn analysis_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(sample): Json<AnalysisSample>,
) -> Result<Json<Done>> {
    state
        .service
        .report_analysis(bearer(&headers)?, &sample)
        .await?;
    Ok(Json(DONE))
}

async fn calibration_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(calibration): Json<Calibration>,
) -> Result<Json<CalibrationAck>> {
    let ack = state
        .service
        .report_calibration(bearer(&headers)?, &calibration)
        .await?;
    Ok(Json(ack))
}

async fn data_loss_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(risk): Json<DataLossRisk>,
) -> Result<Json<Done>> {
    state
        .service
        .report_data_loss(bearer(&headers)?, &risk)
        .await?;
    Ok(Json(DONE))
}

async fn disconnect_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Done>> {
    state.service.disconnect(bearer(&headers)?).await?;
    Ok(Json(DONE))
}

async fn end_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Done>> {
    state.service.end_session(bearer(&headers)?).await?;
    Ok(Json(DONE))
}

async fn end_by_id_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<Done>> {
    state
        .service
        .end_session_by_id(&id, bearer(&headers)?)
        .await?;
    Ok(Json(DONE))
}

async fn violations_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Vec<Violation>>> {
    Ok(Json(state.service.list_violations(&id).await?))
}

async fn chunks_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Vec<ChunkManifestEntry>>> {
    Ok(Json(state.service.list_chunks(&id).await?))
}

async fn devices_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Vec<DeviceEntry>>> {
    Ok(Json(state.service.list_devices(&id).await?))
}

async fn report_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<SessionReport>> {
    Ok(Json(state.service.session_report(&id).await?))
}

/// Live feed as server-sent events; lagging subscribers skip what they missed
async fn feed_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Sse<impl Stream<Item = std::result::Result<Event, axum::Error>>>> {
    let receiver = state.service.subscribe_feed(&id).await?;
    let stream = BroadcastStream::new(receiver)
        .filter_map(|item| item.ok())
        .map(|event| Event::default().json_data(&event));
    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}
