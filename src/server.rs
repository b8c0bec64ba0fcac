use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::{HeaderValue, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use base64::{engine::general_purpose::STANDARD, Engine};
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use crate::config::{ServerConfig, SessionConfig};
use crate::error::SessionError;
use crate::history::Turn;
use crate::session::{PhoneSession, StatusSnapshot};

#[derive(Debug, Serialize, Deserialize)]
pub struct Ack {
    pub success: bool,
    pub message: String,
}

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    pub message: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct ScreenshotRequest {
    #[serde(default)]
    pub device_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ScreenshotResponse {
    pub success: bool,
    /// Base64-encoded PNG.
    pub image: String,
    pub width: u32,
    pub height: u32,
    pub is_sensitive: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ScreenshotResponse {
    fn unavailable(error: String) -> Self {
        Self {
            success: false,
            image: String::new(),
            width: 0,
            height: 0,
            is_sensitive: false,
            error: Some(error),
        }
    }
}

fn error_response(err: &SessionError) -> Response {
    let status = match err {
        SessionError::Config(_) | SessionError::NotInitialized => StatusCode::BAD_REQUEST,
        SessionError::Busy => StatusCode::CONFLICT,
        SessionError::BackendUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    let body = Ack { success: false, message: err.user_message() };
    (status, Json(body)).into_response()
}

async fn init(State(session): State<PhoneSession>, Json(config): Json<SessionConfig>) -> Response {
    match session.initialize(config) {
        Ok(()) => Json(Ack { success: true, message: "Agent initialized".into() }).into_response(),
        Err(err) => error_response(&err),
    }
}

async fn status(State(session): State<PhoneSession>) -> Json<StatusSnapshot> {
    Json(session.status())
}

async fn history(State(session): State<PhoneSession>) -> Json<Vec<Turn>> {
    Json(session.history())
}

async fn chat(State(session): State<PhoneSession>, Json(req): Json<ChatRequest>) -> Response {
    match session.run_task(&req.message).await {
        Ok(resp) => Json(resp).into_response(),
        Err(err) => error_response(&err),
    }
}

async fn chat_stream(
    State(session): State<PhoneSession>,
    Json(req): Json<ChatRequest>,
) -> Result<Sse<impl Stream<Item = Result<Event, axum::Error>>>, Response> {
    let stream = session.open_stream(&req.message).map_err(|e| error_response(&e))?;
    // The stream ends after its terminal event, which closes the response.
    // If the client disconnects first, dropping the stream cancels the task.
    let events = stream.map(|event| Event::default().json_data(&event));
    Ok(Sse::new(events).keep_alive(KeepAlive::new().interval(Duration::from_secs(15))))
}

async fn screenshot(
    State(session): State<PhoneSession>,
    Json(req): Json<ScreenshotRequest>,
) -> Json<ScreenshotResponse> {
    let resp = match session.screenshot(req.device_id.as_deref()).await {
        Ok(frame) => ScreenshotResponse {
            success: true,
            image: STANDARD.encode(&frame.image),
            width: frame.width,
            height: frame.height,
            is_sensitive: frame.is_sensitive,
            error: frame.error,
        },
        Err(err) => ScreenshotResponse::unavailable(err.user_message()),
    };
    Json(resp)
}

async fn reset(State(session): State<PhoneSession>) -> Json<Ack> {
    session.reset();
    Json(Ack { success: true, message: "Agent reset".into() })
}

pub fn router(session: PhoneSession, cors_origin: &str) -> Result<Router> {
    let origin: HeaderValue = cors_origin
        .parse()
        .with_context(|| format!("invalid CORS origin '{cors_origin}'"))?;
    let cors = CorsLayer::new()
        .allow_origin(origin)
        .allow_methods(Any)
        .allow_headers(Any);
    Ok(Router::new()
        .route("/api/init", post(init))
        .route("/api/status", get(status))
        .route("/api/history", get(history))
        .route("/api/chat", post(chat))
        .route("/api/chat/stream", post(chat_stream))
        .route("/api/screenshot", post(screenshot))
        .route("/api/reset", post(reset))
        .layer(cors)
        .with_state(session))
}

pub async fn serve(cfg: &ServerConfig, session: PhoneSession) -> Result<()> {
    let app = router(session, &cfg.cors_origin)?;
    let listener = TcpListener::bind(cfg.addr)
        .await
        .with_context(|| format!("failed to bind {}", cfg.addr))?;
    info!(addr = %cfg.addr, "listening");
    axum::serve(listener, app).await?;
    Ok(())
}
