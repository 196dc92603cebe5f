//! HTTP front end.
//!
//! Thin axum layer over [`DeliveryPipeline`]. Handlers validate the request
//! body, resolve file names under the configured media directories, and run
//! the blocking pipeline call on the blocking thread pool.

use std::future::Future;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::config::{CaptionsConfig, Config};
use crate::pipeline::{DeliveryOutcome, DeliveryPipeline};

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pipeline: Arc<DeliveryPipeline>,
    video_dir: PathBuf,
    image_dir: PathBuf,
    captions: Arc<CaptionsConfig>,
}

impl AppState {
    /// State serving `pipeline` with the media directories and captions from
    /// `config`.
    pub fn new(pipeline: Arc<DeliveryPipeline>, config: &Config) -> Self {
        Self {
            pipeline,
            video_dir: config.media.video_dir.clone(),
            image_dir: config.media.image_dir.clone(),
            captions: Arc::new(config.captions.clone()),
        }
    }
}

#[derive(Debug, Deserialize)]
struct SendMessageRequest {
    phone_number: Option<String>,
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SendFileRequest {
    phone_number: Option<String>,
    file_name: Option<String>,
    caption: Option<String>,
}

/// Build the router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/health", get(health_handler))
        .route("/initialize", post(initialize_handler))
        .route("/send_message", post(send_message_handler))
        .route("/send_video_file", post(send_video_handler))
        .route("/send_image_file", post(send_image_handler))
        .with_state(state)
}

/// Serve on `listener` until `shutdown` resolves.
///
/// # Errors
///
/// Returns an error if the server fails while accepting connections.
pub async fn serve(
    listener: TcpListener,
    state: AppState,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let addr = listener.local_addr().context("listener has no local address")?;
    info!(%addr, "HTTP front end listening; POST /initialize to connect");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
        .context("HTTP server failed")?;
    info!("HTTP front end stopped");
    Ok(())
}

/// Resolve `file_name` under `base`.
///
/// The joined path is returned as given (not normalized), so it reads the way
/// the caller wrote it in logs and fallback records.
///
/// # Errors
///
/// Returns a message when `file_name` is empty or absolute, or when it
/// escapes `base` through `..`.
pub fn resolve_media_path(base: &Path, file_name: &str) -> Result<PathBuf, String> {
    let requested = Path::new(file_name);
    if file_name.is_empty() {
        return Err("file_name is required".to_owned());
    }
    if requested.is_absolute() || requested.has_root() {
        return Err(format!("file_name '{file_name}' must be relative"));
    }

    let joined = base.join(requested);
    let normalized = normalize_path(&joined);
    let base_normalized = normalize_path(base);
    if !normalized.starts_with(&base_normalized) || normalized == base_normalized {
        return Err(format!(
            "file_name '{file_name}' escapes '{}'",
            base.display()
        ));
    }
    Ok(joined)
}

/// Resolve `.` and `..` without touching the filesystem.
///
/// A `..` that would climb above the start is kept, so the result no longer
/// shares a prefix with a path that did not climb.
fn normalize_path(path: &Path) -> PathBuf {
    let mut components: Vec<Component<'_>> = Vec::new();
    for component in path.components() {
        match component {
            Component::ParentDir => match components.last() {
                Some(Component::Normal(_)) => {
                    components.pop();
                }
                _ => components.push(component),
            },
            Component::CurDir => {}
            other => components.push(other),
        }
    }
    components.iter().collect()
}

fn reply(status: StatusCode, outcome: DeliveryOutcome) -> Response {
    (status, Json(outcome)).into_response()
}

fn bad_request(message: impl Into<String>) -> Response {
    reply(
        StatusCode::BAD_REQUEST,
        DeliveryOutcome {
            success: false,
            message: message.into(),
            ack: None,
            size_warning: false,
        },
    )
}

fn present(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

/// Run a pipeline call on the blocking pool.
async fn run_pipeline<F>(state: &AppState, call: F) -> Result<DeliveryOutcome, Response>
where
    F: FnOnce(&DeliveryPipeline) -> DeliveryOutcome + Send + 'static,
{
    let pipeline = Arc::clone(&state.pipeline);
    tokio::task::spawn_blocking(move || call(&pipeline))
        .await
        .map_err(|e| {
            warn!(error = %e, "pipeline task failed");
            reply(
                StatusCode::INTERNAL_SERVER_ERROR,
                DeliveryOutcome {
                    success: false,
                    message: format!("Server error: {e}"),
                    ack: None,
                    size_warning: false,
                },
            )
        })
}

async fn index_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "message": "WhatsApp Sender API",
        "version": env!("CARGO_PKG_VERSION"),
        "endpoints": {
            "initialize": "POST /initialize",
            "send_message": "POST /send_message - {\"phone_number\": \"1234567890\", \"message\": \"Hello!\"}",
            "send_video_file": "POST /send_video_file - {\"phone_number\": \"1234567890\", \"file_name\": \"clip.mp4\", \"caption\": \"optional\"}",
            "send_image_file": "POST /send_image_file - {\"phone_number\": \"1234567890\", \"file_name\": \"photo.jpg\", \"caption\": \"optional\"}",
            "health": "GET /health",
        },
        "initialized": state.pipeline.is_live(),
    }))
}

async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.pipeline.health())
}

async fn initialize_handler(State(state): State<AppState>) -> Response {
    match run_pipeline(&state, DeliveryPipeline::initialize).await {
        Ok(outcome) if outcome.success => reply(StatusCode::OK, outcome),
        Ok(outcome) => reply(StatusCode::INTERNAL_SERVER_ERROR, outcome),
        Err(response) => response,
    }
}

async fn send_message_handler(
    State(state): State<AppState>,
    body: Result<Json<SendMessageRequest>, JsonRejection>,
) -> Response {
    let Ok(Json(request)) = body else {
        return bad_request("No JSON data provided");
    };
    let (Some(phone_number), Some(message)) =
        (present(request.phone_number), request.message.filter(|m| !m.is_empty()))
    else {
        return bad_request("phone_number and message are required");
    };

    match run_pipeline(&state, move |pipeline| {
        pipeline.send_text(&phone_number, &message)
    })
    .await
    {
        Ok(outcome) => reply(StatusCode::OK, outcome),
        Err(response) => response,
    }
}

async fn send_video_handler(
    State(state): State<AppState>,
    body: Result<Json<SendFileRequest>, JsonRejection>,
) -> Response {
    let Ok(Json(request)) = body else {
        return bad_request("No JSON data provided");
    };
    let (Some(phone_number), Some(file_name)) =
        (present(request.phone_number), present(request.file_name))
    else {
        return bad_request("phone_number and file_name are required");
    };
    let path = match resolve_media_path(&state.video_dir, &file_name) {
        Ok(path) => path,
        Err(message) => return bad_request(message),
    };
    let caption = request
        .caption
        .unwrap_or_else(|| state.captions.video().to_owned());

    match run_pipeline(&state, move |pipeline| {
        pipeline.send_video(&phone_number, &path, &caption)
    })
    .await
    {
        Ok(outcome) => reply(StatusCode::OK, outcome),
        Err(response) => response,
    }
}

async fn send_image_handler(
    State(state): State<AppState>,
    body: Result<Json<SendFileRequest>, JsonRejection>,
) -> Response {
    let Ok(Json(request)) = body else {
        return bad_request("No JSON data provided");
    };
    let (Some(phone_number), Some(file_name)) =
        (present(request.phone_number), present(request.file_name))
    else {
        return bad_request("phone_number and file_name are required");
    };
    let path = match resolve_media_path(&state.image_dir, &file_name) {
        Ok(path) => path,
        Err(message) => return bad_request(message),
    };
    let caption = request
        .caption
        .unwrap_or_else(|| state.captions.image().to_owned());

    match run_pipeline(&state, move |pipeline| {
        pipeline.send_image(&phone_number, &path, &caption)
    })
    .await
    {
        Ok(outcome) => reply(StatusCode::OK, outcome),
        Err(response) => response,
    }
}
