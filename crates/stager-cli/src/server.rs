use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use axum::extract::{DefaultBodyLimit, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::Deserialize;
use serde_json::{json, Value};
use stager_engine::pipeline::{RunContext, StageOutput};
use stager_engine::{StageError, StagingPipeline, StagingRequest};
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

#[derive(Clone)]
struct AppState {
    pipeline: Arc<StagingPipeline>,
}

/// An image supplied inline or by the name of an earlier output.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
enum ImageRef {
    Base64(String),
    Output(String),
}

#[derive(Debug, Deserialize)]
struct EmptyRoomBody {
    room: ImageRef,
}

#[derive(Debug, Deserialize)]
struct FurnishBody {
    empty_room: ImageRef,
    style: ImageRef,
    variants: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct DetailsBody {
    furnished: ImageRef,
    count: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct MoodboardBody {
    style: ImageRef,
    furnished: Option<ImageRef>,
}

#[derive(Debug, Deserialize)]
struct UpscaleBody {
    images: Vec<ImageRef>,
}

#[derive(Debug, Deserialize)]
struct StageBody {
    room: ImageRef,
    style: ImageRef,
    variants: Option<usize>,
    details: Option<usize>,
    moodboard: Option<bool>,
    upscale: Option<bool>,
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    fn internal(err: &anyhow::Error) -> Self {
        error!(error = %format!("{err:#}"), "request failed");
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: "internal error".to_string(),
        }
    }
}

impl From<StageError> for ApiError {
    fn from(err: StageError) -> Self {
        let status = match &err {
            StageError::DeadlineExceeded { .. } => StatusCode::GATEWAY_TIMEOUT,
            StageError::AllFailed { .. } => StatusCode::BAD_GATEWAY,
            StageError::Input { .. } => StatusCode::BAD_REQUEST,
        };
        Self {
            status,
            message: err.to_string(),
        }
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        match err.downcast::<StageError>() {
            Ok(stage_err) => Self::from(stage_err),
            Err(err) => Self::internal(&err),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

pub(crate) fn router(pipeline: Arc<StagingPipeline>) -> Router {
    let config = pipeline.config();
    let outputs = ServeDir::new(config.output_dir.clone());
    let mount = static_mount(&config.public_base_url);
    let body_limit = DefaultBodyLimit::max(config.max_upload_bytes);
    let state = AppState { pipeline };

    Router::new()
        .route("/health", get(health))
        .route("/api/keys", get(keys))
        .route("/api/empty-room", post(empty_room))
        .route("/api/furnish", post(furnish))
        .route("/api/details", post(details))
        .route("/api/moodboard", post(moodboard))
        .route("/api/upscale", post(upscale))
        .route("/api/stage", post(stage_all))
        .nest_service(&mount, outputs)
        .layer(body_limit)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub(crate) async fn serve(pipeline: Arc<StagingPipeline>, addr: SocketAddr) -> Result<()> {
    std::fs::create_dir_all(&pipeline.config().output_dir)?;
    let app = router(pipeline);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %addr, "listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    info!("server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "ctrl-c handler failed");
    }
}

/// Path prefix the output directory is served under. Absolute public URLs
/// (a CDN in front of the directory) fall back to `/outputs`.
fn static_mount(public_base_url: &str) -> String {
    let trimmed = public_base_url.trim().trim_end_matches('/');
    if trimmed.starts_with('/') && trimmed.len() > 1 {
        trimmed.to_string()
    } else {
        "/outputs".to_string()
    }
}

async fn health() -> Response {
    Json(json!({ "status": "ok" })).into_response()
}

async fn keys(State(state): State<AppState>) -> Response {
    let pool = state.pipeline.dispatcher().pool().clone();
    Json(json!({
        "prefix": pool.prefix(),
        "status": pool.status(),
        "model": state.pipeline.dispatcher().model_name(),
        "upscaler": state.pipeline.has_upscaler(),
    }))
    .into_response()
}

async fn empty_room(State(state): State<AppState>, Json(body): Json<EmptyRoomBody>) -> Response {
    run_stage(state, move |pipeline, run| {
        let room = resolve_image(pipeline, &body.room)?;
        Ok(pipeline.empty_room(run, &room)?)
    })
    .await
}

async fn furnish(State(state): State<AppState>, Json(body): Json<FurnishBody>) -> Response {
    run_stage(state, move |pipeline, run| {
        let empty_room = resolve_image(pipeline, &body.empty_room)?;
        let style = resolve_image(pipeline, &body.style)?;
        Ok(pipeline.furnish(run, &empty_room, &style, body.variants.unwrap_or(1))?)
    })
    .await
}

async fn details(State(state): State<AppState>, Json(body): Json<DetailsBody>) -> Response {
    run_stage(state, move |pipeline, run| {
        let furnished = resolve_image(pipeline, &body.furnished)?;
        Ok(pipeline.detail_shots(run, &furnished, body.count.unwrap_or(4))?)
    })
    .await
}

async fn moodboard(State(state): State<AppState>, Json(body): Json<MoodboardBody>) -> Response {
    run_stage(state, move |pipeline, run| {
        let style = resolve_image(pipeline, &body.style)?;
        let furnished = body
            .furnished
            .as_ref()
            .map(|image| resolve_image(pipeline, image))
            .transpose()?;
        Ok(pipeline.moodboard(run, &style, furnished.as_deref())?)
    })
    .await
}

async fn upscale(State(state): State<AppState>, Json(body): Json<UpscaleBody>) -> Response {
    run_stage(state, move |pipeline, run| {
        let images = body
            .images
            .iter()
            .map(|image| resolve_image(pipeline, image))
            .collect::<Result<Vec<PathBuf>, ApiError>>()?;
        Ok(pipeline.upscale(run, &images)?)
    })
    .await
}

async fn stage_all(State(state): State<AppState>, Json(body): Json<StageBody>) -> Response {
    let pipeline = state.pipeline.clone();
    let joined = tokio::task::spawn_blocking(move || -> Result<Value, ApiError> {
        let mut request = StagingRequest::new(
            resolve_image(&pipeline, &body.room)?,
            resolve_image(&pipeline, &body.style)?,
        );
        request.variants = body.variants.unwrap_or(1);
        request.details = body.details.unwrap_or(0);
        request.moodboard = body.moodboard.unwrap_or(true);
        request.upscale = body.upscale.unwrap_or(false);

        let staged = pipeline.run_all(&request)?;
        let urls = |output: &Option<StageOutput>| {
            output.as_ref().map(StageOutput::urls).unwrap_or_default()
        };
        Ok(json!({
            "run_id": staged.run_id,
            "urls": staged.urls(),
            "empty_room": staged.empty_room.urls(),
            "furnished": staged.furnished.urls(),
            "details": urls(&staged.details),
            "moodboard": urls(&staged.moodboard),
            "upscaled": urls(&staged.upscaled),
            "notes": staged.notes,
        }))
    })
    .await;
    respond(joined)
}

/// Runs one stage on the blocking pool inside a fresh run.
async fn run_stage<F>(state: AppState, job: F) -> Response
where
    F: FnOnce(&StagingPipeline, &RunContext) -> Result<StageOutput, ApiError> + Send + 'static,
{
    let pipeline = state.pipeline.clone();
    let joined = tokio::task::spawn_blocking(move || -> Result<Value, ApiError> {
        let run = pipeline.start_run()?;
        let output = job(&pipeline, &run)?;
        Ok(json!({
            "run_id": run.run_id(),
            "stage": output.stage,
            "urls": output.urls(),
            "artifacts": output.artifacts,
            "failed_items": output.failures.len(),
            "warnings": output.warnings,
        }))
    })
    .await;
    respond(joined)
}

fn respond(joined: Result<Result<Value, ApiError>, tokio::task::JoinError>) -> Response {
    match joined {
        Ok(Ok(body)) => Json(body).into_response(),
        Ok(Err(err)) => err.into_response(),
        Err(err) => ApiError::internal(&anyhow::Error::new(err)).into_response(),
    }
}

fn resolve_image(pipeline: &StagingPipeline, image: &ImageRef) -> Result<PathBuf, ApiError> {
    match image {
        ImageRef::Output(name) => pipeline
            .resolve_output(name)
            .ok_or_else(|| ApiError::bad_request(format!("unknown output file: {name}"))),
        ImageRef::Base64(data) => {
            // Accept data URLs as produced by browsers.
            let payload = data.split_once(',').map_or(data.as_str(), |(_, rest)| rest);
            let bytes = BASE64
                .decode(payload.trim().as_bytes())
                .map_err(|err| ApiError::bad_request(format!("invalid base64 image: {err}")))?;
            pipeline
                .store_upload(&bytes)
                .map_err(|err| ApiError::bad_request(format!("{err:#}")))
        }
    }
}
