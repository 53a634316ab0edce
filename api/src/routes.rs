use std::io;
use std::path::Path;
use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path as AxumPath, State};
use axum::http::{header, StatusCode};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use vision_common::frame::FrameCache;

use crate::assets;
use crate::error::ApiError;
use crate::gallery::{self, PhotoFile, PhotoLookupError};
use crate::store::PhotoStore;

// ---------------------------------------------------------------------------
// App state
// ---------------------------------------------------------------------------

pub struct AppState {
    pub frames: Arc<FrameCache>,
    pub store: Arc<dyn PhotoStore>,
}

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageInfo {
    pub filename: String,
    /// Last modification, Unix millis.
    pub timestamp: i64,
    #[serde(rename = "formattedDate")]
    pub formatted_date: String,
}

impl From<&PhotoFile> for ImageInfo {
    fn from(photo: &PhotoFile) -> Self {
        Self {
            filename: photo.filename.clone(),
            timestamp: photo.modified_ms,
            formatted_date: photo.formatted_date(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilenamesRequest {
    pub filenames: Vec<String>,
}

/// Summary message, plus per-file results for batch operations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeletionResponse {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Vec<String>>,
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Run blocking file work off the async workers.
async fn blocking<T, F>(f: F) -> Result<T, ApiError>
where
    F: FnOnce() -> Result<T, ApiError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f).await.map_err(|e| {
        error!(error = %e, "spawn_blocking failed");
        ApiError::Internal(format!("background task failed: {e}"))
    })?
}

fn read_photo(path: &Path) -> Result<Vec<u8>, ApiError> {
    std::fs::read(path).map_err(|e| {
        if e.kind() == io::ErrorKind::NotFound {
            // Removed after it was listed or resolved.
            ApiError::NotFound("Image not found or access denied.".into())
        } else {
            error!(error = %e, path = %path.display(), "failed to read image");
            ApiError::Internal(format!("Error serving image: {e}"))
        }
    })
}

fn file_response(filename: &str, data: Vec<u8>) -> Response {
    let mime = mime_guess::from_path(filename).first_or_octet_stream();
    ([(header::CONTENT_TYPE, mime.essence_str().to_string())], data).into_response()
}

fn parse_filenames(
    payload: Result<Json<FilenamesRequest>, JsonRejection>,
    operation: &str,
) -> Result<Vec<String>, ApiError> {
    match payload {
        Ok(Json(request)) => Ok(request.filenames),
        Err(rejection) => {
            warn!(error = %rejection, operation, "malformed request body");
            Err(ApiError::BadRequest(format!(
                "Invalid request for {operation}: {}",
                rejection.body_text()
            )))
        }
    }
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// GET / — bundled landing page
async fn index() -> Result<Html<Vec<u8>>, ApiError> {
    match assets::get("index.html") {
        Some(asset) => Ok(Html(asset.data)),
        None => {
            error!("index.html missing from bundled assets");
            Err(ApiError::Internal("Could not serve the page.".into()))
        }
    }
}

/// GET /static/*path — bundled scripts and styles
async fn static_asset(AxumPath(path): AxumPath<String>) -> Result<Response, ApiError> {
    let asset = assets::get(&path).ok_or_else(|| ApiError::NotFound("Not found.".into()))?;
    Ok(([(header::CONTENT_TYPE, asset.content_type)], asset.data).into_response())
}

/// GET /image — newest live-view frame
async fn live_image(State(state): State<Arc<AppState>>) -> Result<Response, ApiError> {
    let frame = state
        .frames
        .get()
        .ok_or_else(|| ApiError::NotFound("No image cached.".into()))?;
    Ok((
        [
            (header::CONTENT_TYPE, "image/jpeg"),
            (header::CACHE_CONTROL, "no-store"),
        ],
        frame,
    )
        .into_response())
}

/// GET /capture — ask the photo store for a new still
async fn capture(State(state): State<Arc<AppState>>) -> Result<Response, ApiError> {
    info!("capture requested");
    if !state.store.is_ready() {
        return Err(ApiError::CameraNotReady("Camera not ready.".into()));
    }
    state.store.request_capture();
    Ok((
        StatusCode::ACCEPTED,
        Json(DeletionResponse {
            message: "Capture request accepted. Photo will be saved.".into(),
            details: None,
        }),
    )
        .into_response())
}

/// GET /latest_image — most recently modified photo
async fn latest_image(State(state): State<Arc<AppState>>) -> Result<Response, ApiError> {
    let dir = state.store.output_directory().to_path_buf();
    let (filename, data) = blocking(move || {
        let latest = gallery::latest_photo(&dir)
            .map_err(|e| {
                error!(error = %e, "failed to list images");
                ApiError::Internal(format!("Error serving image: {e}"))
            })?
            .ok_or_else(|| ApiError::NotFound("No images found.".into()))?;
        let path = gallery::resolve_photo(&dir, &latest.filename)
            .map_err(|_| ApiError::NotFound("Image not found or access denied.".into()))?;
        let data = read_photo(&path)?;
        Ok((latest.filename, data))
    })
    .await?;
    Ok(file_response(&filename, data))
}

/// GET /images_list — all photos, newest first
async fn images_list(State(state): State<Arc<AppState>>) -> Result<Json<Vec<ImageInfo>>, ApiError> {
    let dir = state.store.output_directory().to_path_buf();
    let photos = blocking(move || {
        gallery::list_photos(&dir)
            .map_err(|e| {
                error!(error = %e, "failed to list images");
                ApiError::Internal(format!("Error serving images list: {e}"))
            })?
            .ok_or_else(|| ApiError::NotFound("Image directory not found.".into()))
    })
    .await?;
    Ok(Json(photos.iter().map(ImageInfo::from).collect()))
}

/// GET /image_file/ — no filename given
async fn missing_filename() -> ApiError {
    ApiError::BadRequest("Filename parameter is missing.".into())
}

/// GET /image_file/:filename — one named photo
async fn image_file(
    State(state): State<Arc<AppState>>,
    AxumPath(filename): AxumPath<String>,
) -> Result<Response, ApiError> {
    let dir = state.store.output_directory().to_path_buf();
    let name = filename.clone();
    let data = blocking(move || {
        let path = gallery::resolve_photo(&dir, &name).map_err(|e| match e {
            PhotoLookupError::InvalidName => ApiError::BadRequest("Invalid filename.".into()),
            PhotoLookupError::NotFound => {
                warn!(filename = name, dir = %dir.display(), "image file not found or access denied");
                ApiError::NotFound("Image not found or access denied.".into())
            }
        })?;
        read_photo(&path)
    })
    .await?;
    Ok(file_response(&filename, data))
}

/// POST /download_selected_zip
/// Body: { "filenames": ["a.jpg", "b.jpg"] }
async fn download_selected_zip(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<FilenamesRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let filenames = parse_filenames(payload, "ZIP download")?;
    if filenames.is_empty() {
        return Err(ApiError::BadRequest("No filenames provided for download.".into()));
    }

    let dir = state.store.output_directory().to_path_buf();
    let bundle = blocking(move || {
        gallery::zip_photos(&dir, &filenames).map_err(|e| {
            error!(error = %e, "failed to build zip archive");
            ApiError::Internal(format!("Error creating ZIP file: {e}"))
        })
    })
    .await?;

    if bundle.entries.is_empty() {
        warn!("no valid files found to create a zip");
        return Err(ApiError::NotFound(
            "No valid files found to create a ZIP archive.".into(),
        ));
    }
    info!(files = bundle.entries.len(), bytes = bundle.bytes.len(), "zip archive sent");
    Ok((
        [
            (header::CONTENT_TYPE, "application/zip"),
            (
                header::CONTENT_DISPOSITION,
                "attachment; filename=\"selected_images.zip\"",
            ),
        ],
        bundle.bytes,
    )
        .into_response())
}

/// POST /delete_selected_images
/// Body: { "filenames": ["a.jpg", "b.jpg"] }
async fn delete_selected_images(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<FilenamesRequest>, JsonRejection>,
) -> Result<Json<DeletionResponse>, ApiError> {
    let filenames = parse_filenames(payload, "batch delete")?;
    if filenames.is_empty() {
        return Err(ApiError::BadRequest("No filenames provided for deletion.".into()));
    }

    let dir = state.store.output_directory().to_path_buf();
    let outcomes = blocking(move || Ok(gallery::delete_photos(&dir, &filenames))).await?;

    let message = gallery::deletion_summary(&outcomes).to_string();
    info!(requested = outcomes.len(), summary = %message, "batch deletion finished");
    Ok(Json(DeletionResponse {
        message,
        details: Some(outcomes.iter().map(ToString::to_string).collect()),
    }))
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/static/*path", get(static_asset))
        .route("/image", get(live_image))
        .route("/capture", get(capture))
        .route("/latest_image", get(latest_image))
        .route("/images_list", get(images_list))
        .route("/image_file/", get(missing_filename))
        .route("/image_file/:filename", get(image_file))
        .route("/download_selected_zip", post(download_selected_zip))
        .route("/delete_selected_images", post(delete_selected_images))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
