use crate::auth::Username;
use crate::handlers::{ApiError, publish_history};
use crate::listing::resolve;
use crate::model::{IDEMPOTENCY_HEADER, RecordedDownload};
use crate::state::AppState;
use axum::{
    Extension, Json,
    body::Body,
    extract::{Path, State},
    http::{
        HeaderValue,
        header::{CONTENT_DISPOSITION, CONTENT_LENGTH, CONTENT_TYPE, HeaderMap},
    },
    response::IntoResponse,
};
use std::path::PathBuf;
use tokio::fs::File;
use tokio_util::io::ReaderStream;
use tracing::{error, info};

fn user_file(state: &AppState, user: &Username, path: &str) -> Result<PathBuf, ApiError> {
    let root = state
        .settings
        .user_dir(&user.0)
        .ok_or_else(ApiError::forbidden)?;
    resolve(&root, path).ok_or_else(ApiError::forbidden)
}

pub async fn download_file(
    Path(path): Path<String>,
    State(state): State<AppState>,
    Extension(user): Extension<Username>,
) -> Result<impl IntoResponse, ApiError> {
    let file_path = user_file(&state, &user, &path)?;

    let file = match File::open(&file_path).await {
        Ok(f) => f,
        Err(e) => {
            error!("File download failed: {} (Path: {:?})", e, file_path);
            return Err(ApiError::not_found());
        }
    };

    let metadata = file.metadata().await.map_err(|e| {
        error!("Failed to stat {:?}: {}", file_path, e);
        ApiError::not_found()
    })?;
    if !metadata.is_file() {
        return Err(ApiError::not_found());
    }

    let total_size = metadata.len();
    let filename = file_path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    info!("Serving {} to {} ({} bytes)", filename, user.0, total_size);

    let body = Body::from_stream(ReaderStream::new(file));

    let mut headers = HeaderMap::new();
    let content_type = mime_guess::from_path(&file_path).first_or_octet_stream();
    if let Ok(val) = HeaderValue::from_str(content_type.as_ref()) {
        headers.insert(CONTENT_TYPE, val);
    }
    if let Ok(val) = HeaderValue::from_str(&format!("attachment; filename=\"{}\"", filename)) {
        headers.insert(CONTENT_DISPOSITION, val);
    }
    headers.insert(CONTENT_LENGTH, HeaderValue::from(total_size));

    Ok((headers, body))
}

/// Logs a `pending` download for `path` and returns its id with the
/// refreshed history.
pub async fn request_file(
    Path(path): Path<String>,
    State(state): State<AppState>,
    Extension(user): Extension<Username>,
    headers: HeaderMap,
) -> Result<Json<RecordedDownload>, ApiError> {
    let file_path = user_file(&state, &user, &path)?;
    if !file_path.is_file() {
        return Err(ApiError::not_found());
    }

    let key = headers
        .get(IDEMPOTENCY_HEADER)
        .and_then(|v| v.to_str().ok());
    let ndx = state.history.insert_pending(&path, key)?;
    info!("Download request: {} by user: {} (ndx {})", path, user.0, ndx);

    let downloads = state.history.list()?;
    publish_history(&state, &downloads);
    Ok(Json(RecordedDownload { ndx, downloads }))
}
