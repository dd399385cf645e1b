use crate::auth::Username;
use crate::error::HistoryError;
use crate::handlers::{ApiError, publish_history};
use crate::history::parse_id;
use crate::listing;
use crate::model::{DownloadStatus, FileEntry, HistoryRecord};
use crate::state::AppState;
use axum::{
    Extension, Json,
    extract::{Path, State},
    http::StatusCode,
    response::sse::{Event, Sse},
};
use futures::stream::{Stream, StreamExt};
use tracing::{info, warn};

pub async fn list_files(
    State(state): State<AppState>,
    Extension(user): Extension<Username>,
) -> Result<Json<Vec<FileEntry>>, ApiError> {
    let dir = state
        .settings
        .user_dir(&user.0)
        .ok_or_else(ApiError::forbidden)?;
    let files = listing::list_files(&dir, &state.settings.allowed_extensions).map_err(|e| {
        warn!("Listing {:?} failed: {}", dir, e);
        ApiError::new(StatusCode::NOT_FOUND, e.to_string())
    })?;
    Ok(Json(files))
}

pub async fn history(State(state): State<AppState>) -> Result<Json<Vec<HistoryRecord>>, ApiError> {
    Ok(Json(state.history.list()?))
}

pub async fn file_status(
    Path((ndx, status)): Path<(String, String)>,
    State(state): State<AppState>,
) -> Result<Json<Vec<HistoryRecord>>, ApiError> {
    let id = parse_id(&ndx)?;
    // Rows start out pending; a status update may only settle them.
    let status = match status.parse::<DownloadStatus>()? {
        DownloadStatus::Pending => return Err(HistoryError::InvalidStatus(status).into()),
        settled => settled,
    };

    if state.history.set_status(id, status)? {
        info!("Download {} marked {}", id, status);
    } else {
        warn!("Status {} for unknown download {}", status, id);
    }

    let downloads = state.history.list()?;
    publish_history(&state, &downloads);
    Ok(Json(downloads))
}

pub async fn reset(State(state): State<AppState>) -> Result<Json<Vec<HistoryRecord>>, ApiError> {
    info!("Clearing download history");
    state.history.clear()?;
    let downloads = state.history.list()?;
    publish_history(&state, &downloads);
    Ok(Json(downloads))
}

pub async fn sse_handler(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, axum::Error>>> {
    let rx = state.tx.subscribe();
    let stream = tokio_stream::wrappers::BroadcastStream::new(rx).map(|msg| match msg {
        Ok(msg) => Ok(Event::default().data(msg)),
        Err(_) => Ok(Event::default().comment("keepalive")),
    });

    Sse::new(stream).keep_alive(axum::response::sse::KeepAlive::default())
}
