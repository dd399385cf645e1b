pub mod auth;
pub mod config;
pub mod download;
pub mod error;
pub mod events;
pub mod handlers;
pub mod history;
pub mod listing;
pub mod model;
pub mod progress;
pub mod registry;
pub mod state;

use axum::{
    Router, middleware,
    routing::{get, post},
};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::Level;

use crate::handlers::{api, files, web};
use crate::state::AppState;

pub use crate::download::{Download, DownloadEvent, DownloadId, DownloadState, Outcome};
pub use crate::registry::DownloadRegistry;

pub fn create_app(state: AppState) -> Router {
    Router::new()
        .route("/", get(web::index))
        .route("/api/files", get(api::list_files))
        .route("/api/history", get(api::history))
        .route("/events", get(api::sse_handler))
        .route("/files/{*path}", get(files::download_file))
        .route("/request-file/{*path}", post(files::request_file))
        .route("/file-status/{ndx}/{status}", post(api::file_status))
        .route("/reset", post(api::reset))
        .layer(middleware::from_fn(auth::username_layer))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(tower_http::trace::DefaultMakeSpan::new().level(Level::INFO))
                .on_response(tower_http::trace::DefaultOnResponse::new().level(Level::INFO)),
        )
        .layer(CorsLayer::permissive())
        .with_state(state)
}
