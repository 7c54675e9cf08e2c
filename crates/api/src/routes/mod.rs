pub mod health;
pub mod sessions;
pub mod upload;

use axum::Router;

use crate::state::AppState;

/// Build the `/api/v1` route tree.
///
/// Route hierarchy:
///
/// ```text
/// /upload_image                                    submit a source image (POST)
/// /upload_result                                   worker completion report (POST)
///
/// /sessions                                        list snapshots
/// /sessions/{id}                                   get snapshot, retire (DELETE)
/// ```
pub fn api_routes() -> Router<AppState> {
    Router::new()
        .merge(upload::router())
        .nest("/sessions", sessions::router())
}
