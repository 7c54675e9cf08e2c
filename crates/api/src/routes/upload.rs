//! Route definitions for batch submission and worker reports.

use axum::routing::post;
use axum::Router;

use crate::handlers::upload;
use crate::state::AppState;

/// Routes mounted at the API root.
///
/// ```text
/// POST   /upload_image    -> upload_image
/// POST   /upload_result   -> upload_result
/// ```
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/upload_image", post(upload::upload_image))
        .route("/upload_result", post(upload::upload_result))
}
