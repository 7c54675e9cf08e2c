//! Handlers for the `/sessions` resource.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use renderhub_core::types::SessionId;
use renderhub_dispatch::SessionSnapshot;

use crate::error::AppResult;
use crate::middleware::auth::RequireSecret;
use crate::response::DataResponse;
use crate::state::AppState;

/// GET /api/v1/sessions
///
/// Snapshots of every registered session, oldest first.
pub async fn list(
    _auth: RequireSecret,
    State(state): State<AppState>,
) -> AppResult<Json<DataResponse<Vec<SessionSnapshot>>>> {
    let snapshots = state.coordinator.snapshots().await;
    Ok(Json(DataResponse { data: snapshots }))
}

/// GET /api/v1/sessions/{id}
pub async fn get_by_id(
    _auth: RequireSecret,
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> AppResult<Json<DataResponse<SessionSnapshot>>> {
    let id = SessionId::parse(id)?;
    let snapshot = state.coordinator.snapshot(&id).await?;
    Ok(Json(DataResponse { data: snapshot }))
}

/// DELETE /api/v1/sessions/{id}
///
/// Retires the session; later reports for it get `UNKNOWN_SESSION`.
pub async fn retire(
    _auth: RequireSecret,
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> AppResult<StatusCode> {
    let id = SessionId::parse(id)?;
    state.coordinator.retire(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}
