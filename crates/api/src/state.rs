use std::sync::Arc;

use renderhub_dispatch::DispatchCoordinator;

use crate::config::ServerConfig;

/// Shared application state available to all Axum handlers via `State<AppState>`.
///
/// Cheap to clone; everything inside is behind an `Arc`.
#[derive(Clone)]
pub struct AppState {
    /// Server configuration (upload dir, shared secret, limits).
    pub config: Arc<ServerConfig>,
    /// The process-wide dispatch coordinator.
    pub coordinator: Arc<DispatchCoordinator>,
}
