//! Shared-secret authentication extractor for Axum handlers.

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use renderhub_core::error::CoreError;
use sha2::{Digest, Sha256};

use crate::error::AppError;
use crate::state::AppState;

/// Proof that the request carried the configured shared secret.
///
/// Add it as a handler parameter to protect the route. When no secret is
/// configured every request passes.
///
/// ```ignore
/// async fn my_handler(_auth: RequireSecret) -> AppResult<Json<()>> {
///     Ok(Json(()))
/// }
/// ```
#[derive(Debug, Clone, Copy)]
pub struct RequireSecret;

impl FromRequestParts<AppState> for RequireSecret {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let Some(secret) = state.config.shared_secret.as_deref() else {
            return Ok(RequireSecret);
        };

        let auth_header = parts
            .headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| {
                AppError::Core(CoreError::Unauthorized(
                    "Missing Authorization header".into(),
                ))
            })?;

        let token = auth_header.strip_prefix("Bearer ").ok_or_else(|| {
            AppError::Core(CoreError::Unauthorized(
                "Invalid Authorization format. Expected: Bearer <secret>".into(),
            ))
        })?;

        if !secrets_match(token, secret) {
            return Err(AppError::Core(CoreError::Unauthorized(
                "Invalid shared secret".into(),
            )));
        }

        Ok(RequireSecret)
    }
}

/// Compare fixed-length digests so the comparison does not leak the
/// secret's length.
fn secrets_match(presented: &str, expected: &str) -> bool {
    let presented = Sha256::digest(presented.as_bytes());
    let expected = Sha256::digest(expected.as_bytes());
    presented
        .iter()
        .zip(expected.iter())
        .fold(0u8, |acc, (a, b)| acc | (a ^ b))
        == 0
}
