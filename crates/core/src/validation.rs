//! Identifier and parameter validation.
//!
//! Session ids may be supplied by callers and worker ids come from the
//! deployment's worker table, so both are restricted to a conservative
//! character set before they are used in file names or object keys.

use crate::error::CoreError;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Maximum length of a session identifier.
pub const MAX_SESSION_ID_LEN: usize = 128;

/// Maximum length of a worker identifier.
pub const MAX_WORKER_ID_LEN: usize = 64;

/// Maximum length of the variant parameter (e.g. a gender tag).
pub const MAX_VARIANT_LEN: usize = 64;

/// Variant used when the uploader does not supply one.
pub const DEFAULT_VARIANT: &str = "default";

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Validate a session identifier.
///
/// Rules:
/// - Must not be empty.
/// - Must not exceed `MAX_SESSION_ID_LEN` characters.
/// - Must contain only ASCII alphanumeric, hyphen, or underscore characters.
pub fn validate_session_id(id: &str) -> Result<(), CoreError> {
    validate_identifier("Session id", id, MAX_SESSION_ID_LEN)
}

/// Validate a worker identifier. Same rules as session ids, shorter limit.
pub fn validate_worker_id(id: &str) -> Result<(), CoreError> {
    validate_identifier("Worker id", id, MAX_WORKER_ID_LEN)
}

/// Validate a variant parameter.
///
/// The coordinator treats the value as opaque, but it travels in multipart
/// form fields so it must be a short single-line token.
pub fn validate_variant(variant: &str) -> Result<(), CoreError> {
    if variant.is_empty() {
        return Err(CoreError::Validation("Variant must not be empty".into()));
    }
    if variant.len() > MAX_VARIANT_LEN {
        return Err(CoreError::Validation(format!(
            "Variant must not exceed {MAX_VARIANT_LEN} characters"
        )));
    }
    if variant.chars().any(|c| c.is_control() || c.is_whitespace()) {
        return Err(CoreError::Validation(
            "Variant must not contain whitespace or control characters".into(),
        ));
    }
    Ok(())
}

fn validate_identifier(label: &str, id: &str, max_len: usize) -> Result<(), CoreError> {
    if id.is_empty() {
        return Err(CoreError::Validation(format!("{label} must not be empty")));
    }
    if id.len() > max_len {
        return Err(CoreError::Validation(format!(
            "{label} must not exceed {max_len} characters"
        )));
    }
    if !id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(CoreError::Validation(format!(
            "{label} may only contain alphanumeric, hyphen, or underscore characters"
        )));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
