//! Object key layout for aggregated results.
//!
//! Keys are `{prefix}/{session_id}/{index:03}_{file_name}`. The index prefix
//! keeps results of one batch in unit order and makes keys unique even when
//! workers return identically named files.

use renderhub_core::types::SessionId;

use crate::store::StorageError;

/// Default key prefix for aggregated results.
pub const DEFAULT_KEY_PREFIX: &str = "results";

/// Build the object key for the result of unit `index` of `session_id`.
///
/// Path separators in `file_name` are replaced so a worker-supplied name can
/// never escape the session's key space.
pub fn object_key(
    prefix: &str,
    session_id: &SessionId,
    index: u32,
    file_name: &str,
) -> Result<String, StorageError> {
    let prefix = prefix.trim_matches('/');
    let file_name: String = file_name
        .chars()
        .map(|c| if c == '/' || c == '\\' { '_' } else { c })
        .collect();

    if file_name.is_empty() || file_name == "." || file_name == ".." {
        return Err(StorageError::InvalidKey(file_name));
    }

    let key = if prefix.is_empty() {
        format!("{session_id}/{index:03}_{file_name}")
    } else {
        format!("{prefix}/{session_id}/{index:03}_{file_name}")
    };
    Ok(key)
}
