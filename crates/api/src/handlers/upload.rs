//! Handlers for batch submission and worker completion reports.
//!
//! Both endpoints take multipart forms. Uploaded bytes are buffered (bounded
//! by the body limit) and written under `UPLOAD_DIR` only once the request
//! has been validated.

use std::io::Cursor;
use std::path::Path;

use axum::extract::{Multipart, State};
use axum::http::StatusCode;
use axum::Json;
use image::{ImageFormat, ImageReader};
use renderhub_core::error::CoreError;
use renderhub_core::types::{ArtifactRef, SessionId};
use renderhub_core::validation::DEFAULT_VARIANT;
use renderhub_core::worker_registry::WorkerClaim;
use renderhub_dispatch::CompletionReceipt;
use serde::Serialize;

use crate::error::{AppError, AppResult};
use crate::middleware::auth::RequireSecret;
use crate::middleware::peer::PeerAddr;
use crate::response::DataResponse;
use crate::state::AppState;

/// Source images the workers can consume.
const SUPPORTED_IMAGE_FORMATS: &[ImageFormat] =
    &[ImageFormat::Png, ImageFormat::Jpeg, ImageFormat::WebP];

/// Result extensions kept as uploaded; anything else is stored as `.mp4`.
const SUPPORTED_RESULT_EXTENSIONS: &[&str] =
    &["mp4", "webm", "mov", "gif", "png", "jpg", "jpeg", "webp"];

const DEFAULT_RESULT_EXTENSION: &str = "mp4";

/// Returned by `POST /upload_image`.
#[derive(Debug, Serialize)]
pub struct BatchAccepted {
    pub session_id: SessionId,
    pub unit_count: u32,
    pub workers: usize,
}

/// A `file` part, fully buffered.
struct UploadedFile {
    file_name: Option<String>,
    data: Vec<u8>,
}

/// POST /api/v1/upload_image
///
/// Multipart fields: `file` (required), `session_id` (optional),
/// `gender` or `variant` (optional, default `default`). The image is saved
/// and a batch for it is dispatched in the background.
pub async fn upload_image(
    _auth: RequireSecret,
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> AppResult<(StatusCode, Json<DataResponse<BatchAccepted>>)> {
    let mut file: Option<UploadedFile> = None;
    let mut session_id: Option<String> = None;
    let mut variant: Option<String> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| AppError::BadRequest(e.to_string()))?
    {
        let name = field.name().unwrap_or("").to_string();
        match name.as_str() {
            "file" => {
                let file_name = field.file_name().map(str::to_string);
                let data = field
                    .bytes()
                    .await
                    .map_err(|e| AppError::BadRequest(e.to_string()))?;
                file = Some(UploadedFile {
                    file_name,
                    data: data.to_vec(),
                });
            }
            "session_id" => session_id = Some(read_text(field).await?),
            "gender" | "variant" => variant = Some(read_text(field).await?),
            _ => {} // ignore unknown fields
        }
    }

    let file = file.ok_or_else(|| AppError::BadRequest("Missing required 'file' field".into()))?;
    let session_id = session_id
        .filter(|s| !s.trim().is_empty())
        .map(|s| SessionId::parse(s.trim()))
        .transpose()?;
    let variant = variant
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| DEFAULT_VARIANT.to_string());

    let (format, width, height) = inspect_image(&file.data)?;
    let file_name = sanitize_file_name(file.file_name.as_deref(), "upload");

    let path = state
        .config
        .upload_dir
        .join(format!("{}_{file_name}", uuid::Uuid::new_v4().simple()));
    write_upload(&path, &file.data).await?;

    tracing::info!(
        path = %path.display(),
        format = ?format,
        width,
        height,
        bytes = file.data.len(),
        "Source image saved",
    );

    let session = match state
        .coordinator
        .submit_batch(session_id, ArtifactRef::new(&path, file_name), variant)
        .await
    {
        Ok(session) => session,
        Err(e) => {
            discard(&path).await;
            return Err(e.into());
        }
    };

    Ok((
        StatusCode::ACCEPTED,
        Json(DataResponse {
            data: BatchAccepted {
                session_id: session.id.clone(),
                unit_count: session.unit_count,
                workers: state.coordinator.workers().len(),
            },
        }),
    ))
}

/// POST /api/v1/upload_result
///
/// Multipart fields: `session_id` (required), `worker_id` (optional),
/// `index` (optional), `file` (required). The report is admitted before
/// anything is written, so a report for an unknown session or worker
/// leaves no trace. The response carries the worker's next assignment.
pub async fn upload_result(
    _auth: RequireSecret,
    State(state): State<AppState>,
    PeerAddr(origin): PeerAddr,
    mut multipart: Multipart,
) -> AppResult<(StatusCode, Json<DataResponse<CompletionReceipt>>)> {
    let mut file: Option<UploadedFile> = None;
    let mut session_id: Option<String> = None;
    let mut worker_id: Option<String> = None;
    let mut index: Option<String> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| AppError::BadRequest(e.to_string()))?
    {
        let name = field.name().unwrap_or("").to_string();
        match name.as_str() {
            "file" => {
                let file_name = field.file_name().map(str::to_string);
                let data = field
                    .bytes()
                    .await
                    .map_err(|e| AppError::BadRequest(e.to_string()))?;
                file = Some(UploadedFile {
                    file_name,
                    data: data.to_vec(),
                });
            }
            "session_id" => session_id = Some(read_text(field).await?),
            "worker_id" => worker_id = Some(read_text(field).await?),
            "index" => index = Some(read_text(field).await?),
            _ => {} // ignore unknown fields
        }
    }

    let session_id = session_id
        .ok_or_else(|| AppError::BadRequest("Missing required 'session_id' field".into()))?;
    let session_id = SessionId::parse(session_id.trim())?;
    let file = file.ok_or_else(|| AppError::BadRequest("Missing required 'file' field".into()))?;
    let index = parse_index(index.as_deref())?;

    let claim = WorkerClaim {
        worker_id: worker_id
            .map(|w| w.trim().to_string())
            .filter(|w| !w.is_empty()),
        origin,
    };
    let ticket = state.coordinator.admit_report(&session_id, &claim).await?;

    let ext = result_extension(file.file_name.as_deref());
    let stored_name = format!("result_{}.{ext}", uuid::Uuid::new_v4().simple());
    let path = state.config.upload_dir.join(&stored_name);
    write_upload(&path, &file.data).await?;

    let file_name = file
        .file_name
        .as_deref()
        .map(|name| sanitize_file_name(Some(name), &stored_name))
        .unwrap_or(stored_name);

    let receipt = match state
        .coordinator
        .report_completion(ticket, index, ArtifactRef::new(&path, file_name))
        .await
    {
        Ok(receipt) => receipt,
        Err(e) => {
            discard(&path).await;
            return Err(e.into());
        }
    };

    if !receipt.artifact_kept() {
        discard(&path).await;
    }

    tracing::info!(
        session_id = %receipt.session_id,
        worker_id = %receipt.worker_id,
        outcome = ?receipt.outcome,
        next = ?receipt.next,
        "Result report handled",
    );

    Ok((StatusCode::ACCEPTED, Json(DataResponse { data: receipt })))
}

async fn read_text(field: axum::extract::multipart::Field<'_>) -> AppResult<String> {
    field
        .text()
        .await
        .map_err(|e| AppError::BadRequest(e.to_string()))
}

/// Decode the image header and return its format and dimensions.
fn inspect_image(data: &[u8]) -> AppResult<(ImageFormat, u32, u32)> {
    let reader = ImageReader::new(Cursor::new(data))
        .with_guessed_format()
        .map_err(|e| AppError::BadRequest(format!("Unreadable image: {e}")))?;

    let format = reader
        .format()
        .filter(|f| SUPPORTED_IMAGE_FORMATS.contains(f))
        .ok_or_else(|| {
            AppError::Core(CoreError::Validation(
                "Unsupported image format. Supported: PNG, JPEG, WebP".into(),
            ))
        })?;

    let (width, height) = reader
        .into_dimensions()
        .map_err(|e| AppError::Core(CoreError::Validation(format!("Invalid image: {e}"))))?;

    Ok((format, width, height))
}

/// An `index` field, when present and non-blank, must be a unit index.
fn parse_index(raw: Option<&str>) -> AppResult<Option<u32>> {
    match raw.map(str::trim).filter(|s| !s.is_empty()) {
        None => Ok(None),
        Some(s) => s.parse::<u32>().map(Some).map_err(|_| {
            AppError::Core(CoreError::Validation(format!(
                "Invalid index '{s}': expected a non-negative integer"
            )))
        }),
    }
}

/// Keep only the final path component of a client-supplied name.
fn sanitize_file_name(name: Option<&str>, fallback: &str) -> String {
    name.and_then(|n| Path::new(n.trim()).file_name())
        .and_then(|n| n.to_str())
        .filter(|n| !n.is_empty())
        .unwrap_or(fallback)
        .to_string()
}

fn result_extension(file_name: Option<&str>) -> String {
    file_name
        .and_then(|n| Path::new(n).extension())
        .and_then(|e| e.to_str())
        .map(str::to_lowercase)
        .filter(|e| SUPPORTED_RESULT_EXTENSIONS.contains(&e.as_str()))
        .unwrap_or_else(|| DEFAULT_RESULT_EXTENSION.to_string())
}

async fn write_upload(path: &Path, data: &[u8]) -> AppResult<()> {
    if let Some(dir) = path.parent() {
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|e| AppError::InternalError(e.to_string()))?;
    }
    tokio::fs::write(path, data)
        .await
        .map_err(|e| AppError::InternalError(e.to_string()))
}

async fn discard(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        tracing::warn!(path = %path.display(), error = %e, "Failed to remove discarded upload");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_names_lose_directories() {
        assert_eq!(sanitize_file_name(Some("../../etc/passwd"), "x"), "passwd");
        assert_eq!(sanitize_file_name(Some("face.png"), "x"), "face.png");
        assert_eq!(sanitize_file_name(Some(""), "upload"), "upload");
        assert_eq!(sanitize_file_name(Some(".."), "upload"), "upload");
        assert_eq!(sanitize_file_name(None, "upload"), "upload");
    }

    #[test]
    fn result_extension_defaults_to_mp4() {
        assert_eq!(result_extension(Some("clip.WEBM")), "webm");
        assert_eq!(result_extension(Some("clip.exe")), "mp4");
        assert_eq!(result_extension(Some("clip")), "mp4");
        assert_eq!(result_extension(None), "mp4");
    }

    #[test]
    fn index_field_parsing() {
        assert_eq!(parse_index(None).unwrap(), None);
        assert_eq!(parse_index(Some(" ")).unwrap(), None);
        assert_eq!(parse_index(Some("3")).unwrap(), Some(3));
        assert!(parse_index(Some("-1")).is_err());
        assert!(parse_index(Some("three")).is_err());
    }

    #[test]
    fn png_header_accepted() {
        let mut png = Cursor::new(Vec::new());
        image::DynamicImage::new_rgb8(3, 2)
            .write_to(&mut png, ImageFormat::Png)
            .unwrap();

        let (format, width, height) = inspect_image(png.get_ref()).unwrap();
        assert_eq!(format, ImageFormat::Png);
        assert_eq!((width, height), (3, 2));
    }

    #[test]
    fn non_images_rejected() {
        assert!(inspect_image(b"definitely not an image").is_err());
    }
}
