//! HTTP endpoint handlers for the relay API.

#![allow(clippy::missing_errors_doc)]

use std::io;

use axum::{
    body::Body,
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::Response,
    Json,
};
use axum_extra::extract::multipart::MultipartError;
use axum_extra::extract::Multipart;
use futures::TryStreamExt;
use serde::{Deserialize, Serialize};
use tokio_util::io::StreamReader;

use crate::device::DeviceInfo;
use crate::error::Error;
use crate::ingest::IngestRequest;
use crate::transfer::ControlState;

use super::error::{ApiError, ApiResult};
use super::state::SharedState;

// ============================================================================
// Response types
// ============================================================================

/// Relay address response.
#[derive(Debug, Serialize)]
pub struct InfoResponse {
    ok: bool,
    /// Base URL devices should use
    host: String,
}

/// Connected devices response.
#[derive(Debug, Serialize)]
pub struct DevicesResponse {
    ok: bool,
    /// Device snapshot
    devices: Vec<DeviceInfo>,
}

/// Liveness response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    ok: bool,
    /// Connected device count
    devices: usize,
    /// Pending or streaming transfer count
    transfers: usize,
}

/// Upload accepted response.
#[derive(Debug, Serialize)]
pub struct SendResponse {
    ok: bool,
    /// Identifier of the buffered transfer
    file_id: String,
}

/// Control verb response.
#[derive(Debug, Serialize)]
pub struct ControlResponse {
    ok: bool,
    /// Flags after the verb was applied
    state: ControlState,
}

/// Device ids given on the upload URL instead of the form.
#[derive(Debug, Default, Deserialize)]
pub struct UploadParams {
    /// Receiving device
    pub target_device_id: Option<String>,
    /// Uploading device
    pub sender_device_id: Option<String>,
    /// Sender display name
    pub sender_name: Option<String>,
}

// ============================================================================
// Info handlers
// ============================================================================

/// GET /api/info - Base URL of the relay.
pub async fn info(State(state): State<SharedState>) -> Json<InfoResponse> {
    Json(InfoResponse {
        ok: true,
        host: state.host_url.clone(),
    })
}

/// GET /api/devices - Connected devices.
pub async fn devices(State(state): State<SharedState>) -> Json<DevicesResponse> {
    Json(DevicesResponse {
        ok: true,
        devices: state.devices.list(),
    })
}

/// GET /api/health - Liveness and registry sizes.
pub async fn health(State(state): State<SharedState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        ok: true,
        devices: state.devices.len(),
        transfers: state.transfers.len(),
    })
}

// ============================================================================
// Transfer handlers
// ============================================================================

/// POST /api/send_stream - Upload a file for a connected device.
///
/// Fields may arrive in any order. A `file` part that follows both device
/// ids is streamed straight into the spool with upload progress; one that
/// precedes them is buffered and registered once the remaining fields have
/// been read.
pub async fn send_stream(
    State(state): State<SharedState>,
    Query(params): Query<UploadParams>,
    mut multipart: Multipart,
) -> ApiResult<Json<SendResponse>> {
    let mut request = IngestRequest {
        sender_id: params.sender_device_id.unwrap_or_default(),
        target_id: params.target_device_id.unwrap_or_default(),
        sender_name: params.sender_name,
        filename: None,
    };
    let mut buffered = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::bad_request(format!("Failed to read multipart field: {e}")))?
    {
        let name = field.name().unwrap_or_default().to_string();

        if name == "file" {
            if buffered.is_some() {
                return Err(ApiError::bad_request("Only one file per upload"));
            }

            request.filename = field.file_name().map(String::from);
            let reader = StreamReader::new(field.map_err(io::Error::other));
            tokio::pin!(reader);

            if request.target_id.is_empty() || request.sender_id.is_empty() {
                let upload = state.ingest.buffer(reader).await.map_err(malformed_upload)?;
                buffered = Some(upload);
                continue;
            }

            let transfer = state
                .ingest
                .ingest(request, reader)
                .await
                .map_err(malformed_upload)?;

            return Ok(Json(SendResponse {
                ok: true,
                file_id: transfer.file_id().to_string(),
            }));
        }

        let value = field
            .text()
            .await
            .map_err(|e| ApiError::bad_request(format!("Failed to read field '{name}': {e}")))?;

        match name.as_str() {
            "target_device_id" => request.target_id = value,
            "sender_device_id" => request.sender_id = value,
            "sender_name" => request.sender_name = Some(value),
            other => tracing::debug!(field = other, "ignoring unknown upload field"),
        }
    }

    let upload = buffered.ok_or_else(|| Error::BadRequest("No file".into()))?;
    let transfer = state.ingest.commit(request, upload)?;

    Ok(Json(SendResponse {
        ok: true,
        file_id: transfer.file_id().to_string(),
    }))
}

/// A multipart body that breaks off inside the file part is a client error,
/// not a relay I/O failure.
fn malformed_upload(err: Error) -> Error {
    match err {
        Error::Io(e) if e.get_ref().is_some_and(|inner| inner.is::<MultipartError>()) => {
            tracing::debug!(error = %e, "upload body ended mid-file");
            Error::BadRequest("Malformed upload".into())
        }
        other => other,
    }
}

/// POST /api/transfer/{file_id}/{action} - Pause, resume or cancel.
pub async fn control(
    State(state): State<SharedState>,
    Path((file_id, action)): Path<(String, String)>,
) -> ApiResult<Json<ControlResponse>> {
    let flags = state.transfers.control(&file_id, &action)?;
    Ok(Json(ControlResponse {
        ok: true,
        state: flags,
    }))
}

/// GET /stream/{file_id}/{token} - Download a buffered file.
pub async fn download(
    State(state): State<SharedState>,
    Path((file_id, token)): Path<(String, String)>,
) -> ApiResult<Response> {
    let stream = state.downloads.open(&file_id, &token).await?;

    let disposition = format!("attachment; filename=\"{}\"", stream.filename());
    let length = stream.total_size();
    let body = Body::from_stream(stream.into_stream());

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/octet-stream")
        .header(header::CONTENT_DISPOSITION, disposition)
        .header(header::CONTENT_LENGTH, length)
        .body(body)
        .map_err(|e| ApiError::internal(format!("Failed to build response: {e}")))
}
