//! Artifact retrieval for reference-mode results.

use axum::{
    body::Body,
    extract::{Path, State},
    http::header,
    response::Response,
};

use crate::error::ApiError;
use crate::state::AppState;

/// Serve a published video by its reference id.
pub async fn download(
    State(state): State<AppState>,
    Path(reference_id): Path<String>,
) -> Result<Response, ApiError> {
    let path = state
        .orchestrator
        .resolve_artifact(&reference_id)
        .ok_or_else(|| ApiError::not_found(format!("no artifact for reference {reference_id}")))?;

    let bytes = tokio::fs::read(&path)
        .await
        .map_err(|err| ApiError::internal(format!("failed to read artifact: {err}")))?;

    Response::builder()
        .header(header::CONTENT_TYPE, "video/mp4")
        .header(
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{reference_id}.mp4\""),
        )
        .body(Body::from(bytes))
        .map_err(|err| ApiError::internal(format!("failed to build response: {err}")))
}
