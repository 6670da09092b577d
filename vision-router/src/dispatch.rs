use std::{path::Path, time::Duration};

use axum::{
    extract::{multipart::MultipartRejection, Multipart},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, error, instrument, warn};
use uuid::Uuid;

use crate::{
    pipeline::LoadedPipeline,
    server::AppState,
    staging::{stage, StagingError},
};

#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Staging(#[from] StagingError),
    #[error("Failed to process image. Please try again.")]
    Inference,
    #[error("Inference timed out")]
    Timeout,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ApiError::Staging(StagingError::TooLarge(_)) => {
                (StatusCode::PAYLOAD_TOO_LARGE, self.to_string())
            }
            ApiError::Staging(StagingError::Multipart(e)) => {
                warn!("Malformed multipart request: {e}");
                (StatusCode::BAD_REQUEST, "Malformed multipart request".to_string())
            }
            ApiError::Staging(StagingError::Io(e)) => {
                error!("Failed to store upload: {e}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Failed to store upload".to_string(),
                )
            }
            ApiError::Staging(_) => (StatusCode::BAD_REQUEST, self.to_string()),
            ApiError::Inference => (StatusCode::INTERNAL_SERVER_ERROR, self.to_string()),
            ApiError::Timeout => (StatusCode::GATEWAY_TIMEOUT, self.to_string()),
        };
        (status, Json(ErrorResponse { error: message })).into_response()
    }
}

/// Handles an upload for one task: stages the file, runs the pipeline on it
/// and removes the staged file before replying. A request that is not a
/// multipart form carries no file.
#[instrument(
    skip_all,
    fields(task = %pipeline.name(), request_id = %Uuid::new_v4().as_simple())
)]
pub async fn process_file(
    state: AppState,
    pipeline: LoadedPipeline,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Json<Value>, ApiError> {
    let multipart = multipart.map_err(|rejection| {
        debug!("Request is not a multipart upload: {rejection}");
        StagingError::MissingFile
    })?;
    let upload = stage(state.policy(), multipart).await?;
    debug!(
        path = %upload.path().display(),
        original_name = upload.original_name(),
        size_bytes = upload.size_bytes(),
        "Staged upload"
    );
    let result = invoke(&pipeline, upload.path(), state.inference_timeout()).await;
    upload.remove().await;
    let output = result?;
    debug!(?output, "{} output", pipeline.name());
    Ok(Json(output))
}

async fn invoke(
    pipeline: &LoadedPipeline,
    input: &Path,
    timeout: Option<Duration>,
) -> Result<Value, ApiError> {
    let outcome = match timeout {
        Some(limit) => tokio::time::timeout(limit, pipeline.invoke(input))
            .await
            .map_err(|_| {
                error!(
                    "Processing {} exceeded {}ms",
                    pipeline.name(),
                    limit.as_millis()
                );
                ApiError::Timeout
            })?,
        None => pipeline.invoke(input).await,
    };
    outcome.map_err(|e| {
        error!(
            model = pipeline.model(),
            kind = %pipeline.kind(),
            "Error processing {}: {e}",
            pipeline.name()
        );
        ApiError::Inference
    })
}

#[cfg(test)]
mod tests {
    use axum::body::to_bytes;

    use super::*;

    async fn body_of(err: ApiError) -> (StatusCode, Value) {
        let response = err.into_response();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn test_error_statuses() {
        let (status, body) = body_of(StagingError::MissingFile.into()).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "No file uploaded");

        let (status, body) = body_of(StagingError::TooLarge(10).into()).await;
        assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(body["error"], "File too large. Maximum size is 10 bytes");

        let (status, _) = body_of(ApiError::Timeout).await;
        assert_eq!(status, StatusCode::GATEWAY_TIMEOUT);
    }

    #[tokio::test]
    async fn test_io_error_is_not_echoed() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "/secret/path denied");
        let (status, body) = body_of(StagingError::Io(io).into()).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["error"], "Failed to store upload");
    }
}
