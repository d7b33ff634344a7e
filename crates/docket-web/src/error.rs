use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use docket_core::{Error, ExtractionError};
use serde::Serialize;

#[derive(Debug, Serialize)]
struct ErrorBody {
    message: String,
}

/// An HTTP status with a `{ "message": ... }` body.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            tracing::error!(status = %self.status, message = %self.message, "Request failed");
        }
        (self.status, Json(ErrorBody { message: self.message })).into_response()
    }
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        let status = match &err {
            e if e.is_validation() => StatusCode::BAD_REQUEST,
            Error::DocumentNotFound(_) | Error::DocumentsNotFound(_) | Error::BatchNotFound(_) => {
                StatusCode::NOT_FOUND
            }
            Error::InvalidStatus(_) => StatusCode::CONFLICT,
            Error::Extraction(e) => match e.root() {
                ExtractionError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
                ExtractionError::Aborted { .. } => StatusCode::REQUEST_TIMEOUT,
                _ => StatusCode::BAD_GATEWAY,
            },
            Error::Dispatch(_) => StatusCode::BAD_GATEWAY,
            Error::Config(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, err.to_string())
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
