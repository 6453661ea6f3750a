use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use sprinkler_core::{CommandStatus, SprinklerError};

/// Unified error type for HTTP responses.
#[derive(Debug)]
pub struct AppError(pub anyhow::Error);

/// A path that names no resource, e.g. a non-numeric id.
#[derive(Debug)]
pub struct UnknownPath(pub String);

impl std::fmt::Display for UnknownPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "not found: {}", self.0)
    }
}

impl std::error::Error for UnknownPath {}

impl AppError {
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self(SprinklerError::BadRequest(msg.into()).into())
    }

    pub fn unknown_path(path: impl Into<String>) -> Self {
        Self(UnknownPath(path.into()).into())
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match self.0.downcast_ref::<SprinklerError>() {
            Some(e) => match (e.status(), e) {
                (CommandStatus::NotFound, _) => StatusCode::NOT_FOUND,
                (CommandStatus::BadRequest, _) => StatusCode::BAD_REQUEST,
                (CommandStatus::Conflict, _) => StatusCode::CONFLICT,
                (CommandStatus::Failed, SprinklerError::HardwareWrite { .. })
                | (CommandStatus::Failed, SprinklerError::HardwareRead { .. }) => {
                    StatusCode::BAD_GATEWAY
                }
                (CommandStatus::Failed, _) | (CommandStatus::Ok, _) => {
                    StatusCode::INTERNAL_SERVER_ERROR
                }
            },
            None if self.0.is::<UnknownPath>() => StatusCode::NOT_FOUND,
            None => StatusCode::INTERNAL_SERVER_ERROR,
        };

        if status.is_server_error() {
            tracing::error!(error = %self.0, "request failed");
        }
        let body = serde_json::json!({ "error": self.0.to_string() });
        (status, axum::Json(body)).into_response()
    }
}

impl<E> From<E> for AppError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}
