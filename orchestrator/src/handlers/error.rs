use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use crate::error::Error as CoreError;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Core(#[from] CoreError),
    #[error("webhook signature verification failed")]
    InvalidSignature,
    #[error("this project has no webhook secret configured")]
    NoWebhookSecret,
    #[error("missing required header {0}")]
    MissingHeader(&'static str),
}

impl Error {
    /// `(status, machine-readable kind)` for the response body
    fn classify(&self) -> (StatusCode, String) {
        match self {
            Self::Core(CoreError::Conflict(_)) => {
                (StatusCode::CONFLICT, "DEPLOYMENT_IN_PROGRESS".to_string())
            }
            Self::Core(CoreError::AlreadyCompleted) => {
                (StatusCode::CONFLICT, "ALREADY_COMPLETED".to_string())
            }
            Self::Core(CoreError::ProjectNotFound) => {
                (StatusCode::NOT_FOUND, "PROJECT_NOT_FOUND".to_string())
            }
            Self::Core(CoreError::DeploymentNotFound) => {
                (StatusCode::NOT_FOUND, "DEPLOYMENT_NOT_FOUND".to_string())
            }
            Self::Core(error) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                error.kind().to_string(),
            ),
            Self::InvalidSignature => {
                (StatusCode::UNAUTHORIZED, "INVALID_SIGNATURE".to_string())
            }
            Self::NoWebhookSecret => {
                (StatusCode::UNAUTHORIZED, "NO_WEBHOOK_SECRET".to_string())
            }
            Self::MissingHeader(_) => (StatusCode::BAD_REQUEST, "MISSING_HEADER".to_string()),
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let (status, error_kind) = self.classify();

        (
            status,
            [(
                header::CONTENT_TYPE,
                HeaderValue::from_static("application/json"),
            )],
            Json(json!({
                "error_kind": error_kind,
                "message": self.to_string(),
            })),
        )
            .into_response()
    }
}

pub type Result<T> = std::result::Result<T, Error>;
