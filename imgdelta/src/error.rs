use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use config::ConfigError;
use thiserror::Error;

use crate::api::models::{ErrorInfo, ErrorResponse};
use crate::diff::DiffError;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Alias not found: {0}")]
    AliasNotFound(String),

    #[error("Artifact not found: {0}")]
    ArtifactNotFound(String),

    #[error("Delta not found: {0}")]
    DeltaNotFound(String),

    #[error("Failed to resolve: {0}")]
    FailedToResolve(String),

    #[error("Incompatible artifacts: {0}")]
    IncompatibleArtifacts(String),

    #[error("Not yet implemented: {0}")]
    NotYetImplemented(String),

    #[error("Internal server error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl AppError {
    pub fn status(&self) -> StatusCode {
        match self {
            AppError::BadRequest(_) | AppError::IncompatibleArtifacts(_) => StatusCode::BAD_REQUEST,
            AppError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            AppError::AliasNotFound(_)
            | AppError::ArtifactNotFound(_)
            | AppError::DeltaNotFound(_)
            | AppError::FailedToResolve(_) => StatusCode::NOT_FOUND,
            AppError::NotYetImplemented(_) => StatusCode::NOT_IMPLEMENTED,
            AppError::Internal(_) | AppError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Stable machine readable error code.
    pub fn code(&self) -> &'static str {
        match self {
            AppError::BadRequest(_) => "BAD_REQUEST",
            AppError::Unauthorized(_) => "UNAUTHORIZED",
            AppError::AliasNotFound(_) => "ALIAS_NOT_FOUND",
            AppError::ArtifactNotFound(_) => "ARTIFACT_NOT_FOUND",
            AppError::DeltaNotFound(_) => "DELTA_NOT_FOUND",
            AppError::FailedToResolve(_) => "FAILED_TO_RESOLVE",
            AppError::IncompatibleArtifacts(_) => "INCOMPATIBLE_ARTIFACTS",
            AppError::NotYetImplemented(_) => "NOT_YET_IMPLEMENTED",
            AppError::Internal(_) => "INTERNAL",
            AppError::Config(_) => "CONFIG",
        }
    }

    fn context(&self) -> &str {
        match self {
            AppError::BadRequest(msg)
            | AppError::Unauthorized(msg)
            | AppError::AliasNotFound(msg)
            | AppError::ArtifactNotFound(msg)
            | AppError::DeltaNotFound(msg)
            | AppError::FailedToResolve(msg)
            | AppError::IncompatibleArtifacts(msg)
            | AppError::NotYetImplemented(msg)
            | AppError::Internal(msg)
            | AppError::Config(msg) => msg,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = ErrorResponse {
            errors: vec![ErrorInfo {
                code: self.code().to_string(),
                message: self.to_string(),
                detail: Some(serde_json::Value::String(self.context().to_string())),
            }],
        };

        (status, axum::Json(body)).into_response()
    }
}

pub type Result<T> = std::result::Result<T, AppError>;

impl From<ConfigError> for AppError {
    fn from(err: ConfigError) -> Self {
        AppError::Config(err.to_string())
    }
}

impl From<DiffError> for AppError {
    fn from(err: DiffError) -> Self {
        AppError::Internal(err.to_string())
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}
