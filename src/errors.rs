//! Error taxonomy surfaced to callers of the resource services.
//!
//! Every variant carries a stable machine-readable code and an HTTP status
//! so whatever transport sits in front of the services can render it
//! without inspecting messages.  [`StoreError`] values coming out of the
//! metadata adapter are classified here.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use thiserror::Error;

use crate::metadata::store::{ConstraintKind, StoreError};

/// Errors returned by lifecycle operations and resource services.
#[derive(Debug, Error)]
pub enum MediaError {
    /// The targeted resource does not exist.
    #[error("{resource} not found")]
    NotFound { resource: String },

    /// A uniqueness constraint rejected the write.
    #[error("{message}")]
    DuplicateName { message: String },

    /// The write referenced a parent that does not exist.
    #[error("{field} does not reference an existing record")]
    ForeignKeyViolation { field: String },

    /// A field failed validation (bad identifier, missing value, bad cursor).
    #[error("invalid {field}: {message}")]
    InvalidInput { field: String, message: String },

    /// The upload is not an image this system can store.
    #[error("unsupported media type: {content_type}")]
    UnsupportedMediaFormat { content_type: String },

    /// A store call did not finish within the configured bound.
    #[error("{operation} timed out")]
    Timeout { operation: String },

    /// The blob store rejected or failed an operation.
    #[error("storage failure: {0}")]
    StorageFailure(anyhow::Error),

    /// Catch-all for unexpected internal errors.
    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl MediaError {
    pub fn not_found(resource: impl Into<String>) -> Self {
        MediaError::NotFound {
            resource: resource.into(),
        }
    }

    pub fn invalid(field: impl Into<String>, message: impl Into<String>) -> Self {
        MediaError::InvalidInput {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Return the machine-readable error code.
    pub fn code(&self) -> &'static str {
        match self {
            MediaError::NotFound { .. } => "NotFound",
            MediaError::DuplicateName { .. } => "DuplicateName",
            MediaError::ForeignKeyViolation { .. } => "ForeignKeyViolation",
            MediaError::InvalidInput { .. } => "InvalidInput",
            MediaError::UnsupportedMediaFormat { .. } => "UnsupportedMediaFormat",
            MediaError::Timeout { .. } => "Timeout",
            MediaError::StorageFailure(_) => "StorageFailure",
            MediaError::Internal(_) => "InternalError",
        }
    }

    /// Return the appropriate HTTP status code for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            MediaError::NotFound { .. } => StatusCode::NOT_FOUND,
            MediaError::DuplicateName { .. } => StatusCode::CONFLICT,
            MediaError::ForeignKeyViolation { .. } => StatusCode::BAD_REQUEST,
            MediaError::InvalidInput { .. } => StatusCode::BAD_REQUEST,
            MediaError::UnsupportedMediaFormat { .. } => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            MediaError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            MediaError::StorageFailure(_) => StatusCode::BAD_GATEWAY,
            MediaError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Label used for the `outcome` dimension of lifecycle metrics.
    pub fn metric_label(&self) -> &'static str {
        match self {
            MediaError::NotFound { .. } => "not_found",
            MediaError::DuplicateName { .. }
            | MediaError::ForeignKeyViolation { .. }
            | MediaError::InvalidInput { .. }
            | MediaError::UnsupportedMediaFormat { .. } => "rejected",
            MediaError::Timeout { .. } => "timeout",
            MediaError::StorageFailure(_) | MediaError::Internal(_) => "error",
        }
    }
}

impl From<StoreError> for MediaError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound { resource } => MediaError::NotFound { resource },
            StoreError::Constraint { kind, field } => match kind {
                ConstraintKind::UniqueViolation => MediaError::DuplicateName {
                    message: format!("{} already exists", field.as_deref().unwrap_or("record")),
                },
                ConstraintKind::ForeignKeyViolation => MediaError::ForeignKeyViolation {
                    field: field.unwrap_or_else(|| "reference".to_string()),
                },
                ConstraintKind::NotNullViolation => MediaError::InvalidInput {
                    field: field.unwrap_or_else(|| "body".to_string()),
                    message: "required values are empty".to_string(),
                },
                ConstraintKind::InvalidInputSyntax => MediaError::InvalidInput {
                    field: field.unwrap_or_else(|| "id".to_string()),
                    message: "malformed identifier".to_string(),
                },
            },
            StoreError::Other(e) => MediaError::Internal(e),
        }
    }
}

impl IntoResponse for MediaError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = serde_json::json!({
            "code": self.code(),
            "message": self.to_string(),
        });
        (status, Json(body)).into_response()
    }
}
