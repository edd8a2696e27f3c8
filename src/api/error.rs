//! Errors returned at the HTTP boundary.
//!
//! Every failure carries a stable wire code alongside its HTTP status.
//! Internal failures are logged and reported without detail.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use tracing::error;

use crate::error::{DatabaseError, Error, FormError, SessionError};

#[derive(Debug, thiserror::Error)]
pub enum CallableError {
    #[error("The request is not authenticated")]
    Unauthenticated,

    #[error("{0}")]
    PermissionDenied(String),

    #[error("{0}")]
    InvalidArgument(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    FailedPrecondition(String),

    #[error("Internal error")]
    Internal,
}

impl CallableError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Unauthenticated => "unauthenticated",
            Self::PermissionDenied(_) => "permission-denied",
            Self::InvalidArgument(_) => "invalid-argument",
            Self::NotFound(_) => "not-found",
            Self::FailedPrecondition(_) => "failed-precondition",
            Self::Internal => "internal",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::Unauthenticated => StatusCode::UNAUTHORIZED,
            Self::PermissionDenied(_) => StatusCode::FORBIDDEN,
            Self::InvalidArgument(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::FailedPrecondition(_) => StatusCode::PRECONDITION_FAILED,
            Self::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidArgument(message.into())
    }
}

impl From<Error> for CallableError {
    fn from(e: Error) -> Self {
        match e {
            Error::Form(FormError::NotFound(id)) => Self::NotFound(format!("Form {id} not found")),
            Error::Form(e @ FormError::UnknownStep { .. }) => Self::NotFound(e.to_string()),
            Error::Form(e) => Self::InvalidArgument(e.to_string()),
            Error::Session(SessionError::PersonaNotSet(_)) => {
                Self::FailedPrecondition("Persona not set".to_string())
            }
            Error::Session(e @ SessionError::ChatNotFound(_)) => Self::NotFound(e.to_string()),
            Error::Session(e @ SessionError::NotParticipant { .. }) => {
                Self::PermissionDenied(e.to_string())
            }
            Error::Session(e @ (SessionError::SelfChat | SessionError::EmptyMessage)) => {
                Self::InvalidArgument(e.to_string())
            }
            Error::Database(_) | Error::Llm(_) | Error::Config(_) => {
                error!(error = %e, "Request failed");
                Self::Internal
            }
        }
    }
}

impl From<DatabaseError> for CallableError {
    fn from(e: DatabaseError) -> Self {
        Error::from(e).into()
    }
}

impl IntoResponse for CallableError {
    fn into_response(self) -> Response {
        let body = json!({
            "error": {
                "code": self.code(),
                "message": self.to_string(),
            }
        });
        (self.status(), Json(body)).into_response()
    }
}

pub type ApiResult<T> = Result<T, CallableError>;
