//! Elastic master error abstractions.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

pub use elastic_core::AppError;

// Error messages.
pub const ERR_DB_FLUSH: &str = "error flushing database state";

/// An extension trait for the core `AppError`.
pub trait AppErrorExt {
    /// Get the HTTP status code and message for this error.
    fn into_http(self) -> HttpError;

    /// Translate the given error as an app error and map into an HTTP error.
    fn http(err: anyhow::Error) -> HttpError;
}

impl AppErrorExt for AppError {
    /// Get the HTTP status code and message for this error.
    fn into_http(self) -> HttpError {
        let status = match self {
            AppError::InvalidDatasetSpec(_) | AppError::InvalidInput(_) | AppError::OutOfBounds { .. } => StatusCode::BAD_REQUEST,
            AppError::UnknownDataset(_) | AppError::ResourceNotFound => StatusCode::NOT_FOUND,
            AppError::UnknownWorker(_) => StatusCode::CONFLICT,
            AppError::TaskRetryExhausted { .. } => StatusCode::PRECONDITION_FAILED,
            AppError::Ise(ref err) => {
                tracing::error!(error = ?err, "internal server error");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        HttpError(status, self.to_string())
    }

    /// Translate the given error as an app error and map into an HTTP error.
    fn http(err: anyhow::Error) -> HttpError {
        err.downcast::<Self>()
            .map(Self::into_http)
            .unwrap_or_else(|err| Self::Ise(err).into_http())
    }
}

/// An error response of the HTTP server.
#[derive(Debug)]
pub struct HttpError(pub StatusCode, pub String);

/// The JSON body of an error response.
#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

impl IntoResponse for HttpError {
    fn into_response(self) -> Response {
        (self.0, Json(ErrorBody { error: self.1 })).into_response()
    }
}

/// The error type used to indicate that a system shutdown is required.
#[derive(Debug, thiserror::Error)]
#[error("fatal error: {0}")]
pub struct ShutdownError(#[from] pub anyhow::Error);

/// A result type where the error is a `ShutdownError`.
pub type ShutdownResult<T> = ::std::result::Result<T, ShutdownError>;

/// A result type used by the HTTP handlers.
pub type HttpResult<T> = ::std::result::Result<Json<T>, HttpError>;
