//! Tracking service errors

use axum::Json;
use axum::response::{IntoResponse, Response};
use http::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type used across the workspace.
pub type Result<T> = anyhow::Result<T, Error>;

/// Domain level error type returned by the tracking engine.
///
/// A unit with no current position is not an error: lookups return `None`.
/// `NotFound` is reserved for explicit operations on units that do not exist.
#[derive(Error, Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum Error {
    /// The request is malformed (coordinates out of range, empty unit id, ...).
    #[error("code: 400, description: {0}")]
    BadRequest(String),

    /// An explicit operation referenced a unit that does not exist.
    #[error("code: 404, description: {0}")]
    NotFound(String),

    /// A non recoverable internal error occurred.
    #[error("code: 500, description: {0}")]
    Internal(String),

    /// An upstream collaborator (durable store, routing) failed.
    #[error("code: 502, description: {0}")]
    BadGateway(String),
}

impl Error {
    /// Returns the HTTP status associated with the variant.
    #[must_use]
    pub const fn code(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::BadGateway(_) => StatusCode::BAD_GATEWAY,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Returns the error description.
    #[must_use]
    pub fn description(&self) -> String {
        self.to_string()
    }
}

impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        let chain = err.chain().map(ToString::to_string).collect::<Vec<_>>().join(" -> ");

        // if type is Error, return it with the newly added context
        if let Some(inner) = err.downcast_ref::<Self>() {
            tracing::debug!("Error: {err}, caused by: {inner}");

            return match inner {
                Self::BadRequest(_) => Self::BadRequest(chain),
                Self::NotFound(_) => Self::NotFound(chain),
                Self::BadGateway(_) => Self::BadGateway(chain),
                Self::Internal(_) => Self::Internal(chain),
            };
        }

        // otherwise, return an Internal error
        Self::Internal(chain)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::BadRequest(format!("invalid payload: {err}"))
    }
}

/// Error rendered as an HTTP response by the service handlers.
#[derive(Debug)]
pub struct HttpError {
    status: StatusCode,
    error: String,
}

impl HttpError {
    /// The status the error renders with.
    #[must_use]
    pub const fn status(&self) -> StatusCode {
        self.status
    }
}

impl From<Error> for HttpError {
    fn from(e: Error) -> Self {
        Self { status: e.code(), error: e.to_string() }
    }
}

impl From<anyhow::Error> for HttpError {
    fn from(e: anyhow::Error) -> Self {
        let error = format!("{e}, caused by: {}", e.root_cause());
        let status = e.downcast_ref().map_or(StatusCode::INTERNAL_SERVER_ERROR, Error::code);
        Self { status, error }
    }
}

impl IntoResponse for HttpError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({ "error": self.error });
        (self.status, Json(body)).into_response()
    }
}

#[macro_export]
macro_rules! bad_request {
    ($fmt:expr, $($arg:tt)*) => {
        $crate::Error::BadRequest(format!($fmt, $($arg)*))
    };
     ($err:expr $(,)?) => {
        $crate::Error::BadRequest(format!($err))
    };
}

#[macro_export]
macro_rules! not_found {
    ($fmt:expr, $($arg:tt)*) => {
        $crate::Error::NotFound(format!($fmt, $($arg)*))
    };
     ($err:expr $(,)?) => {
        $crate::Error::NotFound(format!($err))
    };
}

#[macro_export]
macro_rules! bad_gateway {
    ($fmt:expr, $($arg:tt)*) => {
        $crate::Error::BadGateway(format!($fmt, $($arg)*))
    };
     ($err:expr $(,)?) => {
        $crate::Error::BadGateway(format!($err))
    };
}

#[cfg(test)]
mod tests {
    use anyhow::{Context, Result, anyhow};
    use http::StatusCode;
    use serde_json::Value;
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;
    use tracing_subscriber::{EnvFilter, Registry, fmt};

    use super::{Error, HttpError};

    #[test]
    fn error_display() {
        let err = Error::BadRequest("latitude out of range".to_string());
        assert_eq!(format!("{err}"), "code: 400, description: latitude out of range");
    }

    #[test]
    fn with_context() {
        let _ = Registry::default().with(EnvFilter::new("debug")).with(fmt::layer()).try_init();

        let context_error = || -> Result<(), Error> {
            Err(Error::NotFound("unit PC-001".to_string()))
                .context("removing simulated unit")
                .context("handling request")?;
            Ok(())
        };

        let result = context_error();
        assert_eq!(
            result.unwrap_err(),
            Error::NotFound(
                "handling request -> removing simulated unit -> code: 404, description: unit PC-001"
                    .to_string()
            )
        );
    }

    #[test]
    fn anyhow_context() {
        let result = Err::<(), anyhow::Error>(anyhow!("connection refused")).context("upserting");
        let err: Error = result.unwrap_err().into();

        assert_eq!(err.to_string(), "code: 500, description: upserting -> connection refused");
    }

    #[test]
    fn serde_context() {
        let result: Result<Value, serde_json::Error> = serde_json::from_str(r#"{"lat": 33.7"#);
        let err: Error = result.unwrap_err().into();

        assert_eq!(err.code(), StatusCode::BAD_REQUEST);
        assert!(err.to_string().starts_with("code: 400, description: invalid payload"));
    }

    #[test]
    fn macros() {
        let id = "PC-009";
        assert_eq!(
            not_found!("unit {id} is not simulated"),
            Error::NotFound(format!("unit {id} is not simulated"))
        );
        assert_eq!(bad_gateway!("store {}", "down").code(), StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn http_status_from_anyhow() {
        let err = anyhow::Error::new(Error::BadRequest("radius must be positive".to_string()));
        assert_eq!(HttpError::from(err).status(), StatusCode::BAD_REQUEST);

        let err = anyhow!("unexpected");
        assert_eq!(HttpError::from(err).status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
