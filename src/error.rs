use axum::{
    extract::{rejection::JsonRejection, FromRequest},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;
use tracing::{error, warn};

/// `axum`-compatible error handler.
#[derive(Error)]
pub struct Error {
    status: StatusCode,
    err: anyhow::Error,
}

impl Error {
    pub fn with_status(status: StatusCode, err: impl Into<anyhow::Error>) -> Self {
        Self {
            status,
            err: err.into(),
        }
    }

    pub fn bad_request(msg: impl std::fmt::Display) -> Self {
        Self::with_status(StatusCode::BAD_REQUEST, anyhow::anyhow!("{msg}"))
    }

    pub fn unauthorized(msg: impl std::fmt::Display) -> Self {
        Self::with_status(StatusCode::UNAUTHORIZED, anyhow::anyhow!("{msg}"))
    }

    pub fn forbidden(msg: impl std::fmt::Display) -> Self {
        Self::with_status(StatusCode::FORBIDDEN, anyhow::anyhow!("{msg}"))
    }

    pub fn not_found(msg: impl std::fmt::Display) -> Self {
        Self::with_status(StatusCode::NOT_FOUND, anyhow::anyhow!("{msg}"))
    }

    pub fn conflict(msg: impl std::fmt::Display) -> Self {
        Self::with_status(StatusCode::CONFLICT, anyhow::anyhow!("{msg}"))
    }

    #[cfg(test)]
    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            err,
        }
    }
}

impl From<JsonRejection> for Error {
    fn from(rejection: JsonRejection) -> Self {
        Self::bad_request(rejection.body_text())
    }
}

/// A JSON request body. Malformed bodies, missing fields and unknown enum values are 400s.
#[derive(FromRequest)]
#[from_request(via(Json), rejection(Error))]
pub struct Body<T>(pub T);

impl From<crate::status::TransitionError> for Error {
    fn from(err: crate::status::TransitionError) -> Self {
        Self::with_status(StatusCode::CONFLICT, err)
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {:#}", self.status, self.err)
    }
}

impl std::fmt::Debug for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.err.fmt(f)
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            error!("{:?}", self.err);
        } else {
            warn!(status = %self.status, "{:#}", self.err);
        }

        // The message chain is forwarded to the caller as-is.
        let body = Json(json!({ "error": format!("{:#}", self.err) }));
        (self.status, body).into_response()
    }
}
