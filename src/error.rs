// ABOUTME: Error taxonomy for the stream boundary
// ABOUTME: Maps authentication and request failures to HTTP responses

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use table_watcher::UnknownTable;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("missing bearer credential")]
    MissingCredential,
    #[error("invalid credential")]
    InvalidCredential,
    #[error("credential expired")]
    ExpiredCredential,
}

/// Failures raised before a stream is opened. Nothing is registered with
/// the event bus when one of these is returned.
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("authentication failed: {0}")]
    Authentication(#[from] AuthError),
    #[error("no watched tables are visible to {principal}")]
    EmptyScope { principal: String },
    #[error("invalid tables parameter: {0}")]
    BadTables(#[from] UnknownTable),
    #[error("server is shutting down")]
    ShuttingDown,
}

impl StreamError {
    pub fn status(&self) -> StatusCode {
        match self {
            StreamError::Authentication(_) => StatusCode::UNAUTHORIZED,
            StreamError::EmptyScope { .. } => StatusCode::FORBIDDEN,
            StreamError::BadTables(_) => StatusCode::BAD_REQUEST,
            StreamError::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

impl IntoResponse for StreamError {
    fn into_response(self) -> Response {
        let status = self.status();
        let mut response = (status, self.to_string()).into_response();
        if status == StatusCode::UNAUTHORIZED {
            response.headers_mut().insert(
                axum::http::header::WWW_AUTHENTICATE,
                axum::http::HeaderValue::from_static("Bearer"),
            );
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_errors_to_status_codes() {
        assert_eq!(
            StreamError::from(AuthError::ExpiredCredential).status(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            StreamError::EmptyScope {
                principal: "kiosk".into()
            }
            .status(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            StreamError::from(UnknownTable("payroll".into())).status(),
            StatusCode::BAD_REQUEST
        );
    }

    #[test]
    fn unauthorized_response_carries_challenge() {
        let response = StreamError::from(AuthError::MissingCredential).into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(response.headers()["www-authenticate"], "Bearer");
    }
}
