use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use plaza_types::api::StatusResponse;
use thiserror::Error;
use tracing::error;

/// Request-level error taxonomy. Everything except `Dependency` is
/// user-fixable and recovered into a structured response; `Dependency`
/// is the only class that surfaces as a 500.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    Validation(&'static str),

    #[error("email already registered")]
    Conflict,

    #[error("no account with that email")]
    NotFound,

    #[error("verify your email before logging in")]
    NotVerified,

    #[error("incorrect password")]
    InvalidCredentials,

    #[error("invalid or already used verification token")]
    InvalidToken,

    #[error("post not found")]
    PostNotFound,

    #[error("unauthorized")]
    Unauthorized,

    #[error("internal error")]
    Dependency(#[from] anyhow::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match self {
            ApiError::Validation(_) => StatusCode::BAD_REQUEST,
            ApiError::Conflict => StatusCode::CONFLICT,
            ApiError::NotFound => StatusCode::UNAUTHORIZED,
            ApiError::NotVerified => StatusCode::FORBIDDEN,
            ApiError::InvalidCredentials => StatusCode::UNAUTHORIZED,
            ApiError::InvalidToken => StatusCode::BAD_REQUEST,
            ApiError::PostNotFound => StatusCode::NOT_FOUND,
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::Dependency(ref e) => {
                // Detail goes to the log, never to the client
                error!("dependency failure: {:#}", e);
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        let body = StatusResponse {
            success: false,
            message: self.to_string(),
        };

        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dependency_message_is_generic() {
        let err = ApiError::Dependency(anyhow::anyhow!("db path /secret/users.db unreachable"));
        assert_eq!(err.to_string(), "internal error");
    }

    #[test]
    fn user_errors_keep_their_message() {
        assert_eq!(
            ApiError::Conflict.to_string(),
            "email already registered"
        );
        assert_eq!(
            ApiError::Validation("all fields are required").to_string(),
            "all fields are required"
        );
    }
}
