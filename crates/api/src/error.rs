//! API error types and handling

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

use nutravive_membership::MembershipError;

/// Application error type
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    // Validation errors
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("Invalid request: {0}")]
    BadRequest(String),

    // Resource errors
    #[error("Resource not found")]
    NotFound,
    #[error("No active membership")]
    NoActiveMembership,

    // Internal errors
    #[error("Database error: {0}")]
    Database(String),
    #[error("Internal server error")]
    Internal,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = match &self {
            ApiError::Validation(msg) => {
                (StatusCode::BAD_REQUEST, "VALIDATION_ERROR", msg.clone())
            }
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg.clone()),
            ApiError::NotFound => (StatusCode::NOT_FOUND, "NOT_FOUND", self.to_string()),
            ApiError::NoActiveMembership => {
                (StatusCode::NOT_FOUND, "NO_ACTIVE_MEMBERSHIP", self.to_string())
            }
            // Internal detail never leaks to clients
            ApiError::Database(msg) => {
                tracing::error!(error = %msg, "Database error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "INTERNAL_ERROR",
                    "Internal server error".to_string(),
                )
            }
            ApiError::Internal => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "INTERNAL_ERROR",
                self.to_string(),
            ),
        };

        let body = Json(json!({
            "error": {
                "code": code,
                "message": message,
            }
        }));

        (status, body).into_response()
    }
}

impl From<MembershipError> for ApiError {
    fn from(err: MembershipError) -> Self {
        match err {
            // Not-found / not-authorized collapse to 404-class responses
            MembershipError::NoActiveMembership(_) => ApiError::NoActiveMembership,
            MembershipError::OrderNotAuthorized(_)
            | MembershipError::DefinitionNotFound(_)
            | MembershipError::UnresolvedUser(_)
            | MembershipError::CustomerNotFound(_)
            | MembershipError::SubscriptionNotFound(_) => ApiError::NotFound,
            MembershipError::InvalidInput(msg) => ApiError::Validation(msg),
            MembershipError::WebhookSignatureInvalid | MembershipError::WebhookPayloadInvalid(_) => {
                ApiError::BadRequest("Invalid webhook payload".to_string())
            }
            MembershipError::Database(msg) => ApiError::Database(msg),
            other => {
                tracing::error!(error = %other, "Membership operation failed");
                ApiError::Internal
            }
        }
    }
}

impl From<sqlx::Error> for ApiError {
    fn from(err: sqlx::Error) -> Self {
        ApiError::Database(err.to_string())
    }
}

/// Result type alias for API handlers
pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_membership_errors_map_to_404_class() {
        let err: ApiError = MembershipError::OrderNotAuthorized("ORD-1".to_string()).into();
        assert!(matches!(err, ApiError::NotFound));

        let err: ApiError = MembershipError::NoActiveMembership("u".to_string()).into();
        assert!(matches!(err, ApiError::NoActiveMembership));
    }

    #[test]
    fn test_internal_errors_are_opaque() {
        let err: ApiError = MembershipError::StripeApi("secret detail".to_string()).into();
        assert!(matches!(err, ApiError::Internal));
        assert_eq!(err.to_string(), "Internal server error");
    }
}
