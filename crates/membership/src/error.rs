//! Membership error types

use thiserror::Error;

/// Membership-specific errors
#[derive(Debug, Error)]
pub enum MembershipError {
    #[error("Stripe API error: {0}")]
    StripeApi(String),

    #[error("Customer not found: {0}")]
    CustomerNotFound(String),

    #[error("Subscription not found: {0}")]
    SubscriptionNotFound(String),

    #[error("User could not be resolved: {0}")]
    UnresolvedUser(String),

    #[error("Membership definition not found: {0}")]
    DefinitionNotFound(String),

    #[error("No active membership for user: {0}")]
    NoActiveMembership(String),

    #[error("Invalid billing period on subscription {subscription_id}: {detail}")]
    InvalidPeriod {
        subscription_id: String,
        detail: String,
    },

    #[error("Order not found or not owned by requester: {0}")]
    OrderNotAuthorized(String),

    #[error("Webhook signature verification failed")]
    WebhookSignatureInvalid,

    #[error("Webhook payload malformed: {0}")]
    WebhookPayloadInvalid(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<stripe::StripeError> for MembershipError {
    fn from(err: stripe::StripeError) -> Self {
        MembershipError::StripeApi(err.to_string())
    }
}

impl From<sqlx::Error> for MembershipError {
    fn from(err: sqlx::Error) -> Self {
        MembershipError::Database(err.to_string())
    }
}

pub type MembershipResult<T> = Result<T, MembershipError>;
