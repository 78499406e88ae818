//! API routes

pub mod health;
pub mod memberships;
pub mod usage;
pub mod webhooks;

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};

use crate::state::AppState;

/// Create all API routes
pub fn create_router(state: AppState) -> Router {
    // Health check routes (at root level for infrastructure monitoring)
    let health_routes = Router::new()
        .route("/health", get(health::health))
        .route("/health/live", get(health::liveness))
        .route("/health/ready", get(health::readiness));

    // Stripe webhook (public, uses signature verification)
    let webhook_routes = Router::new().route("/webhooks/stripe", post(webhooks::stripe_webhook));

    // Membership and usage routes - under /api/v1
    let api_v1_routes = Router::new()
        .route("/memberships/current", get(memberships::current_membership))
        .route("/memberships", get(memberships::list_memberships))
        .route("/memberships/checkout", post(memberships::create_checkout))
        .route("/usage", get(usage::get_usage))
        .route("/usage/apply", post(usage::apply_usage))
        // Admin/support tooling (role check handled at the edge proxy)
        .route("/admin/memberships/sync", post(memberships::sync_customer))
        .route("/admin/memberships/invariants", get(memberships::run_invariants));

    Router::new()
        .merge(health_routes)
        .merge(webhook_routes)
        .nest("/api/v1", api_v1_routes)
        // Global request body size limit; webhook payloads stay well under this
        .layer(DefaultBodyLimit::max(1024 * 1024))
        .with_state(state)
}
