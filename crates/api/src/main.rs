#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::unwrap_used))]

//! Nutra-Vive Membership API Server
//!
//! HTTP entry point for the membership platform: subscription
//! reconciliation, Stripe webhook routing, usage accounting, and checkout.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::http::{header, Method};
use tower_http::{
    cors::{AllowOrigin, CorsLayer},
    trace::TraceLayer,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use nutravive_api::{create_router, AppState, Config};
use nutravive_membership::{
    CheckoutService, EmailConfig, InvariantChecker, PgConsultationStore, PgEventClaims,
    PgMembershipCatalog, PgMembershipStore, PgOrderStore, PgUserDirectory, ReconciliationEngine,
    ResendMailer, StripeClient, StripeProvider, UsageLedger, WebhookRouter,
};
use nutravive_shared::{create_migration_pool, create_pool, run_migrations};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,nutravive_api=debug,nutravive_membership=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!(
        "Starting Nutra-Vive Membership API v{}",
        env!("CARGO_PKG_VERSION")
    );

    // Load configuration
    let config = Config::from_env()?;
    tracing::info!("Configuration loaded");

    // Create database pool
    tracing::info!("Connecting to database...");
    let pool = create_pool(&config.database_url).await?;
    tracing::info!("Database connection established");

    // Run migrations on a dedicated single-connection pool
    tracing::info!("Running database migrations...");
    let migration_pool = create_migration_pool(&config.database_url).await?;
    run_migrations(&migration_pool).await?;
    migration_pool.close().await;
    tracing::info!("Database migrations complete");

    // Stripe client and provider seam
    let stripe = StripeClient::from_env()?;
    let webhook_secret = stripe.config().webhook_secret.clone();
    let ops_email = stripe.config().ops_email.clone();
    let app_base_url = stripe.config().app_base_url.clone();
    let provider = Arc::new(StripeProvider::new(stripe));

    // Postgres-backed storage seams
    let memberships = Arc::new(PgMembershipStore::new(pool.clone()));
    let catalog = Arc::new(PgMembershipCatalog::new(pool.clone()));
    let directory = Arc::new(PgUserDirectory::new(pool.clone()));
    let orders = Arc::new(PgOrderStore::new(pool.clone()));
    let consultations = Arc::new(PgConsultationStore::new(pool.clone()));
    let claims = Arc::new(PgEventClaims::new(pool.clone()));

    // Email notifications (no-op when RESEND_API_KEY is unset)
    let email_config = EmailConfig::from_env();
    if !email_config.is_enabled() {
        tracing::warn!("RESEND_API_KEY not set - email notifications disabled");
    }
    let notifier = Arc::new(ResendMailer::new(email_config));

    // Core services
    let engine = Arc::new(ReconciliationEngine::new(
        provider.clone(),
        directory.clone(),
        catalog.clone(),
        memberships.clone(),
    ));
    let webhooks = Arc::new(
        WebhookRouter::new(
            webhook_secret,
            ops_email,
            engine.clone(),
            provider.clone(),
            directory.clone(),
            catalog.clone(),
            consultations,
            notifier,
        )
        .with_claims(claims),
    );
    let ledger = Arc::new(UsageLedger::new(
        memberships.clone(),
        orders,
        directory.clone(),
    ));
    let checkout = Arc::new(CheckoutService::new(
        provider,
        directory,
        catalog,
        app_base_url,
    ));
    let invariants = Arc::new(InvariantChecker::new(pool.clone()));

    let state = AppState::new(
        pool,
        config.clone(),
        engine,
        webhooks,
        ledger,
        checkout,
        memberships,
        invariants,
    );

    // CORS: the storefront is the only browser client
    let allowed_origins: Vec<axum::http::HeaderValue> = std::env::var("ALLOWED_ORIGINS")
        .unwrap_or_else(|_| config.public_url.clone())
        .split(',')
        .filter_map(|s| s.trim().parse().ok())
        .collect();

    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::list(allowed_origins))
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE, header::ACCEPT]);

    let app = create_router(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http());

    // Parse bind address
    let addr: SocketAddr = config.bind_address.parse()?;
    tracing::info!("Starting server on {}", addr);

    // Start the server
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_ok() {
        tracing::info!("Shutdown signal received, draining connections");
    }
}
