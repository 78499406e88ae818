//! Shared application state

use std::sync::Arc;

use sqlx::PgPool;

use nutravive_membership::{
    CheckoutService, InvariantChecker, MembershipStore, ReconciliationEngine, UsageLedger,
    WebhookRouter,
};

use crate::config::Config;

/// Shared application state handed to every handler
#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub config: Arc<Config>,
    pub engine: Arc<ReconciliationEngine>,
    pub webhooks: Arc<WebhookRouter>,
    pub ledger: Arc<UsageLedger>,
    pub checkout: Arc<CheckoutService>,
    pub memberships: Arc<dyn MembershipStore>,
    pub invariants: Arc<InvariantChecker>,
}

impl AppState {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        pool: PgPool,
        config: Config,
        engine: Arc<ReconciliationEngine>,
        webhooks: Arc<WebhookRouter>,
        ledger: Arc<UsageLedger>,
        checkout: Arc<CheckoutService>,
        memberships: Arc<dyn MembershipStore>,
        invariants: Arc<InvariantChecker>,
    ) -> Self {
        Self {
            pool,
            config: Arc::new(config),
            engine,
            webhooks,
            ledger,
            checkout,
            memberships,
            invariants,
        }
    }
}
