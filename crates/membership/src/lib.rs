// Membership crate clippy configuration
// These are intentional patterns in this crate:
#![allow(clippy::too_many_arguments)] // Some Stripe operations require many parameters
// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Nutra-Vive Membership Module
//!
//! Handles Stripe-backed memberships: subscription reconciliation, webhook
//! routing, usage accounting, and checkout.
//!
//! ## Features
//!
//! - **Reconciliation**: Rewrite local membership state from provider truth
//! - **Webhooks**: Verify, claim, and route Stripe events
//! - **Usage Ledger**: Debit category allocations as orders ship
//! - **Checkout**: Create membership checkout sessions
//! - **Email Notifications**: Welcome and operations alerts via Resend
//! - **Invariants**: Runnable consistency checks over membership data

pub mod checkout;
pub mod client;
pub mod email;
pub mod error;
pub mod invariants;
pub mod pg;
pub mod provider;
pub mod store;
pub mod stripe_provider;
pub mod sync;
pub mod usage;
pub mod webhooks;


// Checkout
pub use checkout::CheckoutService;

// Client
pub use client::{PriceIds, StripeClient, StripeConfig};

// Email
pub use email::{EmailConfig, ResendMailer};

// Error
pub use error::{MembershipError, MembershipResult};

// Invariants
pub use invariants::{
    InvariantCheckSummary, InvariantChecker, InvariantViolation, ViolationSeverity,
};

// Postgres stores
pub use pg::{
    PgConsultationStore, PgEventClaims, PgMembershipCatalog, PgMembershipStore, PgOrderStore,
    PgUserDirectory,
};

// Provider abstraction
pub use provider::{
    CheckoutSessionParams, CheckoutSessionRef, Notification, NotificationSender,
    NotificationTemplate, PaymentMethodSummary, PaymentProvider, ProviderCustomer,
    ProviderSubscriptionStatus, SubscriptionSnapshot,
};

// Storage seams and models
pub use store::{
    ConsultationStore, MembershipCatalog, MembershipDefinition, MembershipStore, OrderRecord,
    OrderStore, ProductAllocation, UsageRecord, UserDirectory, UserMembership, UserRecord,
};

// Stripe provider
pub use stripe_provider::StripeProvider;

// Sync engine
pub use sync::{CustomerSnapshot, ReconciliationEngine};

// Usage ledger
pub use usage::{
    CategoryUsage, ItemUsageChange, UsageAnalytics, UsageFilters, UsageItemInput, UsageLedger,
    UsageLevel, UsagePeriod, UsageTotals, UsageTrends, UsageUpdateResult,
};

// Webhooks
pub use webhooks::{ClaimOutcome, EventClaims, EventEnvelope, ExpandableId, WebhookRouter};
