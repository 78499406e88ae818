//! Payment provider abstraction
//!
//! Typed snapshots of provider objects plus the traits the engine is
//! constructed with. All Stripe-schema knowledge lives behind
//! [`PaymentProvider`]; the rest of the crate only sees these structs.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use nutravive_shared::MembershipStatus;

use crate::error::MembershipResult;

/// Subscription status as reported by the provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderSubscriptionStatus {
    Active,
    Trialing,
    PastDue,
    Canceled,
    Unpaid,
    Incomplete,
    IncompleteExpired,
    Paused,
}

impl ProviderSubscriptionStatus {
    /// Fixed translation table from provider status to local status.
    /// This is the only place the two vocabularies meet.
    pub fn to_membership_status(self) -> MembershipStatus {
        match self {
            Self::Active => MembershipStatus::Active,
            Self::Trialing => MembershipStatus::Trialing,
            Self::PastDue => MembershipStatus::PastDue,
            Self::Canceled => MembershipStatus::Cancelled,
            Self::Unpaid => MembershipStatus::Unpaid,
            Self::Incomplete => MembershipStatus::Incomplete,
            Self::IncompleteExpired => MembershipStatus::IncompleteExpired,
            Self::Paused => MembershipStatus::Paused,
        }
    }

    pub fn is_entitling(self) -> bool {
        matches!(self, Self::Active | Self::Trialing)
    }
}

/// Customer record as fetched from the provider
#[derive(Debug, Clone)]
pub struct ProviderCustomer {
    pub id: String,
    pub email: Option<String>,
    /// Provider reports the customer object as deleted
    pub deleted: bool,
    pub metadata: HashMap<String, String>,
}

impl ProviderCustomer {
    /// External auth id hint carried in customer metadata, when present
    pub fn external_id_hint(&self) -> Option<&str> {
        self.metadata.get("clerkUserId").map(|s| s.as_str())
    }
}

/// Subscription state as fetched from the provider
///
/// Epoch fields are kept raw here; the engine owns conversion and the
/// validity gate so a bad epoch fails the sync rather than being papered
/// over at the mapping layer.
#[derive(Debug, Clone)]
pub struct SubscriptionSnapshot {
    pub id: String,
    pub customer_id: String,
    pub status: ProviderSubscriptionStatus,
    pub cancel_at_period_end: bool,
    /// Subscription start, epoch seconds
    pub start_date: i64,
    /// Billing period start, epoch seconds; absent on some API versions
    pub current_period_start: Option<i64>,
    /// Billing period end, epoch seconds; absent on some API versions
    pub current_period_end: Option<i64>,
    /// Price id of the first subscription item
    pub price_id: Option<String>,
}

/// Card summary returned informationally from a sync
#[derive(Debug, Clone, Serialize)]
pub struct PaymentMethodSummary {
    pub id: String,
    pub brand: Option<String>,
    pub last4: Option<String>,
    pub exp_month: Option<i64>,
    pub exp_year: Option<i64>,
}

/// Parameters for creating a membership checkout session
#[derive(Debug, Clone)]
pub struct CheckoutSessionParams {
    pub customer_id: String,
    pub price_id: String,
    pub success_url: String,
    pub cancel_url: String,
    /// Carried through to checkout.session.completed; must contain
    /// userId and membershipId for the completion flow to proceed
    pub metadata: HashMap<String, String>,
}

/// Reference to a created checkout session
#[derive(Debug, Clone, Serialize)]
pub struct CheckoutSessionRef {
    pub id: String,
    pub url: Option<String>,
}

/// Payment provider trait
///
/// Abstracts the billing processor so the engine can be constructed with a
/// test double. The production implementation is [`crate::StripeProvider`].
#[async_trait]
pub trait PaymentProvider: Send + Sync {
    async fn get_customer(&self, customer_id: &str) -> MembershipResult<ProviderCustomer>;

    /// Create a customer carrying the given metadata
    async fn create_customer(
        &self,
        email: &str,
        metadata: HashMap<String, String>,
    ) -> MembershipResult<ProviderCustomer>;

    /// List subscriptions for a customer across all statuses,
    /// in provider list order
    async fn list_subscriptions(
        &self,
        customer_id: &str,
    ) -> MembershipResult<Vec<SubscriptionSnapshot>>;

    /// List the customer's card payment methods
    async fn list_payment_methods(
        &self,
        customer_id: &str,
    ) -> MembershipResult<Vec<PaymentMethodSummary>>;

    async fn get_subscription(&self, subscription_id: &str)
        -> MembershipResult<SubscriptionSnapshot>;

    async fn create_checkout_session(
        &self,
        params: CheckoutSessionParams,
    ) -> MembershipResult<CheckoutSessionRef>;
}

/// Outbound notification payload
#[derive(Debug, Clone)]
pub struct Notification {
    pub to: String,
    pub template: NotificationTemplate,
}

/// Notification templates the membership flows emit
#[derive(Debug, Clone)]
pub enum NotificationTemplate {
    /// Sent to the member after a new membership is created
    MembershipWelcome {
        tier: String,
        price_cents: i64,
        next_billing_date: Option<time::OffsetDateTime>,
        allocations: Vec<(String, i32)>,
    },
    /// Sent to the operations inbox after a new membership is created
    NewMemberAlert {
        member_email: String,
        tier: String,
        price_cents: i64,
    },
}

/// Notification sender trait
///
/// Delivery is best-effort: implementations log failures and return false,
/// they never error. A failed notification must not roll back the mutation
/// that triggered it.
#[async_trait]
pub trait NotificationSender: Send + Sync {
    async fn send(&self, notification: Notification) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_translation_table() {
        use MembershipStatus as M;
        use ProviderSubscriptionStatus as P;

        let cases = [
            (P::Active, M::Active),
            (P::Trialing, M::Trialing),
            (P::PastDue, M::PastDue),
            (P::Canceled, M::Cancelled),
            (P::Unpaid, M::Unpaid),
            (P::Incomplete, M::Incomplete),
            (P::IncompleteExpired, M::IncompleteExpired),
            (P::Paused, M::Paused),
        ];
        for (provider, local) in cases {
            assert_eq!(provider.to_membership_status(), local);
        }
    }

    #[test]
    fn test_entitling_statuses() {
        assert!(ProviderSubscriptionStatus::Active.is_entitling());
        assert!(ProviderSubscriptionStatus::Trialing.is_entitling());
        assert!(!ProviderSubscriptionStatus::PastDue.is_entitling());
        assert!(!ProviderSubscriptionStatus::Canceled.is_entitling());
    }

    #[test]
    fn test_external_id_hint() {
        let mut metadata = HashMap::new();
        metadata.insert("clerkUserId".to_string(), "user_abc".to_string());
        let customer = ProviderCustomer {
            id: "cus_1".to_string(),
            email: None,
            deleted: false,
            metadata,
        };
        assert_eq!(customer.external_id_hint(), Some("user_abc"));
    }
}
