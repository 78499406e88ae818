//! Domain models and storage seams
//!
//! The engine and ledger talk to storage through these traits; Postgres
//! implementations live in [`crate::pg`], test doubles in the test module.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use nutravive_shared::{MembershipId, MembershipStatus, MembershipTier, UserId};

use crate::error::MembershipResult;

// =============================================================================
// Models
// =============================================================================

/// Per-category product allocation on a membership definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProductAllocation {
    /// May be absent on hand-entered catalog rows; such entries are
    /// dropped (with a warning) when usage is materialized
    pub category_id: Option<String>,
    pub category_name: String,
    pub quantity: i32,
}

/// Catalog entry describing a purchasable membership plan
#[derive(Debug, Clone)]
pub struct MembershipDefinition {
    pub id: MembershipId,
    pub tier: MembershipTier,
    pub price_cents: i64,
    pub stripe_price_id: String,
    pub product_allocations: Vec<ProductAllocation>,
    pub total_subscribers: i64,
    pub total_revenue_cents: i64,
}

/// Per-category allocation/consumption counter within a user membership
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageRecord {
    pub category_id: String,
    pub category_name: String,
    pub allocated_quantity: i32,
    pub used_quantity: i32,
    pub available_quantity: i32,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_used: Option<OffsetDateTime>,
}

impl UsageRecord {
    /// Fresh counter from a catalog allocation: zero used, full available
    pub fn from_allocation(category_id: String, allocation: &ProductAllocation) -> Self {
        Self {
            category_id,
            category_name: allocation.category_name.clone(),
            allocated_quantity: allocation.quantity,
            used_quantity: 0,
            available_quantity: allocation.quantity,
            last_used: None,
        }
    }

    /// Re-derive available from allocated/used; floors at zero
    pub fn recompute_available(&mut self) {
        self.available_quantity = (self.allocated_quantity - self.used_quantity).max(0);
    }
}

/// Reconciled per-subscription membership state for a user
///
/// One row per (user_id, subscription_id); status mirrors the provider and
/// is only ever written by a sync. Rows are retired by setting status to
/// cancelled, never deleted.
#[derive(Debug, Clone)]
pub struct UserMembership {
    pub id: Uuid,
    pub user_id: UserId,
    /// Unset when the price id did not resolve to a catalog entry
    pub membership_id: Option<MembershipId>,
    pub subscription_id: String,
    pub status: MembershipStatus,
    pub start_date: OffsetDateTime,
    pub current_period_start: OffsetDateTime,
    pub current_period_end: OffsetDateTime,
    pub usage_reset_date: OffsetDateTime,
    /// None exactly when auto_renewal is false (cancel at period end)
    pub next_billing_date: Option<OffsetDateTime>,
    pub auto_renewal: bool,
    pub last_payment_date: Option<OffsetDateTime>,
    pub last_payment_amount_cents: Option<i64>,
    pub product_usage: Vec<UsageRecord>,
}

/// User identity with optional payment-customer linkage
#[derive(Debug, Clone)]
pub struct UserRecord {
    pub id: UserId,
    pub email: String,
    pub external_id: Option<String>,
    pub stripe_customer_id: Option<String>,
}

/// Order reference used only for usage-application authorization
#[derive(Debug, Clone)]
pub struct OrderRecord {
    pub order_number: String,
    pub user_id: Option<UserId>,
    pub email: String,
}

// =============================================================================
// Store traits
// =============================================================================

/// Membership catalog: price/plan lookup plus aggregate counters
#[async_trait]
pub trait MembershipCatalog: Send + Sync {
    async fn find_by_price_id(
        &self,
        price_id: &str,
    ) -> MembershipResult<Option<MembershipDefinition>>;

    async fn find_by_id(&self, id: MembershipId) -> MembershipResult<Option<MembershipDefinition>>;

    /// Atomically bump total_subscribers and total_revenue. Called only on
    /// the create branch of a membership upsert.
    async fn record_new_subscriber(
        &self,
        id: MembershipId,
        price_cents: i64,
    ) -> MembershipResult<()>;
}

/// User directory: identity lookups and linkage backfill
#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn find_by_id(&self, user_id: UserId) -> MembershipResult<Option<UserRecord>>;

    async fn find_by_external_id(&self, external_id: &str)
        -> MembershipResult<Option<UserRecord>>;

    async fn find_by_payment_customer_id(
        &self,
        customer_id: &str,
    ) -> MembershipResult<Option<UserRecord>>;

    async fn find_by_email(&self, email: &str) -> MembershipResult<Option<UserRecord>>;

    async fn set_payment_customer_id(
        &self,
        user_id: UserId,
        customer_id: &str,
    ) -> MembershipResult<()>;

    async fn set_external_id(&self, user_id: UserId, external_id: &str) -> MembershipResult<()>;
}

/// Store for reconciled user membership rows
#[async_trait]
pub trait MembershipStore: Send + Sync {
    async fn find_by_subscription(
        &self,
        user_id: UserId,
        subscription_id: &str,
    ) -> MembershipResult<Option<UserMembership>>;

    /// Upsert keyed on (user_id, subscription_id). Returns true when the
    /// row was created; the counter increment is gated on this flag, so
    /// implementations must make create-detection atomic with the write.
    /// The update branch must not touch product_usage.
    async fn upsert(&self, row: &UserMembership) -> MembershipResult<bool>;

    /// Persist product_usage for an existing row in one write
    async fn update_usage(
        &self,
        user_id: UserId,
        subscription_id: &str,
        product_usage: &[UsageRecord],
    ) -> MembershipResult<()>;

    /// Flip every active/trialing row for the user to cancelled.
    /// Returns the number of rows affected.
    async fn cancel_active_for_user(&self, user_id: UserId) -> MembershipResult<u64>;

    async fn find_active_for_user(&self, user_id: UserId)
        -> MembershipResult<Option<UserMembership>>;

    async fn list_for_user(&self, user_id: UserId) -> MembershipResult<Vec<UserMembership>>;
}

/// Order lookup scoped to the requesting user (by id or matching email)
#[async_trait]
pub trait OrderStore: Send + Sync {
    async fn find_by_order_number_for_user(
        &self,
        order_number: &str,
        user_id: UserId,
        email: &str,
    ) -> MembershipResult<Option<OrderRecord>>;
}

/// Consultation submissions paid through one-off payment intents
#[async_trait]
pub trait ConsultationStore: Send + Sync {
    /// Returns false when no submission matched the id
    async fn mark_payment_succeeded(&self, submission_id: &str) -> MembershipResult<bool>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_usage_record_floors_at_zero() {
        let mut record = UsageRecord {
            category_id: "c1".to_string(),
            category_name: "Juices".to_string(),
            allocated_quantity: 5,
            used_quantity: 9,
            available_quantity: 0,
            last_used: None,
        };
        record.recompute_available();
        assert_eq!(record.available_quantity, 0);

        record.used_quantity = 2;
        record.recompute_available();
        assert_eq!(record.available_quantity, 3);
    }

    #[test]
    fn test_usage_record_serde_shape() {
        let record = UsageRecord {
            category_id: "c1".to_string(),
            category_name: "Teas".to_string(),
            allocated_quantity: 10,
            used_quantity: 0,
            available_quantity: 10,
            last_used: None,
        };
        let json = serde_json::to_value(&record).unwrap();
        // camelCase keys are load-bearing: rows written by the previous
        // storefront use this shape in the same column
        assert!(json.get("categoryId").is_some());
        assert!(json.get("allocatedQuantity").is_some());
    }
}
