//! Subscription reconciliation
//!
//! Rewrites local membership state to match the provider's current
//! subscription truth for one customer. Invoked from webhook handlers and
//! admin tooling; safe to re-run at any time (at-least-once delivery is the
//! norm, see the webhook router).

use std::sync::Arc;

use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use nutravive_shared::UserId;

use crate::error::{MembershipError, MembershipResult};
use crate::provider::{PaymentMethodSummary, PaymentProvider, SubscriptionSnapshot};
use crate::store::{
    MembershipCatalog, MembershipDefinition, MembershipStore, UsageRecord, UserDirectory,
    UserMembership, UserRecord,
};

/// Result of reconciling one customer
#[derive(Debug, Clone)]
pub struct CustomerSnapshot {
    pub user_id: UserId,
    /// The reconciled membership row, when an active/trialing
    /// subscription exists
    pub membership: Option<UserMembership>,
    /// The provider subscription the row was built from
    pub subscription: Option<SubscriptionSnapshot>,
    /// First card on file; informational only, never persisted
    pub default_payment_method: Option<PaymentMethodSummary>,
}

/// Reconciliation engine
///
/// All collaborators are injected so webhook tests can run against
/// in-memory doubles.
pub struct ReconciliationEngine {
    provider: Arc<dyn PaymentProvider>,
    directory: Arc<dyn UserDirectory>,
    catalog: Arc<dyn MembershipCatalog>,
    memberships: Arc<dyn MembershipStore>,
}

impl ReconciliationEngine {
    pub fn new(
        provider: Arc<dyn PaymentProvider>,
        directory: Arc<dyn UserDirectory>,
        catalog: Arc<dyn MembershipCatalog>,
        memberships: Arc<dyn MembershipStore>,
    ) -> Self {
        Self {
            provider,
            directory,
            catalog,
            memberships,
        }
    }

    /// Reconcile one customer, swallowing errors.
    ///
    /// Webhook handlers call this form: any failure is logged and collapses
    /// to None, and the provider's own redelivery is the retry mechanism.
    pub async fn sync(&self, customer_id: &str) -> Option<CustomerSnapshot> {
        match self.try_sync(customer_id).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                tracing::error!(
                    customer_id = %customer_id,
                    error = %e,
                    "Customer sync failed"
                );
                None
            }
        }
    }

    /// Reconcile one customer, surfacing errors to the caller.
    pub async fn try_sync(&self, customer_id: &str) -> MembershipResult<Option<CustomerSnapshot>> {
        // The three provider reads are independent; fan out
        let (customer, subscriptions, payment_methods) = tokio::try_join!(
            self.provider.get_customer(customer_id),
            self.provider.list_subscriptions(customer_id),
            self.provider.list_payment_methods(customer_id),
        )?;

        if customer.deleted {
            tracing::warn!(
                customer_id = %customer_id,
                "Customer is deleted at provider; nothing to reconcile"
            );
            return Ok(None);
        }

        let user = match self
            .resolve_user(customer_id, customer.external_id_hint())
            .await?
        {
            Some(user) => user,
            None => {
                tracing::warn!(
                    customer_id = %customer_id,
                    "No local user resolves to this customer; skipping sync"
                );
                return Ok(None);
            }
        };

        // First active/trialing subscription in provider list order.
        // With multiple concurrent actives this pick is arbitrary; the
        // provider does not define an ordering and neither do we.
        let active = subscriptions.iter().find(|s| s.status.is_entitling());

        let membership = match active {
            Some(subscription) => {
                let definition = match subscription.price_id.as_deref() {
                    Some(price_id) => self.catalog.find_by_price_id(price_id).await?,
                    None => None,
                };
                if definition.is_none() {
                    tracing::warn!(
                        customer_id = %customer_id,
                        subscription_id = %subscription.id,
                        price_id = ?subscription.price_id,
                        "No catalog entry for price; recording subscription without definition"
                    );
                }

                let (row, created) = self
                    .apply_subscription(user.id, subscription, definition.as_ref(), None)
                    .await?;

                tracing::info!(
                    user_id = %user.id.0,
                    subscription_id = %subscription.id,
                    status = %row.status,
                    created = created,
                    "Membership reconciled"
                );
                Some(row)
            }
            None => {
                let cancelled = self.memberships.cancel_active_for_user(user.id).await?;
                if cancelled > 0 {
                    tracing::info!(
                        user_id = %user.id.0,
                        rows = cancelled,
                        "No entitling subscription at provider; cancelled local rows"
                    );
                }
                None
            }
        };

        Ok(Some(CustomerSnapshot {
            user_id: user.id,
            membership,
            subscription: active.cloned(),
            default_payment_method: payment_methods.into_iter().next(),
        }))
    }

    /// Upsert the membership row for one provider subscription.
    ///
    /// The create branch materializes usage counters from the definition
    /// and bumps catalog counters; the update branch leaves usage and
    /// counters alone. `last_payment` is stamped when given (checkout
    /// completion passes it, steady-state sync does not).
    pub(crate) async fn apply_subscription(
        &self,
        user_id: UserId,
        subscription: &SubscriptionSnapshot,
        definition: Option<&MembershipDefinition>,
        last_payment: Option<(OffsetDateTime, i64)>,
    ) -> MembershipResult<(UserMembership, bool)> {
        let (start_date, period_start, period_end) = resolve_period(subscription)?;

        let existing = self
            .memberships
            .find_by_subscription(user_id, &subscription.id)
            .await?;

        let auto_renewal = !subscription.cancel_at_period_end;
        let row = UserMembership {
            id: existing.as_ref().map(|m| m.id).unwrap_or_else(Uuid::new_v4),
            user_id,
            membership_id: definition
                .map(|d| d.id)
                .or(existing.as_ref().and_then(|m| m.membership_id)),
            subscription_id: subscription.id.clone(),
            status: subscription.status.to_membership_status(),
            start_date,
            current_period_start: period_start,
            current_period_end: period_end,
            usage_reset_date: period_end,
            next_billing_date: auto_renewal.then_some(period_end),
            auto_renewal,
            last_payment_date: last_payment
                .map(|(at, _)| at)
                .or(existing.as_ref().and_then(|m| m.last_payment_date)),
            last_payment_amount_cents: last_payment
                .map(|(_, cents)| cents)
                .or(existing.as_ref().and_then(|m| m.last_payment_amount_cents)),
            product_usage: match &existing {
                Some(m) => m.product_usage.clone(),
                None => definition.map(materialize_usage).unwrap_or_default(),
            },
        };

        let created = self.memberships.upsert(&row).await?;

        if created {
            if let Some(definition) = definition {
                self.catalog
                    .record_new_subscriber(definition.id, definition.price_cents)
                    .await?;
            }
        }

        Ok((row, created))
    }

    /// Resolve the local user for a provider customer id.
    ///
    /// Falls back once through the customer-metadata external-id hint,
    /// backfilling the stored customer id when the hint resolves. The
    /// fallback chain is a fixed two-entry sequence; there is no recursion.
    async fn resolve_user(
        &self,
        customer_id: &str,
        external_hint: Option<&str>,
    ) -> MembershipResult<Option<UserRecord>> {
        if let Some(user) = self
            .directory
            .find_by_payment_customer_id(customer_id)
            .await?
        {
            return Ok(Some(user));
        }

        let Some(hint) = external_hint else {
            return Ok(None);
        };

        match self.directory.find_by_external_id(hint).await? {
            Some(mut user) => {
                tracing::info!(
                    customer_id = %customer_id,
                    user_id = %user.id.0,
                    "Backfilling payment customer id from metadata hint"
                );
                self.directory
                    .set_payment_customer_id(user.id, customer_id)
                    .await?;
                user.stripe_customer_id = Some(customer_id.to_string());
                Ok(Some(user))
            }
            None => Ok(None),
        }
    }
}

/// Convert the snapshot's epoch fields into validated timestamps.
///
/// Missing period bounds default to (subscription start, start + 30 days).
/// An unrepresentable epoch fails the whole subscription: billing-period
/// correctness is load-bearing for usage resets, so nothing half-built may
/// be persisted.
pub(crate) fn resolve_period(
    subscription: &SubscriptionSnapshot,
) -> MembershipResult<(OffsetDateTime, OffsetDateTime, OffsetDateTime)> {
    let to_timestamp = |epoch: i64, field: &str| {
        OffsetDateTime::from_unix_timestamp(epoch).map_err(|e| MembershipError::InvalidPeriod {
            subscription_id: subscription.id.clone(),
            detail: format!("{} epoch {} is not a valid date: {}", field, epoch, e),
        })
    };

    let start_date = to_timestamp(subscription.start_date, "start_date")?;
    let period_start = match subscription.current_period_start {
        Some(epoch) => to_timestamp(epoch, "current_period_start")?,
        None => start_date,
    };
    let period_end = match subscription.current_period_end {
        Some(epoch) => to_timestamp(epoch, "current_period_end")?,
        None => period_start + Duration::days(30),
    };

    Ok((start_date, period_start, period_end))
}

/// Materialize fresh usage counters from a definition's allocations.
/// Entries without a category id cannot be tracked and are dropped.
pub(crate) fn materialize_usage(definition: &MembershipDefinition) -> Vec<UsageRecord> {
    definition
        .product_allocations
        .iter()
        .filter_map(|allocation| match &allocation.category_id {
            Some(category_id) => Some(UsageRecord::from_allocation(
                category_id.clone(),
                allocation,
            )),
            None => {
                tracing::warn!(
                    membership_id = %definition.id.0,
                    category_name = %allocation.category_name,
                    "Allocation has no category id; dropping from usage ledger"
                );
                None
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::ProviderSubscriptionStatus;
    use nutravive_shared::MembershipTier;

    fn snapshot(start: i64, period_start: Option<i64>, period_end: Option<i64>) -> SubscriptionSnapshot {
        SubscriptionSnapshot {
            id: "sub_1".to_string(),
            customer_id: "cus_1".to_string(),
            status: ProviderSubscriptionStatus::Active,
            cancel_at_period_end: false,
            start_date: start,
            current_period_start: period_start,
            current_period_end: period_end,
            price_id: Some("price_1".to_string()),
        }
    }

    #[test]
    fn test_period_defaults_when_bounds_missing() {
        let (start, period_start, period_end) =
            resolve_period(&snapshot(1_700_000_000, None, None)).unwrap();
        assert_eq!(start, period_start);
        assert_eq!(period_end, period_start + Duration::days(30));
    }

    #[test]
    fn test_period_uses_provider_bounds() {
        let (_, period_start, period_end) =
            resolve_period(&snapshot(1_700_000_000, Some(1_700_000_000), Some(1_702_592_000)))
                .unwrap();
        assert_eq!(period_start.unix_timestamp(), 1_700_000_000);
        assert_eq!(period_end.unix_timestamp(), 1_702_592_000);
    }

    #[test]
    fn test_unrepresentable_epoch_is_fatal() {
        let err = resolve_period(&snapshot(1_700_000_000, Some(1_700_000_000), Some(i64::MAX)))
            .unwrap_err();
        assert!(matches!(err, MembershipError::InvalidPeriod { .. }));
    }

    #[test]
    fn test_materialize_drops_entries_without_category() {
        use crate::store::ProductAllocation;
        let definition = MembershipDefinition {
            id: nutravive_shared::MembershipId::new(),
            tier: MembershipTier::Premium,
            price_cents: 1999,
            stripe_price_id: "price_1".to_string(),
            product_allocations: vec![
                ProductAllocation {
                    category_id: Some("c1".to_string()),
                    category_name: "Juices".to_string(),
                    quantity: 10,
                },
                ProductAllocation {
                    category_id: None,
                    category_name: "Legacy".to_string(),
                    quantity: 4,
                },
            ],
            total_subscribers: 0,
            total_revenue_cents: 0,
        };

        let usage = materialize_usage(&definition);
        assert_eq!(usage.len(), 1);
        assert_eq!(usage[0].category_id, "c1");
        assert_eq!(usage[0].allocated_quantity, 10);
        assert_eq!(usage[0].used_quantity, 0);
        assert_eq!(usage[0].available_quantity, 10);
    }
}
