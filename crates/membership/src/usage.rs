//! Usage accounting ledger
//!
//! Debits category allocations on a member's active membership when an
//! order ships, and answers usage analytics queries. All mutations are
//! scoped to one membership row and persisted in a single write.

use std::sync::Arc;

use serde::Serialize;
use time::OffsetDateTime;

use nutravive_shared::{MembershipStatus, UserId};

use crate::error::{MembershipError, MembershipResult};
use crate::store::{MembershipStore, OrderStore, UsageRecord, UserDirectory, UserMembership};

/// One line of an order being applied against the ledger
#[derive(Debug, Clone)]
pub struct UsageItemInput {
    pub category_id: String,
    pub category_name: String,
    pub product_name: String,
    pub quantity: i32,
}

/// Per-item outcome of a usage application
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemUsageChange {
    pub category_id: String,
    pub category_name: String,
    pub previous_used: i32,
    pub new_used: i32,
    pub remaining: i32,
}

/// Aggregate counters across every category on the membership
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageTotals {
    pub total_allocated: i32,
    pub total_used: i32,
    pub total_remaining: i32,
    pub usage_percentage: i32,
}

/// Result of applying one order's items against the ledger
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageUpdateResult {
    pub order_number: String,
    pub items: Vec<ItemUsageChange>,
    pub totals: UsageTotals,
}

/// Consumption level tag for a category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum UsageLevel {
    Exhausted,
    High,
    Medium,
    Low,
}

impl UsageLevel {
    /// exhausted at used >= allocated, high above 80%, medium above 50%
    fn for_counts(allocated: i32, used: i32) -> Self {
        if used >= allocated {
            return Self::Exhausted;
        }
        let percentage = usage_percentage(allocated, used);
        if percentage > 80 {
            Self::High
        } else if percentage > 50 {
            Self::Medium
        } else {
            Self::Low
        }
    }
}

/// Per-category analytics row
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CategoryUsage {
    pub category_id: String,
    pub category_name: String,
    pub allocated_quantity: i32,
    pub used_quantity: i32,
    pub available_quantity: i32,
    pub usage_percentage: i32,
    pub level: UsageLevel,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_used: Option<OffsetDateTime>,
}

/// Derived trend lists over one membership's categories
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageTrends {
    /// Category ids above 80% consumption
    pub near_limit: Vec<String>,
    /// Category ids with zero usage
    pub unused: Vec<String>,
    /// Highest absolute used quantity; first encountered wins ties
    pub top_category: Option<String>,
}

/// Analytics for one membership
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageAnalytics {
    pub subscription_id: String,
    pub status: MembershipStatus,
    #[serde(with = "time::serde::rfc3339")]
    pub period_start: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub period_end: OffsetDateTime,
    pub categories: Vec<CategoryUsage>,
    pub totals: UsageTotals,
    pub trends: UsageTrends,
}

/// Which memberships a usage query covers
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum UsagePeriod {
    /// Active membership only
    #[default]
    Current,
    /// Every membership row on record for the user
    All,
}

/// Filters for [`UsageLedger::get_usage`]
#[derive(Debug, Clone, Default)]
pub struct UsageFilters {
    pub period: UsagePeriod,
    pub category_id: Option<String>,
    /// Restrict to memberships whose billing period overlaps this range
    pub date_range: Option<(OffsetDateTime, OffsetDateTime)>,
}

/// Usage accounting ledger
pub struct UsageLedger {
    memberships: Arc<dyn MembershipStore>,
    orders: Arc<dyn OrderStore>,
    directory: Arc<dyn UserDirectory>,
}

impl UsageLedger {
    pub fn new(
        memberships: Arc<dyn MembershipStore>,
        orders: Arc<dyn OrderStore>,
        directory: Arc<dyn UserDirectory>,
    ) -> Self {
        Self {
            memberships,
            orders,
            directory,
        }
    }

    /// Apply one order's items against the user's active membership.
    ///
    /// Fails without mutation when the user has no active membership or the
    /// order does not belong to them. Items whose category has no
    /// allocation are skipped with a warning; they are not an error for the
    /// request. The membership is persisted exactly once.
    pub async fn apply_usage(
        &self,
        user_id: UserId,
        order_number: &str,
        items: &[UsageItemInput],
    ) -> MembershipResult<UsageUpdateResult> {
        let user = self
            .directory
            .find_by_id(user_id)
            .await?
            .ok_or_else(|| MembershipError::UnresolvedUser(user_id.0.to_string()))?;

        let mut membership = self
            .memberships
            .find_active_for_user(user_id)
            .await?
            .ok_or_else(|| MembershipError::NoActiveMembership(user_id.0.to_string()))?;

        self.orders
            .find_by_order_number_for_user(order_number, user_id, &user.email)
            .await?
            .ok_or_else(|| MembershipError::OrderNotAuthorized(order_number.to_string()))?;

        let now = OffsetDateTime::now_utc();
        let mut changes = Vec::with_capacity(items.len());

        for item in items {
            let record = membership
                .product_usage
                .iter_mut()
                .find(|r| r.category_id == item.category_id);
            match record {
                Some(record) => {
                    let previous_used = record.used_quantity;
                    record.used_quantity += item.quantity;
                    record.recompute_available();
                    record.last_used = Some(now);
                    changes.push(ItemUsageChange {
                        category_id: record.category_id.clone(),
                        category_name: record.category_name.clone(),
                        previous_used,
                        new_used: record.used_quantity,
                        remaining: record.available_quantity,
                    });
                }
                None => {
                    tracing::warn!(
                        user_id = %user_id.0,
                        order_number = %order_number,
                        category_id = %item.category_id,
                        product_name = %item.product_name,
                        "No allocation for category; item skipped"
                    );
                }
            }
        }

        if !changes.is_empty() {
            self.memberships
                .update_usage(user_id, &membership.subscription_id, &membership.product_usage)
                .await?;
        } else {
            tracing::info!(
                user_id = %user_id.0,
                order_number = %order_number,
                "No items matched an allocation; ledger unchanged"
            );
        }

        tracing::info!(
            user_id = %user_id.0,
            order_number = %order_number,
            items_applied = changes.len(),
            items_total = items.len(),
            "Usage applied"
        );

        Ok(UsageUpdateResult {
            order_number: order_number.to_string(),
            items: changes,
            totals: totals(&membership.product_usage),
        })
    }

    /// Usage analytics per membership, filtered per [`UsageFilters`].
    pub async fn get_usage(
        &self,
        user_id: UserId,
        filters: &UsageFilters,
    ) -> MembershipResult<Vec<UsageAnalytics>> {
        let memberships = match filters.period {
            UsagePeriod::Current => self
                .memberships
                .find_active_for_user(user_id)
                .await?
                .into_iter()
                .collect(),
            UsagePeriod::All => self.memberships.list_for_user(user_id).await?,
        };

        Ok(memberships
            .iter()
            .filter(|m| match filters.date_range {
                Some((from, to)) => m.current_period_start <= to && m.current_period_end >= from,
                None => true,
            })
            .map(|m| analyze(m, filters.category_id.as_deref()))
            .collect())
    }
}

fn usage_percentage(allocated: i32, used: i32) -> i32 {
    if allocated <= 0 {
        return 0;
    }
    ((f64::from(used) / f64::from(allocated)) * 100.0).round() as i32
}

fn totals(usage: &[UsageRecord]) -> UsageTotals {
    let total_allocated: i32 = usage.iter().map(|r| r.allocated_quantity).sum();
    let total_used: i32 = usage.iter().map(|r| r.used_quantity).sum();
    let total_remaining: i32 = usage.iter().map(|r| r.available_quantity).sum();
    UsageTotals {
        total_allocated,
        total_used,
        total_remaining,
        usage_percentage: usage_percentage(total_allocated, total_used),
    }
}

fn analyze(membership: &UserMembership, category_filter: Option<&str>) -> UsageAnalytics {
    let categories: Vec<CategoryUsage> = membership
        .product_usage
        .iter()
        .filter(|r| category_filter.is_none_or(|c| r.category_id == c))
        .map(|r| CategoryUsage {
            category_id: r.category_id.clone(),
            category_name: r.category_name.clone(),
            allocated_quantity: r.allocated_quantity,
            used_quantity: r.used_quantity,
            available_quantity: r.available_quantity,
            usage_percentage: usage_percentage(r.allocated_quantity, r.used_quantity),
            level: UsageLevel::for_counts(r.allocated_quantity, r.used_quantity),
            last_used: r.last_used,
        })
        .collect();

    let near_limit = categories
        .iter()
        .filter(|c| c.usage_percentage > 80)
        .map(|c| c.category_id.clone())
        .collect();
    let unused = categories
        .iter()
        .filter(|c| c.used_quantity == 0)
        .map(|c| c.category_id.clone())
        .collect();
    // First encountered wins ties, so max_by (last-wins) does not fit here
    let top_category = categories
        .iter()
        .fold(None::<&CategoryUsage>, |best, c| match best {
            Some(b) if b.used_quantity >= c.used_quantity => Some(b),
            _ => Some(c),
        })
        .filter(|c| c.used_quantity > 0)
        .map(|c| c.category_id.clone());

    // Totals cover the same filtered set as the category rows
    let total_allocated: i32 = categories.iter().map(|c| c.allocated_quantity).sum();
    let total_used: i32 = categories.iter().map(|c| c.used_quantity).sum();
    let total_remaining: i32 = categories.iter().map(|c| c.available_quantity).sum();
    let totals = UsageTotals {
        total_allocated,
        total_used,
        total_remaining,
        usage_percentage: usage_percentage(total_allocated, total_used),
    };

    UsageAnalytics {
        subscription_id: membership.subscription_id.clone(),
        status: membership.status,
        period_start: membership.current_period_start,
        period_end: membership.current_period_end,
        categories,
        totals,
        trends: UsageTrends {
            near_limit,
            unused,
            top_category,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(category_id: &str, allocated: i32, used: i32) -> UsageRecord {
        let mut r = UsageRecord {
            category_id: category_id.to_string(),
            category_name: category_id.to_uppercase(),
            allocated_quantity: allocated,
            used_quantity: used,
            available_quantity: 0,
            last_used: None,
        };
        r.recompute_available();
        r
    }

    #[test]
    fn test_percentage_guards_zero_allocation() {
        assert_eq!(usage_percentage(0, 5), 0);
        assert_eq!(usage_percentage(10, 10), 100);
        assert_eq!(usage_percentage(10, 3), 30);
        assert_eq!(usage_percentage(3, 1), 33);
    }

    #[test]
    fn test_level_boundaries() {
        assert_eq!(UsageLevel::for_counts(10, 10), UsageLevel::Exhausted);
        assert_eq!(UsageLevel::for_counts(10, 12), UsageLevel::Exhausted);
        assert_eq!(UsageLevel::for_counts(10, 9), UsageLevel::High);
        assert_eq!(UsageLevel::for_counts(10, 8), UsageLevel::Medium);
        assert_eq!(UsageLevel::for_counts(10, 6), UsageLevel::Medium);
        assert_eq!(UsageLevel::for_counts(10, 2), UsageLevel::Low);
    }

    #[test]
    fn test_totals_aggregate() {
        let usage = vec![record("c1", 10, 3), record("c2", 5, 5)];
        let t = totals(&usage);
        assert_eq!(t.total_allocated, 15);
        assert_eq!(t.total_used, 8);
        assert_eq!(t.total_remaining, 7);
        assert_eq!(t.usage_percentage, 53);
    }

    #[test]
    fn test_top_category_tie_break_is_first_encountered() {
        let membership = membership_with(vec![record("c1", 10, 4), record("c2", 10, 4)]);
        let analytics = analyze(&membership, None);
        assert_eq!(analytics.trends.top_category.as_deref(), Some("c1"));
    }

    #[test]
    fn test_category_filter_scopes_totals() {
        let membership = membership_with(vec![record("c1", 10, 4), record("c2", 20, 5)]);
        let analytics = analyze(&membership, Some("c1"));
        assert_eq!(analytics.categories.len(), 1);
        assert_eq!(analytics.totals.total_allocated, 10);
        assert_eq!(analytics.totals.total_used, 4);
        assert_eq!(analytics.totals.total_remaining, 6);
        assert_eq!(analytics.totals.usage_percentage, 40);
        assert_eq!(analytics.trends.top_category.as_deref(), Some("c1"));
    }

    #[test]
    fn test_trends_lists() {
        let membership = membership_with(vec![
            record("c1", 10, 9),
            record("c2", 10, 0),
            record("c3", 10, 5),
        ]);
        let analytics = analyze(&membership, None);
        assert_eq!(analytics.trends.near_limit, vec!["c1".to_string()]);
        assert_eq!(analytics.trends.unused, vec!["c2".to_string()]);
        assert_eq!(analytics.trends.top_category.as_deref(), Some("c1"));
    }

    fn membership_with(usage: Vec<UsageRecord>) -> UserMembership {
        let now = OffsetDateTime::now_utc();
        UserMembership {
            id: uuid::Uuid::new_v4(),
            user_id: UserId::new(),
            membership_id: None,
            subscription_id: "sub_1".to_string(),
            status: MembershipStatus::Active,
            start_date: now,
            current_period_start: now,
            current_period_end: now + time::Duration::days(30),
            usage_reset_date: now + time::Duration::days(30),
            next_billing_date: Some(now + time::Duration::days(30)),
            auto_renewal: true,
            last_payment_date: None,
            last_payment_amount_cents: None,
            product_usage: usage,
        }
    }
}
