//! Membership invariants
//!
//! Runnable consistency checks over the membership tables. Meant to be run
//! after webhook replays or data migrations; checks only read, never write.

use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::MembershipResult;

/// Result of a single failed invariant check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantViolation {
    /// Which invariant was violated
    pub invariant: String,
    /// Affected user ids
    pub user_ids: Vec<Uuid>,
    /// Human-readable description of the violation
    pub description: String,
    /// Additional context for debugging
    pub context: serde_json::Value,
    pub severity: ViolationSeverity,
}

/// Severity of an invariant violation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViolationSeverity {
    /// Billing or entitlement may be wrong right now
    Critical,
    /// Data inconsistency that needs attention
    High,
    /// Potential issue, should investigate
    Medium,
    /// Minor inconsistency, informational
    Low,
}

impl std::fmt::Display for ViolationSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ViolationSeverity::Critical => write!(f, "CRITICAL"),
            ViolationSeverity::High => write!(f, "HIGH"),
            ViolationSeverity::Medium => write!(f, "MEDIUM"),
            ViolationSeverity::Low => write!(f, "LOW"),
        }
    }
}

/// Summary of a full invariant run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantCheckSummary {
    pub checked_at: OffsetDateTime,
    pub checks_run: usize,
    pub checks_passed: usize,
    pub checks_failed: usize,
    pub violations: Vec<InvariantViolation>,
    pub healthy: bool,
}

#[derive(Debug, sqlx::FromRow)]
struct DuplicateSubscriptionRow {
    user_id: Uuid,
    stripe_subscription_id: String,
    row_count: i64,
}

#[derive(Debug, sqlx::FromRow)]
struct UsageFloorRow {
    user_id: Uuid,
    stripe_subscription_id: String,
    category_id: String,
    allocated: i32,
    used: i32,
    available: i32,
}

#[derive(Debug, sqlx::FromRow)]
struct PeriodOrderRow {
    user_id: Uuid,
    stripe_subscription_id: String,
    current_period_start: OffsetDateTime,
    current_period_end: OffsetDateTime,
}

#[derive(Debug, sqlx::FromRow)]
struct RenewalMismatchRow {
    user_id: Uuid,
    stripe_subscription_id: String,
    auto_renewal: bool,
}

#[derive(Debug, sqlx::FromRow)]
struct MissingCustomerRow {
    user_id: Uuid,
    email: String,
    stripe_subscription_id: String,
}

/// Service for running membership invariant checks
pub struct InvariantChecker {
    pool: PgPool,
}

impl InvariantChecker {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run all invariant checks and return a summary
    pub async fn run_all_checks(&self) -> MembershipResult<InvariantCheckSummary> {
        let now = OffsetDateTime::now_utc();
        let mut violations = Vec::new();

        violations.extend(self.check_unique_subscription_rows().await?);
        violations.extend(self.check_usage_floor().await?);
        violations.extend(self.check_period_ordering().await?);
        violations.extend(self.check_renewal_billing_consistency().await?);
        violations.extend(self.check_entitled_user_has_customer().await?);

        let checks_run = 5;
        let checks_failed = violations
            .iter()
            .map(|v| &v.invariant)
            .collect::<std::collections::HashSet<_>>()
            .len();
        let checks_passed = checks_run - checks_failed;

        Ok(InvariantCheckSummary {
            checked_at: now,
            checks_run,
            checks_passed,
            checks_failed,
            healthy: violations.is_empty(),
            violations,
        })
    }

    /// Invariant 1: one row per (user, subscription).
    ///
    /// The unique index enforces this; a violation means the index was
    /// dropped or the table was loaded around it.
    async fn check_unique_subscription_rows(&self) -> MembershipResult<Vec<InvariantViolation>> {
        let rows: Vec<DuplicateSubscriptionRow> = sqlx::query_as(
            r#"
            SELECT user_id, stripe_subscription_id, COUNT(*) as row_count
            FROM user_memberships
            GROUP BY user_id, stripe_subscription_id
            HAVING COUNT(*) > 1
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "unique_subscription_rows".to_string(),
                user_ids: vec![row.user_id],
                description: format!(
                    "{} rows share subscription '{}' (expected 1)",
                    row.row_count, row.stripe_subscription_id
                ),
                context: serde_json::json!({
                    "stripe_subscription_id": row.stripe_subscription_id,
                    "row_count": row.row_count,
                }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    /// Invariant 2: available == max(0, allocated - used) for every
    /// usage record.
    async fn check_usage_floor(&self) -> MembershipResult<Vec<InvariantViolation>> {
        let rows: Vec<UsageFloorRow> = sqlx::query_as(
            r#"
            SELECT
                m.user_id,
                m.stripe_subscription_id,
                u->>'categoryId' as category_id,
                (u->>'allocatedQuantity')::INT as allocated,
                (u->>'usedQuantity')::INT as used,
                (u->>'availableQuantity')::INT as available
            FROM user_memberships m,
                 jsonb_array_elements(m.product_usage) u
            WHERE (u->>'availableQuantity')::INT
                  != GREATEST(0, (u->>'allocatedQuantity')::INT - (u->>'usedQuantity')::INT)
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "usage_floor".to_string(),
                user_ids: vec![row.user_id],
                description: format!(
                    "Category '{}' has available={} but allocated={} used={}",
                    row.category_id, row.available, row.allocated, row.used
                ),
                context: serde_json::json!({
                    "stripe_subscription_id": row.stripe_subscription_id,
                    "category_id": row.category_id,
                    "allocated": row.allocated,
                    "used": row.used,
                    "available": row.available,
                }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    /// Invariant 3: billing periods are ordered
    async fn check_period_ordering(&self) -> MembershipResult<Vec<InvariantViolation>> {
        let rows: Vec<PeriodOrderRow> = sqlx::query_as(
            r#"
            SELECT user_id, stripe_subscription_id, current_period_start, current_period_end
            FROM user_memberships
            WHERE current_period_end <= current_period_start
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "period_ordering".to_string(),
                user_ids: vec![row.user_id],
                description: format!(
                    "Subscription '{}' has period end {} at or before start {}",
                    row.stripe_subscription_id, row.current_period_end, row.current_period_start
                ),
                context: serde_json::json!({
                    "stripe_subscription_id": row.stripe_subscription_id,
                }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    /// Invariant 4: next_billing_date is set exactly when auto_renewal is on
    async fn check_renewal_billing_consistency(
        &self,
    ) -> MembershipResult<Vec<InvariantViolation>> {
        let rows: Vec<RenewalMismatchRow> = sqlx::query_as(
            r#"
            SELECT user_id, stripe_subscription_id, auto_renewal
            FROM user_memberships
            WHERE status IN ('active', 'trialing')
              AND (auto_renewal = (next_billing_date IS NULL))
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "renewal_billing_consistency".to_string(),
                user_ids: vec![row.user_id],
                description: format!(
                    "Subscription '{}' has auto_renewal={} but next_billing_date presence disagrees",
                    row.stripe_subscription_id, row.auto_renewal
                ),
                context: serde_json::json!({
                    "stripe_subscription_id": row.stripe_subscription_id,
                    "auto_renewal": row.auto_renewal,
                }),
                severity: ViolationSeverity::Medium,
            })
            .collect())
    }

    /// Invariant 5: entitled members are linked to a payment customer.
    ///
    /// An active membership without a stored customer id means sync can no
    /// longer find the user from a webhook.
    async fn check_entitled_user_has_customer(&self) -> MembershipResult<Vec<InvariantViolation>> {
        let rows: Vec<MissingCustomerRow> = sqlx::query_as(
            r#"
            SELECT u.id as user_id, u.email, m.stripe_subscription_id
            FROM user_memberships m
            JOIN users u ON u.id = m.user_id
            WHERE m.status IN ('active', 'trialing')
              AND u.stripe_customer_id IS NULL
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "entitled_user_has_customer".to_string(),
                user_ids: vec![row.user_id],
                description: format!(
                    "User '{}' holds subscription '{}' but has no payment customer id",
                    row.email, row.stripe_subscription_id
                ),
                context: serde_json::json!({
                    "email": row.email,
                    "stripe_subscription_id": row.stripe_subscription_id,
                }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }
}
