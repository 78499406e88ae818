//! Postgres implementations of the storage seams
//!
//! One struct per trait, each wrapping a [`PgPool`]. The upsert here is the
//! crate's concurrency linchpin: create-detection must be atomic with the
//! write, so it rides on `ON CONFLICT ... DO UPDATE ... RETURNING (xmax = 0)`.

use async_trait::async_trait;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use time::OffsetDateTime;
use uuid::Uuid;

use nutravive_shared::{MembershipId, MembershipTier, UserId};

use crate::error::{MembershipError, MembershipResult};
use crate::store::{
    ConsultationStore, MembershipCatalog, MembershipDefinition, MembershipStore, OrderRecord,
    OrderStore, ProductAllocation, UsageRecord, UserDirectory, UserMembership, UserRecord,
};
use crate::webhooks::{ClaimOutcome, EventClaims};

fn usage_to_json(usage: &[UsageRecord]) -> MembershipResult<serde_json::Value> {
    serde_json::to_value(usage).map_err(|e| MembershipError::Internal(e.to_string()))
}

fn usage_from_json(value: serde_json::Value) -> MembershipResult<Vec<UsageRecord>> {
    serde_json::from_value(value)
        .map_err(|e| MembershipError::Database(format!("product_usage malformed: {}", e)))
}

// =============================================================================
// Memberships
// =============================================================================

pub struct PgMembershipStore {
    pool: PgPool,
}

impl PgMembershipStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn membership_from_row(row: &PgRow) -> MembershipResult<UserMembership> {
    Ok(UserMembership {
        id: row.try_get("id")?,
        user_id: UserId(row.try_get("user_id")?),
        membership_id: row
            .try_get::<Option<Uuid>, _>("membership_id")?
            .map(MembershipId),
        subscription_id: row.try_get("stripe_subscription_id")?,
        status: row.try_get("status")?,
        start_date: row.try_get("start_date")?,
        current_period_start: row.try_get("current_period_start")?,
        current_period_end: row.try_get("current_period_end")?,
        usage_reset_date: row.try_get("usage_reset_date")?,
        next_billing_date: row.try_get("next_billing_date")?,
        auto_renewal: row.try_get("auto_renewal")?,
        last_payment_date: row.try_get("last_payment_date")?,
        last_payment_amount_cents: row.try_get("last_payment_amount_cents")?,
        product_usage: usage_from_json(row.try_get("product_usage")?)?,
    })
}

const MEMBERSHIP_COLUMNS: &str = "id, user_id, membership_id, stripe_subscription_id, status, \
     start_date, current_period_start, current_period_end, usage_reset_date, \
     next_billing_date, auto_renewal, last_payment_date, last_payment_amount_cents, \
     product_usage";

#[async_trait]
impl MembershipStore for PgMembershipStore {
    async fn find_by_subscription(
        &self,
        user_id: UserId,
        subscription_id: &str,
    ) -> MembershipResult<Option<UserMembership>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM user_memberships WHERE user_id = $1 AND stripe_subscription_id = $2",
            MEMBERSHIP_COLUMNS
        ))
        .bind(user_id.0)
        .bind(subscription_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(membership_from_row).transpose()
    }

    async fn upsert(&self, row: &UserMembership) -> MembershipResult<bool> {
        // (xmax = 0) is true only for a freshly inserted row, which makes
        // create-detection atomic with the write. The conflict branch never
        // touches product_usage so a racing create cannot reset counters.
        let inserted: (bool,) = sqlx::query_as(
            r#"
            INSERT INTO user_memberships
                (id, user_id, membership_id, stripe_subscription_id, status,
                 start_date, current_period_start, current_period_end, usage_reset_date,
                 next_billing_date, auto_renewal, last_payment_date, last_payment_amount_cents,
                 product_usage, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, NOW())
            ON CONFLICT (user_id, stripe_subscription_id) DO UPDATE SET
                membership_id = COALESCE(EXCLUDED.membership_id, user_memberships.membership_id),
                status = EXCLUDED.status,
                start_date = EXCLUDED.start_date,
                current_period_start = EXCLUDED.current_period_start,
                current_period_end = EXCLUDED.current_period_end,
                usage_reset_date = EXCLUDED.usage_reset_date,
                next_billing_date = EXCLUDED.next_billing_date,
                auto_renewal = EXCLUDED.auto_renewal,
                last_payment_date = COALESCE(EXCLUDED.last_payment_date, user_memberships.last_payment_date),
                last_payment_amount_cents = COALESCE(EXCLUDED.last_payment_amount_cents, user_memberships.last_payment_amount_cents),
                updated_at = NOW()
            RETURNING (xmax = 0) AS inserted
            "#,
        )
        .bind(row.id)
        .bind(row.user_id.0)
        .bind(row.membership_id.map(|m| m.0))
        .bind(&row.subscription_id)
        .bind(row.status)
        .bind(row.start_date)
        .bind(row.current_period_start)
        .bind(row.current_period_end)
        .bind(row.usage_reset_date)
        .bind(row.next_billing_date)
        .bind(row.auto_renewal)
        .bind(row.last_payment_date)
        .bind(row.last_payment_amount_cents)
        .bind(usage_to_json(&row.product_usage)?)
        .fetch_one(&self.pool)
        .await?;

        Ok(inserted.0)
    }

    async fn update_usage(
        &self,
        user_id: UserId,
        subscription_id: &str,
        product_usage: &[UsageRecord],
    ) -> MembershipResult<()> {
        sqlx::query(
            r#"
            UPDATE user_memberships
            SET product_usage = $1, updated_at = NOW()
            WHERE user_id = $2 AND stripe_subscription_id = $3
            "#,
        )
        .bind(usage_to_json(product_usage)?)
        .bind(user_id.0)
        .bind(subscription_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn cancel_active_for_user(&self, user_id: UserId) -> MembershipResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE user_memberships
            SET status = 'cancelled', auto_renewal = FALSE,
                next_billing_date = NULL, updated_at = NOW()
            WHERE user_id = $1 AND status IN ('active', 'trialing')
            "#,
        )
        .bind(user_id.0)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn find_active_for_user(
        &self,
        user_id: UserId,
    ) -> MembershipResult<Option<UserMembership>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM user_memberships \
             WHERE user_id = $1 AND status IN ('active', 'trialing') \
             ORDER BY start_date DESC LIMIT 1",
            MEMBERSHIP_COLUMNS
        ))
        .bind(user_id.0)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(membership_from_row).transpose()
    }

    async fn list_for_user(&self, user_id: UserId) -> MembershipResult<Vec<UserMembership>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM user_memberships WHERE user_id = $1 ORDER BY start_date DESC",
            MEMBERSHIP_COLUMNS
        ))
        .bind(user_id.0)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(membership_from_row).collect()
    }
}

// =============================================================================
// Catalog
// =============================================================================

pub struct PgMembershipCatalog {
    pool: PgPool,
}

impl PgMembershipCatalog {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn definition_from_row(row: &PgRow) -> MembershipResult<MembershipDefinition> {
    let tier: String = row.try_get("tier")?;
    let tier = tier
        .parse::<MembershipTier>()
        .map_err(|e| MembershipError::Database(e.to_string()))?;
    let allocations: Vec<ProductAllocation> =
        serde_json::from_value(row.try_get("product_allocations")?)
            .map_err(|e| MembershipError::Database(format!("product_allocations malformed: {}", e)))?;

    Ok(MembershipDefinition {
        id: MembershipId(row.try_get("id")?),
        tier,
        price_cents: row.try_get("price_cents")?,
        stripe_price_id: row.try_get("stripe_price_id")?,
        product_allocations: allocations,
        total_subscribers: row.try_get("total_subscribers")?,
        total_revenue_cents: row.try_get("total_revenue_cents")?,
    })
}

const DEFINITION_COLUMNS: &str = "id, tier, price_cents, stripe_price_id, product_allocations, \
     total_subscribers, total_revenue_cents";

#[async_trait]
impl MembershipCatalog for PgMembershipCatalog {
    async fn find_by_price_id(
        &self,
        price_id: &str,
    ) -> MembershipResult<Option<MembershipDefinition>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM membership_definitions WHERE stripe_price_id = $1",
            DEFINITION_COLUMNS
        ))
        .bind(price_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(definition_from_row).transpose()
    }

    async fn find_by_id(&self, id: MembershipId) -> MembershipResult<Option<MembershipDefinition>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM membership_definitions WHERE id = $1",
            DEFINITION_COLUMNS
        ))
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(definition_from_row).transpose()
    }

    async fn record_new_subscriber(
        &self,
        id: MembershipId,
        price_cents: i64,
    ) -> MembershipResult<()> {
        sqlx::query(
            r#"
            UPDATE membership_definitions
            SET total_subscribers = total_subscribers + 1,
                total_revenue_cents = total_revenue_cents + $1,
                updated_at = NOW()
            WHERE id = $2
            "#,
        )
        .bind(price_cents)
        .bind(id.0)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

// =============================================================================
// Users
// =============================================================================

pub struct PgUserDirectory {
    pool: PgPool,
}

impl PgUserDirectory {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn find_where(&self, clause: &str, value: &str) -> MembershipResult<Option<UserRecord>> {
        let row = sqlx::query(&format!(
            "SELECT id, email, external_id, stripe_customer_id FROM users WHERE {}",
            clause
        ))
        .bind(value)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| user_from_row(&row)).transpose()
    }
}

fn user_from_row(row: &PgRow) -> MembershipResult<UserRecord> {
    Ok(UserRecord {
        id: UserId(row.try_get("id")?),
        email: row.try_get("email")?,
        external_id: row.try_get("external_id")?,
        stripe_customer_id: row.try_get("stripe_customer_id")?,
    })
}

#[async_trait]
impl UserDirectory for PgUserDirectory {
    async fn find_by_id(&self, user_id: UserId) -> MembershipResult<Option<UserRecord>> {
        let row = sqlx::query(
            "SELECT id, email, external_id, stripe_customer_id FROM users WHERE id = $1",
        )
        .bind(user_id.0)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| user_from_row(&row)).transpose()
    }

    async fn find_by_external_id(
        &self,
        external_id: &str,
    ) -> MembershipResult<Option<UserRecord>> {
        self.find_where("external_id = $1", external_id).await
    }

    async fn find_by_payment_customer_id(
        &self,
        customer_id: &str,
    ) -> MembershipResult<Option<UserRecord>> {
        self.find_where("stripe_customer_id = $1", customer_id)
            .await
    }

    async fn find_by_email(&self, email: &str) -> MembershipResult<Option<UserRecord>> {
        self.find_where("LOWER(email) = LOWER($1)", email).await
    }

    async fn set_payment_customer_id(
        &self,
        user_id: UserId,
        customer_id: &str,
    ) -> MembershipResult<()> {
        sqlx::query("UPDATE users SET stripe_customer_id = $1, updated_at = NOW() WHERE id = $2")
            .bind(customer_id)
            .bind(user_id.0)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn set_external_id(&self, user_id: UserId, external_id: &str) -> MembershipResult<()> {
        sqlx::query("UPDATE users SET external_id = $1, updated_at = NOW() WHERE id = $2")
            .bind(external_id)
            .bind(user_id.0)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

// =============================================================================
// Orders / consultations
// =============================================================================

pub struct PgOrderStore {
    pool: PgPool,
}

impl PgOrderStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl OrderStore for PgOrderStore {
    async fn find_by_order_number_for_user(
        &self,
        order_number: &str,
        user_id: UserId,
        email: &str,
    ) -> MembershipResult<Option<OrderRecord>> {
        let row = sqlx::query(
            r#"
            SELECT order_number, user_id, email FROM orders
            WHERE order_number = $1 AND (user_id = $2 OR LOWER(email) = LOWER($3))
            "#,
        )
        .bind(order_number)
        .bind(user_id.0)
        .bind(email)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|row| {
            Ok::<_, MembershipError>(OrderRecord {
                order_number: row.try_get("order_number")?,
                user_id: row.try_get::<Option<Uuid>, _>("user_id")?.map(UserId),
                email: row.try_get("email")?,
            })
        })
        .transpose()?)
    }
}

pub struct PgConsultationStore {
    pool: PgPool,
}

impl PgConsultationStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ConsultationStore for PgConsultationStore {
    async fn mark_payment_succeeded(&self, submission_id: &str) -> MembershipResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE consultations
            SET payment_status = 'paid', updated_at = NOW()
            WHERE submission_id = $1
            "#,
        )
        .bind(submission_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }
}

// =============================================================================
// Webhook event claims
// =============================================================================

pub struct PgEventClaims {
    pool: PgPool,
}

impl PgEventClaims {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

/// Events stuck in processing longer than this may be re-claimed
const PROCESSING_TIMEOUT_MINUTES: i32 = 30;

#[async_trait]
impl EventClaims for PgEventClaims {
    async fn claim(
        &self,
        event_id: &str,
        event_type: &str,
        event_timestamp: OffsetDateTime,
    ) -> MembershipResult<bool> {
        // Exactly one concurrent delivery gets a row back. The conflict
        // branch only fires for timed-out claims, which covers workers that
        // died mid-event.
        let claimed: Option<(Uuid,)> = sqlx::query_as(
            r#"
            INSERT INTO stripe_webhook_events
                (stripe_event_id, event_type, event_timestamp, processing_result, processing_started_at)
            VALUES ($1, $2, $3, 'processing', NOW())
            ON CONFLICT (stripe_event_id) DO UPDATE SET
                processing_result = 'processing',
                processing_started_at = NOW()
            WHERE stripe_webhook_events.processing_result = 'processing'
              AND stripe_webhook_events.processing_started_at < NOW() - ($4 || ' minutes')::INTERVAL
            RETURNING id
            "#,
        )
        .bind(event_id)
        .bind(event_type)
        .bind(event_timestamp)
        .bind(PROCESSING_TIMEOUT_MINUTES)
        .fetch_optional(&self.pool)
        .await?;

        Ok(claimed.is_some())
    }

    async fn complete(
        &self,
        event_id: &str,
        outcome: ClaimOutcome,
        error_message: Option<&str>,
    ) -> MembershipResult<()> {
        let result = match outcome {
            ClaimOutcome::Success => "success",
            ClaimOutcome::Error => "error",
        };
        sqlx::query(
            r#"
            UPDATE stripe_webhook_events
            SET processing_result = $1, error_message = $2
            WHERE stripe_event_id = $3
            "#,
        )
        .bind(result)
        .bind(error_message)
        .bind(event_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
