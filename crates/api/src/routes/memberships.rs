//! Membership endpoints

use axum::{
    extract::{Query, State},
    Json,
};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use nutravive_membership::{CheckoutSessionRef, UserMembership};
use nutravive_shared::{MembershipId, MembershipStatus, UserId};

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct UserQuery {
    pub user_id: Uuid,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MembershipResponse {
    pub id: Uuid,
    pub membership_id: Option<Uuid>,
    pub subscription_id: String,
    pub status: MembershipStatus,
    #[serde(with = "time::serde::rfc3339")]
    pub start_date: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub current_period_start: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub current_period_end: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub usage_reset_date: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub next_billing_date: Option<OffsetDateTime>,
    pub auto_renewal: bool,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_payment_date: Option<OffsetDateTime>,
    pub last_payment_amount_cents: Option<i64>,
    pub product_usage: Vec<nutravive_membership::UsageRecord>,
}

impl From<UserMembership> for MembershipResponse {
    fn from(m: UserMembership) -> Self {
        Self {
            id: m.id,
            membership_id: m.membership_id.map(|id| id.0),
            subscription_id: m.subscription_id,
            status: m.status,
            start_date: m.start_date,
            current_period_start: m.current_period_start,
            current_period_end: m.current_period_end,
            usage_reset_date: m.usage_reset_date,
            next_billing_date: m.next_billing_date,
            auto_renewal: m.auto_renewal,
            last_payment_date: m.last_payment_date,
            last_payment_amount_cents: m.last_payment_amount_cents,
            product_usage: m.product_usage,
        }
    }
}

/// Get the caller's active membership
pub async fn current_membership(
    State(state): State<AppState>,
    Query(query): Query<UserQuery>,
) -> ApiResult<Json<MembershipResponse>> {
    let membership = state
        .memberships
        .find_active_for_user(UserId(query.user_id))
        .await?
        .ok_or(ApiError::NoActiveMembership)?;

    Ok(Json(membership.into()))
}

/// List every membership row on record for the caller
pub async fn list_memberships(
    State(state): State<AppState>,
    Query(query): Query<UserQuery>,
) -> ApiResult<Json<Vec<MembershipResponse>>> {
    let memberships = state
        .memberships
        .list_for_user(UserId(query.user_id))
        .await?;

    Ok(Json(memberships.into_iter().map(Into::into).collect()))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckoutRequest {
    pub user_id: Uuid,
    pub membership_id: Uuid,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckoutResponse {
    pub session_id: String,
    pub url: Option<String>,
}

/// Create a membership checkout session
pub async fn create_checkout(
    State(state): State<AppState>,
    Json(request): Json<CheckoutRequest>,
) -> ApiResult<Json<CheckoutResponse>> {
    let session: CheckoutSessionRef = state
        .checkout
        .create_membership_checkout(
            UserId(request.user_id),
            MembershipId(request.membership_id),
        )
        .await?;

    Ok(Json(CheckoutResponse {
        session_id: session.id,
        url: session.url,
    }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncRequest {
    pub customer_id: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncResponse {
    pub user_id: Option<Uuid>,
    pub membership: Option<MembershipResponse>,
    pub subscription_id: Option<String>,
}

/// Force a reconciliation for one customer (admin/support tooling)
pub async fn sync_customer(
    State(state): State<AppState>,
    Json(request): Json<SyncRequest>,
) -> ApiResult<Json<SyncResponse>> {
    let snapshot = state.engine.try_sync(&request.customer_id).await?;

    Ok(Json(match snapshot {
        Some(snapshot) => SyncResponse {
            user_id: Some(snapshot.user_id.0),
            membership: snapshot.membership.map(Into::into),
            subscription_id: snapshot.subscription.map(|s| s.id),
        },
        None => SyncResponse {
            user_id: None,
            membership: None,
            subscription_id: None,
        },
    }))
}

/// Run membership invariant checks (admin/support tooling)
pub async fn run_invariants(
    State(state): State<AppState>,
) -> ApiResult<Json<nutravive_membership::InvariantCheckSummary>> {
    let summary = state.invariants.run_all_checks().await?;
    Ok(Json(summary))
}
