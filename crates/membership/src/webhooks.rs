//! Stripe webhook router
//!
//! Verifies signatures, claims events for at-most-once processing, and
//! routes each event type to the reconciliation engine or a dedicated
//! flow. Handlers are written to be safe under Stripe's at-least-once,
//! unordered delivery: every path either reconciles from current provider
//! state or performs an idempotent update.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use time::OffsetDateTime;
use uuid::Uuid;

use nutravive_shared::{MembershipId, UserId};

use crate::error::{MembershipError, MembershipResult};
use crate::provider::{Notification, NotificationSender, NotificationTemplate, PaymentProvider};
use crate::store::{ConsultationStore, MembershipCatalog, UserDirectory, UserRecord};
use crate::sync::ReconciliationEngine;

type HmacSha256 = Hmac<Sha256>;

/// Signature timestamp tolerance in seconds
const SIGNATURE_TOLERANCE_SECS: i64 = 300;

// =============================================================================
// Event envelope
// =============================================================================

/// Verified webhook event, parsed just far enough to route
#[derive(Debug, Clone, Deserialize)]
pub struct EventEnvelope {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub created: i64,
    pub data: EventData,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EventData {
    pub object: serde_json::Value,
}

/// Stripe reference fields arrive either as a bare id string or as an
/// expanded object carrying an id
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ExpandableId {
    Id(String),
    Object { id: String },
}

impl ExpandableId {
    pub fn id(&self) -> &str {
        match self {
            Self::Id(id) => id,
            Self::Object { id } => id,
        }
    }
}

#[derive(Debug, Deserialize)]
struct SubscriptionObject {
    customer: ExpandableId,
}

#[derive(Debug, Deserialize)]
struct InvoiceObject {
    customer: Option<ExpandableId>,
}

#[derive(Debug, Deserialize)]
struct ChargeObject {
    customer: Option<ExpandableId>,
}

#[derive(Debug, Deserialize)]
struct PaymentIntentObject {
    #[serde(default)]
    metadata: HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct CheckoutSessionObject {
    customer: Option<ExpandableId>,
    subscription: Option<ExpandableId>,
    #[serde(default)]
    metadata: HashMap<String, String>,
    customer_details: Option<CheckoutCustomerDetails>,
}

#[derive(Debug, Deserialize)]
struct CheckoutCustomerDetails {
    email: Option<String>,
}

// =============================================================================
// Event claims (idempotency audit)
// =============================================================================

/// Outcome recorded against a claimed event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimOutcome {
    Success,
    Error,
}

/// Atomic claim store for webhook events.
///
/// `claim` must be atomic with respect to concurrent deliveries of the same
/// event id: exactly one caller gets true. Processing is belt-and-braces on
/// top of this claim, so handlers stay idempotent regardless.
#[async_trait]
pub trait EventClaims: Send + Sync {
    async fn claim(
        &self,
        event_id: &str,
        event_type: &str,
        event_timestamp: OffsetDateTime,
    ) -> MembershipResult<bool>;

    async fn complete(
        &self,
        event_id: &str,
        outcome: ClaimOutcome,
        error_message: Option<&str>,
    ) -> MembershipResult<()>;
}

// =============================================================================
// Router
// =============================================================================

/// Webhook router
pub struct WebhookRouter {
    webhook_secret: String,
    ops_email: String,
    engine: Arc<ReconciliationEngine>,
    provider: Arc<dyn PaymentProvider>,
    directory: Arc<dyn UserDirectory>,
    catalog: Arc<dyn MembershipCatalog>,
    consultations: Arc<dyn ConsultationStore>,
    notifier: Arc<dyn NotificationSender>,
    claims: Option<Arc<dyn EventClaims>>,
}

impl WebhookRouter {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        webhook_secret: String,
        ops_email: String,
        engine: Arc<ReconciliationEngine>,
        provider: Arc<dyn PaymentProvider>,
        directory: Arc<dyn UserDirectory>,
        catalog: Arc<dyn MembershipCatalog>,
        consultations: Arc<dyn ConsultationStore>,
        notifier: Arc<dyn NotificationSender>,
    ) -> Self {
        Self {
            webhook_secret,
            ops_email,
            engine,
            provider,
            directory,
            catalog,
            consultations,
            notifier,
            claims: None,
        }
    }

    /// Enable the durable idempotency claim on top of handler idempotency
    pub fn with_claims(mut self, claims: Arc<dyn EventClaims>) -> Self {
        self.claims = Some(claims);
        self
    }

    /// Verify the Stripe signature header and parse the event envelope.
    ///
    /// Manual verification: parse `t=...,v1=...` from the header, check the
    /// timestamp against the tolerance window, then HMAC-SHA256 the signed
    /// payload with the endpoint secret.
    pub fn verify_event(&self, payload: &str, signature: &str) -> MembershipResult<EventEnvelope> {
        let mut timestamp: Option<i64> = None;
        let mut v1_signature: Option<String> = None;

        for part in signature.split(',') {
            let kv: Vec<&str> = part.splitn(2, '=').collect();
            if kv.len() == 2 {
                match kv[0] {
                    "t" => timestamp = kv[1].parse().ok(),
                    "v1" => v1_signature = Some(kv[1].to_string()),
                    _ => {}
                }
            }
        }

        let timestamp = timestamp.ok_or_else(|| {
            tracing::error!("Missing timestamp in signature header");
            MembershipError::WebhookSignatureInvalid
        })?;

        let v1_signature = v1_signature.ok_or_else(|| {
            tracing::error!("Missing v1 signature in signature header");
            MembershipError::WebhookSignatureInvalid
        })?;

        let now = OffsetDateTime::now_utc().unix_timestamp();
        if (now - timestamp).abs() > SIGNATURE_TOLERANCE_SECS {
            tracing::error!(
                timestamp = timestamp,
                now = now,
                "Webhook timestamp outside tolerance window"
            );
            return Err(MembershipError::WebhookSignatureInvalid);
        }

        let secret_key = self
            .webhook_secret
            .strip_prefix("whsec_")
            .unwrap_or(&self.webhook_secret);
        let signed_payload = format!("{}.{}", timestamp, payload);

        let mut mac = HmacSha256::new_from_slice(secret_key.as_bytes()).map_err(|_| {
            tracing::error!("Invalid webhook secret key");
            MembershipError::WebhookSignatureInvalid
        })?;
        mac.update(signed_payload.as_bytes());
        let computed = hex::encode(mac.finalize().into_bytes());

        if computed != v1_signature {
            tracing::error!("Webhook signature mismatch");
            return Err(MembershipError::WebhookSignatureInvalid);
        }

        serde_json::from_str(payload).map_err(|e| {
            tracing::error!(parse_error = %e, "Failed to parse webhook event JSON");
            MembershipError::WebhookPayloadInvalid(e.to_string())
        })
    }

    /// Claim and process one verified event.
    pub async fn handle_event(&self, event: EventEnvelope) -> MembershipResult<()> {
        if let Some(claims) = &self.claims {
            let event_timestamp = OffsetDateTime::from_unix_timestamp(event.created)
                .unwrap_or_else(|_| OffsetDateTime::now_utc());
            let claimed = claims
                .claim(&event.id, &event.event_type, event_timestamp)
                .await?;
            if !claimed {
                tracing::info!(
                    event_id = %event.id,
                    event_type = %event.event_type,
                    "Duplicate webhook event; already claimed"
                );
                return Ok(());
            }
        }

        tracing::info!(
            event_id = %event.id,
            event_type = %event.event_type,
            "Processing webhook event"
        );

        let result = self.route_event(&event).await;

        if let Some(claims) = &self.claims {
            let (outcome, message) = match &result {
                Ok(()) => (ClaimOutcome::Success, None),
                Err(e) => (ClaimOutcome::Error, Some(e.to_string())),
            };
            if let Err(e) = claims
                .complete(&event.id, outcome, message.as_deref())
                .await
            {
                tracing::error!(
                    event_id = %event.id,
                    error = %e,
                    "Failed to record webhook processing outcome"
                );
            }
        }

        result
    }

    async fn route_event(&self, event: &EventEnvelope) -> MembershipResult<()> {
        match event.event_type.as_str() {
            "customer.subscription.created"
            | "customer.subscription.updated"
            | "customer.subscription.deleted" => {
                let object: SubscriptionObject = parse_object(event)?;
                self.engine.sync(object.customer.id()).await;
                Ok(())
            }
            "invoice.payment_succeeded" | "invoice.payment_failed" => {
                let object: InvoiceObject = parse_object(event)?;
                match object.customer {
                    Some(customer) => {
                        self.engine.sync(customer.id()).await;
                    }
                    None => {
                        tracing::warn!(
                            event_id = %event.id,
                            "Invoice event carries no customer; skipping"
                        );
                    }
                }
                Ok(())
            }
            "checkout.session.completed" => {
                let object: CheckoutSessionObject = parse_object(event)?;
                self.handle_checkout_completed(event, object).await
            }
            "payment_intent.succeeded" => {
                let object: PaymentIntentObject = parse_object(event)?;
                self.handle_payment_intent_succeeded(event, object).await
            }
            "charge.succeeded" => {
                // Backup sync only; membership state is owned by the
                // subscription events
                let object: ChargeObject = parse_object(event)?;
                match object.customer {
                    Some(customer) => {
                        self.engine.sync(customer.id()).await;
                    }
                    None => {
                        tracing::warn!(
                            event_id = %event.id,
                            "Charge event carries no customer; skipping"
                        );
                    }
                }
                Ok(())
            }
            other => {
                tracing::debug!(
                    event_id = %event.id,
                    event_type = %other,
                    "Ignoring unhandled webhook event type"
                );
                Ok(())
            }
        }
    }

    /// Checkout completion flow.
    ///
    /// Runs concurrently with the subscription-created sync for the same
    /// purchase; both paths upsert on the same (user, subscription) key, so
    /// whichever lands second becomes an update and counters fire once.
    async fn handle_checkout_completed(
        &self,
        event: &EventEnvelope,
        session: CheckoutSessionObject,
    ) -> MembershipResult<()> {
        let (Some(customer), Some(subscription)) = (&session.customer, &session.subscription)
        else {
            tracing::error!(
                event_id = %event.id,
                "Checkout session missing customer or subscription; no mutation"
            );
            return Ok(());
        };
        let (Some(user_ref), Some(membership_ref)) = (
            session.metadata.get("userId"),
            session.metadata.get("membershipId"),
        ) else {
            tracing::error!(
                event_id = %event.id,
                "Checkout session metadata missing userId/membershipId; no mutation"
            );
            return Ok(());
        };

        let session_email = session
            .customer_details
            .as_ref()
            .and_then(|d| d.email.as_deref());
        let Some(user) = self
            .resolve_checkout_user(user_ref, customer.id(), session_email)
            .await?
        else {
            tracing::error!(
                event_id = %event.id,
                user_ref = %user_ref,
                "Checkout completion could not resolve a local user"
            );
            return Ok(());
        };

        if user.stripe_customer_id.as_deref() != Some(customer.id()) {
            self.directory
                .set_payment_customer_id(user.id, customer.id())
                .await?;
        }

        let membership_id = membership_ref
            .parse::<Uuid>()
            .map(MembershipId)
            .map_err(|e| {
                MembershipError::InvalidInput(format!("membershipId is not a uuid: {}", e))
            })?;
        let Some(definition) = self.catalog.find_by_id(membership_id).await? else {
            tracing::error!(
                event_id = %event.id,
                membership_id = %membership_id.0,
                "Checkout references unknown membership definition; no mutation"
            );
            return Ok(());
        };

        let snapshot = self.provider.get_subscription(subscription.id()).await?;

        let (row, created) = self
            .engine
            .apply_subscription(
                user.id,
                &snapshot,
                Some(&definition),
                Some((OffsetDateTime::now_utc(), definition.price_cents)),
            )
            .await?;

        tracing::info!(
            event_id = %event.id,
            user_id = %user.id.0,
            subscription_id = %snapshot.id,
            tier = %definition.tier,
            created = created,
            "Checkout completion applied"
        );

        if created {
            // Best-effort; delivery failures never fail the webhook
            self.notifier
                .send(Notification {
                    to: user.email.clone(),
                    template: NotificationTemplate::MembershipWelcome {
                        tier: definition.tier.to_string(),
                        price_cents: definition.price_cents,
                        next_billing_date: row.next_billing_date,
                        allocations: definition
                            .product_allocations
                            .iter()
                            .map(|a| (a.category_name.clone(), a.quantity))
                            .collect(),
                    },
                })
                .await;
            self.notifier
                .send(Notification {
                    to: self.ops_email.clone(),
                    template: NotificationTemplate::NewMemberAlert {
                        member_email: user.email.clone(),
                        tier: definition.tier.to_string(),
                        price_cents: definition.price_cents,
                    },
                })
                .await;
        }

        Ok(())
    }

    /// Resolve the purchasing user from the metadata reference, then the
    /// stored customer id, then the checkout email. An email match backfills
    /// the external id so the next lookup short-circuits.
    async fn resolve_checkout_user(
        &self,
        user_ref: &str,
        customer_id: &str,
        session_email: Option<&str>,
    ) -> MembershipResult<Option<UserRecord>> {
        // The metadata reference is our own user id for sessions we created,
        // or an external auth id for sessions created by the storefront
        if let Ok(id) = user_ref.parse::<Uuid>() {
            if let Some(user) = self.directory.find_by_id(UserId(id)).await? {
                return Ok(Some(user));
            }
        }
        if let Some(user) = self.directory.find_by_external_id(user_ref).await? {
            return Ok(Some(user));
        }

        if let Some(user) = self
            .directory
            .find_by_payment_customer_id(customer_id)
            .await?
        {
            return Ok(Some(user));
        }

        let Some(email) = session_email else {
            return Ok(None);
        };
        match self.directory.find_by_email(email).await? {
            Some(mut user) => {
                tracing::info!(
                    user_id = %user.id.0,
                    "Resolved checkout user by email; backfilling external id"
                );
                self.directory.set_external_id(user.id, user_ref).await?;
                user.external_id = Some(user_ref.to_string());
                Ok(Some(user))
            }
            None => Ok(None),
        }
    }

    async fn handle_payment_intent_succeeded(
        &self,
        event: &EventEnvelope,
        intent: PaymentIntentObject,
    ) -> MembershipResult<()> {
        // Membership payments are handled exclusively through subscription
        // sync; a payment intent only matters when it pays for a
        // consultation submission.
        let Some(submission_id) = intent.metadata.get("submissionId") else {
            tracing::debug!(
                event_id = %event.id,
                "Payment intent without submission metadata; nothing to do"
            );
            return Ok(());
        };

        let updated = self
            .consultations
            .mark_payment_succeeded(submission_id)
            .await?;
        if updated {
            tracing::info!(
                event_id = %event.id,
                submission_id = %submission_id,
                "Consultation payment marked succeeded"
            );
        } else {
            tracing::warn!(
                event_id = %event.id,
                submission_id = %submission_id,
                "Payment intent references unknown consultation submission"
            );
        }
        Ok(())
    }
}

fn parse_object<T: serde::de::DeserializeOwned>(event: &EventEnvelope) -> MembershipResult<T> {
    serde_json::from_value(event.data.object.clone()).map_err(|e| {
        MembershipError::WebhookPayloadInvalid(format!(
            "{} object malformed: {}",
            event.event_type, e
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expandable_id_both_shapes() {
        let bare: ExpandableId = serde_json::from_value(serde_json::json!("cus_123")).unwrap();
        assert_eq!(bare.id(), "cus_123");

        let expanded: ExpandableId =
            serde_json::from_value(serde_json::json!({"id": "cus_123", "email": "a@b.c"}))
                .unwrap();
        assert_eq!(expanded.id(), "cus_123");
    }

    #[test]
    fn test_envelope_parses_minimal_event() {
        let payload = serde_json::json!({
            "id": "evt_1",
            "type": "customer.subscription.updated",
            "created": 1_700_000_000,
            "data": { "object": { "id": "sub_1", "customer": "cus_1" } }
        })
        .to_string();
        let envelope: EventEnvelope = serde_json::from_str(&payload).unwrap();
        assert_eq!(envelope.event_type, "customer.subscription.updated");
        let object: SubscriptionObject =
            serde_json::from_value(envelope.data.object.clone()).unwrap();
        assert_eq!(object.customer.id(), "cus_1");
    }
}
