//! Membership checkout sessions

use std::collections::HashMap;
use std::sync::Arc;

use nutravive_shared::{MembershipId, UserId};

use crate::error::{MembershipError, MembershipResult};
use crate::provider::{CheckoutSessionParams, CheckoutSessionRef, PaymentProvider};
use crate::store::{MembershipCatalog, UserDirectory};

/// Creates provider checkout sessions for membership purchases.
///
/// The session metadata carries {userId, membershipId}; the webhook
/// router's checkout-completion flow requires both.
pub struct CheckoutService {
    provider: Arc<dyn PaymentProvider>,
    directory: Arc<dyn UserDirectory>,
    catalog: Arc<dyn MembershipCatalog>,
    app_base_url: String,
}

impl CheckoutService {
    pub fn new(
        provider: Arc<dyn PaymentProvider>,
        directory: Arc<dyn UserDirectory>,
        catalog: Arc<dyn MembershipCatalog>,
        app_base_url: String,
    ) -> Self {
        Self {
            provider,
            directory,
            catalog,
            app_base_url,
        }
    }

    /// Create a subscription checkout session for a membership plan.
    ///
    /// Creates the provider customer on first purchase and backfills the
    /// stored customer id.
    pub async fn create_membership_checkout(
        &self,
        user_id: UserId,
        membership_id: MembershipId,
    ) -> MembershipResult<CheckoutSessionRef> {
        let user = self
            .directory
            .find_by_id(user_id)
            .await?
            .ok_or_else(|| MembershipError::UnresolvedUser(user_id.0.to_string()))?;

        let definition = self
            .catalog
            .find_by_id(membership_id)
            .await?
            .ok_or_else(|| MembershipError::DefinitionNotFound(membership_id.0.to_string()))?;

        let customer_id = match &user.stripe_customer_id {
            Some(customer_id) => customer_id.clone(),
            None => {
                let mut metadata = HashMap::new();
                if let Some(external_id) = &user.external_id {
                    metadata.insert("clerkUserId".to_string(), external_id.clone());
                }
                let customer = self.provider.create_customer(&user.email, metadata).await?;
                self.directory
                    .set_payment_customer_id(user.id, &customer.id)
                    .await?;
                customer.id
            }
        };

        let mut metadata = HashMap::new();
        metadata.insert("userId".to_string(), user.id.0.to_string());
        metadata.insert("membershipId".to_string(), membership_id.0.to_string());

        let session = self
            .provider
            .create_checkout_session(CheckoutSessionParams {
                customer_id,
                price_id: definition.stripe_price_id.clone(),
                success_url: format!(
                    "{}/account/membership?session_id={{CHECKOUT_SESSION_ID}}",
                    self.app_base_url
                ),
                cancel_url: format!("{}/membership", self.app_base_url),
                metadata,
            })
            .await?;

        tracing::info!(
            user_id = %user.id.0,
            membership_id = %membership_id.0,
            tier = %definition.tier,
            session_id = %session.id,
            "Membership checkout session created"
        );

        Ok(session)
    }
}
