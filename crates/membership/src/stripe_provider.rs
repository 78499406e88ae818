//! Stripe-backed payment provider
//!
//! The only module that touches the Stripe API object model. Everything is
//! flattened into the snapshot types from [`crate::provider`] at this
//! boundary so the engine never sees an `Expandable` or a Stripe id type.

use async_trait::async_trait;
use stripe::{
    CheckoutSession, CheckoutSessionMode, CreateCheckoutSession, CreateCheckoutSessionLineItems,
    Customer, CustomerId, ListPaymentMethods, ListSubscriptions, PaymentMethod,
    PaymentMethodTypeFilter, Subscription, SubscriptionId, SubscriptionStatusFilter,
};

use crate::client::StripeClient;
use crate::error::{MembershipError, MembershipResult};
use crate::provider::{
    CheckoutSessionParams, CheckoutSessionRef, PaymentMethodSummary, PaymentProvider,
    ProviderCustomer, ProviderSubscriptionStatus, SubscriptionSnapshot,
};

/// Production [`PaymentProvider`] backed by the Stripe API
pub struct StripeProvider {
    stripe: StripeClient,
}

impl StripeProvider {
    pub fn new(stripe: StripeClient) -> Self {
        Self { stripe }
    }
}

fn parse_customer_id(customer_id: &str) -> MembershipResult<CustomerId> {
    customer_id
        .parse::<CustomerId>()
        .map_err(|e| MembershipError::StripeApi(format!("Invalid customer ID: {}", e)))
}

fn map_status(status: stripe::SubscriptionStatus) -> ProviderSubscriptionStatus {
    match status {
        stripe::SubscriptionStatus::Active => ProviderSubscriptionStatus::Active,
        stripe::SubscriptionStatus::Trialing => ProviderSubscriptionStatus::Trialing,
        stripe::SubscriptionStatus::PastDue => ProviderSubscriptionStatus::PastDue,
        stripe::SubscriptionStatus::Canceled => ProviderSubscriptionStatus::Canceled,
        stripe::SubscriptionStatus::Unpaid => ProviderSubscriptionStatus::Unpaid,
        stripe::SubscriptionStatus::Incomplete => ProviderSubscriptionStatus::Incomplete,
        stripe::SubscriptionStatus::IncompleteExpired => {
            ProviderSubscriptionStatus::IncompleteExpired
        }
        stripe::SubscriptionStatus::Paused => ProviderSubscriptionStatus::Paused,
    }
}

fn map_subscription(subscription: &Subscription) -> SubscriptionSnapshot {
    let customer_id = match &subscription.customer {
        stripe::Expandable::Id(id) => id.to_string(),
        stripe::Expandable::Object(customer) => customer.id.to_string(),
    };

    let price_id = subscription
        .items
        .data
        .first()
        .and_then(|item| item.price.as_ref())
        .map(|price| price.id.to_string());

    SubscriptionSnapshot {
        id: subscription.id.to_string(),
        customer_id,
        status: map_status(subscription.status),
        cancel_at_period_end: subscription.cancel_at_period_end,
        start_date: subscription.start_date,
        current_period_start: Some(subscription.current_period_start),
        current_period_end: Some(subscription.current_period_end),
        price_id,
    }
}

fn map_payment_method(method: &PaymentMethod) -> PaymentMethodSummary {
    let card = method.card.as_ref();
    PaymentMethodSummary {
        id: method.id.to_string(),
        brand: card.map(|c| c.brand.clone()),
        last4: card.map(|c| c.last4.clone()),
        exp_month: card.map(|c| c.exp_month),
        exp_year: card.map(|c| c.exp_year),
    }
}

#[async_trait]
impl PaymentProvider for StripeProvider {
    async fn get_customer(&self, customer_id: &str) -> MembershipResult<ProviderCustomer> {
        let id = parse_customer_id(customer_id)?;
        let customer = Customer::retrieve(self.stripe.inner(), &id, &[]).await?;

        Ok(ProviderCustomer {
            id: customer.id.to_string(),
            email: customer.email.clone(),
            deleted: customer.deleted,
            metadata: customer.metadata.clone().unwrap_or_default(),
        })
    }

    async fn create_customer(
        &self,
        email: &str,
        metadata: std::collections::HashMap<String, String>,
    ) -> MembershipResult<ProviderCustomer> {
        let params = stripe::CreateCustomer {
            email: Some(email),
            metadata: Some(metadata),
            ..Default::default()
        };
        let customer = Customer::create(self.stripe.inner(), params).await?;

        tracing::info!(
            customer_id = %customer.id,
            "Created Stripe customer"
        );

        Ok(ProviderCustomer {
            id: customer.id.to_string(),
            email: customer.email.clone(),
            deleted: customer.deleted,
            metadata: customer.metadata.clone().unwrap_or_default(),
        })
    }

    async fn list_subscriptions(
        &self,
        customer_id: &str,
    ) -> MembershipResult<Vec<SubscriptionSnapshot>> {
        let id = parse_customer_id(customer_id)?;
        let params = ListSubscriptions {
            customer: Some(id),
            status: Some(SubscriptionStatusFilter::All),
            ..Default::default()
        };
        let subscriptions = Subscription::list(self.stripe.inner(), &params).await?;

        Ok(subscriptions.data.iter().map(map_subscription).collect())
    }

    async fn list_payment_methods(
        &self,
        customer_id: &str,
    ) -> MembershipResult<Vec<PaymentMethodSummary>> {
        let id = parse_customer_id(customer_id)?;
        let params = ListPaymentMethods {
            customer: Some(id),
            type_: Some(PaymentMethodTypeFilter::Card),
            ..Default::default()
        };
        let methods = PaymentMethod::list(self.stripe.inner(), &params).await?;

        Ok(methods.data.iter().map(map_payment_method).collect())
    }

    async fn get_subscription(
        &self,
        subscription_id: &str,
    ) -> MembershipResult<SubscriptionSnapshot> {
        let id = subscription_id
            .parse::<SubscriptionId>()
            .map_err(|e| MembershipError::StripeApi(format!("Invalid subscription ID: {}", e)))?;
        let subscription = Subscription::retrieve(self.stripe.inner(), &id, &[]).await?;

        Ok(map_subscription(&subscription))
    }

    async fn create_checkout_session(
        &self,
        params: CheckoutSessionParams,
    ) -> MembershipResult<CheckoutSessionRef> {
        let customer_id = parse_customer_id(&params.customer_id)?;

        let line_items = vec![CreateCheckoutSessionLineItems {
            price: Some(params.price_id.clone()),
            quantity: Some(1),
            ..Default::default()
        }];

        let create = CreateCheckoutSession {
            customer: Some(customer_id),
            mode: Some(CheckoutSessionMode::Subscription),
            line_items: Some(line_items),
            success_url: Some(&params.success_url),
            cancel_url: Some(&params.cancel_url),
            metadata: Some(params.metadata.clone()),
            allow_promotion_codes: Some(true),
            ..Default::default()
        };

        let session = CheckoutSession::create(self.stripe.inner(), create).await?;

        tracing::info!(
            customer_id = %params.customer_id,
            session_id = %session.id,
            price_id = %params.price_id,
            "Created membership checkout session"
        );

        Ok(CheckoutSessionRef {
            id: session.id.to_string(),
            url: session.url.clone(),
        })
    }
}
