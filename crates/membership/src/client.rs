//! Stripe client configuration

use stripe::Client;

use crate::error::{MembershipError, MembershipResult};

/// Configuration for Stripe billing
#[derive(Debug, Clone)]
pub struct StripeConfig {
    /// Stripe secret API key
    pub secret_key: String,
    /// Stripe webhook signing secret
    pub webhook_secret: String,
    /// Price IDs for each membership tier
    pub price_ids: PriceIds,
    /// Base URL for success/cancel redirects
    pub app_base_url: String,
    /// Operations inbox notified on new memberships
    pub ops_email: String,
}

/// Stripe price IDs for membership tiers
/// Tier hierarchy: Basic ($9.99) → Premium ($19.99) → VIP ($34.99) → Elite ($49.99)
#[derive(Debug, Clone)]
pub struct PriceIds {
    pub basic: String,
    pub premium: String,
    pub vip: String,
    pub elite: String,
}

impl StripeConfig {
    /// Create config from environment variables
    pub fn from_env() -> MembershipResult<Self> {
        Ok(Self {
            secret_key: std::env::var("STRIPE_SECRET_KEY")
                .map_err(|_| MembershipError::Config("STRIPE_SECRET_KEY not set".to_string()))?,
            webhook_secret: std::env::var("STRIPE_WEBHOOK_SECRET")
                .map_err(|_| MembershipError::Config("STRIPE_WEBHOOK_SECRET not set".to_string()))?,
            price_ids: PriceIds {
                basic: std::env::var("STRIPE_PRICE_BASIC")
                    .map_err(|_| MembershipError::Config("STRIPE_PRICE_BASIC not set".to_string()))?,
                premium: std::env::var("STRIPE_PRICE_PREMIUM").map_err(|_| {
                    MembershipError::Config("STRIPE_PRICE_PREMIUM not set".to_string())
                })?,
                vip: std::env::var("STRIPE_PRICE_VIP")
                    .map_err(|_| MembershipError::Config("STRIPE_PRICE_VIP not set".to_string()))?,
                elite: std::env::var("STRIPE_PRICE_ELITE")
                    .map_err(|_| MembershipError::Config("STRIPE_PRICE_ELITE not set".to_string()))?,
            },
            app_base_url: std::env::var("APP_BASE_URL")
                .unwrap_or_else(|_| "http://localhost:3000".to_string()),
            ops_email: std::env::var("OPS_EMAIL")
                .unwrap_or_else(|_| "orders@nutraviveholistic.com".to_string()),
        })
    }

    /// Get price ID for a tier
    pub fn price_id_for_tier(&self, tier: &str) -> Option<&str> {
        match tier.to_lowercase().as_str() {
            "basic" => Some(&self.price_ids.basic),
            "premium" => Some(&self.price_ids.premium),
            "vip" => Some(&self.price_ids.vip),
            "elite" => Some(&self.price_ids.elite),
            _ => None,
        }
    }

    /// Get tier from price ID
    pub fn tier_for_price_id(&self, price_id: &str) -> Option<&'static str> {
        if price_id == self.price_ids.basic {
            Some("basic")
        } else if price_id == self.price_ids.premium {
            Some("premium")
        } else if price_id == self.price_ids.vip {
            Some("vip")
        } else if price_id == self.price_ids.elite {
            Some("elite")
        } else {
            None
        }
    }
}

/// Stripe billing client
#[derive(Clone)]
pub struct StripeClient {
    client: Client,
    config: StripeConfig,
}

impl StripeClient {
    /// Create a new Stripe client from config
    pub fn new(config: StripeConfig) -> Self {
        let client = Client::new(&config.secret_key);
        Self { client, config }
    }

    /// Create a new Stripe client from environment variables
    pub fn from_env() -> MembershipResult<Self> {
        let config = StripeConfig::from_env()?;
        Ok(Self::new(config))
    }

    /// Get the inner Stripe client
    pub fn inner(&self) -> &Client {
        &self.client
    }

    /// Get the config
    pub fn config(&self) -> &StripeConfig {
        &self.config
    }
}
