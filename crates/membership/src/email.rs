//! Email notifications for membership events
//!
//! Sends transactional emails via the Resend API. Delivery is best-effort:
//! a failed send logs and reports false, it never fails the flow that
//! triggered it.

use async_trait::async_trait;
use time::format_description::well_known::Rfc2822;

use crate::provider::{Notification, NotificationSender, NotificationTemplate};

/// Email configuration
#[derive(Debug, Clone)]
pub struct EmailConfig {
    /// Resend API key
    pub resend_api_key: String,
    /// From address for emails
    pub email_from: String,
    /// App name for branding
    pub app_name: String,
    /// Storefront URL used in email links
    pub store_url: String,
}

impl EmailConfig {
    /// Create config from environment variables
    pub fn from_env() -> Self {
        Self {
            resend_api_key: std::env::var("RESEND_API_KEY").unwrap_or_default(),
            email_from: std::env::var("EMAIL_FROM")
                .unwrap_or_else(|_| "Nutra-Vive <orders@nutraviveholistic.com>".to_string()),
            app_name: std::env::var("APP_NAME").unwrap_or_else(|_| "Nutra-Vive".to_string()),
            store_url: std::env::var("APP_BASE_URL")
                .unwrap_or_else(|_| "https://nutraviveholistic.com".to_string()),
        }
    }

    /// Check if email sending is enabled
    pub fn is_enabled(&self) -> bool {
        !self.resend_api_key.is_empty()
    }
}

/// Resend-backed [`NotificationSender`]
#[derive(Clone)]
pub struct ResendMailer {
    config: EmailConfig,
    client: reqwest::Client,
}

impl ResendMailer {
    pub fn new(config: EmailConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
        }
    }

    pub fn from_env() -> Self {
        Self::new(EmailConfig::from_env())
    }

    /// Send an email via the Resend API.
    ///
    /// Returns true on success, false when disabled or on any delivery
    /// failure. Failures are logged here so callers can stay fire-and-forget.
    async fn send_email(&self, to: &str, subject: &str, html: &str) -> bool {
        if !self.config.is_enabled() {
            tracing::warn!(
                to = %to,
                subject = %subject,
                "Email not configured, skipping"
            );
            return false;
        }

        #[allow(clippy::disallowed_methods)]
        // json! macro uses unwrap internally, safe for primitive types
        let body = serde_json::json!({
            "from": self.config.email_from,
            "to": [to],
            "subject": subject,
            "html": html
        });

        let response = self
            .client
            .post("https://api.resend.com/emails")
            .header(
                "Authorization",
                format!("Bearer {}", self.config.resend_api_key),
            )
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await;

        match response {
            Ok(resp) if resp.status().is_success() => {
                tracing::info!(to = %to, subject = %subject, "Membership email sent");
                true
            }
            Ok(resp) => {
                let status = resp.status();
                let body = resp.text().await.unwrap_or_default();
                tracing::error!(
                    to = %to,
                    subject = %subject,
                    status = %status,
                    body = %body,
                    "Failed to send membership email - non-fatal"
                );
                false
            }
            Err(e) => {
                tracing::error!(
                    to = %to,
                    subject = %subject,
                    error = %e,
                    "Failed to send membership email - non-fatal"
                );
                false
            }
        }
    }

    fn render(&self, template: &NotificationTemplate) -> (String, String) {
        match template {
            NotificationTemplate::MembershipWelcome {
                tier,
                price_cents,
                next_billing_date,
                allocations,
            } => {
                let subject = format!("Welcome to your {} membership!", capitalize(tier));
                let allocation_rows: String = allocations
                    .iter()
                    .map(|(name, quantity)| {
                        format!(
                            "<li><strong>{}</strong>: {} per billing period</li>",
                            name, quantity
                        )
                    })
                    .collect();
                let next_billing = next_billing_date
                    .and_then(|d| d.format(&Rfc2822).ok())
                    .unwrap_or_else(|| "at the end of your current period".to_string());
                let html = format!(
                    r#"<h1>Welcome to {app}!</h1>
<p>Your <strong>{tier}</strong> membership is now active at ${price:.2}/month.</p>
<p>Your monthly product allocations:</p>
<ul>{allocations}</ul>
<p>Next billing: {next_billing}</p>
<p><a href="{url}/account/membership">Manage your membership</a></p>"#,
                    app = self.config.app_name,
                    tier = capitalize(tier),
                    price = *price_cents as f64 / 100.0,
                    allocations = allocation_rows,
                    next_billing = next_billing,
                    url = self.config.store_url,
                );
                (subject, html)
            }
            NotificationTemplate::NewMemberAlert {
                member_email,
                tier,
                price_cents,
            } => {
                let subject = format!("New {} member: {}", capitalize(tier), member_email);
                let html = format!(
                    r#"<h2>New membership signup</h2>
<p><strong>Member:</strong> {member}</p>
<p><strong>Tier:</strong> {tier}</p>
<p><strong>Price:</strong> ${price:.2}/month</p>"#,
                    member = member_email,
                    tier = capitalize(tier),
                    price = *price_cents as f64 / 100.0,
                );
                (subject, html)
            }
        }
    }
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
        None => String::new(),
    }
}

#[async_trait]
impl NotificationSender for ResendMailer {
    async fn send(&self, notification: Notification) -> bool {
        let (subject, html) = self.render(&notification.template);
        self.send_email(&notification.to, &subject, &html).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mailer() -> ResendMailer {
        ResendMailer::new(EmailConfig {
            resend_api_key: String::new(),
            email_from: "Nutra-Vive <orders@nutraviveholistic.com>".to_string(),
            app_name: "Nutra-Vive".to_string(),
            store_url: "https://nutraviveholistic.com".to_string(),
        })
    }

    #[test]
    fn test_welcome_template_lists_allocations() {
        let (subject, html) = mailer().render(&NotificationTemplate::MembershipWelcome {
            tier: "premium".to_string(),
            price_cents: 1999,
            next_billing_date: None,
            allocations: vec![("Juices".to_string(), 10), ("Teas".to_string(), 5)],
        });
        assert!(subject.contains("Premium"));
        assert!(html.contains("Juices"));
        assert!(html.contains("$19.99"));
    }

    #[test]
    fn test_disabled_config_skips_send() {
        let m = mailer();
        assert!(!m.config.is_enabled());
    }
}
