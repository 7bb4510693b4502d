//! Transactional email delivery.
use anyhow::{bail, Context as _, Result};
use serde_json::json;
use tracing::{debug, info};

use crate::config::EmailConfig;

/// Sends email through a Resend-compatible HTTP API.
///
/// Without an email configuration (or in test mode) messages are logged and dropped.
#[derive(Clone, Debug)]
pub struct Mailer {
    client: reqwest::Client,
    config: Option<EmailConfig>,
}

/// A message to deliver.
#[derive(Debug, Clone)]
pub struct Email {
    pub to: String,
    pub subject: String,
    pub html: String,
    pub text: String,
}

impl Mailer {
    pub fn new(client: reqwest::Client, config: Option<EmailConfig>, test: bool) -> Self {
        Self {
            client,
            config: if test { None } else { config },
        }
    }

    /// Deliver `email`. Returns `false` when delivery is disabled.
    pub async fn send(&self, email: &Email) -> Result<bool> {
        let Some(config) = &self.config else {
            info!(to = %email.to, subject = %email.subject, "email delivery disabled; dropping message");
            return Ok(false);
        };

        debug!(to = %email.to, "sending email");
        let res = self
            .client
            .post(format!("{}/emails", config.base_url.trim_end_matches('/')))
            .bearer_auth(&config.api_key)
            .json(&json!({
                "from": config.from,
                "to": [email.to],
                "subject": email.subject,
                "html": email.html,
                "text": email.text,
            }))
            .send()
            .await
            .context("failed to send email request")?;

        if res.status().is_success() {
            Ok(true)
        } else {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            bail!("error from email provider ({status}): {body}");
        }
    }
}
