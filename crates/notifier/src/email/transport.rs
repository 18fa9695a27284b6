//! Email transports. The only code that talks to an email-sending API.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::EmailMessage;

/// Resend API endpoint
const RESEND_API_URL: &str = "https://api.resend.com/emails";

#[derive(Debug, Error)]
pub enum EmailError {
    #[error("email delivery is disabled (no API key configured)")]
    Disabled,

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("provider rejected message ({status}): {body}")]
    Rejected { status: u16, body: String },
}

/// A transport able to hand one validated message to a provider.
#[async_trait]
pub trait EmailTransport: Send + Sync {
    /// Send the message and return the provider's message id.
    async fn send(&self, from: &str, message: &EmailMessage) -> Result<String, EmailError>;

    /// Provider name for logs.
    fn name(&self) -> &'static str;
}

/// Sends email via the Resend HTTP API.
pub struct ResendTransport {
    api_key: String,
    client: Client,
}

#[derive(Debug, Serialize)]
struct ResendRequest<'a> {
    from: &'a str,
    to: &'a [String],
    subject: &'a str,
    html: &'a str,
}

#[derive(Debug, Deserialize)]
struct ResendResponse {
    id: String,
}

impl ResendTransport {
    /// Create a transport whose requests time out after `timeout`.
    pub fn new(api_key: impl Into<String>, timeout: Duration) -> Result<Self, EmailError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            api_key: api_key.into(),
            client,
        })
    }
}

#[async_trait]
impl EmailTransport for ResendTransport {
    async fn send(&self, from: &str, message: &EmailMessage) -> Result<String, EmailError> {
        let request = ResendRequest {
            from,
            to: &message.to,
            subject: &message.subject,
            html: &message.html,
        };

        let response = self
            .client
            .post(RESEND_API_URL)
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(EmailError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: ResendResponse = response.json().await?;
        tracing::debug!(message_id = %parsed.id, "Resend accepted message");
        Ok(parsed.id)
    }

    fn name(&self) -> &'static str {
        "resend"
    }
}

/// Used when no provider is configured; every send fails and is logged by the gateway.
pub struct DisabledTransport;

#[async_trait]
impl EmailTransport for DisabledTransport {
    async fn send(&self, _from: &str, _message: &EmailMessage) -> Result<String, EmailError> {
        Err(EmailError::Disabled)
    }

    fn name(&self) -> &'static str {
        "disabled"
    }
}
