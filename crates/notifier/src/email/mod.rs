//! Email gateway: the single path from the pipeline to the email provider.
//!
//! Every send de-duplicates recipients, drops suppressed addresses, validates
//! the message and only then calls the transport. Failures of any kind are
//! logged here and surface to callers as a `SendOutcome`; callers never handle
//! email errors themselves.

pub mod templates;
pub mod transport;

use std::collections::HashSet;
use std::sync::{Arc, LazyLock};

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::suppression::SuppressionFilter;
use transport::EmailTransport;

static EMAIL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[^\s@<>]+@[^\s@<>]+\.[^\s@<>]+$").expect("email pattern is valid")
});

/// A rendered email ready for the gateway.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailMessage {
    pub to: Vec<String>,
    pub subject: String,
    pub html: String,
}

impl EmailMessage {
    pub fn new(to: Vec<String>, subject: impl Into<String>, html: impl Into<String>) -> Self {
        Self {
            to,
            subject: subject.into(),
            html: html.into(),
        }
    }

    /// Check the message shape. Run after suppression, so an emptied list fails here.
    pub fn validate(&self) -> Result<(), String> {
        if self.to.is_empty() {
            return Err("recipient list is empty".to_string());
        }
        if let Some(bad) = self.to.iter().find(|e| !is_valid_email(e)) {
            return Err(format!("invalid recipient address '{}'", bad));
        }
        if self.subject.trim().is_empty() {
            return Err("subject is empty".to_string());
        }
        if self.html.trim().is_empty() {
            return Err("body is empty".to_string());
        }
        Ok(())
    }
}

/// Subject and body of an email whose recipient is resolved later.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailDraft {
    pub subject: String,
    pub html: String,
}

impl EmailDraft {
    pub fn addressed_to(self, to: impl Into<String>) -> EmailMessage {
        EmailMessage::new(vec![to.into()], self.subject, self.html)
    }
}

pub fn is_valid_email(email: &str) -> bool {
    EMAIL_RE.is_match(email)
}

/// Trim and drop repeated addresses (case-insensitive), keeping first occurrences.
pub fn dedupe_recipients(recipients: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::new();
    recipients
        .into_iter()
        .map(|e| e.trim().to_string())
        .filter(|e| !e.is_empty() && seen.insert(e.to_lowercase()))
        .collect()
}

/// What happened to one message handed to the gateway.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    /// Accepted by the provider, with its message id.
    Sent(String),
    /// Every recipient is on a suppression list. Retrying cannot succeed.
    Suppressed,
    /// Invalid message, lookup or provider failure.
    Failed,
}

impl SendOutcome {
    pub fn message_id(self) -> Option<String> {
        match self {
            Self::Sent(id) => Some(id),
            Self::Suppressed | Self::Failed => None,
        }
    }
}

pub struct EmailGateway {
    transport: Arc<dyn EmailTransport>,
    suppression: SuppressionFilter,
    from: String,
}

impl EmailGateway {
    pub fn new(
        transport: Arc<dyn EmailTransport>,
        suppression: SuppressionFilter,
        from: impl Into<String>,
    ) -> Self {
        Self {
            transport,
            suppression,
            from: from.into(),
        }
    }

    /// Send one message. Returns the provider message id, or `None` if nothing was sent.
    pub async fn send(&self, message: EmailMessage) -> Option<String> {
        self.deliver(message).await.message_id()
    }

    /// Send one message and report why nothing went out, if nothing did.
    pub async fn deliver(&self, message: EmailMessage) -> SendOutcome {
        let EmailMessage { to, subject, html } = message;
        let requested = to.len();
        let to = dedupe_recipients(to);
        let addressed = !to.is_empty();

        let to = match self.suppression.retain_deliverable(to).await {
            Ok(to) => to,
            Err(e) => {
                tracing::error!(error = %e, subject = %subject, "Suppression lookup failed, email not sent");
                return SendOutcome::Failed;
            }
        };

        if addressed && to.is_empty() {
            tracing::info!(subject = %subject, requested, "All recipients suppressed, email not sent");
            return SendOutcome::Suppressed;
        }

        let message = EmailMessage { to, subject, html };
        if let Err(reason) = message.validate() {
            tracing::warn!(
                subject = %message.subject,
                requested,
                reason = %reason,
                "Email failed validation, not sent"
            );
            return SendOutcome::Failed;
        }

        match self.transport.send(&self.from, &message).await {
            Ok(message_id) => {
                tracing::info!(
                    message_id = %message_id,
                    recipients = message.to.len(),
                    subject = %message.subject,
                    "Email sent"
                );
                SendOutcome::Sent(message_id)
            }
            Err(e) => {
                tracing::error!(
                    error = %e,
                    transport = self.transport.name(),
                    subject = %message.subject,
                    "Email delivery failed"
                );
                SendOutcome::Failed
            }
        }
    }
}
