pub mod daily;
pub mod project;
pub mod task_updates;

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;

use beacon_notifier::email::templates::TemplateEngine;
use beacon_notifier::email::{EmailGateway, EmailMessage, SendOutcome};

use crate::helpers::resolve_links;
use crate::models::DigestBatch;
use crate::templates::render_digest;

pub use daily::DailyDigestJob;
pub use project::ProjectDigestJob;
pub use task_updates::TaskUpdatesJob;

/// Per-run delivery counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunReport {
    pub sent: usize,
    /// Recipients with nothing to report, or whose address is suppressed.
    pub skipped: usize,
    pub failed: usize,
}

impl RunReport {
    pub fn record(&mut self, outcome: &SendOutcome) {
        match outcome {
            SendOutcome::Sent(_) => self.sent += 1,
            SendOutcome::Suppressed => self.skipped += 1,
            SendOutcome::Failed => self.failed += 1,
        }
    }
}

/// A scheduled aggregation run.
#[async_trait]
pub trait DigestJob: Send + Sync {
    /// Stable job name, used for lock keys and stats.
    fn name(&self) -> &'static str;

    async fn run(&self) -> anyhow::Result<RunReport>;
}

/// Renders digest batches and hands them to the email gateway.
#[derive(Clone)]
pub struct DigestMailer {
    gateway: Arc<EmailGateway>,
    templates: Arc<TemplateEngine>,
}

impl DigestMailer {
    /// `templates` must have the digest templates registered.
    pub fn new(gateway: Arc<EmailGateway>, templates: Arc<TemplateEngine>) -> Self {
        Self { gateway, templates }
    }

    /// Render and send one batch.
    pub async fn deliver(&self, subject: &str, mut batch: DigestBatch) -> SendOutcome {
        resolve_links(&mut batch, self.templates.links());
        let html = match render_digest(&self.templates, subject, &batch) {
            Ok(html) => html,
            Err(e) => {
                tracing::error!(error = %e, subject = %subject, "Failed to render digest");
                return SendOutcome::Failed;
            }
        };

        self.gateway
            .deliver(EmailMessage::new(vec![batch.recipient_email], subject, html))
            .await
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;
    use beacon_common::error::AppError;
    use beacon_common::types::{SuppressionEntry, SuppressionReason};
    use beacon_notifier::email::templates::AppLinks;
    use beacon_notifier::email::transport::{EmailError, EmailTransport};
    use beacon_notifier::suppression::{SuppressionFilter, SuppressionList};
    use chrono::Utc;
    use uuid::Uuid;

    use super::*;
    use crate::models::{DigestTask, ProjectGroup, TeamGroup};

    /// Records every message; fails for addresses listed in `reject`.
    #[derive(Default)]
    pub struct RecordingTransport {
        pub sent: Mutex<Vec<EmailMessage>>,
        pub reject: Vec<String>,
    }

    #[async_trait]
    impl EmailTransport for RecordingTransport {
        async fn send(&self, _from: &str, message: &EmailMessage) -> Result<String, EmailError> {
            if message.to.iter().any(|to| self.reject.contains(to)) {
                return Err(EmailError::Rejected {
                    status: 422,
                    body: "rejected".to_string(),
                });
            }
            self.sent.lock().unwrap().push(message.clone());
            Ok(Uuid::new_v4().to_string())
        }

        fn name(&self) -> &'static str {
            "recording"
        }
    }

    /// Bounced-list stand-in.
    struct Bounced(Vec<String>);

    #[async_trait]
    impl SuppressionList for Bounced {
        async fn find(
            &self,
            reason: SuppressionReason,
            emails: &[String],
        ) -> Result<Vec<SuppressionEntry>, AppError> {
            if reason != SuppressionReason::Bounced {
                return Ok(vec![]);
            }
            Ok(emails
                .iter()
                .filter(|e| self.0.contains(e))
                .map(|email| SuppressionEntry {
                    email: email.clone(),
                    reason,
                })
                .collect())
        }
    }

    pub fn mailer(transport: Arc<RecordingTransport>) -> DigestMailer {
        suppressing_mailer(transport, &[])
    }

    pub fn suppressing_mailer(transport: Arc<RecordingTransport>, bounced: &[&str]) -> DigestMailer {
        let gateway = EmailGateway::new(
            transport,
            SuppressionFilter::new(Arc::new(Bounced(
                bounced.iter().map(|e| e.to_string()).collect(),
            ))),
            "Beacon <noreply@beacon.local>",
        );
        let mut templates = TemplateEngine::new(AppLinks::new("https://app.example.com")).unwrap();
        crate::templates::register_templates(&mut templates).unwrap();
        DigestMailer::new(Arc::new(gateway), Arc::new(templates))
    }

    pub fn task(name: &str) -> DigestTask {
        let id = Uuid::new_v4();
        DigestTask {
            id,
            name: name.to_string(),
            url: format!("/projects/p1?tab=tasks-list&task={}", id),
            status: None,
            end_date: Some(Utc::now()),
            members: vec![],
        }
    }

    pub fn team(tasks: Vec<DigestTask>) -> Vec<TeamGroup> {
        vec![TeamGroup {
            id: Uuid::new_v4(),
            name: "Core".to_string(),
            projects: vec![ProjectGroup {
                id: Uuid::new_v4(),
                name: "Launch".to_string(),
                url: "/projects/p1".to_string(),
                tasks,
            }],
        }]
    }
}
