//! Per-project daily digest for project subscribers.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration, Utc};

use super::{DigestJob, DigestMailer, RunReport};
use crate::models::DigestBatch;
use crate::store::DigestStore;

pub struct ProjectDigestJob {
    store: Arc<dyn DigestStore>,
    mailer: DigestMailer,
}

impl ProjectDigestJob {
    pub fn new(store: Arc<dyn DigestStore>, mailer: DigestMailer) -> Self {
        Self { store, mailer }
    }
}

#[async_trait]
impl DigestJob for ProjectDigestJob {
    fn name(&self) -> &'static str {
        "project_digest"
    }

    async fn run(&self) -> anyhow::Result<RunReport> {
        let projects = self.store.project_digest().await?;
        let window_end = Utc::now();
        let window_start = window_end - Duration::days(1);
        let mut report = RunReport::default();

        for project in projects {
            let subject = format!("Daily update: {}", project.name);
            let completed = project.group(&project.today_completed);
            let new = project.group(&project.today_new);
            let due = project.group(&project.due_tomorrow);

            // One email per subscriber so addresses are never shared.
            for subscriber in &project.subscribers {
                let batch = DigestBatch::new(
                    subscriber.name.clone(),
                    subscriber.email.clone(),
                    window_start,
                    window_end,
                )
                .with_section("Completed today", completed.clone())
                .with_section("New today", new.clone())
                .with_section("Due tomorrow", due.clone());

                if batch.is_empty() {
                    report.skipped += 1;
                    continue;
                }

                let outcome = self.mailer.deliver(&subject, batch).await;
                report.record(&outcome);
            }
        }

        Ok(report)
    }
}
