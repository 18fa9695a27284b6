//! Per-user daily digest: recently assigned, overdue and recently completed work.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration, Utc};

use super::{DigestJob, DigestMailer, RunReport};
use crate::models::DigestBatch;
use crate::store::DigestStore;

const SUBJECT: &str = "Your daily digest";

pub struct DailyDigestJob {
    store: Arc<dyn DigestStore>,
    mailer: DigestMailer,
}

impl DailyDigestJob {
    pub fn new(store: Arc<dyn DigestStore>, mailer: DigestMailer) -> Self {
        Self { store, mailer }
    }
}

#[async_trait]
impl DigestJob for DailyDigestJob {
    fn name(&self) -> &'static str {
        "daily_digest"
    }

    async fn run(&self) -> anyhow::Result<RunReport> {
        let rows = self.store.daily_digest().await?;
        let window_end = Utc::now();
        let window_start = window_end - Duration::days(1);
        let mut report = RunReport::default();

        for row in rows {
            let batch = DigestBatch::new(row.name, row.email, window_start, window_end)
                .with_section("Recently assigned to you", row.recently_assigned)
                .with_section("Overdue", row.overdue)
                .with_section("Recently completed", row.recently_completed);

            if batch.is_empty() {
                report.skipped += 1;
                continue;
            }

            let outcome = self.mailer.deliver(SUBJECT, batch).await;
            report.record(&outcome);
        }

        Ok(report)
    }
}
