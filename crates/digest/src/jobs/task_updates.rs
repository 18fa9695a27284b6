//! Task-update summary: assignment changes since the last delivered summary.
//!
//! Covered `task_updates` rows are marked sent only after the gateway accepted
//! the email, so a failed send is retried on the next tick. Rows for a
//! suppressed address are marked too: no later tick could deliver them.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use uuid::Uuid;

use beacon_notifier::email::SendOutcome;

use super::{DigestJob, DigestMailer, RunReport};
use crate::models::DigestBatch;
use crate::store::DigestStore;

const SUBJECT: &str = "Task assignment updates";

pub struct TaskUpdatesJob {
    store: Arc<dyn DigestStore>,
    mailer: DigestMailer,
}

impl TaskUpdatesJob {
    pub fn new(store: Arc<dyn DigestStore>, mailer: DigestMailer) -> Self {
        Self { store, mailer }
    }

    async fn mark_sent(&self, update_ids: &[Uuid]) {
        if let Err(e) = self.store.mark_task_updates_sent(update_ids).await {
            tracing::error!(
                error = %e,
                updates = update_ids.len(),
                "Failed to mark task updates as sent, they will be included again"
            );
        }
    }
}

#[async_trait]
impl DigestJob for TaskUpdatesJob {
    fn name(&self) -> &'static str {
        "task_updates"
    }

    async fn run(&self) -> anyhow::Result<RunReport> {
        let rows = self.store.task_updates().await?;
        let window_end = Utc::now();
        let window_start = window_end - Duration::minutes(10);
        let mut report = RunReport::default();

        for row in rows {
            let update_ids = row.update_ids;
            let batch = DigestBatch::new(row.name, row.email, window_start, window_end)
                .with_section("Assigned to you", row.assigned)
                .with_section("Removed from", row.unassigned);

            if batch.is_empty() {
                // Every referenced task is gone; nothing will ever render for these rows.
                report.skipped += 1;
                self.mark_sent(&update_ids).await;
                continue;
            }

            let outcome = self.mailer.deliver(SUBJECT, batch).await;
            report.record(&outcome);
            match outcome {
                SendOutcome::Sent(_) | SendOutcome::Suppressed => self.mark_sent(&update_ids).await,
                SendOutcome::Failed => {}
            }
        }

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::testing::{RecordingTransport, mailer, suppressing_mailer, task, team};
    use crate::models::TaskUpdatesDigest;
    use crate::store::MockDigestStore;

    fn row(email: &str, with_tasks: bool) -> TaskUpdatesDigest {
        TaskUpdatesDigest {
            user_id: Uuid::new_v4(),
            name: "Bea".to_string(),
            email: email.to_string(),
            update_ids: vec![Uuid::new_v4(), Uuid::new_v4()],
            assigned: if with_tasks { team(vec![task("Write docs")]) } else { vec![] },
            unassigned: vec![],
        }
    }

    #[tokio::test]
    async fn test_marks_updates_sent_after_delivery() {
        let delivered = row("bea@example.com", true);
        let ids = delivered.update_ids.clone();

        let mut store = MockDigestStore::new();
        store
            .expect_task_updates()
            .returning(move || Ok(vec![delivered.clone()]));
        store
            .expect_mark_task_updates_sent()
            .times(1)
            .withf(move |marked| marked.to_vec() == ids)
            .returning(|marked| Ok(marked.len() as u64));
        let transport = Arc::new(RecordingTransport::default());
        let job = TaskUpdatesJob::new(Arc::new(store), mailer(transport.clone()));

        let report = job.run().await.unwrap();

        assert_eq!(report.sent, 1);
        let sent = transport.sent.lock().unwrap();
        assert!(sent[0].html.contains("Assigned to you"));
        assert!(!sent[0].html.contains("Removed from"));
    }

    #[tokio::test]
    async fn test_failed_send_leaves_updates_pending() {
        let mut store = MockDigestStore::new();
        store
            .expect_task_updates()
            .returning(|| Ok(vec![row("bounce@example.com", true)]));
        store.expect_mark_task_updates_sent().never();
        let transport = Arc::new(RecordingTransport {
            reject: vec!["bounce@example.com".to_string()],
            ..Default::default()
        });
        let job = TaskUpdatesJob::new(Arc::new(store), mailer(transport));

        let report = job.run().await.unwrap();

        assert_eq!(report.failed, 1);
    }

    #[tokio::test]
    async fn test_suppressed_recipient_is_cleared_not_retried() {
        let bounced = row("gone@example.com", true);
        let ids = bounced.update_ids.clone();

        let mut store = MockDigestStore::new();
        store
            .expect_task_updates()
            .returning(move || Ok(vec![bounced.clone()]));
        store
            .expect_mark_task_updates_sent()
            .times(1)
            .withf(move |marked| marked.to_vec() == ids)
            .returning(|marked| Ok(marked.len() as u64));
        let transport = Arc::new(RecordingTransport::default());
        let job = TaskUpdatesJob::new(
            Arc::new(store),
            suppressing_mailer(transport.clone(), &["gone@example.com"]),
        );

        let report = job.run().await.unwrap();

        assert_eq!(report.skipped, 1);
        assert_eq!(report.failed, 0);
        assert!(transport.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_empty_summary_is_skipped_and_cleared() {
        let mut store = MockDigestStore::new();
        store
            .expect_task_updates()
            .returning(|| Ok(vec![row("bea@example.com", false)]));
        store
            .expect_mark_task_updates_sent()
            .times(1)
            .returning(|marked| Ok(marked.len() as u64));
        let transport = Arc::new(RecordingTransport::default());
        let job = TaskUpdatesJob::new(Arc::new(store), mailer(transport.clone()));

        let report = job.run().await.unwrap();

        assert_eq!(report.skipped, 1);
        assert!(transport.sent.lock().unwrap().is_empty());
    }
}
