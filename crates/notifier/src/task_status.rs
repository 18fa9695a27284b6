//! Turns task status change signals into subscriber notifications.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use uuid::Uuid;

use beacon_common::types::{DomainEvent, DomainEventKind, SocketEvent, SubjectIds};

use crate::dispatcher::{FanOutReport, NotificationDispatcher};
use crate::email::templates::{TaskStatusEmail, escape_html};
use crate::listener::SignalHandler;
use crate::store::NotificationStore;

pub struct TaskStatusSignalHandler {
    store: Arc<dyn NotificationStore>,
    dispatcher: Arc<NotificationDispatcher>,
}

impl TaskStatusSignalHandler {
    pub fn new(store: Arc<dyn NotificationStore>, dispatcher: Arc<NotificationDispatcher>) -> Self {
        Self { store, dispatcher }
    }

    /// Notify every subscriber of `task_id` except the actor. `None` when nothing was sent.
    pub async fn notify_status_change(&self, task_id: Uuid) -> Option<FanOutReport> {
        let change = match self.store.task_status_change(task_id).await {
            Ok(Some(change)) => change,
            Ok(None) => {
                tracing::debug!(task_id = %task_id, "Status change for unknown task ignored");
                return None;
            }
            Err(e) => {
                tracing::error!(error = %e, task_id = %task_id, "Failed to load task status change");
                return None;
            }
        };

        if change.subscribers.is_empty() {
            return None;
        }

        let event = DomainEvent::new(
            DomainEventKind::TaskStatusChanged,
            change.actor_id,
            SubjectIds {
                task_id: Some(change.task_id),
                project_id: Some(change.project_id),
                team_id: Some(change.team_id),
            },
            format!(
                "<b>{}</b> was moved to <b>{}</b>",
                escape_html(&change.task_name),
                escape_html(&change.status)
            ),
        );

        // Recipient address is filled in per subscriber by the dispatcher.
        let draft = match self.dispatcher.templates().task_status_email(&TaskStatusEmail {
            task_id: change.task_id,
            task_name: &change.task_name,
            project_id: change.project_id,
            project_name: &change.project_name,
            team_name: &change.team_name,
            status: &change.status,
            is_done: change.is_done,
        }) {
            Ok(draft) => Some(draft),
            Err(e) => {
                tracing::error!(error = %e, task_id = %task_id, "Failed to render status email, pushing only");
                None
            }
        };

        let report = self
            .dispatcher
            .fan_out(&event, &change.subscribers, draft.as_ref())
            .await;

        let payload = json!({
            "task_id": change.task_id,
            "project_id": change.project_id,
            "status": change.status,
            "is_done": change.is_done,
        });
        for subscriber in &change.subscribers {
            if event.is_self_notification(subscriber.user_id) {
                continue;
            }
            self.dispatcher
                .registry()
                .emit_to_user(subscriber.user_id, SocketEvent::TaskStatusChanged, payload.clone())
                .await;
        }

        Some(report)
    }
}

#[async_trait]
impl SignalHandler for TaskStatusSignalHandler {
    async fn handle_signal(&self, payload: &str) {
        let payload = payload.trim();
        if payload.is_empty() {
            return;
        }

        match Uuid::parse_str(payload) {
            Ok(task_id) => {
                self.notify_status_change(task_id).await;
            }
            Err(e) => {
                tracing::warn!(payload = %payload, error = %e, "Ignoring malformed task status signal");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::email::EmailGateway;
    use crate::email::templates::{AppLinks, TemplateEngine};
    use crate::email::transport::DisabledTransport;
    use crate::pool::DeliveryPool;
    use crate::registry::ConnectionRegistry;
    use crate::store::{
        MockConnectionStore, MockNotificationStore, NotificationContext, TaskStatusChange,
    };
    use crate::suppression::{SuppressionFilter, SuppressionList};
    use beacon_common::error::AppError;
    use beacon_common::types::{NotificationRecord, Recipient, SuppressionEntry, SuppressionReason};

    struct NoSuppression;

    #[async_trait]
    impl SuppressionList for NoSuppression {
        async fn find(
            &self,
            _: SuppressionReason,
            _: &[String],
        ) -> Result<Vec<SuppressionEntry>, AppError> {
            Ok(vec![])
        }
    }

    fn handler(store: MockNotificationStore) -> TaskStatusSignalHandler {
        let store: Arc<dyn NotificationStore> = Arc::new(store);
        let gateway = EmailGateway::new(
            Arc::new(DisabledTransport),
            SuppressionFilter::new(Arc::new(NoSuppression)),
            "Beacon <noreply@beacon.local>",
        );
        let dispatcher = NotificationDispatcher::new(
            store.clone(),
            Arc::new(ConnectionRegistry::new(Arc::new(MockConnectionStore::new()))),
            Arc::new(gateway),
            DeliveryPool::new(2),
            Arc::new(TemplateEngine::new(AppLinks::new("https://app.example.com")).unwrap()),
        );
        TaskStatusSignalHandler::new(store, Arc::new(dispatcher))
    }

    fn subscriber(user_id: Uuid, email_enabled: bool) -> Recipient {
        Recipient {
            user_id,
            team_id: Uuid::new_v4(),
            name: "Sub".to_string(),
            email: Some(format!("{}@example.com", user_id.simple())),
            socket_id: None,
            email_notifications_enabled: email_enabled,
        }
    }

    #[tokio::test]
    async fn test_empty_and_malformed_payloads_are_ignored() {
        let mut store = MockNotificationStore::new();
        store.expect_task_status_change().never();
        let handler = handler(store);

        handler.handle_signal("").await;
        handler.handle_signal("   ").await;
        handler.handle_signal("not-a-task-id").await;
    }

    #[tokio::test]
    async fn test_status_change_reaches_subscribers_except_actor() {
        let task_id = Uuid::new_v4();
        let actor = Uuid::new_v4();
        let wants_email = Uuid::new_v4();
        let push_only = Uuid::new_v4();

        let mut store = MockNotificationStore::new();
        store
            .expect_task_status_change()
            .withf(move |id| *id == task_id)
            .returning(move |_| {
                Ok(Some(TaskStatusChange {
                    task_id,
                    task_name: "Ship it".to_string(),
                    project_id: Uuid::new_v4(),
                    project_name: "Launch".to_string(),
                    team_id: Uuid::new_v4(),
                    team_name: "Core".to_string(),
                    status: "Done".to_string(),
                    is_done: true,
                    actor_id: Some(actor),
                    subscribers: vec![
                        subscriber(actor, true),
                        subscriber(wants_email, true),
                        subscriber(push_only, false),
                    ],
                }))
            });
        store
            .expect_create_notification()
            .times(2)
            .withf(move |req| {
                req.user_id != actor
                    && req.task_id == Some(task_id)
                    && req.message == "<b>Ship it</b> was moved to <b>Done</b>"
                    && req
                        .email
                        .as_ref()
                        .is_some_and(|e| e.subject == "Task completed: Ship it")
            })
            .returning(move |req| {
                Ok(NotificationContext {
                    record: NotificationRecord {
                        id: Uuid::new_v4(),
                        ..Default::default()
                    },
                    email: Some("sub@example.com".to_string()),
                    email_notifications_enabled: req.user_id == wants_email,
                    ..Default::default()
                })
            });
        let handler = handler(store);

        let report = handler.notify_status_change(task_id).await.unwrap();
        assert_eq!(report.persisted, 2);
        assert_eq!(report.skipped, 1);
        assert_eq!(report.emails_queued, 1);
    }

    #[tokio::test]
    async fn test_unknown_task_sends_nothing() {
        let mut store = MockNotificationStore::new();
        store.expect_task_status_change().returning(|_| Ok(None));
        store.expect_create_notification().never();
        let handler = handler(store);

        assert!(handler.notify_status_change(Uuid::new_v4()).await.is_none());
    }
}
