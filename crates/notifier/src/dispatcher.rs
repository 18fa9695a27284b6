//! Notification dispatcher: notifies one user about one event.
//!
//! Persists notification records through the store, pushes through the
//! connection registry and queues optional email on the delivery pool.
//! Nothing here returns an error: every failure is logged and reported in the
//! outcome, because callers are request handlers and background loops that
//! must never fail on a missed notification.

use std::collections::HashSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use beacon_common::types::{
    DomainEvent, DomainEventKind, Recipient, SocketEvent, SubjectIds, TaskUpdateKind,
};

use crate::email::templates::{Inviter, TemplateEngine, escape_html};
use crate::email::{EmailDraft, EmailGateway, EmailMessage};
use crate::pool::DeliveryPool;
use crate::registry::ConnectionRegistry;
use crate::store::{NotificationRequest, NotificationStore, TaskUpdate};

/// Push-only notification. Used when persistence already happened upstream.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationReceiver {
    #[serde(default)]
    pub socket_id: Option<String>,
    /// Recipient, for reaching their other devices when `socket_id` is stale.
    #[serde(default)]
    pub user_id: Option<Uuid>,
    #[serde(default)]
    pub team: Option<String>,
    pub team_id: Uuid,
    pub message: String,
    #[serde(default)]
    pub project_id: Option<Uuid>,
    #[serde(default)]
    pub project: Option<String>,
    #[serde(default)]
    pub project_color: Option<String>,
    #[serde(default)]
    pub task_id: Option<Uuid>,
}

impl NotificationReceiver {
    fn payload(&self) -> serde_json::Value {
        json!({
            "message": self.message,
            "team": self.team,
            "team_id": self.team_id,
            "project": self.project,
            "project_id": self.project_id,
            "project_color": self.project_color,
            "task_id": self.task_id,
        })
    }
}

/// Result of one notify call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DispatchOutcome {
    /// Recipient is the actor; nothing was persisted or pushed.
    SelfNotification,
    /// The subject no longer exists in the store.
    NotFound,
    /// The store call failed; nothing was pushed.
    Failed,
    Persisted {
        notification_id: Uuid,
        pushed: bool,
        email_queued: bool,
    },
}

/// Tally of a fan-out across several recipients.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FanOutReport {
    pub persisted: usize,
    pub pushed: usize,
    pub emails_queued: usize,
    pub skipped: usize,
    pub failed: usize,
}

impl FanOutReport {
    fn record(&mut self, outcome: DispatchOutcome) {
        match outcome {
            DispatchOutcome::SelfNotification => self.skipped += 1,
            DispatchOutcome::NotFound | DispatchOutcome::Failed => self.failed += 1,
            DispatchOutcome::Persisted {
                pushed,
                email_queued,
                ..
            } => {
                self.persisted += 1;
                self.pushed += usize::from(pushed);
                self.emails_queued += usize::from(email_queued);
            }
        }
    }
}

/// A member added to a team, as returned by the host's member-creation procedure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvitedMember {
    #[serde(default)]
    pub name: Option<String>,
    pub email: String,
    /// `true` when the address has no account yet.
    #[serde(default)]
    pub is_new: bool,
    #[serde(default)]
    pub team_member_id: Option<Uuid>,
    #[serde(default)]
    pub team_member_user_id: Option<Uuid>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct InvitationSummary {
    pub invited: usize,
    pub duplicates: usize,
    pub emails_queued: usize,
    pub pushed: usize,
}

/// A member removed from a team.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberRemoval {
    pub actor_id: Uuid,
    pub actor_name: String,
    pub team_id: Uuid,
    pub team_name: String,
    pub removed_user_id: Uuid,
    #[serde(default)]
    pub socket_id: Option<String>,
}

pub struct NotificationDispatcher {
    store: Arc<dyn NotificationStore>,
    registry: Arc<ConnectionRegistry>,
    gateway: Arc<EmailGateway>,
    pool: DeliveryPool,
    templates: Arc<TemplateEngine>,
}

impl NotificationDispatcher {
    pub fn new(
        store: Arc<dyn NotificationStore>,
        registry: Arc<ConnectionRegistry>,
        gateway: Arc<EmailGateway>,
        pool: DeliveryPool,
        templates: Arc<TemplateEngine>,
    ) -> Self {
        Self {
            store,
            registry,
            gateway,
            pool,
            templates,
        }
    }

    pub fn store(&self) -> &Arc<dyn NotificationStore> {
        &self.store
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn pool(&self) -> &DeliveryPool {
        &self.pool
    }

    pub fn templates(&self) -> &Arc<TemplateEngine> {
        &self.templates
    }

    /// Push a notification to every live device of the recipient. Never persists.
    ///
    /// The connection id is tried first; if it is gone, the recipient's other
    /// live handles are used.
    pub async fn send_notification(&self, receiver: &NotificationReceiver) -> bool {
        let payload = receiver.payload();

        if let Some(socket_id) = receiver.socket_id.as_deref() {
            let delivered = self
                .registry
                .emit_to_owner(SocketEvent::NotificationsUpdate, socket_id, payload.clone())
                .await;
            if delivered > 0 {
                return true;
            }
        }

        match receiver.user_id {
            Some(user_id) => {
                self.registry
                    .emit_to_user(user_id, SocketEvent::NotificationsUpdate, payload)
                    .await
                    > 0
            }
            None => false,
        }
    }

    /// Render the generic notification email for an already escaped message.
    /// `None` (logged) when rendering fails.
    pub fn notification_draft(
        &self,
        subject: &str,
        message: &str,
        project_id: Option<Uuid>,
        task_id: Option<Uuid>,
    ) -> Option<EmailDraft> {
        let links = self.templates.links();
        let url = match (project_id, task_id) {
            (Some(project_id), Some(task_id)) => Some(links.task(project_id, task_id)),
            (Some(project_id), None) => Some(links.project(project_id)),
            _ => None,
        };

        match self.templates.notification_email(subject, message, url) {
            Ok(draft) => Some(draft),
            Err(e) => {
                tracing::error!(error = %e, subject = %subject, "Failed to render notification email");
                None
            }
        }
    }

    /// Persist a notification, then push it, then queue its email if the recipient wants one.
    pub async fn create_notification(&self, request: NotificationRequest) -> DispatchOutcome {
        if request.actor_id == Some(request.user_id) {
            return DispatchOutcome::SelfNotification;
        }

        let context = match self.store.create_notification(&request).await {
            Ok(context) => context,
            Err(e) => {
                tracing::error!(
                    error = %e,
                    user_id = %request.user_id,
                    team_id = %request.team_id,
                    "Failed to persist notification, push skipped"
                );
                return DispatchOutcome::Failed;
            }
        };

        let receiver = NotificationReceiver {
            socket_id: request.socket_id.clone(),
            user_id: Some(request.user_id),
            team: context.team.clone(),
            team_id: request.team_id,
            message: request.message.clone(),
            project_id: request.project_id,
            project: context.project.clone(),
            project_color: context.project_color.clone(),
            task_id: request.task_id,
        };
        let pushed = self.send_notification(&receiver).await;

        let mut email_queued = false;
        if let Some(draft) = request.email {
            match context.email.as_deref() {
                Some(to) if context.email_notifications_enabled => {
                    self.queue_email("notification_email", draft.addressed_to(to)).await;
                    email_queued = true;
                }
                _ => {
                    tracing::debug!(user_id = %request.user_id, "Email notifications disabled for recipient");
                }
            }
        }

        tracing::debug!(
            notification_id = %context.record.id,
            user_id = %request.user_id,
            pushed,
            email_queued,
            "Notification created"
        );

        DispatchOutcome::Persisted {
            notification_id: context.record.id,
            pushed,
            email_queued,
        }
    }

    /// Notify a user that they were assigned to or removed from a task.
    pub async fn create_task_update(
        &self,
        kind: TaskUpdateKind,
        reporter_id: Uuid,
        task_id: Uuid,
        user_id: Uuid,
        team_id: Uuid,
    ) -> DispatchOutcome {
        if reporter_id == user_id {
            return DispatchOutcome::SelfNotification;
        }

        let update = TaskUpdate {
            kind,
            reporter_id,
            task_id,
            user_id,
            team_id,
        };

        let event = kind.event_kind();
        let context = match self.store.record_task_update(&update).await {
            Ok(Some(context)) => context,
            Ok(None) => {
                tracing::debug!(event = %event, task_id = %task_id, "Task update for unknown task ignored");
                return DispatchOutcome::NotFound;
            }
            Err(e) => {
                tracing::error!(
                    error = %e,
                    event = %event,
                    task_id = %task_id,
                    user_id = %user_id,
                    "Failed to record task update"
                );
                return DispatchOutcome::Failed;
            }
        };

        let reporter = escape_html(&context.reporter_name);
        let task = escape_html(&context.task_name);
        let message = match kind {
            TaskUpdateKind::Assign => format!("<b>{}</b> has assigned you in <b>{}</b>", reporter, task),
            TaskUpdateKind::Unassign => {
                format!("<b>{}</b> has removed you from <b>{}</b>", reporter, task)
            }
        };

        self.create_notification(NotificationRequest {
            user_id,
            team_id,
            actor_id: Some(reporter_id),
            socket_id: context.socket_id,
            message,
            task_id: Some(task_id),
            project_id: context.project_id,
            email: None,
        })
        .await
    }

    /// Deliver one event to many recipients. A failure for one never stops the rest.
    pub async fn fan_out(
        &self,
        event: &DomainEvent,
        recipients: &[Recipient],
        email: Option<&EmailDraft>,
    ) -> FanOutReport {
        let mut report = FanOutReport::default();

        for recipient in recipients {
            if event.is_self_notification(recipient.user_id) {
                report.skipped += 1;
                continue;
            }

            let outcome = self
                .create_notification(NotificationRequest {
                    user_id: recipient.user_id,
                    team_id: event.subject.team_id.unwrap_or(recipient.team_id),
                    actor_id: event.actor_id,
                    socket_id: recipient.socket_id.clone(),
                    message: event.message.clone(),
                    task_id: event.subject.task_id,
                    project_id: event.subject.project_id,
                    email: email.cloned(),
                })
                .await;
            report.record(outcome);
        }

        tracing::info!(
            kind = %event.kind,
            recipients = recipients.len(),
            persisted = report.persisted,
            pushed = report.pushed,
            skipped = report.skipped,
            failed = report.failed,
            "Event fanned out"
        );
        report
    }

    /// Push an in-app invitation notice to the invited team member.
    pub async fn send_invitation(&self, inviter: &Inviter, team_member_id: Uuid) -> bool {
        let message = format!(
            "<b>{}</b> has invited you to work with <b>{}</b>.",
            escape_html(&inviter.name),
            escape_html(&inviter.team_name)
        );
        let payload = json!({
            "message": message,
            "team": inviter.team_name,
            "team_id": inviter.team_id,
        });

        self.registry
            .emit_by_team_member_id(
                team_member_id,
                Some(inviter.user_id),
                SocketEvent::InvitationsUpdate,
                payload,
            )
            .await
            > 0
    }

    /// Email and push invitations to newly added members, once per address.
    pub async fn send_team_members_invitations(
        &self,
        members: &[InvitedMember],
        inviter: &Inviter,
        project_id: Option<Uuid>,
    ) -> InvitationSummary {
        let mut summary = InvitationSummary::default();
        let mut seen = HashSet::new();

        for member in members {
            let email = member.email.trim();
            if email.is_empty() || !seen.insert(email.to_lowercase()) {
                summary.duplicates += 1;
                continue;
            }
            summary.invited += 1;

            let name = member
                .name
                .clone()
                .filter(|n| !n.trim().is_empty())
                .unwrap_or_else(|| email.split('@').next().unwrap_or(email).to_string());

            match self.templates.invitation_email(
                inviter,
                email,
                &name,
                !member.is_new,
                member.team_member_user_id,
                project_id.is_some(),
            ) {
                Ok(message) => {
                    self.queue_email("invitation_email", message).await;
                    summary.emails_queued += 1;
                }
                Err(e) => {
                    tracing::error!(error = %e, team_id = %inviter.team_id, "Failed to render invitation email");
                }
            }

            if let Some(team_member_id) = member.team_member_id
                && self.send_invitation(inviter, team_member_id).await
            {
                summary.pushed += 1;
            }
        }

        tracing::info!(
            team_id = %inviter.team_id,
            invited = summary.invited,
            duplicates = summary.duplicates,
            pushed = summary.pushed,
            "Team invitations dispatched"
        );
        summary
    }

    /// Tell a removed member, on every connection they hold, that they lost access.
    pub async fn notify_team_member_removed(&self, removal: &MemberRemoval) -> usize {
        if removal.actor_id == removal.removed_user_id {
            return 0;
        }

        let message = format!(
            "You have been removed from <b>{}</b> by <b>{}</b>",
            escape_html(&removal.team_name),
            escape_html(&removal.actor_name)
        );

        self.send_notification(&NotificationReceiver {
            socket_id: removal.socket_id.clone(),
            user_id: Some(removal.removed_user_id),
            team: Some(removal.team_name.clone()),
            team_id: removal.team_id,
            message: message.clone(),
            ..Default::default()
        })
        .await;

        self.registry
            .emit_by_user_id(
                removal.removed_user_id,
                Some(removal.actor_id),
                SocketEvent::TeamMemberRemoved,
                json!({ "team_id": removal.team_id, "message": message }),
            )
            .await
    }

    /// Notify every project member except the author about a new project comment.
    pub async fn notify_project_comment(
        &self,
        author_id: Uuid,
        author_name: &str,
        project_id: Uuid,
    ) -> FanOutReport {
        let audience = match self.store.project_audience(project_id).await {
            Ok(Some(audience)) => audience,
            Ok(None) => {
                tracing::debug!(project_id = %project_id, "Comment on unknown project ignored");
                return FanOutReport::default();
            }
            Err(e) => {
                tracing::error!(error = %e, project_id = %project_id, "Failed to load project members");
                return FanOutReport::default();
            }
        };

        let event = DomainEvent::new(
            DomainEventKind::ProjectCommentAdded,
            Some(author_id),
            SubjectIds {
                task_id: None,
                project_id: Some(project_id),
                team_id: Some(audience.team_id),
            },
            format!(
                "<b>{}</b> added a comment on <b>{}</b> ({})",
                escape_html(author_name),
                escape_html(&audience.project_name),
                escape_html(&audience.team_name)
            ),
        );

        let report = self.fan_out(&event, &audience.members, None).await;

        for member in audience.members.iter().filter(|m| m.user_id != author_id) {
            self.registry
                .emit_to_user(member.user_id, SocketEvent::NewProjectCommentReceived, json!(true))
                .await;
        }

        report
    }

    /// Hand an email to the delivery pool. The gateway logs its own failures.
    async fn queue_email(&self, label: &'static str, message: EmailMessage) {
        let gateway = self.gateway.clone();
        self.pool
            .submit(label, async move {
                gateway.send(message).await;
            })
            .await;
    }
}
