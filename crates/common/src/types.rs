use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Kinds of push events delivered to live client connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SocketEvent {
    NotificationsUpdate,
    InvitationsUpdate,
    TeamMemberRemoved,
    ProjectUpdatesAvailable,
    NewProjectCommentReceived,
    TaskStatusChanged,
}

impl std::fmt::Display for SocketEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SocketEvent::NotificationsUpdate => write!(f, "notifications_update"),
            SocketEvent::InvitationsUpdate => write!(f, "invitations_update"),
            SocketEvent::TeamMemberRemoved => write!(f, "team_member_removed"),
            SocketEvent::ProjectUpdatesAvailable => write!(f, "project_updates_available"),
            SocketEvent::NewProjectCommentReceived => write!(f, "new_project_comment_received"),
            SocketEvent::TaskStatusChanged => write!(f, "task_status_changed"),
        }
    }
}

/// Semantic kinds of domain events that end up as notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DomainEventKind {
    TaskAssigned,
    TaskUnassigned,
    TaskStatusChanged,
    ProjectCommentAdded,
    TeamInvitation,
    TeamMemberRemoved,
}

impl std::fmt::Display for DomainEventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DomainEventKind::TaskAssigned => write!(f, "task_assigned"),
            DomainEventKind::TaskUnassigned => write!(f, "task_unassigned"),
            DomainEventKind::TaskStatusChanged => write!(f, "task_status_changed"),
            DomainEventKind::ProjectCommentAdded => write!(f, "project_comment_added"),
            DomainEventKind::TeamInvitation => write!(f, "team_invitation"),
            DomainEventKind::TeamMemberRemoved => write!(f, "team_member_removed"),
        }
    }
}

/// Assignment change recorded for the task-update summary digest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
pub enum TaskUpdateKind {
    Assign,
    Unassign,
}

impl TaskUpdateKind {
    pub fn event_kind(self) -> DomainEventKind {
        match self {
            TaskUpdateKind::Assign => DomainEventKind::TaskAssigned,
            TaskUpdateKind::Unassign => DomainEventKind::TaskUnassigned,
        }
    }
}

impl std::fmt::Display for TaskUpdateKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskUpdateKind::Assign => write!(f, "ASSIGN"),
            TaskUpdateKind::Unassign => write!(f, "UNASSIGN"),
        }
    }
}

/// A user's standing in a team, as far as event ingress cares.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum TeamRole {
    Owner,
    Member,
}

/// Why an address is on a suppression list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SuppressionReason {
    Bounced,
    Spam,
}

impl SuppressionReason {
    /// Lists are consulted in this order.
    pub const ALL: [SuppressionReason; 2] = [SuppressionReason::Bounced, SuppressionReason::Spam];
}

impl std::fmt::Display for SuppressionReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SuppressionReason::Bounced => write!(f, "bounced"),
            SuppressionReason::Spam => write!(f, "spam"),
        }
    }
}

/// An address excluded from sending. Sourced externally (provider webhooks).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuppressionEntry {
    pub email: String,
    pub reason: SuppressionReason,
}

/// The task, project and team a domain event is about.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubjectIds {
    pub task_id: Option<Uuid>,
    pub project_id: Option<Uuid>,
    pub team_id: Option<Uuid>,
}

/// A semantic event constructed per trigger. Never persisted as its own entity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainEvent {
    pub kind: DomainEventKind,
    /// The user whose action caused the event, if any.
    pub actor_id: Option<Uuid>,
    pub subject: SubjectIds,
    /// Human-readable message (may contain `<b>` markup).
    pub message: String,
    pub occurred_at: DateTime<Utc>,
}

impl DomainEvent {
    pub fn new(
        kind: DomainEventKind,
        actor_id: Option<Uuid>,
        subject: SubjectIds,
        message: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            actor_id,
            subject,
            message: message.into(),
            occurred_at: Utc::now(),
        }
    }

    /// Whether delivering this event to `user_id` would notify the actor of their own action.
    pub fn is_self_notification(&self, user_id: Uuid) -> bool {
        self.actor_id == Some(user_id)
    }
}

/// A persisted in-app notification. The pipeline only ever creates these.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct NotificationRecord {
    pub id: Uuid,
    pub recipient_user_id: Uuid,
    pub team_id: Uuid,
    pub message: String,
    pub related_project_id: Option<Uuid>,
    pub related_task_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub read_at: Option<DateTime<Utc>>,
}

/// A live, addressable client connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionHandle {
    pub connection_id: String,
    pub user_id: Uuid,
    pub established_at: DateTime<Utc>,
}

/// A user who should hear about an event, with contact data and preferences.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Recipient {
    pub user_id: Uuid,
    pub team_id: Uuid,
    pub name: String,
    pub email: Option<String>,
    pub socket_id: Option<String>,
    pub email_notifications_enabled: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_socket_event_display_matches_serde() {
        for event in [
            SocketEvent::NotificationsUpdate,
            SocketEvent::InvitationsUpdate,
            SocketEvent::TeamMemberRemoved,
            SocketEvent::ProjectUpdatesAvailable,
            SocketEvent::NewProjectCommentReceived,
            SocketEvent::TaskStatusChanged,
        ] {
            let json = serde_json::to_value(event).unwrap();
            assert_eq!(json, serde_json::Value::String(event.to_string()));
        }
    }

    #[test]
    fn test_self_notification() {
        let actor = Uuid::new_v4();
        let event = DomainEvent::new(
            DomainEventKind::TaskAssigned,
            Some(actor),
            SubjectIds::default(),
            "assigned",
        );
        assert!(event.is_self_notification(actor));
        assert!(!event.is_self_notification(Uuid::new_v4()));

        let system = DomainEvent::new(
            DomainEventKind::TaskStatusChanged,
            None,
            SubjectIds::default(),
            "changed",
        );
        assert!(!system.is_self_notification(actor));
    }

    #[test]
    fn test_task_update_kind_serde() {
        let kind: TaskUpdateKind = serde_json::from_str("\"UNASSIGN\"").unwrap();
        assert_eq!(kind, TaskUpdateKind::Unassign);
        assert_eq!(kind.event_kind(), DomainEventKind::TaskUnassigned);
    }

    #[test]
    fn test_team_role_serde() {
        let role: TeamRole = serde_json::from_str("\"owner\"").unwrap();
        assert_eq!(role, TeamRole::Owner);
        assert_eq!(serde_json::to_value(TeamRole::Member).unwrap(), "member");
    }
}
