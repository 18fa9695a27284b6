//! Persistence seams for the pipeline.
//!
//! The relational store and its stored procedures belong to the host
//! application; these traits are the only calls the pipeline makes into it.
//! `crate::pg::PgStore` is the Postgres implementation.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use beacon_common::error::AppError;
use beacon_common::types::{NotificationRecord, Recipient, TaskUpdateKind, TeamRole};

pub use crate::email::EmailDraft;

/// Input to `NotificationDispatcher::create_notification`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationRequest {
    pub user_id: Uuid,
    pub team_id: Uuid,
    /// The acting user. A request where `actor_id == user_id` is dropped.
    #[serde(default)]
    pub actor_id: Option<Uuid>,
    #[serde(default)]
    pub socket_id: Option<String>,
    pub message: String,
    #[serde(default)]
    pub task_id: Option<Uuid>,
    #[serde(default)]
    pub project_id: Option<Uuid>,
    /// Optional email, sent only if the recipient enabled email notifications.
    #[serde(default)]
    pub email: Option<EmailDraft>,
}

/// What the store returns after persisting a notification: the record plus display context.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct NotificationContext {
    #[sqlx(flatten)]
    #[serde(flatten)]
    pub record: NotificationRecord,
    pub team: Option<String>,
    pub project: Option<String>,
    pub project_color: Option<String>,
    pub email: Option<String>,
    pub email_notifications_enabled: bool,
}

/// An assignment change, recorded for the task-update summary digest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskUpdate {
    pub kind: TaskUpdateKind,
    pub reporter_id: Uuid,
    pub task_id: Uuid,
    pub user_id: Uuid,
    pub team_id: Uuid,
}

/// Display data resolved while recording a task update.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct TaskUpdateContext {
    pub reporter_name: String,
    pub task_name: String,
    pub project_id: Option<Uuid>,
    pub socket_id: Option<String>,
}

/// A task status change and everyone subscribed to the task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskStatusChange {
    pub task_id: Uuid,
    pub task_name: String,
    pub project_id: Uuid,
    pub project_name: String,
    pub team_id: Uuid,
    pub team_name: String,
    pub status: String,
    pub is_done: bool,
    /// Who changed the status, when the store knows.
    pub actor_id: Option<Uuid>,
    #[serde(default)]
    pub subscribers: Vec<Recipient>,
}

/// A project and its members, for project-wide notices.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectAudience {
    pub project_id: Uuid,
    pub project_name: String,
    pub team_id: Uuid,
    pub team_name: String,
    #[serde(default)]
    pub members: Vec<Recipient>,
}

/// Notification persistence and event-context lookups.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait NotificationStore: Send + Sync {
    /// Persist a notification record and return display context for the push.
    async fn create_notification(
        &self,
        request: &NotificationRequest,
    ) -> Result<NotificationContext, AppError>;

    /// Record an assignment change. `None` when the task no longer exists.
    async fn record_task_update(
        &self,
        update: &TaskUpdate,
    ) -> Result<Option<TaskUpdateContext>, AppError>;

    /// Resolve a task's status change and its subscribers. `None` for unknown tasks.
    async fn task_status_change(&self, task_id: Uuid) -> Result<Option<TaskStatusChange>, AppError>;

    /// Resolve a project's members. `None` for unknown projects.
    async fn project_audience(&self, project_id: Uuid) -> Result<Option<ProjectAudience>, AppError>;

    /// The user's role in the team. `None` when they are not an active member.
    async fn team_role(&self, team_id: Uuid, user_id: Uuid) -> Result<Option<TeamRole>, AppError>;
}

/// The store-side record of which connection each user is reachable on.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ConnectionStore: Send + Sync {
    /// Record `connection_id` as the user's current connection.
    async fn attach(&self, user_id: Uuid, connection_id: &str) -> Result<(), AppError>;

    /// Clear the record, if it still points at `connection_id`.
    async fn detach(&self, connection_id: &str) -> Result<(), AppError>;

    /// Point the record at `to_connection_id`, if it still points at `from_connection_id`.
    async fn hand_over(&self, from_connection_id: &str, to_connection_id: &str) -> Result<(), AppError>;

    async fn connection_for_user(&self, user_id: Uuid) -> Result<Option<String>, AppError>;

    /// Resolve a team member's backing user connection, skipping `exclude_user_id`.
    async fn connection_for_team_member(
        &self,
        team_member_id: Uuid,
        exclude_user_id: Option<Uuid>,
    ) -> Result<Option<String>, AppError>;
}
