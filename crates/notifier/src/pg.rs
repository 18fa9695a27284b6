//! Postgres implementation of the pipeline's store traits.

use async_trait::async_trait;
use sqlx::PgPool;
use uuid::Uuid;

use beacon_common::error::AppError;
use beacon_common::types::{Recipient, SuppressionEntry, SuppressionReason, TeamRole};

use crate::store::{
    ConnectionStore, NotificationContext, NotificationRequest, NotificationStore,
    ProjectAudience, TaskStatusChange, TaskUpdate, TaskUpdateContext,
};
use crate::suppression::SuppressionList;

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[derive(sqlx::FromRow)]
struct TaskStatusRow {
    task_id: Uuid,
    task_name: String,
    project_id: Uuid,
    project_name: String,
    team_id: Uuid,
    team_name: String,
    status: String,
    is_done: bool,
    actor_id: Option<Uuid>,
}

#[derive(sqlx::FromRow)]
struct ProjectRow {
    project_id: Uuid,
    project_name: String,
    team_id: Uuid,
    team_name: String,
}

#[async_trait]
impl NotificationStore for PgStore {
    async fn create_notification(
        &self,
        request: &NotificationRequest,
    ) -> Result<NotificationContext, AppError> {
        let context: NotificationContext = sqlx::query_as(
            r#"
            WITH inserted AS (
                INSERT INTO notifications (user_id, team_id, message, project_id, task_id)
                VALUES ($1, $2, $3, $4, $5)
                RETURNING
                    id,
                    user_id AS recipient_user_id,
                    team_id,
                    message,
                    project_id AS related_project_id,
                    task_id AS related_task_id,
                    created_at,
                    read_at
            )
            SELECT
                i.*,
                te.name AS team,
                p.name AS project,
                p.color_code AS project_color,
                u.email,
                COALESCE(u.email_notifications_enabled, FALSE) AS email_notifications_enabled
            FROM inserted i
            LEFT JOIN teams te ON te.id = i.team_id
            LEFT JOIN projects p ON p.id = i.related_project_id
            LEFT JOIN users u ON u.id = i.recipient_user_id
            "#,
        )
        .bind(request.user_id)
        .bind(request.team_id)
        .bind(&request.message)
        .bind(request.project_id)
        .bind(request.task_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(context)
    }

    async fn record_task_update(
        &self,
        update: &TaskUpdate,
    ) -> Result<Option<TaskUpdateContext>, AppError> {
        let context: Option<TaskUpdateContext> = sqlx::query_as(
            r#"
            WITH inserted AS (
                INSERT INTO task_updates (type, reporter_id, task_id, user_id, team_id)
                SELECT $1, $2, t.id, $4, $5 FROM tasks t WHERE t.id = $3
                RETURNING task_id, reporter_id, user_id
            )
            SELECT
                COALESCE(r.name, 'Someone') AS reporter_name,
                t.name AS task_name,
                t.project_id,
                u.socket_id
            FROM inserted i
            JOIN tasks t ON t.id = i.task_id
            LEFT JOIN users r ON r.id = i.reporter_id
            LEFT JOIN users u ON u.id = i.user_id
            "#,
        )
        .bind(update.kind)
        .bind(update.reporter_id)
        .bind(update.task_id)
        .bind(update.user_id)
        .bind(update.team_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(context)
    }

    async fn task_status_change(&self, task_id: Uuid) -> Result<Option<TaskStatusChange>, AppError> {
        let row: Option<TaskStatusRow> = sqlx::query_as(
            r#"
            SELECT
                t.id AS task_id,
                t.name AS task_name,
                p.id AS project_id,
                p.name AS project_name,
                te.id AS team_id,
                te.name AS team_name,
                s.name AS status,
                s.is_done,
                t.updated_by AS actor_id
            FROM tasks t
            JOIN projects p ON p.id = t.project_id
            JOIN teams te ON te.id = p.team_id
            JOIN task_statuses s ON s.id = t.status_id
            WHERE t.id = $1
            "#,
        )
        .bind(task_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let subscribers: Vec<Recipient> = sqlx::query_as(
            r#"
            SELECT u.id AS user_id, p.team_id, u.name, u.email, u.socket_id, u.email_notifications_enabled
            FROM task_subscribers ts
            JOIN users u ON u.id = ts.user_id
            JOIN tasks t ON t.id = ts.task_id
            JOIN projects p ON p.id = t.project_id
            WHERE ts.task_id = $1
            ORDER BY u.name
            "#,
        )
        .bind(task_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(Some(TaskStatusChange {
            task_id: row.task_id,
            task_name: row.task_name,
            project_id: row.project_id,
            project_name: row.project_name,
            team_id: row.team_id,
            team_name: row.team_name,
            status: row.status,
            is_done: row.is_done,
            actor_id: row.actor_id,
            subscribers,
        }))
    }

    async fn project_audience(&self, project_id: Uuid) -> Result<Option<ProjectAudience>, AppError> {
        let row: Option<ProjectRow> = sqlx::query_as(
            r#"
            SELECT p.id AS project_id, p.name AS project_name, te.id AS team_id, te.name AS team_name
            FROM projects p
            JOIN teams te ON te.id = p.team_id
            WHERE p.id = $1
            "#,
        )
        .bind(project_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let members: Vec<Recipient> = sqlx::query_as(
            r#"
            SELECT u.id AS user_id, tm.team_id, u.name, u.email, u.socket_id, u.email_notifications_enabled
            FROM project_members pm
            JOIN team_members tm ON tm.id = pm.team_member_id
            JOIN users u ON u.id = tm.user_id
            WHERE pm.project_id = $1 AND tm.active
            ORDER BY u.name
            "#,
        )
        .bind(project_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(Some(ProjectAudience {
            project_id: row.project_id,
            project_name: row.project_name,
            team_id: row.team_id,
            team_name: row.team_name,
            members,
        }))
    }

    async fn team_role(&self, team_id: Uuid, user_id: Uuid) -> Result<Option<TeamRole>, AppError> {
        let role: Option<TeamRole> = sqlx::query_scalar(
            r#"
            SELECT CASE WHEN te.owner_id = $2 THEN 'owner' ELSE 'member' END
            FROM teams te
            WHERE te.id = $1
              AND (
                te.owner_id = $2
                OR EXISTS (
                    SELECT 1 FROM team_members tm
                    WHERE tm.team_id = te.id AND tm.user_id = $2 AND tm.active
                )
              )
            "#,
        )
        .bind(team_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(role)
    }
}

#[async_trait]
impl ConnectionStore for PgStore {
    async fn attach(&self, user_id: Uuid, connection_id: &str) -> Result<(), AppError> {
        sqlx::query("UPDATE users SET socket_id = $2 WHERE id = $1")
            .bind(user_id)
            .bind(connection_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn detach(&self, connection_id: &str) -> Result<(), AppError> {
        sqlx::query("UPDATE users SET socket_id = NULL WHERE socket_id = $1")
            .bind(connection_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn hand_over(&self, from_connection_id: &str, to_connection_id: &str) -> Result<(), AppError> {
        sqlx::query("UPDATE users SET socket_id = $2 WHERE socket_id = $1")
            .bind(from_connection_id)
            .bind(to_connection_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn connection_for_user(&self, user_id: Uuid) -> Result<Option<String>, AppError> {
        let socket: Option<Option<String>> =
            sqlx::query_scalar("SELECT socket_id FROM users WHERE id = $1")
                .bind(user_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(socket.flatten())
    }

    async fn connection_for_team_member(
        &self,
        team_member_id: Uuid,
        exclude_user_id: Option<Uuid>,
    ) -> Result<Option<String>, AppError> {
        let socket: Option<Option<String>> = sqlx::query_scalar(
            r#"
            SELECT u.socket_id
            FROM team_members tm
            JOIN users u ON u.id = tm.user_id
            WHERE tm.id = $1 AND ($2::UUID IS NULL OR u.id <> $2)
            "#,
        )
        .bind(team_member_id)
        .bind(exclude_user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(socket.flatten())
    }
}

#[async_trait]
impl SuppressionList for PgStore {
    async fn find(
        &self,
        reason: SuppressionReason,
        emails: &[String],
    ) -> Result<Vec<SuppressionEntry>, AppError> {
        let lowered: Vec<String> = emails.iter().map(|e| e.to_lowercase()).collect();
        let sql = match reason {
            SuppressionReason::Bounced => "SELECT email FROM bounced_emails WHERE LOWER(email) = ANY($1)",
            SuppressionReason::Spam => "SELECT email FROM spam_emails WHERE LOWER(email) = ANY($1)",
        };

        let hits: Vec<String> = sqlx::query_scalar(sql)
            .bind(&lowered)
            .fetch_all(&self.pool)
            .await?;
        Ok(hits
            .into_iter()
            .map(|email| SuppressionEntry { email, reason })
            .collect())
    }
}
