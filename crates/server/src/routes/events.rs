//! Event ingress: business logic reports domain events here.
//!
//! The authenticated user is always the actor and must belong to the team the
//! event is about; invitations and removals are owner-only. Message text is
//! escaped here and emails are rendered from templates, never taken from the
//! caller. Handlers return what the dispatcher did; a missed push or email is
//! not an error.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use beacon_common::error::AppError;
use beacon_common::types::{TaskUpdateKind, TeamRole};
use beacon_notifier::dispatcher::{
    DispatchOutcome, FanOutReport, InvitationSummary, InvitedMember, MemberRemoval,
};
use beacon_notifier::email::templates::{Inviter, escape_html};
use beacon_notifier::store::NotificationRequest;

use crate::middleware::auth::AuthUser;
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/notifications", post(create_notification))
        .route("/api/task-updates", post(create_task_update))
        .route("/api/invitations", post(send_invitations))
        .route("/api/team-members/removed", post(team_member_removed))
        .route("/api/projects/{id}/comments/notify", post(project_comment))
}

fn accepted(outcome: DispatchOutcome) -> Result<(StatusCode, Json<DispatchOutcome>), AppError> {
    match outcome {
        DispatchOutcome::Failed => Err(AppError::Internal(
            "Notification could not be persisted".to_string(),
        )),
        DispatchOutcome::NotFound => Err(AppError::NotFound("Task not found".to_string())),
        DispatchOutcome::Persisted { .. } => Ok((StatusCode::ACCEPTED, Json(outcome))),
        DispatchOutcome::SelfNotification => Ok((StatusCode::OK, Json(outcome))),
    }
}

/// Resolve `user_id`'s role in `team_id`; non-members are forbidden.
async fn require_member(state: &AppState, team_id: Uuid, user_id: Uuid) -> Result<TeamRole, AppError> {
    state
        .dispatcher
        .store()
        .team_role(team_id, user_id)
        .await?
        .ok_or_else(|| AppError::Forbidden("Not a member of this team".to_string()))
}

async fn require_owner(state: &AppState, team_id: Uuid, user_id: Uuid) -> Result<(), AppError> {
    match require_member(state, team_id, user_id).await? {
        TeamRole::Owner => Ok(()),
        TeamRole::Member => Err(AppError::Forbidden(
            "Only the team owner can do this".to_string(),
        )),
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NotificationBody {
    pub user_id: Uuid,
    pub team_id: Uuid,
    /// Ignored; the token user is the actor.
    #[serde(default)]
    pub actor_id: Option<Uuid>,
    #[serde(default)]
    pub socket_id: Option<String>,
    /// Plain text. Markup is escaped before it is stored or pushed.
    pub message: String,
    #[serde(default)]
    pub task_id: Option<Uuid>,
    #[serde(default)]
    pub project_id: Option<Uuid>,
    /// When set, the recipient also gets the notification email with this subject.
    #[serde(default)]
    pub email_subject: Option<String>,
}

async fn create_notification(
    auth: AuthUser,
    State(state): State<AppState>,
    Json(body): Json<NotificationBody>,
) -> Result<(StatusCode, Json<DispatchOutcome>), AppError> {
    if body.message.trim().is_empty() {
        return Err(AppError::Validation("message must not be empty".to_string()));
    }
    require_member(&state, body.team_id, auth.user_id).await?;
    require_member(&state, body.team_id, body.user_id).await?;

    let message = escape_html(body.message.trim());
    let email = body
        .email_subject
        .as_deref()
        .map(str::trim)
        .filter(|subject| !subject.is_empty())
        .and_then(|subject| {
            state
                .dispatcher
                .notification_draft(subject, &message, body.project_id, body.task_id)
        });

    let request = NotificationRequest {
        user_id: body.user_id,
        team_id: body.team_id,
        actor_id: Some(auth.user_id),
        socket_id: body.socket_id,
        message,
        task_id: body.task_id,
        project_id: body.project_id,
        email,
    };

    accepted(state.dispatcher.create_notification(request).await)
}

#[derive(Debug, Deserialize)]
pub struct TaskUpdateRequest {
    pub kind: TaskUpdateKind,
    pub task_id: Uuid,
    pub user_id: Uuid,
    pub team_id: Uuid,
}

async fn create_task_update(
    auth: AuthUser,
    State(state): State<AppState>,
    Json(body): Json<TaskUpdateRequest>,
) -> Result<(StatusCode, Json<DispatchOutcome>), AppError> {
    require_member(&state, body.team_id, auth.user_id).await?;
    require_member(&state, body.team_id, body.user_id).await?;

    let outcome = state
        .dispatcher
        .create_task_update(body.kind, auth.user_id, body.task_id, body.user_id, body.team_id)
        .await;

    accepted(outcome)
}

#[derive(Debug, Deserialize)]
pub struct InvitationRequest {
    pub inviter_name: String,
    pub team_id: Uuid,
    pub team_name: String,
    #[serde(default)]
    pub project_id: Option<Uuid>,
    pub members: Vec<InvitedMember>,
}

async fn send_invitations(
    auth: AuthUser,
    State(state): State<AppState>,
    Json(body): Json<InvitationRequest>,
) -> Result<(StatusCode, Json<InvitationSummary>), AppError> {
    if body.members.is_empty() {
        return Err(AppError::Validation("members must not be empty".to_string()));
    }
    require_owner(&state, body.team_id, auth.user_id).await?;

    let inviter = Inviter {
        user_id: auth.user_id,
        name: body.inviter_name,
        team_id: body.team_id,
        team_name: body.team_name,
    };
    let summary = state
        .dispatcher
        .send_team_members_invitations(&body.members, &inviter, body.project_id)
        .await;

    Ok((StatusCode::ACCEPTED, Json(summary)))
}

#[derive(Debug, Deserialize)]
pub struct RemovalRequest {
    pub actor_name: String,
    pub team_id: Uuid,
    pub team_name: String,
    pub removed_user_id: Uuid,
    #[serde(default)]
    pub socket_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct DeliveryCount {
    pub delivered: usize,
}

async fn team_member_removed(
    auth: AuthUser,
    State(state): State<AppState>,
    Json(body): Json<RemovalRequest>,
) -> Result<(StatusCode, Json<DeliveryCount>), AppError> {
    require_owner(&state, body.team_id, auth.user_id).await?;

    let removal = MemberRemoval {
        actor_id: auth.user_id,
        actor_name: body.actor_name,
        team_id: body.team_id,
        team_name: body.team_name,
        removed_user_id: body.removed_user_id,
        socket_id: body.socket_id,
    };
    let delivered = state.dispatcher.notify_team_member_removed(&removal).await;

    Ok((StatusCode::ACCEPTED, Json(DeliveryCount { delivered })))
}

#[derive(Debug, Deserialize)]
pub struct CommentRequest {
    pub author_name: String,
}

async fn project_comment(
    auth: AuthUser,
    State(state): State<AppState>,
    Path(project_id): Path<Uuid>,
    Json(body): Json<CommentRequest>,
) -> Result<(StatusCode, Json<FanOutReport>), AppError> {
    let report = state
        .dispatcher
        .notify_project_comment(auth.user_id, &body.author_name, project_id)
        .await;

    Ok((StatusCode::ACCEPTED, Json(report)))
}
