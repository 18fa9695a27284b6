//! Email templates with Handlebars, plus the shared link resolver.
//!
//! Page bodies are registered templates rendered into a common layout. Values
//! are escaped by Handlebars; only the pre-rendered body and notification
//! messages (which carry their own `<b>` markup over escaped text) go in raw.

use handlebars::Handlebars;
use reqwest::Url;
use serde::Serialize;
use serde_json::json;
use thiserror::Error;
use uuid::Uuid;

use super::{EmailDraft, EmailMessage};

/// Escape text for HTML. Used where a message is built with inline markup.
pub use handlebars::html_escape as escape_html;

const LAYOUT: &str = r#"<!DOCTYPE html><html><head><meta charset="utf-8"><title>{{title}}</title></head>
<body style="font-family: Arial, sans-serif; color: #262626;">
<div style="max-width: 600px; margin: 0 auto;">{{{body}}}
<p style="font-size: 12px; color: #8c8c8c;"><a href="{{settings_url}}">Manage notification settings</a></p>
</div></body></html>"#;

const INVITATION: &str = r#"<p>Hi {{recipient}},</p>
<p><b>{{inviter}}</b> has invited you to join {{#if to_project}}a project in {{/if}}<b>{{team}}</b>.</p>
<p><a href="{{url}}">{{action}}</a></p>"#;

const TASK_STATUS: &str = r#"<p><a href="{{task_url}}"><b>{{task}}</b></a> in <a href="{{project_url}}">{{project}}</a> ({{team}}) was moved to <b>{{status}}</b>.</p>"#;

const NOTIFICATION: &str = r#"<p>{{{message}}}</p>
{{#if url}}<p><a href="{{url}}">Open in Beacon</a></p>{{/if}}"#;

#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("Failed to register template: {0}")]
    Register(#[from] handlebars::TemplateError),

    #[error("Failed to render template: {0}")]
    Render(#[from] handlebars::RenderError),
}

/// Resolves app-relative paths into absolute links.
#[derive(Debug, Clone)]
pub struct AppLinks {
    base_url: String,
}

impl AppLinks {
    pub fn new(base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self { base_url }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Turn a path such as `/projects/1` into an absolute URL. Absolute inputs pass through.
    pub fn absolute(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            return path.to_string();
        }
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    pub fn project(&self, project_id: Uuid) -> String {
        self.absolute(&format!("/projects/{}", project_id))
    }

    pub fn task(&self, project_id: Uuid, task_id: Uuid) -> String {
        self.absolute(&format!(
            "/projects/{}?tab=tasks-list&task={}",
            project_id, task_id
        ))
    }

    pub fn notification_settings(&self) -> String {
        self.absolute("/settings/notifications")
    }

    /// Sign-up link with the address (and optional pending user) as encoded query pairs.
    pub fn signup(&self, email: &str, team_member_user_id: Option<Uuid>) -> String {
        let base = self.absolute("/auth/signup");
        let Ok(mut url) = Url::parse(&base) else {
            return base;
        };

        {
            let mut query = url.query_pairs_mut();
            query.append_pair("email", email);
            if let Some(id) = team_member_user_id {
                query.append_pair("user", &id.to_string());
            }
        }
        url.into()
    }

    pub fn login(&self) -> String {
        self.absolute("/auth/login")
    }
}

/// Who sent a team invitation.
#[derive(Debug, Clone)]
pub struct Inviter {
    pub user_id: Uuid,
    pub name: String,
    pub team_id: Uuid,
    pub team_name: String,
}

/// Data for a task status change email.
#[derive(Debug, Clone)]
pub struct TaskStatusEmail<'a> {
    pub task_id: Uuid,
    pub task_name: &'a str,
    pub project_id: Uuid,
    pub project_name: &'a str,
    pub team_name: &'a str,
    pub status: &'a str,
    pub is_done: bool,
}

/// Handlebars-based renderer for every email the pipeline sends.
pub struct TemplateEngine {
    handlebars: Handlebars<'static>,
    links: AppLinks,
}

impl TemplateEngine {
    /// Create an engine with the layout and the event email templates registered.
    pub fn new(links: AppLinks) -> Result<Self, TemplateError> {
        let mut engine = Self {
            handlebars: Handlebars::new(),
            links,
        };

        engine.register_template("layout", LAYOUT)?;
        engine.register_template("invitation", INVITATION)?;
        engine.register_template("task_status", TASK_STATUS)?;
        engine.register_template("notification", NOTIFICATION)?;

        Ok(engine)
    }

    pub fn links(&self) -> &AppLinks {
        &self.links
    }

    /// Register (or replace) a page body template.
    pub fn register_template(&mut self, name: &str, source: &str) -> Result<(), TemplateError> {
        self.handlebars.register_template_string(name, source)?;
        Ok(())
    }

    /// Render the `name` body with `data` and wrap it in the layout.
    pub fn render_page<T: Serialize>(
        &self,
        name: &str,
        title: &str,
        data: &T,
    ) -> Result<String, TemplateError> {
        let body = self.handlebars.render(name, data)?;
        let page = self.handlebars.render(
            "layout",
            &json!({
                "title": title,
                "body": body,
                "settings_url": self.links.notification_settings(),
            }),
        )?;
        Ok(page)
    }

    /// Join-team email. Existing users get a "you were added" notice, new ones a sign-up link.
    pub fn invitation_email(
        &self,
        inviter: &Inviter,
        to: &str,
        recipient_name: &str,
        is_existing_user: bool,
        team_member_user_id: Option<Uuid>,
        to_project: bool,
    ) -> Result<EmailMessage, TemplateError> {
        let subject = if is_existing_user {
            format!("{} has added you to {}", inviter.name, inviter.team_name)
        } else {
            format!("{} has invited you to work with {}", inviter.name, inviter.team_name)
        };

        let (action, url) = if is_existing_user {
            ("Open Beacon", self.links.login())
        } else {
            ("Accept invitation", self.links.signup(to, team_member_user_id))
        };

        let html = self.render_page(
            "invitation",
            &subject,
            &json!({
                "recipient": recipient_name,
                "inviter": inviter.name,
                "team": inviter.team_name,
                "to_project": to_project,
                "url": url,
                "action": action,
            }),
        )?;

        Ok(EmailMessage::new(vec![to.to_string()], subject, html))
    }

    /// Email sent to task subscribers when a task's status changes.
    pub fn task_status_email(&self, data: &TaskStatusEmail<'_>) -> Result<EmailDraft, TemplateError> {
        let subject = if data.is_done {
            format!("Task completed: {}", data.task_name)
        } else {
            format!("Task status changed: {}", data.task_name)
        };

        let html = self.render_page(
            "task_status",
            &subject,
            &json!({
                "task_url": self.links.task(data.project_id, data.task_id),
                "task": data.task_name,
                "project_url": self.links.project(data.project_id),
                "project": data.project_name,
                "team": data.team_name,
                "status": data.status,
            }),
        )?;

        Ok(EmailDraft { subject, html })
    }

    /// Email for a generic notification. `message` must already be escaped.
    pub fn notification_email(
        &self,
        subject: &str,
        message: &str,
        url: Option<String>,
    ) -> Result<EmailDraft, TemplateError> {
        let html = self.render_page(
            "notification",
            subject,
            &json!({ "message": message, "url": url }),
        )?;
        Ok(EmailDraft {
            subject: subject.to_string(),
            html,
        })
    }
}
