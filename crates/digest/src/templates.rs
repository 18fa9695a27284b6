//! Digest email rendering.

use serde::Serialize;

use beacon_notifier::email::templates::{TemplateEngine, TemplateError};

use crate::helpers::humanize_list;
use crate::models::{DigestBatch, DigestTask, TeamGroup};

const DIGEST_TEMPLATE: &str = "digest";

const DIGEST: &str = r#"<h2>{{heading}}</h2><p>Hi {{recipient}},</p>
{{#each sections}}<h3>{{title}}</h3>
{{#each teams}}<h4 style="color: #595959;">{{name}}</h4>
{{#each projects}}<p><a href="{{url}}"><b>{{name}}</b></a></p><ul>
{{#each tasks}}<li><a href="{{url}}">{{name}}</a>{{#if status}} <i>({{status}})</i>{{/if}}{{#if due}} due {{due}}{{/if}}{{#if members}}<br><small>{{members}}</small>{{/if}}</li>
{{/each}}</ul>
{{/each}}{{/each}}{{/each}}"#;

/// Add the digest body template to `engine`.
pub fn register_templates(engine: &mut TemplateEngine) -> Result<(), TemplateError> {
    engine.register_template(DIGEST_TEMPLATE, DIGEST)
}

#[derive(Serialize)]
struct DigestView<'a> {
    heading: &'a str,
    recipient: &'a str,
    sections: Vec<SectionView<'a>>,
}

#[derive(Serialize)]
struct SectionView<'a> {
    title: &'a str,
    teams: Vec<TeamView<'a>>,
}

#[derive(Serialize)]
struct TeamView<'a> {
    name: &'a str,
    projects: Vec<ProjectView<'a>>,
}

#[derive(Serialize)]
struct ProjectView<'a> {
    name: &'a str,
    url: &'a str,
    tasks: Vec<TaskView<'a>>,
}

#[derive(Serialize)]
struct TaskView<'a> {
    name: &'a str,
    url: &'a str,
    status: Option<&'a str>,
    due: Option<String>,
    members: String,
}

impl<'a> From<&'a TeamGroup> for TeamView<'a> {
    fn from(team: &'a TeamGroup) -> Self {
        Self {
            name: &team.name,
            projects: team
                .projects
                .iter()
                .map(|project| ProjectView {
                    name: &project.name,
                    url: &project.url,
                    tasks: project.tasks.iter().map(TaskView::from).collect(),
                })
                .collect(),
        }
    }
}

impl<'a> From<&'a DigestTask> for TaskView<'a> {
    fn from(task: &'a DigestTask) -> Self {
        Self {
            name: &task.name,
            url: &task.url,
            status: task.status.as_deref(),
            due: task.end_date.map(|d| d.format("%b %-d, %Y").to_string()),
            members: humanize_list(&task.members),
        }
    }
}

/// Render a digest batch. Links must already be absolute.
pub fn render_digest(
    engine: &TemplateEngine,
    heading: &str,
    batch: &DigestBatch,
) -> Result<String, TemplateError> {
    let view = DigestView {
        heading,
        recipient: &batch.recipient_name,
        sections: batch
            .sections
            .iter()
            .map(|section| SectionView {
                title: &section.title,
                teams: section.grouped_by_team.iter().map(TeamView::from).collect(),
            })
            .collect(),
    };

    engine.render_page(DIGEST_TEMPLATE, heading, &view)
}
