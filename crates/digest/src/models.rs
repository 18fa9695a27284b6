//! Aggregate rows as returned by the digest functions, and the batch built from them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use uuid::Uuid;

/// `JSON_AGG` over zero rows yields `null`, not `[]`.
fn null_as_empty<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Ok(Option::<Vec<T>>::deserialize(deserializer)?.unwrap_or_default())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DigestTask {
    pub id: Uuid,
    pub name: String,
    /// App-relative until the job resolves it.
    pub url: String,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub end_date: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub members: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectGroup {
    pub id: Uuid,
    pub name: String,
    pub url: String,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub tasks: Vec<DigestTask>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TeamGroup {
    pub id: Uuid,
    pub name: String,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub projects: Vec<ProjectGroup>,
}

impl TeamGroup {
    pub fn task_count(&self) -> usize {
        self.projects.iter().map(|p| p.tasks.len()).sum()
    }
}

/// Row of `get_task_updates()`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskUpdatesDigest {
    pub user_id: Uuid,
    pub name: String,
    pub email: String,
    /// `task_updates` rows covered by this digest; marked sent after delivery.
    #[serde(default, deserialize_with = "null_as_empty")]
    pub update_ids: Vec<Uuid>,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub assigned: Vec<TeamGroup>,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub unassigned: Vec<TeamGroup>,
}

/// Row of `get_daily_digest()`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DailyDigest {
    pub user_id: Uuid,
    pub name: String,
    pub email: String,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub recently_assigned: Vec<TeamGroup>,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub overdue: Vec<TeamGroup>,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub recently_completed: Vec<TeamGroup>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DigestSubscriber {
    pub name: String,
    pub email: String,
}

/// Row of `get_project_daily_digest()`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectDigest {
    pub project_id: Uuid,
    pub name: String,
    pub team_name: String,
    pub url: String,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub subscribers: Vec<DigestSubscriber>,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub today_completed: Vec<DigestTask>,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub today_new: Vec<DigestTask>,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub due_tomorrow: Vec<DigestTask>,
}

impl ProjectDigest {
    /// Wrap a flat task list in a single team/project group for rendering.
    pub fn group(&self, tasks: &[DigestTask]) -> Vec<TeamGroup> {
        if tasks.is_empty() {
            return Vec::new();
        }

        vec![TeamGroup {
            id: Uuid::nil(),
            name: self.team_name.clone(),
            projects: vec![ProjectGroup {
                id: self.project_id,
                name: self.name.clone(),
                url: self.url.clone(),
                tasks: tasks.to_vec(),
            }],
        }]
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DigestSection {
    pub title: String,
    pub grouped_by_team: Vec<TeamGroup>,
}

impl DigestSection {
    pub fn task_count(&self) -> usize {
        self.grouped_by_team.iter().map(TeamGroup::task_count).sum()
    }
}

/// One recipient's rendered-to-be digest. Built per run and discarded after send.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DigestBatch {
    pub recipient_name: String,
    pub recipient_email: String,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub sections: Vec<DigestSection>,
}

impl DigestBatch {
    pub fn new(
        recipient_name: impl Into<String>,
        recipient_email: impl Into<String>,
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
    ) -> Self {
        Self {
            recipient_name: recipient_name.into(),
            recipient_email: recipient_email.into(),
            window_start,
            window_end,
            sections: Vec::new(),
        }
    }

    /// Add a section. Sections without tasks are dropped.
    pub fn with_section(mut self, title: impl Into<String>, grouped_by_team: Vec<TeamGroup>) -> Self {
        let section = DigestSection {
            title: title.into(),
            grouped_by_team,
        };
        if section.task_count() > 0 {
            self.sections.push(section);
        }
        self
    }

    pub fn task_count(&self) -> usize {
        self.sections.iter().map(DigestSection::task_count).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.task_count() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_null_lists_deserialize_as_empty() {
        let row: DailyDigest = serde_json::from_value(json!({
            "user_id": Uuid::nil(),
            "name": "Dana",
            "email": "dana@example.com",
            "recently_assigned": null,
            "overdue": [],
        }))
        .unwrap();

        assert!(row.recently_assigned.is_empty());
        assert!(row.overdue.is_empty());
        assert!(row.recently_completed.is_empty());
    }

    #[test]
    fn test_empty_sections_are_dropped() {
        let now = Utc::now();
        let team = TeamGroup {
            id: Uuid::new_v4(),
            name: "Core".to_string(),
            projects: vec![ProjectGroup {
                id: Uuid::new_v4(),
                name: "Launch".to_string(),
                url: "/projects/1".to_string(),
                tasks: vec![],
            }],
        };

        let batch = DigestBatch::new("Dana", "dana@example.com", now, now)
            .with_section("Overdue", vec![team])
            .with_section("Recently completed", vec![]);

        assert!(batch.sections.is_empty());
        assert!(batch.is_empty());
    }
}
