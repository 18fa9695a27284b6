use beacon_notifier::email::templates::AppLinks;

use crate::models::DigestBatch;

/// Join names the way a sentence would: "Alice, Bob and Carol".
pub fn humanize_list(names: &[String]) -> String {
    match names {
        [] => String::new(),
        [only] => only.clone(),
        [init @ .., last] => format!("{} and {}", init.join(", "), last),
    }
}

/// Rewrite every app-relative URL in the batch into an absolute link.
pub fn resolve_links(batch: &mut DigestBatch, links: &AppLinks) {
    for section in &mut batch.sections {
        for team in &mut section.grouped_by_team {
            for project in &mut team.projects {
                project.url = links.absolute(&project.url);
                for task in &mut project.tasks {
                    task.url = links.absolute(&task.url);
                }
            }
        }
    }
}
