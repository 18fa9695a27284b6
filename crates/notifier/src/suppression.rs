//! Suppression filter. Drops bounced and spam-flagged addresses before any send.
//!
//! The lists themselves are maintained outside the pipeline (provider bounce and
//! complaint webhooks write them); here they are read-only.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;

use beacon_common::error::AppError;
use beacon_common::types::{SuppressionEntry, SuppressionReason};

/// Read access to a suppression list.
#[async_trait]
pub trait SuppressionList: Send + Sync {
    /// Return the entries on the `reason` list that match any of `emails`.
    async fn find(
        &self,
        reason: SuppressionReason,
        emails: &[String],
    ) -> Result<Vec<SuppressionEntry>, AppError>;
}

/// Applies every suppression list, bounced first, then spam.
#[derive(Clone)]
pub struct SuppressionFilter {
    list: Arc<dyn SuppressionList>,
}

impl SuppressionFilter {
    pub fn new(list: Arc<dyn SuppressionList>) -> Self {
        Self { list }
    }

    /// Remove suppressed addresses from `emails`, preserving order.
    ///
    /// Matching is case-insensitive. A lookup failure is returned to the caller
    /// rather than treated as "nothing suppressed".
    pub async fn retain_deliverable(&self, mut emails: Vec<String>) -> Result<Vec<String>, AppError> {
        for reason in SuppressionReason::ALL {
            if emails.is_empty() {
                break;
            }

            let hits = self.list.find(reason, &emails).await?;
            if hits.is_empty() {
                continue;
            }

            let suppressed: HashSet<String> =
                hits.iter().map(|entry| entry.email.to_lowercase()).collect();
            emails.retain(|email| {
                let drop = suppressed.contains(&email.to_lowercase());
                if drop {
                    tracing::info!(email = %email, reason = %reason, "Recipient suppressed");
                }
                !drop
            });
        }

        Ok(emails)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Fixed lists that also record the order they were consulted in.
    struct FixedLists {
        bounced: Vec<String>,
        spam: Vec<String>,
        calls: Mutex<Vec<SuppressionReason>>,
    }

    #[async_trait]
    impl SuppressionList for FixedLists {
        async fn find(
            &self,
            reason: SuppressionReason,
            emails: &[String],
        ) -> Result<Vec<SuppressionEntry>, AppError> {
            self.calls.lock().unwrap().push(reason);
            let list = match reason {
                SuppressionReason::Bounced => &self.bounced,
                SuppressionReason::Spam => &self.spam,
            };
            // Entries come back with the list's own casing.
            Ok(list
                .iter()
                .filter(|s| emails.iter().any(|e| s.eq_ignore_ascii_case(e)))
                .map(|email| SuppressionEntry {
                    email: email.clone(),
                    reason,
                })
                .collect())
        }
    }

    fn filter(bounced: &[&str], spam: &[&str]) -> (SuppressionFilter, Arc<FixedLists>) {
        let lists = Arc::new(FixedLists {
            bounced: bounced.iter().map(|s| s.to_string()).collect(),
            spam: spam.iter().map(|s| s.to_string()).collect(),
            calls: Mutex::new(Vec::new()),
        });
        (SuppressionFilter::new(lists.clone()), lists)
    }

    #[tokio::test]
    async fn test_removes_bounced_and_spam() {
        let (filter, lists) = filter(&["bounced@example.com"], &["SPAM@example.com"]);
        let kept = filter
            .retain_deliverable(vec![
                "ok@example.com".to_string(),
                "bounced@example.com".to_string(),
                "spam@example.com".to_string(),
            ])
            .await
            .unwrap();

        assert_eq!(kept, vec!["ok@example.com".to_string()]);
        assert_eq!(
            *lists.calls.lock().unwrap(),
            vec![SuppressionReason::Bounced, SuppressionReason::Spam]
        );
    }

    #[tokio::test]
    async fn test_stops_once_everything_is_suppressed() {
        let (filter, lists) = filter(&["gone@example.com"], &[]);
        let kept = filter
            .retain_deliverable(vec!["gone@example.com".to_string()])
            .await
            .unwrap();

        assert!(kept.is_empty());
        // The spam list is never consulted for an already-empty list.
        assert_eq!(*lists.calls.lock().unwrap(), vec![SuppressionReason::Bounced]);
    }
}
