//! Shared application state for the Axum server.

use std::sync::Arc;

use beacon_common::config::AppConfig;
use beacon_digest::scheduler::DigestStats;
use beacon_notifier::dispatcher::NotificationDispatcher;
use beacon_notifier::listener::ChangeFeedListener;
use beacon_notifier::registry::ConnectionRegistry;

/// Application state shared across all route handlers via Axum `State`.
#[derive(Clone)]
pub struct AppState {
    pub config: AppConfig,
    pub dispatcher: Arc<NotificationDispatcher>,
    pub digests: DigestStats,
    pub change_feed: Option<Arc<ChangeFeedListener>>,
}

impl AppState {
    pub fn new(config: AppConfig, dispatcher: Arc<NotificationDispatcher>, digests: DigestStats) -> Self {
        Self {
            config,
            dispatcher,
            digests,
            change_feed: None,
        }
    }

    pub fn with_change_feed(mut self, listener: Arc<ChangeFeedListener>) -> Self {
        self.change_feed = Some(listener);
        self
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        self.dispatcher.registry()
    }
}
