//! Change-feed listener.
//!
//! Subscribes to a named database notification channel and hands every
//! payload to a `SignalHandler`. The listener itself never retries: when the
//! stream ends it flips to disconnected and `run_supervised` decides when to
//! reconnect.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::BoxStream;
use sqlx::PgPool;
use sqlx::postgres::PgListener;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use beacon_common::error::AppError;

/// Payloads received on a channel, in arrival order.
pub type SignalStream = BoxStream<'static, Result<String, AppError>>;

/// Something that can open a subscription to a named channel.
#[async_trait]
pub trait SignalSource: Send + Sync {
    async fn subscribe(&self, channel: &str) -> Result<SignalStream, AppError>;
}

/// Reacts to one change signal. Must not fail the listener.
#[async_trait]
pub trait SignalHandler: Send + Sync {
    async fn handle_signal(&self, payload: &str);
}

/// `LISTEN`/`NOTIFY` source on a dedicated Postgres connection.
pub struct PgSignalSource {
    pool: PgPool,
}

impl PgSignalSource {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SignalSource for PgSignalSource {
    async fn subscribe(&self, channel: &str) -> Result<SignalStream, AppError> {
        let mut listener = PgListener::connect_with(&self.pool).await?;
        // Clear any prior subscription so a reused session never listens twice.
        listener.unlisten(channel).await?;
        listener.listen(channel).await?;

        let stream = listener
            .into_stream()
            .map(|item| {
                item.map(|notification| notification.payload().to_string())
                    .map_err(AppError::from)
            })
            .boxed();
        Ok(stream)
    }
}

pub struct ChangeFeedListener {
    channel: String,
    source: Arc<dyn SignalSource>,
    handler: Arc<dyn SignalHandler>,
    task: Mutex<Option<JoinHandle<()>>>,
    connected: Arc<watch::Sender<bool>>,
}

impl ChangeFeedListener {
    pub fn new(
        channel: impl Into<String>,
        source: Arc<dyn SignalSource>,
        handler: Arc<dyn SignalHandler>,
    ) -> Self {
        let (connected, _) = watch::channel(false);
        Self {
            channel: channel.into(),
            source,
            handler,
            task: Mutex::new(None),
            connected: Arc::new(connected),
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Subscribe and start forwarding signals. A second call while connected is a no-op.
    pub async fn connect(&self) -> Result<(), AppError> {
        let mut task = self.task.lock().await;
        if task.as_ref().is_some_and(|t| !t.is_finished()) {
            return Ok(());
        }

        let mut stream = self.source.subscribe(&self.channel).await?;

        // Set before spawning so an immediately closed stream ends in `false`.
        self.connected.send_replace(true);
        tracing::info!(channel = %self.channel, "Change feed connected");

        let handler = self.handler.clone();
        let connected = self.connected.clone();
        let channel = self.channel.clone();
        *task = Some(tokio::spawn(async move {
            while let Some(item) = stream.next().await {
                match item {
                    Ok(payload) => handler.handle_signal(&payload).await,
                    Err(e) => {
                        tracing::error!(channel = %channel, error = %e, "Change feed stream failed");
                        break;
                    }
                }
            }
            connected.send_replace(false);
            tracing::warn!(channel = %channel, "Change feed disconnected");
        }));

        Ok(())
    }

    /// Stop forwarding signals. Safe to call when already disconnected.
    pub async fn disconnect(&self) {
        if let Some(task) = self.task.lock().await.take() {
            task.abort();
            tracing::info!(channel = %self.channel, "Change feed listener stopped");
        }
        self.connected.send_replace(false);
    }

    pub fn is_connected(&self) -> bool {
        *self.connected.borrow()
    }

    /// Watch the connected flag.
    pub fn watch_connected(&self) -> watch::Receiver<bool> {
        self.connected.subscribe()
    }
}

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
/// A connection that lived this long resets the backoff.
const HEALTHY_AFTER: Duration = Duration::from_secs(30);

/// Keep `listener` connected forever, reconnecting with exponential backoff.
///
/// Runs until the task is cancelled.
pub async fn run_supervised(listener: Arc<ChangeFeedListener>, max_backoff: Duration) {
    let max_backoff = max_backoff.max(INITIAL_BACKOFF);
    let mut connected = listener.watch_connected();
    let mut backoff = INITIAL_BACKOFF;

    loop {
        match listener.connect().await {
            Ok(()) => {
                let since = Instant::now();
                if connected.wait_for(|up| !*up).await.is_err() {
                    return;
                }
                if since.elapsed() >= HEALTHY_AFTER {
                    backoff = INITIAL_BACKOFF;
                }
            }
            Err(e) => {
                tracing::error!(
                    channel = %listener.channel(),
                    error = %e,
                    "Failed to subscribe to change feed"
                );
            }
        }

        tracing::info!(
            channel = %listener.channel(),
            backoff_ms = backoff.as_millis() as u64,
            "Reconnecting change feed"
        );
        tokio::time::sleep(backoff).await;
        backoff = (backoff * 2).min(max_backoff);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::channel::mpsc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    type Feed = mpsc::UnboundedSender<Result<String, AppError>>;

    #[derive(Default)]
    struct FakeSource {
        subscribes: AtomicUsize,
        streams: std::sync::Mutex<Vec<mpsc::UnboundedReceiver<Result<String, AppError>>>>,
    }

    impl FakeSource {
        fn with_feeds(count: usize) -> (Arc<Self>, Vec<Feed>) {
            let source = Self::default();
            let mut feeds = Vec::new();
            {
                let mut streams = source.streams.lock().unwrap();
                for _ in 0..count {
                    let (tx, rx) = mpsc::unbounded();
                    feeds.push(tx);
                    streams.push(rx);
                }
                streams.reverse();
            }
            (Arc::new(source), feeds)
        }

        fn subscribes(&self) -> usize {
            self.subscribes.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl SignalSource for FakeSource {
        async fn subscribe(&self, _channel: &str) -> Result<SignalStream, AppError> {
            self.subscribes.fetch_add(1, Ordering::SeqCst);
            match self.streams.lock().unwrap().pop() {
                Some(rx) => Ok(rx.boxed()),
                None => Err(AppError::Internal("database unavailable".to_string())),
            }
        }
    }

    struct ForwardingHandler(tokio::sync::mpsc::UnboundedSender<String>);

    #[async_trait]
    impl SignalHandler for ForwardingHandler {
        async fn handle_signal(&self, payload: &str) {
            let _ = self.0.send(payload.to_string());
        }
    }

    fn listener(source: Arc<FakeSource>) -> (Arc<ChangeFeedListener>, tokio::sync::mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let listener = ChangeFeedListener::new(
            "db_task_status_changed",
            source,
            Arc::new(ForwardingHandler(tx)),
        );
        (Arc::new(listener), rx)
    }

    #[tokio::test]
    async fn test_connect_is_idempotent() {
        let (source, feeds) = FakeSource::with_feeds(2);
        let (listener, mut signals) = listener(source.clone());

        listener.connect().await.unwrap();
        listener.connect().await.unwrap();
        assert_eq!(source.subscribes(), 1);
        assert!(listener.is_connected());

        feeds[0].unbounded_send(Ok("task-1".to_string())).unwrap();
        assert_eq!(signals.recv().await.unwrap(), "task-1");
    }

    #[tokio::test]
    async fn test_stream_end_marks_disconnected() {
        let (source, mut feeds) = FakeSource::with_feeds(1);
        let (listener, _signals) = listener(source);
        let mut state = listener.watch_connected();

        listener.connect().await.unwrap();
        drop(feeds.remove(0));

        state.wait_for(|up| !*up).await.unwrap();
        assert!(!listener.is_connected());
    }

    #[tokio::test]
    async fn test_stream_error_marks_disconnected() {
        let (source, feeds) = FakeSource::with_feeds(1);
        let (listener, _signals) = listener(source);
        let mut state = listener.watch_connected();

        listener.connect().await.unwrap();
        feeds[0]
            .unbounded_send(Err(AppError::Internal("connection reset".to_string())))
            .unwrap();

        state.wait_for(|up| !*up).await.unwrap();
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let (source, _feeds) = FakeSource::with_feeds(1);
        let (listener, _signals) = listener(source);

        listener.disconnect().await;
        listener.connect().await.unwrap();
        listener.disconnect().await;
        listener.disconnect().await;
        assert!(!listener.is_connected());
    }

    #[tokio::test]
    async fn test_subscribe_failure_leaves_listener_disconnected() {
        let (source, _feeds) = FakeSource::with_feeds(0);
        let (listener, _signals) = listener(source);

        assert!(listener.connect().await.is_err());
        assert!(!listener.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_supervisor_resubscribes_after_drop() {
        let (source, mut feeds) = FakeSource::with_feeds(2);
        let (listener, mut signals) = listener(source.clone());

        let supervisor = tokio::spawn(run_supervised(listener.clone(), Duration::from_secs(60)));

        feeds[0].unbounded_send(Ok("before".to_string())).unwrap();
        assert_eq!(signals.recv().await.unwrap(), "before");

        // Simulated connection drop.
        drop(feeds.remove(0));

        feeds[0].unbounded_send(Ok("after".to_string())).unwrap();
        assert_eq!(signals.recv().await.unwrap(), "after");
        assert_eq!(source.subscribes(), 2);

        supervisor.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_supervisor_retries_failed_subscribe() {
        let (source, _feeds) = FakeSource::with_feeds(0);
        let (listener, _signals) = listener(source.clone());

        let supervisor = tokio::spawn(run_supervised(listener, Duration::from_secs(4)));
        // 1s + 2s + 4s of backoff covers three retries after the first attempt.
        tokio::time::sleep(Duration::from_millis(7_500)).await;
        assert_eq!(source.subscribes(), 4);

        supervisor.abort();
    }
}
