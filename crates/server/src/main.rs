//! Beacon server binary entrypoint.
//!
//! Boots the notification pipeline: connection registry and WebSocket
//! endpoint, change-feed listener under its supervisor, digest scheduler and
//! the event ingress routes.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use beacon_common::config::AppConfig;
use beacon_common::db::create_pool;
use beacon_common::redis_pool::connect_optional;
use beacon_digest::jobs::{DailyDigestJob, DigestMailer, ProjectDigestJob, TaskUpdatesJob};
use beacon_digest::lock::{LocalRunLock, RedisRunLock, RunLock};
use beacon_digest::scheduler::DigestScheduler;
use beacon_digest::store::PgDigestStore;
use beacon_notifier::dispatcher::NotificationDispatcher;
use beacon_notifier::email::EmailGateway;
use beacon_notifier::email::templates::{AppLinks, TemplateEngine};
use beacon_notifier::email::transport::{DisabledTransport, EmailTransport, ResendTransport};
use beacon_notifier::listener::{ChangeFeedListener, PgSignalSource, run_supervised};
use beacon_notifier::pg::PgStore;
use beacon_notifier::pool::DeliveryPool;
use beacon_notifier::registry::ConnectionRegistry;
use beacon_notifier::suppression::SuppressionFilter;
use beacon_notifier::task_status::TaskStatusSignalHandler;

use beacon_server::routes::create_router;
use beacon_server::state::AppState;

const DEFAULT_LOG_FILTER: &str =
    "beacon_server=debug,beacon_notifier=debug,beacon_digest=info,tower_http=debug";

fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));

    if std::env::var("LOG_FORMAT").is_ok_and(|f| f.eq_ignore_ascii_case("json")) {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Received shutdown signal, stopping gracefully...");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    tracing::info!("Starting Beacon server...");

    // Load configuration
    let config = AppConfig::from_env()?;

    // Connect to database and apply migrations
    let pool = create_pool(&config.database_url, config.db_max_connections).await?;
    sqlx::migrate!("../../migrations").run(&pool).await?;
    tracing::info!("Database migrations applied");

    let redis = connect_optional(config.redis_url.as_deref()).await?;

    // Email
    let store = Arc::new(PgStore::new(pool.clone()));
    let transport: Arc<dyn EmailTransport> = match &config.resend_api_key {
        Some(api_key) => Arc::new(ResendTransport::new(
            api_key.clone(),
            Duration::from_secs(config.email_timeout_secs),
        )?),
        None => {
            tracing::warn!("RESEND_API_KEY not set, email delivery disabled");
            Arc::new(DisabledTransport)
        }
    };
    tracing::info!(transport = transport.name(), "Email transport configured");
    let gateway = Arc::new(EmailGateway::new(
        transport,
        SuppressionFilter::new(store.clone()),
        config.email_from.clone(),
    ));

    // Templates
    let mut templates = TemplateEngine::new(AppLinks::new(config.app_base_url.clone()))?;
    beacon_digest::templates::register_templates(&mut templates)?;
    let templates = Arc::new(templates);

    // Dispatcher
    let delivery = DeliveryPool::new(config.email_concurrency);
    let registry = Arc::new(ConnectionRegistry::new(store.clone()));
    let dispatcher = Arc::new(NotificationDispatcher::new(
        store.clone(),
        registry,
        gateway.clone(),
        delivery.clone(),
        templates.clone(),
    ));

    // Change feed
    let listener = Arc::new(ChangeFeedListener::new(
        config.change_feed_channel.clone(),
        Arc::new(PgSignalSource::new(pool.clone())),
        Arc::new(TaskStatusSignalHandler::new(store.clone(), dispatcher.clone())),
    ));
    let supervisor = tokio::spawn(run_supervised(
        listener.clone(),
        Duration::from_secs(config.listener_max_backoff_secs),
    ));

    // Digests
    let lock: Arc<dyn RunLock> = match redis {
        Some(redis) => Arc::new(RedisRunLock::new(redis, config.digest_lock_ttl_secs)),
        None => Arc::new(LocalRunLock::new()),
    };
    let digest_store = Arc::new(PgDigestStore::new(pool.clone()));
    let mailer = DigestMailer::new(gateway, templates);
    let mut scheduler = DigestScheduler::new(lock);
    scheduler.register(
        config.task_updates_cron.clone(),
        Arc::new(TaskUpdatesJob::new(digest_store.clone(), mailer.clone())),
    );
    scheduler.register(
        config.daily_digest_cron.clone(),
        Arc::new(DailyDigestJob::new(digest_store.clone(), mailer.clone())),
    );
    scheduler.register(
        config.project_digest_cron.clone(),
        Arc::new(ProjectDigestJob::new(digest_store, mailer)),
    );
    let mut cron = scheduler.start().await?;

    // Build application state and router
    let state = AppState::new(config.clone(), dispatcher, scheduler.stats())
        .with_change_feed(listener.clone());
    let app = create_router(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let addr = SocketAddr::from(([0, 0, 0, 0], config.server_port));
    tracing::info!("Server listening on {}", addr);

    let tcp = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(tcp, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    supervisor.abort();
    listener.disconnect().await;
    if let Err(e) = cron.shutdown().await {
        tracing::warn!(error = %e, "Digest scheduler did not shut down cleanly");
    }
    delivery.drain().await;

    tracing::info!("Beacon server stopped.");
    Ok(())
}
