use serde::Deserialize;

/// Global application configuration loaded from environment variables.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// PostgreSQL connection string
    pub database_url: String,

    /// Redis connection string. When unset, digest run locks are process-local.
    pub redis_url: Option<String>,

    /// Maximum number of PostgreSQL connections in the pool (default: 20)
    pub db_max_connections: u32,

    /// HTTP/WebSocket listen port (default: 3000)
    pub server_port: u16,

    /// JWT secret for API and WebSocket authentication
    pub jwt_secret: String,

    /// Resend API key for email delivery. Email is disabled without it.
    pub resend_api_key: Option<String>,

    /// Email sender address
    pub email_from: String,

    /// Public URL of the web app, used to build absolute links in emails
    pub app_base_url: String,

    /// Postgres NOTIFY channel carrying task status changes
    pub change_feed_channel: String,

    /// Cron expression (seconds first) for the task-update summary
    pub task_updates_cron: String,

    /// Cron expression for the per-user daily digest
    pub daily_digest_cron: String,

    /// Cron expression for the per-project daily digest
    pub project_digest_cron: String,

    /// Maximum number of in-flight background email sends (default: 8)
    pub email_concurrency: usize,

    /// Email HTTP client timeout in seconds (default: 10)
    pub email_timeout_secs: u64,

    /// Upper bound for the change-feed reconnect backoff (default: 60)
    pub listener_max_backoff_secs: u64,

    /// TTL of a digest run lease, bounds how long a crashed run blocks the next (default: 900)
    pub digest_lock_ttl_secs: u64,
}

impl AppConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        Ok(Self {
            database_url: std::env::var("DATABASE_URL")
                .map_err(|_| anyhow::anyhow!("DATABASE_URL environment variable is required"))?,
            redis_url: std::env::var("REDIS_URL").ok().filter(|v| !v.is_empty()),
            db_max_connections: parse_var("DB_MAX_CONNECTIONS", "20")?,
            server_port: parse_var("SERVER_PORT", "3000")?,
            jwt_secret: std::env::var("JWT_SECRET")
                .map_err(|_| anyhow::anyhow!("JWT_SECRET environment variable is required"))?,
            resend_api_key: std::env::var("RESEND_API_KEY").ok().filter(|v| !v.is_empty()),
            email_from: std::env::var("EMAIL_FROM")
                .unwrap_or_else(|_| "Beacon <noreply@beacon.local>".to_string()),
            app_base_url: std::env::var("APP_BASE_URL")
                .unwrap_or_else(|_| "http://localhost:5173".to_string()),
            change_feed_channel: std::env::var("CHANGE_FEED_CHANNEL")
                .unwrap_or_else(|_| "db_task_status_changed".to_string()),
            task_updates_cron: std::env::var("TASK_UPDATES_CRON")
                .unwrap_or_else(|_| "0 */10 * * * *".to_string()),
            daily_digest_cron: std::env::var("DAILY_DIGEST_CRON")
                .unwrap_or_else(|_| "0 0 11 * * Mon-Fri".to_string()),
            project_digest_cron: std::env::var("PROJECT_DIGEST_CRON")
                .unwrap_or_else(|_| "0 0 11 * * Mon-Fri".to_string()),
            email_concurrency: parse_var("EMAIL_CONCURRENCY", "8")?,
            email_timeout_secs: parse_var("EMAIL_TIMEOUT_SECS", "10")?,
            listener_max_backoff_secs: parse_var("LISTENER_MAX_BACKOFF_SECS", "60")?,
            digest_lock_ttl_secs: parse_var("DIGEST_LOCK_TTL_SECS", "900")?,
        })
    }
}

/// Read an environment variable, falling back to `default`, and parse it.
fn parse_var<T: std::str::FromStr>(name: &str, default: &str) -> anyhow::Result<T> {
    std::env::var(name)
        .unwrap_or_else(|_| default.to_string())
        .parse()
        .map_err(|_| {
            anyhow::anyhow!(
                "{} must be a valid {}",
                name,
                std::any::type_name::<T>()
            )
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_var_uses_default() {
        let value: u64 = parse_var("BEACON_TEST_UNSET_VARIABLE", "42").unwrap();
        assert_eq!(value, 42);
    }

    #[test]
    fn test_parse_var_rejects_garbage() {
        let result: anyhow::Result<u16> = parse_var("BEACON_TEST_UNSET_VARIABLE", "not-a-port");
        let err = result.unwrap_err().to_string();
        assert!(err.contains("BEACON_TEST_UNSET_VARIABLE"));
    }
}
