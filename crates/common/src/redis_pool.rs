use redis::Client;
use redis::aio::ConnectionManager;

/// Connect to Redis when a URL is configured.
///
/// Redis only backs the cross-replica digest run lock, so a missing URL is not
/// an error: callers fall back to a process-local lock.
pub async fn connect_optional(redis_url: Option<&str>) -> anyhow::Result<Option<ConnectionManager>> {
    let Some(url) = redis_url else {
        tracing::info!("REDIS_URL not set, digest run locks are process-local");
        return Ok(None);
    };

    let client = Client::open(url)?;
    let manager = ConnectionManager::new(client).await?;

    tracing::info!("Connected to Redis");
    Ok(Some(manager))
}
