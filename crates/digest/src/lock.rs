//! Run locks keep a digest job from overlapping with itself.
//!
//! With Redis configured the lock is a `SET NX EX` lease shared by every
//! replica; the TTL bounds how long a crashed run can block later ticks.
//! Without Redis the lock only covers this process.

use std::collections::HashSet;
use std::sync::Mutex;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use uuid::Uuid;

/// Proof that a run holds the lock for `job`.
#[derive(Debug)]
pub struct RunLease {
    job: String,
    token: String,
}

impl RunLease {
    pub fn job(&self) -> &str {
        &self.job
    }
}

#[async_trait]
pub trait RunLock: Send + Sync {
    /// Take the lock for `job`. `None` when another run holds it.
    async fn try_acquire(&self, job: &str) -> anyhow::Result<Option<RunLease>>;

    async fn release(&self, lease: RunLease) -> anyhow::Result<()>;
}

/// Deletes the key only if it still holds our token.
const RELEASE_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
end
return 0
"#;

pub struct RedisRunLock {
    redis: ConnectionManager,
    ttl_secs: u64,
}

impl RedisRunLock {
    pub fn new(redis: ConnectionManager, ttl_secs: u64) -> Self {
        Self {
            redis,
            ttl_secs: ttl_secs.max(1),
        }
    }

    fn key(job: &str) -> String {
        format!("digest:lock:{}", job)
    }
}

#[async_trait]
impl RunLock for RedisRunLock {
    async fn try_acquire(&self, job: &str) -> anyhow::Result<Option<RunLease>> {
        let mut conn = self.redis.clone();
        let token = Uuid::new_v4().to_string();

        // Some("OK") when the key was set, None when another run holds it
        let result: Option<String> = redis::cmd("SET")
            .arg(Self::key(job))
            .arg(&token)
            .arg("NX")
            .arg("EX")
            .arg(self.ttl_secs)
            .query_async(&mut conn)
            .await?;

        Ok(result.map(|_| RunLease {
            job: job.to_string(),
            token,
        }))
    }

    async fn release(&self, lease: RunLease) -> anyhow::Result<()> {
        let mut conn = self.redis.clone();
        let removed: i32 = redis::Script::new(RELEASE_SCRIPT)
            .key(Self::key(&lease.job))
            .arg(&lease.token)
            .invoke_async(&mut conn)
            .await?;

        if removed == 0 {
            tracing::warn!(job = %lease.job, "Digest lease expired before the run finished");
        }
        Ok(())
    }
}

/// Process-local lock for single-replica deployments.
#[derive(Default)]
pub struct LocalRunLock {
    held: Mutex<HashSet<String>>,
}

impl LocalRunLock {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RunLock for LocalRunLock {
    async fn try_acquire(&self, job: &str) -> anyhow::Result<Option<RunLease>> {
        let mut held = self
            .held
            .lock()
            .map_err(|_| anyhow::anyhow!("run lock poisoned"))?;

        if !held.insert(job.to_string()) {
            return Ok(None);
        }
        Ok(Some(RunLease {
            job: job.to_string(),
            token: String::new(),
        }))
    }

    async fn release(&self, lease: RunLease) -> anyhow::Result<()> {
        self.held
            .lock()
            .map_err(|_| anyhow::anyhow!("run lock poisoned"))?
            .remove(&lease.job);
        Ok(())
    }
}
