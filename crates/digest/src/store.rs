//! Aggregate queries behind the digest jobs.

use async_trait::async_trait;
use sqlx::PgPool;
use sqlx::types::Json;
use uuid::Uuid;

use beacon_common::error::AppError;

use crate::models::{DailyDigest, ProjectDigest, TaskUpdatesDigest};

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DigestStore: Send + Sync {
    async fn task_updates(&self) -> Result<Vec<TaskUpdatesDigest>, AppError>;

    async fn daily_digest(&self) -> Result<Vec<DailyDigest>, AppError>;

    async fn project_digest(&self) -> Result<Vec<ProjectDigest>, AppError>;

    /// Flag task updates as delivered so the next run skips them.
    async fn mark_task_updates_sent(&self, update_ids: &[Uuid]) -> Result<u64, AppError>;
}

/// Reads the `get_*` aggregate functions.
#[derive(Clone)]
pub struct PgDigestStore {
    pool: PgPool,
}

impl PgDigestStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DigestStore for PgDigestStore {
    async fn task_updates(&self) -> Result<Vec<TaskUpdatesDigest>, AppError> {
        let Json(rows): Json<Vec<TaskUpdatesDigest>> =
            sqlx::query_scalar("SELECT get_task_updates()")
                .fetch_one(&self.pool)
                .await?;
        Ok(rows)
    }

    async fn daily_digest(&self) -> Result<Vec<DailyDigest>, AppError> {
        let Json(rows): Json<Vec<DailyDigest>> = sqlx::query_scalar("SELECT get_daily_digest()")
            .fetch_one(&self.pool)
            .await?;
        Ok(rows)
    }

    async fn project_digest(&self) -> Result<Vec<ProjectDigest>, AppError> {
        let Json(rows): Json<Vec<ProjectDigest>> =
            sqlx::query_scalar("SELECT get_project_daily_digest()")
                .fetch_one(&self.pool)
                .await?;
        Ok(rows)
    }

    async fn mark_task_updates_sent(&self, update_ids: &[Uuid]) -> Result<u64, AppError> {
        if update_ids.is_empty() {
            return Ok(0);
        }

        let result = sqlx::query("UPDATE task_updates SET is_sent = TRUE WHERE id = ANY($1)")
            .bind(update_ids)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}
