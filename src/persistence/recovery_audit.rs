//! Recovery Audit Repository
//!
//! Persists finished recovery jobs so the restart history survives a bridge
//! restart.

use super::{DatabaseError, DbPool};
use crate::domain::entities::recovery_job::{JobOutcome, RecoveryJob, TriggerSource};
use async_trait::async_trait;
use sqlx::Row;
use tracing::{debug, error};

/// Recovery audit repository trait
#[async_trait]
pub trait RecoveryAuditRepository: Send + Sync {
    /// Insert or overwrite a finished job
    async fn save_job(&self, job: &RecoveryJob) -> Result<(), DatabaseError>;
    async fn get_job(&self, job_id: &str) -> Result<Option<RecoveryJob>, DatabaseError>;
    /// Most recent first
    async fn recent_jobs(&self, limit: usize) -> Result<Vec<RecoveryJob>, DatabaseError>;
}

/// SQLite implementation of the recovery audit repository
pub struct SqliteRecoveryAuditRepository {
    pool: DbPool,
}

impl SqliteRecoveryAuditRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

fn trigger_str(trigger: TriggerSource) -> &'static str {
    match trigger {
        TriggerSource::Watchdog => "watchdog",
        TriggerSource::External => "external",
    }
}

#[async_trait]
impl RecoveryAuditRepository for SqliteRecoveryAuditRepository {
    async fn save_job(&self, job: &RecoveryJob) -> Result<(), DatabaseError> {
        let (status, failure_reason, finished_at) = match (&job.outcome, job.finished_at) {
            (Some(JobOutcome::Succeeded), Some(finished_at)) => ("succeeded", None, finished_at),
            (Some(JobOutcome::Failed { reason }), Some(finished_at)) => {
                ("failed", Some(reason.to_string()), finished_at)
            }
            _ => {
                return Err(DatabaseError::QueryError(format!(
                    "job {} is still running",
                    job.id
                )))
            }
        };
        let job_json = serde_json::to_string(job)?;

        sqlx::query(
            r#"
            INSERT OR REPLACE INTO recovery_jobs (
                job_id, trigger_source, status, failure_reason,
                started_at, finished_at, job_json
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
        )
        .bind(&job.id)
        .bind(trigger_str(job.trigger))
        .bind(status)
        .bind(failure_reason)
        .bind(job.started_at)
        .bind(finished_at)
        .bind(&job_json)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to save recovery job {}: {}", job.id, e);
            DatabaseError::QueryError(e.to_string())
        })?;

        debug!("Saved recovery job {} ({})", job.id, status);
        Ok(())
    }

    async fn get_job(&self, job_id: &str) -> Result<Option<RecoveryJob>, DatabaseError> {
        let row = sqlx::query("SELECT job_json FROM recovery_jobs WHERE job_id = ?1")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| DatabaseError::QueryError(e.to_string()))?;

        match row {
            Some(row) => {
                let job_json: String = row.get("job_json");
                Ok(Some(serde_json::from_str(&job_json)?))
            }
            None => Ok(None),
        }
    }

    async fn recent_jobs(&self, limit: usize) -> Result<Vec<RecoveryJob>, DatabaseError> {
        let rows = sqlx::query(
            r#"
            SELECT job_json FROM recovery_jobs
            ORDER BY started_at DESC, job_id DESC
            LIMIT ?1
            "#,
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| DatabaseError::QueryError(e.to_string()))?;

        let mut jobs = Vec::with_capacity(rows.len());
        for row in rows {
            let job_json: String = row.get("job_json");
            match serde_json::from_str::<RecoveryJob>(&job_json) {
                Ok(job) => jobs.push(job),
                Err(e) => error!("Skipping unreadable recovery job row: {}", e),
            }
        }
        Ok(jobs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::entities::recovery_job::{FailureReason, RecoveryState};
    use crate::persistence::{init_database, DatabaseConfig};

    async fn repository() -> SqliteRecoveryAuditRepository {
        let pool = init_database(&DatabaseConfig::with_url("sqlite::memory:"))
            .await
            .unwrap();
        SqliteRecoveryAuditRepository::new(pool)
    }

    fn finished_job(id: &str, ok: bool) -> RecoveryJob {
        let mut job = RecoveryJob::new(id.to_string(), TriggerSource::External);
        job.enter(RecoveryState::Stopping);
        if ok {
            job.succeed();
        } else {
            job.fail(FailureReason::StepTimeout {
                step: RecoveryState::Stopping,
                timeout_ms: 45_000,
            });
        }
        job
    }

    #[tokio::test]
    async fn test_save_and_load_job() {
        let repo = repository().await;
        let job = finished_job("job-1", false);
        repo.save_job(&job).await.unwrap();

        let loaded = repo.get_job("job-1").await.unwrap().unwrap();
        assert_eq!(loaded, job);
        assert!(repo.get_job("job-404").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_running_job_is_rejected() {
        let repo = repository().await;
        let mut job = RecoveryJob::new("job-2".to_string(), TriggerSource::Watchdog);
        job.enter(RecoveryState::Starting);
        assert!(matches!(
            repo.save_job(&job).await,
            Err(DatabaseError::QueryError(_))
        ));
    }

    #[tokio::test]
    async fn test_recent_jobs_most_recent_first() {
        let repo = repository().await;
        let mut older = finished_job("job-a", true);
        older.started_at = older.started_at - chrono::Duration::minutes(10);
        repo.save_job(&older).await.unwrap();
        repo.save_job(&finished_job("job-b", false)).await.unwrap();

        let jobs = repo.recent_jobs(10).await.unwrap();
        let ids: Vec<&str> = jobs.iter().map(|j| j.id.as_str()).collect();
        assert_eq!(ids, vec!["job-b", "job-a"]);
        assert_eq!(repo.recent_jobs(1).await.unwrap().len(), 1);
    }
}
