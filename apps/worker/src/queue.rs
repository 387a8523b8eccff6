//! Persistent job queue over `satbank.job_queue`.
//!
//! The table doubles as the contract with the broker that feeds the worker:
//! anything that can run SQL may insert a job. Fetching flips a row to
//! `active` under `FOR UPDATE SKIP LOCKED`, so any number of pollers and
//! worker processes can share one queue without double delivery.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_postgres::Client;
use uuid::Uuid;

use crate::db::WorkerDb;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue error: {0}")]
    Db(String),
}

/// A job handed to a poller. The row stays `active` until the poller reports
/// back with `complete` or `fail`.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: Uuid,
    pub name: String,
    pub payload: Value,
}

#[derive(Debug, Clone)]
pub struct Enqueue {
    pub name: String,
    pub payload: Value,
    pub retry_limit: u32,
    /// Exponential backoff between retries instead of the flat delay.
    pub retry_backoff: bool,
    pub start_after: DateTime<Utc>,
}

#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn enqueue(&self, job: Enqueue) -> Result<Uuid, QueueError>;

    /// Claims the oldest due job matching one of `names`, if any.
    async fn fetch(&self, names: &[&str]) -> Result<Option<Job>, QueueError>;

    async fn complete(&self, id: Uuid) -> Result<(), QueueError>;

    /// Records a failed run. The job is rescheduled while attempts remain,
    /// otherwise parked as `failed`.
    async fn fail(&self, id: Uuid) -> Result<(), QueueError>;
}

pub fn memory(retry_delay_seconds: u64) -> Arc<dyn JobQueue> {
    MemoryJobQueue::shared(retry_delay_seconds)
}

pub fn postgres(db: &WorkerDb, retry_delay_seconds: u64) -> Arc<dyn JobQueue> {
    Arc::new(PostgresJobQueue {
        client: db.client(),
        retry_delay_seconds,
    })
}

/// Seconds until a failed attempt runs again. `attempts` counts the runs
/// already made.
fn backoff_seconds(attempts: u32) -> u64 {
    2u64.saturating_pow(attempts.min(16)).min(3_600)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Created,
    Active,
    Retry,
    Completed,
    Failed,
}

/// Full queue row, exposed by the in-memory queue for assertions.
#[derive(Debug, Clone)]
pub struct QueuedJob {
    pub id: Uuid,
    pub name: String,
    pub payload: Value,
    pub state: JobState,
    pub attempts: u32,
    pub retry_limit: u32,
    pub retry_backoff: bool,
    pub start_after: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// In-memory queue for tests and for running without a database.
pub struct MemoryJobQueue {
    retry_delay_seconds: u64,
    jobs: Mutex<HashMap<Uuid, QueuedJob>>,
}

impl MemoryJobQueue {
    pub fn shared(retry_delay_seconds: u64) -> Arc<Self> {
        Arc::new(Self {
            retry_delay_seconds,
            jobs: Mutex::new(HashMap::new()),
        })
    }

    pub async fn jobs(&self) -> Vec<QueuedJob> {
        let jobs = self.jobs.lock().await;
        let mut rows: Vec<QueuedJob> = jobs.values().cloned().collect();
        rows.sort_by_key(|job| job.created_at);
        rows
    }

    /// Pulls a scheduled job's `start_after` into the past so a test can
    /// fetch it without sleeping through the retry delay.
    pub async fn make_due(&self, id: Uuid) {
        let mut jobs = self.jobs.lock().await;
        if let Some(job) = jobs.get_mut(&id) {
            job.start_after = Utc::now() - Duration::seconds(1);
        }
    }
}

#[async_trait]
impl JobQueue for MemoryJobQueue {
    async fn enqueue(&self, job: Enqueue) -> Result<Uuid, QueueError> {
        let mut jobs = self.jobs.lock().await;
        let id = Uuid::now_v7();
        jobs.insert(
            id,
            QueuedJob {
                id,
                name: job.name,
                payload: job.payload,
                state: JobState::Created,
                attempts: 0,
                retry_limit: job.retry_limit,
                retry_backoff: job.retry_backoff,
                start_after: job.start_after,
                created_at: Utc::now(),
            },
        );
        Ok(id)
    }

    async fn fetch(&self, names: &[&str]) -> Result<Option<Job>, QueueError> {
        let mut jobs = self.jobs.lock().await;
        let now = Utc::now();
        let due = jobs
            .values()
            .filter(|job| {
                matches!(job.state, JobState::Created | JobState::Retry)
                    && job.start_after <= now
                    && names.contains(&job.name.as_str())
            })
            .min_by_key(|job| job.created_at)
            .map(|job| job.id);
        let Some(id) = due else {
            return Ok(None);
        };
        let job = jobs.get_mut(&id).ok_or_else(|| {
            QueueError::Db("claimed job vanished".to_string())
        })?;
        job.state = JobState::Active;
        Ok(Some(Job {
            id: job.id,
            name: job.name.clone(),
            payload: job.payload.clone(),
        }))
    }

    async fn complete(&self, id: Uuid) -> Result<(), QueueError> {
        let mut jobs = self.jobs.lock().await;
        if let Some(job) = jobs.get_mut(&id) {
            job.state = JobState::Completed;
        }
        Ok(())
    }

    async fn fail(&self, id: Uuid) -> Result<(), QueueError> {
        let mut jobs = self.jobs.lock().await;
        if let Some(job) = jobs.get_mut(&id) {
            let attempts = job.attempts;
            job.attempts += 1;
            if job.attempts <= job.retry_limit {
                job.state = JobState::Retry;
                let delay = if job.retry_backoff {
                    backoff_seconds(attempts)
                } else {
                    self.retry_delay_seconds
                };
                job.start_after = Utc::now()
                    + Duration::seconds(i64::try_from(delay).unwrap_or(i64::MAX));
            } else {
                job.state = JobState::Failed;
            }
        }
        Ok(())
    }
}

struct PostgresJobQueue {
    client: Arc<Mutex<Client>>,
    retry_delay_seconds: u64,
}

#[async_trait]
impl JobQueue for PostgresJobQueue {
    async fn enqueue(&self, job: Enqueue) -> Result<Uuid, QueueError> {
        let client = self.client.lock().await;
        let id = Uuid::now_v7();
        client
            .execute(
                r#"
                INSERT INTO satbank.job_queue
                    (id, name, payload, retry_limit, retry_backoff, start_after)
                VALUES ($1, $2, $3, $4, $5, $6)
                "#,
                &[
                    &id,
                    &job.name,
                    &job.payload,
                    &i32::try_from(job.retry_limit).unwrap_or(i32::MAX),
                    &job.retry_backoff,
                    &job.start_after,
                ],
            )
            .await
            .map_err(|error| QueueError::Db(error.to_string()))?;
        Ok(id)
    }

    async fn fetch(&self, names: &[&str]) -> Result<Option<Job>, QueueError> {
        let client = self.client.lock().await;
        let row = client
            .query_opt(
                r#"
                UPDATE satbank.job_queue
                SET state = 'active'
                WHERE id = (
                    SELECT id
                    FROM satbank.job_queue
                    WHERE name = ANY($1)
                      AND state IN ('created', 'retry')
                      AND start_after <= now()
                    ORDER BY created_at
                    LIMIT 1
                    FOR UPDATE SKIP LOCKED
                )
                RETURNING id, name, payload
                "#,
                &[&names],
            )
            .await
            .map_err(|error| QueueError::Db(error.to_string()))?;
        Ok(row.map(|row| Job {
            id: row.get(0),
            name: row.get(1),
            payload: row.get(2),
        }))
    }

    async fn complete(&self, id: Uuid) -> Result<(), QueueError> {
        let client = self.client.lock().await;
        client
            .execute(
                r#"
                UPDATE satbank.job_queue
                SET state = 'completed', completed_at = now()
                WHERE id = $1
                "#,
                &[&id],
            )
            .await
            .map_err(|error| QueueError::Db(error.to_string()))?;
        Ok(())
    }

    async fn fail(&self, id: Uuid) -> Result<(), QueueError> {
        let client = self.client.lock().await;
        client
            .execute(
                r#"
                UPDATE satbank.job_queue
                SET attempts = attempts + 1,
                    state = CASE
                        WHEN attempts + 1 <= retry_limit THEN 'retry'
                        ELSE 'failed'
                    END,
                    start_after = CASE
                        WHEN attempts + 1 > retry_limit THEN start_after
                        WHEN retry_backoff THEN
                            now() + make_interval(secs =>
                                LEAST(power(2, LEAST(attempts, 16)), 3600))
                        ELSE now() + make_interval(secs => $2)
                    END,
                    completed_at = CASE
                        WHEN attempts + 1 <= retry_limit THEN NULL
                        ELSE now()
                    END
                WHERE id = $1
                "#,
                &[
                    &id,
                    &(self.retry_delay_seconds.min(3_600) as f64),
                ],
            )
            .await
            .map_err(|error| QueueError::Db(error.to_string()))?;
        Ok(())
    }
}
