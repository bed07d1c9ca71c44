//! Durable job queue
//!
//! Jobs live in the SQLite `jobs` table. Claiming is a single atomic
//! UPDATE, so any number of workers can share the queue, and jobs left
//! `running` by a crash are recovered at startup.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::Notify;

use super::retry::{RetryPolicy, with_jitter};
use crate::data::{Database, Job};
use crate::error::AppError;

/// Queue names
pub mod queues {
    pub const USER_INBOX: &str = "user-inbox";
    pub const SHARED_INBOX: &str = "shared-inbox";
    pub const USER_OUTBOX: &str = "user-outbox";
    pub const FOLLOW_RESPONDER: &str = "follow-responder";

    pub const ALL: [&str; 4] = [USER_INBOX, SHARED_INBOX, USER_OUTBOX, FOLLOW_RESPONDER];
}

/// What happened to a job that did not succeed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobDisposition {
    Rescheduled(Duration),
    Failed,
}

pub struct JobQueue {
    db: Arc<Database>,
    notify: Arc<Notify>,
    policy: RetryPolicy,
}

impl JobQueue {
    pub fn new(db: Arc<Database>, policy: RetryPolicy) -> Self {
        Self {
            db,
            notify: Arc::new(Notify::new()),
            policy,
        }
    }

    /// Persist a job and wake one idle worker.
    ///
    /// # Errors
    /// `AppError::Unavailable` when the job could not be stored.
    pub async fn enqueue<T: Serialize>(&self, queue: &str, payload: &T) -> Result<String, AppError> {
        let payload = serde_json::to_string(payload)
            .map_err(|e| AppError::Internal(anyhow::anyhow!("Unserializable job payload: {}", e)))?;

        let id = self
            .db
            .insert_job(queue, &payload, self.policy.max_attempts)
            .await
            .map_err(|e| {
                tracing::error!(queue, error = %e, "Failed to enqueue job");
                AppError::Unavailable(format!("queue {} unavailable", queue))
            })?;

        tracing::debug!(queue, job_id = %id, "Job enqueued");
        self.notify.notify_one();
        Ok(id)
    }

    /// Claim the oldest due job from `queues`.
    pub async fn claim(&self, queues: &[&str]) -> Result<Option<Job>, AppError> {
        self.db.claim_next_job(queues, Utc::now()).await
    }

    pub async fn complete(&self, job: &Job) -> Result<(), AppError> {
        self.db.complete_job(&job.id).await
    }

    /// Store an updated payload, e.g. an envelope that has been authenticated.
    pub async fn update_payload<T: Serialize>(&self, job: &Job, payload: &T) -> Result<(), AppError> {
        let payload = serde_json::to_string(payload)
            .map_err(|e| AppError::Internal(anyhow::anyhow!("Unserializable job payload: {}", e)))?;
        self.db.update_job_payload(&job.id, &payload).await
    }

    /// Reschedule a transiently failed job, or fail it once its attempts are spent.
    pub async fn retry_or_fail(&self, job: &Job, error: &str) -> Result<JobDisposition, AppError> {
        let attempts = u32::try_from(job.attempts).unwrap_or(u32::MAX);
        let max_attempts = u32::try_from(job.max_attempts).unwrap_or(self.policy.max_attempts);

        if attempts >= max_attempts {
            self.db.fail_job(&job.id, error).await?;
            return Ok(JobDisposition::Failed);
        }

        let delay = with_jitter(self.policy.delay_after(attempts));
        let next_attempt_at = Utc::now()
            + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::seconds(60));
        self.db.reschedule_job(&job.id, next_attempt_at, error).await?;
        Ok(JobDisposition::Rescheduled(delay))
    }

    pub async fn fail(&self, job: &Job, error: &str) -> Result<(), AppError> {
        self.db.fail_job(&job.id, error).await
    }

    /// Return jobs abandoned in `running` to `pending`.
    pub async fn recover(&self) -> Result<u64, AppError> {
        let recovered = self.db.requeue_running_jobs().await?;
        if recovered > 0 {
            tracing::warn!(recovered, "Requeued jobs left running by a previous process");
        }
        Ok(recovered)
    }

    /// Wait for an enqueue notification or until `timeout` elapses.
    pub async fn wait(&self, timeout: Duration) {
        let _ = tokio::time::timeout(timeout, self.notify.notified()).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::JobStatus;
    use tempfile::TempDir;

    async fn test_queue(max_attempts: u32) -> (TempDir, Arc<Database>, JobQueue) {
        let dir = TempDir::new().expect("temp dir");
        let db = Arc::new(
            Database::connect(&dir.path().join("test.db"))
                .await
                .expect("database"),
        );
        let policy = RetryPolicy {
            max_attempts,
            base_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
        };
        let queue = JobQueue::new(db.clone(), policy);
        (dir, db, queue)
    }

    #[tokio::test]
    async fn claim_returns_each_job_once() {
        let (_dir, _db, queue) = test_queue(3).await;
        queue
            .enqueue(queues::USER_INBOX, &serde_json::json!({"n": 1}))
            .await
            .expect("enqueue");

        let job = queue
            .claim(&[queues::USER_INBOX])
            .await
            .expect("claim")
            .expect("a job is due");
        assert_eq!(job.status, JobStatus::Running);
        assert_eq!(job.attempts, 1);
        assert_eq!(job.payload, r#"{"n":1}"#);

        assert!(queue.claim(&[queues::USER_INBOX]).await.expect("claim").is_none());
    }

    #[tokio::test]
    async fn claim_only_reads_requested_queues() {
        let (_dir, _db, queue) = test_queue(3).await;
        queue
            .enqueue(queues::FOLLOW_RESPONDER, &"payload")
            .await
            .expect("enqueue");

        assert!(queue.claim(&[queues::USER_INBOX]).await.expect("claim").is_none());
        assert!(queue
            .claim(&[queues::USER_INBOX, queues::FOLLOW_RESPONDER])
            .await
            .expect("claim")
            .is_some());
    }

    #[tokio::test]
    async fn transient_failures_reschedule_until_attempts_are_spent() {
        let (_dir, db, queue) = test_queue(2).await;
        let id = queue
            .enqueue(queues::SHARED_INBOX, &"payload")
            .await
            .expect("enqueue");

        let job = queue.claim(&queues::ALL).await.expect("claim").expect("job");
        assert!(matches!(
            queue.retry_or_fail(&job, "key fetch timed out").await.expect("retry"),
            JobDisposition::Rescheduled(_)
        ));

        let job = queue.claim(&queues::ALL).await.expect("claim").expect("job again");
        assert_eq!(job.attempts, 2);
        assert_eq!(
            queue.retry_or_fail(&job, "key fetch timed out").await.expect("fail"),
            JobDisposition::Failed
        );

        let stored = db.get_job(&id).await.expect("query").expect("job row");
        assert_eq!(stored.status, JobStatus::Failed);
        assert_eq!(stored.last_error.as_deref(), Some("key fetch timed out"));
        assert!(queue.claim(&queues::ALL).await.expect("claim").is_none());
    }

    #[tokio::test]
    async fn recover_requeues_abandoned_jobs() {
        let (_dir, _db, queue) = test_queue(3).await;
        queue.enqueue(queues::USER_OUTBOX, &"payload").await.expect("enqueue");
        let _claimed = queue.claim(&queues::ALL).await.expect("claim").expect("job");

        assert_eq!(queue.recover().await.expect("recover"), 1);
        let job = queue.claim(&queues::ALL).await.expect("claim").expect("requeued job");
        assert_eq!(job.attempts, 2);
    }
}
