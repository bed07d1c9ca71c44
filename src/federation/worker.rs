//! Activity processing workers
//!
//! Claims queued jobs, authenticates envelopes, applies their side effects
//! exactly once per activity id and fans outbox activities out.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::actors::ActorDirectory;
use super::delivery::DeliveryEngine;
use super::envelope::{Envelope, Ingress};
use super::follow_responder::{FollowDecision, FollowResponder, FollowResponseJob};
use super::key_cache::PublicKeyCache;
use super::processor::ActivityProcessor;
use super::queue::{JobDisposition, JobQueue, queues};
use super::verifier::{SignatureVerifier, VerificationError};
use crate::config::InboundConfig;
use crate::data::{ActivityClaim, Database, Job};
use crate::error::AppError;
use crate::metrics::JOBS_TOTAL;

/// Result of processing one job
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    Success,
    /// Worth retrying later
    Transient(String),
    /// Never going to succeed; the job is dropped
    Permanent(String),
}

impl ProcessOutcome {
    fn from_error(err: AppError) -> Self {
        if err.is_transient() {
            Self::Transient(err.to_string())
        } else {
            Self::Permanent(err.to_string())
        }
    }
}

impl From<VerificationError> for ProcessOutcome {
    fn from(err: VerificationError) -> Self {
        match err {
            VerificationError::Transient(reason) => Self::Transient(reason),
            VerificationError::Rejected(reason) => Self::Permanent(reason),
        }
    }
}

pub struct FederationWorker {
    db: Arc<Database>,
    queue: Arc<JobQueue>,
    directory: Arc<ActorDirectory>,
    verifier: SignatureVerifier,
    processor: ActivityProcessor,
    engine: DeliveryEngine,
    responder: FollowResponder,
    poll_interval: Duration,
}

impl FederationWorker {
    pub fn new(
        db: Arc<Database>,
        queue: Arc<JobQueue>,
        directory: Arc<ActorDirectory>,
        keys: Arc<PublicKeyCache>,
        engine: DeliveryEngine,
        config: &InboundConfig,
    ) -> Self {
        Self {
            verifier: SignatureVerifier::new(keys, config.signature_max_age_secs),
            processor: ActivityProcessor::new(db.clone(), directory.clone(), queue.clone()),
            responder: FollowResponder::new(db.clone(), engine.clone()),
            db,
            queue,
            directory,
            engine,
            poll_interval: Duration::from_millis(config.poll_interval_ms),
        }
    }

    /// Authenticate and process one envelope on behalf of job `claimant`.
    ///
    /// The activity id is claimed before any side effect, so duplicate
    /// deliveries running on other workers wait instead of applying it twice.
    /// On return `envelope.authenticated_actor` is set if verification passed.
    pub async fn process(&self, envelope: &mut Envelope, claimant: &str) -> ProcessOutcome {
        let actor_uri = match self.authenticate(envelope).await {
            Ok(actor_uri) => actor_uri,
            Err(outcome) => return outcome,
        };
        envelope.authenticated_actor = Some(actor_uri.clone());

        let activity = &envelope.activity;
        match self
            .db
            .claim_activity(&activity.id, activity.kind.as_str(), claimant)
            .await
        {
            Ok(ActivityClaim::Claimed) => {}
            Ok(ActivityClaim::Processed) => {
                tracing::debug!(activity_id = %activity.id, "Activity already processed");
                return ProcessOutcome::Success;
            }
            Ok(ActivityClaim::Busy) => {
                return ProcessOutcome::Transient(format!(
                    "Activity {} is held by another job",
                    activity.id
                ));
            }
            Err(e) => return ProcessOutcome::from_error(e),
        }

        match self.apply_claimed(envelope, &actor_uri).await {
            Ok(()) => ProcessOutcome::Success,
            Err(e) => {
                if let Err(release_err) = self.db.release_activity_claim(&activity.id, claimant).await {
                    tracing::error!(activity_id = %activity.id, error = %release_err, "Failed to release activity claim");
                }
                ProcessOutcome::from_error(e)
            }
        }
    }

    async fn apply_claimed(&self, envelope: &Envelope, actor_uri: &str) -> Result<(), AppError> {
        let activity = &envelope.activity;
        self.processor.apply(activity, actor_uri).await?;

        if let Ingress::ActorOutbox { .. } = envelope.ingress {
            self.fan_out(envelope, actor_uri).await?;
        }

        self.db
            .mark_activity_processed(&activity.id, activity.kind.as_str())
            .await
    }

    async fn authenticate(&self, envelope: &Envelope) -> Result<String, ProcessOutcome> {
        let local_username = match &envelope.ingress {
            Ingress::ActorInbox { username } | Ingress::ActorOutbox { username } => Some(username),
            Ingress::SharedInbox => None,
        };

        if let Some(username) = local_username {
            let local = self
                .db
                .get_local_actor(username)
                .await
                .map_err(ProcessOutcome::from_error)?
                .ok_or_else(|| ProcessOutcome::Permanent(format!("No local actor {}", username)))?;

            let is_outbox = matches!(envelope.ingress, Ingress::ActorOutbox { .. });
            if is_outbox && envelope.activity.primary_actor() != local.uri {
                return Err(ProcessOutcome::Permanent(format!(
                    "Outbox of {} cannot post as {}",
                    local.uri,
                    envelope.activity.primary_actor()
                )));
            }
        }

        Ok(self.verifier.verify(envelope).await?)
    }

    async fn fan_out(&self, envelope: &Envelope, actor_uri: &str) -> Result<(), AppError> {
        let sender = self
            .db
            .get_actor_by_uri(actor_uri)
            .await?
            .ok_or(AppError::NotFound)?;
        let signer = self
            .db
            .local_signer(actor_uri)
            .await?
            .ok_or_else(|| AppError::Federation(format!("No signing key for {}", actor_uri)))?;

        let addressing = self.engine.addressing_for(&envelope.activity, &sender).await?;
        self.engine
            .deliver(&signer, actor_uri, &envelope.activity, &addressing)
            .await?;
        Ok(())
    }

    async fn process_follow_response(&self, job: &FollowResponseJob) -> ProcessOutcome {
        match self.responder.run(job).await {
            Ok(_) => ProcessOutcome::Success,
            Err(e) => ProcessOutcome::from_error(e),
        }
    }

    /// Run a claimed job and settle it in the queue.
    pub async fn run_job(&self, job: &Job) -> Result<ProcessOutcome, AppError> {
        let outcome = if job.queue == queues::FOLLOW_RESPONDER {
            match serde_json::from_str::<FollowResponseJob>(&job.payload) {
                Ok(response) => self.process_follow_response(&response).await,
                Err(e) => ProcessOutcome::Permanent(format!("Unreadable follow response: {}", e)),
            }
        } else {
            match serde_json::from_str::<Envelope>(&job.payload) {
                Ok(mut envelope) => {
                    let was_authenticated = envelope.authenticated_actor.is_some();
                    let outcome = self.process(&mut envelope, &job.id).await;
                    if matches!(outcome, ProcessOutcome::Transient(_))
                        && !was_authenticated
                        && envelope.authenticated_actor.is_some()
                    {
                        self.queue.update_payload(job, &envelope).await?;
                    }
                    outcome
                }
                Err(e) => ProcessOutcome::Permanent(format!("Unreadable envelope: {}", e)),
            }
        };

        let label = match &outcome {
            ProcessOutcome::Success => {
                self.queue.complete(job).await?;
                "success"
            }
            ProcessOutcome::Transient(reason) => match self.queue.retry_or_fail(job, reason).await? {
                JobDisposition::Rescheduled(delay) => {
                    tracing::info!(job_id = %job.id, queue = %job.queue, attempts = job.attempts, ?delay, reason = %reason, "Job rescheduled");
                    "retried"
                }
                JobDisposition::Failed => {
                    tracing::warn!(job_id = %job.id, queue = %job.queue, attempts = job.attempts, reason = %reason, "Job failed after retries");
                    "exhausted"
                }
            },
            ProcessOutcome::Permanent(reason) => {
                tracing::warn!(job_id = %job.id, queue = %job.queue, reason = %reason, "Job dropped");
                self.queue.fail(job, reason).await?;
                "rejected"
            }
        };
        JOBS_TOTAL.with_label_values(&[&job.queue, label]).inc();

        Ok(outcome)
    }

    /// Process due jobs until none is left. Returns how many ran.
    pub async fn run_pending(&self) -> Result<usize, AppError> {
        let mut processed = 0;
        while let Some(job) = self.queue.claim(&queues::ALL).await? {
            self.run_job(&job).await?;
            processed += 1;
        }
        Ok(processed)
    }

    /// Spawn `workers` tasks that process jobs until `shutdown` flips to true.
    pub fn spawn(self: Arc<Self>, workers: usize, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        (0..workers.max(1))
            .map(|worker| {
                let this = self.clone();
                let shutdown = shutdown.clone();
                tokio::spawn(async move { this.work(worker, shutdown).await })
            })
            .collect()
    }

    async fn work(&self, worker: usize, mut shutdown: watch::Receiver<bool>) {
        tracing::debug!(worker, "Federation worker started");
        loop {
            if *shutdown.borrow() {
                break;
            }

            let job = match self.queue.claim(&queues::ALL).await {
                Ok(job) => job,
                Err(e) => {
                    tracing::error!(worker, error = %e, "Failed to claim job");
                    None
                }
            };

            match job {
                Some(job) => {
                    if let Err(e) = self.run_job(&job).await {
                        tracing::error!(worker, job_id = %job.id, error = %e, "Failed to settle job");
                    }
                }
                None => {
                    tokio::select! {
                        _ = self.queue.wait(self.poll_interval) => {}
                        _ = shutdown.changed() => {}
                    }
                }
            }
        }
        tracing::debug!(worker, "Federation worker stopped");
    }

    /// Approve or reject a pending follow request and queue the response.
    pub async fn respond_to_follow(
        &self,
        follower_uri: &str,
        target_uri: &str,
        decision: FollowDecision,
    ) -> Result<(), AppError> {
        let follow = self
            .db
            .get_follow(follower_uri, target_uri)
            .await?
            .ok_or(AppError::NotFound)?;

        match decision {
            FollowDecision::Accept => self.db.approve_follow(follower_uri, target_uri).await?,
            FollowDecision::Reject => self.db.delete_follow(follower_uri, target_uri).await?,
        };
        tracing::info!(follower = %follower_uri, target = %target_uri, ?decision, "Follow request answered");

        let requester = self.directory.resolve(follower_uri).await?;
        if requester.is_local {
            return Ok(());
        }
        let job = FollowResponseJob {
            requester_uri: follower_uri.to_string(),
            asked_uri: target_uri.to_string(),
            inbox: Some(requester.inbox_uri),
            follow_id: follow.activity_uri,
            decision,
        };
        self.queue.enqueue(queues::FOLLOW_RESPONDER, &job).await?;
        Ok(())
    }
}
