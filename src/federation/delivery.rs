//! Activity delivery
//!
//! Fans an activity out to remote inboxes: resolves addressing to actors,
//! groups them by inbox, signs one request per destination and retries
//! with bounded backoff. Every fan-out is recorded in the audit trail.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::Utc;
use futures::future::join_all;
use serde_json::Value;
use tokio::sync::Semaphore;

use super::activity::{Activity, ActivityKind, PUBLIC_AUDIENCE, value_id};
use super::actors::ActorDirectory;
use super::audit::{DeliveryAudit, DeliveryReport};
use super::retry::{AttemptOutcome, DestinationDelivery, NextStep, RetryPolicy, with_jitter};
use super::signature::{ActorSigner, SignatureHeaders};
use crate::data::{Actor, Database};
use crate::error::AppError;
use crate::metrics::{DELIVERY_ATTEMPTS, DELIVERY_DURATION_SECONDS};

pub const ACTIVITY_CONTENT_TYPE: &str = "application/activity+json";

/// Sends one signed POST to an inbox
#[async_trait]
pub trait InboxTransport: Send + Sync {
    /// Returns the response status; `Err` means no response was received.
    async fn post(
        &self,
        inbox_url: &str,
        headers: &SignatureHeaders,
        body: &[u8],
    ) -> Result<u16, AppError>;
}

/// [`InboxTransport`] over `reqwest`
pub struct ReqwestTransport {
    http_client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(http_client: reqwest::Client) -> Self {
        Self { http_client }
    }
}

#[async_trait]
impl InboxTransport for ReqwestTransport {
    async fn post(
        &self,
        inbox_url: &str,
        headers: &SignatureHeaders,
        body: &[u8],
    ) -> Result<u16, AppError> {
        let mut request = self
            .http_client
            .post(inbox_url)
            .header(reqwest::header::HOST, &headers.host)
            .header(reqwest::header::CONTENT_TYPE, ACTIVITY_CONTENT_TYPE)
            .header(reqwest::header::DATE, &headers.date)
            .header("Signature", &headers.signature);

        if let Some(digest) = &headers.digest {
            request = request.header("Digest", digest);
        }

        let response = request.body(body.to_vec()).send().await?;
        Ok(response.status().as_u16())
    }
}

/// One addressed recipient
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recipient {
    /// Every approved follower of this actor
    FollowersOf(String),
    Actor(String),
}

/// Who an activity should be delivered to
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Addressing {
    pub recipients: Vec<Recipient>,
}

impl Addressing {
    /// Addressing derived from the activity's audience fields.
    ///
    /// `sender`'s followers collection expands to its followers and the
    /// public collection is dropped.
    pub fn from_activity(activity: &Activity, sender: &Actor) -> Self {
        let followers = sender.followers_uri();
        let recipients = activity
            .audience()
            .into_iter()
            .filter(|uri| !is_public(uri))
            .filter(|uri| uri != &sender.uri)
            .map(|uri| {
                if uri == followers {
                    Recipient::FollowersOf(sender.uri.clone())
                } else {
                    Recipient::Actor(uri)
                }
            })
            .collect();
        Self { recipients }
    }

    pub fn followers_of(actor_uri: &str) -> Self {
        Self {
            recipients: vec![Recipient::FollowersOf(actor_uri.to_string())],
        }
    }

    pub fn actor(actor_uri: &str) -> Self {
        Self {
            recipients: vec![Recipient::Actor(actor_uri.to_string())],
        }
    }

    pub fn is_empty(&self) -> bool {
        self.recipients.is_empty()
    }
}

fn is_public(uri: &str) -> bool {
    uri == PUBLIC_AUDIENCE || uri == "as:Public" || uri == "Public"
}

/// Deduplicate identical inbox URIs while keeping distinct personal inboxes.
///
/// This preserves recipients on the same domain that use different inbox paths.
fn unique_inbox_targets(inbox_uris: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut targets = Vec::new();

    for inbox_uri in inbox_uris {
        if seen.insert(inbox_uri.clone()) {
            targets.push(inbox_uri);
        }
    }

    targets
}

#[derive(Clone)]
pub struct DeliveryEngine {
    db: Arc<Database>,
    directory: Arc<ActorDirectory>,
    transport: Arc<dyn InboxTransport>,
    audit: DeliveryAudit,
    policy: RetryPolicy,
    concurrency: usize,
}

impl DeliveryEngine {
    pub fn new(
        db: Arc<Database>,
        directory: Arc<ActorDirectory>,
        transport: Arc<dyn InboxTransport>,
        policy: RetryPolicy,
        concurrency: usize,
    ) -> Self {
        Self {
            audit: DeliveryAudit::new(db.clone()),
            db,
            directory,
            transport,
            policy,
            concurrency: concurrency.max(1),
        }
    }

    /// Addressing for an outgoing activity, falling back to the object's
    /// owner for activities that carry no audience.
    pub async fn addressing_for(&self, activity: &Activity, sender: &Actor) -> Result<Addressing, AppError> {
        let addressing = Addressing::from_activity(activity, sender);
        if !addressing.is_empty() || !activity.kind.targets_object_owner() {
            return Ok(addressing);
        }

        Ok(match self.object_owner(&activity.kind, &activity.object).await? {
            Some(owner) if owner != sender.uri => Addressing::actor(&owner),
            _ => Addressing::default(),
        })
    }

    async fn object_owner(&self, kind: &ActivityKind, object: &Value) -> Result<Option<String>, AppError> {
        match kind {
            ActivityKind::Follow => Ok(value_id(object).map(str::to_string)),
            ActivityKind::Accept | ActivityKind::Reject => {
                if let Some(actor) = object.get("actor").and_then(value_id) {
                    return Ok(Some(actor.to_string()));
                }
                let Some(follow_id) = value_id(object) else {
                    return Ok(None);
                };
                Ok(self
                    .db
                    .get_follow_by_activity(follow_id)
                    .await?
                    .map(|follow| follow.follower_uri))
            }
            ActivityKind::Like | ActivityKind::Announce => {
                let Some(status_uri) = value_id(object) else {
                    return Ok(None);
                };
                Ok(self
                    .db
                    .get_status_by_uri(status_uri)
                    .await?
                    .map(|status| status.actor_uri))
            }
            ActivityKind::Undo => {
                let inner_kind = object
                    .get("type")
                    .and_then(Value::as_str)
                    .map(ActivityKind::parse);
                let inner_object = object.get("object");
                match (inner_kind, inner_object) {
                    (Some(kind), Some(inner)) if kind != ActivityKind::Undo => {
                        Box::pin(self.object_owner(&kind, inner)).await
                    }
                    _ => Ok(None),
                }
            }
            _ => Ok(None),
        }
    }

    /// Distinct remote inboxes for `addressing`.
    ///
    /// Local actors are skipped, as are recipients that cannot be resolved.
    pub async fn resolve_inboxes(&self, addressing: &Addressing) -> Result<Vec<String>, AppError> {
        let mut actors: Vec<Actor> = Vec::new();

        for recipient in &addressing.recipients {
            match recipient {
                Recipient::FollowersOf(actor_uri) => {
                    actors.extend(self.db.get_follower_actors(actor_uri).await?);
                }
                Recipient::Actor(actor_uri) => match self.directory.resolve(actor_uri).await {
                    Ok(actor) => actors.push(actor),
                    Err(e) => {
                        tracing::warn!(recipient = %actor_uri, error = %e, "Skipping unresolvable recipient");
                    }
                },
            }
        }

        let inboxes = actors
            .iter()
            .filter(|actor| !actor.is_local)
            .map(|actor| actor.delivery_inbox().to_string())
            .collect();
        Ok(unique_inbox_targets(inboxes))
    }

    /// Resolve addressing and deliver.
    pub async fn deliver(
        &self,
        signer: &ActorSigner,
        sender_uri: &str,
        activity: &Activity,
        addressing: &Addressing,
    ) -> Result<Option<DeliveryReport>, AppError> {
        let inboxes = self.resolve_inboxes(addressing).await?;
        self.deliver_to_inboxes(signer, sender_uri, activity, inboxes)
            .await
    }

    /// Deliver to explicit inboxes, recording one audit event.
    ///
    /// Returns `None` without creating an event when there is nowhere to deliver.
    pub async fn deliver_to_inboxes(
        &self,
        signer: &ActorSigner,
        sender_uri: &str,
        activity: &Activity,
        inboxes: Vec<String>,
    ) -> Result<Option<DeliveryReport>, AppError> {
        let inboxes = unique_inbox_targets(inboxes);
        if inboxes.is_empty() {
            tracing::debug!(activity_id = %activity.id, "No remote destinations");
            return Ok(None);
        }

        let body = Arc::new(activity.to_bytes()?);
        let event_id = self
            .audit
            .open(activity.kind.as_str(), sender_uri, &activity.id)
            .await?;

        match self.run_event(&event_id, signer, activity, inboxes, body).await {
            Ok(report) => Ok(Some(report)),
            Err(e) => {
                tracing::error!(activity_id = %activity.id, event_id = %event_id, error = %e, "Delivery event abandoned");
                if let Err(abandon_err) = self.audit.abandon(&event_id, &e.to_string()).await {
                    // Startup recovery closes it instead.
                    tracing::error!(event_id = %event_id, error = %abandon_err, "Failed to close delivery event");
                }
                Err(e)
            }
        }
    }

    async fn run_event(
        &self,
        event_id: &str,
        signer: &ActorSigner,
        activity: &Activity,
        inboxes: Vec<String>,
        body: Arc<Vec<u8>>,
    ) -> Result<DeliveryReport, AppError> {
        let timer = Instant::now();
        self.audit.start(event_id).await?;
        tracing::info!(
            activity_id = %activity.id,
            event_id = %event_id,
            destinations = inboxes.len(),
            "Delivering activity"
        );

        let event_id: Arc<str> = Arc::from(event_id);
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut tasks = Vec::with_capacity(inboxes.len());
        for inbox in &inboxes {
            let task = DestinationTask {
                destination: DestinationDelivery::new(inbox.clone()),
                event_id: event_id.clone(),
                audit: self.audit.clone(),
                signer: signer.clone(),
                transport: self.transport.clone(),
                policy: self.policy,
                semaphore: semaphore.clone(),
                body: body.clone(),
            };
            tasks.push(tokio::spawn(task.run()));
        }

        let mut first_error = None;
        for (inbox, joined) in inboxes.iter().zip(join_all(tasks).await) {
            let recorded = match joined {
                Ok(recorded) => recorded,
                Err(e) => {
                    tracing::error!(inbox = %inbox, error = %e, "Delivery task aborted");
                    let mut aborted = DestinationDelivery::new(inbox.clone());
                    aborted.record(
                        AttemptOutcome::Rejected(format!("task aborted: {}", e)),
                        &self.policy,
                        Utc::now(),
                    );
                    self.audit.record_item(&event_id, &aborted).await
                }
            };
            if let Err(e) = recorded {
                tracing::error!(event_id = %event_id, inbox = %inbox, error = %e, "Failed to record delivery item");
                first_error.get_or_insert(e);
            }
        }
        if let Some(e) = first_error {
            return Err(e);
        }

        let report = self.audit.conclude(&event_id).await?;
        DELIVERY_DURATION_SECONDS.observe(timer.elapsed().as_secs_f64());

        if report.failed > 0 {
            tracing::warn!(
                activity_id = %activity.id,
                event_id = %event_id,
                succeeded = report.succeeded,
                failed = report.failed,
                "Delivery finished with failures"
            );
        } else {
            tracing::info!(
                activity_id = %activity.id,
                event_id = %event_id,
                succeeded = report.succeeded,
                "Delivery finished"
            );
        }
        Ok(report)
    }
}

/// Drives one destination to a terminal state and stores its item
struct DestinationTask {
    destination: DestinationDelivery,
    event_id: Arc<str>,
    audit: DeliveryAudit,
    signer: ActorSigner,
    transport: Arc<dyn InboxTransport>,
    policy: RetryPolicy,
    semaphore: Arc<Semaphore>,
    body: Arc<Vec<u8>>,
}

impl DestinationTask {
    async fn run(mut self) -> Result<(), AppError> {
        loop {
            let now = Utc::now();
            if !self.destination.is_eligible(now) {
                tokio::time::sleep(with_jitter(self.destination.wait_from(now))).await;
            }

            let outcome = self.attempt().await;
            DELIVERY_ATTEMPTS.with_label_values(&[outcome.label()]).inc();
            if let AttemptOutcome::Retryable(reason) | AttemptOutcome::Rejected(reason) = &outcome {
                tracing::debug!(inbox = %self.destination.url, reason = %reason, "Delivery attempt failed");
            }

            if self.destination.record(outcome, &self.policy, Utc::now()) == NextStep::Done {
                break;
            }
        }
        self.audit.record_item(&self.event_id, &self.destination).await
    }

    async fn attempt(&mut self) -> AttemptOutcome {
        // Only in-flight requests count against the limit, not backoff sleeps.
        let semaphore = self.semaphore.clone();
        let Ok(_permit) = semaphore.acquire().await else {
            return AttemptOutcome::Rejected("delivery cancelled".to_string());
        };
        self.destination.begin_attempt(Utc::now());

        // Signed per attempt so the Date header stays fresh across retries.
        let headers = match self
            .signer
            .sign_request("POST", &self.destination.url, Some(&self.body))
        {
            Ok(headers) => headers,
            Err(e) => return AttemptOutcome::Rejected(e.to_string()),
        };

        match self
            .transport
            .post(&self.destination.url, &headers, &self.body)
            .await
        {
            Ok(status) => AttemptOutcome::from_status(status),
            Err(e) => AttemptOutcome::Retryable(e.to_string()),
        }
    }
}
