//! Inbound dispatcher
//!
//! Turns a received POST into a queued envelope. Nothing here waits on
//! processing: the request is acknowledged as soon as the envelope is stored.

use std::sync::Arc;

use super::activity::Activity;
use super::domain_filter::DomainBlockFilter;
use super::envelope::{Envelope, Ingress};
use super::queue::JobQueue;
use crate::error::AppError;
use crate::metrics::{ACTIVITIES_RECEIVED, INGRESS_TOTAL};

/// What became of a received request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngressOutcome {
    /// Stored as a job with this id
    Enqueued(String),
    /// The body was not an activity
    Malformed,
    /// No `Signature` header
    MissingSignature,
    /// An actor lives on a blocked domain
    Blocked,
}

impl IngressOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Enqueued(_) => "enqueued",
            Self::Malformed => "malformed",
            Self::MissingSignature => "missing_signature",
            Self::Blocked => "blocked",
        }
    }
}

/// A request as received by an ingestion route
#[derive(Debug, Clone, Copy)]
pub struct InboundRequest<'a> {
    pub method: &'a str,
    /// Path including the query string
    pub path: &'a str,
    pub headers: &'a http::HeaderMap,
    pub body: &'a [u8],
}

#[derive(Clone)]
pub struct InboundDispatcher {
    filter: DomainBlockFilter,
    queue: Arc<JobQueue>,
}

impl InboundDispatcher {
    pub fn new(filter: DomainBlockFilter, queue: Arc<JobQueue>) -> Self {
        Self { filter, queue }
    }

    /// Validate, filter and enqueue one request.
    ///
    /// # Errors
    /// `AppError::Unavailable` when the envelope could not be queued.
    pub async fn dispatch(
        &self,
        ingress: Ingress,
        request: InboundRequest<'_>,
    ) -> Result<IngressOutcome, AppError> {
        let result = self.route(&ingress, request).await;
        let label = match &result {
            Ok(outcome) => outcome.label(),
            Err(_) => "unavailable",
        };
        INGRESS_TOTAL
            .with_label_values(&[ingress.label(), label])
            .inc();
        result
    }

    async fn route(
        &self,
        ingress: &Ingress,
        request: InboundRequest<'_>,
    ) -> Result<IngressOutcome, AppError> {
        let activity = match Activity::from_slice(request.body) {
            Ok(activity) => activity,
            Err(e) => {
                tracing::debug!(ingress = ingress.label(), error = %e, "Malformed activity body");
                return Ok(IngressOutcome::Malformed);
            }
        };
        ACTIVITIES_RECEIVED
            .with_label_values(&[activity.kind.as_str()])
            .inc();

        if !request.headers.contains_key("signature") {
            tracing::info!(activity_id = %activity.id, ingress = ingress.label(), "Missing signature headers");
            return Ok(IngressOutcome::MissingSignature);
        }

        if self.filter.is_blocked(&activity) {
            return Ok(IngressOutcome::Blocked);
        }

        let activity_id = activity.id.clone();
        let envelope = match Envelope::new(
            ingress.clone(),
            request.method,
            request.path,
            request.headers,
            request.body,
            activity,
        ) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::debug!(activity_id = %activity_id, error = %e, "Unusable request body");
                return Ok(IngressOutcome::Malformed);
            }
        };

        let job_id = self.queue.enqueue(ingress.queue(), &envelope).await?;
        tracing::debug!(activity_id = %activity_id, job_id = %job_id, queue = ingress.queue(), "Envelope queued");
        Ok(IngressOutcome::Enqueued(job_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use http::{HeaderMap, HeaderValue};
    use tempfile::TempDir;

    use crate::data::{Database, JobStatus};
    use crate::federation::activity::builder;
    use crate::federation::queue::queues;
    use crate::federation::retry::RetryPolicy;
    use crate::federation::test_support::test_db;

    async fn dispatcher(blocked: &[&str]) -> (TempDir, Arc<Database>, InboundDispatcher) {
        let (dir, db) = test_db().await;
        let policy = RetryPolicy {
            max_attempts: 3,
            base_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
        };
        let queue = Arc::new(JobQueue::new(db.clone(), policy));
        let filter = DomainBlockFilter::fixed(blocked.iter().copied());
        (dir, db, InboundDispatcher::new(filter, queue))
    }

    fn signed_headers() -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            "signature",
            HeaderValue::from_static("keyId=\"https://remote.example/users/alice#main-key\""),
        );
        headers
    }

    fn follow_from(actor: &str) -> Vec<u8> {
        serde_json::to_vec(&builder::follow(
            "https://remote.example/f/1",
            actor,
            "https://photos.example/actors/bob",
        ))
        .expect("serializes")
    }

    fn request<'a>(headers: &'a HeaderMap, body: &'a [u8]) -> InboundRequest<'a> {
        InboundRequest {
            method: "POST",
            path: "/actors/bob/inbox",
            headers,
            body,
        }
    }

    fn bob_inbox() -> Ingress {
        Ingress::ActorInbox {
            username: "bob".to_string(),
        }
    }

    #[tokio::test]
    async fn signed_activity_is_queued_for_its_ingress() {
        let (_dir, db, dispatcher) = dispatcher(&[]).await;
        let headers = signed_headers();
        let body = follow_from("https://remote.example/users/alice");

        let outcome = dispatcher
            .dispatch(bob_inbox(), request(&headers, &body))
            .await
            .expect("dispatch");
        assert!(matches!(outcome, IngressOutcome::Enqueued(_)));
        assert_eq!(
            db.count_jobs(queues::USER_INBOX, Some(JobStatus::Pending))
                .await
                .expect("count"),
            1
        );

        dispatcher
            .dispatch(Ingress::SharedInbox, request(&headers, &body))
            .await
            .expect("dispatch");
        assert_eq!(db.count_jobs(queues::SHARED_INBOX, None).await.expect("count"), 1);
    }

    #[tokio::test]
    async fn malformed_unsigned_and_blocked_requests_are_not_queued() {
        let (_dir, db, dispatcher) = dispatcher(&["bad.example"]).await;
        let signed = signed_headers();
        let unsigned = HeaderMap::new();

        let malformed = dispatcher
            .dispatch(bob_inbox(), request(&signed, b"{not json"))
            .await
            .expect("dispatch");
        assert_eq!(malformed, IngressOutcome::Malformed);

        let body = follow_from("https://remote.example/users/alice");
        let missing = dispatcher
            .dispatch(bob_inbox(), request(&unsigned, &body))
            .await
            .expect("dispatch");
        assert_eq!(missing, IngressOutcome::MissingSignature);

        let blocked_body = follow_from("https://bad.example/users/spammer");
        let blocked = dispatcher
            .dispatch(bob_inbox(), request(&signed, &blocked_body))
            .await
            .expect("dispatch");
        assert_eq!(blocked, IngressOutcome::Blocked);

        assert_eq!(db.count_jobs(queues::USER_INBOX, None).await.expect("count"), 0);
    }
}
