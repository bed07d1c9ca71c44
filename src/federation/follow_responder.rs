//! Follow approval responder
//!
//! Answers follow requests addressed to local actors with a signed Accept
//! or Reject that references the original Follow.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::json;

use super::activity::{Activity, builder};
use super::audit::DeliveryReport;
use super::delivery::DeliveryEngine;
use super::signature::ActorSigner;
use crate::data::{Database, EntityId};
use crate::error::AppError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FollowDecision {
    Accept,
    Reject,
}

impl FollowDecision {
    fn path_segment(&self) -> &'static str {
        match self {
            Self::Accept => "accept",
            Self::Reject => "reject",
        }
    }
}

/// Payload of a `follow-responder` job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FollowResponseJob {
    pub requester_uri: String,
    pub asked_uri: String,
    pub inbox: Option<String>,
    pub follow_id: Option<String>,
    pub decision: FollowDecision,
}

/// A follow request ready to be answered
#[derive(Debug, Clone)]
pub struct FollowApprovalRequest {
    pub requester_uri: String,
    pub asked_uri: String,
    /// Requester's inbox
    pub inbox: String,
    /// Id of the Follow being answered
    pub follow_id: String,
    pub signer: ActorSigner,
}

pub struct FollowResponder {
    db: Arc<Database>,
    engine: DeliveryEngine,
}

impl FollowResponder {
    pub fn new(db: Arc<Database>, engine: DeliveryEngine) -> Self {
        Self { db, engine }
    }

    /// Process a queued response, resolving the asked actor's signing key.
    pub async fn run(&self, job: &FollowResponseJob) -> Result<Option<DeliveryReport>, AppError> {
        let (Some(inbox), Some(follow_id)) = (job.inbox.as_deref(), job.follow_id.as_deref()) else {
            return Ok(None);
        };
        if inbox.is_empty() || follow_id.is_empty() {
            return Ok(None);
        }
        let requester = self.db.get_actor_by_uri(&job.requester_uri).await?;
        if requester.is_some_and(|actor| actor.is_local) {
            tracing::debug!(requester = %job.requester_uri, "Skipping response to local follower");
            return Ok(None);
        }

        let signer = self.db.local_signer(&job.asked_uri).await?.ok_or_else(|| {
            AppError::Federation(format!("No signing key for local actor {}", job.asked_uri))
        })?;

        let request = FollowApprovalRequest {
            requester_uri: job.requester_uri.clone(),
            asked_uri: job.asked_uri.clone(),
            inbox: inbox.to_string(),
            follow_id: follow_id.to_string(),
            signer,
        };
        self.respond(&request, job.decision).await
    }

    /// Sign and deliver the response. Does nothing when the inbox or the
    /// follow id is empty.
    pub async fn respond(
        &self,
        request: &FollowApprovalRequest,
        decision: FollowDecision,
    ) -> Result<Option<DeliveryReport>, AppError> {
        if request.inbox.is_empty() || request.follow_id.is_empty() {
            return Ok(None);
        }

        let response = response_activity(request, decision)?;
        tracing::info!(
            follow_id = %request.follow_id,
            requester = %request.requester_uri,
            decision = decision.path_segment(),
            "Answering follow request"
        );

        self.engine
            .deliver_to_inboxes(
                &request.signer,
                &request.asked_uri,
                &response,
                vec![request.inbox.clone()],
            )
            .await
    }
}

fn response_activity(
    request: &FollowApprovalRequest,
    decision: FollowDecision,
) -> Result<Activity, AppError> {
    let id = format!(
        "{}/{}/{}",
        request.asked_uri,
        decision.path_segment(),
        EntityId::new().0
    );
    let follow = json!({
        "id": request.follow_id,
        "type": "Follow",
        "actor": request.requester_uri,
        "object": request.asked_uri,
    });
    let value = match decision {
        FollowDecision::Accept => builder::accept(&id, &request.asked_uri, follow),
        FollowDecision::Reject => builder::reject(&id, &request.asked_uri, follow),
    };

    Activity::try_from(value)
        .map_err(|e| AppError::Internal(anyhow::anyhow!("Invalid follow response: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::data::DeliveryEventResult;
    use crate::federation::activity::ActivityKind;
    use crate::federation::actors::{ActorDirectory, MockActorFetcher};
    use crate::federation::retry::RetryPolicy;
    use crate::federation::test_support::{ScriptedTransport, local_actor, test_db};

    const REQUESTER: &str = "https://remote.example/users/alice";
    const INBOX: &str = "https://remote.example/users/alice/inbox";

    async fn responder() -> (tempfile::TempDir, Arc<Database>, Arc<ScriptedTransport>, FollowResponder, String) {
        let (dir, db) = test_db().await;
        let bob = local_actor("https://photos.example", "bob", true);
        db.upsert_actor(&bob).await.expect("bob");

        let transport = Arc::new(ScriptedTransport::default());
        let directory = Arc::new(ActorDirectory::new(db.clone(), Arc::new(MockActorFetcher::new())));
        let policy = RetryPolicy {
            max_attempts: 1,
            base_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
        };
        let engine = DeliveryEngine::new(db.clone(), directory, transport.clone(), policy, 2);
        (dir, db.clone(), transport, FollowResponder::new(db, engine), bob.uri)
    }

    fn job(asked: &str, inbox: Option<&str>, follow_id: Option<&str>, decision: FollowDecision) -> FollowResponseJob {
        FollowResponseJob {
            requester_uri: REQUESTER.to_string(),
            asked_uri: asked.to_string(),
            inbox: inbox.map(str::to_string),
            follow_id: follow_id.map(str::to_string),
            decision,
        }
    }

    #[tokio::test]
    async fn accept_references_original_follow() {
        let (_dir, db, transport, responder, bob) = responder().await;

        let report = responder
            .run(&job(&bob, Some(INBOX), Some("https://remote.example/follows/9"), FollowDecision::Accept))
            .await
            .expect("run")
            .expect("delivered");
        assert_eq!(report.result, DeliveryEventResult::Finished);

        let posted = transport.activities();
        let (url, accept) = &posted[0];
        assert_eq!(url, INBOX);
        assert_eq!(accept.kind, ActivityKind::Accept);
        assert_eq!(accept.primary_actor(), bob);
        assert!(accept.id.starts_with(&format!("{}/accept/", bob)));
        assert_eq!(accept.object_id(), Some("https://remote.example/follows/9"));

        let (events, _) = db
            .list_delivery_events(&Default::default(), Default::default())
            .await
            .expect("events");
        assert_eq!(events[0].event_type, "Accept");
    }

    #[tokio::test]
    async fn reject_is_delivered_as_reject() {
        let (_dir, _db, transport, responder, bob) = responder().await;
        responder
            .run(&job(&bob, Some(INBOX), Some("https://remote.example/follows/9"), FollowDecision::Reject))
            .await
            .expect("run");

        let reject = &transport.activities()[0].1;
        assert_eq!(reject.kind, ActivityKind::Reject);
    }

    #[tokio::test]
    async fn empty_inbox_or_follow_id_does_nothing() {
        let (_dir, db, transport, responder, bob) = responder().await;

        for job in [
            job(&bob, None, Some("https://remote.example/follows/9"), FollowDecision::Accept),
            job(&bob, Some(""), Some("https://remote.example/follows/9"), FollowDecision::Accept),
            job(&bob, Some(INBOX), None, FollowDecision::Accept),
            job(&bob, Some(INBOX), Some(""), FollowDecision::Accept),
        ] {
            assert!(responder.run(&job).await.expect("run").is_none());
        }

        assert!(transport.activities().is_empty());
        let (_, total) = db
            .list_delivery_events(&Default::default(), Default::default())
            .await
            .expect("events");
        assert_eq!(total, 0);
    }

    #[tokio::test]
    async fn local_requester_gets_no_response() {
        let (_dir, db, transport, responder, bob) = responder().await;
        let carol = local_actor("https://photos.example", "carol", false);
        db.upsert_actor(&carol).await.expect("carol");

        let mut local = job(&bob, Some(&carol.inbox_uri), Some("https://photos.example/follows/3"), FollowDecision::Accept);
        local.requester_uri = carol.uri.clone();
        assert!(responder.run(&local).await.expect("run").is_none());

        assert!(transport.activities().is_empty());
        let (_, total) = db
            .list_delivery_events(&Default::default(), Default::default())
            .await
            .expect("events");
        assert_eq!(total, 0);
    }

    #[tokio::test]
    async fn asked_actor_without_key_fails() {
        let (_dir, _db, _transport, responder, _bob) = responder().await;
        let result = responder
            .run(&job(
                "https://photos.example/actors/nobody",
                Some(INBOX),
                Some("https://remote.example/follows/9"),
                FollowDecision::Accept,
            ))
            .await;
        assert!(matches!(result, Err(AppError::Federation(_))));
    }
}
