//! Activity handlers
//!
//! Applies the local side effects of an authenticated activity. Every
//! handler is an upsert or a guarded delete, so applying the same activity
//! twice leaves the same state.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;

use super::activity::{Activity, ActivityKind, sanitize_remote_html, value_id};
use super::actors::ActorDirectory;
use super::follow_responder::{FollowDecision, FollowResponseJob};
use super::queue::{JobQueue, queues};
use crate::data::{Database, EntityId, Status};
use crate::error::AppError;

/// Object types that denote an actor rather than content
const ACTOR_TYPES: [&str; 5] = ["Person", "Service", "Application", "Group", "Organization"];

pub struct ActivityProcessor {
    db: Arc<Database>,
    directory: Arc<ActorDirectory>,
    queue: Arc<JobQueue>,
}

impl ActivityProcessor {
    pub fn new(db: Arc<Database>, directory: Arc<ActorDirectory>, queue: Arc<JobQueue>) -> Self {
        Self {
            db,
            directory,
            queue,
        }
    }

    /// Apply `activity` on behalf of the authenticated `actor_uri`.
    ///
    /// # Errors
    /// Transient errors ([`AppError::is_transient`]) are worth retrying;
    /// anything else means the activity can never be applied.
    pub async fn apply(&self, activity: &Activity, actor_uri: &str) -> Result<(), AppError> {
        tracing::debug!(
            activity_id = %activity.id,
            activity_type = %activity.kind,
            actor = %actor_uri,
            "Applying activity"
        );

        match &activity.kind {
            ActivityKind::Follow => self.handle_follow(activity, actor_uri).await,
            ActivityKind::Accept => self.handle_follow_response(activity, actor_uri, true).await,
            ActivityKind::Reject => self.handle_follow_response(activity, actor_uri, false).await,
            ActivityKind::Create => self.handle_create(activity, actor_uri).await,
            ActivityKind::Update => self.handle_update(activity, actor_uri).await,
            ActivityKind::Delete => self.handle_delete(activity, actor_uri).await,
            ActivityKind::Like => self.handle_like(activity, actor_uri).await,
            ActivityKind::Announce => self.handle_announce(activity, actor_uri).await,
            ActivityKind::Undo => self.handle_undo(activity, actor_uri).await,
            ActivityKind::Move => self.handle_move(activity, actor_uri).await,
            ActivityKind::Unsupported(kind) => {
                tracing::info!(activity_id = %activity.id, activity_type = %kind, "Ignoring unsupported activity");
                Ok(())
            }
        }
    }

    async fn handle_follow(&self, activity: &Activity, actor_uri: &str) -> Result<(), AppError> {
        let target_uri = activity
            .object_id()
            .ok_or_else(|| AppError::Unprocessable("Follow without object".to_string()))?;

        let target = self.db.get_actor_by_uri(target_uri).await?;
        match target {
            Some(target) if target.is_local => {
                let follow = self
                    .db
                    .upsert_follow(
                        Some(&activity.id),
                        actor_uri,
                        &target.uri,
                        !target.manually_approves_followers,
                    )
                    .await?;

                if !follow.approved {
                    tracing::info!(follower = %actor_uri, target = %target.uri, "Follow request awaiting approval");
                    return Ok(());
                }

                let requester = self.directory.resolve(actor_uri).await?;
                if requester.is_local {
                    // Both sides live here; the approved row is the whole answer.
                    tracing::info!(follower = %actor_uri, target = %target.uri, "Local follow approved");
                    return Ok(());
                }
                let job = FollowResponseJob {
                    requester_uri: actor_uri.to_string(),
                    asked_uri: target.uri.clone(),
                    inbox: Some(requester.inbox_uri),
                    follow_id: Some(activity.id.clone()),
                    decision: FollowDecision::Accept,
                };
                self.queue.enqueue(queues::FOLLOW_RESPONDER, &job).await?;
                tracing::info!(follower = %actor_uri, target = %target.uri, "Follow approved");
                Ok(())
            }
            _ => {
                // Only outgoing follows of local actors are tracked for remote targets.
                let follower = self.db.get_actor_by_uri(actor_uri).await?;
                if follower.is_some_and(|f| f.is_local) {
                    self.db
                        .upsert_follow(Some(&activity.id), actor_uri, target_uri, false)
                        .await?;
                } else {
                    tracing::debug!(target = %target_uri, "Follow does not concern a local actor");
                }
                Ok(())
            }
        }
    }

    /// Accept or Reject of a follow that `actor_uri` was asked for.
    async fn handle_follow_response(
        &self,
        activity: &Activity,
        actor_uri: &str,
        accepted: bool,
    ) -> Result<(), AppError> {
        let mut follower_uri = None;

        if let Some(follow_id) = activity.object_id() {
            if let Some(follow) = self.db.get_follow_by_activity(follow_id).await? {
                if follow.target_uri == actor_uri {
                    follower_uri = Some(follow.follower_uri);
                }
            }
        }

        // Fall back to the (follower, accepting actor) pair of an embedded Follow.
        if follower_uri.is_none() {
            if let Some(follow) = activity.embedded_object() {
                let object_matches = follow.get("object").and_then(value_id) == Some(actor_uri);
                if object_matches {
                    follower_uri = follow.get("actor").and_then(value_id).map(str::to_string);
                }
            }
        }

        let Some(follower_uri) = follower_uri else {
            tracing::debug!(activity_id = %activity.id, "No follow matches this response");
            return Ok(());
        };

        if accepted {
            self.db.approve_follow(&follower_uri, actor_uri).await?;
            tracing::info!(follower = %follower_uri, target = %actor_uri, "Follow accepted");
        } else {
            self.db.delete_follow(&follower_uri, actor_uri).await?;
            tracing::info!(follower = %follower_uri, target = %actor_uri, "Follow rejected");
        }
        Ok(())
    }

    async fn handle_create(&self, activity: &Activity, actor_uri: &str) -> Result<(), AppError> {
        let Some(object) = activity.embedded_object() else {
            tracing::debug!(activity_id = %activity.id, "Create without embedded object, ignoring");
            return Ok(());
        };
        let uri = value_id(object)
            .ok_or_else(|| AppError::Unprocessable("Created object has no id".to_string()))?;

        if let Some(owner) = object.get("attributedTo").and_then(value_id) {
            if owner != actor_uri {
                return Err(AppError::Unprocessable(format!(
                    "{} cannot create objects attributed to {}",
                    actor_uri, owner
                )));
            }
        }

        let now = Utc::now();
        let status = Status {
            id: EntityId::new().0,
            uri: uri.to_string(),
            activity_uri: Some(activity.id.clone()),
            actor_uri: actor_uri.to_string(),
            content: sanitize_remote_html(object_content(object)),
            in_reply_to_uri: object
                .get("inReplyTo")
                .and_then(value_id)
                .map(str::to_string),
            published_at: object
                .get("published")
                .and_then(Value::as_str)
                .and_then(|p| DateTime::parse_from_rfc3339(p).ok())
                .map(|p| p.with_timezone(&Utc))
                .unwrap_or(now),
            created_at: now,
            updated_at: now,
        };
        self.db.upsert_status(&status).await
    }

    async fn handle_update(&self, activity: &Activity, actor_uri: &str) -> Result<(), AppError> {
        let Some(object) = activity.embedded_object() else {
            tracing::debug!(activity_id = %activity.id, "Update without embedded object, ignoring");
            return Ok(());
        };
        let uri = value_id(object)
            .ok_or_else(|| AppError::Unprocessable("Updated object has no id".to_string()))?;

        let is_actor = activity
            .object_type()
            .is_some_and(|kind| ACTOR_TYPES.contains(&kind));
        if is_actor {
            if uri != actor_uri {
                return Err(AppError::Unprocessable(format!(
                    "{} cannot update actor {}",
                    actor_uri, uri
                )));
            }
            self.directory.refresh(actor_uri).await?;
            return Ok(());
        }

        let content = sanitize_remote_html(object_content(object));
        if !self.db.update_status_content(uri, actor_uri, &content).await? {
            tracing::debug!(object = %uri, actor = %actor_uri, "Update for unknown or foreign status, ignoring");
        }
        Ok(())
    }

    async fn handle_delete(&self, activity: &Activity, actor_uri: &str) -> Result<(), AppError> {
        let target = activity
            .delete_target()
            .ok_or_else(|| AppError::Unprocessable("Delete without object".to_string()))?;

        if target == actor_uri {
            let is_local = self
                .db
                .get_actor_by_uri(actor_uri)
                .await?
                .is_some_and(|actor| actor.is_local);
            if !is_local {
                self.db.purge_actor_content(actor_uri).await?;
                tracing::info!(actor = %actor_uri, "Removed deleted actor");
            }
            return Ok(());
        }

        if !self.db.delete_status(target, actor_uri).await? {
            tracing::debug!(object = %target, actor = %actor_uri, "Delete for unknown or foreign status, ignoring");
        }
        Ok(())
    }

    async fn handle_like(&self, activity: &Activity, actor_uri: &str) -> Result<(), AppError> {
        let status_uri = activity
            .object_id()
            .ok_or_else(|| AppError::Unprocessable("Like without object".to_string()))?;
        self.db
            .insert_favourite(&activity.id, actor_uri, status_uri)
            .await
    }

    async fn handle_announce(&self, activity: &Activity, actor_uri: &str) -> Result<(), AppError> {
        let status_uri = activity
            .object_id()
            .ok_or_else(|| AppError::Unprocessable("Announce without object".to_string()))?;
        self.db.insert_reblog(&activity.id, actor_uri, status_uri).await
    }

    async fn handle_undo(&self, activity: &Activity, actor_uri: &str) -> Result<(), AppError> {
        let undone_id = activity.object_id();
        let embedded = activity.embedded_object();

        if let Some(embedded_actor) = embedded.and_then(|o| o.get("actor")).and_then(value_id) {
            if embedded_actor != actor_uri {
                return Err(AppError::Unprocessable(format!(
                    "{} cannot undo an activity of {}",
                    actor_uri, embedded_actor
                )));
            }
        }

        let undone_kind = embedded
            .and_then(|o| o.get("type"))
            .and_then(Value::as_str)
            .map(ActivityKind::parse);
        let undone_object = embedded.and_then(|o| o.get("object")).and_then(value_id);

        let removed = match undone_kind {
            Some(ActivityKind::Follow) => self.undo_follow(undone_id, actor_uri, undone_object).await?,
            Some(ActivityKind::Like) => {
                self.db
                    .delete_favourite(undone_id.unwrap_or_default(), actor_uri, undone_object)
                    .await?
            }
            Some(ActivityKind::Announce) => {
                self.db
                    .delete_reblog(undone_id.unwrap_or_default(), actor_uri, undone_object)
                    .await?
            }
            Some(_) => false,
            // Object given by reference only: try every kind we track.
            None => match undone_id {
                Some(id) => {
                    self.undo_follow(Some(id), actor_uri, None).await?
                        | self.db.delete_favourite(id, actor_uri, None).await?
                        | self.db.delete_reblog(id, actor_uri, None).await?
                }
                None => false,
            },
        };

        if !removed {
            tracing::debug!(activity_id = %activity.id, "Undo matched nothing");
        }
        Ok(())
    }

    async fn undo_follow(
        &self,
        follow_id: Option<&str>,
        actor_uri: &str,
        target_uri: Option<&str>,
    ) -> Result<bool, AppError> {
        if let Some(follow_id) = follow_id {
            if let Some(follow) = self.db.get_follow_by_activity(follow_id).await? {
                if follow.follower_uri == actor_uri {
                    return self.db.delete_follow(actor_uri, &follow.target_uri).await;
                }
            }
        }
        match target_uri {
            Some(target) => self.db.delete_follow(actor_uri, target).await,
            None => Ok(false),
        }
    }

    async fn handle_move(&self, activity: &Activity, actor_uri: &str) -> Result<(), AppError> {
        if activity.object_id() != Some(actor_uri) {
            return Err(AppError::Unprocessable(
                "Move object must be the moving actor".to_string(),
            ));
        }
        let target = activity
            .raw()
            .get("target")
            .and_then(value_id)
            .ok_or_else(|| AppError::Unprocessable("Move without target".to_string()))?;

        self.db.set_actor_moved_to(actor_uri, target).await?;
        tracing::info!(actor = %actor_uri, moved_to = %target, "Actor moved");
        Ok(())
    }
}

fn object_content(object: &Value) -> &str {
    object
        .get("content")
        .and_then(Value::as_str)
        .or_else(|| object.get("name").and_then(Value::as_str))
        .unwrap_or_default()
}
