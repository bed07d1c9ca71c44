//! SQLite database operations
//!
//! All database access goes through this module.
//! Uses SQLx with runtime-checked queries.

use chrono::{DateTime, Utc};
use sqlx::{Pool, QueryBuilder, Sqlite, SqlitePool};
use std::path::Path;

use super::models::*;
use crate::error::AppError;
use crate::federation::ActorSigner;

/// Database connection pool wrapper.
pub struct Database {
    pool: Pool<Sqlite>,
}

/// Pagination window (zero-based page)
#[derive(Debug, Clone, Copy)]
pub struct Page {
    pub page: u32,
    pub size: u32,
}

impl Page {
    pub const MAX_SIZE: u32 = 100;

    pub fn new(page: u32, size: u32) -> Self {
        Self {
            page,
            size: size.clamp(1, Self::MAX_SIZE),
        }
    }

    fn offset(&self) -> i64 {
        i64::from(self.page) * i64::from(self.size)
    }
}

impl Default for Page {
    fn default() -> Self {
        Self::new(0, 20)
    }
}

/// Column used to order delivery event listings
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DeliveryEventSort {
    #[default]
    CreatedAt,
    StartAt,
    EndAt,
}

impl DeliveryEventSort {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "createdAt" | "created_at" => Some(Self::CreatedAt),
            "startAt" | "start_at" => Some(Self::StartAt),
            "endAt" | "end_at" => Some(Self::EndAt),
            _ => None,
        }
    }

    fn column(&self) -> &'static str {
        match self {
            Self::CreatedAt => "created_at",
            Self::StartAt => "start_at",
            Self::EndAt => "end_at",
        }
    }
}

/// Filters for the administrative delivery event listing
#[derive(Debug, Clone, Default)]
pub struct DeliveryEventFilter {
    pub event_type: Option<String>,
    pub result: Option<DeliveryEventResult>,
    pub sort: DeliveryEventSort,
    pub ascending: bool,
}

impl Database {
    /// Connect to SQLite database
    ///
    /// Creates the database file if it doesn't exist.
    /// Runs pending migrations automatically.
    ///
    /// # Errors
    /// Returns error if connection or migration fails
    pub async fn connect(path: &Path) -> Result<Self, AppError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| AppError::Database(sqlx::Error::Io(e)))?;
        }

        let connection_string = format!("sqlite:{}?mode=rwc", path.display());
        let pool = SqlitePool::connect(&connection_string).await?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| {
                tracing::error!("Migration failed: {}", e);
                AppError::Internal(anyhow::anyhow!("Migration failed: {}", e))
            })?;

        tracing::info!("Database connected and migrated successfully");

        Ok(Self { pool })
    }

    #[cfg(test)]
    pub(crate) fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    // =========================================================================
    // Actors
    // =========================================================================

    /// Insert or refresh an actor record keyed by URI.
    ///
    /// Locality and private keys are never overwritten by a refresh.
    pub async fn upsert_actor(&self, actor: &Actor) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO actors (
                id, uri, username, domain, is_local, inbox_uri, shared_inbox_uri,
                public_key_id, public_key_pem, private_key_pem,
                manually_approves_followers, moved_to_uri, created_at, updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(uri) DO UPDATE SET
                username = excluded.username,
                inbox_uri = excluded.inbox_uri,
                shared_inbox_uri = excluded.shared_inbox_uri,
                public_key_id = excluded.public_key_id,
                public_key_pem = excluded.public_key_pem,
                manually_approves_followers = excluded.manually_approves_followers,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&actor.id)
        .bind(&actor.uri)
        .bind(&actor.username)
        .bind(&actor.domain)
        .bind(actor.is_local)
        .bind(&actor.inbox_uri)
        .bind(&actor.shared_inbox_uri)
        .bind(&actor.public_key_id)
        .bind(&actor.public_key_pem)
        .bind(&actor.private_key_pem)
        .bind(actor.manually_approves_followers)
        .bind(&actor.moved_to_uri)
        .bind(actor.created_at)
        .bind(actor.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Get actor by ActivityPub URI
    pub async fn get_actor_by_uri(&self, uri: &str) -> Result<Option<Actor>, AppError> {
        let actor = sqlx::query_as::<_, Actor>("SELECT * FROM actors WHERE uri = ?")
            .bind(uri)
            .fetch_optional(&self.pool)
            .await?;

        Ok(actor)
    }

    /// Get local actor by username
    pub async fn get_local_actor(&self, username: &str) -> Result<Option<Actor>, AppError> {
        let actor = sqlx::query_as::<_, Actor>(
            "SELECT * FROM actors WHERE is_local = 1 AND username = ? LIMIT 1",
        )
        .bind(username)
        .fetch_optional(&self.pool)
        .await?;

        Ok(actor)
    }

    /// Signing capability for a local actor.
    ///
    /// Returns `None` for remote actors and for actors without a private key.
    pub async fn local_signer(&self, actor_uri: &str) -> Result<Option<ActorSigner>, AppError> {
        match self.get_actor_by_uri(actor_uri).await? {
            Some(actor) if actor.is_local => ActorSigner::for_actor(&actor),
            _ => Ok(None),
        }
    }

    /// Record that an actor has moved to a new identity
    pub async fn set_actor_moved_to(&self, uri: &str, moved_to: &str) -> Result<bool, AppError> {
        let result =
            sqlx::query("UPDATE actors SET moved_to_uri = ?, updated_at = ? WHERE uri = ?")
                .bind(moved_to)
                .bind(Utc::now())
                .bind(uri)
                .execute(&self.pool)
                .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Remove everything a (deleted) remote actor left behind.
    pub async fn purge_actor_content(&self, actor_uri: &str) -> Result<(), AppError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM follows WHERE follower_uri = ? OR target_uri = ?")
            .bind(actor_uri)
            .bind(actor_uri)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM statuses WHERE actor_uri = ?")
            .bind(actor_uri)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM favourites WHERE actor_uri = ?")
            .bind(actor_uri)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM reblogs WHERE actor_uri = ?")
            .bind(actor_uri)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM actors WHERE uri = ? AND is_local = 0")
            .bind(actor_uri)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    // =========================================================================
    // Follows
    // =========================================================================

    /// Insert or update a follow keyed by (follower, target).
    ///
    /// Approval never regresses: a repeated Follow keeps an approved row approved.
    pub async fn upsert_follow(
        &self,
        activity_uri: Option<&str>,
        follower_uri: &str,
        target_uri: &str,
        approved: bool,
    ) -> Result<Follow, AppError> {
        let now = Utc::now();
        let follow = sqlx::query_as::<_, Follow>(
            r#"
            INSERT INTO follows (id, activity_uri, follower_uri, target_uri, approved, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(follower_uri, target_uri) DO UPDATE SET
                activity_uri = COALESCE(excluded.activity_uri, follows.activity_uri),
                approved = MAX(follows.approved, excluded.approved),
                updated_at = excluded.updated_at
            RETURNING *
            "#,
        )
        .bind(EntityId::new().0)
        .bind(activity_uri)
        .bind(follower_uri)
        .bind(target_uri)
        .bind(approved)
        .bind(now)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;

        Ok(follow)
    }

    /// Get follow by (follower, target)
    pub async fn get_follow(
        &self,
        follower_uri: &str,
        target_uri: &str,
    ) -> Result<Option<Follow>, AppError> {
        let follow = sqlx::query_as::<_, Follow>(
            "SELECT * FROM follows WHERE follower_uri = ? AND target_uri = ?",
        )
        .bind(follower_uri)
        .bind(target_uri)
        .fetch_optional(&self.pool)
        .await?;

        Ok(follow)
    }

    /// Get follow by Follow activity URI
    pub async fn get_follow_by_activity(
        &self,
        activity_uri: &str,
    ) -> Result<Option<Follow>, AppError> {
        let follow = sqlx::query_as::<_, Follow>("SELECT * FROM follows WHERE activity_uri = ?")
            .bind(activity_uri)
            .fetch_optional(&self.pool)
            .await?;

        Ok(follow)
    }

    /// Mark a follow as approved
    pub async fn approve_follow(
        &self,
        follower_uri: &str,
        target_uri: &str,
    ) -> Result<bool, AppError> {
        let result = sqlx::query(
            "UPDATE follows SET approved = 1, updated_at = ? WHERE follower_uri = ? AND target_uri = ?",
        )
        .bind(Utc::now())
        .bind(follower_uri)
        .bind(target_uri)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Delete a follow by (follower, target)
    pub async fn delete_follow(
        &self,
        follower_uri: &str,
        target_uri: &str,
    ) -> Result<bool, AppError> {
        let result = sqlx::query("DELETE FROM follows WHERE follower_uri = ? AND target_uri = ?")
            .bind(follower_uri)
            .bind(target_uri)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Approved followers of an actor, with their actor records.
    pub async fn get_follower_actors(&self, target_uri: &str) -> Result<Vec<Actor>, AppError> {
        let actors = sqlx::query_as::<_, Actor>(
            r#"
            SELECT a.* FROM actors a
            INNER JOIN follows f ON f.follower_uri = a.uri
            WHERE f.target_uri = ? AND f.approved = 1
            ORDER BY f.created_at
            "#,
        )
        .bind(target_uri)
        .fetch_all(&self.pool)
        .await?;

        Ok(actors)
    }

    /// Count follow rows targeting an actor (pending included)
    pub async fn count_follows_of(&self, target_uri: &str) -> Result<i64, AppError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM follows WHERE target_uri = ?")
            .bind(target_uri)
            .fetch_one(&self.pool)
            .await?;

        Ok(count)
    }

    // =========================================================================
    // Statuses
    // =========================================================================

    /// Insert a status, or refresh its content when the same actor re-sends it.
    pub async fn upsert_status(&self, status: &Status) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO statuses (
                id, uri, activity_uri, actor_uri, content, in_reply_to_uri,
                published_at, created_at, updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(uri) DO UPDATE SET
                content = excluded.content,
                updated_at = excluded.updated_at
            WHERE statuses.actor_uri = excluded.actor_uri
            "#,
        )
        .bind(&status.id)
        .bind(&status.uri)
        .bind(&status.activity_uri)
        .bind(&status.actor_uri)
        .bind(&status.content)
        .bind(&status.in_reply_to_uri)
        .bind(status.published_at)
        .bind(status.created_at)
        .bind(status.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Get status by URI
    pub async fn get_status_by_uri(&self, uri: &str) -> Result<Option<Status>, AppError> {
        let status = sqlx::query_as::<_, Status>("SELECT * FROM statuses WHERE uri = ?")
            .bind(uri)
            .fetch_optional(&self.pool)
            .await?;

        Ok(status)
    }

    /// Update content of a status owned by `actor_uri`
    pub async fn update_status_content(
        &self,
        uri: &str,
        actor_uri: &str,
        content: &str,
    ) -> Result<bool, AppError> {
        let result = sqlx::query(
            "UPDATE statuses SET content = ?, updated_at = ? WHERE uri = ? AND actor_uri = ?",
        )
        .bind(content)
        .bind(Utc::now())
        .bind(uri)
        .bind(actor_uri)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Delete a status owned by `actor_uri`
    pub async fn delete_status(&self, uri: &str, actor_uri: &str) -> Result<bool, AppError> {
        let result = sqlx::query("DELETE FROM statuses WHERE uri = ? AND actor_uri = ?")
            .bind(uri)
            .bind(actor_uri)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    // =========================================================================
    // Favourites and reblogs
    // =========================================================================

    /// Record a Like; repeated deliveries are ignored
    pub async fn insert_favourite(
        &self,
        activity_uri: &str,
        actor_uri: &str,
        status_uri: &str,
    ) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO favourites (id, activity_uri, actor_uri, status_uri, created_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(EntityId::new().0)
        .bind(activity_uri)
        .bind(actor_uri)
        .bind(status_uri)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Count favourites of a status
    pub async fn count_favourites(&self, status_uri: &str) -> Result<i64, AppError> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM favourites WHERE status_uri = ?")
                .bind(status_uri)
                .fetch_one(&self.pool)
                .await?;

        Ok(count)
    }

    /// Delete a favourite by activity URI, or by (actor, status) when given
    pub async fn delete_favourite(
        &self,
        activity_uri: &str,
        actor_uri: &str,
        status_uri: Option<&str>,
    ) -> Result<bool, AppError> {
        let result = sqlx::query(
            "DELETE FROM favourites WHERE actor_uri = ? AND (activity_uri = ? OR status_uri = ?)",
        )
        .bind(actor_uri)
        .bind(activity_uri)
        .bind(status_uri)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Record an Announce; repeated deliveries are ignored
    pub async fn insert_reblog(
        &self,
        activity_uri: &str,
        actor_uri: &str,
        status_uri: &str,
    ) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO reblogs (id, activity_uri, actor_uri, status_uri, created_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(EntityId::new().0)
        .bind(activity_uri)
        .bind(actor_uri)
        .bind(status_uri)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Get reblog by Announce activity URI
    pub async fn get_reblog_by_activity(
        &self,
        activity_uri: &str,
    ) -> Result<Option<Reblog>, AppError> {
        let reblog = sqlx::query_as::<_, Reblog>("SELECT * FROM reblogs WHERE activity_uri = ?")
            .bind(activity_uri)
            .fetch_optional(&self.pool)
            .await?;

        Ok(reblog)
    }

    /// Delete a reblog by activity URI, or by (actor, status) when given
    pub async fn delete_reblog(
        &self,
        activity_uri: &str,
        actor_uri: &str,
        status_uri: Option<&str>,
    ) -> Result<bool, AppError> {
        let result = sqlx::query(
            "DELETE FROM reblogs WHERE actor_uri = ? AND (activity_uri = ? OR status_uri = ?)",
        )
        .bind(actor_uri)
        .bind(activity_uri)
        .bind(status_uri)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    // =========================================================================
    // Processed activity ledger
    // =========================================================================

    /// Whether side effects for this activity id were already applied
    pub async fn is_activity_processed(&self, activity_uri: &str) -> Result<bool, AppError> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM processed_activities WHERE activity_uri = ? AND state = 'done'",
        )
        .bind(activity_uri)
        .fetch_one(&self.pool)
        .await?;

        Ok(count > 0)
    }

    /// Take an activity id for processing on behalf of `claimant`.
    ///
    /// The insert is the lock: of two jobs carrying the same id only one
    /// gets `Claimed`. A claimant retrying its own job keeps its claim.
    pub async fn claim_activity(
        &self,
        activity_uri: &str,
        activity_type: &str,
        claimant: &str,
    ) -> Result<ActivityClaim, AppError> {
        let inserted = sqlx::query(
            r#"
            INSERT INTO processed_activities (activity_uri, activity_type, state, claimed_by, processed_at)
            VALUES (?, ?, 'pending', ?, ?)
            ON CONFLICT(activity_uri) DO NOTHING
            "#,
        )
        .bind(activity_uri)
        .bind(activity_type)
        .bind(claimant)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        if inserted.rows_affected() > 0 {
            return Ok(ActivityClaim::Claimed);
        }

        let row: Option<(String, Option<String>)> = sqlx::query_as(
            "SELECT state, claimed_by FROM processed_activities WHERE activity_uri = ?",
        )
        .bind(activity_uri)
        .fetch_optional(&self.pool)
        .await?;

        Ok(match row {
            Some((state, _)) if state == "done" => ActivityClaim::Processed,
            Some((_, Some(owner))) if owner == claimant => ActivityClaim::Claimed,
            // Held by another job, or released between the two statements.
            _ => ActivityClaim::Busy,
        })
    }

    /// Record that side effects for this activity id were applied
    pub async fn mark_activity_processed(
        &self,
        activity_uri: &str,
        activity_type: &str,
    ) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO processed_activities (activity_uri, activity_type, state, claimed_by, processed_at)
            VALUES (?, ?, 'done', NULL, ?)
            ON CONFLICT(activity_uri) DO UPDATE
            SET state = 'done', claimed_by = NULL, processed_at = excluded.processed_at
            WHERE state = 'pending'
            "#,
        )
        .bind(activity_uri)
        .bind(activity_type)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Drop a pending claim so a later delivery of the id can be applied.
    pub async fn release_activity_claim(
        &self,
        activity_uri: &str,
        claimant: &str,
    ) -> Result<bool, AppError> {
        let result = sqlx::query(
            "DELETE FROM processed_activities WHERE activity_uri = ? AND state = 'pending' AND claimed_by = ?",
        )
        .bind(activity_uri)
        .bind(claimant)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    // =========================================================================
    // Domain blocks
    // =========================================================================

    /// Get all blocked domain names
    pub async fn get_blocked_domains(&self) -> Result<Vec<String>, AppError> {
        let domains = sqlx::query_scalar::<_, String>(
            "SELECT domain FROM domain_blocks ORDER BY created_at DESC",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(domains)
    }

    /// Get all domain blocks with details
    pub async fn get_all_domain_blocks(&self) -> Result<Vec<DomainBlock>, AppError> {
        let blocks = sqlx::query_as::<_, DomainBlock>(
            "SELECT * FROM domain_blocks ORDER BY created_at DESC",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(blocks)
    }

    /// Block a domain (stored lowercased). Blocking twice is a no-op.
    pub async fn block_domain(&self, domain: &str, reason: Option<&str>) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO domain_blocks (id, domain, reason, created_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(domain) DO NOTHING
            "#,
        )
        .bind(EntityId::new().0)
        .bind(domain.trim().to_ascii_lowercase())
        .bind(reason)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Unblock a domain
    pub async fn unblock_domain(&self, domain: &str) -> Result<bool, AppError> {
        let result = sqlx::query("DELETE FROM domain_blocks WHERE domain = ?")
            .bind(domain.trim().to_ascii_lowercase())
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    // =========================================================================
    // Job queue
    // =========================================================================

    /// Insert a pending job that is due immediately
    pub async fn insert_job(
        &self,
        queue: &str,
        payload: &str,
        max_attempts: u32,
    ) -> Result<String, AppError> {
        let id = EntityId::new().0;
        let now = Utc::now();
        sqlx::query(
            r#"
            INSERT INTO jobs (id, queue, payload, status, attempts, max_attempts, next_attempt_at, created_at, updated_at)
            VALUES (?, ?, ?, 'pending', 0, ?, ?, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(queue)
        .bind(payload)
        .bind(i64::from(max_attempts))
        .bind(now)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(id)
    }

    /// Atomically claim the oldest due job from any of `queues`.
    ///
    /// The claimed job is `running` and its attempt counter is incremented.
    pub async fn claim_next_job(
        &self,
        queues: &[&str],
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, AppError> {
        if queues.is_empty() {
            return Ok(None);
        }

        let mut builder = QueryBuilder::<Sqlite>::new(
            "UPDATE jobs SET status = 'running', attempts = attempts + 1, updated_at = ",
        );
        builder.push_bind(now);
        builder.push(
            " WHERE id = (SELECT id FROM jobs WHERE status = 'pending' AND next_attempt_at <= ",
        );
        builder.push_bind(now);
        builder.push(" AND queue IN (");
        let mut separated = builder.separated(", ");
        for queue in queues {
            separated.push_bind(*queue);
        }
        separated.push_unseparated(") ORDER BY next_attempt_at, created_at LIMIT 1) RETURNING *");

        let job = builder
            .build_query_as::<Job>()
            .fetch_optional(&self.pool)
            .await?;

        Ok(job)
    }

    /// Mark a job as done
    pub async fn complete_job(&self, id: &str) -> Result<(), AppError> {
        sqlx::query("UPDATE jobs SET status = 'done', updated_at = ? WHERE id = ?")
            .bind(Utc::now())
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Put a job back to pending until `next_attempt_at`
    pub async fn reschedule_job(
        &self,
        id: &str,
        next_attempt_at: DateTime<Utc>,
        error: &str,
    ) -> Result<(), AppError> {
        sqlx::query(
            r#"
            UPDATE jobs SET status = 'pending', next_attempt_at = ?, last_error = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(next_attempt_at)
        .bind(error)
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Replace the payload of a job
    pub async fn update_job_payload(&self, id: &str, payload: &str) -> Result<(), AppError> {
        sqlx::query("UPDATE jobs SET payload = ?, updated_at = ? WHERE id = ?")
            .bind(payload)
            .bind(Utc::now())
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Mark a job as permanently failed
    pub async fn fail_job(&self, id: &str, error: &str) -> Result<(), AppError> {
        sqlx::query("UPDATE jobs SET status = 'failed', last_error = ?, updated_at = ? WHERE id = ?")
            .bind(error)
            .bind(Utc::now())
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Return jobs abandoned in `running` (e.g. by a crash) to `pending`.
    pub async fn requeue_running_jobs(&self) -> Result<u64, AppError> {
        let result =
            sqlx::query("UPDATE jobs SET status = 'pending', updated_at = ? WHERE status = 'running'")
                .bind(Utc::now())
                .execute(&self.pool)
                .await?;

        Ok(result.rows_affected())
    }

    /// Get job by ID
    pub async fn get_job(&self, id: &str) -> Result<Option<Job>, AppError> {
        let job = sqlx::query_as::<_, Job>("SELECT * FROM jobs WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(job)
    }

    /// Count jobs in a queue, optionally restricted to one status
    pub async fn count_jobs(
        &self,
        queue: &str,
        status: Option<JobStatus>,
    ) -> Result<i64, AppError> {
        let count: i64 = match status {
            Some(status) => {
                sqlx::query_scalar("SELECT COUNT(*) FROM jobs WHERE queue = ? AND status = ?")
                    .bind(queue)
                    .bind(status)
                    .fetch_one(&self.pool)
                    .await?
            }
            None => {
                sqlx::query_scalar("SELECT COUNT(*) FROM jobs WHERE queue = ?")
                    .bind(queue)
                    .fetch_one(&self.pool)
                    .await?
            }
        };

        Ok(count)
    }

    // =========================================================================
    // Delivery audit trail
    // =========================================================================

    /// Insert a new delivery event
    pub async fn insert_delivery_event(&self, event: &DeliveryEvent) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO delivery_events (
                id, event_type, actor_uri, activity_uri, result, attempts,
                start_at, end_at, error_message, created_at, updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&event.id)
        .bind(&event.event_type)
        .bind(&event.actor_uri)
        .bind(&event.activity_uri)
        .bind(event.result)
        .bind(event.attempts)
        .bind(event.start_at)
        .bind(event.end_at)
        .bind(&event.error_message)
        .bind(event.created_at)
        .bind(event.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Move a waiting event to processing. Returns false if it already left `waiting`.
    pub async fn mark_delivery_event_processing(
        &self,
        id: &str,
        start_at: DateTime<Utc>,
    ) -> Result<bool, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE delivery_events SET result = 'processing', start_at = ?, updated_at = ?
            WHERE id = ? AND result = 'waiting'
            "#,
        )
        .bind(start_at)
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Store the terminal result of an event.
    ///
    /// Only non-terminal rows are updated, so a terminal result is never overwritten.
    pub async fn finish_delivery_event(
        &self,
        id: &str,
        result: DeliveryEventResult,
        attempts: i64,
        end_at: DateTime<Utc>,
        error_message: Option<&str>,
    ) -> Result<bool, AppError> {
        let outcome = sqlx::query(
            r#"
            UPDATE delivery_events
            SET result = ?, attempts = ?, end_at = ?, error_message = ?, updated_at = ?
            WHERE id = ? AND result IN ('waiting', 'processing')
            "#,
        )
        .bind(result)
        .bind(attempts)
        .bind(end_at)
        .bind(error_message)
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(outcome.rows_affected() > 0)
    }

    /// Append a terminal destination record to an event
    pub async fn insert_delivery_event_item(
        &self,
        item: &DeliveryEventItem,
    ) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO delivery_event_items (
                id, event_id, url, is_success, attempts, error_message, start_at, end_at, created_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&item.id)
        .bind(&item.event_id)
        .bind(&item.url)
        .bind(item.is_success)
        .bind(item.attempts)
        .bind(&item.error_message)
        .bind(item.start_at)
        .bind(item.end_at)
        .bind(item.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Success, failure and attempt totals over the items already stored for an event
    pub async fn delivery_event_item_totals(&self, event_id: &str) -> Result<DeliveryItemTotals, AppError> {
        let totals = sqlx::query_as::<_, DeliveryItemTotals>(
            r#"
            SELECT
                COALESCE(SUM(CASE WHEN is_success THEN 1 ELSE 0 END), 0) AS succeeded,
                COALESCE(SUM(CASE WHEN is_success THEN 0 ELSE 1 END), 0) AS failed,
                COALESCE(SUM(attempts), 0) AS attempts
            FROM delivery_event_items
            WHERE event_id = ?
            "#,
        )
        .bind(event_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(totals)
    }

    /// Ids of events still `waiting` or `processing`, oldest first
    pub async fn list_unfinished_delivery_event_ids(&self) -> Result<Vec<String>, AppError> {
        let ids = sqlx::query_scalar::<_, String>(
            r#"
            SELECT id FROM delivery_events
            WHERE result IN ('waiting', 'processing')
            ORDER BY created_at ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(ids)
    }

    /// Get delivery event by ID
    pub async fn get_delivery_event(&self, id: &str) -> Result<Option<DeliveryEvent>, AppError> {
        let event = sqlx::query_as::<_, DeliveryEvent>("SELECT * FROM delivery_events WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(event)
    }

    /// List delivery events with filters, returning the page and the total match count
    pub async fn list_delivery_events(
        &self,
        filter: &DeliveryEventFilter,
        page: Page,
    ) -> Result<(Vec<DeliveryEvent>, i64), AppError> {
        fn push_filters(builder: &mut QueryBuilder<'_, Sqlite>, filter: &DeliveryEventFilter) {
            builder.push(" WHERE 1 = 1");
            if let Some(event_type) = &filter.event_type {
                builder.push(" AND event_type = ");
                builder.push_bind(event_type.clone());
            }
            if let Some(result) = filter.result {
                builder.push(" AND result = ");
                builder.push_bind(result);
            }
        }

        let mut count_builder = QueryBuilder::<Sqlite>::new("SELECT COUNT(*) FROM delivery_events");
        push_filters(&mut count_builder, filter);
        let total: i64 = count_builder
            .build_query_scalar()
            .fetch_one(&self.pool)
            .await?;

        let mut builder = QueryBuilder::<Sqlite>::new("SELECT * FROM delivery_events");
        push_filters(&mut builder, filter);
        builder.push(" ORDER BY ");
        builder.push(filter.sort.column());
        builder.push(if filter.ascending { " ASC" } else { " DESC" });
        builder.push(", id");
        builder.push(if filter.ascending { " ASC" } else { " DESC" });
        builder.push(" LIMIT ");
        builder.push_bind(i64::from(page.size));
        builder.push(" OFFSET ");
        builder.push_bind(page.offset());

        let events = builder
            .build_query_as::<DeliveryEvent>()
            .fetch_all(&self.pool)
            .await?;

        Ok((events, total))
    }

    /// List the items of one event, optionally errors only
    pub async fn list_delivery_event_items(
        &self,
        event_id: &str,
        only_errors: bool,
        page: Page,
    ) -> Result<(Vec<DeliveryEventItem>, i64), AppError> {
        let error_clause = if only_errors { " AND is_success = 0" } else { "" };

        let total: i64 = sqlx::query_scalar(&format!(
            "SELECT COUNT(*) FROM delivery_event_items WHERE event_id = ?{}",
            error_clause
        ))
        .bind(event_id)
        .fetch_one(&self.pool)
        .await?;

        let items = sqlx::query_as::<_, DeliveryEventItem>(&format!(
            "SELECT * FROM delivery_event_items WHERE event_id = ?{} ORDER BY start_at, id LIMIT ? OFFSET ?",
            error_clause
        ))
        .bind(event_id)
        .bind(i64::from(page.size))
        .bind(page.offset())
        .fetch_all(&self.pool)
        .await?;

        Ok((items, total))
    }
}
