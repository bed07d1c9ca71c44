//! Data models
//!
//! Rust structs representing database entities.
//! All models use ULID for IDs and chrono for timestamps.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// =============================================================================
// ID Types
// =============================================================================

/// Entity ID wrapper (ULID format, 26 characters)
///
/// Example: "01ARZ3NDEKTSV4RRFFQ69G5FAV"
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(pub String);

impl EntityId {
    /// Generate a new ULID
    pub fn new() -> Self {
        Self(ulid::Ulid::new().to_string())
    }
}

impl Default for EntityId {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Actors
// =============================================================================

/// A federated identity, local or remote
///
/// Local actors carry a private key; remote actors never do.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Actor {
    pub id: String,
    /// ActivityPub actor URI (globally unique)
    pub uri: String,
    pub username: String,
    pub domain: String,
    pub is_local: bool,
    pub inbox_uri: String,
    /// Shared inbox advertised under `endpoints.sharedInbox`
    pub shared_inbox_uri: Option<String>,
    pub public_key_id: Option<String>,
    /// RSA public key (PEM format)
    pub public_key_pem: Option<String>,
    /// RSA private key (PEM format), local actors only
    #[serde(skip_serializing)]
    pub private_key_pem: Option<String>,
    pub manually_approves_followers: bool,
    pub moved_to_uri: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Actor {
    /// Inbox that deliveries for this actor should target.
    ///
    /// Shared inboxes win so that one POST serves every recipient on a host.
    pub fn delivery_inbox(&self) -> &str {
        self.shared_inbox_uri
            .as_deref()
            .filter(|uri| !uri.is_empty())
            .unwrap_or(&self.inbox_uri)
    }

    /// Followers collection URI of this actor.
    pub fn followers_uri(&self) -> String {
        format!("{}/followers", self.uri)
    }
}

// =============================================================================
// Local state mutated by activity handlers
// =============================================================================

/// Follow relationship between two actors
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Follow {
    pub id: String,
    /// ActivityPub Follow activity URI
    pub activity_uri: Option<String>,
    pub follower_uri: String,
    pub target_uri: String,
    /// false while a follow request awaits approval
    pub approved: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A status created through a Create activity
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Status {
    pub id: String,
    /// Object URI (globally unique)
    pub uri: String,
    pub activity_uri: Option<String>,
    pub actor_uri: String,
    /// Sanitized HTML content
    pub content: String,
    pub in_reply_to_uri: Option<String>,
    pub published_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Announce (boost) of a status
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Reblog {
    pub id: String,
    pub activity_uri: String,
    pub actor_uri: String,
    pub status_uri: String,
    pub created_at: DateTime<Utc>,
}

/// Blocked domain
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct DomainBlock {
    pub id: String,
    pub domain: String,
    pub reason: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Result of trying to take an activity id for processing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivityClaim {
    /// The caller holds the id and may apply it
    Claimed,
    /// Side effects were already applied
    Processed,
    /// Another job holds the id
    Busy,
}

// =============================================================================
// Job queue
// =============================================================================

/// Lifecycle of a queued job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Done,
    Failed,
}

/// A durable job row
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Job {
    pub id: String,
    pub queue: String,
    /// JSON payload (an envelope or a follow response)
    pub payload: String,
    pub status: JobStatus,
    /// Attempts started so far, including the current one
    pub attempts: i64,
    pub max_attempts: i64,
    pub next_attempt_at: DateTime<Utc>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// =============================================================================
// Delivery audit trail
// =============================================================================

/// Result of a delivery event
///
/// ```text
/// waiting -> processing -> finished | finishedWithErrors | failed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "camelCase")]
#[serde(rename_all = "camelCase")]
pub enum DeliveryEventResult {
    Waiting,
    Processing,
    Finished,
    FinishedWithErrors,
    Failed,
}

impl DeliveryEventResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::Processing => "processing",
            Self::Finished => "finished",
            Self::FinishedWithErrors => "finishedWithErrors",
            Self::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "waiting" => Some(Self::Waiting),
            "processing" => Some(Self::Processing),
            "finished" => Some(Self::Finished),
            "finishedWithErrors" => Some(Self::FinishedWithErrors),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Finished | Self::FinishedWithErrors | Self::Failed
        )
    }

    /// Whether the state machine allows moving from `self` to `next`.
    pub fn can_transition_to(&self, next: Self) -> bool {
        match (self, next) {
            (Self::Waiting, Self::Processing) => true,
            (Self::Waiting | Self::Processing, next) => next.is_terminal(),
            _ => false,
        }
    }

    /// Terminal result for a set of terminal items.
    pub fn conclude(succeeded: usize, failed: usize) -> Self {
        match (succeeded, failed) {
            (_, 0) => Self::Finished,
            (0, _) => Self::Failed,
            _ => Self::FinishedWithErrors,
        }
    }
}

/// One fan-out operation
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryEvent {
    pub id: String,
    /// Activity type being delivered (Create, Accept, ...)
    #[serde(rename = "type")]
    pub event_type: String,
    /// Local actor that owns the delivery
    pub actor_uri: String,
    pub activity_uri: String,
    pub result: DeliveryEventResult,
    /// HTTP attempts across all destinations
    pub attempts: i64,
    pub start_at: Option<DateTime<Utc>>,
    pub end_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One destination inbox within a delivery event
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryEventItem {
    pub id: String,
    pub event_id: String,
    pub url: String,
    pub is_success: bool,
    pub attempts: i64,
    pub error_message: Option<String>,
    pub start_at: DateTime<Utc>,
    pub end_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::DeliveryEventResult;

    #[test]
    fn conclude_is_finished_only_when_every_item_succeeded() {
        assert_eq!(
            DeliveryEventResult::conclude(3, 0),
            DeliveryEventResult::Finished
        );
        assert_eq!(
            DeliveryEventResult::conclude(0, 2),
            DeliveryEventResult::Failed
        );
        assert_eq!(
            DeliveryEventResult::conclude(1, 1),
            DeliveryEventResult::FinishedWithErrors
        );
    }

    #[test]
    fn terminal_results_never_transition() {
        for terminal in [
            DeliveryEventResult::Finished,
            DeliveryEventResult::FinishedWithErrors,
            DeliveryEventResult::Failed,
        ] {
            assert!(terminal.is_terminal());
            assert!(!terminal.can_transition_to(DeliveryEventResult::Processing));
            assert!(!terminal.can_transition_to(DeliveryEventResult::Waiting));
            assert!(!terminal.can_transition_to(DeliveryEventResult::Failed));
        }
    }

    #[test]
    fn waiting_moves_forward_only() {
        let waiting = DeliveryEventResult::Waiting;
        assert!(waiting.can_transition_to(DeliveryEventResult::Processing));
        assert!(waiting.can_transition_to(DeliveryEventResult::Failed));
        assert!(!DeliveryEventResult::Processing.can_transition_to(DeliveryEventResult::Waiting));
    }

    #[test]
    fn result_names_round_trip_through_parse() {
        assert_eq!(
            DeliveryEventResult::parse("finishedWithErrors"),
            Some(DeliveryEventResult::FinishedWithErrors)
        );
        assert_eq!(DeliveryEventResult::parse("unknown"), None);
    }
}

/// Totals over the persisted items of one delivery event
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, sqlx::FromRow)]
pub struct DeliveryItemTotals {
    pub succeeded: i64,
    pub failed: i64,
    pub attempts: i64,
}
