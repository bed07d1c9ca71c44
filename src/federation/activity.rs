//! Activity model
//!
//! Parses the ActivityPub vocabulary handled by this server into a typed
//! [`Activity`] while keeping the original JSON for re-delivery.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Public collection; never an actual delivery target
pub const PUBLIC_AUDIENCE: &str = "https://www.w3.org/ns/activitystreams#Public";

/// ActivityPub Activity types
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ActivityKind {
    Follow,
    Accept,
    Reject,
    Create,
    Update,
    Delete,
    Like,
    Announce,
    Undo,
    Move,
    /// Any type outside the handled vocabulary, kept verbatim
    Unsupported(String),
}

impl ActivityKind {
    /// Parse activity type from string
    pub fn parse(s: &str) -> Self {
        match s {
            "Follow" => Self::Follow,
            "Accept" => Self::Accept,
            "Reject" => Self::Reject,
            "Create" => Self::Create,
            "Update" => Self::Update,
            "Delete" => Self::Delete,
            "Like" => Self::Like,
            "Announce" => Self::Announce,
            "Undo" => Self::Undo,
            "Move" => Self::Move,
            other => Self::Unsupported(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Follow => "Follow",
            Self::Accept => "Accept",
            Self::Reject => "Reject",
            Self::Create => "Create",
            Self::Update => "Update",
            Self::Delete => "Delete",
            Self::Like => "Like",
            Self::Announce => "Announce",
            Self::Undo => "Undo",
            Self::Move => "Move",
            Self::Unsupported(other) => other,
        }
    }

    pub fn is_supported(&self) -> bool {
        !matches!(self, Self::Unsupported(_))
    }

    /// Types that are addressed to their object's owner when no audience is given.
    pub fn targets_object_owner(&self) -> bool {
        matches!(
            self,
            Self::Follow | Self::Accept | Self::Reject | Self::Undo | Self::Like
        )
    }
}

impl fmt::Display for ActivityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reasons an activity document is rejected as malformed
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ActivityParseError {
    #[error("activity body is not valid JSON: {0}")]
    InvalidJson(String),
    #[error("activity must be a JSON object")]
    NotAnObject,
    #[error("activity is missing `{0}`")]
    MissingField(&'static str),
}

/// A received or emitted activity.
///
/// Serializes back to the exact JSON document it was parsed from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Value", into = "Value")]
pub struct Activity {
    /// Globally unique id; the deduplication key
    pub id: String,
    pub kind: ActivityKind,
    /// Actor URIs, primary actor first
    pub actor: Vec<String>,
    pub object: Value,
    pub to: Vec<String>,
    pub cc: Vec<String>,
    raw: Value,
}

impl Activity {
    /// Parse a request body
    pub fn from_slice(body: &[u8]) -> Result<Self, ActivityParseError> {
        let value: Value = serde_json::from_slice(body)
            .map_err(|e| ActivityParseError::InvalidJson(e.to_string()))?;
        Self::try_from(value)
    }

    /// First listed actor
    pub fn primary_actor(&self) -> &str {
        // Construction guarantees at least one actor.
        self.actor.first().map(String::as_str).unwrap_or_default()
    }

    /// Id of the object, whether given inline or by reference
    pub fn object_id(&self) -> Option<&str> {
        value_id(&self.object)
    }

    /// The object when it is embedded rather than referenced
    pub fn embedded_object(&self) -> Option<&Value> {
        self.object.is_object().then_some(&self.object)
    }

    pub fn object_type(&self) -> Option<&str> {
        self.object.get("type").and_then(Value::as_str)
    }

    /// Target of a Delete, unwrapping Tombstones
    pub fn delete_target(&self) -> Option<&str> {
        if let Some(uri) = self.object.as_str() {
            return Some(uri);
        }

        let is_tombstone = self
            .object_type()
            .is_some_and(|value| value.eq_ignore_ascii_case("Tombstone"));

        if is_tombstone {
            return self
                .object
                .get("object")
                .and_then(Value::as_str)
                .or_else(|| self.object.get("id").and_then(Value::as_str));
        }

        self.object
            .get("id")
            .and_then(Value::as_str)
            .or_else(|| self.object.get("object").and_then(Value::as_str))
    }

    /// Every addressed recipient: `to`, `cc`, `bto`, `bcc` and `audience`, deduplicated in order.
    pub fn audience(&self) -> Vec<String> {
        let mut recipients: Vec<String> = Vec::new();
        let extra = ["bto", "bcc", "audience"]
            .iter()
            .flat_map(|field| self.raw.get(*field).map(string_list).unwrap_or_default());

        for recipient in self.to.iter().cloned().chain(self.cc.iter().cloned()).chain(extra) {
            if !recipients.contains(&recipient) {
                recipients.push(recipient);
            }
        }
        recipients
    }

    /// The original JSON document
    pub fn raw(&self) -> &Value {
        &self.raw
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(&self.raw)
    }
}

impl TryFrom<Value> for Activity {
    type Error = ActivityParseError;

    fn try_from(raw: Value) -> Result<Self, Self::Error> {
        if !raw.is_object() {
            return Err(ActivityParseError::NotAnObject);
        }

        let id = raw
            .get("id")
            .and_then(Value::as_str)
            .filter(|id| !id.is_empty())
            .ok_or(ActivityParseError::MissingField("id"))?
            .to_string();

        // `type` may be a list; the first entry names the activity.
        let kind = match raw.get("type") {
            Some(Value::String(kind)) => ActivityKind::parse(kind),
            Some(Value::Array(kinds)) => kinds
                .iter()
                .find_map(Value::as_str)
                .map(ActivityKind::parse)
                .ok_or(ActivityParseError::MissingField("type"))?,
            _ => return Err(ActivityParseError::MissingField("type")),
        };

        let actor = raw.get("actor").map(string_list).unwrap_or_default();
        if actor.is_empty() {
            return Err(ActivityParseError::MissingField("actor"));
        }

        let object = raw.get("object").cloned().unwrap_or(Value::Null);
        let to = raw.get("to").map(string_list).unwrap_or_default();
        let cc = raw.get("cc").map(string_list).unwrap_or_default();

        Ok(Self {
            id,
            kind,
            actor,
            object,
            to,
            cc,
            raw,
        })
    }
}

impl From<Activity> for Value {
    fn from(activity: Activity) -> Self {
        activity.raw
    }
}

/// Id of a JSON-LD node given either as a string or as an object with `id`
pub fn value_id(value: &Value) -> Option<&str> {
    value
        .as_str()
        .or_else(|| value.get("id").and_then(Value::as_str))
        .filter(|id| !id.is_empty())
}

/// Flatten a single id, an object with `id`, or a list of either into URIs
fn string_list(value: &Value) -> Vec<String> {
    match value {
        Value::Array(items) => items
            .iter()
            .filter_map(value_id)
            .map(str::to_string)
            .collect(),
        other => value_id(other).map(str::to_string).into_iter().collect(),
    }
}

/// Sanitize HTML received from remote servers before storing it.
pub fn sanitize_remote_html(content: &str) -> String {
    ammonia::clean(content)
}

/// Build ActivityPub activity JSON
pub mod builder {
    use serde_json::Value;

    /// Build a Follow activity
    ///
    /// # Arguments
    /// * `id` - Activity ID (unique URI)
    /// * `actor` - Actor URI (follower)
    /// * `object` - Object URI (followee)
    pub fn follow(id: &str, actor: &str, object: &str) -> Value {
        serde_json::json!({
            "@context": "https://www.w3.org/ns/activitystreams",
            "type": "Follow",
            "id": id,
            "actor": actor,
            "object": object
        })
    }

    /// Build an Accept activity
    ///
    /// # Arguments
    /// * `id` - Activity ID (unique URI)
    /// * `actor` - Actor URI (accepter)
    /// * `object` - Original activity being accepted (usually a Follow)
    pub fn accept(id: &str, actor: &str, object: Value) -> Value {
        serde_json::json!({
            "@context": "https://www.w3.org/ns/activitystreams",
            "type": "Accept",
            "id": id,
            "actor": actor,
            "object": object
        })
    }

    /// Build a Reject activity.
    pub fn reject(id: &str, actor: &str, object: Value) -> Value {
        serde_json::json!({
            "@context": "https://www.w3.org/ns/activitystreams",
            "type": "Reject",
            "id": id,
            "actor": actor,
            "object": object
        })
    }

    /// Build a Create activity
    ///
    /// # Arguments
    /// * `id` - Activity ID (unique URI)
    /// * `actor` - Actor URI (creator)
    /// * `object` - Object being created (usually a Note)
    /// * `to` - Primary recipients (public timeline, followers, etc.)
    /// * `cc` - CC recipients (mentions, etc.)
    pub fn create(id: &str, actor: &str, object: Value, to: Vec<&str>, cc: Vec<&str>) -> Value {
        serde_json::json!({
            "@context": "https://www.w3.org/ns/activitystreams",
            "type": "Create",
            "id": id,
            "actor": actor,
            "object": object,
            "to": to,
            "cc": cc,
            "published": chrono::Utc::now().to_rfc3339()
        })
    }

    /// Build an Update activity
    pub fn update(id: &str, actor: &str, object: Value, to: Vec<&str>, cc: Vec<&str>) -> Value {
        serde_json::json!({
            "@context": "https://www.w3.org/ns/activitystreams",
            "type": "Update",
            "id": id,
            "actor": actor,
            "object": object,
            "to": to,
            "cc": cc
        })
    }

    /// Build a Delete activity
    ///
    /// # Arguments
    /// * `id` - Activity ID (unique URI)
    /// * `actor` - Actor URI (deleter)
    /// * `object` - Object URI being deleted
    pub fn delete(id: &str, actor: &str, object: &str, to: Vec<&str>, cc: Vec<&str>) -> Value {
        serde_json::json!({
            "@context": "https://www.w3.org/ns/activitystreams",
            "type": "Delete",
            "id": id,
            "actor": actor,
            "object": {
                "type": "Tombstone",
                "id": object
            },
            "to": to,
            "cc": cc
        })
    }

    /// Build a Like activity
    pub fn like(id: &str, actor: &str, object: &str) -> Value {
        serde_json::json!({
            "@context": "https://www.w3.org/ns/activitystreams",
            "type": "Like",
            "id": id,
            "actor": actor,
            "object": object
        })
    }

    /// Build an Announce activity (boost/reblog)
    pub fn announce(id: &str, actor: &str, object: &str, to: Vec<&str>, cc: Vec<&str>) -> Value {
        serde_json::json!({
            "@context": "https://www.w3.org/ns/activitystreams",
            "type": "Announce",
            "id": id,
            "actor": actor,
            "object": object,
            "to": to,
            "cc": cc,
            "published": chrono::Utc::now().to_rfc3339()
        })
    }

    /// Build an Undo activity
    ///
    /// # Arguments
    /// * `id` - Activity ID (unique URI)
    /// * `actor` - Actor URI (undoer)
    /// * `object` - Original activity being undone
    pub fn undo(id: &str, actor: &str, object: Value) -> Value {
        serde_json::json!({
            "@context": "https://www.w3.org/ns/activitystreams",
            "type": "Undo",
            "id": id,
            "actor": actor,
            "object": object
        })
    }

    /// Build a Move activity; `actor` and `object` are the old identity.
    pub fn move_to(id: &str, actor: &str, target: &str) -> Value {
        serde_json::json!({
            "@context": "https://www.w3.org/ns/activitystreams",
            "type": "Move",
            "id": id,
            "actor": actor,
            "object": actor,
            "target": target
        })
    }

    /// Build a Note object
    pub fn note(id: &str, attributed_to: &str, content: &str, to: Vec<&str>, cc: Vec<&str>) -> Value {
        serde_json::json!({
            "type": "Note",
            "id": id,
            "attributedTo": attributed_to,
            "content": content,
            "published": chrono::Utc::now().to_rfc3339(),
            "to": to,
            "cc": cc,
            "sensitive": false
        })
    }
}
