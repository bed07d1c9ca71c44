//! Inbound envelope
//!
//! A received request together with its parsed activity. Envelopes are
//! serialized into queue jobs, so everything needed to verify the request
//! later travels with them.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::activity::{Activity, ActivityParseError};
use super::queue::queues;
use super::signature::{SignedRequest, generate_digest};

/// Where a request entered the server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Ingress {
    ActorInbox { username: String },
    SharedInbox,
    ActorOutbox { username: String },
}

impl Ingress {
    /// Queue that processes envelopes from this ingress
    pub fn queue(&self) -> &'static str {
        match self {
            Self::ActorInbox { .. } => queues::USER_INBOX,
            Self::SharedInbox => queues::SHARED_INBOX,
            Self::ActorOutbox { .. } => queues::USER_OUTBOX,
        }
    }

    /// Metric label
    pub fn label(&self) -> &'static str {
        match self {
            Self::ActorInbox { .. } => "actor_inbox",
            Self::SharedInbox => "shared_inbox",
            Self::ActorOutbox { .. } => "actor_outbox",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub ingress: Ingress,
    pub method: String,
    /// Request path including the query string
    pub path: String,
    /// Lowercased header names; repeated headers are joined with ", "
    pub headers: BTreeMap<String, String>,
    /// Raw request body
    pub body: String,
    /// `SHA-256=...` digest of the raw body
    pub digest: String,
    pub activity: Activity,
    pub received_at: DateTime<Utc>,
    /// Set once the signature has been verified, so retries skip verification
    #[serde(default)]
    pub authenticated_actor: Option<String>,
}

impl Envelope {
    pub fn new(
        ingress: Ingress,
        method: &str,
        path: &str,
        headers: &http::HeaderMap,
        body: &[u8],
        activity: Activity,
    ) -> Result<Self, ActivityParseError> {
        let body_text = String::from_utf8(body.to_vec())
            .map_err(|e| ActivityParseError::InvalidJson(e.to_string()))?;

        Ok(Self {
            ingress,
            method: method.to_string(),
            path: path.to_string(),
            headers: lowercase_headers(headers),
            body: body_text,
            digest: generate_digest(body),
            activity,
            received_at: Utc::now(),
            authenticated_actor: None,
        })
    }

    /// View used by signature verification
    pub fn signed_request(&self) -> SignedRequest<'_> {
        SignedRequest {
            method: &self.method,
            path: &self.path,
            headers: &self.headers,
            body: Some(self.body.as_bytes()),
        }
    }

    pub fn has_signature(&self) -> bool {
        self.headers.contains_key("signature")
    }
}

fn lowercase_headers(headers: &http::HeaderMap) -> BTreeMap<String, String> {
    let mut map: BTreeMap<String, String> = BTreeMap::new();
    for (name, value) in headers {
        let Ok(value) = value.to_str() else {
            continue;
        };
        map.entry(name.as_str().to_ascii_lowercase())
            .and_modify(|existing| {
                existing.push_str(", ");
                existing.push_str(value);
            })
            .or_insert_with(|| value.to_string());
    }
    map
}
