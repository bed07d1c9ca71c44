//! Shared fixtures for federation unit tests

use std::sync::{Arc, OnceLock};

use http::{HeaderMap, HeaderName, HeaderValue};
use serde_json::Value;
use tempfile::TempDir;

use super::activity::Activity;
use super::actors::RemoteActorDocument;
use super::delivery::InboxTransport;
use super::envelope::{Envelope, Ingress};
use super::signature::{ActorSigner, SignatureHeaders, generate_keypair, main_key_id};
use crate::data::{Actor, Database, EntityId};

pub async fn test_db() -> (TempDir, Arc<Database>) {
    let dir = TempDir::new().expect("temp dir");
    let db = Database::connect(&dir.path().join("test.db"))
        .await
        .expect("database");
    (dir, Arc::new(db))
}

/// (private, public) PEM pair, generated once per test binary
pub fn keypair() -> &'static (String, String) {
    static KEYS: OnceLock<(String, String)> = OnceLock::new();
    KEYS.get_or_init(|| generate_keypair(1024).expect("keypair"))
}

/// A second, unrelated keypair
pub fn other_keypair() -> &'static (String, String) {
    static KEYS: OnceLock<(String, String)> = OnceLock::new();
    KEYS.get_or_init(|| generate_keypair(1024).expect("keypair"))
}

pub fn signer_for(actor_uri: &str) -> ActorSigner {
    ActorSigner::from_pem(main_key_id(actor_uri), &keypair().0).expect("signer")
}

pub fn remote_document(actor_uri: &str, public_key_pem: &str) -> RemoteActorDocument {
    RemoteActorDocument {
        id: actor_uri.to_string(),
        preferred_username: None,
        inbox: format!("{}/inbox", actor_uri),
        shared_inbox: None,
        public_key_id: Some(main_key_id(actor_uri)),
        public_key_pem: Some(public_key_pem.to_string()),
        manually_approves_followers: false,
    }
}

pub fn remote_actor(actor_uri: &str, shared_inbox: Option<&str>) -> Actor {
    let mut document = remote_document(actor_uri, &keypair().1);
    document.shared_inbox = shared_inbox.map(str::to_string);
    document.into_actor()
}

pub fn local_actor(base: &str, username: &str, manually_approves: bool) -> Actor {
    let (private_key_pem, public_key_pem) = keypair().clone();
    let uri = format!("{}/actors/{}", base, username);
    let now = chrono::Utc::now();
    Actor {
        id: EntityId::new().0,
        username: username.to_string(),
        domain: url::Url::parse(base)
            .ok()
            .and_then(|u| u.host_str().map(str::to_string))
            .unwrap_or_default(),
        is_local: true,
        inbox_uri: format!("{}/inbox", uri),
        shared_inbox_uri: Some(format!("{}/shared/inbox", base)),
        public_key_id: Some(main_key_id(&uri)),
        public_key_pem: Some(public_key_pem),
        private_key_pem: Some(private_key_pem),
        manually_approves_followers: manually_approves,
        moved_to_uri: None,
        created_at: now,
        updated_at: now,
        uri,
    }
}

/// Envelope for `activity` signed by `signer` as a POST to `url`.
pub fn signed_envelope(signer: &ActorSigner, ingress: Ingress, url: &str, activity: Value) -> Envelope {
    let body = serde_json::to_vec(&activity).expect("serializes");
    let signed = signer.sign_request("POST", url, Some(&body)).expect("signed");
    let path = url::Url::parse(url).expect("url").path().to_string();

    let mut headers = HeaderMap::new();
    let mut set = |name: &'static str, value: &str| {
        headers.insert(
            HeaderName::from_static(name),
            HeaderValue::from_str(value).expect("header value"),
        );
    };
    set("host", &signed.host);
    set("date", &signed.date);
    set("digest", signed.digest.as_deref().unwrap_or_default());
    set("signature", &signed.signature);
    set("content-type", "application/activity+json");

    let parsed = Activity::from_slice(&body).expect("activity");
    Envelope::new(ingress, "POST", &path, &headers, &body, parsed).expect("envelope")
}

/// Transport replying from a per-inbox script of statuses; the last one repeats
/// and unscripted inboxes answer 202.
#[derive(Default)]
pub struct ScriptedTransport {
    replies: std::sync::Mutex<std::collections::HashMap<String, Vec<u16>>>,
    latency: std::sync::Mutex<std::collections::HashMap<String, std::time::Duration>>,
    pub calls: std::sync::Mutex<Vec<(String, SignatureHeaders, Vec<u8>)>>,
}

impl ScriptedTransport {
    /// Answer requests to `inbox` only after `latency`.
    pub fn slow(self, inbox: &str, latency: std::time::Duration) -> Self {
        self.latency
            .lock()
            .expect("lock")
            .insert(inbox.to_string(), latency);
        self
    }

    pub fn reply(self, inbox: &str, statuses: &[u16]) -> Self {
        self.replies
            .lock()
            .expect("lock")
            .insert(inbox.to_string(), statuses.to_vec());
        self
    }

    pub fn calls_to(&self, inbox: &str) -> usize {
        self.calls
            .lock()
            .expect("lock")
            .iter()
            .filter(|(url, _, _)| url == inbox)
            .count()
    }

    /// Activities posted so far, in order
    pub fn activities(&self) -> Vec<(String, Activity)> {
        self.calls
            .lock()
            .expect("lock")
            .iter()
            .map(|(url, _, body)| (url.clone(), Activity::from_slice(body).expect("activity")))
            .collect()
    }
}

#[async_trait::async_trait]
impl InboxTransport for ScriptedTransport {
    async fn post(
        &self,
        inbox_url: &str,
        headers: &SignatureHeaders,
        body: &[u8],
    ) -> Result<u16, crate::error::AppError> {
        self.calls
            .lock()
            .expect("lock")
            .push((inbox_url.to_string(), headers.clone(), body.to_vec()));
        let latency = self.latency.lock().expect("lock").get(inbox_url).copied();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        let mut replies = self.replies.lock().expect("lock");
        let script = replies.entry(inbox_url.to_string()).or_insert_with(|| vec![202]);
        let status = if script.len() > 1 { script.remove(0) } else { script[0] };
        Ok(status)
    }
}
