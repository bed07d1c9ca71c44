//! Remote actor resolution
//!
//! Fetches actor documents from remote servers and keeps the `actors`
//! table in sync with them.

use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;

use crate::data::{Actor, Database, EntityId};
use crate::error::AppError;

/// The parts of a remote actor document this server relies on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteActorDocument {
    pub id: String,
    pub preferred_username: Option<String>,
    pub inbox: String,
    pub shared_inbox: Option<String>,
    pub public_key_id: Option<String>,
    pub public_key_pem: Option<String>,
    pub manually_approves_followers: bool,
}

impl RemoteActorDocument {
    /// Extract from an ActivityPub actor JSON document.
    pub fn from_json(actor: &Value) -> Result<Self, AppError> {
        let field = |name: &str| actor.get(name).and_then(Value::as_str).map(str::to_string);

        let id = field("id")
            .ok_or_else(|| AppError::Federation("Missing id in actor".to_string()))?;
        let inbox = field("inbox")
            .ok_or_else(|| AppError::Federation("Missing inbox in actor".to_string()))?;
        let public_key = actor.get("publicKey");

        Ok(Self {
            id,
            preferred_username: field("preferredUsername"),
            inbox,
            shared_inbox: actor
                .pointer("/endpoints/sharedInbox")
                .and_then(Value::as_str)
                .map(str::to_string),
            public_key_id: public_key
                .and_then(|key| key.get("id"))
                .and_then(Value::as_str)
                .map(str::to_string),
            public_key_pem: public_key
                .and_then(|key| key.get("publicKeyPem"))
                .and_then(Value::as_str)
                .map(str::to_string),
            manually_approves_followers: actor
                .get("manuallyApprovesFollowers")
                .and_then(Value::as_bool)
                .unwrap_or(false),
        })
    }

    /// Row for the `actors` table
    pub fn into_actor(self) -> Actor {
        let now = Utc::now();
        let parsed = url::Url::parse(&self.id).ok();
        let domain = parsed
            .as_ref()
            .and_then(|url| {
                url.host_str().map(|host| match url.port() {
                    Some(port) => format!("{}:{}", host, port),
                    None => host.to_string(),
                })
            })
            .unwrap_or_default()
            .to_ascii_lowercase();
        let username = self
            .preferred_username
            .clone()
            .or_else(|| {
                parsed
                    .as_ref()
                    .and_then(|url| url.path_segments())
                    .and_then(|segments| segments.rev().find(|s| !s.is_empty()))
                    .map(str::to_string)
            })
            .unwrap_or_default();

        Actor {
            id: EntityId::new().0,
            uri: self.id,
            username,
            domain,
            is_local: false,
            inbox_uri: self.inbox,
            shared_inbox_uri: self.shared_inbox,
            public_key_id: self.public_key_id,
            public_key_pem: self.public_key_pem,
            private_key_pem: None,
            manually_approves_followers: self.manually_approves_followers,
            moved_to_uri: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Source of remote actor documents
///
/// Errors follow [`AppError::is_transient`]: network failures and remote 5xx
/// are transient, everything else is permanent.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ActorFetcher: Send + Sync {
    async fn fetch_actor(&self, actor_uri: &str) -> Result<RemoteActorDocument, AppError>;
}

fn is_disallowed_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_multicast()
                || v4.is_unspecified()
        }
        IpAddr::V6(v6) => {
            v6.is_loopback()
                || v6.is_unique_local()
                || v6.is_unicast_link_local()
                || v6.is_multicast()
                || v6.is_unspecified()
        }
    }
}

fn is_disallowed_host(host: &str) -> bool {
    let normalized = host
        .trim_start_matches('[')
        .trim_end_matches(']')
        .trim_end_matches('.')
        .to_ascii_lowercase();
    if normalized == "localhost" || normalized.ends_with(".localhost") {
        return true;
    }

    normalized
        .parse::<IpAddr>()
        .map(is_disallowed_ip)
        .unwrap_or(false)
}

async fn validate_resolved_host_ips(host: &str, port: u16) -> Result<(), AppError> {
    let normalized = host.trim_end_matches('.').to_ascii_lowercase();

    let mut resolved_any = false;
    let lookup = tokio::net::lookup_host((normalized.as_str(), port))
        .await
        .map_err(|e| AppError::Unavailable(format!("Failed to resolve actor host: {}", e)))?;

    for addr in lookup {
        resolved_any = true;
        if is_disallowed_ip(addr.ip()) {
            return Err(AppError::Forbidden);
        }
    }

    if !resolved_any {
        return Err(AppError::Federation(
            "No DNS records for actor host".to_string(),
        ));
    }

    Ok(())
}

/// Extract and validate remote actor domain from an actor URL or key ID URL.
///
/// This rejects non-HTTP(S) URLs and obvious local/private hosts.
pub fn extract_actor_domain(actor_or_key_id: &str) -> Result<String, AppError> {
    let actor_url = actor_or_key_id.split('#').next().unwrap_or(actor_or_key_id);
    let parsed = url::Url::parse(actor_url)
        .map_err(|e| AppError::Validation(format!("Invalid actor URL: {}", e)))?;

    match parsed.scheme() {
        "http" | "https" => {}
        scheme => {
            return Err(AppError::Validation(format!(
                "Unsupported actor URL scheme: {}",
                scheme
            )));
        }
    }

    let host = parsed
        .host_str()
        .ok_or_else(|| AppError::Validation("Missing host in actor URL".to_string()))?
        .to_ascii_lowercase();

    if is_disallowed_host(&host) {
        return Err(AppError::Forbidden);
    }

    Ok(host)
}

/// Fetches actor documents over HTTP with an SSRF guard.
pub struct HttpActorFetcher {
    http_client: reqwest::Client,
}

impl HttpActorFetcher {
    pub fn new(http_client: reqwest::Client) -> Self {
        Self { http_client }
    }
}

#[async_trait]
impl ActorFetcher for HttpActorFetcher {
    async fn fetch_actor(&self, actor_uri: &str) -> Result<RemoteActorDocument, AppError> {
        // Validate actor URL/domain and extract actor document URL.
        let actor_domain = extract_actor_domain(actor_uri)?;
        let actor_url = actor_uri.split('#').next().unwrap_or(actor_uri);
        let parsed_actor_url = url::Url::parse(actor_url)
            .map_err(|e| AppError::Validation(format!("Invalid actor URL: {}", e)))?;
        let actor_port = parsed_actor_url
            .port_or_known_default()
            .ok_or_else(|| AppError::Validation("Missing port in actor URL".to_string()))?;

        // Resolve DNS before fetching and reject local/private destinations.
        validate_resolved_host_ips(&actor_domain, actor_port).await?;

        let response = self
            .http_client
            .get(actor_url)
            .header("Accept", "application/activity+json")
            .send()
            .await?;

        let status = response.status();
        if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(AppError::Unavailable(format!(
                "Failed to fetch actor {}: HTTP {}",
                actor_url, status
            )));
        }
        if !status.is_success() {
            return Err(AppError::Federation(format!(
                "Failed to fetch actor {}: HTTP {}",
                actor_url, status
            )));
        }

        let actor: Value = response
            .json()
            .await
            .map_err(|e| AppError::Federation(format!("Failed to parse actor: {}", e)))?;

        let document = RemoteActorDocument::from_json(&actor)?;
        if document.id != actor_url {
            return Err(AppError::Federation(format!(
                "Actor document id {} does not match {}",
                document.id, actor_url
            )));
        }

        Ok(document)
    }
}

/// Actor lookup backed by the database, falling back to remote fetches.
pub struct ActorDirectory {
    db: Arc<Database>,
    fetcher: Arc<dyn ActorFetcher>,
}

impl ActorDirectory {
    pub fn new(db: Arc<Database>, fetcher: Arc<dyn ActorFetcher>) -> Self {
        Self { db, fetcher }
    }

    /// Stored actor, fetching and storing it when unknown.
    pub async fn resolve(&self, actor_uri: &str) -> Result<Actor, AppError> {
        Ok(self.lookup(actor_uri).await?.0)
    }

    /// Like [`Self::resolve`], also reporting whether the actor was just fetched.
    async fn lookup(&self, actor_uri: &str) -> Result<(Actor, bool), AppError> {
        if let Some(actor) = self.db.get_actor_by_uri(actor_uri).await? {
            return Ok((actor, false));
        }
        Ok((self.fetch_and_store(actor_uri).await?, true))
    }

    /// Re-fetch a remote actor. Local actors are returned as stored.
    pub async fn refresh(&self, actor_uri: &str) -> Result<Actor, AppError> {
        if let Some(actor) = self.db.get_actor_by_uri(actor_uri).await? {
            if actor.is_local {
                return Ok(actor);
            }
        }
        self.fetch_and_store(actor_uri).await
    }

    async fn fetch_and_store(&self, actor_uri: &str) -> Result<Actor, AppError> {
        tracing::debug!(actor = %actor_uri, "Fetching remote actor");
        let document = self.fetcher.fetch_actor(actor_uri).await?;
        let actor = document.into_actor();
        self.db.upsert_actor(&actor).await?;

        // Re-read so the row id of an existing actor is returned.
        self.db
            .get_actor_by_uri(&actor.uri)
            .await?
            .ok_or(AppError::NotFound)
    }

    /// Public key advertised for `key_id`.
    ///
    /// With `refresh`, remote actors are re-fetched instead of read from storage.
    pub async fn public_key(&self, key_id: &str, refresh: bool) -> Result<KeyMaterial, AppError> {
        let actor_uri = key_id.split('#').next().unwrap_or(key_id);
        let (actor, fetched) = if refresh {
            let actor = self.refresh(actor_uri).await?;
            let fetched = !actor.is_local;
            (actor, fetched)
        } else {
            self.lookup(actor_uri).await?
        };

        // If a key fragment is provided, ensure actor advertises exactly that key id.
        if key_id.contains('#') {
            if let Some(advertised) = actor.public_key_id.as_deref() {
                if advertised != key_id {
                    return Err(AppError::Federation(format!(
                        "Signature keyId {} does not match actor public key id {}",
                        key_id, advertised
                    )));
                }
            }
        }

        let pem = actor
            .public_key_pem
            .ok_or_else(|| AppError::Federation(format!("Actor {} has no public key", actor.uri)))?;
        Ok(KeyMaterial { pem, fetched })
    }
}

/// A public key and where it came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyMaterial {
    pub pem: String,
    /// True when the key was fetched from its owner just now
    pub fetched: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    async fn test_db() -> (TempDir, Arc<Database>) {
        let dir = TempDir::new().expect("temp dir");
        let db = Database::connect(&dir.path().join("test.db"))
            .await
            .expect("database");
        (dir, Arc::new(db))
    }

    fn document(uri: &str, pem: &str) -> RemoteActorDocument {
        RemoteActorDocument {
            id: uri.to_string(),
            preferred_username: Some("alice".to_string()),
            inbox: format!("{}/inbox", uri),
            shared_inbox: Some("https://remote.example/inbox".to_string()),
            public_key_id: Some(format!("{}#main-key", uri)),
            public_key_pem: Some(pem.to_string()),
            manually_approves_followers: false,
        }
    }

    #[test]
    fn actor_document_reads_shared_inbox_and_key() {
        let parsed = RemoteActorDocument::from_json(&json!({
            "id": "https://remote.example:8443/users/alice",
            "type": "Person",
            "preferredUsername": "alice",
            "inbox": "https://remote.example:8443/users/alice/inbox",
            "endpoints": {"sharedInbox": "https://remote.example:8443/inbox"},
            "manuallyApprovesFollowers": true,
            "publicKey": {
                "id": "https://remote.example:8443/users/alice#main-key",
                "publicKeyPem": "PEM"
            }
        }))
        .expect("parses");

        assert_eq!(parsed.shared_inbox.as_deref(), Some("https://remote.example:8443/inbox"));
        assert!(parsed.manually_approves_followers);

        let actor = parsed.into_actor();
        assert_eq!(actor.domain, "remote.example:8443");
        assert_eq!(actor.delivery_inbox(), "https://remote.example:8443/inbox");
        assert!(!actor.is_local);
    }

    #[test]
    fn actor_document_requires_inbox() {
        assert!(RemoteActorDocument::from_json(&json!({"id": "https://a.example/u"})).is_err());
    }

    #[test]
    fn extract_actor_domain_rejects_localhost() {
        match extract_actor_domain("https://localhost/users/alice#main-key") {
            Err(AppError::Forbidden) => {}
            other => panic!("expected forbidden for localhost, got: {other:?}"),
        }
    }

    #[test]
    fn extract_actor_domain_rejects_private_ip() {
        match extract_actor_domain("http://192.168.1.10/users/alice#main-key") {
            Err(AppError::Forbidden) => {}
            other => panic!("expected forbidden for private ip, got: {other:?}"),
        }
    }

    #[test]
    fn extract_actor_domain_rejects_non_http_scheme() {
        assert!(matches!(
            extract_actor_domain("ftp://example.com/users/alice"),
            Err(AppError::Validation(_))
        ));
    }

    #[test]
    fn extract_actor_domain_accepts_public_host() {
        let domain = extract_actor_domain("https://example.com/users/alice#main-key")
            .expect("public host should be accepted");
        assert_eq!(domain, "example.com");
    }

    #[tokio::test]
    async fn validate_resolved_host_ips_rejects_loopback() {
        match validate_resolved_host_ips("127.0.0.1", 80).await {
            Err(AppError::Forbidden) => {}
            other => panic!("expected forbidden for loopback resolution, got: {other:?}"),
        }
    }

    #[tokio::test]
    async fn http_fetcher_refuses_private_targets_before_any_request() {
        let fetcher = HttpActorFetcher::new(reqwest::Client::new());
        assert!(matches!(
            fetcher.fetch_actor("http://10.0.0.1/users/alice").await,
            Err(AppError::Forbidden)
        ));
    }

    #[tokio::test]
    async fn directory_fetches_once_then_serves_from_storage() {
        let (_dir, db) = test_db().await;
        let uri = "https://remote.example/users/alice";

        let mut fetcher = MockActorFetcher::new();
        fetcher
            .expect_fetch_actor()
            .times(1)
            .returning(move |_| Ok(document(uri, "PEM-1")));

        let directory = ActorDirectory::new(db.clone(), Arc::new(fetcher));
        let first = directory.resolve(uri).await.expect("resolved");
        let second = directory.resolve(uri).await.expect("resolved from db");

        assert_eq!(first.id, second.id);
        assert_eq!(
            directory
                .public_key("https://remote.example/users/alice#main-key", false)
                .await
                .expect("key")
                .pem,
            "PEM-1"
        );
    }

    #[tokio::test]
    async fn directory_refresh_replaces_rotated_key() {
        let (_dir, db) = test_db().await;
        let uri = "https://remote.example/users/alice";

        let mut fetcher = MockActorFetcher::new();
        let mut seq = mockall::Sequence::new();
        fetcher
            .expect_fetch_actor()
            .times(1)
            .in_sequence(&mut seq)
            .returning(move |_| Ok(document(uri, "OLD")));
        fetcher
            .expect_fetch_actor()
            .times(1)
            .in_sequence(&mut seq)
            .returning(move |_| Ok(document(uri, "NEW")));

        let directory = ActorDirectory::new(db, Arc::new(fetcher));
        let key_id = "https://remote.example/users/alice#main-key";
        let old = directory.public_key(key_id, false).await.expect("old");
        assert_eq!(old.pem, "OLD");
        assert!(old.fetched);
        assert_eq!(directory.public_key(key_id, true).await.expect("new").pem, "NEW");
        let stored = directory.public_key(key_id, false).await.expect("stored");
        assert_eq!(stored.pem, "NEW");
        assert!(!stored.fetched);
    }

    #[tokio::test]
    async fn directory_rejects_mismatched_key_fragment() {
        let (_dir, db) = test_db().await;
        let uri = "https://remote.example/users/alice";

        let mut fetcher = MockActorFetcher::new();
        fetcher
            .expect_fetch_actor()
            .returning(move |_| Ok(document(uri, "PEM")));

        let directory = ActorDirectory::new(db, Arc::new(fetcher));
        assert!(matches!(
            directory
                .public_key("https://remote.example/users/alice#other-key", false)
                .await,
            Err(AppError::Federation(_))
        ));
    }
}
