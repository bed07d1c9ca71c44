//! Common test utilities for E2E tests

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use aperture::data::Actor;
use aperture::error::AppError;
use aperture::federation::{
    Activity, ActorFetcher, ActorSigner, InboxTransport, RemoteActorDocument, SignatureHeaders,
    generate_keypair, main_key_id,
};
use aperture::{AppState, config};
use async_trait::async_trait;
use serde_json::Value;
use tempfile::TempDir;
use tokio::net::TcpListener;

pub const ADMIN_TOKEN: &str = "test-admin-token-0123456789";
pub const ALICE: &str = "https://remote.example/users/alice";
pub const CAROL: &str = "https://remote.example/users/carol";
pub const DAVE: &str = "https://other.example/users/dave";
pub const REMOTE_SHARED_INBOX: &str = "https://remote.example/inbox";

/// Keypair held by every scripted remote actor
pub fn remote_keys() -> &'static (String, String) {
    static KEYS: OnceLock<(String, String)> = OnceLock::new();
    KEYS.get_or_init(|| generate_keypair(1024).unwrap())
}

pub fn remote_signer(actor_uri: &str) -> ActorSigner {
    ActorSigner::from_pem(main_key_id(actor_uri), &remote_keys().0).unwrap()
}

pub fn local_signer(actor: &Actor) -> ActorSigner {
    ActorSigner::for_actor(actor).unwrap().unwrap()
}

/// Actor document served by [`StaticActorFetcher`]
pub fn remote_document(actor_uri: &str, shared_inbox: Option<&str>) -> RemoteActorDocument {
    RemoteActorDocument {
        id: actor_uri.to_string(),
        preferred_username: actor_uri.rsplit('/').next().map(str::to_string),
        inbox: format!("{}/inbox", actor_uri),
        shared_inbox: shared_inbox.map(str::to_string),
        public_key_id: Some(main_key_id(actor_uri)),
        public_key_pem: Some(remote_keys().1.clone()),
        manually_approves_followers: false,
    }
}

/// Actor fetcher answering from a fixed set of documents
#[derive(Default)]
pub struct StaticActorFetcher {
    documents: Mutex<HashMap<String, RemoteActorDocument>>,
}

impl StaticActorFetcher {
    pub fn with_remote_actors() -> Self {
        let fetcher = Self::default();
        fetcher.insert(remote_document(ALICE, Some(REMOTE_SHARED_INBOX)));
        fetcher.insert(remote_document(CAROL, Some(REMOTE_SHARED_INBOX)));
        fetcher.insert(remote_document(DAVE, None));
        fetcher.insert(remote_document("https://blocked.example/users/spammer", None));
        fetcher
    }

    pub fn insert(&self, document: RemoteActorDocument) {
        self.documents
            .lock()
            .unwrap()
            .insert(document.id.clone(), document);
    }
}

#[async_trait]
impl ActorFetcher for StaticActorFetcher {
    async fn fetch_actor(&self, actor_uri: &str) -> Result<RemoteActorDocument, AppError> {
        let uri = actor_uri.split('#').next().unwrap_or(actor_uri);
        self.documents
            .lock()
            .unwrap()
            .get(uri)
            .cloned()
            .ok_or_else(|| AppError::Federation(format!("Unknown actor {}", uri)))
    }
}

/// Transport recording every POST and replying from per-inbox scripts.
///
/// The last scripted status repeats; unscripted inboxes answer 202.
#[derive(Default)]
pub struct ScriptedTransport {
    replies: Mutex<HashMap<String, Vec<u16>>>,
    posts: Mutex<Vec<(String, Value)>>,
}

impl ScriptedTransport {
    pub fn reply(&self, inbox: &str, statuses: &[u16]) {
        self.replies
            .lock()
            .unwrap()
            .insert(inbox.to_string(), statuses.to_vec());
    }

    pub fn posts(&self) -> Vec<(String, Value)> {
        self.posts.lock().unwrap().clone()
    }

    pub fn posts_to(&self, inbox: &str) -> usize {
        self.posts
            .lock()
            .unwrap()
            .iter()
            .filter(|(url, _)| url == inbox)
            .count()
    }
}

#[async_trait]
impl InboxTransport for ScriptedTransport {
    async fn post(
        &self,
        inbox_url: &str,
        _headers: &SignatureHeaders,
        body: &[u8],
    ) -> Result<u16, AppError> {
        let activity: Value = serde_json::from_slice(body).unwrap();
        self.posts
            .lock()
            .unwrap()
            .push((inbox_url.to_string(), activity));

        let mut replies = self.replies.lock().unwrap();
        let script = replies
            .entry(inbox_url.to_string())
            .or_insert_with(|| vec![202]);
        let status = if script.len() > 1 {
            script.remove(0)
        } else {
            script[0]
        };
        Ok(status)
    }
}

/// Test server instance
pub struct TestServer {
    pub addr: String,
    pub state: AppState,
    pub _temp_dir: TempDir,
    pub client: reqwest::Client,
    pub fetcher: Arc<StaticActorFetcher>,
    pub transport: Arc<ScriptedTransport>,
}

impl TestServer {
    /// Create a new test server instance
    pub async fn new() -> Self {
        Self::with_config(|_| {}).await
    }

    /// Create a test server after adjusting the default test configuration
    pub async fn with_config(adjust: impl FnOnce(&mut config::AppConfig)) -> Self {
        aperture::metrics::init_metrics();

        // Create temporary directory for test database
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("test.db");

        // Bind first so actor URIs can carry the real port
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let mut config = config::AppConfig {
            server: config::ServerConfig {
                host: "127.0.0.1".to_string(),
                port: addr.port(),
                domain: addr.to_string(),
                protocol: "http".to_string(),
            },
            database: config::DatabaseConfig {
                path: db_path.clone(),
            },
            instance: config::InstanceConfig {
                title: "Test Instance".to_string(),
                actor_username: "instance".to_string(),
            },
            admin: config::AdminConfig {
                api_token: ADMIN_TOKEN.to_string(),
            },
            federation: config::FederationConfig::default(),
            logging: config::LoggingConfig {
                level: "info".to_string(),
                format: "pretty".to_string(),
            },
        };
        config.federation.key_bits = 1024;
        config.federation.delivery.base_backoff_ms = 0;
        config.federation.delivery.max_backoff_ms = 0;
        config.federation.inbound.base_backoff_ms = 0;
        config.federation.inbound.max_backoff_ms = 0;
        config.federation.inbound.poll_interval_ms = 50;
        adjust(&mut config);

        let db = aperture::data::Database::connect(&db_path).await.unwrap();
        let fetcher = Arc::new(StaticActorFetcher::with_remote_actors());
        let transport = Arc::new(ScriptedTransport::default());

        // Initialize app state
        let state = AppState::assemble(config, db, fetcher.clone(), transport.clone())
            .await
            .unwrap();

        // Create HTTP client
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap();

        // Spawn server in background
        let app = aperture::build_router(state.clone());
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            addr: format!("http://{}", addr),
            state,
            _temp_dir: temp_dir,
            client,
            fetcher,
            transport,
        }
    }

    /// Get base URL for requests
    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.addr, path)
    }

    /// Create a local actor with its own keypair
    pub async fn create_local_actor(&self, username: &str, manually_approves: bool) -> Actor {
        self.state
            .create_local_actor(username, manually_approves)
            .await
            .unwrap()
    }

    /// POST `activity` to `path`, signed by `signer`
    pub async fn post_signed(
        &self,
        path: &str,
        signer: &ActorSigner,
        activity: &Value,
    ) -> reqwest::Response {
        let body = serde_json::to_vec(activity).unwrap();
        self.post_signed_body(path, signer, &body, &body).await
    }

    /// POST `sent` while signing `signed`; differing bodies model tampering
    pub async fn post_signed_body(
        &self,
        path: &str,
        signer: &ActorSigner,
        signed: &[u8],
        sent: &[u8],
    ) -> reqwest::Response {
        let url = self.url(path);
        let headers = signer.sign_request("POST", &url, Some(signed)).unwrap();

        self.client
            .post(&url)
            .header("Content-Type", "application/activity+json")
            .header("Date", &headers.date)
            .header("Digest", headers.digest.clone().unwrap_or_default())
            .header("Signature", &headers.signature)
            .body(sent.to_vec())
            .send()
            .await
            .unwrap()
    }

    /// GET an admin route with the admin token
    pub async fn admin_get(&self, path: &str) -> reqwest::Response {
        self.client
            .get(self.url(path))
            .bearer_auth(ADMIN_TOKEN)
            .send()
            .await
            .unwrap()
    }

    /// POST JSON to an admin route with the admin token
    pub async fn admin_post(&self, path: &str, body: &Value) -> reqwest::Response {
        self.client
            .post(self.url(path))
            .bearer_auth(ADMIN_TOKEN)
            .json(body)
            .send()
            .await
            .unwrap()
    }

    /// Process every due job, including jobs queued along the way
    pub async fn drain(&self) -> usize {
        self.state.worker.run_pending().await.unwrap()
    }

    /// Activities the transport has posted, parsed
    pub fn delivered(&self) -> Vec<(String, Activity)> {
        self.transport
            .posts()
            .into_iter()
            .map(|(url, value)| (url, Activity::try_from(value).unwrap()))
            .collect()
    }
}
