//! Aperture - the ActivityPub federation engine of a photo-sharing server
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      API Layer (Axum)                        │
//! │  - Inbox / shared inbox / outbox ingestion                  │
//! │  - Actor documents                                          │
//! │  - Admin (delivery audit, domain blocks)                    │
//! └─────────────────────────────────────────────────────────────┘
//!                              │ enqueue
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     Federation Layer                         │
//! │  - Signature verification and key cache                     │
//! │  - Queue workers and activity handlers                      │
//! │  - Outbound delivery with retries and audit trail           │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Data Layer                              │
//! │  - SQLite (sqlx): actors, follows, statuses, jobs, audit    │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - `api`: HTTP handlers for ActivityPub and the admin API
//! - `federation`: ActivityPub federation handling
//! - `data`: Database layer
//! - `auth`: Admin bearer-token authentication
//! - `config`: Configuration management
//! - `error`: Error types

pub mod api;
pub mod auth;
pub mod config;
pub mod data;
pub mod error;
pub mod federation;
pub mod metrics;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use federation::{
    ActorDirectory, ActorFetcher, DeliveryAudit, DeliveryEngine, DomainBlockRefresher, FederationWorker,
    HttpActorFetcher, InboundDispatcher, InboxTransport, JobQueue, PublicKeyCache,
    ReqwestTransport, RetryPolicy,
};

/// Application state shared across all handlers
///
/// This struct is cloned for each request and contains
/// shared resources like the database pool, the queue and the workers.
#[derive(Clone)]
pub struct AppState {
    /// Application configuration
    pub config: Arc<config::AppConfig>,

    /// Database connection pool
    pub db: Arc<data::Database>,

    /// Durable job queue
    pub queue: Arc<JobQueue>,

    /// Validates and enqueues inbound requests
    pub dispatcher: InboundDispatcher,

    /// Processes queued jobs
    pub worker: Arc<FederationWorker>,

    /// Publishes the blocked-domain snapshot
    pub refresher: Arc<DomainBlockRefresher>,

    /// Remote public key cache
    pub keys: Arc<PublicKeyCache>,
}

impl AppState {
    /// Initialize application state
    ///
    /// # Steps
    /// 1. Connect to SQLite database
    /// 2. Build the federation HTTP client
    /// 3. Wire the federation components
    ///
    /// # Errors
    /// Returns error if any initialization step fails
    pub async fn new(config: config::AppConfig) -> Result<Self, error::AppError> {
        tracing::info!("Initializing application state...");

        // 1. Connect to SQLite database
        let db = data::Database::connect(&config.database.path).await?;
        tracing::info!("Database connected");

        // 2. Initialize HTTP client
        let http_client = reqwest::Client::builder()
            .user_agent(&config.federation.user_agent)
            .timeout(config.federation.request_timeout())
            .build()
            .map_err(|e| error::AppError::Internal(e.into()))?;

        // 3. Wire federation
        let fetcher = Arc::new(HttpActorFetcher::new(http_client.clone()));
        let transport = Arc::new(ReqwestTransport::new(http_client));
        Self::assemble(config, db, fetcher, transport).await
    }

    /// Wire the federation components around an open database.
    ///
    /// The actor fetcher and the inbox transport are the two network seams.
    pub async fn assemble(
        config: config::AppConfig,
        db: data::Database,
        fetcher: Arc<dyn ActorFetcher>,
        transport: Arc<dyn InboxTransport>,
    ) -> Result<Self, error::AppError> {
        let db = Arc::new(db);
        let federation = &config.federation;

        let directory = Arc::new(ActorDirectory::new(db.clone(), fetcher));
        let keys = Arc::new(PublicKeyCache::new(
            directory.clone(),
            Some(Duration::from_secs(federation.key_cache.ttl_secs)),
        ));
        let queue = Arc::new(JobQueue::new(
            db.clone(),
            RetryPolicy::from(&federation.inbound),
        ));
        let engine = DeliveryEngine::new(
            db.clone(),
            directory.clone(),
            transport,
            RetryPolicy::from(&federation.delivery),
            federation.delivery.concurrency,
        );

        let refresher = Arc::new(DomainBlockRefresher::new(db.clone()));
        let blocked = refresher.refresh().await?;
        tracing::info!(blocked, "Domain blocks loaded");

        let dispatcher = InboundDispatcher::new(refresher.filter(), queue.clone());
        let worker = Arc::new(FederationWorker::new(
            db.clone(),
            queue.clone(),
            directory,
            keys.clone(),
            engine,
            &federation.inbound,
        ));

        let state = Self {
            config: Arc::new(config),
            db,
            queue,
            dispatcher,
            worker,
            refresher,
            keys,
        };

        let username = state.config.instance.actor_username.clone();
        if state.db.get_local_actor(&username).await?.is_none() {
            state.create_local_actor(&username, false).await?;
            tracing::info!(username = %username, "Instance actor created");
        }

        tracing::info!("Application state initialized successfully");
        Ok(state)
    }

    /// Create a local actor with a freshly generated RSA keypair.
    pub async fn create_local_actor(
        &self,
        username: &str,
        manually_approves_followers: bool,
    ) -> Result<data::Actor, error::AppError> {
        let server = &self.config.server;
        let (private_key_pem, public_key_pem) =
            federation::generate_keypair(self.config.federation.key_bits)?;

        let uri = server.actor_uri(username);
        let domain = url::Url::parse(&server.base_url())
            .ok()
            .and_then(|url| url.host_str().map(str::to_string))
            .unwrap_or_else(|| server.domain.clone());
        let now = chrono::Utc::now();

        let actor = data::Actor {
            id: data::EntityId::new().0,
            username: username.to_string(),
            domain,
            is_local: true,
            inbox_uri: format!("{}/inbox", uri),
            shared_inbox_uri: Some(server.shared_inbox_uri()),
            public_key_id: Some(federation::main_key_id(&uri)),
            public_key_pem: Some(public_key_pem),
            private_key_pem: Some(private_key_pem),
            manually_approves_followers,
            moved_to_uri: None,
            created_at: now,
            updated_at: now,
            uri,
        };

        self.db.upsert_actor(&actor).await?;
        Ok(actor)
    }

    /// Start workers, the domain block refresher and key cache pruning.
    ///
    /// Jobs left running by a previous process are requeued first.
    pub async fn start_background_tasks(
        &self,
        shutdown: watch::Receiver<bool>,
    ) -> Result<Vec<JoinHandle<()>>, error::AppError> {
        self.queue.recover().await?;
        // Before any worker starts, so no live fan-out is mistaken for an orphan.
        DeliveryAudit::new(self.db.clone()).recover().await?;

        let federation = &self.config.federation;
        let mut handles = self
            .worker
            .clone()
            .spawn(federation.inbound.workers, shutdown.clone());
        handles.push(self.refresher.clone().spawn(
            Duration::from_secs(federation.domain_blocks.refresh_interval_secs),
            shutdown.clone(),
        ));
        handles.push(spawn_key_cache_pruning(
            self.keys.clone(),
            Duration::from_secs(federation.key_cache.ttl_secs.max(1)),
            shutdown,
        ));

        tracing::info!(workers = federation.inbound.workers, "Background tasks started");
        Ok(handles)
    }
}

fn spawn_key_cache_pruning(
    keys: Arc<PublicKeyCache>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let removed = keys.prune_expired().await;
                    let stats = keys.stats().await;
                    tracing::debug!(removed, entries = stats.entries, "Key cache pruning pass");
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    })
}

/// Build the Axum router with all routes.
///
/// This is shared by the binary and integration tests to keep route
/// composition consistent across environments.
pub fn build_router(state: AppState) -> axum::Router {
    use axum::Router;
    use tower_http::trace::TraceLayer;

    let max_body_bytes = state.config.federation.inbound.max_body_bytes;

    Router::new()
        .route("/health", axum::routing::get(health_check))
        .merge(api::activitypub_router(max_body_bytes))
        .nest("/admin", api::admin_router(state.clone()))
        .merge(api::metrics_router())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health_check() -> &'static str {
    "OK"
}
