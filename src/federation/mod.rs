//! ActivityPub federation module
//!
//! Handles:
//! - Inbound ingestion (inbox, shared inbox, outbox)
//! - Durable work queues and processing workers
//! - HTTP Signatures and public key caching
//! - Activity side effects
//! - Outbound delivery with retries and an audit trail
//! - Domain blocking

mod activity;
mod actors;
mod audit;
mod delivery;
mod domain_filter;
mod envelope;
mod follow_responder;
mod inbound;
mod key_cache;
mod processor;
mod queue;
mod retry;
mod signature;
mod verifier;
mod worker;

#[cfg(test)]
mod test_support;

pub use activity::{
    Activity, ActivityKind, ActivityParseError, PUBLIC_AUDIENCE, builder, sanitize_remote_html,
};
pub use actors::{
    ActorDirectory, ActorFetcher, HttpActorFetcher, RemoteActorDocument, extract_actor_domain,
};
pub use audit::{DeliveryAudit, DeliveryReport};
pub use delivery::{
    ACTIVITY_CONTENT_TYPE, Addressing, DeliveryEngine, InboxTransport, Recipient, ReqwestTransport,
};
pub use domain_filter::{BlockedDomainSet, DomainBlockFilter, DomainBlockRefresher};
pub use envelope::{Envelope, Ingress};
pub use follow_responder::{FollowDecision, FollowResponder, FollowResponseJob};
pub use inbound::{InboundDispatcher, InboundRequest, IngressOutcome};
pub use key_cache::{CacheStats, PublicKeyCache};
pub use processor::ActivityProcessor;
pub use queue::{JobDisposition, JobQueue, queues};
pub use retry::RetryPolicy;
pub use signature::{
    ActorSigner, SignatureHeaders, SignedRequest, generate_digest, generate_keypair, main_key_id,
    verify_signature,
};
pub use verifier::{SignatureVerifier, VerificationError};
pub use worker::{FederationWorker, ProcessOutcome};
