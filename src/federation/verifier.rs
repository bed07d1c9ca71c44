//! Envelope authentication
//!
//! Checks the HTTP signature carried by an envelope against the public key
//! of the actor named in `keyId`.

use std::sync::Arc;

use thiserror::Error;

use super::envelope::Envelope;
use super::key_cache::PublicKeyCache;
use super::signature::{SignatureError, key_id_matches_actor, verify_signature};
use crate::error::AppError;
use crate::metrics::SIGNATURE_VERIFICATIONS;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum VerificationError {
    /// The key could not be obtained right now; try again later
    #[error("verification deferred: {0}")]
    Transient(String),
    /// The request is not authentic
    #[error("verification rejected: {0}")]
    Rejected(String),
}

impl From<SignatureError> for VerificationError {
    fn from(err: SignatureError) -> Self {
        Self::Rejected(err.to_string())
    }
}

fn classify(err: AppError) -> VerificationError {
    if err.is_transient() {
        VerificationError::Transient(err.to_string())
    } else {
        VerificationError::Rejected(err.to_string())
    }
}

/// Errors that a newer key could fix
fn key_related(err: &SignatureError) -> bool {
    matches!(err, SignatureError::BadSignature | SignatureError::InvalidKey(_))
}

pub struct SignatureVerifier {
    keys: Arc<PublicKeyCache>,
    max_age_secs: i64,
}

impl SignatureVerifier {
    pub fn new(keys: Arc<PublicKeyCache>, max_age_secs: i64) -> Self {
        Self { keys, max_age_secs }
    }

    /// Authenticate an envelope, returning the verified actor URI.
    ///
    /// Envelopes already marked authenticated are accepted as is. A failure
    /// against a key that was not freshly fetched triggers one refetch.
    pub async fn verify(&self, envelope: &Envelope) -> Result<String, VerificationError> {
        if let Some(actor) = envelope.authenticated_actor.as_deref() {
            return Ok(actor.to_string());
        }

        let result = self.verify_once(envelope).await;
        let label = match &result {
            Ok(_) => "valid",
            Err(VerificationError::Transient(_)) => "transient",
            Err(VerificationError::Rejected(_)) => "rejected",
        };
        SIGNATURE_VERIFICATIONS.with_label_values(&[label]).inc();

        if let Err(e) = &result {
            tracing::warn!(
                activity_id = %envelope.activity.id,
                actor = %envelope.activity.primary_actor(),
                error = %e,
                "Signature verification failed"
            );
        }
        result
    }

    async fn verify_once(&self, envelope: &Envelope) -> Result<String, VerificationError> {
        let request = envelope.signed_request();
        let signature = request.signature()?;
        let actor = envelope.activity.primary_actor();

        if !key_id_matches_actor(&signature.key_id, actor) {
            return Err(VerificationError::Rejected(format!(
                "keyId {} does not belong to actor {}",
                signature.key_id, actor
            )));
        }

        let lookup = self.keys.get(&signature.key_id).await.map_err(classify)?;
        match verify_signature(&request, &lookup.pem, envelope.received_at, self.max_age_secs) {
            Ok(()) => Ok(actor.to_string()),
            Err(e) if lookup.from_cache && key_related(&e) => {
                tracing::debug!(key_id = %signature.key_id, "Refetching possibly rotated key");
                SIGNATURE_VERIFICATIONS.with_label_values(&["refetched"]).inc();
                let pem = self.keys.refresh(&signature.key_id).await.map_err(classify)?;
                verify_signature(&request, &pem, envelope.received_at, self.max_age_secs)?;
                Ok(actor.to_string())
            }
            Err(e) => Err(e.into()),
        }
    }
}
