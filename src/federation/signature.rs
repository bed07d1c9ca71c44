//! HTTP Signatures for ActivityPub
//!
//! Implements signing and verification per:
//! https://docs.joinmastodon.org/spec/security/

use std::collections::BTreeMap;
use std::fmt;

use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use chrono::{DateTime, Utc};
use rsa::pkcs1::DecodeRsaPrivateKey;
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey, LineEnding};
use rsa::signature::{RandomizedSigner, SignatureEncoding, Verifier};
use rsa::{RsaPrivateKey, RsaPublicKey, pkcs1v15::Signature as Pkcs1v15Signature};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::data::Actor;
use crate::error::AppError;

/// Why a signature could not be produced or accepted.
///
/// Every variant is a property of the request itself, so none is worth retrying.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SignatureError {
    #[error("Missing {0} header")]
    MissingHeader(&'static str),
    #[error("Malformed signature header: {0}")]
    Malformed(String),
    #[error("Unsupported signature algorithm: {0}")]
    UnsupportedAlgorithm(String),
    #[error("Signed headers must include: {0}")]
    UnsignedHeader(&'static str),
    #[error("Unsupported header in signature: {0}")]
    UnsupportedHeader(String),
    #[error("Date header too old or in future")]
    StaleDate,
    #[error("Digest mismatch")]
    DigestMismatch,
    #[error("Invalid key: {0}")]
    InvalidKey(String),
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),
    #[error("Signature verification failed")]
    BadSignature,
}

/// Signing capability of one local actor.
///
/// Only constructible from a private key that parses, so holding one means
/// requests can be signed.
#[derive(Clone)]
pub struct ActorSigner {
    key_id: String,
    private_key: RsaPrivateKey,
}

impl fmt::Debug for ActorSigner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActorSigner")
            .field("key_id", &self.key_id)
            .finish_non_exhaustive()
    }
}

impl ActorSigner {
    /// Parse a PKCS#8 (or PKCS#1) PEM private key.
    pub fn from_pem(key_id: impl Into<String>, private_key_pem: &str) -> Result<Self, SignatureError> {
        let private_key = RsaPrivateKey::from_pkcs8_pem(private_key_pem)
            .or_else(|_| RsaPrivateKey::from_pkcs1_pem(private_key_pem))
            .map_err(|e| SignatureError::InvalidKey(e.to_string()))?;

        Ok(Self {
            key_id: key_id.into(),
            private_key,
        })
    }

    /// Signer for a stored actor, if it carries a private key.
    pub fn for_actor(actor: &Actor) -> Result<Option<Self>, AppError> {
        let Some(pem) = actor.private_key_pem.as_deref() else {
            return Ok(None);
        };
        let key_id = actor
            .public_key_id
            .clone()
            .unwrap_or_else(|| main_key_id(&actor.uri));

        Self::from_pem(key_id, pem)
            .map(Some)
            .map_err(|e| AppError::Config(format!("Unusable key for {}: {}", actor.uri, e)))
    }

    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    /// Sign an HTTP request
    ///
    /// # Arguments
    /// * `method` - HTTP method (e.g., "POST")
    /// * `url` - Full URL being requested
    /// * `body` - Request body (for digest)
    ///
    /// # Returns
    /// Headers to add: Host, Date, Signature and Digest (if body present)
    ///
    /// # Example
    /// ```ignore
    /// let headers = signer.sign_request("POST", "https://remote.server/inbox", Some(&body))?;
    /// ```
    pub fn sign_request(
        &self,
        method: &str,
        url: &str,
        body: Option<&[u8]>,
    ) -> Result<SignatureHeaders, SignatureError> {
        // 1. Parse URL to get host and path
        let parsed_url =
            url::Url::parse(url).map_err(|e| SignatureError::InvalidUrl(e.to_string()))?;

        let host = request_authority(&parsed_url)?;

        let path = parsed_url.path();
        let path_and_query = match parsed_url.query() {
            Some(q) => format!("{}?{}", path, q),
            None => path.to_string(),
        };

        // 2. Generate Date header (RFC 2822 format)
        let date = http_date(Utc::now());

        // 3. Generate Digest if body present
        let digest = body.map(generate_digest);

        // 4. Build signing string
        let request_target = format!("{} {}", method.to_lowercase(), path_and_query);

        let mut signing_parts = vec![
            format!("(request-target): {}", request_target),
            format!("host: {}", host),
            format!("date: {}", date),
        ];

        let mut headers_list = vec!["(request-target)", "host", "date"];

        if let Some(ref digest_value) = digest {
            signing_parts.push(format!("digest: {}", digest_value));
            headers_list.push("digest");
        }

        let signing_string = signing_parts.join("\n");

        // 5. Sign with RSA-SHA256
        let signing_key =
            rsa::pkcs1v15::SigningKey::<Sha256>::new_unprefixed(self.private_key.clone());
        let mut rng = rand::thread_rng();
        let signature = signing_key.sign_with_rng(&mut rng, signing_string.as_bytes());
        let signature_b64 = BASE64.encode(signature.to_bytes());

        // 6. Build Signature header
        let signature_header = format!(
            "keyId=\"{}\",algorithm=\"rsa-sha256\",headers=\"{}\",signature=\"{}\"",
            self.key_id,
            headers_list.join(" "),
            signature_b64
        );

        Ok(SignatureHeaders {
            host,
            signature: signature_header,
            date,
            digest,
        })
    }
}

/// `host[:port]` as sent in the Host header; the port only when explicit.
fn request_authority(url: &url::Url) -> Result<String, SignatureError> {
    let host = url
        .host_str()
        .ok_or_else(|| SignatureError::InvalidUrl("Missing host in URL".to_string()))?;
    Ok(match url.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    })
}

fn http_date(at: DateTime<Utc>) -> String {
    at.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

/// Headers to add for signed request
#[derive(Debug, Clone)]
pub struct SignatureHeaders {
    /// Host header value that was signed
    pub host: String,
    /// Signature header value
    pub signature: String,
    /// Date header value (RFC 2616)
    pub date: String,
    /// Digest header value (if body present)
    pub digest: Option<String>,
}

/// `keyId` conventionally used for an actor's only key
pub fn main_key_id(actor_uri: &str) -> String {
    format!("{}#main-key", actor_uri)
}

/// Generate an RSA keypair as (PKCS#8 private PEM, SPKI public PEM).
pub fn generate_keypair(bits: usize) -> Result<(String, String), AppError> {
    let mut rng = rand::thread_rng();
    let private_key = RsaPrivateKey::new(&mut rng, bits)
        .map_err(|e| AppError::Internal(anyhow::anyhow!("Key generation failed: {}", e)))?;
    let public_key = RsaPublicKey::from(&private_key);

    let private_key_pem = private_key
        .to_pkcs8_pem(LineEnding::LF)
        .map_err(|e| AppError::Internal(anyhow::anyhow!("Private key encoding failed: {}", e)))?
        .to_string();
    let public_key_pem = public_key
        .to_public_key_pem(LineEnding::LF)
        .map_err(|e| AppError::Internal(anyhow::anyhow!("Public key encoding failed: {}", e)))?;

    Ok((private_key_pem, public_key_pem))
}

/// A received request as seen by the verifier.
#[derive(Debug, Clone, Copy)]
pub struct SignedRequest<'a> {
    pub method: &'a str,
    /// Path including the query string
    pub path: &'a str,
    /// Lowercased header names
    pub headers: &'a BTreeMap<String, String>,
    pub body: Option<&'a [u8]>,
}

impl<'a> SignedRequest<'a> {
    fn header(&self, name: &'static str) -> Result<&'a str, SignatureError> {
        self.headers
            .get(name)
            .map(String::as_str)
            .ok_or(SignatureError::MissingHeader(name))
    }

    /// Parsed Signature header
    pub fn signature(&self) -> Result<ParsedSignature, SignatureError> {
        parse_signature_header(self.header("signature")?)
    }
}

/// Verify an HTTP request signature
///
/// The Date header must lie within `max_age_secs` of `reference_time`,
/// which is the moment the request was received.
///
/// # Errors
/// Any [`SignatureError`]; all of them mean the request is not authentic.
pub fn verify_signature(
    request: &SignedRequest<'_>,
    public_key_pem: &str,
    reference_time: DateTime<Utc>,
    max_age_secs: i64,
) -> Result<(), SignatureError> {
    // 1. Parse Signature header
    let parsed = request.signature()?;

    // 2. Validate algorithm and required signed headers.
    if parsed.algorithm != "rsa-sha256" && parsed.algorithm != "hs2019" {
        return Err(SignatureError::UnsupportedAlgorithm(parsed.algorithm));
    }

    for required in ["(request-target)", "host", "date"] {
        if !parsed.headers.iter().any(|h| h == required) {
            return Err(SignatureError::UnsignedHeader(required));
        }
    }

    if request.body.is_some() && !parsed.headers.iter().any(|h| h == "digest") {
        return Err(SignatureError::UnsignedHeader("digest"));
    }

    // 3. Verify Date is recent.
    let date_str = request.header("date")?;
    let date = DateTime::parse_from_rfc2822(date_str)
        .map_err(|_| SignatureError::Malformed("Invalid Date format".to_string()))?;

    let diff = (reference_time.timestamp() - date.timestamp()).abs();
    if diff > max_age_secs {
        return Err(SignatureError::StaleDate);
    }

    // 4. If body present, verify Digest.
    if let Some(body_data) = request.body {
        let digest_str = request.header("digest")?;
        if digest_str != generate_digest(body_data) {
            return Err(SignatureError::DigestMismatch);
        }
    }

    // 5. Reconstruct signing string.
    let mut signing_parts = Vec::with_capacity(parsed.headers.len());

    for header_name in &parsed.headers {
        let value = match header_name.as_str() {
            "(request-target)" => format!("{} {}", request.method.to_lowercase(), request.path),
            "host" => request.header("host")?.to_string(),
            "date" => date_str.to_string(),
            "digest" => request.header("digest")?.to_string(),
            "content-type" => request.header("content-type")?.to_string(),
            other => return Err(SignatureError::UnsupportedHeader(other.to_string())),
        };

        signing_parts.push(format!("{}: {}", header_name, value));
    }

    let signing_string = signing_parts.join("\n");

    // 6. Verify RSA signature.
    let signature_bytes = BASE64
        .decode(&parsed.signature)
        .map_err(|_| SignatureError::Malformed("Invalid signature encoding".to_string()))?;

    let public_key = RsaPublicKey::from_public_key_pem(public_key_pem)
        .map_err(|e| SignatureError::InvalidKey(e.to_string()))?;

    // Create verifier (use new_unprefixed for compatibility).
    let verifier = rsa::pkcs1v15::VerifyingKey::<Sha256>::new_unprefixed(public_key);

    let signature = Pkcs1v15Signature::try_from(signature_bytes.as_slice())
        .map_err(|e| SignatureError::Malformed(format!("Invalid signature format: {}", e)))?;

    verifier
        .verify(signing_string.as_bytes(), &signature)
        .map_err(|_| SignatureError::BadSignature)
}

/// Validate that signature keyId points to the same actor as the activity actor.
pub fn key_id_matches_actor(key_id: &str, actor_id: &str) -> bool {
    let key_actor = key_id.split('#').next().unwrap_or(key_id);
    let actor = actor_id.split('#').next().unwrap_or(actor_id);
    key_actor == actor
}

/// Parsed Signature header
#[derive(Debug, Clone)]
pub struct ParsedSignature {
    /// Key ID (URL to public key)
    pub key_id: String,
    /// Algorithm (usually rsa-sha256)
    pub algorithm: String,
    /// Signed header names
    pub headers: Vec<String>,
    /// Base64-encoded signature
    pub signature: String,
}

/// Parse Signature header value
///
/// # Format
/// ```text
/// keyId="...",algorithm="...",headers="...",signature="..."
/// ```
///
/// `algorithm` defaults to `hs2019` when absent.
pub fn parse_signature_header(header: &str) -> Result<ParsedSignature, SignatureError> {
    let mut key_id = None;
    let mut algorithm = None;
    let mut headers = None;
    let mut signature = None;

    // Split by comma and parse key=value pairs
    for part in header.split(',') {
        let part = part.trim();
        if let Some((key, value)) = part.split_once('=') {
            let key = key.trim();
            // Remove quotes from value
            let value = value.trim().trim_matches('"');

            match key {
                "keyId" => key_id = Some(value.to_string()),
                "algorithm" => algorithm = Some(value.to_string()),
                "headers" => {
                    headers = Some(
                        value
                            .split_whitespace()
                            .map(|s| s.to_ascii_lowercase())
                            .collect(),
                    )
                }
                "signature" => signature = Some(value.to_string()),
                _ => {} // Ignore unknown fields
            }
        }
    }

    let missing = |field: &str| SignatureError::Malformed(format!("Missing {}", field));

    Ok(ParsedSignature {
        key_id: key_id.ok_or_else(|| missing("keyId"))?,
        algorithm: algorithm.unwrap_or_else(|| "hs2019".to_string()),
        headers: headers.ok_or_else(|| missing("headers"))?,
        signature: signature.ok_or_else(|| missing("signature"))?,
    })
}

/// Generate SHA-256 digest for body
///
/// # Returns
/// `SHA-256=base64(hash)`
pub fn generate_digest(body: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(body);
    let hash = hasher.finalize();
    format!("SHA-256={}", BASE64.encode(hash))
}
