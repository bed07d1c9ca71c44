//! Authentication middleware
//!
//! Protects the operator API with the configured bearer token.

use axum::{
    extract::{Request, State},
    http::HeaderMap,
    middleware::Next,
    response::Response,
};
use axum_extra::headers::{Authorization, HeaderMapExt, authorization::Bearer};

use crate::AppState;
use crate::error::AppError;

pub fn extract_bearer_token(headers: &HeaderMap) -> Option<String> {
    headers
        .typed_get::<Authorization<Bearer>>()
        .map(|auth| auth.token().trim().to_string())
        .filter(|token| !token.is_empty())
}

/// Compare without exiting at the first differing byte.
fn tokens_match(presented: &str, expected: &str) -> bool {
    let (presented, expected) = (presented.as_bytes(), expected.as_bytes());
    if presented.len() != expected.len() {
        return false;
    }
    presented
        .iter()
        .zip(expected)
        .fold(0u8, |diff, (a, b)| diff | (a ^ b))
        == 0
}

/// Middleware to require the admin bearer token
///
/// # Usage
/// ```ignore
/// let admin = Router::new()
///     .route("/delivery-events", get(list))
///     .layer(middleware::from_fn_with_state(state, require_admin_token));
/// ```
pub async fn require_admin_token(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let token = extract_bearer_token(request.headers()).ok_or(AppError::Unauthorized)?;
    if !tokens_match(&token, &state.config.admin.api_token) {
        tracing::warn!(path = %request.uri().path(), "Rejected admin request with wrong token");
        return Err(AppError::Unauthorized);
    }

    Ok(next.run(request).await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn bearer_token_is_extracted() {
        let mut headers = HeaderMap::new();
        headers.insert("Authorization", HeaderValue::from_static("Bearer s3cret"));
        assert_eq!(extract_bearer_token(&headers).as_deref(), Some("s3cret"));

        headers.insert("Authorization", HeaderValue::from_static("Basic abc"));
        assert_eq!(extract_bearer_token(&headers), None);
    }

    #[test]
    fn token_comparison() {
        assert!(tokens_match("abcdef", "abcdef"));
        assert!(!tokens_match("abcdeg", "abcdef"));
        assert!(!tokens_match("abc", "abcdef"));
    }
}
