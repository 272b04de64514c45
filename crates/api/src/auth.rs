//! Admin authentication
//!
//! The admin surface is protected by a single shared bearer token. Token
//! comparison is constant-time to avoid leaking prefix matches.

use axum::extract::{Request, State};
use axum::http::header::AUTHORIZATION;
use axum::middleware::Next;
use axum::response::Response;
use subtle::ConstantTimeEq;

use crate::error::ApiError;
use crate::state::AppState;

/// Middleware guarding `/admin` routes.
pub async fn require_admin(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let presented = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or(ApiError::Unauthorized)?;

    if !token_matches(presented, &state.config.admin_token) {
        tracing::warn!("Rejected admin request with invalid token");
        return Err(ApiError::Unauthorized);
    }

    Ok(next.run(request).await)
}

fn token_matches(presented: &str, expected: &str) -> bool {
    !expected.is_empty() && presented.as_bytes().ct_eq(expected.as_bytes()).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_token_matches() {
        assert!(token_matches("tok_secret", "tok_secret"));
    }

    #[test]
    fn wrong_or_partial_tokens_fail() {
        assert!(!token_matches("tok_secre", "tok_secret"));
        assert!(!token_matches("tok_secret2", "tok_secret"));
        assert!(!token_matches("", "tok_secret"));
    }

    #[test]
    fn empty_configured_token_never_matches() {
        assert!(!token_matches("", ""));
        assert!(!token_matches("anything", ""));
    }
}
