//! Identity resolution against the external authority.
//!
//! Tokens are opaque bearer strings. Verification results are cached for a
//! few seconds (enough to absorb the burst a page load produces) and
//! and swept on a timer. Transport failures are distinct from rejected
//! tokens: the former surface 503, the latter 401.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::Response;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

/// Verified user identity injected into request extensions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthUser {
    pub id: String,
    pub username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

#[derive(Debug, Deserialize)]
struct VerifyResponse {
    user: Option<AuthUser>,
}

#[derive(Clone)]
struct CachedUser {
    user: AuthUser,
    expires_at: Instant,
}

/// Cache TTL for verified tokens.
const TOKEN_CACHE_TTL: Duration = Duration::from_secs(5);

/// Deadline for a verify round-trip against a loopback authority.
const VERIFY_TIMEOUT_LOOPBACK: Duration = Duration::from_millis(1500);

/// Deadline against a remote authority.
const VERIFY_TIMEOUT_REMOTE: Duration = Duration::from_secs(5);

pub struct IdentityResolver {
    http: reqwest::Client,
    verify_url: String,
    timeout: Duration,
    cache: DashMap<String, CachedUser>,
}

impl IdentityResolver {
    pub fn new(backend_url: &str, backend_is_loopback: bool) -> Self {
        Self {
            http: reqwest::Client::new(),
            verify_url: format!("{backend_url}/api/auth/verify"),
            timeout: if backend_is_loopback {
                VERIFY_TIMEOUT_LOOPBACK
            } else {
                VERIFY_TIMEOUT_REMOTE
            },
            cache: DashMap::new(),
        }
    }

    /// Verify a token. `Ok(None)` means the authority rejected it;
    /// `Err(AuthorityUnavailable)` means we could not ask.
    pub async fn resolve(&self, token: &str) -> ApiResult<Option<AuthUser>> {
        if token.is_empty() {
            return Ok(None);
        }

        if let Some(cached) = self.cache.get(token) {
            if cached.expires_at > Instant::now() {
                return Ok(Some(cached.user.clone()));
            }
        }

        let response = self
            .http
            .get(&self.verify_url)
            .bearer_auth(token)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| {
                tracing::warn!(error = %e, "authority verify call failed");
                ApiError::AuthorityUnavailable
            })?;

        if !response.status().is_success() {
            return Ok(None);
        }

        let user = match response.json::<VerifyResponse>().await {
            Ok(VerifyResponse { user: Some(user) }) => user,
            _ => return Ok(None),
        };

        self.cache.insert(
            token.to_string(),
            CachedUser { user: user.clone(), expires_at: Instant::now() + TOKEN_CACHE_TTL },
        );
        Ok(Some(user))
    }

    /// Drop expired cache entries. Runs on a 60 s timer.
    pub fn sweep_expired(&self) {
        let now = Instant::now();
        self.cache.retain(|_, entry| entry.expires_at > now);
    }

    #[cfg(test)]
    fn cache_insert(&self, token: &str, user: AuthUser, ttl: Duration) {
        self.cache.insert(
            token.to_string(),
            CachedUser { user, expires_at: Instant::now() + ttl },
        );
    }

    #[cfg(test)]
    fn cache_len(&self) -> usize {
        self.cache.len()
    }
}

/// Extract the bearer token from an `Authorization` header.
pub fn bearer_token(headers: &axum::http::HeaderMap) -> Option<String> {
    let value = headers.get(axum::http::header::AUTHORIZATION)?.to_str().ok()?;
    let token = value.strip_prefix("Bearer ").or_else(|| value.strip_prefix("bearer "))?;
    (!token.is_empty()).then(|| token.to_string())
}

/// `authenticate → notBanned` middleware for the HTTP surface.
///
/// On success the verified [`AuthUser`] lands in request extensions and
/// the profile's last-seen timestamp is refreshed.
pub async fn require_auth(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let token = bearer_token(request.headers()).ok_or(ApiError::Unauthorized)?;
    let user = state
        .resolver
        .resolve(&token)
        .await?
        .ok_or(ApiError::Unauthorized)?;

    if state.store.is_banned(&user.id)? {
        return Err(ApiError::Forbidden("banned".to_string()));
    }

    // First authenticated touch creates the profile; every request
    // refreshes last-seen.
    state
        .store
        .upsert_profile(&user.id, &user.username, user.email.as_deref())?;

    request.extensions_mut().insert(user);
    Ok(next.run(request).await)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolver() -> IdentityResolver {
        IdentityResolver::new("http://127.0.0.1:4000", true)
    }

    fn user(id: &str) -> AuthUser {
        AuthUser { id: id.into(), username: format!("user-{id}"), email: None }
    }

    #[tokio::test]
    async fn test_cached_token_skips_network() {
        let resolver = resolver();
        resolver.cache_insert("tok", user("u1"), Duration::from_secs(5));

        // No authority is running on the verify URL; a cache hit must not
        // touch it.
        let resolved = resolver.resolve("tok").await.unwrap().unwrap();
        assert_eq!(resolved.id, "u1");
    }

    #[tokio::test]
    async fn test_expired_cache_entry_forces_verify() {
        let resolver = resolver();
        resolver.cache_insert("tok", user("u1"), Duration::from_millis(0));

        // Nothing is listening, so the re-verify surfaces 503.
        match resolver.resolve("tok").await {
            Err(ApiError::AuthorityUnavailable) => {}
            other => panic!("expected AuthorityUnavailable, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_empty_token_is_rejected_locally() {
        let resolver = resolver();
        assert!(resolver.resolve("").await.unwrap().is_none());
    }

    #[test]
    fn test_sweep_removes_expired() {
        let resolver = resolver();
        resolver.cache_insert("fresh", user("u1"), Duration::from_secs(60));
        resolver.cache_insert("stale", user("u2"), Duration::from_millis(0));

        resolver.sweep_expired();
        assert_eq!(resolver.cache_len(), 1);
    }

    #[test]
    fn test_bearer_token_extraction() {
        let mut headers = axum::http::HeaderMap::new();
        assert!(bearer_token(&headers).is_none());

        headers.insert(axum::http::header::AUTHORIZATION, "Bearer abc123".parse().unwrap());
        assert_eq!(bearer_token(&headers).as_deref(), Some("abc123"));

        headers.insert(axum::http::header::AUTHORIZATION, "Basic abc123".parse().unwrap());
        assert!(bearer_token(&headers).is_none());

        headers.insert(axum::http::header::AUTHORIZATION, "Bearer ".parse().unwrap());
        assert!(bearer_token(&headers).is_none());
    }

    #[test]
    fn test_timeout_class_by_backend() {
        assert_eq!(
            IdentityResolver::new("http://127.0.0.1:4000", true).timeout,
            VERIFY_TIMEOUT_LOOPBACK
        );
        assert_eq!(
            IdentityResolver::new("https://auth.example.com", false).timeout,
            VERIFY_TIMEOUT_REMOTE
        );
    }
}
