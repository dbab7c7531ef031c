//! Process-wide external OAuth token cache.
//!
//! Re-expresses the read-locked fast path / double-checked exclusive slow
//! path the original service hand-rolls with `sync.RWMutex` around a
//! single cached access token, using `tokio::sync::RwLock` and an async
//! refresh closure instead of a transliterated mutex dance.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;

use crate::error::EngineResult;

#[derive(Debug, Clone)]
struct CachedToken {
    access_token: String,
    expires_at_unix: i64,
}

/// Tokens are treated as stale 5 minutes before their real expiry, matching
/// the original's `ExpiresAt - 300` guard.
const EXPIRY_SKEW_SECS: i64 = 300;

pub struct TokenCache<F> {
    state: RwLock<Option<CachedToken>>,
    refresh: F,
}

impl<F, Fut> TokenCache<F>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: std::future::Future<Output = EngineResult<(String, Duration)>> + Send,
{
    pub fn new(refresh: F) -> Self {
        TokenCache { state: RwLock::new(None), refresh }
    }

    /// Returns a still-valid cached token if one exists, otherwise refreshes
    /// under an exclusive lock, re-checking after acquiring it in case
    /// another caller refreshed while this one was waiting.
    pub async fn get(&self, now_unix: i64) -> EngineResult<String> {
        {
            let guard = self.state.read().await;
            if let Some(cached) = guard.as_ref() {
                if now_unix < cached.expires_at_unix - EXPIRY_SKEW_SECS {
                    return Ok(cached.access_token.clone());
                }
            }
        }

        let mut guard = self.state.write().await;
        if let Some(cached) = guard.as_ref() {
            if now_unix < cached.expires_at_unix - EXPIRY_SKEW_SECS {
                return Ok(cached.access_token.clone());
            }
        }

        let (token, ttl) = (self.refresh)().await?;
        let expires_at_unix = now_unix + ttl.as_secs() as i64;
        *guard = Some(CachedToken { access_token: token.clone(), expires_at_unix });
        Ok(token)
    }
}

pub fn shared<F, Fut>(refresh: F) -> Arc<TokenCache<F>>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: std::future::Future<Output = EngineResult<(String, Duration)>> + Send,
{
    Arc::new(TokenCache::new(refresh))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn fast_path_skips_refresh_while_fresh() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        let cache = TokenCache::new(move || {
            let calls = calls_clone.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(("tok".to_string(), Duration::from_secs(3600)))
            }
        });

        let first = cache.get(1_000).await.unwrap();
        let second = cache.get(1_010).await.unwrap();
        assert_eq!(first, "tok");
        assert_eq!(second, "tok");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn refreshes_once_stale() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        let cache = TokenCache::new(move || {
            let calls = calls_clone.clone();
            async move {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                Ok((format!("tok{n}"), Duration::from_secs(600)))
            }
        });

        let first = cache.get(0).await.unwrap();
        // Past expiry minus the 300s skew.
        let second = cache.get(400).await.unwrap();
        assert_eq!(first, "tok0");
        assert_eq!(second, "tok1");
    }
}
