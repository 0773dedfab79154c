//! Capability-token cache for remote drivers.
//!
//! Remote backends hand out session cookies or signed capability tokens with
//! an expiry. A driver keeps one [`TokenCache`], asks it for a token before
//! each call, and wraps calls in [`TokenCache::with_token`] so that a
//! `SessionExpired` answer triggers exactly one refresh and retry.

use crate::error::{StorageError, StorageResult};
use std::future::Future;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

/// A freshly issued token and its lifetime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuedToken {
    /// Opaque token value.
    pub value: String,
    /// How long the backend promises the token stays valid.
    pub ttl: Duration,
}

impl IssuedToken {
    /// Creates a token description.
    pub fn new(value: impl Into<String>, ttl: Duration) -> Self {
        Self {
            value: value.into(),
            ttl,
        }
    }
}

#[derive(Debug)]
struct CachedToken {
    value: String,
    expires_at: Instant,
}

/// Cache holding at most one live token.
///
/// Refreshes are serialized: concurrent callers that find the token expired
/// wait for a single refresh instead of each logging in again.
#[derive(Debug, Default)]
pub struct TokenCache {
    slot: Mutex<Option<CachedToken>>,
    skew: Duration,
}

impl TokenCache {
    /// Creates an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Treats tokens as expired `skew` before their real expiry.
    #[must_use]
    pub fn with_skew(mut self, skew: Duration) -> Self {
        self.skew = skew;
        self
    }

    /// Returns the cached token if it has not expired.
    pub async fn current(&self) -> Option<String> {
        let slot = self.slot.lock().await;
        slot.as_ref()
            .filter(|t| self.is_live(t))
            .map(|t| t.value.clone())
    }

    /// Drops the cached token.
    pub async fn invalidate(&self) {
        *self.slot.lock().await = None;
    }

    /// Returns the cached token, calling `refresh` if there is none or it
    /// has expired.
    ///
    /// # Errors
    ///
    /// Propagates the error returned by `refresh`.
    pub async fn get_or_refresh<F, Fut>(&self, refresh: F) -> StorageResult<String>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = StorageResult<IssuedToken>>,
    {
        let mut slot = self.slot.lock().await;
        if let Some(token) = slot.as_ref().filter(|t| self.is_live(t)) {
            return Ok(token.value.clone());
        }
        let issued = refresh().await?;
        tracing::debug!(ttl_ms = issued.ttl.as_millis() as u64, "session token refreshed");
        let value = issued.value.clone();
        *slot = Some(CachedToken {
            value: issued.value,
            expires_at: Instant::now() + issued.ttl,
        });
        Ok(value)
    }

    /// Runs `call` with a valid token, refreshing and retrying once if the
    /// backend reports the session as expired.
    ///
    /// # Errors
    ///
    /// Returns the refresh error, or the error of the last `call` attempt.
    pub async fn with_token<T, R, RFut, C, CFut>(&self, refresh: R, call: C) -> StorageResult<T>
    where
        R: Fn() -> RFut,
        RFut: Future<Output = StorageResult<IssuedToken>>,
        C: Fn(String) -> CFut,
        CFut: Future<Output = StorageResult<T>>,
    {
        let token = self.get_or_refresh(&refresh).await?;
        match call(token).await {
            Err(StorageError::SessionExpired { message }) => {
                tracing::debug!(%message, "session expired, retrying once");
                self.invalidate().await;
                let token = self.get_or_refresh(&refresh).await?;
                call(token).await
            }
            other => other,
        }
    }

    fn is_live(&self, token: &CachedToken) -> bool {
        Instant::now() + self.skew < token.expires_at
    }
}
