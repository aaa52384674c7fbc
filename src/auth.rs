//! Bearer-token management and the sliding-window limiter applied to failed
//! credential attempts.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use base64::{engine::general_purpose, Engine as _};
use chrono::{DateTime, Utc};
use rand::rngs::OsRng;
use rand::RngCore;

use crate::error::{GatewayError, Result};

#[derive(Debug, Clone)]
struct TokenInfo {
    username: String,
    issued_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    last_seen: DateTime<Utc>,
}

/// Issues and validates short-lived opaque bearer tokens. Expired entries
/// are removed on lookup, so the table never grows past the set of tokens
/// touched within one TTL.
pub struct TokenManager {
    ttl: chrono::Duration,
    tokens: Mutex<HashMap<String, TokenInfo>>,
}

impl TokenManager {
    pub fn new(ttl: Duration) -> Self {
        let ttl = if ttl.is_zero() {
            chrono::Duration::minutes(30)
        } else {
            chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::minutes(30))
        };
        Self {
            ttl,
            tokens: Mutex::new(HashMap::new()),
        }
    }

    /// Mint a new token for `username` and return it with its expiry.
    pub fn issue(&self, username: &str) -> Result<(String, DateTime<Utc>)> {
        let mut buf = [0u8; 32];
        OsRng
            .try_fill_bytes(&mut buf)
            .map_err(|e| GatewayError::internal(anyhow::anyhow!("token rng failed: {e}")))?;
        let token = general_purpose::URL_SAFE_NO_PAD.encode(buf);

        let now = Utc::now();
        let expires_at = now + self.ttl;
        let mut tokens = self.tokens.lock().unwrap();
        tokens.insert(
            token.clone(),
            TokenInfo {
                username: username.to_string(),
                issued_at: now,
                expires_at,
                last_seen: now,
            },
        );
        Ok((token, expires_at))
    }

    /// Check a token and return its username. Expired tokens are deleted.
    pub fn validate(&self, token: &str) -> Option<String> {
        if token.is_empty() {
            return None;
        }
        let now = Utc::now();
        let mut tokens = self.tokens.lock().unwrap();
        match tokens.get_mut(token) {
            Some(info) if now < info.expires_at => {
                info.last_seen = now;
                Some(info.username.clone())
            }
            Some(_) => {
                tokens.remove(token);
                None
            }
            None => None,
        }
    }

    pub fn revoke(&self, token: &str) {
        if token.is_empty() {
            return;
        }
        self.tokens.lock().unwrap().remove(token);
    }

    #[cfg(test)]
    fn issued_at(&self, token: &str) -> Option<DateTime<Utc>> {
        self.tokens
            .lock()
            .unwrap()
            .get(token)
            .map(|info| info.issued_at)
    }
}

struct FailureBucket {
    count: u32,
    reset: Instant,
}

/// Sliding window of failed auth attempts per client. `None`-like behaviour
/// (always allow) is expressed by constructing with `disabled()`.
pub struct AuthRateLimiter {
    limit: u32,
    window: Duration,
    buckets: Mutex<HashMap<String, FailureBucket>>,
}

impl AuthRateLimiter {
    pub fn new(limit: u32, window: Duration) -> Self {
        Self {
            limit,
            window,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    pub fn disabled() -> Self {
        Self::new(0, Duration::ZERO)
    }

    fn enabled(&self) -> bool {
        self.limit > 0 && !self.window.is_zero()
    }

    /// Consume one failure slot for `key`. Returns `Ok(())` when the attempt
    /// may proceed, or the time until the window resets when exhausted.
    pub fn allow(&self, key: &str) -> std::result::Result<(), Duration> {
        if !self.enabled() {
            return Ok(());
        }
        let now = Instant::now();
        let mut buckets = self.buckets.lock().unwrap();
        let bucket = buckets.entry(key.to_string()).or_insert(FailureBucket {
            count: 0,
            reset: now + self.window,
        });
        if now >= bucket.reset {
            bucket.count = 0;
            bucket.reset = now + self.window;
        }
        if bucket.count >= self.limit {
            return Err(bucket.reset.saturating_duration_since(now));
        }
        bucket.count += 1;
        Ok(())
    }

    /// Clear the failure bucket after a successful authentication.
    pub fn reset(&self, key: &str) {
        if !self.enabled() {
            return;
        }
        self.buckets.lock().unwrap().remove(key);
    }
}

/// Compare two secrets without leaking the mismatch position through timing.
pub fn constant_time_eq(a: &str, b: &str) -> bool {
    let a = a.as_bytes();
    let b = b.as_bytes();
    let mut diff = a.len() ^ b.len();
    for i in 0..a.len().max(b.len()) {
        let x = a.get(i).copied().unwrap_or(0);
        let y = b.get(i).copied().unwrap_or(0);
        diff |= (x ^ y) as usize;
    }
    diff == 0
}

/// Extract the token from an `Authorization: Bearer <token>` header value.
pub fn bearer_token(header: &str) -> Option<&str> {
    let (scheme, token) = header.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    if token.is_empty() {
        None
    } else {
        Some(token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn issue_and_validate_round_trip() {
        let manager = TokenManager::new(Duration::from_secs(60));
        let (token, expires_at) = manager.issue("admin").unwrap();
        assert!(expires_at > Utc::now());
        assert!(manager.issued_at(&token).is_some());
        assert_eq!(manager.validate(&token).as_deref(), Some("admin"));
    }

    #[test]
    fn tokens_are_url_safe_and_distinct() {
        let manager = TokenManager::new(Duration::from_secs(60));
        let (a, _) = manager.issue("admin").unwrap();
        let (b, _) = manager.issue("admin").unwrap();
        assert_ne!(a, b);
        assert!(!a.contains('+') && !a.contains('/') && !a.contains('='));
    }

    #[test]
    fn expired_tokens_are_deleted_on_lookup() {
        let manager = TokenManager::new(Duration::from_millis(1));
        let (token, _) = manager.issue("admin").unwrap();
        std::thread::sleep(Duration::from_millis(10));
        assert!(manager.validate(&token).is_none());
        assert!(manager.issued_at(&token).is_none());
    }

    #[test]
    fn revoked_tokens_stop_validating() {
        let manager = TokenManager::new(Duration::from_secs(60));
        let (token, _) = manager.issue("admin").unwrap();
        manager.revoke(&token);
        assert!(manager.validate(&token).is_none());
    }

    #[test]
    fn limiter_exhausts_then_reports_retry_after() {
        let limiter = AuthRateLimiter::new(3, Duration::from_secs(60));
        for _ in 0..3 {
            assert!(limiter.allow("1.2.3.4").is_ok());
        }
        let retry = limiter.allow("1.2.3.4").unwrap_err();
        assert!(retry > Duration::ZERO);

        // other clients are unaffected
        assert!(limiter.allow("5.6.7.8").is_ok());
    }

    #[test]
    fn limiter_window_resets() {
        let limiter = AuthRateLimiter::new(1, Duration::from_millis(20));
        assert!(limiter.allow("c").is_ok());
        assert!(limiter.allow("c").is_err());
        std::thread::sleep(Duration::from_millis(30));
        assert!(limiter.allow("c").is_ok());
    }

    #[test]
    fn limiter_reset_clears_bucket() {
        let limiter = AuthRateLimiter::new(1, Duration::from_secs(60));
        assert!(limiter.allow("c").is_ok());
        limiter.reset("c");
        assert!(limiter.allow("c").is_ok());
    }

    #[test]
    fn disabled_limiter_always_allows() {
        let limiter = AuthRateLimiter::disabled();
        for _ in 0..100 {
            assert!(limiter.allow("c").is_ok());
        }
    }

    #[test]
    fn constant_time_eq_basics() {
        assert!(constant_time_eq("secret", "secret"));
        assert!(!constant_time_eq("secret", "secre7"));
        assert!(!constant_time_eq("secret", "secrets"));
        assert!(!constant_time_eq("", "x"));
        assert!(constant_time_eq("", ""));
    }

    #[test]
    fn bearer_parsing() {
        assert_eq!(bearer_token("Bearer abc"), Some("abc"));
        assert_eq!(bearer_token("bearer abc"), Some("abc"));
        assert_eq!(bearer_token("Basic abc"), None);
        assert_eq!(bearer_token("Bearer "), None);
        assert_eq!(bearer_token(""), None);
    }
}
