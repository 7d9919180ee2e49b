//! C2 — Lock Primitive (single endpoint): a fenced lease over `lock:{resource}`
//! with TTL (spec §4.2). The lease is advisory; C1's atomic decrement is the
//! real backstop against oversell if a lease outlives its holder's critical
//! section (spec §9).

use async_trait::async_trait;
use redis::{AsyncCommands, Script};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::redis_pool::RedisEndpoint;

/// Opaque 128-bit lease identifier, string-encoded at the Redis wire boundary.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LeaseToken(String);

impl LeaseToken {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for LeaseToken {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for LeaseToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

fn lock_key(resource: &str) -> String {
    format!("lock:{resource}")
}

/// GET/compare/DEL as one server-side script — owner-verified release.
/// A non-matching token (expired-and-reacquired, or never held) is a no-op,
/// never an error (spec P5).
fn release_script() -> Script {
    Script::new(
        r#"
        if redis.call("GET", KEYS[1]) == ARGV[1] then
            return redis.call("DEL", KEYS[1])
        else
            return 0
        end
        "#,
    )
}

/// Capability seam for the single-endpoint lease primitive.
#[async_trait]
pub trait LockPrimitive: Send + Sync {
    /// Attempts conditional-set of `lock:{resource} = token` with the given
    /// TTL. Returns whether this endpoint accepted the caller's token — used
    /// by C4 to share one token across every endpoint's acquire attempt.
    async fn acquire_with_token(
        &self,
        resource: &str,
        token: &LeaseToken,
        ttl_seconds: u64,
    ) -> anyhow::Result<bool>;

    /// Owner-verified delete. Never fatal; a non-matching token is a no-op.
    async fn release(&self, resource: &str, token: &LeaseToken) -> anyhow::Result<()>;

    /// Convenience wrapper that generates a fresh token for a single-endpoint
    /// acquire (C2's own public surface; C4 calls `acquire_with_token` directly).
    async fn acquire(&self, resource: &str, ttl_seconds: u64) -> anyhow::Result<Option<LeaseToken>> {
        let token = LeaseToken::new();
        if self.acquire_with_token(resource, &token, ttl_seconds).await? {
            Ok(Some(token))
        } else {
            Ok(None)
        }
    }
}

pub struct RedisLock {
    endpoint: RedisEndpoint,
}

impl RedisLock {
    pub fn new(endpoint: RedisEndpoint) -> Self {
        Self { endpoint }
    }
}

#[async_trait]
impl LockPrimitive for RedisLock {
    async fn acquire_with_token(
        &self,
        resource: &str,
        token: &LeaseToken,
        ttl_seconds: u64,
    ) -> anyhow::Result<bool> {
        let mut conn = self.endpoint.manager.clone();
        let key = lock_key(resource);

        let acquired: bool = conn
            .set_options(
                &key,
                token.as_str(),
                redis::SetOptions::default()
                    .conditional_set(redis::ExistenceCheck::NX)
                    .with_expiration(redis::SetExpiry::EX(ttl_seconds)),
            )
            .await?;

        if acquired {
            debug!(resource, endpoint = %self.endpoint.label, token = %token, "lease acquired");
        } else {
            debug!(resource, endpoint = %self.endpoint.label, "lease acquire failed, resource held");
        }
        Ok(acquired)
    }

    async fn release(&self, resource: &str, token: &LeaseToken) -> anyhow::Result<()> {
        let mut conn = self.endpoint.manager.clone();
        let key = lock_key(resource);
        let deleted: i64 = release_script()
            .key(&key)
            .arg(token.as_str())
            .invoke_async(&mut conn)
            .await?;

        if deleted == 1 {
            debug!(resource, token = %token, "lease released");
        } else {
            warn!(resource, token = %token, "lease release was a no-op (not the current holder)");
        }
        Ok(())
    }
}
