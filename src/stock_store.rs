//! C1 — Stock Store: the hot per-product counter `stock:{id}` (spec §4.1).
//!
//! The conditional decrement and owner-verified operations must execute
//! server-side as a single atomic unit; this module never performs a
//! client-side read-modify-write, even though callers also hold a C2/C4
//! lease — the atomic script is the second line of defense against oversell
//! (spec §9 "Inline scripted counter operations").

use async_trait::async_trait;
use redis::{AsyncCommands, Script};
use tracing::debug;

use crate::redis_pool::RedisEndpoint;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeedOutcome {
    Seeded,
    AlreadyPresent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecrementOutcome {
    Ok { remaining: i64 },
    Insufficient { available: i64 },
    Missing,
}

/// Capability seam for the hot counter tier (spec §9 "class-as-namespace
/// becomes a small interface"). `RedisStockStore` is the production adapter;
/// tests use an in-memory fake implementing the same trait.
#[async_trait]
pub trait StockStore: Send + Sync {
    async fn seed(&self, product_id: i64, quantity: i64) -> anyhow::Result<SeedOutcome>;
    async fn read(&self, product_id: i64) -> anyhow::Result<Option<i64>>;
    async fn try_decrement(&self, product_id: i64, quantity: i64) -> anyhow::Result<DecrementOutcome>;
    async fn increment(&self, product_id: i64, quantity: i64) -> anyhow::Result<i64>;
}

fn stock_key(product_id: i64) -> String {
    format!("stock:{product_id}")
}

/// GET/compare/DECRBY as one server-side script: atomicity here is what
/// makes non-negativity enforceable even if the advisory lease was violated.
fn decrement_script() -> Script {
    Script::new(
        r#"
        local current = redis.call("GET", KEYS[1])
        if current == false then
            return {"missing"}
        end
        current = tonumber(current)
        local quantity = tonumber(ARGV[1])
        if current < quantity then
            return {"insufficient", current}
        end
        local remaining = redis.call("DECRBY", KEYS[1], quantity)
        return {"ok", remaining}
        "#,
    )
}

pub struct RedisStockStore {
    endpoint: RedisEndpoint,
}

impl RedisStockStore {
    pub fn new(endpoint: RedisEndpoint) -> Self {
        Self { endpoint }
    }
}

#[async_trait]
impl StockStore for RedisStockStore {
    async fn seed(&self, product_id: i64, quantity: i64) -> anyhow::Result<SeedOutcome> {
        let mut conn = self.endpoint.manager.clone();
        let key = stock_key(product_id);
        // SET key quantity NX — set-if-absent, idempotent across retries.
        let set: bool = conn.set_nx(&key, quantity).await?;
        if set {
            debug!(product_id, quantity, "stock counter seeded");
            Ok(SeedOutcome::Seeded)
        } else {
            debug!(product_id, "stock counter already present, seed is a no-op");
            Ok(SeedOutcome::AlreadyPresent)
        }
    }

    async fn read(&self, product_id: i64) -> anyhow::Result<Option<i64>> {
        let mut conn = self.endpoint.manager.clone();
        let value: Option<i64> = conn.get(stock_key(product_id)).await?;
        Ok(value)
    }

    async fn try_decrement(&self, product_id: i64, quantity: i64) -> anyhow::Result<DecrementOutcome> {
        let mut conn = self.endpoint.manager.clone();
        let key = stock_key(product_id);

        let reply: Vec<redis::Value> = decrement_script()
            .key(&key)
            .arg(quantity)
            .invoke_async(&mut conn)
            .await?;

        let tag = match reply.first() {
            Some(redis::Value::BulkString(bytes)) => String::from_utf8_lossy(bytes).to_string(),
            Some(redis::Value::SimpleString(s)) => s.clone(),
            _ => anyhow::bail!("unexpected decrement script reply shape"),
        };

        match tag.as_str() {
            "missing" => Ok(DecrementOutcome::Missing),
            "insufficient" => {
                let available = extract_int(reply.get(1))?;
                Ok(DecrementOutcome::Insufficient { available })
            }
            "ok" => {
                let remaining = extract_int(reply.get(1))?;
                Ok(DecrementOutcome::Ok { remaining })
            }
            other => anyhow::bail!("unrecognized decrement script tag: {other}"),
        }
    }

    async fn increment(&self, product_id: i64, quantity: i64) -> anyhow::Result<i64> {
        let mut conn = self.endpoint.manager.clone();
        let new_value: i64 = conn.incr(stock_key(product_id), quantity).await?;
        debug!(product_id, quantity, new_value, "stock counter incremented (compensation or restock)");
        Ok(new_value)
    }
}

fn extract_int(value: Option<&redis::Value>) -> anyhow::Result<i64> {
    match value {
        Some(redis::Value::Int(n)) => Ok(*n),
        Some(redis::Value::BulkString(bytes)) => Ok(String::from_utf8_lossy(bytes).parse()?),
        _ => anyhow::bail!("expected integer in script reply"),
    }
}
