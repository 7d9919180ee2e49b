//! Redis connection bootstrap for the single-endpoint and quorum deployment
//! styles (spec §5 "Redis connection pools are per-endpoint, process-wide").

use redis::aio::ConnectionManager;
use redis::RedisError;

use crate::config::{RedisNode, Settings};

/// A single Redis endpoint's reusable, auto-reconnecting connection.
#[derive(Clone)]
pub struct RedisEndpoint {
    pub label: String,
    pub manager: ConnectionManager,
}

/// Connects the single-endpoint deployment's Redis connection manager.
pub async fn connect_single(settings: &Settings) -> Result<RedisEndpoint, RedisError> {
    let url = settings.redis_url();
    let client = redis::Client::open(url)?;
    let manager = ConnectionManager::new(client).await?;
    Ok(RedisEndpoint {
        label: format!("{}:{}", settings.redis_host, settings.redis_port),
        manager,
    })
}

/// Connects every quorum endpoint for C4. Each endpoint gets its own
/// connection manager; a node that is down at startup still yields an
/// endpoint (dialing is lazy), since quorum tolerates partial availability.
pub async fn connect_quorum(nodes: &[RedisNode]) -> Result<Vec<RedisEndpoint>, RedisError> {
    let mut endpoints = Vec::with_capacity(nodes.len());
    for node in nodes {
        let client = redis::Client::open(node.url())?;
        let manager = ConnectionManager::new(client).await?;
        endpoints.push(RedisEndpoint {
            label: format!("{}:{}", node.host, node.port),
            manager,
        });
    }
    Ok(endpoints)
}
