//! Chat session state, kept in Redis with a per-key TTL so it survives
//! restarts and is shared between instances.

use crate::error::Result;
use async_trait::async_trait;
use redis::{aio::ConnectionManager, AsyncCommands};
use serde::{de::DeserializeOwned, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

/// Raw string storage with expiry.
#[async_trait]
pub trait SessionBackend: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;

    /// Returns whether the key existed.
    async fn delete(&self, key: &str) -> Result<bool>;
}

#[derive(Clone)]
pub struct RedisSessionBackend {
    manager: ConnectionManager,
}

impl RedisSessionBackend {
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let manager = ConnectionManager::new(client).await?;
        info!("Session store connected to Redis");
        Ok(Self { manager })
    }
}

#[async_trait]
impl SessionBackend for RedisSessionBackend {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.manager.clone();
        let value: Option<String> = conn.get(key).await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let mut conn = self.manager.clone();
        // Redis rejects a zero expiry.
        let seconds = ttl.as_secs().max(1);
        conn.set_ex::<_, _, ()>(key, value, seconds).await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let mut conn = self.manager.clone();
        let removed: i64 = conn.del(key).await?;
        Ok(removed > 0)
    }
}

/// Typed JSON access to session keys, written with one TTL for every key.
#[derive(Clone)]
pub struct SessionStore {
    backend: Arc<dyn SessionBackend>,
    ttl: Duration,
}

impl SessionStore {
    pub fn new(backend: Arc<dyn SessionBackend>, ttl: Duration) -> Self {
        Self { backend, ttl }
    }

    pub async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.backend.get(key).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    pub async fn set_json<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let raw = serde_json::to_string(value)?;
        self.backend.set(key, &raw, self.ttl).await
    }

    pub async fn delete(&self, key: &str) -> Result<bool> {
        let existed = self.backend.delete(key).await?;
        debug!(key, existed, "Session key deleted");
        Ok(existed)
    }
}

/// Use the caller's session id, or start a new one.
pub fn resolve_session_id(requested: Option<&str>) -> String {
    requested
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string())
}

pub fn filters_key(session_id: &str) -> String {
    format!("filters:{}", session_id)
}

pub fn agent_key(session_id: &str) -> String {
    format!("agent:{}", session_id)
}
