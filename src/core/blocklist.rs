//! Blocklist store for the IP tracking service.
//!
//! This module holds the set of explicitly banned IPs. Entries are created
//! manually (or by an external promotion action), never mutated, and deleted
//! manually. The gating middleware consults this store on every request.

use chrono::Utc;
use redis::Client as RedisClient;
use thiserror::Error;

use crate::models::BlockedIp;

/// Hash of banned IPs: field = ip, value = JSON record
const BLOCKLIST_KEY: &str = "blocked_ips";

/// Errors that can occur during blocklist operations
#[derive(Error, Debug)]
pub enum BlocklistError {
    #[error("Redis error: {0}")]
    RedisError(#[from] redis::RedisError),
    #[error("Serialization error: {0}")]
    SerializationError(String),
}

/// Store of explicitly banned IPs
pub struct BlocklistStore {
    /// Redis client
    redis_client: RedisClient,
}

impl BlocklistStore {
    /// Create a new blocklist store
    pub fn new(redis_client: RedisClient) -> Self {
        Self { redis_client }
    }

    /// Ban an IP address
    ///
    /// # Returns
    ///
    /// * `Ok(true)` if the IP was newly banned
    /// * `Ok(false)` if the IP was already banned (the existing entry is kept)
    pub async fn block(
        &self,
        ip: &str,
        reason: Option<String>,
        created_by: Option<String>,
    ) -> Result<bool, BlocklistError> {
        let mut conn = self.redis_client.get_async_connection().await?;

        let entry = BlockedIp {
            ip_address: ip.to_string(),
            reason,
            created_at: Utc::now(),
            created_by,
        };
        let value = serde_json::to_string(&entry)
            .map_err(|e| BlocklistError::SerializationError(e.to_string()))?;

        let created: bool = redis::cmd("HSETNX")
            .arg(BLOCKLIST_KEY)
            .arg(ip)
            .arg(value)
            .query_async::<_, bool>(&mut conn)
            .await?;

        Ok(created)
    }

    /// Remove an IP from the blocklist
    pub async fn unblock(&self, ip: &str) -> Result<bool, BlocklistError> {
        let mut conn = self.redis_client.get_async_connection().await?;

        let removed: u64 = redis::cmd("HDEL")
            .arg(BLOCKLIST_KEY)
            .arg(ip)
            .query_async::<_, u64>(&mut conn)
            .await?;

        Ok(removed > 0)
    }

    /// Check whether an IP is banned
    pub async fn is_blocked(&self, ip: &str) -> Result<bool, BlocklistError> {
        let mut conn = self.redis_client.get_async_connection().await?;

        let exists: bool = redis::cmd("HEXISTS")
            .arg(BLOCKLIST_KEY)
            .arg(ip)
            .query_async::<_, bool>(&mut conn)
            .await?;

        Ok(exists)
    }

    /// List every banned IP
    pub async fn list(&self) -> Result<Vec<BlockedIp>, BlocklistError> {
        let mut conn = self.redis_client.get_async_connection().await?;

        let values: Vec<BlockedIp> = redis::cmd("HVALS")
            .arg(BLOCKLIST_KEY)
            .query_async::<_, Vec<BlockedIp>>(&mut conn)
            .await?;

        Ok(values)
    }
}
