//! Request log store for the IP tracking service.
//!
//! This module provides the append-only request log backed by a Redis
//! sorted set, scored by timestamp so that window reads and retention
//! deletes are range operations.

use chrono::{DateTime, Utc};
use redis::Client as RedisClient;
use thiserror::Error;

use crate::models::RequestLogEntry;

/// Sorted set holding one JSON member per logged request
const REQUEST_LOG_KEY: &str = "request_logs";

/// Errors that can occur during request log operations
#[derive(Error, Debug)]
pub enum RequestLogError {
    #[error("Redis error: {0}")]
    RedisError(#[from] redis::RedisError),
    #[error("Serialization error: {0}")]
    SerializationError(String),
}

/// Append-only request log
pub struct RequestLogStore {
    /// Redis client
    redis_client: RedisClient,
}

impl RequestLogStore {
    /// Create a new request log store
    pub fn new(redis_client: RedisClient) -> Self {
        Self { redis_client }
    }

    /// Append an entry to the log
    ///
    /// # Arguments
    ///
    /// * `entry` - The request log record to persist
    pub async fn append(&self, entry: &RequestLogEntry) -> Result<(), RequestLogError> {
        let mut conn = self.redis_client.get_async_connection().await?;

        let member = serde_json::to_string(entry)
            .map_err(|e| RequestLogError::SerializationError(e.to_string()))?;

        let _: () = redis::cmd("ZADD")
            .arg(REQUEST_LOG_KEY)
            .arg(entry.timestamp.timestamp_millis())
            .arg(member)
            .query_async::<_, ()>(&mut conn)
            .await?;

        Ok(())
    }

    /// Get every entry with `timestamp >= cutoff`
    pub async fn entries_since(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<RequestLogEntry>, RequestLogError> {
        let mut conn = self.redis_client.get_async_connection().await?;

        let entries: Vec<RequestLogEntry> = redis::cmd("ZRANGEBYSCORE")
            .arg(REQUEST_LOG_KEY)
            .arg(cutoff.timestamp_millis())
            .arg("+inf")
            .query_async::<_, Vec<RequestLogEntry>>(&mut conn)
            .await?;

        Ok(entries)
    }

    /// Get the most recent entries, newest first
    pub async fn recent(&self, limit: usize) -> Result<Vec<RequestLogEntry>, RequestLogError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.redis_client.get_async_connection().await?;

        let entries: Vec<RequestLogEntry> = redis::cmd("ZREVRANGE")
            .arg(REQUEST_LOG_KEY)
            .arg(0)
            .arg(limit.saturating_sub(1) as i64)
            .query_async::<_, Vec<RequestLogEntry>>(&mut conn)
            .await?;

        Ok(entries)
    }

    /// Delete every entry with `timestamp < cutoff`
    ///
    /// # Returns
    ///
    /// The number of entries deleted. Running this twice with the same
    /// cutoff deletes nothing the second time.
    pub async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, RequestLogError> {
        let mut conn = self.redis_client.get_async_connection().await?;

        let deleted: u64 = redis::cmd("ZREMRANGEBYSCORE")
            .arg(REQUEST_LOG_KEY)
            .arg("-inf")
            .arg(format!("({}", cutoff.timestamp_millis()))
            .query_async::<_, u64>(&mut conn)
            .await?;

        Ok(deleted)
    }

    /// Total number of entries in the log
    pub async fn count(&self) -> Result<u64, RequestLogError> {
        let mut conn = self.redis_client.get_async_connection().await?;

        let count: u64 = redis::cmd("ZCARD")
            .arg(REQUEST_LOG_KEY)
            .query_async::<_, u64>(&mut conn)
            .await?;

        Ok(count)
    }

    /// Drop the whole log
    pub async fn clear(&self) -> Result<(), RequestLogError> {
        let mut conn = self.redis_client.get_async_connection().await?;

        let _: () = redis::cmd("DEL")
            .arg(REQUEST_LOG_KEY)
            .query_async::<_, ()>(&mut conn)
            .await?;

        Ok(())
    }
}
