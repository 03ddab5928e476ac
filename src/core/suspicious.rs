//! Suspicious-IP store for the IP tracking service.
//!
//! Each flagged IP lives in its own Redis hash, with an index set for
//! listing. The upsert is a single atomic pipeline so two writers racing on
//! the same IP can never produce duplicate entries or lost fields:
//! `flagged_at` is written once with HSETNX, everything else is overwritten.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use log::error;
use redis::Client as RedisClient;
use thiserror::Error;

use crate::models::SuspiciousIp;
use crate::utils::format_key;

/// Index set of flagged IPs
const SUSPICIOUS_INDEX_KEY: &str = "suspicious_ips";
/// Prefix of the per-IP hash keys
const SUSPICIOUS_KEY_PREFIX: &str = "suspicious_ip";

/// Errors that can occur during suspicious-IP operations
#[derive(Error, Debug)]
pub enum SuspiciousError {
    #[error("Redis error: {0}")]
    RedisError(#[from] redis::RedisError),
    #[error("Corrupt entry for {0}")]
    CorruptEntry(String),
}

/// Upsertable store of flagged IPs
pub struct SuspiciousIpStore {
    /// Redis client
    redis_client: RedisClient,
}

impl SuspiciousIpStore {
    /// Create a new suspicious-IP store
    pub fn new(redis_client: RedisClient) -> Self {
        Self { redis_client }
    }

    /// Flag an IP, inserting or updating in place
    ///
    /// On first flag the entry is created with `flagged_at = now`; on every
    /// re-flag `reason` and `request_count` are overwritten and `last_seen`
    /// is bumped. At most one entry per IP ever exists.
    pub async fn upsert(
        &self,
        ip: &str,
        reason: &str,
        request_count: i64,
    ) -> Result<(), SuspiciousError> {
        let mut conn = self.redis_client.get_async_connection().await?;

        let key = format_key(SUSPICIOUS_KEY_PREFIX, ip);
        let now = Utc::now().to_rfc3339();

        let _: () = redis::pipe()
            .atomic()
            .cmd("SADD")
            .arg(SUSPICIOUS_INDEX_KEY)
            .arg(ip)
            .ignore()
            .cmd("HSETNX")
            .arg(&key)
            .arg("flagged_at")
            .arg(&now)
            .ignore()
            .cmd("HSET")
            .arg(&key)
            .arg("ip_address")
            .arg(ip)
            .arg("reason")
            .arg(reason)
            .arg("request_count")
            .arg(request_count)
            .arg("last_seen")
            .arg(&now)
            .ignore()
            .query_async::<_, ()>(&mut conn)
            .await?;

        Ok(())
    }

    /// Get the entry for an IP, if it has ever been flagged
    pub async fn get(&self, ip: &str) -> Result<Option<SuspiciousIp>, SuspiciousError> {
        let mut conn = self.redis_client.get_async_connection().await?;

        let key = format_key(SUSPICIOUS_KEY_PREFIX, ip);
        let fields: HashMap<String, String> = redis::cmd("HGETALL")
            .arg(&key)
            .query_async::<_, HashMap<String, String>>(&mut conn)
            .await?;

        if fields.is_empty() {
            return Ok(None);
        }

        parse_entry(&fields)
            .ok_or_else(|| SuspiciousError::CorruptEntry(ip.to_string()))
            .map(Some)
    }

    /// List all flagged IPs, most recently flagged first
    pub async fn list(&self) -> Result<Vec<SuspiciousIp>, SuspiciousError> {
        let mut conn = self.redis_client.get_async_connection().await?;

        let ips: Vec<String> = redis::cmd("SMEMBERS")
            .arg(SUSPICIOUS_INDEX_KEY)
            .query_async::<_, Vec<String>>(&mut conn)
            .await?;

        let mut entries = Vec::with_capacity(ips.len());
        for ip in ips {
            match self.get(&ip).await {
                Ok(Some(entry)) => entries.push(entry),
                Ok(None) => {}
                Err(e) => error!("Skipping unreadable suspicious entry for {}: {}", ip, e),
            }
        }

        entries.sort_by(|a, b| b.flagged_at.cmp(&a.flagged_at));
        Ok(entries)
    }

    /// Number of flagged IPs
    pub async fn count(&self) -> Result<u64, SuspiciousError> {
        let mut conn = self.redis_client.get_async_connection().await?;

        let count: u64 = redis::cmd("SCARD")
            .arg(SUSPICIOUS_INDEX_KEY)
            .query_async::<_, u64>(&mut conn)
            .await?;

        Ok(count)
    }

    /// Remove an IP and its entry (manual cleanup only; detection never deletes)
    pub async fn remove(&self, ip: &str) -> Result<(), SuspiciousError> {
        let mut conn = self.redis_client.get_async_connection().await?;

        let key = format_key(SUSPICIOUS_KEY_PREFIX, ip);
        let _: () = redis::pipe()
            .atomic()
            .cmd("SREM")
            .arg(SUSPICIOUS_INDEX_KEY)
            .arg(ip)
            .ignore()
            .cmd("DEL")
            .arg(&key)
            .ignore()
            .query_async::<_, ()>(&mut conn)
            .await?;

        Ok(())
    }
}

fn parse_entry(fields: &HashMap<String, String>) -> Option<SuspiciousIp> {
    let parse_ts = |name: &str| -> Option<DateTime<Utc>> {
        fields
            .get(name)
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc))
    };

    Some(SuspiciousIp {
        ip_address: fields.get("ip_address")?.clone(),
        reason: fields.get("reason")?.clone(),
        flagged_at: parse_ts("flagged_at")?,
        last_seen: parse_ts("last_seen")?,
        request_count: fields.get("request_count")?.parse().ok()?,
    })
}
