//! IP geolocation for the IP tracking service.
//!
//! Lookups go through a local MaxMind city database when one is configured
//! and gracefully degrade to empty results when it is missing or unreadable.
//! Results are cached in Redis so an IP is resolved at most once per TTL.

use std::net::IpAddr;

use log::{debug, warn};
use maxminddb::{geoip2, Reader};
use redis::Client as RedisClient;
use serde::{Deserialize, Serialize};

use crate::utils::{format_key, is_non_routable};

/// Prefix of the per-IP cache keys
const GEO_CACHE_PREFIX: &str = "geoip";

/// Geolocation result for one IP
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct GeoInfo {
    /// Country name, if resolved
    pub country: Option<String>,
    /// City name, if resolved
    pub city: Option<String>,
}

/// Geolocation service with a Redis-backed cache
pub struct GeoService {
    /// City database reader; `None` disables lookups
    reader: Option<Reader<Vec<u8>>>,
    /// Redis client for the cache
    redis_client: RedisClient,
    /// Cache TTL in seconds
    cache_ttl_seconds: u64,
}

impl GeoService {
    /// Create a geolocation service
    ///
    /// A missing or unreadable database is not an error: the service logs a
    /// warning and resolves every IP to an empty result, exactly like the
    /// rest of the pipeline treats optional capabilities.
    pub fn new(
        redis_client: RedisClient,
        city_db_path: Option<&str>,
        cache_ttl_seconds: u64,
    ) -> Self {
        let reader = match city_db_path {
            Some(path) => match Reader::open_readfile(path) {
                Ok(reader) => {
                    log::info!("GeoIP city database loaded from {}", path);
                    Some(reader)
                }
                Err(e) => {
                    warn!("Failed to load GeoIP city database at {}: {}. Geolocation disabled.", path, e);
                    None
                }
            },
            None => None,
        };

        Self {
            reader,
            redis_client,
            cache_ttl_seconds,
        }
    }

    /// Whether a database is loaded
    pub fn is_enabled(&self) -> bool {
        self.reader.is_some()
    }

    /// Resolve an IP directly against the database, bypassing the cache
    pub fn lookup(&self, ip: IpAddr) -> GeoInfo {
        if is_non_routable(&ip) {
            return GeoInfo::default();
        }

        let reader = match &self.reader {
            Some(reader) => reader,
            None => return GeoInfo::default(),
        };

        match reader.lookup::<geoip2::City>(ip) {
            Ok(city) => GeoInfo {
                country: city
                    .country
                    .and_then(|c| c.names)
                    .and_then(|n| n.get("en").map(|s| s.to_string())),
                city: city
                    .city
                    .and_then(|c| c.names)
                    .and_then(|n| n.get("en").map(|s| s.to_string())),
            },
            Err(e) => {
                debug!("GeoIP lookup failed for {}: {}", ip, e);
                GeoInfo::default()
            }
        }
    }

    /// Resolve an IP, serving from the Redis cache when possible
    ///
    /// Cache failures fall back to a direct lookup; they never surface to
    /// the caller.
    pub async fn lookup_cached(&self, ip: IpAddr) -> GeoInfo {
        if !self.is_enabled() || is_non_routable(&ip) {
            return GeoInfo::default();
        }

        let key = format_key(GEO_CACHE_PREFIX, &ip.to_string());
        match self.cache_get(&key).await {
            Ok(Some(info)) => return info,
            Ok(None) => {}
            Err(e) => debug!("Geo cache read failed for {}: {}", ip, e),
        }

        let info = self.lookup(ip);
        if let Err(e) = self.cache_set(&key, &info).await {
            debug!("Geo cache write failed for {}: {}", ip, e);
        }
        info
    }

    async fn cache_get(&self, key: &str) -> Result<Option<GeoInfo>, redis::RedisError> {
        let mut conn = self.redis_client.get_async_connection().await?;
        let cached: Option<String> = redis::cmd("GET")
            .arg(key)
            .query_async::<_, Option<String>>(&mut conn)
            .await?;
        Ok(cached.and_then(|json| serde_json::from_str(&json).ok()))
    }

    async fn cache_set(&self, key: &str, info: &GeoInfo) -> Result<(), redis::RedisError> {
        let json = match serde_json::to_string(info) {
            Ok(json) => json,
            Err(_) => return Ok(()),
        };
        let mut conn = self.redis_client.get_async_connection().await?;
        let _: () = redis::cmd("SETEX")
            .arg(key)
            .arg(self.cache_ttl_seconds)
            .arg(json)
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn disabled_service() -> GeoService {
        let client = redis::Client::open("redis://127.0.0.1:6379").unwrap();
        GeoService::new(client, None, 86_400)
    }

    #[test]
    fn test_disabled_without_database() {
        let service = disabled_service();
        assert!(!service.is_enabled());
        assert_eq!(service.lookup("203.0.113.77".parse().unwrap()), GeoInfo::default());
    }

    #[test]
    fn test_unreadable_database_degrades() {
        let client = redis::Client::open("redis://127.0.0.1:6379").unwrap();
        let service = GeoService::new(client, Some("/nonexistent/GeoLite2-City.mmdb"), 86_400);
        assert!(!service.is_enabled());
    }

    #[test]
    fn test_private_ips_are_skipped() {
        let service = disabled_service();
        assert_eq!(service.lookup("192.168.1.10".parse().unwrap()), GeoInfo::default());
        assert_eq!(service.lookup("127.0.0.1".parse().unwrap()), GeoInfo::default());
    }

    #[tokio::test]
    async fn test_cached_lookup_short_circuits_when_disabled() {
        // No database loaded: the cache (and thus redis) is never touched,
        // so this works without a running redis instance.
        let service = disabled_service();
        let info = service.lookup_cached("203.0.113.77".parse().unwrap()).await;
        assert_eq!(info, GeoInfo::default());
    }
}
