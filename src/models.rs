use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use crate::core::DetectionConfig;

/// Redis configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    /// Redis connection URL
    pub url: String,
    /// Redis connection pool size
    pub pool_size: u32,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Server host
    pub host: String,
    /// Server port
    pub port: u16,
}

/// Anomaly scorer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnomalyConfig {
    /// Whether ML-based scoring is enabled
    pub enabled: bool,
    /// Expected proportion of anomalous IPs in a window
    pub contamination: f64,
    /// Seed for the forest's random number generator
    pub random_seed: u64,
    /// Number of isolation trees
    pub num_trees: usize,
    /// Upper bound on scoring time per run (seconds)
    pub timeout_seconds: u64,
}

impl Default for AnomalyConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            contamination: 0.05,
            random_seed: 42,
            num_trees: 100,
            timeout_seconds: 30,
        }
    }
}

/// Request log retention configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionConfig {
    /// Maximum age of a request log entry in days
    pub retention_days: u64,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self { retention_days: 90 }
    }
}

/// Request tracking configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackingConfig {
    /// Whether to anonymize client IPs before storage
    pub anonymize_ip: bool,
    /// Path prefixes excluded from logging
    pub skip_paths: Vec<String>,
    /// Path to a MaxMind city database, if geolocation is wanted
    pub geoip_city_db: Option<String>,
    /// Geolocation cache TTL in seconds
    pub geo_cache_ttl_seconds: u64,
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            anonymize_ip: false,
            skip_paths: vec![
                "/static/".to_string(),
                "/media/".to_string(),
                "/favicon.ico".to_string(),
                "/health".to_string(),
            ],
            geoip_city_db: None,
            geo_cache_ttl_seconds: 86_400,
        }
    }
}

/// Scheduled jobs configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobsConfig {
    /// Whether the in-process scheduler runs the jobs on an interval
    pub scheduler_enabled: bool,
    /// Seconds between detection runs
    pub detect_interval_seconds: u64,
    /// Seconds between retention sweeps
    pub cleanup_interval_seconds: u64,
    /// TTL of the per-job advisory lock in seconds
    pub lock_ttl_seconds: u64,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            scheduler_enabled: true,
            detect_interval_seconds: 3_600,
            cleanup_interval_seconds: 86_400,
            lock_ttl_seconds: 3_600,
        }
    }
}

/// Application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Server configuration
    pub server: ServerConfig,
    /// Redis configuration
    pub redis: RedisConfig,
    /// Detection rule configuration
    pub detection: DetectionConfig,
    /// Anomaly scorer configuration
    pub anomaly: AnomalyConfig,
    /// Retention configuration
    pub retention: RetentionConfig,
    /// Tracking configuration
    pub tracking: TrackingConfig,
    /// Jobs configuration
    pub jobs: JobsConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8080,
            },
            redis: RedisConfig {
                url: "redis://127.0.0.1:6379".to_string(),
                pool_size: 10,
            },
            detection: DetectionConfig::default(),
            anomaly: AnomalyConfig::default(),
            retention: RetentionConfig::default(),
            tracking: TrackingConfig::default(),
            jobs: JobsConfig::default(),
        }
    }
}

/// A single logged request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestLogEntry {
    /// Record ID
    pub id: String,
    /// Client IP address
    pub ip_address: String,
    /// Request path
    pub path: String,
    /// HTTP method
    pub method: String,
    /// When the request was received
    pub timestamp: DateTime<Utc>,
    /// Country from geolocation
    pub country: Option<String>,
    /// City from geolocation
    pub city: Option<String>,
    /// Authenticated user if available
    pub user_id: Option<String>,
}

impl RequestLogEntry {
    /// Create an entry timestamped now
    pub fn new(ip_address: String, path: String, method: String) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            ip_address,
            path,
            method,
            timestamp: Utc::now(),
            country: None,
            city: None,
            user_id: None,
        }
    }
}

/// An explicitly banned IP
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockedIp {
    /// Banned IP address
    pub ip_address: String,
    /// Reason for blocking
    pub reason: Option<String>,
    /// When the IP was blocked
    pub created_at: DateTime<Utc>,
    /// Who blocked it
    pub created_by: Option<String>,
}

/// An IP flagged by the detection job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuspiciousIp {
    /// Flagged IP address
    pub ip_address: String,
    /// Reason for flagging (overwritten on re-flag)
    pub reason: String,
    /// When the IP was first flagged
    pub flagged_at: DateTime<Utc>,
    /// Last time a detection run re-flagged this IP
    pub last_seen: DateTime<Utc>,
    /// Request count observed in the flagging window
    pub request_count: i64,
}

/// User identity attached to a request by an upstream auth layer
#[derive(Debug, Clone)]
pub struct UserId(pub String);

impl redis::FromRedisValue for RequestLogEntry {
    fn from_redis_value(v: &redis::Value) -> redis::RedisResult<Self> {
        let str_value: String = redis::FromRedisValue::from_redis_value(v)?;
        serde_json::from_str(&str_value)
            .map_err(|e| redis::RedisError::from((
                redis::ErrorKind::TypeError,
                "Failed to parse RequestLogEntry from JSON",
                e.to_string(),
            )))
    }
}

impl redis::FromRedisValue for BlockedIp {
    fn from_redis_value(v: &redis::Value) -> redis::RedisResult<Self> {
        let str_value: String = redis::FromRedisValue::from_redis_value(v)?;
        serde_json::from_str(&str_value)
            .map_err(|e| redis::RedisError::from((
                redis::ErrorKind::TypeError,
                "Failed to parse BlockedIp from JSON",
                e.to_string(),
            )))
    }
}
