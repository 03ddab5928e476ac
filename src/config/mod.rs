//! Configuration management for the IP tracking service.
//!
//! This module handles loading and managing application configuration
//! from environment variables and configuration files.

use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use std::env;

use crate::models::Config;

/// Load configuration from the config file and environment variables
///
/// Every key has a coded default, so a missing file yields a fully usable
/// configuration.
pub fn load_config() -> Result<Config, ConfigError> {
    let config_file = env::var("CONFIG_FILE").unwrap_or_else(|_| "config/default.toml".to_string());

    let config = ConfigBuilder::builder()
        .add_source(File::with_name(&config_file).required(false))
        .add_source(Environment::default())
        .set_default("server.host", "127.0.0.1")?
        .set_default("server.port", 8080)?
        .set_default("redis.url", "redis://127.0.0.1:6379")?
        .set_default("redis.pool_size", 10)?
        .set_default("detection.window_seconds", 3600)?
        .set_default("detection.volume_threshold", 100)?
        .set_default("detection.sensitive_access_threshold", 10)?
        .set_default(
            "detection.sensitive_paths",
            vec!["/admin", "/login", "/api/admin", "/api/login"],
        )?
        .set_default("anomaly.enabled", true)?
        .set_default("anomaly.contamination", 0.05)?
        .set_default("anomaly.random_seed", 42)?
        .set_default("anomaly.num_trees", 100)?
        .set_default("anomaly.timeout_seconds", 30)?
        .set_default("retention.retention_days", 90)?
        .set_default("tracking.anonymize_ip", false)?
        .set_default(
            "tracking.skip_paths",
            vec!["/static/", "/media/", "/favicon.ico", "/health"],
        )?
        .set_default("tracking.geo_cache_ttl_seconds", 86_400)?
        .set_default("jobs.scheduler_enabled", true)?
        .set_default("jobs.detect_interval_seconds", 3600)?
        .set_default("jobs.cleanup_interval_seconds", 86_400)?
        .set_default("jobs.lock_ttl_seconds", 3600)?
        .build()?;

    config.try_deserialize()
}
