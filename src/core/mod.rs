//! Core functionality for the IP tracking service.
//!
//! This module contains the core components of the service,
//! including the stores, the rule-based detector, the anomaly scorer,
//! geolocation, and the scheduled jobs.

pub mod request_log;
pub mod blocklist;
pub mod suspicious;
pub mod detector;
pub mod anomaly;
pub mod geo;
pub mod jobs;

use serde::{Deserialize, Serialize};

/// Rule-based detection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionConfig {
    /// Length of the trailing window a detection run looks at (seconds)
    pub window_seconds: u64,
    /// Requests per window above which an IP is flagged (exclusive)
    pub volume_threshold: u64,
    /// Sensitive-path accesses per window at which an IP is flagged (inclusive)
    pub sensitive_access_threshold: u64,
    /// Paths counted as sensitive
    pub sensitive_paths: Vec<String>,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            window_seconds: 3_600,
            volume_threshold: 100,
            sensitive_access_threshold: 10,
            sensitive_paths: vec![
                "/admin".to_string(),
                "/login".to_string(),
                "/api/admin".to_string(),
                "/api/login".to_string(),
            ],
        }
    }
}

pub use request_log::RequestLogStore;
pub use blocklist::BlocklistStore;
pub use suspicious::SuspiciousIpStore;
pub use detector::{Flag, RuleEvaluator};
pub use anomaly::{AnomalyScorer, IsolationForestScorer, NoopScorer};
pub use geo::GeoService;
pub use jobs::JobRunner;
