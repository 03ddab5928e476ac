//! Rule-based detection for the IP tracking service.
//!
//! This module implements the two rule passes a detection run applies to
//! the trailing request window: a per-IP volume threshold and a
//! sensitive-path access threshold. Both passes are pure functions over the
//! in-memory window; applying the resulting flags to storage is the job's
//! responsibility.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::core::DetectionConfig;
use crate::models::RequestLogEntry;

/// A single detection finding, ready to be upserted
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Flag {
    /// Flagged IP address
    pub ip_address: String,
    /// Human-readable reason
    pub reason: String,
    /// Request count backing the finding
    pub request_count: i64,
}

/// Rule evaluator over one detection window
pub struct RuleEvaluator {
    /// Detection thresholds and the sensitive-path list
    config: DetectionConfig,
}

impl RuleEvaluator {
    /// Create a new rule evaluator
    pub fn new(config: DetectionConfig) -> Self {
        Self { config }
    }

    /// Run both rule passes over the window
    ///
    /// # Arguments
    ///
    /// * `entries` - Every request log entry in the trailing window
    ///
    /// # Returns
    ///
    /// Volume flags followed by sensitive-path flags. The caller applies
    /// them in order, so when both rules match the same IP the
    /// sensitive-path reason wins.
    pub fn evaluate(&self, entries: &[RequestLogEntry]) -> Vec<Flag> {
        let mut flags = self.volume_flags(entries);
        flags.extend(self.sensitive_path_flags(entries));
        flags
    }

    /// Flag every IP with more than `volume_threshold` requests in the window
    pub fn volume_flags(&self, entries: &[RequestLogEntry]) -> Vec<Flag> {
        let mut counts: HashMap<&str, u64> = HashMap::new();
        for entry in entries {
            *counts.entry(entry.ip_address.as_str()).or_insert(0) += 1;
        }

        let mut flags: Vec<Flag> = counts
            .into_iter()
            .filter(|(_, count)| *count > self.config.volume_threshold)
            .map(|(ip, count)| Flag {
                ip_address: ip.to_string(),
                reason: format!(
                    "High request volume: {} requests in the last hour (threshold: {})",
                    count, self.config.volume_threshold
                ),
                request_count: count as i64,
            })
            .collect();

        flags.sort_by(|a, b| a.ip_address.cmp(&b.ip_address));
        flags
    }

    /// Flag every IP with at least `sensitive_access_threshold` accesses to
    /// a sensitive path in the window
    pub fn sensitive_path_flags(&self, entries: &[RequestLogEntry]) -> Vec<Flag> {
        // Per IP: access count plus the distinct paths in first-seen order
        let mut accesses: HashMap<&str, (u64, Vec<&str>)> = HashMap::new();
        for entry in entries {
            if !self.is_sensitive(&entry.path) {
                continue;
            }
            let (count, paths) = accesses.entry(entry.ip_address.as_str()).or_default();
            *count += 1;
            if !paths.contains(&entry.path.as_str()) {
                paths.push(entry.path.as_str());
            }
        }

        let mut flags: Vec<Flag> = accesses
            .into_iter()
            .filter(|(_, (count, _))| *count >= self.config.sensitive_access_threshold)
            .map(|(ip, (count, paths))| Flag {
                ip_address: ip.to_string(),
                reason: format!(
                    "Repeated access to sensitive paths ({} times): {}",
                    count,
                    paths.join(", ")
                ),
                request_count: count as i64,
            })
            .collect();

        flags.sort_by(|a, b| a.ip_address.cmp(&b.ip_address));
        flags
    }

    /// Whether a path counts as sensitive
    pub fn is_sensitive(&self, path: &str) -> bool {
        self.config.sensitive_paths.iter().any(|p| p == path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(ip: &str, path: &str) -> RequestLogEntry {
        RequestLogEntry::new(ip.to_string(), path.to_string(), "GET".to_string())
    }

    fn window(specs: &[(&str, &str, usize)]) -> Vec<RequestLogEntry> {
        let mut entries = Vec::new();
        for (ip, path, n) in specs {
            for _ in 0..*n {
                entries.push(entry(ip, path));
            }
        }
        entries
    }

    fn evaluator() -> RuleEvaluator {
        RuleEvaluator::new(DetectionConfig::default())
    }

    #[test]
    fn test_volume_threshold_is_exclusive() {
        let entries = window(&[("10.0.0.1", "/home", 101), ("10.0.0.2", "/home", 100)]);
        let flags = evaluator().volume_flags(&entries);

        assert_eq!(flags.len(), 1);
        assert_eq!(flags[0].ip_address, "10.0.0.1");
        assert_eq!(flags[0].request_count, 101);
        assert_eq!(
            flags[0].reason,
            "High request volume: 101 requests in the last hour (threshold: 100)"
        );
    }

    #[test]
    fn test_sensitive_threshold_is_inclusive() {
        let entries = window(&[("10.0.0.1", "/admin", 10), ("10.0.0.2", "/admin", 9)]);
        let flags = evaluator().sensitive_path_flags(&entries);

        assert_eq!(flags.len(), 1);
        assert_eq!(flags[0].ip_address, "10.0.0.1");
        assert_eq!(flags[0].request_count, 10);
    }

    #[test]
    fn test_high_volume_on_ordinary_paths_only() {
        // 150 requests to /home: volume rule fires, sensitive rule does not
        let entries = window(&[("10.0.0.5", "/home", 150)]);
        let evaluator = evaluator();

        let volume = evaluator.volume_flags(&entries);
        assert_eq!(volume.len(), 1);
        assert!(volume[0].reason.contains("150 requests"));

        assert!(evaluator.sensitive_path_flags(&entries).is_empty());
    }

    #[test]
    fn test_sensitive_access_below_volume_threshold() {
        // 12 requests to /admin: sensitive rule fires, volume rule does not
        let entries = window(&[("10.0.0.6", "/admin", 12)]);
        let evaluator = evaluator();

        assert!(evaluator.volume_flags(&entries).is_empty());

        let sensitive = evaluator.sensitive_path_flags(&entries);
        assert_eq!(sensitive.len(), 1);
        assert_eq!(sensitive[0].request_count, 12);
        assert_eq!(
            sensitive[0].reason,
            "Repeated access to sensitive paths (12 times): /admin"
        );
    }

    #[test]
    fn test_sensitive_paths_listed_in_first_seen_order() {
        let mut entries = window(&[("10.0.0.7", "/login", 6)]);
        entries.extend(window(&[("10.0.0.7", "/admin", 5)]));
        let flags = evaluator().sensitive_path_flags(&entries);

        assert_eq!(flags.len(), 1);
        assert_eq!(
            flags[0].reason,
            "Repeated access to sensitive paths (11 times): /login, /admin"
        );
    }

    #[test]
    fn test_empty_window_produces_no_flags() {
        assert!(evaluator().evaluate(&[]).is_empty());
    }

    #[test]
    fn test_evaluate_orders_volume_before_sensitive() {
        let mut entries = window(&[("10.0.0.8", "/admin", 150)]);
        entries.extend(window(&[("10.0.0.9", "/home", 120)]));
        let flags = evaluator().evaluate(&entries);

        // 10.0.0.8 trips both rules; its sensitive-path flag comes later so
        // the sensitive-path reason is the one that sticks after upserts.
        assert_eq!(flags.len(), 3);
        assert!(flags[0].reason.starts_with("High request volume"));
        assert!(flags[1].reason.starts_with("High request volume"));
        assert!(flags[2].reason.starts_with("Repeated access"));
        assert_eq!(flags[2].ip_address, "10.0.0.8");
    }

    #[test]
    fn test_api_prefixed_variants_are_sensitive() {
        let evaluator = evaluator();
        assert!(evaluator.is_sensitive("/admin"));
        assert!(evaluator.is_sensitive("/api/login"));
        assert!(!evaluator.is_sensitive("/api/properties"));
        assert!(!evaluator.is_sensitive("/admin/users"));
    }
}
