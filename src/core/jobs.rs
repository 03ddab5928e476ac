//! Scheduled jobs for the IP tracking service.
//!
//! Two batch jobs run on fixed schedules: `detect_suspicious_ips` (hourly)
//! reads the trailing request window, applies the rule passes and the
//! anomaly scorer, and upserts its findings; `cleanup_old_logs` (daily)
//! enforces the retention window on the request log.
//!
//! Each job takes a Redis advisory lock keyed by its name, so an overrun
//! invocation never overlaps the next one. Per-IP store failures are logged
//! and skipped; a batch is never aborted half-way, and neither job ever
//! propagates a failure that would stop the scheduler.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use log::{error, info, warn};
use redis::Client as RedisClient;

use crate::core::anomaly::{extract_features, AnomalyScorer};
use crate::core::detector::{Flag, RuleEvaluator};
use crate::core::{RequestLogStore, SuspiciousIpStore};
use crate::models::Config;
use crate::utils::format_key;

/// Prefix of the advisory lock keys
const JOB_LOCK_PREFIX: &str = "job_lock";

/// Name of the detection job
pub const DETECT_JOB_NAME: &str = "detect_suspicious_ips";
/// Name of the retention job
pub const CLEANUP_JOB_NAME: &str = "cleanup_old_logs";

/// Executes the scheduled jobs against the stores
pub struct JobRunner {
    /// Redis client (advisory locks)
    redis_client: RedisClient,
    /// Request log store
    request_logs: Arc<RequestLogStore>,
    /// Suspicious-IP store
    suspicious: Arc<SuspiciousIpStore>,
    /// Rule evaluator
    evaluator: RuleEvaluator,
    /// Anomaly scorer strategy
    scorer: Arc<dyn AnomalyScorer>,
    /// Application configuration
    config: Arc<Config>,
}

impl JobRunner {
    /// Create a new job runner
    pub fn new(
        redis_client: RedisClient,
        request_logs: Arc<RequestLogStore>,
        suspicious: Arc<SuspiciousIpStore>,
        scorer: Arc<dyn AnomalyScorer>,
        config: Arc<Config>,
    ) -> Self {
        Self {
            redis_client,
            request_logs,
            suspicious,
            evaluator: RuleEvaluator::new(config.detection.clone()),
            scorer,
            config,
        }
    }

    /// Run the detection job once
    ///
    /// # Returns
    ///
    /// A human-readable summary of the run.
    pub async fn detect_suspicious_ips(&self) -> Result<String> {
        if !self.acquire_lock(DETECT_JOB_NAME).await? {
            warn!("Skipping {}: another run holds the lock", DETECT_JOB_NAME);
            return Ok(format!("Skipped {}: already running", DETECT_JOB_NAME));
        }

        let result = self.run_detection().await;
        self.release_lock(DETECT_JOB_NAME).await;
        result
    }

    async fn run_detection(&self) -> Result<String> {
        let cutoff =
            Utc::now() - chrono::Duration::seconds(self.config.detection.window_seconds as i64);
        let entries = self.request_logs.entries_since(cutoff).await?;

        if entries.is_empty() {
            info!("No recent logs to analyze");
            return Ok("No logs to analyze".to_string());
        }

        let mut flagged = 0;

        // Rule passes first: volume, then sensitive paths
        flagged += self.apply_flags(&self.evaluator.evaluate(&entries)).await;

        // ML pass last, so its reason wins for IPs the rules also caught.
        // Scoring cost grows with the number of distinct IPs; bound it.
        let features = extract_features(&entries, &self.config.detection.sensitive_paths);
        let scorer = Arc::clone(&self.scorer);
        let scoring =
            tokio::task::spawn_blocking(move || scorer.score(&features));
        match tokio::time::timeout(
            Duration::from_secs(self.config.anomaly.timeout_seconds),
            scoring,
        )
        .await
        {
            Ok(Ok(Ok(flags))) => {
                for flag in &flags {
                    info!("ML flagged IP {} as anomalous", flag.ip_address);
                }
                flagged += self.apply_flags(&flags).await;
            }
            Ok(Ok(Err(e))) => warn!("Anomaly scoring failed, continuing without it: {}", e),
            Ok(Err(e)) => error!("Anomaly scoring task panicked: {}", e),
            Err(_) => warn!(
                "Anomaly scoring timed out after {}s, continuing without it",
                self.config.anomaly.timeout_seconds
            ),
        }

        metrics::counter!("suspicious_ips_flagged_total", flagged);
        info!("Detection completed. Flagged {} suspicious IP(s).", flagged);
        Ok(format!("Flagged {} suspicious IP(s)", flagged))
    }

    /// Run the retention sweep once
    ///
    /// # Returns
    ///
    /// A human-readable summary of the run.
    pub async fn cleanup_old_logs(&self) -> Result<String> {
        if !self.acquire_lock(CLEANUP_JOB_NAME).await? {
            warn!("Skipping {}: another run holds the lock", CLEANUP_JOB_NAME);
            return Ok(format!("Skipped {}: already running", CLEANUP_JOB_NAME));
        }

        let retention_days = self.config.retention.retention_days;
        let cutoff = Utc::now() - chrono::Duration::days(retention_days as i64);
        let result = self.request_logs.delete_older_than(cutoff).await;
        self.release_lock(CLEANUP_JOB_NAME).await;

        let deleted = result?;
        info!(
            "Cleaned up {} old request logs (older than {} days)",
            deleted, retention_days
        );
        Ok(format!("Deleted {} old logs", deleted))
    }

    /// Upsert a batch of flags, one IP at a time
    ///
    /// A store failure for one IP is logged and skipped; the rest of the
    /// batch still goes through.
    async fn apply_flags(&self, flags: &[Flag]) -> u64 {
        let mut applied = 0;
        for flag in flags {
            match self
                .suspicious
                .upsert(&flag.ip_address, &flag.reason, flag.request_count)
                .await
            {
                Ok(()) => {
                    applied += 1;
                    info!("Flagged IP {}: {}", flag.ip_address, flag.reason);
                }
                Err(e) => error!("Failed to flag IP {}: {}", flag.ip_address, e),
            }
        }
        applied
    }

    async fn acquire_lock(&self, job_name: &str) -> Result<bool> {
        let mut conn = self.redis_client.get_async_connection().await?;

        let acquired: Option<String> = redis::cmd("SET")
            .arg(format_key(JOB_LOCK_PREFIX, job_name))
            .arg(Utc::now().to_rfc3339())
            .arg("NX")
            .arg("EX")
            .arg(self.config.jobs.lock_ttl_seconds)
            .query_async::<_, Option<String>>(&mut conn)
            .await?;

        Ok(acquired.is_some())
    }

    async fn release_lock(&self, job_name: &str) {
        let key = format_key(JOB_LOCK_PREFIX, job_name);
        match self.redis_client.get_async_connection().await {
            Ok(mut conn) => {
                let released: Result<(), redis::RedisError> = redis::cmd("DEL")
                    .arg(&key)
                    .query_async::<_, ()>(&mut conn)
                    .await;
                if let Err(e) = released {
                    error!("Failed to release lock {}: {}", key, e);
                }
            }
            Err(e) => error!("Failed to release lock {}: {}", key, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::anomaly::{MockAnomalyScorer, NoopScorer};
    use crate::models::RequestLogEntry;
    use redis::Client;

    fn test_client() -> Client {
        Client::open("redis://127.0.0.1:6379").unwrap()
    }

    fn runner(scorer: Arc<dyn AnomalyScorer>) -> JobRunner {
        let client = test_client();
        JobRunner::new(
            client.clone(),
            Arc::new(RequestLogStore::new(client.clone())),
            Arc::new(SuspiciousIpStore::new(client)),
            scorer,
            Arc::new(Config::default()),
        )
    }

    async fn seed_requests(store: &RequestLogStore, ip: &str, path: &str, n: usize) {
        for _ in 0..n {
            let entry =
                RequestLogEntry::new(ip.to_string(), path.to_string(), "GET".to_string());
            store.append(&entry).await.unwrap();
        }
    }

    #[tokio::test]
    #[ignore = "requires a local redis at 127.0.0.1:6379"]
    async fn test_detection_run_is_idempotent() {
        let runner = runner(Arc::new(NoopScorer));
        let ip = "198.51.100.61";
        runner.request_logs.clear().await.unwrap();
        runner.suspicious.remove(ip).await.unwrap();

        seed_requests(&runner.request_logs, ip, "/home", 101).await;

        let summary = runner.detect_suspicious_ips().await.unwrap();
        assert_eq!(summary, "Flagged 1 suspicious IP(s)");
        let first = runner.suspicious.get(ip).await.unwrap().unwrap();
        assert_eq!(first.request_count, 101);

        // Unchanged window, second run: same single entry, updated in place
        let summary = runner.detect_suspicious_ips().await.unwrap();
        assert_eq!(summary, "Flagged 1 suspicious IP(s)");
        let second = runner.suspicious.get(ip).await.unwrap().unwrap();
        assert_eq!(second.flagged_at, first.flagged_at);
        assert!(second.last_seen >= first.last_seen);

        runner.request_logs.clear().await.unwrap();
        runner.suspicious.remove(ip).await.unwrap();
    }

    #[tokio::test]
    #[ignore = "requires a local redis at 127.0.0.1:6379"]
    async fn test_ml_reason_overwrites_rule_reason() {
        let ip = "198.51.100.62";
        let mut scorer = MockAnomalyScorer::new();
        scorer.expect_name().return_const("mock");
        let flag = Flag {
            ip_address: ip.to_string(),
            reason: "ML-detected anomaly: 120 requests, 1 unique paths, 0 sensitive path accesses"
                .to_string(),
            request_count: 120,
        };
        scorer
            .expect_score()
            .returning(move |_| Ok(vec![flag.clone()]));

        let runner = runner(Arc::new(scorer));
        runner.request_logs.clear().await.unwrap();
        runner.suspicious.remove(ip).await.unwrap();

        seed_requests(&runner.request_logs, ip, "/home", 120).await;

        let summary = runner.detect_suspicious_ips().await.unwrap();
        assert_eq!(summary, "Flagged 2 suspicious IP(s)");

        // Both the volume rule and the scorer flagged the IP; the scorer
        // ran last, so its reason is the one stored.
        let entry = runner.suspicious.get(ip).await.unwrap().unwrap();
        assert!(entry.reason.starts_with("ML-detected anomaly"));

        runner.request_logs.clear().await.unwrap();
        runner.suspicious.remove(ip).await.unwrap();
    }

    #[tokio::test]
    #[ignore = "requires a local redis at 127.0.0.1:6379"]
    async fn test_empty_window_is_a_noop() {
        let runner = runner(Arc::new(NoopScorer));
        runner.request_logs.clear().await.unwrap();

        let summary = runner.detect_suspicious_ips().await.unwrap();
        assert_eq!(summary, "No logs to analyze");
    }
}
