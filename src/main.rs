//! IP Tracking Service
//!
//! This is the main entry point for the IP tracking service.
//! It initializes the stores, the anomaly scorer, the background job
//! scheduler, and starts the web server with the tracking middleware.

use std::sync::Arc;
use std::time::Duration;

use actix_web::{web, App, HttpServer};
use dotenv::dotenv;
use log::{error, info, warn};
use metrics_exporter_prometheus::PrometheusBuilder;
use redis::Client;

use ip_tracking_service::api::{self, ApiState};
use ip_tracking_service::config;
use ip_tracking_service::core::anomaly::AnomalyScorer;
use ip_tracking_service::core::jobs::{CLEANUP_JOB_NAME, DETECT_JOB_NAME};
use ip_tracking_service::core::{
    BlocklistStore, GeoService, IsolationForestScorer, JobRunner, NoopScorer, RequestLogStore,
    SuspiciousIpStore,
};
use ip_tracking_service::middleware::{IpTracking, TrackingState};
use ip_tracking_service::models::Config;

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    // Load environment variables
    dotenv().ok();

    // Initialize logging
    env_logger::init();

    info!("Starting IP Tracking Service...");

    // Load configuration
    let config = config::load_config().expect("Failed to load configuration");
    let config = Arc::new(config);

    if let Err(e) = PrometheusBuilder::new().install() {
        warn!("Failed to install metrics exporter: {}", e);
    }

    // Initialize Redis client
    let redis_client =
        Client::open(config.redis.url.as_str()).expect("Failed to create Redis client");

    // Initialize stores
    let request_logs = Arc::new(RequestLogStore::new(redis_client.clone()));
    let suspicious = Arc::new(SuspiciousIpStore::new(redis_client.clone()));
    let blocklist = Arc::new(BlocklistStore::new(redis_client.clone()));
    let geo = Arc::new(GeoService::new(
        redis_client.clone(),
        config.tracking.geoip_city_db.as_deref(),
        config.tracking.geo_cache_ttl_seconds,
    ));

    // Pick the anomaly scoring strategy once, at startup
    let scorer: Arc<dyn AnomalyScorer> = if config.anomaly.enabled {
        Arc::new(IsolationForestScorer::new(config.anomaly.clone()))
    } else {
        info!("Anomaly scoring disabled; running rule-based detection only");
        Arc::new(NoopScorer)
    };

    let jobs = Arc::new(JobRunner::new(
        redis_client,
        Arc::clone(&request_logs),
        Arc::clone(&suspicious),
        scorer,
        Arc::clone(&config),
    ));

    if config.jobs.scheduler_enabled {
        spawn_schedulers(Arc::clone(&jobs), Arc::clone(&config));
    }

    let tracking_state = Arc::new(TrackingState {
        blocklist: Arc::clone(&blocklist),
        request_logs: Arc::clone(&request_logs),
        geo,
        config: Arc::clone(&config),
    });

    // Create API state
    let api_state = web::Data::new(ApiState {
        request_logs,
        suspicious,
        blocklist,
        jobs,
    });

    // Start HTTP server
    HttpServer::new(move || {
        App::new()
            .app_data(api_state.clone())
            .wrap(IpTracking::new(Arc::clone(&tracking_state)))
            .configure(api::config)
    })
    .bind((config.server.host.as_str(), config.server.port))?
    .run()
    .await
}

/// Run the two jobs on their configured intervals
fn spawn_schedulers(jobs: Arc<JobRunner>, config: Arc<Config>) {
    let detect_jobs = Arc::clone(&jobs);
    let detect_every = Duration::from_secs(config.jobs.detect_interval_seconds);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(detect_every);
        // The first tick completes immediately; skip it so the first run
        // happens a full interval after startup.
        interval.tick().await;
        loop {
            interval.tick().await;
            match detect_jobs.detect_suspicious_ips().await {
                Ok(summary) => info!("{}: {}", DETECT_JOB_NAME, summary),
                Err(e) => error!("{} failed: {}", DETECT_JOB_NAME, e),
            }
        }
    });

    let cleanup_every = Duration::from_secs(config.jobs.cleanup_interval_seconds);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(cleanup_every);
        interval.tick().await;
        loop {
            interval.tick().await;
            match jobs.cleanup_old_logs().await {
                Ok(summary) => info!("{}: {}", CLEANUP_JOB_NAME, summary),
                Err(e) => error!("{} failed: {}", CLEANUP_JOB_NAME, e),
            }
        }
    });
}
