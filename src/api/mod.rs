//! API endpoints for the IP tracking service.
//!
//! This module provides HTTP endpoints for inspecting the request log, the
//! suspicious-IP findings and the blocklist, managing blocklist entries,
//! and triggering the scheduled jobs manually.

use std::net::IpAddr;
use std::sync::Arc;

use actix_web::{web, HttpResponse, Responder};
use log::error;
use serde::{Deserialize, Serialize};

use crate::core::{BlocklistStore, JobRunner, RequestLogStore, SuspiciousIpStore};

/// Default number of log entries returned by the logs endpoint
const DEFAULT_LOG_LIMIT: usize = 50;

/// Shared API state
pub struct ApiState {
    /// Request log store
    pub request_logs: Arc<RequestLogStore>,
    /// Suspicious-IP store
    pub suspicious: Arc<SuspiciousIpStore>,
    /// Blocklist store
    pub blocklist: Arc<BlocklistStore>,
    /// Job runner for manual triggers
    pub jobs: Arc<JobRunner>,
}

/// API configuration function for Actix-web
pub fn config(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/api/v1")
            .service(web::resource("/health").route(web::get().to(health_check)))
            .service(web::resource("/logs").route(web::get().to(list_logs)))
            .service(web::resource("/suspicious").route(web::get().to(list_suspicious)))
            .service(
                web::resource("/blocked")
                    .route(web::get().to(list_blocked))
                    .route(web::post().to(block_ip)),
            )
            .service(web::resource("/blocked/{ip}").route(web::delete().to(unblock_ip)))
            .service(web::resource("/jobs/detect").route(web::post().to(run_detection)))
            .service(web::resource("/jobs/cleanup").route(web::post().to(run_cleanup))),
    );
}

/// Health check endpoint response
#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

/// Logs listing query parameters
#[derive(Debug, Deserialize)]
pub struct LogsQuery {
    /// Maximum number of entries to return
    pub limit: Option<usize>,
}

/// Blocklist creation request
#[derive(Debug, Serialize, Deserialize)]
pub struct BlockRequest {
    /// IP address to block (IPv4 or IPv6)
    pub ip_address: String,
    /// Reason for blocking this IP
    pub reason: Option<String>,
    /// Who is blocking it
    pub created_by: Option<String>,
}

/// Generic outcome response
#[derive(Serialize)]
struct OutcomeResponse {
    message: String,
}

/// Job trigger response
#[derive(Serialize)]
struct JobResponse {
    result: String,
}

/// Health check endpoint
async fn health_check() -> impl Responder {
    HttpResponse::Ok().json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Recent request log entries, newest first
async fn list_logs(state: web::Data<ApiState>, query: web::Query<LogsQuery>) -> impl Responder {
    let limit = query.limit.unwrap_or(DEFAULT_LOG_LIMIT);
    match state.request_logs.recent(limit).await {
        Ok(entries) => HttpResponse::Ok().json(entries),
        Err(e) => {
            error!("Failed to list request logs: {}", e);
            HttpResponse::InternalServerError().json(OutcomeResponse {
                message: "Failed to list request logs".to_string(),
            })
        }
    }
}

/// All flagged IPs, most recently flagged first
async fn list_suspicious(state: web::Data<ApiState>) -> impl Responder {
    match state.suspicious.list().await {
        Ok(entries) => HttpResponse::Ok().json(entries),
        Err(e) => {
            error!("Failed to list suspicious IPs: {}", e);
            HttpResponse::InternalServerError().json(OutcomeResponse {
                message: "Failed to list suspicious IPs".to_string(),
            })
        }
    }
}

/// All blocked IPs
async fn list_blocked(state: web::Data<ApiState>) -> impl Responder {
    match state.blocklist.list().await {
        Ok(entries) => HttpResponse::Ok().json(entries),
        Err(e) => {
            error!("Failed to list blocked IPs: {}", e);
            HttpResponse::InternalServerError().json(OutcomeResponse {
                message: "Failed to list blocked IPs".to_string(),
            })
        }
    }
}

/// Add an IP to the blocklist
async fn block_ip(state: web::Data<ApiState>, req: web::Json<BlockRequest>) -> impl Responder {
    if req.ip_address.parse::<IpAddr>().is_err() {
        return HttpResponse::BadRequest().json(OutcomeResponse {
            message: format!("Not a valid IP address: {}", req.ip_address),
        });
    }

    match state
        .blocklist
        .block(&req.ip_address, req.reason.clone(), req.created_by.clone())
        .await
    {
        Ok(true) => HttpResponse::Created().json(OutcomeResponse {
            message: format!("Blocked IP {}", req.ip_address),
        }),
        Ok(false) => HttpResponse::Ok().json(OutcomeResponse {
            message: format!("IP {} is already blocked", req.ip_address),
        }),
        Err(e) => {
            error!("Failed to block IP {}: {}", req.ip_address, e);
            HttpResponse::InternalServerError().json(OutcomeResponse {
                message: "Failed to block IP".to_string(),
            })
        }
    }
}

/// Remove an IP from the blocklist
async fn unblock_ip(state: web::Data<ApiState>, path: web::Path<String>) -> impl Responder {
    let ip = path.into_inner();
    match state.blocklist.unblock(&ip).await {
        Ok(true) => HttpResponse::Ok().json(OutcomeResponse {
            message: format!("Unblocked IP {}", ip),
        }),
        Ok(false) => HttpResponse::NotFound().json(OutcomeResponse {
            message: format!("IP {} is not blocked", ip),
        }),
        Err(e) => {
            error!("Failed to unblock IP {}: {}", ip, e);
            HttpResponse::InternalServerError().json(OutcomeResponse {
                message: "Failed to unblock IP".to_string(),
            })
        }
    }
}

/// Trigger the detection job now
async fn run_detection(state: web::Data<ApiState>) -> impl Responder {
    match state.jobs.detect_suspicious_ips().await {
        Ok(summary) => HttpResponse::Ok().json(JobResponse { result: summary }),
        Err(e) => {
            error!("Detection job failed: {}", e);
            HttpResponse::InternalServerError().json(OutcomeResponse {
                message: "Detection job failed".to_string(),
            })
        }
    }
}

/// Trigger the retention sweep now
async fn run_cleanup(state: web::Data<ApiState>) -> impl Responder {
    match state.jobs.cleanup_old_logs().await {
        Ok(summary) => HttpResponse::Ok().json(JobResponse { result: summary }),
        Err(e) => {
            error!("Cleanup job failed: {}", e);
            HttpResponse::InternalServerError().json(OutcomeResponse {
                message: "Cleanup job failed".to_string(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::NoopScorer;
    use crate::models::Config;
    use actix_web::{test, App};
    use redis::Client;

    fn state() -> web::Data<ApiState> {
        let client = Client::open("redis://127.0.0.1:6379").unwrap();
        let request_logs = Arc::new(RequestLogStore::new(client.clone()));
        let suspicious = Arc::new(SuspiciousIpStore::new(client.clone()));
        let jobs = Arc::new(JobRunner::new(
            client.clone(),
            Arc::clone(&request_logs),
            Arc::clone(&suspicious),
            Arc::new(NoopScorer),
            Arc::new(Config::default()),
        ));
        web::Data::new(ApiState {
            request_logs,
            suspicious,
            blocklist: Arc::new(BlocklistStore::new(client)),
            jobs,
        })
    }

    #[actix_web::test]
    async fn test_health_check() {
        let app = test::init_service(App::new().configure(config)).await;

        let req = test::TestRequest::get().uri("/api/v1/health").to_request();
        let resp = test::call_service(&app, req).await;

        assert!(resp.status().is_success());
    }

    #[actix_web::test]
    async fn test_block_rejects_invalid_ip() {
        let app = test::init_service(App::new().app_data(state()).configure(config)).await;

        let req = test::TestRequest::post()
            .uri("/api/v1/blocked")
            .set_json(BlockRequest {
                ip_address: "not-an-ip".to_string(),
                reason: None,
                created_by: None,
            })
            .to_request();
        let resp = test::call_service(&app, req).await;

        assert_eq!(resp.status(), actix_web::http::StatusCode::BAD_REQUEST);
    }

    #[actix_web::test]
    #[ignore = "requires a local redis at 127.0.0.1:6379"]
    async fn test_block_list_unblock_round_trip() {
        let app = test::init_service(App::new().app_data(state()).configure(config)).await;
        let ip = "198.51.100.77";

        let req = test::TestRequest::post()
            .uri("/api/v1/blocked")
            .set_json(BlockRequest {
                ip_address: ip.to_string(),
                reason: Some("api test".to_string()),
                created_by: None,
            })
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), actix_web::http::StatusCode::CREATED);

        let req = test::TestRequest::get().uri("/api/v1/blocked").to_request();
        let resp = test::call_service(&app, req).await;
        assert!(resp.status().is_success());

        let req = test::TestRequest::delete()
            .uri(&format!("/api/v1/blocked/{}", ip))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert!(resp.status().is_success());
    }
}
