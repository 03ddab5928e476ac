//! Request tracking middleware.
//!
//! Runs ahead of every route: resolves the client IP, optionally anonymizes
//! it, rejects blocklisted IPs with 403, attaches cached geolocation, and
//! appends a request log entry. Log-append and lookup failures are swallowed
//! so tracking can never take a route down.

use std::future::{ready, Ready};
use std::net::{IpAddr, Ipv4Addr};
use std::rc::Rc;
use std::sync::Arc;

use actix_web::body::EitherBody;
use actix_web::dev::{forward_ready, Service, ServiceRequest, ServiceResponse, Transform};
use actix_web::{Error, HttpMessage, HttpResponse};
use futures::future::LocalBoxFuture;
use log::{error, warn};

use crate::core::{BlocklistStore, GeoService, RequestLogStore};
use crate::models::{Config, RequestLogEntry, UserId};
use crate::utils::{anonymize_ip, parse_client_ip};

/// Shared state for the tracking middleware
pub struct TrackingState {
    /// Blocklist consulted on every request
    pub blocklist: Arc<BlocklistStore>,
    /// Destination of the request log entries
    pub request_logs: Arc<RequestLogStore>,
    /// Geolocation service
    pub geo: Arc<GeoService>,
    /// Application configuration
    pub config: Arc<Config>,
}

/// Middleware factory
pub struct IpTracking {
    state: Arc<TrackingState>,
}

impl IpTracking {
    /// Create the middleware factory
    pub fn new(state: Arc<TrackingState>) -> Self {
        Self { state }
    }
}

impl<S, B> Transform<S, ServiceRequest> for IpTracking
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    B: 'static,
{
    type Response = ServiceResponse<EitherBody<B>>;
    type Error = Error;
    type Transform = IpTrackingMiddleware<S>;
    type InitError = ();
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ready(Ok(IpTrackingMiddleware {
            service: Rc::new(service),
            state: Arc::clone(&self.state),
        }))
    }
}

/// Middleware service
pub struct IpTrackingMiddleware<S> {
    service: Rc<S>,
    state: Arc<TrackingState>,
}

impl<S, B> Service<ServiceRequest> for IpTrackingMiddleware<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    B: 'static,
{
    type Response = ServiceResponse<EitherBody<B>>;
    type Error = Error;
    type Future = LocalBoxFuture<'static, Result<Self::Response, Self::Error>>;

    forward_ready!(service);

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let service = Rc::clone(&self.service);
        let state = Arc::clone(&self.state);

        Box::pin(async move {
            let path = req.path().to_string();
            if state
                .config
                .tracking
                .skip_paths
                .iter()
                .any(|prefix| path.starts_with(prefix.as_str()))
            {
                return service
                    .call(req)
                    .await
                    .map(ServiceResponse::map_into_left_body);
            }

            let mut ip = {
                let info = req.connection_info();
                info.realip_remote_addr()
                    .and_then(parse_client_ip)
                    .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED))
            };
            if state.config.tracking.anonymize_ip {
                ip = anonymize_ip(ip);
            }
            let ip_str = ip.to_string();

            // A Redis outage must not take every route down: lookup
            // failures fail open.
            match state.blocklist.is_blocked(&ip_str).await {
                Ok(true) => {
                    warn!("Blocked IP attempt: {} accessing {}", ip_str, path);
                    metrics::increment_counter!("blocked_requests_total");
                    let response = HttpResponse::Forbidden()
                        .body("Forbidden: your IP address has been blocked.")
                        .map_into_right_body();
                    return Ok(req.into_response(response));
                }
                Ok(false) => {}
                Err(e) => error!("Blocklist check failed for {}: {}", ip_str, e),
            }

            let geo = state.geo.lookup_cached(ip).await;

            let mut entry =
                RequestLogEntry::new(ip_str, path, req.method().to_string());
            entry.country = geo.country;
            entry.city = geo.city;
            entry.user_id = req
                .extensions()
                .get::<UserId>()
                .map(|user| user.0.clone());

            if let Err(e) = state.request_logs.append(&entry).await {
                error!("Failed to log request: {}", e);
            } else {
                metrics::increment_counter!("requests_logged_total");
            }

            service
                .call(req)
                .await
                .map(ServiceResponse::map_into_left_body)
        })
    }
}
