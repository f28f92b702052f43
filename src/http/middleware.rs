//! Per-request middleware applied by the engine.
//!
//! # Responsibilities
//! - Track every request as in flight until its response is produced
//! - Tell HTTP/1 clients not to reuse the connection once draining
//! - Enforce the GET-only and per-peer limits from `ServerConfig`

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::{header, HeaderValue, Method, Request, StatusCode, Version},
    middleware::Next,
    response::{IntoResponse, Response},
};
use tokio::sync::Semaphore;

use crate::net::{InFlightTracker, KeepAlivePolicy, PeerLimiter};

/// Bounds concurrently handled requests; excess requests wait for a slot.
pub async fn concurrency_limit(
    State(permits): State<Arc<Semaphore>>,
    request: Request<Body>,
    next: Next,
) -> Response {
    match permits.acquire().await {
        Ok(_permit) => next.run(request).await,
        Err(_) => (StatusCode::SERVICE_UNAVAILABLE, "Server is shutting down").into_response(),
    }
}

pub async fn track_in_flight(
    State(tracker): State<InFlightTracker>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let _guard = tracker.track();
    next.run(request).await
}

/// Adds `Connection: close` when reuse is not allowed.
///
/// HTTP/2 has no connection header; the engine's graceful shutdown sends
/// GOAWAY there instead.
pub async fn keep_alive_policy(
    State(policy): State<KeepAlivePolicy>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let http1 = matches!(request.version(), Version::HTTP_10 | Version::HTTP_11);
    let mut response = next.run(request).await;
    if http1 && !policy.allows_reuse() {
        response
            .headers_mut()
            .insert(header::CONNECTION, HeaderValue::from_static("close"));
    }
    response
}

pub async fn get_only(request: Request<Body>, next: Next) -> Response {
    if request.method() == Method::GET || request.method() == Method::HEAD {
        return next.run(request).await;
    }
    tracing::debug!(method = %request.method(), "Rejected non-GET request");
    (
        StatusCode::METHOD_NOT_ALLOWED,
        [(header::ALLOW, "GET, HEAD")],
    )
        .into_response()
}

pub async fn limit_per_peer(
    State(peers): State<PeerLimiter>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    request: Request<Body>,
    next: Next,
) -> Response {
    match peers.try_acquire(peer.ip()) {
        Some(_permit) => next.run(request).await,
        None => {
            tracing::warn!(peer = %peer.ip(), "Per-peer limit reached");
            (StatusCode::TOO_MANY_REQUESTS, "Too many concurrent requests").into_response()
        }
    }
}
