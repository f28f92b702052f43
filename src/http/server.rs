//! HTTP server setup and configuration.
//!
//! # Responsibilities
//! - Wrap the application router with the engine middleware
//! - Apply `ServerConfig` tuning in one call
//! - Serve on already-opened listeners (fresh or inherited)
//! - Stop accepting, report in-flight work, force-close on demand

use std::net::{SocketAddr, TcpListener};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use axum::{extract::DefaultBodyLimit, middleware, Router};
use axum_server::tls_rustls::RustlsConfig;
use axum_server::Handle;
use hyper_util::rt::TokioExecutor;
use hyper_util::server::conn::auto;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tower_http::{
    limit::RequestBodyLimitLayer,
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};

use crate::config::ServerConfig;
use crate::http::middleware::{
    concurrency_limit, get_only, keep_alive_policy, limit_per_peer, track_in_flight,
};
use crate::net::{InFlightTracker, KeepAlivePolicy, PeerLimiter};

/// hyper rejects HTTP/1 read buffers smaller than this.
const MIN_READ_BUFFER: usize = 8192;

/// The request-serving engine.
pub struct HttpServer {
    app: Router,
    config: ServerConfig,
    tracker: InFlightTracker,
    policy: KeepAlivePolicy,
    peers: PeerLimiter,
    permits: Arc<Semaphore>,
    tls: Option<RustlsConfig>,
    handles: Mutex<Vec<Handle>>,
}

impl HttpServer {
    /// Create an engine for `app` with the default configuration.
    pub fn new(app: Router) -> Self {
        let config = ServerConfig::default();
        Self {
            app,
            tracker: InFlightTracker::new(),
            policy: KeepAlivePolicy::new(config.disable_keepalive),
            peers: PeerLimiter::new(config.max_conns_per_ip),
            permits: Arc::new(Semaphore::new(config.concurrency)),
            config,
            tls: None,
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Apply every tuning knob. Takes effect for listeners served afterwards.
    pub fn load_config(&mut self, config: &ServerConfig) {
        self.policy.set_disabled(config.disable_keepalive);
        self.peers = PeerLimiter::new(config.max_conns_per_ip);
        self.permits = Arc::new(Semaphore::new(config.concurrency));
        self.config = config.clone();

        tracing::debug!(
            name = %config.name,
            concurrency = config.concurrency,
            disable_keepalive = config.disable_keepalive,
            max_request_body_size = config.max_request_body_size,
            "Server configuration applied"
        );
    }

    /// Get a reference to the config.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Add routes next to the application's own.
    pub fn merge(&mut self, routes: Router) {
        self.app = std::mem::take(&mut self.app).merge(routes);
    }

    pub fn set_tls(&mut self, tls: Option<RustlsConfig>) {
        self.tls = tls;
    }

    pub fn tracker(&self) -> &InFlightTracker {
        &self.tracker
    }

    pub fn policy(&self) -> &KeepAlivePolicy {
        &self.policy
    }

    /// Requests currently being handled, across all listeners.
    pub fn in_flight(&self) -> u64 {
        self.tracker.in_flight()
    }

    /// Open connections, across all listeners.
    pub fn connection_count(&self) -> usize {
        self.handles().iter().map(Handle::connection_count).sum()
    }

    fn handles(&self) -> Vec<Handle> {
        self.handles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Build the router with all middleware layers.
    #[allow(deprecated)]
    pub fn build_router(&self) -> Router {
        let mut router = self.app.clone();
        if self.config.get_only {
            router = router.layer(middleware::from_fn(get_only));
        }
        if self.peers.is_enabled() {
            router = router.layer(middleware::from_fn_with_state(self.peers.clone(), limit_per_peer));
        }
        router = router
            .layer(RequestBodyLimitLayer::new(self.config.max_request_body_size))
            .layer(DefaultBodyLimit::disable());
        if let Some(timeout) = self.config.request_timeout() {
            router = router.layer(TimeoutLayer::new(timeout));
        }

        router
            .layer(middleware::from_fn_with_state(self.permits.clone(), concurrency_limit))
            .layer(middleware::from_fn_with_state(self.policy.clone(), keep_alive_policy))
            .layer(middleware::from_fn_with_state(self.tracker.clone(), track_in_flight))
            .layer(PropagateRequestIdLayer::x_request_id())
            .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
            .layer(TraceLayer::new_for_http())
    }

    /// Start accepting on `listener`. The task ends when the listener is shut down.
    pub fn serve(&self, addr: String, listener: TcpListener) -> JoinHandle<Result<(), std::io::Error>> {
        let make_service = self
            .build_router()
            .into_make_service_with_connect_info::<SocketAddr>();
        let handle = Handle::new();
        self.handles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(handle.clone());

        let tls = self.tls.clone();
        let keep_alive = !self.config.disable_keepalive;
        let read_buffer = self.config.read_buffer_size.max(MIN_READ_BUFFER);

        tokio::spawn(async move {
            tracing::info!(address = %addr, tls = tls.is_some(), "HTTP server starting");
            let result = match tls {
                Some(tls) => {
                    let mut server = axum_server::from_tcp_rustls(listener, tls).handle(handle);
                    tune_http(server.http_builder(), keep_alive, read_buffer);
                    server.serve(make_service).await
                }
                None => {
                    let mut server = axum_server::from_tcp(listener).handle(handle);
                    tune_http(server.http_builder(), keep_alive, read_buffer);
                    server.serve(make_service).await
                }
            };
            tracing::info!(address = %addr, "HTTP server stopped");
            result
        })
    }

    /// Stop accepting on every listener and let open connections finish.
    ///
    /// Connections still open after `grace` are closed by the engine.
    pub fn stop_accepting(&self, grace: Duration) {
        for handle in self.handles() {
            handle.graceful_shutdown(Some(grace));
        }
    }

    /// Close every connection now.
    pub fn force_close(&self) {
        for handle in self.handles() {
            handle.shutdown();
        }
    }
}

fn tune_http(builder: &mut auto::Builder<TokioExecutor>, keep_alive: bool, read_buffer: usize) {
    builder.http1().keep_alive(keep_alive).max_buf_size(read_buffer);
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        body::Body,
        extract::ConnectInfo,
        http::{header, Method, Request, StatusCode},
        routing::get,
    };
    use tower::ServiceExt;

    fn request(method: Method) -> Request<Body> {
        let mut req = Request::builder()
            .method(method)
            .uri("/")
            .body(Body::empty())
            .unwrap();
        req.extensions_mut()
            .insert(ConnectInfo(SocketAddr::from(([127, 0, 0, 1], 40000))));
        req
    }

    fn counting_server() -> HttpServer {
        let tracker_probe = Arc::new(Mutex::new(None::<InFlightTracker>));
        let probe = tracker_probe.clone();
        let app = Router::new().route(
            "/",
            get(move || {
                let probe = probe.clone();
                async move {
                    let in_flight = probe
                        .lock()
                        .unwrap()
                        .as_ref()
                        .map(InFlightTracker::in_flight)
                        .unwrap_or(0);
                    in_flight.to_string()
                }
            })
            .post(|| async { "posted" }),
        );
        let server = HttpServer::new(app);
        *tracker_probe.lock().unwrap() = Some(server.tracker().clone());
        server
    }

    async fn body_text(response: axum::response::Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn request_is_counted_while_in_flight() {
        let server = counting_server();
        let response = server.build_router().oneshot(request(Method::GET)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().contains_key("x-request-id"));
        assert_eq!(body_text(response).await, "1");
        assert_eq!(server.in_flight(), 0);
    }

    #[tokio::test]
    async fn draining_closes_http1_connections() {
        let server = counting_server();
        let response = server.build_router().oneshot(request(Method::GET)).await.unwrap();
        assert!(response.headers().get(header::CONNECTION).is_none());

        server.policy().begin_drain();
        let response = server.build_router().oneshot(request(Method::GET)).await.unwrap();
        assert_eq!(response.headers().get(header::CONNECTION).unwrap(), "close");
    }

    #[tokio::test]
    async fn load_config_applies_knobs() {
        let mut server = counting_server();
        let config = ServerConfig {
            name: "fasthttp".to_string(),
            disable_keepalive: true,
            get_only: true,
            max_conns_per_ip: 10,
            ..ServerConfig::default()
        };
        server.load_config(&config);
        assert_eq!(server.config(), &config);

        let response = server.build_router().oneshot(request(Method::GET)).await.unwrap();
        assert_eq!(response.headers().get(header::CONNECTION).unwrap(), "close");

        let response = server.build_router().oneshot(request(Method::POST)).await.unwrap();
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
    }

    #[tokio::test]
    async fn serves_and_stops_on_a_plain_listener() {
        let server = counting_server();
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.set_nonblocking(true).unwrap();
        let addr = listener.local_addr().unwrap();

        let task = server.serve(addr.to_string(), listener);
        let body = reqwest::get(format!("http://{}/", addr))
            .await
            .unwrap()
            .text()
            .await
            .unwrap();
        assert_eq!(body, "1");

        server.stop_accepting(Duration::from_secs(1));
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }
}
