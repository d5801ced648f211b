//! The gateway HTTP server: request dispatch, internal endpoints, holding
//! pages and graceful shutdown.
//!
//! Dispatch order per request: internal paths first (`/_health`, `/_logs`,
//! `/_status*`, `/_metrics`), then host-based routing to a group or
//! container. Running containers are proxied; stopped ones get the holding
//! page while a detached orchestrator wakes them.

use crate::admin_auth::AdminAuth;
use crate::config::{
    format_duration, ContainerConfig, GroupConfig, HostMatch, RoutingState, SharedRouting,
};
use crate::docker::ContainerNotFound;
use crate::group::GroupRouter;
use crate::manager::{ContainerManager, StartStatus};
use crate::metrics::metrics;
use crate::pages;
use crate::proxy::{full_body, is_websocket_request, tunnel_websocket, ProxyBody, ProxyClient};
use crate::ratelimit::RateLimiter;
use chrono::{SecondsFormat, Utc};
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::header::{HeaderValue, CONTENT_TYPE, HOST, ORIGIN, WWW_AUTHENTICATE};
use hyper::service::service_fn;
use hyper::{HeaderMap, Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use ipnet::IpNet;
use serde::Serialize;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info};
use uuid::Uuid;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Grace period for in-flight requests during shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(15);

/// Minimum interval between polls per client IP on the rate-limited
/// endpoints.
const RATE_LIMIT_INTERVAL: Duration = Duration::from_secs(1);

/// Safety margin added to orchestration budgets beyond start_timeout.
const ORCHESTRATION_MARGIN: Duration = Duration::from_secs(10);

/// Handles all gateway HTTP traffic.
pub struct Server {
    manager: Arc<ContainerManager>,
    routing: SharedRouting,
    // Bound at construction; unaffected by config reloads.
    port: String,
    auth: AdminAuth,
    group_router: GroupRouter,
    rate_limiter: Arc<RateLimiter>,
    proxy: ProxyClient,
    shutdown_rx: watch::Receiver<bool>,
}

impl Server {
    pub fn new(
        manager: Arc<ContainerManager>,
        routing: SharedRouting,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        let (port, auth) = {
            let snapshot = routing.read();
            (
                snapshot.config.gateway.port.clone(),
                AdminAuth::from_config(&snapshot.config.gateway.admin_auth),
            )
        };
        Self {
            manager,
            routing,
            port,
            auth,
            group_router: GroupRouter::new(),
            rate_limiter: Arc::new(RateLimiter::new(RATE_LIMIT_INTERVAL)),
            proxy: ProxyClient::new(),
            shutdown_rx,
        }
    }

    /// Listens for HTTP traffic until shutdown, then stops accepting and
    /// waits up to the grace period for in-flight connections.
    pub async fn run(self: Arc<Self>) -> anyhow::Result<()> {
        let addr: SocketAddr = format!("0.0.0.0:{}", self.port).parse()?;
        let listener = TcpListener::bind(addr).await?;
        info!(version = VERSION, port = %self.port, "gateway started");

        Arc::clone(&self.rate_limiter).spawn_cleanup(self.shutdown_rx.clone());

        let in_flight = Arc::new(AtomicUsize::new(0));
        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, peer)) => {
                            let server = Arc::clone(&self);
                            let in_flight = Arc::clone(&in_flight);
                            tokio::spawn(async move {
                                in_flight.fetch_add(1, Ordering::SeqCst);
                                let io = TokioIo::new(stream);
                                let service = service_fn(move |req: Request<Incoming>| {
                                    let server = Arc::clone(&server);
                                    async move {
                                        Ok::<_, hyper::Error>(
                                            server.handle(req.map(|b| b.boxed()), peer).await,
                                        )
                                    }
                                });
                                if let Err(e) = AutoBuilder::new(TokioExecutor::new())
                                    .serve_connection_with_upgrades(io, service)
                                    .await
                                {
                                    debug!(peer = %peer, error = %e, "connection error");
                                }
                                in_flight.fetch_sub(1, Ordering::SeqCst);
                            });
                        }
                        Err(e) => error!(error = %e, "failed to accept connection"),
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }

        info!(grace = %format_duration(SHUTDOWN_GRACE), "shutting down gateway");
        let deadline = Instant::now() + SHUTDOWN_GRACE;
        while in_flight.load(Ordering::SeqCst) > 0 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        Ok(())
    }

    /// Top-level request entry point.
    pub async fn handle(
        &self,
        req: Request<ProxyBody>,
        peer: SocketAddr,
    ) -> Response<ProxyBody> {
        match req.uri().path() {
            // Functional endpoints, never behind admin auth: the holding
            // page must work for end users.
            "/_health" => self.handle_health(&req, peer).await,
            "/_logs" => self.handle_logs(&req, peer).await,
            // Admin endpoints.
            "/_status" => match self.check_auth(&req) {
                Some(denied) => denied,
                None => self.handle_status_page(),
            },
            "/_status/api" => match self.check_auth(&req) {
                Some(denied) => denied,
                None => self.handle_status_api(&req, peer).await,
            },
            "/_status/wake" => match self.check_auth(&req) {
                Some(denied) => denied,
                None => self.handle_wake(&req, peer).await,
            },
            "/_metrics" => match self.check_auth(&req) {
                Some(denied) => denied,
                None => text_response(StatusCode::OK, metrics().render()),
            },
            _ => self.dispatch(req, peer).await,
        }
    }

    /// Returns the 401 response when the request fails admin auth.
    fn check_auth(&self, req: &Request<ProxyBody>) -> Option<Response<ProxyBody>> {
        if self.auth.check(req.headers()) {
            return None;
        }
        debug!(path = %req.uri().path(), "admin auth failed");
        let mut builder = Response::builder().status(StatusCode::UNAUTHORIZED);
        if let Some(challenge) = self.auth.challenge() {
            builder = builder.header(WWW_AUTHENTICATE, challenge);
        }
        Some(
            builder
                .body(full_body("Unauthorized"))
                .expect("valid response builder"),
        )
    }

    // ─── Host-based dispatch ─────────────────────────────────────────────

    async fn dispatch(
        &self,
        req: Request<ProxyBody>,
        peer: SocketAddr,
    ) -> Response<ProxyBody> {
        // Unmatched internal-prefix paths never reach the proxy.
        let path = req.uri().path();
        if path.starts_with("/_status") || path == "/_health" || path == "/_logs" || path == "/_metrics"
        {
            return text_response(StatusCode::NOT_FOUND, "404 page not found".to_string());
        }

        let routing = self.routing_snapshot();
        let host = request_host(&req);

        let target = match routing.lookup_host(&host) {
            Some(HostMatch::Group(group)) => {
                let group = group.clone();
                return self.handle_group(req, peer, &group, &routing).await;
            }
            Some(HostMatch::Container(cfg)) => Some(cfg.clone()),
            None => query_param(req.uri().query(), "container")
                .and_then(|name| routing.container_named(name))
                .cloned(),
        };

        let Some(cfg) = target else {
            return text_response(StatusCode::NOT_FOUND, "404 page not found".to_string());
        };

        let started = Instant::now();
        let response = self.handle_container(req, peer, &cfg, &routing).await;
        metrics().record_request(&cfg.name, response.status().as_u16(), started.elapsed());
        response
    }

    async fn handle_container(
        &self,
        req: Request<ProxyBody>,
        peer: SocketAddr,
        cfg: &ContainerConfig,
        routing: &Arc<RoutingState>,
    ) -> Response<ProxyBody> {
        let path = req.uri().path().to_string();

        let status = match self.manager.runtime().status(&cfg.name).await {
            Ok(s) => s,
            Err(e) => {
                let msg = if e.downcast_ref::<ContainerNotFound>().is_some() {
                    "Container not found in Docker daemon".to_string()
                } else {
                    format!("Docker error: {e}")
                };
                return error_page(cfg, &msg, &path);
            }
        };

        if status == "running" {
            // Dependencies must be running too before we proxy.
            for dep in &cfg.depends_on {
                let dep_status = self
                    .manager
                    .runtime()
                    .status(dep)
                    .await
                    .unwrap_or_default();
                if dep_status != "running" {
                    self.manager.init_start_state(&cfg.name);
                    self.spawn_orchestrator(cfg, routing);
                    return loading_page(cfg, &path);
                }
            }
            self.manager.record_activity(&cfg.name);
            return self.proxy_to(req, peer, cfg).await;
        }

        // Container not running: pre-set state, fire the detached
        // orchestrator and show the holding page.
        self.manager.init_start_state(&cfg.name);
        self.spawn_orchestrator(cfg, routing);
        loading_page(cfg, &path)
    }

    async fn handle_group(
        &self,
        req: Request<ProxyBody>,
        peer: SocketAddr,
        group: &GroupConfig,
        routing: &Arc<RoutingState>,
    ) -> Response<ProxyBody> {
        let picked = self.group_router.pick(group);
        let Some(cfg) = routing.container_named(&picked).cloned() else {
            return text_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("group {:?} member {picked:?} not found", group.name),
            );
        };

        let started = Instant::now();
        let response = self.group_member_response(req, peer, group, &cfg, routing).await;
        metrics().record_request(&cfg.name, response.status().as_u16(), started.elapsed());
        response
    }

    async fn group_member_response(
        &self,
        req: Request<ProxyBody>,
        peer: SocketAddr,
        group: &GroupConfig,
        cfg: &ContainerConfig,
        routing: &Arc<RoutingState>,
    ) -> Response<ProxyBody> {
        let path = req.uri().path().to_string();
        let status = self.manager.runtime().status(&cfg.name).await;

        if !matches!(status.as_deref(), Ok("running")) {
            for member in &group.containers {
                self.manager.init_start_state(member);
            }
            self.spawn_group_orchestrator(group, routing);
            return loading_page(cfg, &path);
        }

        self.manager.record_activity(&cfg.name);
        self.proxy_to(req, peer, cfg).await
    }

    async fn proxy_to(
        &self,
        req: Request<ProxyBody>,
        peer: SocketAddr,
        cfg: &ContainerConfig,
    ) -> Response<ProxyBody> {
        let path = req.uri().path().to_string();
        let ip = match self
            .manager
            .runtime()
            .address(&cfg.name, &cfg.network)
            .await
        {
            Ok(ip) => ip,
            Err(e) => return error_page(cfg, &format!("Networking error: {e}"), &path),
        };

        if is_websocket_request(&req) {
            let backend = format!("{ip}:{}", cfg.target_port);
            return tunnel_websocket(req, backend, cfg.name.clone()).await;
        }

        self.proxy
            .forward(req, &ip, &cfg.target_port, peer, false)
            .await
    }

    /// Fires the detached wake task for a container and its dependencies.
    /// It carries its own deadline and catalog snapshot; the inbound request
    /// finishing does not cancel it.
    fn spawn_orchestrator(&self, cfg: &ContainerConfig, routing: &Arc<RoutingState>) {
        let manager = Arc::clone(&self.manager);
        let containers = routing.config.containers.clone();
        let name = cfg.name.clone();
        let budget = cfg.start_timeout + ORCHESTRATION_MARGIN;
        tokio::spawn(async move {
            match tokio::time::timeout(budget, manager.ensure_deps_running(&name, &containers))
                .await
            {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!(container = %name, error = %e, "async start error"),
                Err(_) => error!(container = %name, "async start exceeded its budget"),
            }
        });
    }

    fn spawn_group_orchestrator(&self, group: &GroupConfig, routing: &Arc<RoutingState>) {
        let manager = Arc::clone(&self.manager);
        let containers = routing.config.containers.clone();
        let group = group.clone();

        let max_timeout = group
            .containers
            .iter()
            .filter_map(|m| routing.container_named(m))
            .map(|c| c.start_timeout)
            .max()
            .filter(|d| !d.is_zero())
            .unwrap_or(Duration::from_secs(60));
        let budget = max_timeout + ORCHESTRATION_MARGIN;

        tokio::spawn(async move {
            if tokio::time::timeout(budget, manager.ensure_group_running(&group, &containers))
                .await
                .is_err()
            {
                error!(group = %group.name, "group start exceeded its budget");
            }
        });
    }

    // ─── Internal endpoints ──────────────────────────────────────────────

    /// `/_health?container=NAME`: start-state as JSON, with a fallback to
    /// the live runtime status when no wake cycle has been recorded. The
    /// holding page polls this to know when to redirect.
    async fn handle_health(
        &self,
        req: &Request<ProxyBody>,
        peer: SocketAddr,
    ) -> Response<ProxyBody> {
        let routing = self.routing_snapshot();
        if !self.rate_limiter.allow(&client_ip(peer, req.headers(), &routing.trusted_cidrs)) {
            return text_response(StatusCode::TOO_MANY_REQUESTS, "rate limit exceeded".into());
        }

        let Some(cfg) = resolve_container(req, &routing) else {
            return text_response(StatusCode::BAD_REQUEST, "unknown container".into());
        };

        let state = self.manager.get_start_state(&cfg.name);
        let mut status = state.status.as_str();
        if state.status == StartStatus::Unknown {
            if let Ok(docker_status) = self.manager.runtime().status(&cfg.name).await {
                if docker_status == "running" {
                    status = "running";
                }
            }
        }

        json_response(
            StatusCode::OK,
            serde_json::json!({ "status": status, "error": state.error }).to_string(),
        )
    }

    /// `/_logs?container=NAME`: the last N log lines. Runtime errors soft-
    /// fail to an empty list so the holding page keeps working.
    async fn handle_logs(
        &self,
        req: &Request<ProxyBody>,
        peer: SocketAddr,
    ) -> Response<ProxyBody> {
        let routing = self.routing_snapshot();
        if !self.rate_limiter.allow(&client_ip(peer, req.headers(), &routing.trusted_cidrs)) {
            return text_response(StatusCode::TOO_MANY_REQUESTS, "rate limit exceeded".into());
        }

        let Some(cfg) = resolve_container(req, &routing) else {
            return text_response(StatusCode::BAD_REQUEST, "unknown container".into());
        };

        let lines = self
            .manager
            .runtime()
            .tail_logs(&cfg.name, routing.config.gateway.log_lines)
            .await
            .unwrap_or_default();

        json_response(
            StatusCode::OK,
            serde_json::json!({ "lines": lines }).to_string(),
        )
    }

    fn handle_status_page(&self) -> Response<ProxyBody> {
        html_response(StatusCode::OK, pages::render_status(VERSION))
    }

    /// `/_status/api`: JSON snapshot of all managed containers, polled by
    /// the dashboard.
    async fn handle_status_api(
        &self,
        req: &Request<ProxyBody>,
        peer: SocketAddr,
    ) -> Response<ProxyBody> {
        let routing = self.routing_snapshot();
        if !self.rate_limiter.allow(&client_ip(peer, req.headers(), &routing.trusted_cidrs)) {
            return text_response(StatusCode::TOO_MANY_REQUESTS, "rate limit exceeded".into());
        }

        let mut containers = Vec::with_capacity(routing.config.containers.len());
        for cfg in &routing.config.containers {
            let mut entry = StatusContainer {
                name: cfg.name.clone(),
                host: cfg.host.clone(),
                status: "unknown".to_string(),
                start_state: self.manager.get_start_state(&cfg.name).status.as_str().to_string(),
                image: "?".to_string(),
                icon: cfg.icon.clone(),
                target_port: cfg.target_port.clone(),
                start_timeout: format_duration(cfg.start_timeout),
                idle_timeout: format_duration(cfg.idle_timeout),
                started_at: None,
                last_request: None,
                network: cfg.network.clone(),
            };

            if let Ok(info) = self.manager.runtime().inspect(&cfg.name).await {
                entry.status = info.status;
                entry.image = info.image;
                entry.started_at = info
                    .started_at
                    .map(|t| t.to_rfc3339_opts(SecondsFormat::Secs, true));
            }
            entry.last_request = self
                .manager
                .get_last_seen(&cfg.name)
                .map(|t| t.to_rfc3339_opts(SecondsFormat::Secs, true));

            containers.push(entry);
        }

        let body = StatusApiResponse {
            containers,
            updated_at: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
        };
        json_response(
            StatusCode::OK,
            serde_json::to_string(&body).unwrap_or_else(|_| "{}".to_string()),
        )
    }

    /// `POST /_status/wake?container=NAME`: manual wake from the dashboard.
    /// Browser requests must be same-origin; non-browser clients without an
    /// Origin header pass.
    async fn handle_wake(
        &self,
        req: &Request<ProxyBody>,
        peer: SocketAddr,
    ) -> Response<ProxyBody> {
        if req.method() != Method::POST {
            return text_response(StatusCode::METHOD_NOT_ALLOWED, "method not allowed".into());
        }
        if !validate_origin(req.headers(), &request_host(req)) {
            return text_response(StatusCode::FORBIDDEN, "cross-origin request blocked".into());
        }
        let routing = self.routing_snapshot();
        if !self.rate_limiter.allow(&client_ip(peer, req.headers(), &routing.trusted_cidrs)) {
            return text_response(StatusCode::TOO_MANY_REQUESTS, "rate limit exceeded".into());
        }

        let Some(name) = query_param(req.uri().query(), "container") else {
            return text_response(StatusCode::BAD_REQUEST, "missing container parameter".into());
        };
        let Some(cfg) = routing.container_named(name).cloned() else {
            return text_response(StatusCode::BAD_REQUEST, "unknown container".into());
        };

        self.manager.init_start_state(&cfg.name);
        let manager = Arc::clone(&self.manager);
        let budget = cfg.start_timeout + ORCHESTRATION_MARGIN;
        tokio::spawn(async move {
            match tokio::time::timeout(budget, manager.ensure_running(&cfg)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!(container = %cfg.name, error = %e, "wake start error"),
                Err(_) => error!(container = %cfg.name, "wake start exceeded its budget"),
            }
        });

        json_response(StatusCode::OK, "{\"ok\":true}".to_string())
    }

    fn routing_snapshot(&self) -> Arc<RoutingState> {
        Arc::clone(&self.routing.read())
    }
}

// ─── Request helpers ─────────────────────────────────────────────────────────

/// The effective Host of a request: the Host header, else the URI authority.
fn request_host<B>(req: &Request<B>) -> String {
    req.headers()
        .get(HOST)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
        .or_else(|| req.uri().authority().map(|a| a.to_string()))
        .unwrap_or_default()
}

fn query_param<'a>(query: Option<&'a str>, key: &str) -> Option<&'a str> {
    query?.split('&').find_map(|pair| {
        let (k, v) = pair.split_once('=')?;
        (k == key && !v.is_empty()).then_some(v)
    })
}

/// Maps a request to its container by Host header, with the
/// `?container=NAME` fallback.
fn resolve_container<'a, B>(
    req: &Request<B>,
    routing: &'a RoutingState,
) -> Option<&'a ContainerConfig> {
    if let Some(cfg) = routing.container_for_host(&request_host(req)) {
        return Some(cfg);
    }
    query_param(req.uri().query(), "container").and_then(|name| routing.container_named(name))
}

/// The client IP used for rate limiting. X-Forwarded-For is believed only
/// when the direct peer is inside a trusted-proxy CIDR.
fn client_ip(peer: SocketAddr, headers: &HeaderMap, trusted: &[IpNet]) -> String {
    let direct = peer.ip();
    if !trusted.is_empty() && is_trusted_proxy(direct, trusted) {
        if let Some(xff) = headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
            if let Some(first) = xff.split(',').next() {
                let first = first.trim();
                if !first.is_empty() {
                    return first.to_string();
                }
            }
        }
    }
    direct.to_string()
}

fn is_trusted_proxy(ip: IpAddr, cidrs: &[IpNet]) -> bool {
    cidrs.iter().any(|c| c.contains(&ip))
}

/// Blocks cross-origin browser requests; requests without an Origin header
/// (curl, scripts) are allowed through.
fn validate_origin(headers: &HeaderMap, host: &str) -> bool {
    let Some(origin) = headers.get(ORIGIN).and_then(|v| v.to_str().ok()) else {
        return true;
    };
    let Ok(uri) = origin.parse::<hyper::Uri>() else {
        return false;
    };
    match uri.authority() {
        Some(authority) => authority.as_str() == host,
        None => false,
    }
}

fn request_id(prefix: &str) -> String {
    let id = Uuid::new_v4().simple().to_string();
    format!("{prefix}-{}", &id[..8])
}

// ─── Responses ───────────────────────────────────────────────────────────────

fn text_response(status: StatusCode, body: String) -> Response<ProxyBody> {
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(full_body(body))
        .expect("valid response builder")
}

fn json_response(status: StatusCode, body: String) -> Response<ProxyBody> {
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "application/json")
        .body(full_body(body))
        .expect("valid response builder")
}

fn html_response(status: StatusCode, body: String) -> Response<ProxyBody> {
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, HeaderValue::from_static("text/html; charset=utf-8"))
        .body(full_body(body))
        .expect("valid response builder")
}

fn loading_page(cfg: &ContainerConfig, path: &str) -> Response<ProxyBody> {
    html_response(
        StatusCode::OK,
        pages::render_loading(&pages::LoadingPage {
            container_name: &cfg.name,
            request_id: &request_id("req"),
            request_path: path,
            redirect_path: &cfg.redirect_path,
            start_timeout: &format_duration(cfg.start_timeout),
        }),
    )
}

fn error_page(cfg: &ContainerConfig, error: &str, path: &str) -> Response<ProxyBody> {
    html_response(
        StatusCode::BAD_GATEWAY,
        pages::render_error(&pages::ErrorPage {
            container_name: &cfg.name,
            error,
            request_id: &request_id("err"),
            request_path: path,
        }),
    )
}

#[derive(Serialize)]
struct StatusContainer {
    name: String,
    host: String,
    status: String,
    start_state: String,
    image: String,
    icon: String,
    target_port: String,
    start_timeout: String,
    idle_timeout: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    started_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    last_request: Option<String>,
    network: String,
}

#[derive(Serialize)]
struct StatusApiResponse {
    containers: Vec<StatusContainer>,
    updated_at: String,
}
