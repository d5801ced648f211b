//! Docker runtime adapter.
//!
//! All interactions with the Docker daemon go through the [`ContainerRuntime`]
//! trait so the lifecycle engine and server can be exercised against a mock.
//! [`DockerClient`] is the bollard-backed production implementation.

use crate::config::{parse_duration, ContainerConfig};
use anyhow::{anyhow, bail, Context};
use async_trait::async_trait;
use bollard::container::{
    ListContainersOptions, LogOutput, LogsOptions, StartContainerOptions, StopContainerOptions,
};
use bollard::Docker;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use http_body_util::Empty;
use hyper::body::Bytes;
use hyper::Request;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Label that opts a container into auto-discovery.
pub const DISCOVERY_ENABLE_LABEL: &str = "wakegate.enabled";

const TCP_PROBE_RETRY: Duration = Duration::from_millis(300);
const HTTP_PROBE_RETRY: Duration = Duration::from_millis(500);
const HTTP_PROBE_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(2);

/// Semantic error for a container the daemon does not know about. The server
/// surfaces this as "container not found" instead of a raw API error.
#[derive(Debug)]
pub struct ContainerNotFound(pub String);

impl fmt::Display for ContainerNotFound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "no such container: {}", self.0)
    }
}

impl std::error::Error for ContainerNotFound {}

/// Lightweight container details for the status dashboard.
#[derive(Debug, Clone, Default)]
pub struct ContainerInfo {
    pub status: String,
    pub image: String,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Names of the networks the container is attached to.
    pub networks: Vec<String>,
}

/// Capability surface over the container runtime consumed by the lifecycle
/// manager, the discovery loop and the server.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Returns the runtime status string ("running", "exited", ...).
    async fn status(&self, name: &str) -> anyhow::Result<String>;

    /// Returns status, image, timestamps and attached networks.
    async fn inspect(&self, name: &str) -> anyhow::Result<ContainerInfo>;

    async fn start(&self, name: &str) -> anyhow::Result<()>;

    async fn stop(&self, name: &str) -> anyhow::Result<()>;

    /// Lists containers carrying the discovery enable-label, parsed into
    /// container configs.
    async fn discover_labeled(&self) -> anyhow::Result<Vec<ContainerConfig>>;

    /// Resolves the container IP, on the named network when `network` is
    /// non-empty, otherwise on the first attached network with an address.
    async fn address(&self, name: &str, network: &str) -> anyhow::Result<String>;

    /// Dials ip:port until a connection succeeds or the budget runs out.
    async fn probe_tcp(&self, ip: &str, port: &str, budget: Duration) -> anyhow::Result<()>;

    /// GETs http://ip:port/path until a 2xx arrives or the budget runs out.
    async fn probe_http(
        &self,
        ip: &str,
        port: &str,
        path: &str,
        budget: Duration,
    ) -> anyhow::Result<()>;

    /// Returns the last `n` log lines, demultiplexed and normalized.
    async fn tail_logs(&self, name: &str, n: usize) -> anyhow::Result<Vec<String>>;
}

/// bollard-backed [`ContainerRuntime`].
pub struct DockerClient {
    client: Docker,
    probe_client: Client<HttpConnector, Empty<Bytes>>,
}

impl DockerClient {
    /// Connects to the Docker daemon and verifies it responds.
    ///
    /// Connection priority: `DOCKER_HOST` env var, then the platform default
    /// socket.
    pub async fn new() -> anyhow::Result<Self> {
        let client = if let Ok(host) = std::env::var("DOCKER_HOST") {
            Self::connect_to_host(&host).with_context(|| {
                format!("failed to connect to Docker via DOCKER_HOST={host:?}")
            })?
        } else {
            Docker::connect_with_socket_defaults()
                .context("failed to connect to the Docker socket")?
        };

        client
            .ping()
            .await
            .context("Docker daemon is not responding")?;
        debug!("connected to Docker daemon");

        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        let probe_client = Client::builder(TokioExecutor::new()).build(connector);

        Ok(Self {
            client,
            probe_client,
        })
    }

    fn connect_to_host(host: &str) -> anyhow::Result<Docker> {
        if let Some(socket_path) = host.strip_prefix("unix://") {
            Ok(Docker::connect_with_socket(
                socket_path,
                120,
                bollard::API_DEFAULT_VERSION,
            )?)
        } else if host.starts_with("tcp://") || host.starts_with("http://") {
            Ok(Docker::connect_with_http(
                host,
                120,
                bollard::API_DEFAULT_VERSION,
            )?)
        } else {
            bail!(
                "invalid DOCKER_HOST format: {host:?} (expected unix:///path or tcp://host:port)"
            )
        }
    }

    /// Translates a bollard 404 into the semantic not-found error.
    fn map_err(name: &str, err: bollard::errors::Error) -> anyhow::Error {
        match err {
            bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            } => anyhow::Error::new(ContainerNotFound(name.to_string())),
            other => anyhow::Error::new(other),
        }
    }
}

#[async_trait]
impl ContainerRuntime for DockerClient {
    async fn status(&self, name: &str) -> anyhow::Result<String> {
        let info = self
            .client
            .inspect_container(name, None)
            .await
            .map_err(|e| Self::map_err(name, e))?;
        Ok(info
            .state
            .and_then(|s| s.status)
            .map(|s| s.to_string())
            .unwrap_or_default())
    }

    async fn inspect(&self, name: &str) -> anyhow::Result<ContainerInfo> {
        let info = self
            .client
            .inspect_container(name, None)
            .await
            .map_err(|e| Self::map_err(name, e))?;

        let mut ci = ContainerInfo::default();
        if let Some(state) = info.state {
            ci.status = state.status.map(|s| s.to_string()).unwrap_or_default();
            ci.started_at = state.started_at.as_deref().and_then(parse_docker_time);
            ci.finished_at = state.finished_at.as_deref().and_then(parse_docker_time);
        }
        if let Some(config) = info.config {
            ci.image = config.image.unwrap_or_default();
        }
        if let Some(settings) = info.network_settings {
            if let Some(nets) = settings.networks {
                ci.networks = nets.keys().cloned().collect();
            }
        }
        Ok(ci)
    }

    async fn start(&self, name: &str) -> anyhow::Result<()> {
        match self
            .client
            .start_container(name, None::<StartContainerOptions<String>>)
            .await
        {
            Ok(()) => Ok(()),
            // 304: already started
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 304, ..
            }) => Ok(()),
            Err(e) => Err(Self::map_err(name, e)),
        }
    }

    async fn stop(&self, name: &str) -> anyhow::Result<()> {
        match self
            .client
            .stop_container(name, Some(StopContainerOptions { t: 10 }))
            .await
        {
            Ok(()) => Ok(()),
            // 304: already stopped
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 304, ..
            }) => Ok(()),
            Err(e) => Err(Self::map_err(name, e)),
        }
    }

    async fn discover_labeled(&self) -> anyhow::Result<Vec<ContainerConfig>> {
        let mut filters = HashMap::new();
        filters.insert(
            "label".to_string(),
            vec![format!("{DISCOVERY_ENABLE_LABEL}=true")],
        );

        let containers = self
            .client
            .list_containers(Some(ListContainersOptions {
                all: true,
                filters,
                ..Default::default()
            }))
            .await
            .context("failed to list labeled containers")?;

        let mut configs = Vec::new();
        for summary in containers {
            let Some(name) = summary
                .names
                .as_ref()
                .and_then(|n| n.first())
                .map(|n| n.trim_start_matches('/').to_string())
            else {
                continue;
            };
            let labels = summary.labels.unwrap_or_default();
            if let Some(cfg) = container_from_labels(&name, &labels) {
                configs.push(cfg);
            }
        }
        Ok(configs)
    }

    async fn address(&self, name: &str, network: &str) -> anyhow::Result<String> {
        let info = self
            .client
            .inspect_container(name, None)
            .await
            .map_err(|e| Self::map_err(name, e))?;

        let nets = info
            .network_settings
            .and_then(|s| s.networks)
            .unwrap_or_default();
        if nets.is_empty() {
            bail!("container {name} has no network interfaces");
        }

        if !network.is_empty() {
            if let Some(ip) = nets
                .get(network)
                .and_then(|n| n.ip_address.clone())
                .filter(|ip| !ip.is_empty())
            {
                return Ok(ip);
            }
            let attached: Vec<&str> = nets.keys().map(String::as_str).collect();
            bail!(
                "container {name} is not on network {network:?} (attached networks: {})",
                attached.join(", ")
            );
        }

        nets.values()
            .filter_map(|n| n.ip_address.clone())
            .find(|ip| !ip.is_empty())
            .ok_or_else(|| anyhow!("could not find IP address for container {name}"))
    }

    async fn probe_tcp(&self, ip: &str, port: &str, budget: Duration) -> anyhow::Result<()> {
        let addr = format!("{ip}:{port}");
        let deadline = Instant::now() + budget;
        loop {
            let remaining = deadline
                .checked_duration_since(Instant::now())
                .ok_or_else(|| anyhow!("TCP probe timed out for {addr}"))?;
            match tokio::time::timeout(remaining, TcpStream::connect(&addr)).await {
                Ok(Ok(_conn)) => return Ok(()),
                Ok(Err(_)) => {}
                Err(_) => bail!("TCP probe timed out for {addr}"),
            }
            if Instant::now() + TCP_PROBE_RETRY >= deadline {
                bail!("TCP probe timed out for {addr}");
            }
            tokio::time::sleep(TCP_PROBE_RETRY).await;
        }
    }

    async fn probe_http(
        &self,
        ip: &str,
        port: &str,
        path: &str,
        budget: Duration,
    ) -> anyhow::Result<()> {
        let url = format!("http://{ip}:{port}{path}");
        let uri: hyper::Uri = url
            .parse()
            .with_context(|| format!("invalid probe URL {url}"))?;
        let deadline = Instant::now() + budget;

        loop {
            let remaining = deadline
                .checked_duration_since(Instant::now())
                .ok_or_else(|| anyhow!("HTTP probe timed out for {url}"))?;
            let attempt_budget = HTTP_PROBE_ATTEMPT_TIMEOUT.min(remaining);

            let req = Request::builder()
                .uri(uri.clone())
                .body(Empty::<Bytes>::new())
                .expect("valid probe request");
            if let Ok(Ok(resp)) =
                tokio::time::timeout(attempt_budget, self.probe_client.request(req)).await
            {
                if resp.status().is_success() {
                    return Ok(());
                }
            }

            if Instant::now() + HTTP_PROBE_RETRY >= deadline {
                bail!("HTTP probe timed out for {url}");
            }
            tokio::time::sleep(HTTP_PROBE_RETRY).await;
        }
    }

    async fn tail_logs(&self, name: &str, n: usize) -> anyhow::Result<Vec<String>> {
        let mut stream = self.client.logs(
            name,
            Some(LogsOptions::<String> {
                stdout: true,
                stderr: true,
                tail: n.to_string(),
                timestamps: false,
                ..Default::default()
            }),
        );

        let mut raw = Vec::new();
        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(LogOutput::StdOut { message })
                | Ok(LogOutput::StdErr { message })
                | Ok(LogOutput::Console { message }) => raw.extend_from_slice(&message),
                Ok(LogOutput::StdIn { .. }) => {}
                Err(e) => return Err(Self::map_err(name, e)),
            }
        }

        // TTY-less containers may hand the multiplexed stream through
        // unparsed depending on the runtime; strip frame headers if present.
        let text = if looks_multiplexed(&raw) {
            demux_log_stream(&raw)
        } else {
            String::from_utf8_lossy(&raw).into_owned()
        };
        Ok(normalize_log_lines(&text, n))
    }
}

/// Parses a container config from discovery labels. Returns `None` (with a
/// warning) when the required host label is missing; individual unparseable
/// fields warn and fall back to their defaults.
pub(crate) fn container_from_labels(
    name: &str,
    labels: &HashMap<String, String>,
) -> Option<ContainerConfig> {
    let label = |key: &str| {
        labels
            .get(&format!("wakegate.{key}"))
            .filter(|v| !v.is_empty())
    };

    let Some(host) = label("host") else {
        warn!(container = name, "discovery: container missing required wakegate.host label");
        return None;
    };

    let mut cfg = ContainerConfig {
        name: name.to_string(),
        host: host.clone(),
        target_port: "80".to_string(),
        start_timeout: Duration::from_secs(60),
        redirect_path: "/".to_string(),
        icon: "docker".to_string(),
        ..Default::default()
    };

    if let Some(port) = label("target_port") {
        cfg.target_port = port.clone();
    }
    if let Some(val) = label("start_timeout") {
        match parse_duration(val) {
            Some(d) => cfg.start_timeout = d,
            None => warn!(container = name, value = %val, "discovery: invalid start_timeout label"),
        }
    }
    if let Some(val) = label("idle_timeout") {
        match parse_duration(val) {
            Some(d) => cfg.idle_timeout = d,
            None => warn!(container = name, value = %val, "discovery: invalid idle_timeout label"),
        }
    }
    if let Some(val) = label("network") {
        cfg.network = val.clone();
    }
    if let Some(val) = label("redirect_path") {
        cfg.redirect_path = val.clone();
    }
    if let Some(val) = label("icon") {
        cfg.icon = val.clone();
    }
    if let Some(val) = label("health_path") {
        cfg.health_path = val.clone();
    }
    if let Some(val) = label("depends_on") {
        cfg.depends_on = val
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect();
    }

    Some(cfg)
}

/// Heuristic for the Docker log multiplexing header: stream type 0..=2
/// followed by three zero bytes.
fn looks_multiplexed(b: &[u8]) -> bool {
    b.len() >= 8 && b[0] <= 2 && b[1] == 0 && b[2] == 0 && b[3] == 0
}

/// Strips the 8-byte multiplexing headers Docker prepends to each log frame:
/// `[stream_type(1), 0, 0, 0, size_be(4)]` + payload. A declared size past
/// the end of the buffer consumes what is available.
pub(crate) fn demux_log_stream(mut b: &[u8]) -> String {
    let mut out = Vec::with_capacity(b.len());
    while b.len() >= 8 {
        let size = u32::from_be_bytes([b[4], b[5], b[6], b[7]]) as usize;
        b = &b[8..];
        let take = size.min(b.len());
        out.extend_from_slice(&b[..take]);
        b = &b[take..];
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Splits log text into lines, trims trailing CRs, drops empties and keeps
/// the last `n` lines.
pub(crate) fn normalize_log_lines(text: &str, n: usize) -> Vec<String> {
    let mut lines: Vec<String> = text
        .split('\n')
        .map(|l| l.trim_end_matches('\r'))
        .filter(|l| !l.is_empty())
        .map(String::from)
        .collect();
    if lines.len() > n {
        lines.drain(..lines.len() - n);
    }
    lines
}

fn parse_docker_time(s: &str) -> Option<DateTime<Utc>> {
    // Docker reports zero timestamps as "0001-01-01T00:00:00Z".
    let t = DateTime::parse_from_rfc3339(s).ok()?.with_timezone(&Utc);
    if t.timestamp() <= 0 {
        return None;
    }
    Some(t)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(stream: u8, payload: &[u8]) -> Vec<u8> {
        let mut f = vec![stream, 0, 0, 0];
        f.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        f.extend_from_slice(payload);
        f
    }

    #[test]
    fn demux_strips_single_frame() {
        let raw = frame(1, b"hello\n");
        assert_eq!(demux_log_stream(&raw), "hello\n");
    }

    #[test]
    fn demux_handles_concatenated_frames() {
        let mut raw = frame(1, b"line one\n");
        raw.extend(frame(2, b"line two\n"));
        raw.extend(frame(1, b"line three\n"));
        assert_eq!(demux_log_stream(&raw), "line one\nline two\nline three\n");
    }

    #[test]
    fn demux_consumes_available_bytes_on_oversized_frame() {
        let mut raw = vec![1, 0, 0, 0];
        raw.extend_from_slice(&1000u32.to_be_bytes());
        raw.extend_from_slice(b"short");
        assert_eq!(demux_log_stream(&raw), "short");
    }

    #[test]
    fn demux_ignores_trailing_partial_header() {
        let mut raw = frame(1, b"ok\n");
        raw.extend_from_slice(&[1, 0, 0]); // incomplete header
        assert_eq!(demux_log_stream(&raw), "ok\n");
    }

    #[test]
    fn normalize_trims_cr_and_drops_empties() {
        let lines = normalize_log_lines("a\r\n\nb\r\nc\n\n", 10);
        assert_eq!(lines, vec!["a", "b", "c"]);
    }

    #[test]
    fn normalize_keeps_last_n() {
        let lines = normalize_log_lines("1\n2\n3\n4\n5\n", 3);
        assert_eq!(lines, vec!["3", "4", "5"]);
    }

    #[test]
    fn multiplex_heuristic() {
        assert!(looks_multiplexed(&frame(1, b"payload")));
        assert!(!looks_multiplexed(b"plain text output\n"));
        assert!(!looks_multiplexed(b"\x01\x00"));
    }

    #[test]
    fn labels_parse_full_set() {
        let mut labels = HashMap::new();
        for (k, v) in [
            ("wakegate.host", "web.localhost"),
            ("wakegate.target_port", "3000"),
            ("wakegate.start_timeout", "90s"),
            ("wakegate.idle_timeout", "5m"),
            ("wakegate.network", "backend"),
            ("wakegate.redirect_path", "/login"),
            ("wakegate.icon", "nginx"),
            ("wakegate.health_path", "/healthz"),
            ("wakegate.depends_on", "db, cache"),
        ] {
            labels.insert(k.to_string(), v.to_string());
        }

        let cfg = container_from_labels("web", &labels).unwrap();
        assert_eq!(cfg.name, "web");
        assert_eq!(cfg.host, "web.localhost");
        assert_eq!(cfg.target_port, "3000");
        assert_eq!(cfg.start_timeout, Duration::from_secs(90));
        assert_eq!(cfg.idle_timeout, Duration::from_secs(300));
        assert_eq!(cfg.network, "backend");
        assert_eq!(cfg.redirect_path, "/login");
        assert_eq!(cfg.icon, "nginx");
        assert_eq!(cfg.health_path, "/healthz");
        assert_eq!(cfg.depends_on, vec!["db", "cache"]);
    }

    #[test]
    fn labels_missing_host_skips_entry() {
        let mut labels = HashMap::new();
        labels.insert("wakegate.target_port".to_string(), "3000".to_string());
        assert!(container_from_labels("web", &labels).is_none());
    }

    #[test]
    fn labels_invalid_duration_falls_back_to_default() {
        let mut labels = HashMap::new();
        labels.insert("wakegate.host".to_string(), "web.localhost".to_string());
        labels.insert("wakegate.start_timeout".to_string(), "soon".to_string());

        let cfg = container_from_labels("web", &labels).unwrap();
        assert_eq!(cfg.start_timeout, Duration::from_secs(60));
    }

    #[test]
    fn labels_minimal_defaults() {
        let mut labels = HashMap::new();
        labels.insert("wakegate.host".to_string(), "web.localhost".to_string());

        let cfg = container_from_labels("web", &labels).unwrap();
        assert_eq!(cfg.target_port, "80");
        assert_eq!(cfg.redirect_path, "/");
        assert_eq!(cfg.icon, "docker");
        assert!(cfg.depends_on.is_empty());
        assert!(cfg.health_path.is_empty());
    }

    #[test]
    fn docker_zero_time_is_none() {
        assert!(parse_docker_time("0001-01-01T00:00:00Z").is_none());
        assert!(parse_docker_time("2024-05-01T10:00:00.123456789Z").is_some());
        assert!(parse_docker_time("garbage").is_none());
    }
}
