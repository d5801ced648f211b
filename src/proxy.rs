//! Request forwarding: the standard reverse-proxy path over a pooled HTTP
//! client, the forwarding-header policy, and the raw-TCP WebSocket tunnel.

use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::Bytes;
use hyper::header::{HeaderValue, CONNECTION, HOST, UPGRADE};
use hyper::{HeaderMap, Request, Response, StatusCode};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, error, warn};

const X_FORWARDED_FOR: &str = "x-forwarded-for";
const X_FORWARDED_HOST: &str = "x-forwarded-host";
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";
const X_REAL_IP: &str = "x-real-ip";

/// Dial deadline for WebSocket backend connections.
const WEBSOCKET_DIAL_TIMEOUT: Duration = Duration::from_secs(10);

pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

pub fn full_body(body: impl Into<Bytes>) -> ProxyBody {
    Full::new(body.into()).map_err(|never| match never {}).boxed()
}

pub fn empty_body() -> ProxyBody {
    Empty::<Bytes>::new().map_err(|never| match never {}).boxed()
}

/// Pooled HTTP client used for the reverse-proxy path.
pub struct ProxyClient {
    client: Client<HttpConnector, ProxyBody>,
}

impl ProxyClient {
    pub fn new() -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90))
            .build(connector);
        Self { client }
    }

    /// Forwards `req` to `ip:port`, preserving method, path, body and
    /// headers, with the forwarding headers applied. An upstream failure
    /// becomes a plain 502.
    pub async fn forward(
        &self,
        req: Request<ProxyBody>,
        ip: &str,
        port: &str,
        peer: SocketAddr,
        is_tls: bool,
    ) -> Response<ProxyBody> {
        let path = req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let backend_host = format!("{ip}:{port}");
        let uri = format!("http://{backend_host}{path}");

        let original_host = host_header(req.headers()).unwrap_or_default();
        let (mut parts, body) = req.into_parts();
        set_forwarded_headers(&mut parts.headers, &peer.ip().to_string(), &original_host, is_tls);
        if let Ok(value) = HeaderValue::from_str(&backend_host) {
            parts.headers.insert(HOST, value);
        }

        let mut builder = Request::builder().method(parts.method).uri(&uri);
        if let Some(headers) = builder.headers_mut() {
            *headers = parts.headers;
        }
        let backend_req = match builder.body(body) {
            Ok(r) => r,
            Err(e) => {
                error!(uri, error = %e, "failed to build upstream request");
                return bad_gateway("failed to build upstream request");
            }
        };

        match self.client.request(backend_req).await {
            Ok(response) => {
                let (parts, body) = response.into_parts();
                Response::from_parts(parts, body.boxed())
            }
            Err(e) => {
                warn!(uri, error = %e, "upstream request failed");
                bad_gateway("upstream request failed")
            }
        }
    }
}

impl Default for ProxyClient {
    fn default() -> Self {
        Self::new()
    }
}

fn bad_gateway(msg: &str) -> Response<ProxyBody> {
    Response::builder()
        .status(StatusCode::BAD_GATEWAY)
        .header("content-type", "text/plain; charset=utf-8")
        .body(full_body(msg.to_string()))
        .expect("valid response builder")
}

fn host_header(headers: &HeaderMap) -> Option<String> {
    headers.get(HOST)?.to_str().ok().map(String::from)
}

/// Applies the forwarding-header policy before a request leaves for the
/// backend:
/// - X-Forwarded-For: append the direct peer IP to any existing chain
/// - X-Real-IP: set only when absent upstream
/// - X-Forwarded-Proto: preserve an upstream value, else http/https
/// - X-Forwarded-Host: the original incoming Host
pub fn set_forwarded_headers(
    headers: &mut HeaderMap,
    peer_ip: &str,
    original_host: &str,
    is_tls: bool,
) {
    let chain = match headers.get(X_FORWARDED_FOR).and_then(|v| v.to_str().ok()) {
        Some(prior) if !prior.is_empty() => format!("{prior}, {peer_ip}"),
        _ => peer_ip.to_string(),
    };
    if let Ok(value) = HeaderValue::from_str(&chain) {
        headers.insert(X_FORWARDED_FOR, value);
    }

    if !headers.contains_key(X_REAL_IP) {
        if let Ok(value) = HeaderValue::from_str(peer_ip) {
            headers.insert(X_REAL_IP, value);
        }
    }

    if !headers.contains_key(X_FORWARDED_PROTO) {
        let proto = if is_tls { "https" } else { "http" };
        headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static(proto));
    }

    if let Ok(value) = HeaderValue::from_str(original_host) {
        headers.insert(X_FORWARDED_HOST, value);
    }
}

/// A request is treated as a WebSocket upgrade only when both the Upgrade
/// and Connection headers say so.
pub fn is_websocket_request<B>(req: &Request<B>) -> bool {
    let upgrade_ok = req
        .headers()
        .get(UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false);
    let connection_ok = req
        .headers()
        .get(CONNECTION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_lowercase().contains("upgrade"))
        .unwrap_or(false);
    upgrade_ok && connection_ok
}

/// Serialises the original upgrade request for the backend, so the backend
/// performs its own handshake.
fn build_upgrade_request<B>(req: &Request<B>, backend_addr: &str) -> Vec<u8> {
    let path = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let mut out = format!("{} {} HTTP/1.1\r\n", req.method(), path);

    for (name, value) in req.headers() {
        if name == HOST {
            continue;
        }
        if let Ok(v) = value.to_str() {
            out.push_str(&format!("{name}: {v}\r\n"));
        }
    }
    out.push_str(&format!("Host: {backend_addr}\r\n\r\n"));
    out.into_bytes()
}

/// Parses the backend's response head, looking for 101 Switching Protocols.
fn parse_upgrade_response(data: &[u8]) -> Option<(StatusCode, Vec<(String, String)>)> {
    let text = std::str::from_utf8(data).ok()?;
    let mut lines = text.lines();

    // Status line: HTTP/1.1 101 Switching Protocols
    let status_line = lines.next()?;
    let code = status_line.split(' ').nth(1)?;
    let status = StatusCode::from_u16(code.parse().ok()?).ok()?;

    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }
    }
    Some((status, headers))
}

/// Tunnels a WebSocket upgrade to `backend_addr` over raw TCP: the original
/// upgrade request is forwarded so the backend completes its own handshake,
/// the backend's 101 head is mirrored to the client, then bytes are copied
/// bidirectionally until either side closes.
pub async fn tunnel_websocket(
    req: Request<ProxyBody>,
    backend_addr: String,
    container: String,
) -> Response<ProxyBody> {
    let mut backend = match tokio::time::timeout(
        WEBSOCKET_DIAL_TIMEOUT,
        TcpStream::connect(&backend_addr),
    )
    .await
    {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            error!(container, backend = %backend_addr, error = %e, "WebSocket backend unreachable");
            return bad_gateway("WebSocket backend unreachable");
        }
        Err(_) => {
            error!(container, backend = %backend_addr, "WebSocket backend dial timed out");
            return bad_gateway("WebSocket backend dial timed out");
        }
    };

    let raw_request = build_upgrade_request(&req, &backend_addr);
    if let Err(e) = backend.write_all(&raw_request).await {
        error!(container, error = %e, "failed to send upgrade request to backend");
        return bad_gateway("failed to send upgrade request");
    }

    let mut head = vec![0u8; 4096];
    let n = match backend.read(&mut head).await {
        Ok(n) if n > 0 => n,
        _ => {
            error!(container, "backend closed connection before answering upgrade");
            return bad_gateway("backend closed connection");
        }
    };

    let Some((status, response_headers)) = parse_upgrade_response(&head[..n]) else {
        error!(container, "invalid upgrade response from backend");
        return bad_gateway("invalid upgrade response from backend");
    };

    if status != StatusCode::SWITCHING_PROTOCOLS {
        warn!(container, %status, "backend rejected upgrade request");
        let mut builder = Response::builder().status(status);
        for (name, value) in &response_headers {
            if let Ok(v) = HeaderValue::from_str(value) {
                builder = builder.header(name.as_str(), v);
            }
        }
        return builder
            .body(empty_body())
            .expect("valid response builder");
    }

    // Mirror the backend's 101 to the client, minus body-framing headers.
    let mut builder = Response::builder().status(StatusCode::SWITCHING_PROTOCOLS);
    for (name, value) in &response_headers {
        let lower = name.to_lowercase();
        if lower == "content-length" || lower == "transfer-encoding" {
            continue;
        }
        if let Ok(v) = HeaderValue::from_str(value) {
            builder = builder.header(name.as_str(), v);
        }
    }
    let response = builder
        .body(empty_body())
        .expect("valid response builder");

    tokio::spawn(async move {
        match hyper::upgrade::on(req).await {
            Ok(upgraded) => {
                let mut client_io = TokioIo::new(upgraded);
                match tokio::io::copy_bidirectional(&mut client_io, &mut backend).await {
                    Ok((sent, received)) => {
                        debug!(container, sent, received, "WebSocket tunnel closed");
                    }
                    Err(e) => {
                        debug!(container, error = %e, "WebSocket tunnel closed with error");
                    }
                }
            }
            Err(e) => {
                error!(container, error = %e, "failed to upgrade client connection");
            }
        }
    });

    response
}
