//! Gateway configuration: YAML model, defaults, validation and the routing
//! indices derived from it.
//!
//! The config file is selected via the `CONFIG_PATH` env var (default
//! `/etc/wakegate/config.yaml`). A handful of `ADMIN_AUTH_*` and
//! `DISCOVERY_INTERVAL` env vars override their YAML counterparts after
//! parsing, before validation.

use anyhow::{bail, Context};
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use tracing::warn;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/wakegate/config.yaml";

/// Top-level config structure parsed from config.yaml.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub gateway: GlobalConfig,
    pub containers: Vec<ContainerConfig>,
    pub groups: Vec<GroupConfig>,
}

/// Gateway-wide settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GlobalConfig {
    /// Port the gateway listens on (default: "8080").
    pub port: String,
    /// Number of container log lines shown on the holding page (default: 30).
    pub log_lines: usize,
    /// CIDR blocks (e.g. "10.0.0.0/8") whose X-Forwarded-For header is
    /// trusted when resolving the client IP. If empty, the peer address is
    /// always used.
    pub trusted_proxies: Vec<String>,
    /// How often Docker labels are polled for auto-discovery.
    /// Overridable via the DISCOVERY_INTERVAL env var. (default: 15s)
    #[serde(with = "duration_str")]
    pub discovery_interval: Duration,
    /// Optional authentication for the admin endpoints (/_status*, /_metrics).
    pub admin_auth: AdminAuthConfig,
}

/// Authentication settings for admin endpoints. With the default method
/// "none" no authentication is enforced.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdminAuthConfig {
    /// Authentication scheme: "none", "basic", or "bearer".
    pub method: String,
    /// Required when method is "basic".
    pub username: String,
    /// Required when method is "basic".
    pub password: String,
    /// Required when method is "bearer".
    pub token: String,
}

/// Per-container settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerConfig {
    /// Docker container name to manage.
    pub name: String,
    /// Incoming Host header to match (e.g. "myapp.localhost"). May be empty
    /// when the container is only reachable as a group member or dependency.
    pub host: String,
    /// Port on the container to proxy to (default: "80").
    pub target_port: String,
    /// Maximum time to wait for the container to become reachable before the
    /// start attempt is marked failed. (default: 60s)
    #[serde(with = "duration_str")]
    pub start_timeout: Duration,
    /// How long the container may go without requests before it is stopped.
    /// Zero means never auto-stop. (default: 0)
    #[serde(with = "duration_str")]
    pub idle_timeout: Duration,
    /// Optional Docker network name used for the container IP lookup. When
    /// empty the first attached network is used.
    pub network: String,
    /// URL path the browser is redirected to once the container runs.
    /// (default: "/")
    pub redirect_path: String,
    /// Icon slug shown on the dashboard card. (default: "docker")
    pub icon: String,
    /// Optional HTTP endpoint (e.g. "/health") probed instead of a raw TCP
    /// dial to confirm readiness.
    pub health_path: String,
    /// Container names that must be running before this one starts.
    pub depends_on: Vec<String>,
}

/// A load-balanced group of containers behind a single host.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GroupConfig {
    /// Logical group name (e.g. "api-cluster").
    pub name: String,
    /// Incoming Host header that routes to this group.
    pub host: String,
    /// Load-balancing strategy. (default: "round-robin")
    pub strategy: String,
    /// Ordered list of member container names.
    pub containers: Vec<String>,
}

impl GatewayConfig {
    /// Reads and parses the YAML config file named by `CONFIG_PATH`.
    pub fn load() -> anyhow::Result<Self> {
        let path = std::env::var("CONFIG_PATH").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        Self::load_from(Path::new(&path))
    }

    /// Reads and parses a YAML config file, applies defaults and env
    /// overrides, then validates.
    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("cannot read config file {}", path.display()))?;

        let mut cfg: GatewayConfig = serde_yaml::from_str(&data)
            .with_context(|| format!("cannot parse config file {}", path.display()))?;

        cfg.apply_defaults();
        cfg.apply_env_overrides();
        cfg.validate().context("invalid configuration")?;

        Ok(cfg)
    }

    /// Fills in defaults for any unset field.
    pub fn apply_defaults(&mut self) {
        if self.gateway.port.is_empty() {
            self.gateway.port = "8080".to_string();
        }
        if self.gateway.log_lines == 0 {
            self.gateway.log_lines = 30;
        }
        if self.gateway.discovery_interval.is_zero() {
            self.gateway.discovery_interval = Duration::from_secs(15);
        }
        if self.gateway.admin_auth.method.is_empty() {
            self.gateway.admin_auth.method = "none".to_string();
        }

        for c in &mut self.containers {
            if c.target_port.is_empty() {
                c.target_port = "80".to_string();
            }
            if c.start_timeout.is_zero() {
                c.start_timeout = Duration::from_secs(60);
            }
            // idle_timeout 0 means "never auto-stop", no override
            if c.redirect_path.is_empty() {
                c.redirect_path = "/".to_string();
            }
            if c.icon.is_empty() {
                c.icon = "docker".to_string();
            }
        }

        for g in &mut self.groups {
            if g.strategy.is_empty() {
                g.strategy = "round-robin".to_string();
            }
        }
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("DISCOVERY_INTERVAL") {
            if !val.is_empty() {
                match parse_duration(&val) {
                    Some(d) => self.gateway.discovery_interval = d,
                    None => warn!(value = %val, "invalid DISCOVERY_INTERVAL env var, using default"),
                }
            }
        }
        for (var, field) in [
            ("ADMIN_AUTH_METHOD", &mut self.gateway.admin_auth.method),
            ("ADMIN_AUTH_USERNAME", &mut self.gateway.admin_auth.username),
            ("ADMIN_AUTH_PASSWORD", &mut self.gateway.admin_auth.password),
            ("ADMIN_AUTH_TOKEN", &mut self.gateway.admin_auth.token),
        ] {
            if let Ok(val) = std::env::var(var) {
                if !val.is_empty() {
                    *field = val;
                }
            }
        }
    }

    /// Checks that the configuration is internally consistent: unique names
    /// and hosts, resolvable group members and dependencies, an acyclic
    /// dependency graph and a usable admin_auth section.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.gateway.port.is_empty() {
            bail!("gateway.port cannot be empty");
        }

        match self.gateway.admin_auth.method.as_str() {
            "" | "none" => {}
            "basic" => {
                if self.gateway.admin_auth.username.is_empty()
                    || self.gateway.admin_auth.password.is_empty()
                {
                    bail!("admin_auth: method=basic requires non-empty username and password");
                }
            }
            "bearer" => {
                if self.gateway.admin_auth.token.is_empty() {
                    bail!("admin_auth: method=bearer requires non-empty token");
                }
            }
            other => {
                bail!("admin_auth: unknown method {other:?} (allowed: none, basic, bearer)")
            }
        }

        let name_set: std::collections::HashSet<&str> =
            self.containers.iter().map(|c| c.name.as_str()).collect();

        // Containers that appear as group members or dependency targets may
        // omit their host.
        let mut hostless_ok: std::collections::HashSet<&str> = std::collections::HashSet::new();
        for g in &self.groups {
            hostless_ok.extend(g.containers.iter().map(String::as_str));
        }
        for c in &self.containers {
            hostless_ok.extend(c.depends_on.iter().map(String::as_str));
        }

        let mut seen_names: std::collections::HashSet<&str> = std::collections::HashSet::new();
        let mut seen_hosts: std::collections::HashSet<&str> = std::collections::HashSet::new();

        for (i, c) in self.containers.iter().enumerate() {
            if c.name.is_empty() {
                bail!("container #{} is missing required field 'name'", i + 1);
            }
            if c.host.is_empty() && !hostless_ok.contains(c.name.as_str()) {
                bail!("container {:?} is missing required field 'host'", c.name);
            }
            if c.target_port.is_empty() {
                bail!("container {:?} is missing required field 'target_port'", c.name);
            }
            if !seen_names.insert(c.name.as_str()) {
                bail!("duplicate container name found: {:?}", c.name);
            }
            if !c.host.is_empty() && !seen_hosts.insert(c.host.as_str()) {
                bail!("duplicate host mapped: {:?} (in container {:?})", c.host, c.name);
            }
            for dep in &c.depends_on {
                if !name_set.contains(dep.as_str()) {
                    bail!("container {:?} depends on unknown container {:?}", c.name, dep);
                }
                if dep == &c.name {
                    bail!("container {:?} cannot depend on itself", c.name);
                }
            }
        }

        let mut seen_group_names: std::collections::HashSet<&str> =
            std::collections::HashSet::new();
        for (i, g) in self.groups.iter().enumerate() {
            if g.name.is_empty() {
                bail!("group #{} is missing required field 'name'", i + 1);
            }
            if g.host.is_empty() {
                bail!("group {:?} is missing required field 'host'", g.name);
            }
            if g.containers.is_empty() {
                bail!("group {:?} has no containers", g.name);
            }
            if !seen_group_names.insert(g.name.as_str()) {
                bail!("duplicate group name found: {:?}", g.name);
            }
            if !seen_hosts.insert(g.host.as_str()) {
                bail!("group {:?} host {:?} conflicts with an existing host", g.name, g.host);
            }
            for member in &g.containers {
                if !name_set.contains(member.as_str()) {
                    bail!("group {:?} references unknown container {:?}", g.name, member);
                }
            }
        }

        detect_dependency_cycles(&self.containers)?;

        Ok(())
    }
}

/// Three-colour DFS over the depends_on graph. Re-entering a node that is
/// still being visited means a cycle; the error message carries the path.
fn detect_dependency_cycles(containers: &[ContainerConfig]) -> anyhow::Result<()> {
    #[derive(Clone, Copy, PartialEq)]
    enum Colour {
        Unvisited,
        Visiting,
        Visited,
    }

    let deps: HashMap<&str, &[String]> = containers
        .iter()
        .map(|c| (c.name.as_str(), c.depends_on.as_slice()))
        .collect();
    let mut state: HashMap<&str, Colour> = HashMap::with_capacity(containers.len());

    fn visit<'a>(
        name: &'a str,
        path: &mut Vec<&'a str>,
        deps: &HashMap<&'a str, &'a [String]>,
        state: &mut HashMap<&'a str, Colour>,
    ) -> anyhow::Result<()> {
        match state.get(name).copied().unwrap_or(Colour::Unvisited) {
            Colour::Visited => return Ok(()),
            Colour::Visiting => {
                bail!("dependency cycle detected: {} -> {}", path.join(" -> "), name)
            }
            Colour::Unvisited => {}
        }
        state.insert(name, Colour::Visiting);
        path.push(name);
        if let Some(children) = deps.get(name) {
            for dep in children.iter() {
                visit(dep, path, deps, state)?;
            }
        }
        path.pop();
        state.insert(name, Colour::Visited);
        Ok(())
    }

    for c in containers {
        if state.get(c.name.as_str()).copied().unwrap_or(Colour::Unvisited) == Colour::Unvisited {
            visit(&c.name, &mut Vec::new(), &deps, &mut state)?;
        }
    }
    Ok(())
}

// ─── Routing indices ─────────────────────────────────────────────────────────

/// Shared handle to the active routing snapshot. Single writer (discovery /
/// reload), many readers (dispatch, idle sweeper); a swap replaces the inner
/// `Arc` wholesale.
pub type SharedRouting = std::sync::Arc<parking_lot::RwLock<std::sync::Arc<RoutingState>>>;

/// The outcome of a Host-header lookup.
pub enum HostMatch<'a> {
    Container(&'a ContainerConfig),
    Group(&'a GroupConfig),
}

/// Immutable snapshot of a validated configuration plus the dispatch indices
/// derived from it. A config swap replaces the whole snapshot, so concurrent
/// readers never observe a half-rebuilt mixture.
pub struct RoutingState {
    pub config: GatewayConfig,
    host_index: HashMap<String, usize>,
    group_host_index: HashMap<String, usize>,
    name_index: HashMap<String, usize>,
    pub trusted_cidrs: Vec<IpNet>,
}

impl RoutingState {
    pub fn build(config: GatewayConfig) -> Self {
        let mut host_index = HashMap::with_capacity(config.containers.len());
        let mut name_index = HashMap::with_capacity(config.containers.len());
        for (i, c) in config.containers.iter().enumerate() {
            if !c.host.is_empty() {
                host_index.insert(c.host.clone(), i);
            }
            name_index.insert(c.name.clone(), i);
        }

        let mut group_host_index = HashMap::with_capacity(config.groups.len());
        for (i, g) in config.groups.iter().enumerate() {
            if !g.host.is_empty() {
                group_host_index.insert(g.host.clone(), i);
            }
        }

        let trusted_cidrs = parse_trusted_proxies(&config.gateway.trusted_proxies);

        Self {
            config,
            host_index,
            group_host_index,
            name_index,
            trusted_cidrs,
        }
    }

    /// Maps a Host header to a group or container. Groups win, then
    /// containers; an exact match is tried before stripping a `:port` suffix.
    pub fn lookup_host(&self, host: &str) -> Option<HostMatch<'_>> {
        for candidate in host_candidates(host) {
            if let Some(&i) = self.group_host_index.get(candidate) {
                return Some(HostMatch::Group(&self.config.groups[i]));
            }
            if let Some(&i) = self.host_index.get(candidate) {
                return Some(HostMatch::Container(&self.config.containers[i]));
            }
        }
        None
    }

    pub fn container_for_host(&self, host: &str) -> Option<&ContainerConfig> {
        for candidate in host_candidates(host) {
            if let Some(&i) = self.host_index.get(candidate) {
                return Some(&self.config.containers[i]);
            }
        }
        None
    }

    pub fn container_named(&self, name: &str) -> Option<&ContainerConfig> {
        self.name_index.get(name).map(|&i| &self.config.containers[i])
    }
}

/// Yields the host as-is, then with any `:port` suffix removed.
fn host_candidates(host: &str) -> impl Iterator<Item = &str> {
    let stripped = host.rfind(':').map(|i| &host[..i]).filter(|s| *s != host);
    std::iter::once(host).chain(stripped)
}

/// Parses trusted-proxy CIDR notation; malformed entries are logged and
/// dropped.
pub fn parse_trusted_proxies(proxies: &[String]) -> Vec<IpNet> {
    let mut cidrs = Vec::with_capacity(proxies.len());
    for p in proxies {
        match p.parse::<IpNet>() {
            Ok(net) => cidrs.push(net),
            Err(e) => warn!(cidr = %p, error = %e, "invalid trusted_proxies CIDR"),
        }
    }
    cidrs
}

// ─── Durations ───────────────────────────────────────────────────────────────

/// Parses a duration string like "300ms", "90s", "5m", "1m30s" or "2h".
/// A bare number is taken as seconds.
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }
    if let Ok(secs) = s.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }

    let mut total = Duration::ZERO;
    let mut rest = s;
    while !rest.is_empty() {
        let digits_end = rest.find(|c: char| !c.is_ascii_digit())?;
        if digits_end == 0 {
            return None;
        }
        let value: u64 = rest[..digits_end].parse().ok()?;
        rest = &rest[digits_end..];

        let (unit_len, unit) = if rest.starts_with("ms") {
            (2, Duration::from_millis(value))
        } else if rest.starts_with('s') {
            (1, Duration::from_secs(value))
        } else if rest.starts_with('m') {
            (1, Duration::from_secs(value * 60))
        } else if rest.starts_with('h') {
            (1, Duration::from_secs(value * 3600))
        } else {
            return None;
        };
        total += unit;
        rest = &rest[unit_len..];
    }
    Some(total)
}

/// Renders a duration compactly: "0s", "500ms", "90s" -> "1m30s", "2h".
pub fn format_duration(d: Duration) -> String {
    if d.is_zero() {
        return "0s".to_string();
    }
    if d < Duration::from_secs(1) {
        return format!("{}ms", d.as_millis());
    }

    let mut secs = d.as_secs();
    let mut out = String::new();
    let hours = secs / 3600;
    if hours > 0 {
        out.push_str(&format!("{hours}h"));
        secs %= 3600;
    }
    let mins = secs / 60;
    if mins > 0 {
        out.push_str(&format!("{mins}m"));
        secs %= 60;
    }
    if secs > 0 {
        out.push_str(&format!("{secs}s"));
    }
    out
}

/// Serde adapter storing `Duration` fields as human-readable strings.
mod duration_str {
    use super::{format_duration, parse_duration};
    use serde::de::{self, Visitor};
    use serde::{Deserializer, Serializer};
    use std::fmt;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&format_duration(*d))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        struct DurationVisitor;

        impl Visitor<'_> for DurationVisitor {
            type Value = Duration;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a duration string like \"90s\" or a number of seconds")
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Duration, E> {
                parse_duration(v)
                    .ok_or_else(|| E::custom(format!("invalid duration {v:?}")))
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<Duration, E> {
                Ok(Duration::from_secs(v))
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<Duration, E> {
                u64::try_from(v)
                    .map(Duration::from_secs)
                    .map_err(|_| E::custom("negative duration"))
            }
        }

        d.deserialize_any(DurationVisitor)
    }
}
