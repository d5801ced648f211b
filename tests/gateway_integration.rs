//! Integration tests exercising the public configuration and routing API:
//! file loading, defaulting, validation, index building and dependency
//! ordering, the way the composition root uses them.

use std::path::PathBuf;
use std::time::Duration;
use tempfile::TempDir;
use wakegate::config::{GatewayConfig, HostMatch, RoutingState};
use wakegate::group::{topological_sort, GroupRouter};

fn write_config(contents: &str) -> (TempDir, PathBuf) {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("config.yaml");
    std::fs::write(&path, contents).unwrap();
    (dir, path)
}

const FULL_CONFIG: &str = r#"
gateway:
  port: "8080"
  log_lines: 50
  trusted_proxies:
    - "10.0.0.0/8"
containers:
  - name: web
    host: web.localhost
    target_port: "3000"
    start_timeout: 90s
    idle_timeout: 10m
    redirect_path: /dashboard
    icon: nginx
    depends_on: [api]
  - name: api
    target_port: "8000"
    health_path: /healthz
    depends_on: [db]
  - name: db
    target_port: "5432"
    network: backend
groups:
  - name: api-cluster
    host: cluster.localhost
    containers: [api, db]
"#;

#[test]
fn full_config_loads_with_defaults_and_indices() {
    let (_dir, path) = write_config(FULL_CONFIG);
    let cfg = GatewayConfig::load_from(&path).unwrap();

    assert_eq!(cfg.gateway.port, "8080");
    assert_eq!(cfg.gateway.log_lines, 50);
    assert_eq!(cfg.gateway.discovery_interval, Duration::from_secs(15));
    assert_eq!(cfg.gateway.admin_auth.method, "none");

    let web = &cfg.containers[0];
    assert_eq!(web.start_timeout, Duration::from_secs(90));
    assert_eq!(web.idle_timeout, Duration::from_secs(600));
    assert_eq!(web.redirect_path, "/dashboard");
    assert_eq!(web.icon, "nginx");

    // api and db have no host of their own but are group members and
    // dependency targets, so validation accepts them.
    let api = &cfg.containers[1];
    assert!(api.host.is_empty());
    assert_eq!(api.health_path, "/healthz");
    assert_eq!(cfg.groups[0].strategy, "round-robin");

    let routing = RoutingState::build(cfg);
    assert!(matches!(
        routing.lookup_host("web.localhost"),
        Some(HostMatch::Container(c)) if c.name == "web"
    ));
    assert!(matches!(
        routing.lookup_host("web.localhost:8080"),
        Some(HostMatch::Container(_))
    ));
    assert!(matches!(
        routing.lookup_host("cluster.localhost"),
        Some(HostMatch::Group(g)) if g.name == "api-cluster"
    ));
    assert!(routing.lookup_host("unknown.localhost").is_none());
    assert_eq!(routing.trusted_cidrs.len(), 1);
}

#[test]
fn dependency_chain_orders_before_target() {
    let (_dir, path) = write_config(FULL_CONFIG);
    let cfg = GatewayConfig::load_from(&path).unwrap();

    let order = topological_sort("web", &cfg.containers).unwrap();
    assert_eq!(order, vec!["db", "api", "web"]);
}

#[test]
fn serialised_config_reloads_to_equal_indices() {
    let (_dir, path) = write_config(FULL_CONFIG);
    let cfg = GatewayConfig::load_from(&path).unwrap();

    let (_dir2, path2) = write_config(&serde_yaml::to_string(&cfg).unwrap());
    let reloaded = GatewayConfig::load_from(&path2).unwrap();

    assert_eq!(cfg, reloaded);
    let a = RoutingState::build(cfg);
    let b = RoutingState::build(reloaded);
    for host in ["web.localhost", "cluster.localhost"] {
        assert_eq!(
            matches!(a.lookup_host(host), Some(HostMatch::Group(_))),
            matches!(b.lookup_host(host), Some(HostMatch::Group(_))),
        );
    }
    assert_eq!(
        a.container_named("web").map(|c| c.depends_on.clone()),
        b.container_named("web").map(|c| c.depends_on.clone()),
    );
}

#[test]
fn invalid_configs_are_rejected_with_offender_named() {
    let cases = [
        (
            r#"
containers:
  - name: a
    host: dup.localhost
  - name: b
    host: dup.localhost
"#,
            "dup.localhost",
        ),
        (
            r#"
containers:
  - name: a
    host: a.localhost
    depends_on: [b]
  - name: b
    depends_on: [a]
"#,
            "dependency cycle",
        ),
        (
            r#"
containers:
  - name: a
    host: a.localhost
    depends_on: [a]
"#,
            "cannot depend on itself",
        ),
        (
            r#"
groups:
  - name: g
    host: g.localhost
    containers: [ghost]
"#,
            "unknown container",
        ),
    ];

    for (yaml, needle) in cases {
        let (_dir, path) = write_config(yaml);
        let err = GatewayConfig::load_from(&path).unwrap_err();
        let text = format!("{err:#}");
        assert!(text.contains(needle), "expected {needle:?} in: {text}");
    }
}

#[test]
fn group_router_distributes_loaded_group() {
    let (_dir, path) = write_config(FULL_CONFIG);
    let cfg = GatewayConfig::load_from(&path).unwrap();
    let router = GroupRouter::new();

    let group = &cfg.groups[0];
    let picks: Vec<String> = (0..4).map(|_| router.pick(group)).collect();
    assert_eq!(picks, vec!["api", "db", "api", "db"]);
}
