//! Docker label auto-discovery: periodically lists labelled containers,
//! merges them into the static configuration and hands changed views to the
//! server's reload callback.

use crate::config::{ContainerConfig, GatewayConfig};
use crate::docker::ContainerRuntime;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, warn};

/// Invoked with the merged configuration whenever it differs structurally
/// from the previously delivered one.
pub type ConfigChangeFn = Box<dyn Fn(GatewayConfig) + Send + Sync>;

struct DiscoveryState {
    static_config: GatewayConfig,
    /// Last view handed to the callback; `None` forces redelivery.
    last_delivered: Option<GatewayConfig>,
}

/// Periodically queries Docker for labelled containers and merges them with
/// the static configuration.
pub struct DiscoveryManager {
    runtime: Arc<dyn ContainerRuntime>,
    on_change: ConfigChangeFn,
    state: Mutex<DiscoveryState>,
}

impl DiscoveryManager {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        static_config: GatewayConfig,
        on_change: ConfigChangeFn,
    ) -> Self {
        Self {
            runtime,
            on_change,
            state: Mutex::new(DiscoveryState {
                static_config,
                last_delivered: None,
            }),
        }
    }

    /// Polling loop: one pass immediately, then one per interval until
    /// shutdown.
    pub async fn run(&self, interval: Duration, mut shutdown_rx: watch::Receiver<bool>) {
        self.run_once().await;
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => self.run_once().await,
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        return;
                    }
                }
            }
        }
    }

    /// Replaces the static base config (after a hot reload) and triggers an
    /// immediate pass. Clearing the delivered cache forces the next merge to
    /// be handed to the callback even if it happens to be equal.
    pub async fn update_static(&self, cfg: GatewayConfig) {
        {
            let mut state = self.state.lock();
            state.static_config = cfg;
            state.last_delivered = None;
        }
        self.run_once().await;
    }

    /// A single discovery pass: list, merge, validate, deliver-on-change.
    pub async fn run_once(&self) {
        let dynamic = match self.runtime.discover_labeled().await {
            Ok(d) => d,
            Err(e) => {
                warn!(error = %e, "discovery: failed to list labeled containers");
                return;
            }
        };

        let merged = self.merge_configs(dynamic);

        if let Err(e) = merged.validate() {
            warn!(error = %e, "discovery: merge resulted in invalid configuration, keeping previous view");
            return;
        }

        {
            let mut state = self.state.lock();
            if state.last_delivered.as_ref() == Some(&merged) {
                return;
            }
            state.last_delivered = Some(merged.clone());
        }

        (self.on_change)(merged);
    }

    /// Combines the static config with dynamic discoveries. Static entries
    /// win every conflict; among dynamic entries the first wins. Global
    /// settings and groups come exclusively from the static side.
    fn merge_configs(&self, dynamic: Vec<ContainerConfig>) -> GatewayConfig {
        let state = self.state.lock();
        let mut merged = state.static_config.clone();

        let mut seen_hosts: HashSet<String> = merged
            .containers
            .iter()
            .map(|c| c.host.clone())
            .chain(merged.groups.iter().map(|g| g.host.clone()))
            .collect();
        let mut seen_names: HashSet<String> =
            merged.containers.iter().map(|c| c.name.clone()).collect();

        for dc in dynamic {
            if seen_hosts.contains(&dc.host) {
                debug!(container = %dc.name, host = %dc.host,
                    "discovery: skipping dynamic container, host already defined");
                continue;
            }
            if seen_names.contains(&dc.name) {
                debug!(container = %dc.name,
                    "discovery: skipping dynamic container, name already defined");
                continue;
            }
            seen_hosts.insert(dc.host.clone());
            seen_names.insert(dc.name.clone());
            merged.containers.push(dc);
        }

        merged
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockRuntime;
    use parking_lot::Mutex as PlMutex;
    use std::time::Duration as StdDuration;

    fn container(name: &str, host: &str) -> ContainerConfig {
        ContainerConfig {
            name: name.to_string(),
            host: host.to_string(),
            target_port: "80".to_string(),
            start_timeout: StdDuration::from_secs(60),
            ..Default::default()
        }
    }

    fn static_config(containers: Vec<ContainerConfig>) -> GatewayConfig {
        let mut cfg = GatewayConfig {
            containers,
            ..Default::default()
        };
        cfg.apply_defaults();
        cfg
    }

    /// Discovery manager wired to a mock runtime, recording every delivered
    /// view.
    fn discovery_with(
        runtime: Arc<MockRuntime>,
        static_cfg: GatewayConfig,
    ) -> (Arc<DiscoveryManager>, Arc<PlMutex<Vec<GatewayConfig>>>) {
        let delivered = Arc::new(PlMutex::new(Vec::new()));
        let sink = Arc::clone(&delivered);
        let dm = DiscoveryManager::new(
            runtime,
            static_cfg,
            Box::new(move |cfg| sink.lock().push(cfg)),
        );
        (Arc::new(dm), delivered)
    }

    #[tokio::test]
    async fn merge_appends_non_conflicting_dynamic_containers() {
        let runtime = Arc::new(MockRuntime::new());
        runtime.state.lock().labeled = vec![container("d1", "d1.local")];
        let (dm, delivered) =
            discovery_with(runtime, static_config(vec![container("s1", "s1.local")]));

        dm.run_once().await;

        let views = delivered.lock();
        assert_eq!(views.len(), 1);
        let names: Vec<&str> = views[0].containers.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["s1", "d1"]);
    }

    #[tokio::test]
    async fn merge_skips_dynamic_conflicts_with_static() {
        let runtime = Arc::new(MockRuntime::new());
        runtime.state.lock().labeled = vec![
            container("s1", "other.local"),     // name collision
            container("other", "s1.local"),     // host collision
            container("ok", "ok.local"),
        ];
        let (dm, delivered) =
            discovery_with(runtime, static_config(vec![container("s1", "s1.local")]));

        dm.run_once().await;

        let views = delivered.lock();
        let names: Vec<&str> = views[0].containers.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["s1", "ok"]);
    }

    #[tokio::test]
    async fn merge_first_dynamic_wins_among_duplicates() {
        let runtime = Arc::new(MockRuntime::new());
        runtime.state.lock().labeled = vec![
            container("d1", "dup.local"),
            container("d2", "dup.local"),
        ];
        let (dm, delivered) = discovery_with(runtime, static_config(Vec::new()));

        dm.run_once().await;

        let views = delivered.lock();
        let names: Vec<&str> = views[0].containers.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["d1"]);
    }

    #[tokio::test]
    async fn merge_preserves_dynamic_fields_and_static_settings() {
        let runtime = Arc::new(MockRuntime::new());
        let mut dyn_cfg = container("d1", "d1.local");
        dyn_cfg.idle_timeout = StdDuration::from_secs(300);
        dyn_cfg.network = "backend".to_string();
        dyn_cfg.depends_on = vec!["s1".to_string()];
        runtime.state.lock().labeled = vec![dyn_cfg];

        let mut static_cfg = static_config(vec![container("s1", "s1.local")]);
        static_cfg.gateway.port = "9999".to_string();
        static_cfg.groups = vec![crate::config::GroupConfig {
            name: "pool".to_string(),
            host: "pool.local".to_string(),
            strategy: "round-robin".to_string(),
            containers: vec!["s1".to_string()],
        }];
        let (dm, delivered) = discovery_with(runtime, static_cfg);

        dm.run_once().await;

        let views = delivered.lock();
        let view = &views[0];
        assert_eq!(view.gateway.port, "9999");
        assert_eq!(view.groups.len(), 1);
        let d1 = view.containers.iter().find(|c| c.name == "d1").unwrap();
        assert_eq!(d1.idle_timeout, StdDuration::from_secs(300));
        assert_eq!(d1.network, "backend");
        assert_eq!(d1.depends_on, vec!["s1"]);
    }

    #[tokio::test]
    async fn invalid_merge_is_not_delivered() {
        let runtime = Arc::new(MockRuntime::new());
        // Missing host and not referenced anywhere: the merged view fails
        // validation and must not reach the callback.
        let mut bad = container("bad", "bad.local");
        bad.depends_on = vec!["ghost".to_string()];
        runtime.state.lock().labeled = vec![bad];
        let (dm, delivered) = discovery_with(runtime, static_config(Vec::new()));

        dm.run_once().await;
        assert!(delivered.lock().is_empty());
    }

    #[tokio::test]
    async fn unchanged_view_is_delivered_once() {
        let runtime = Arc::new(MockRuntime::new());
        runtime.state.lock().labeled = vec![container("d1", "d1.local")];
        let (dm, delivered) = discovery_with(runtime, static_config(Vec::new()));

        dm.run_once().await;
        dm.run_once().await;
        dm.run_once().await;

        assert_eq!(delivered.lock().len(), 1);
    }

    #[tokio::test]
    async fn new_container_triggers_redelivery() {
        let runtime = Arc::new(MockRuntime::new());
        runtime.state.lock().labeled = vec![container("d1", "d1.local")];
        let (dm, delivered) = discovery_with(Arc::clone(&runtime), static_config(Vec::new()));

        dm.run_once().await;
        runtime.state.lock().labeled.push(container("d2", "d2.local"));
        dm.run_once().await;

        let views = delivered.lock();
        assert_eq!(views.len(), 2);
        assert_eq!(views[1].containers.len(), 2);
    }

    #[tokio::test]
    async fn update_static_clears_cache_and_redelivers() {
        let runtime = Arc::new(MockRuntime::new());
        runtime.state.lock().labeled = vec![container("d1", "d1.local")];
        let (dm, delivered) = discovery_with(runtime, static_config(Vec::new()));

        dm.run_once().await;
        assert_eq!(delivered.lock().len(), 1);

        // Same merge result, but the cleared cache forces redelivery.
        dm.update_static(static_config(Vec::new())).await;
        assert_eq!(delivered.lock().len(), 2);
    }
}
