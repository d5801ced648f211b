//! Container lifecycle orchestration: starting containers on demand,
//! serialising concurrent start attempts, tracking request activity and
//! stopping idle containers.

use crate::config::{format_duration, ContainerConfig, GroupConfig, SharedRouting};
use crate::docker::ContainerRuntime;
use crate::group::topological_sort;
use crate::metrics::metrics;
use anyhow::{anyhow, bail, Context};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Cadence of the idle sweeper.
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Poll interval while waiting for the runtime to report "running".
const START_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Lifecycle state of a container start attempt, as reported to the holding
/// page via `/_health`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartStatus {
    /// No start attempt has been recorded.
    Unknown,
    Starting,
    Running,
    Failed,
}

impl StartStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StartStatus::Unknown => "unknown",
            StartStatus::Starting => "starting",
            StartStatus::Running => "running",
            StartStatus::Failed => "failed",
        }
    }
}

/// Current state of a container start attempt.
#[derive(Debug, Clone)]
pub struct StartState {
    pub status: StartStatus,
    pub error: String,
}

struct ManagerState {
    /// Per-container locks serialising start attempts.
    locks: HashMap<String, Arc<tokio::sync::Mutex<()>>>,
    /// Last successfully proxied request per container.
    last_seen: HashMap<String, DateTime<Utc>>,
    start_states: HashMap<String, StartState>,
}

/// Orchestrates container lifecycle: starting on demand, preventing
/// concurrent starts, and auto-stopping idle containers.
pub struct ContainerManager {
    runtime: Arc<dyn ContainerRuntime>,
    state: Mutex<ManagerState>,
}

impl ContainerManager {
    pub fn new(runtime: Arc<dyn ContainerRuntime>) -> Self {
        Self {
            runtime,
            state: Mutex::new(ManagerState {
                locks: HashMap::new(),
                last_seen: HashMap::new(),
                start_states: HashMap::new(),
            }),
        }
    }

    pub fn runtime(&self) -> &Arc<dyn ContainerRuntime> {
        &self.runtime
    }

    /// Returns (or lazily creates) the per-container start lock.
    fn get_lock(&self, name: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut state = self.state.lock();
        Arc::clone(
            state
                .locks
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(()))),
        )
    }

    fn set_start_state(&self, name: &str, status: StartStatus, error: &str) {
        self.state.lock().start_states.insert(
            name.to_string(),
            StartState {
                status,
                error: error.to_string(),
            },
        );
    }

    /// Current start state for a container; `Unknown` when no attempt has
    /// been recorded.
    pub fn get_start_state(&self, name: &str) -> StartState {
        self.state
            .lock()
            .start_states
            .get(name)
            .cloned()
            .unwrap_or(StartState {
                status: StartStatus::Unknown,
                error: String::new(),
            })
    }

    /// Marks a container as "starting" before the async orchestrator fires,
    /// so the first `/_health` poll never sees "unknown".
    pub fn init_start_state(&self, name: &str) {
        self.set_start_state(name, StartStatus::Starting, "");
    }

    /// Records the current time as the container's last activity. Called on
    /// every successfully proxied request.
    pub fn record_activity(&self, name: &str) {
        self.state
            .lock()
            .last_seen
            .insert(name.to_string(), Utc::now());
    }

    pub fn get_last_seen(&self, name: &str) -> Option<DateTime<Utc>> {
        self.state.lock().last_seen.get(name).copied()
    }

    /// Checks whether a container is running and, if not, starts it.
    /// Flow: start -> poll until "running" -> readiness probe -> mark ready,
    /// with `start_timeout` as the budget for the whole sequence. Concurrent
    /// calls for the same container collapse into a single start.
    pub async fn ensure_running(&self, cfg: &ContainerConfig) -> anyhow::Result<()> {
        let status = self.status_or_fail(&cfg.name).await?;
        if status == "running" {
            return self
                .probe_ready(cfg, Instant::now() + cfg.start_timeout)
                .await;
        }

        let lock = self.get_lock(&cfg.name);
        let _guard = lock.lock().await;

        // Double-check under the lock: another request may have started it.
        let status = self.status_or_fail(&cfg.name).await?;
        if status == "running" {
            return self
                .probe_ready(cfg, Instant::now() + cfg.start_timeout)
                .await;
        }

        let begun = Instant::now();
        let result = self.start_and_wait(cfg).await;
        metrics().record_start(&cfg.name, result.is_ok(), begun.elapsed());
        result
    }

    async fn status_or_fail(&self, name: &str) -> anyhow::Result<String> {
        match self.runtime.status(name).await {
            Ok(s) => Ok(s),
            Err(e) => {
                self.set_start_state(name, StartStatus::Failed, &format!("inspect error: {e}"));
                Err(e)
            }
        }
    }

    async fn start_and_wait(&self, cfg: &ContainerConfig) -> anyhow::Result<()> {
        self.set_start_state(&cfg.name, StartStatus::Starting, "");
        if let Err(e) = self.runtime.start(&cfg.name).await {
            let msg = format!("docker start failed: {e}");
            self.set_start_state(&cfg.name, StartStatus::Failed, &msg);
            bail!(msg);
        }

        // Poll until the runtime reports "running" or the budget elapses.
        let deadline = Instant::now() + cfg.start_timeout;
        loop {
            tokio::time::sleep(START_POLL_INTERVAL.min(cfg.start_timeout)).await;

            let status = match self.runtime.status(&cfg.name).await {
                Ok(s) => s,
                Err(_) => {
                    if Instant::now() >= deadline {
                        return self.fail_timeout(cfg);
                    }
                    continue;
                }
            };
            if status == "running" {
                return self.probe_ready(cfg, deadline).await;
            }
            if status == "exited" || status == "dead" {
                let msg = format!("container exited unexpectedly (status={status})");
                self.set_start_state(&cfg.name, StartStatus::Failed, &msg);
                bail!(msg);
            }
            if Instant::now() >= deadline {
                return self.fail_timeout(cfg);
            }
        }
    }

    fn fail_timeout(&self, cfg: &ContainerConfig) -> anyhow::Result<()> {
        let msg = format!("start timeout after {}", format_duration(cfg.start_timeout));
        self.set_start_state(&cfg.name, StartStatus::Failed, &msg);
        bail!(msg)
    }

    /// Probes ip:port until the app answers or the deadline passes, then
    /// marks the container running. A non-empty `health_path` selects an
    /// HTTP probe, otherwise a raw TCP dial.
    async fn probe_ready(&self, cfg: &ContainerConfig, deadline: Instant) -> anyhow::Result<()> {
        let ip = match self.runtime.address(&cfg.name, &cfg.network).await {
            Ok(ip) => ip,
            Err(e) => {
                let msg = format!("cannot resolve container address: {e}");
                self.set_start_state(&cfg.name, StartStatus::Failed, &msg);
                bail!(msg);
            }
        };

        let budget = deadline.saturating_duration_since(Instant::now());
        let probe = if cfg.health_path.is_empty() {
            self.runtime.probe_tcp(&ip, &cfg.target_port, budget).await
        } else {
            self.runtime
                .probe_http(&ip, &cfg.target_port, &cfg.health_path, budget)
                .await
        };
        if let Err(e) = probe {
            let msg = format!("app not responding on port {}: {e}", cfg.target_port);
            self.set_start_state(&cfg.name, StartStatus::Failed, &msg);
            bail!(msg);
        }

        self.set_start_state(&cfg.name, StartStatus::Running, "");
        Ok(())
    }

    /// Starts `target` and everything it depends on, dependencies first.
    /// Each dependency must pass its readiness probe before the next one
    /// begins; the first failure aborts the chain.
    pub async fn ensure_deps_running(
        &self,
        target: &str,
        containers: &[ContainerConfig],
    ) -> anyhow::Result<()> {
        let order = topological_sort(target, containers)?;

        for name in order.iter().filter(|n| n.as_str() != target) {
            if matches!(self.runtime.status(name).await.as_deref(), Ok("running")) {
                continue;
            }
            let cfg = containers
                .iter()
                .find(|c| &c.name == name)
                .ok_or_else(|| anyhow!("dependency {name:?} not found in container list"))?;
            self.ensure_running(cfg)
                .await
                .with_context(|| format!("dependency {name:?} failed to start"))?;
        }

        let cfg = containers
            .iter()
            .find(|c| c.name == target)
            .ok_or_else(|| anyhow!("target container {target:?} not found"))?;
        self.ensure_running(cfg).await
    }

    /// Starts every member of a group (each with its own dependencies). A
    /// member failure is logged but does not abort the others; group
    /// readiness is re-evaluated lazily by the next request.
    pub async fn ensure_group_running(
        &self,
        group: &GroupConfig,
        containers: &[ContainerConfig],
    ) -> anyhow::Result<()> {
        for member in &group.containers {
            if let Err(e) = self.ensure_deps_running(member, containers).await {
                warn!(group = %group.name, container = %member, error = %e,
                    "group member failed to start");
            }
        }
        Ok(())
    }

    /// Spawns the background idle sweeper. Every minute it compares each
    /// container's last activity against its idle_timeout and stops the ones
    /// that have been quiet too long.
    pub fn spawn_idle_sweeper(
        self: Arc<Self>,
        routing: SharedRouting,
        mut shutdown_rx: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(SWEEP_INTERVAL) => {
                        let snapshot = Arc::clone(&routing.read());
                        self.check_idle(&snapshot.config.containers).await;
                    }
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            return;
                        }
                    }
                }
            }
        })
    }

    /// One sweep pass. Containers with idle_timeout 0 and containers that
    /// never saw a request are left alone; per-container errors are logged
    /// and do not affect the rest.
    pub async fn check_idle(&self, containers: &[ContainerConfig]) {
        let snapshot: HashMap<String, DateTime<Utc>> = self.state.lock().last_seen.clone();
        let now = Utc::now();

        for cfg in containers {
            if cfg.idle_timeout.is_zero() {
                continue;
            }
            let Some(last) = snapshot.get(&cfg.name) else {
                continue;
            };
            let idle = now
                .signed_duration_since(*last)
                .to_std()
                .unwrap_or_default();
            if idle < cfg.idle_timeout {
                continue;
            }

            match self.runtime.status(&cfg.name).await {
                Ok(status) if status == "running" => {}
                _ => continue,
            }

            info!(container = %cfg.name, idle = %format_duration(idle), "stopping idle container");
            match self.runtime.stop(&cfg.name).await {
                Ok(()) => {
                    // Reset start state so the next request begins a fresh cycle.
                    self.state.lock().start_states.remove(&cfg.name);
                    metrics().record_idle_stop(&cfg.name);
                }
                Err(e) => {
                    warn!(container = %cfg.name, error = %e, "failed to stop idle container");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockRuntime;

    fn container(name: &str) -> ContainerConfig {
        ContainerConfig {
            name: name.to_string(),
            host: format!("{name}.localhost"),
            target_port: "80".to_string(),
            start_timeout: Duration::from_secs(5),
            redirect_path: "/".to_string(),
            ..Default::default()
        }
    }

    fn manager_with(runtime: Arc<MockRuntime>) -> Arc<ContainerManager> {
        Arc::new(ContainerManager::new(runtime))
    }

    #[test]
    fn start_state_lifecycle() {
        let manager = manager_with(Arc::new(MockRuntime::new()));

        let state = manager.get_start_state("web");
        assert_eq!(state.status, StartStatus::Unknown);
        assert!(state.error.is_empty());

        manager.init_start_state("web");
        assert_eq!(manager.get_start_state("web").status, StartStatus::Starting);

        manager.set_start_state("web", StartStatus::Failed, "boom");
        let state = manager.get_start_state("web");
        assert_eq!(state.status, StartStatus::Failed);
        assert_eq!(state.error, "boom");
    }

    #[test]
    fn record_activity_is_visible() {
        let manager = manager_with(Arc::new(MockRuntime::new()));
        assert!(manager.get_last_seen("web").is_none());

        let before = Utc::now();
        manager.record_activity("web");
        let seen = manager.get_last_seen("web").unwrap();
        assert!(seen >= before);
    }

    #[tokio::test]
    async fn ensure_running_starts_and_probes_stopped_container() {
        let runtime = Arc::new(MockRuntime::new());
        runtime.set_status("web", "exited");
        let manager = manager_with(Arc::clone(&runtime));

        manager.ensure_running(&container("web")).await.unwrap();

        assert_eq!(runtime.start_calls(), vec!["web"]);
        assert_eq!(runtime.state.lock().tcp_probes.len(), 1);
        assert_eq!(manager.get_start_state("web").status, StartStatus::Running);
    }

    #[tokio::test]
    async fn ensure_running_uses_http_probe_when_health_path_set() {
        let runtime = Arc::new(MockRuntime::new());
        runtime.set_status("web", "exited");
        let manager = manager_with(Arc::clone(&runtime));

        let mut cfg = container("web");
        cfg.health_path = "/healthz".to_string();
        manager.ensure_running(&cfg).await.unwrap();

        let state = runtime.state.lock();
        assert!(state.tcp_probes.is_empty());
        assert_eq!(
            state.http_probes,
            vec![("172.17.0.2".to_string(), "80".to_string(), "/healthz".to_string())]
        );
    }

    #[tokio::test]
    async fn concurrent_wakes_collapse_into_one_start() {
        let runtime = Arc::new(MockRuntime::new());
        runtime.set_status("web", "exited");
        runtime.state.lock().start_delay = Some(Duration::from_millis(20));
        let manager = manager_with(Arc::clone(&runtime));

        let mut handles = Vec::new();
        for _ in 0..100 {
            let manager = Arc::clone(&manager);
            let cfg = container("web");
            handles.push(tokio::spawn(async move { manager.ensure_running(&cfg).await }));
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }

        assert_eq!(runtime.start_calls().len(), 1);
        assert_eq!(manager.get_start_state("web").status, StartStatus::Running);
    }

    #[tokio::test]
    async fn container_that_exits_marks_failed() {
        let runtime = Arc::new(MockRuntime::new());
        runtime.set_status("fail-app", "created");
        runtime
            .state
            .lock()
            .on_start
            .insert("fail-app".to_string(), "exited".to_string());
        let manager = manager_with(Arc::clone(&runtime));

        let err = manager
            .ensure_running(&container("fail-app"))
            .await
            .unwrap_err()
            .to_string();
        assert!(err.contains("exited unexpectedly"), "got: {err}");

        let state = manager.get_start_state("fail-app");
        assert_eq!(state.status, StartStatus::Failed);
        assert_eq!(state.error, "container exited unexpectedly (status=exited)");
    }

    #[tokio::test]
    async fn start_failure_is_sticky() {
        let runtime = Arc::new(MockRuntime::new());
        runtime.set_status("web", "exited");
        runtime
            .state
            .lock()
            .fail_start
            .insert("web".to_string(), "disk full".to_string());
        let manager = manager_with(Arc::clone(&runtime));

        assert!(manager.ensure_running(&container("web")).await.is_err());
        let state = manager.get_start_state("web");
        assert_eq!(state.status, StartStatus::Failed);
        assert!(state.error.contains("docker start failed"), "got: {}", state.error);
    }

    #[tokio::test]
    async fn start_timeout_marks_failed() {
        let runtime = Arc::new(MockRuntime::new());
        runtime.set_status("web", "created");
        // Stays "created" after start: never reaches "running".
        runtime
            .state
            .lock()
            .on_start
            .insert("web".to_string(), "created".to_string());
        let manager = manager_with(Arc::clone(&runtime));

        let mut cfg = container("web");
        cfg.start_timeout = Duration::from_millis(50);
        let err = manager.ensure_running(&cfg).await.unwrap_err().to_string();
        assert!(err.contains("start timeout"), "got: {err}");
        assert_eq!(manager.get_start_state("web").status, StartStatus::Failed);
    }

    #[tokio::test]
    async fn probe_failure_marks_failed() {
        let runtime = Arc::new(MockRuntime::new());
        runtime.set_status("web", "exited");
        runtime.state.lock().probe_ok = false;
        let manager = manager_with(Arc::clone(&runtime));

        let err = manager
            .ensure_running(&container("web"))
            .await
            .unwrap_err()
            .to_string();
        assert!(err.contains("not responding on port 80"), "got: {err}");
        assert_eq!(manager.get_start_state("web").status, StartStatus::Failed);
    }

    #[tokio::test]
    async fn address_failure_marks_failed() {
        let runtime = Arc::new(MockRuntime::new());
        runtime.set_status("web", "running");
        runtime.state.lock().no_address.insert("web".to_string());
        let manager = manager_with(Arc::clone(&runtime));

        let err = manager
            .ensure_running(&container("web"))
            .await
            .unwrap_err()
            .to_string();
        assert!(err.contains("cannot resolve container address"), "got: {err}");
        assert_eq!(manager.get_start_state("web").status, StartStatus::Failed);
    }

    #[tokio::test]
    async fn deps_start_in_topological_order() {
        let runtime = Arc::new(MockRuntime::new());
        runtime.set_status("db", "exited");
        runtime.set_status("api", "exited");
        runtime.set_status("app", "exited");
        let manager = manager_with(Arc::clone(&runtime));

        let mut app = container("app");
        app.depends_on = vec!["api".to_string()];
        let mut api = container("api");
        api.depends_on = vec!["db".to_string()];
        let containers = vec![app, api, container("db")];

        manager.ensure_deps_running("app", &containers).await.unwrap();

        assert_eq!(runtime.start_calls(), vec!["db", "api", "app"]);
        for name in ["db", "api", "app"] {
            assert_eq!(manager.get_start_state(name).status, StartStatus::Running);
        }
    }

    #[tokio::test]
    async fn deps_already_running_are_skipped() {
        let runtime = Arc::new(MockRuntime::new());
        runtime.set_status("db", "running");
        runtime.set_status("app", "exited");
        let manager = manager_with(Arc::clone(&runtime));

        let mut app = container("app");
        app.depends_on = vec!["db".to_string()];
        let containers = vec![app, container("db")];

        manager.ensure_deps_running("app", &containers).await.unwrap();
        assert_eq!(runtime.start_calls(), vec!["app"]);
    }

    #[tokio::test]
    async fn dep_failure_aborts_chain() {
        let runtime = Arc::new(MockRuntime::new());
        runtime.set_status("db", "exited");
        runtime.set_status("app", "exited");
        runtime
            .state
            .lock()
            .fail_start
            .insert("db".to_string(), "refused".to_string());
        let manager = manager_with(Arc::clone(&runtime));

        let mut app = container("app");
        app.depends_on = vec!["db".to_string()];
        let containers = vec![app, container("db")];

        let err = manager
            .ensure_deps_running("app", &containers)
            .await
            .unwrap_err()
            .to_string();
        assert!(err.contains("db"), "got: {err}");
        // The target was never started.
        assert_eq!(runtime.start_calls(), vec!["db"]);
    }

    #[tokio::test]
    async fn group_member_failure_does_not_abort_others() {
        let runtime = Arc::new(MockRuntime::new());
        runtime.set_status("api-1", "exited");
        runtime.set_status("api-2", "exited");
        runtime
            .state
            .lock()
            .fail_start
            .insert("api-1".to_string(), "refused".to_string());
        let manager = manager_with(Arc::clone(&runtime));

        let group = GroupConfig {
            name: "cluster".to_string(),
            host: "cluster.localhost".to_string(),
            strategy: "round-robin".to_string(),
            containers: vec!["api-1".to_string(), "api-2".to_string()],
        };
        let containers = vec![container("api-1"), container("api-2")];

        manager.ensure_group_running(&group, &containers).await.unwrap();

        assert_eq!(runtime.start_calls(), vec!["api-1", "api-2"]);
        assert_eq!(manager.get_start_state("api-2").status, StartStatus::Running);
    }

    #[tokio::test]
    async fn sweeper_stops_idle_container_and_clears_state() {
        let runtime = Arc::new(MockRuntime::new());
        runtime.set_status("web", "running");
        let manager = manager_with(Arc::clone(&runtime));

        let mut cfg = container("web");
        cfg.idle_timeout = Duration::from_millis(10);
        manager.init_start_state("web");
        manager.record_activity("web");
        tokio::time::sleep(Duration::from_millis(30)).await;

        manager.check_idle(&[cfg]).await;

        assert_eq!(runtime.stop_calls(), vec!["web"]);
        assert_eq!(manager.get_start_state("web").status, StartStatus::Unknown);
    }

    #[tokio::test]
    async fn sweeper_leaves_fresh_and_exempt_containers_alone() {
        let runtime = Arc::new(MockRuntime::new());
        runtime.set_status("fresh", "running");
        runtime.set_status("forever", "running");
        runtime.set_status("unseen", "running");
        let manager = manager_with(Arc::clone(&runtime));

        let mut fresh = container("fresh");
        fresh.idle_timeout = Duration::from_secs(3600);
        manager.record_activity("fresh");

        // idle_timeout 0: never auto-stopped, even with old activity.
        let forever = container("forever");
        manager.record_activity("forever");

        // Never saw a request: not eligible.
        let mut unseen = container("unseen");
        unseen.idle_timeout = Duration::from_millis(1);

        manager.check_idle(&[fresh, forever, unseen]).await;
        assert!(runtime.stop_calls().is_empty());
    }

    #[tokio::test]
    async fn sweeper_skips_container_not_running() {
        let runtime = Arc::new(MockRuntime::new());
        runtime.set_status("web", "exited");
        let manager = manager_with(Arc::clone(&runtime));

        let mut cfg = container("web");
        cfg.idle_timeout = Duration::from_millis(1);
        manager.record_activity("web");
        tokio::time::sleep(Duration::from_millis(10)).await;

        manager.check_idle(&[cfg]).await;
        assert!(runtime.stop_calls().is_empty());
    }
}
