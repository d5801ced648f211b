//! Test doubles shared across the unit tests. `MockRuntime` stands in for
//! the Docker daemon so lifecycle and dispatch behaviour can be exercised
//! without containers.

use crate::config::ContainerConfig;
use crate::docker::{ContainerInfo, ContainerNotFound, ContainerRuntime};
use anyhow::bail;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::time::Duration;

pub(crate) struct MockRuntime {
    pub state: Mutex<MockState>,
}

#[derive(Default)]
pub(crate) struct MockState {
    /// Current status per container; a missing entry means "no such container".
    pub statuses: HashMap<String, String>,
    /// Status a container transitions to on `start` (default "running").
    pub on_start: HashMap<String, String>,
    /// Containers whose `start` call errors with the given message.
    pub fail_start: HashMap<String, String>,
    /// Containers whose IP lookup fails.
    pub no_address: HashSet<String>,
    /// IP returned per container; falls back to a fixed mock address.
    pub addresses: HashMap<String, String>,
    /// Whether readiness probes succeed.
    pub probe_ok: bool,
    /// Containers returned by label discovery.
    pub labeled: Vec<ContainerConfig>,
    /// Canned log lines per container.
    pub logs: HashMap<String, Vec<String>>,
    /// Artificial latency injected into `start`, to widen race windows.
    pub start_delay: Option<Duration>,

    pub start_calls: Vec<String>,
    pub stop_calls: Vec<String>,
    pub tcp_probes: Vec<(String, String)>,
    pub http_probes: Vec<(String, String, String)>,
}

impl MockRuntime {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockState {
                probe_ok: true,
                ..Default::default()
            }),
        }
    }

    pub fn set_status(&self, name: &str, status: &str) {
        self.state
            .lock()
            .statuses
            .insert(name.to_string(), status.to_string());
    }

    pub fn start_calls(&self) -> Vec<String> {
        self.state.lock().start_calls.clone()
    }

    pub fn stop_calls(&self) -> Vec<String> {
        self.state.lock().stop_calls.clone()
    }
}

#[async_trait]
impl ContainerRuntime for MockRuntime {
    async fn status(&self, name: &str) -> anyhow::Result<String> {
        match self.state.lock().statuses.get(name) {
            Some(s) => Ok(s.clone()),
            None => Err(anyhow::Error::new(ContainerNotFound(name.to_string()))),
        }
    }

    async fn inspect(&self, name: &str) -> anyhow::Result<ContainerInfo> {
        let status = self.status(name).await?;
        Ok(ContainerInfo {
            status,
            image: "mock:latest".to_string(),
            ..Default::default()
        })
    }

    async fn start(&self, name: &str) -> anyhow::Result<()> {
        let delay = {
            let mut state = self.state.lock();
            state.start_calls.push(name.to_string());
            if let Some(msg) = state.fail_start.get(name) {
                let msg = msg.clone();
                drop(state);
                bail!(msg);
            }
            let next = state
                .on_start
                .get(name)
                .cloned()
                .unwrap_or_else(|| "running".to_string());
            state.statuses.insert(name.to_string(), next);
            state.start_delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(())
    }

    async fn stop(&self, name: &str) -> anyhow::Result<()> {
        let mut state = self.state.lock();
        state.stop_calls.push(name.to_string());
        state
            .statuses
            .insert(name.to_string(), "exited".to_string());
        Ok(())
    }

    async fn discover_labeled(&self) -> anyhow::Result<Vec<ContainerConfig>> {
        Ok(self.state.lock().labeled.clone())
    }

    async fn address(&self, name: &str, _network: &str) -> anyhow::Result<String> {
        let state = self.state.lock();
        if state.no_address.contains(name) {
            bail!("container {name} has no network interfaces");
        }
        Ok(state
            .addresses
            .get(name)
            .cloned()
            .unwrap_or_else(|| "172.17.0.2".to_string()))
    }

    async fn probe_tcp(&self, ip: &str, port: &str, _budget: Duration) -> anyhow::Result<()> {
        let mut state = self.state.lock();
        state.tcp_probes.push((ip.to_string(), port.to_string()));
        if state.probe_ok {
            Ok(())
        } else {
            bail!("TCP probe timed out for {ip}:{port}")
        }
    }

    async fn probe_http(
        &self,
        ip: &str,
        port: &str,
        path: &str,
        _budget: Duration,
    ) -> anyhow::Result<()> {
        let mut state = self.state.lock();
        state
            .http_probes
            .push((ip.to_string(), port.to_string(), path.to_string()));
        if state.probe_ok {
            Ok(())
        } else {
            bail!("HTTP probe timed out for {ip}:{port}{path}")
        }
    }

    async fn tail_logs(&self, name: &str, n: usize) -> anyhow::Result<Vec<String>> {
        let lines = self
            .state
            .lock()
            .logs
            .get(name)
            .cloned()
            .unwrap_or_default();
        Ok(lines.into_iter().rev().take(n).rev().collect())
    }
}
