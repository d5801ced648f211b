//! Container group routing and dependency ordering.

use crate::config::{ContainerConfig, GroupConfig};
use anyhow::bail;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Selects the next container from a group. Currently round-robin only;
/// extensible to weighted strategies.
pub struct GroupRouter {
    counters: Mutex<HashMap<String, Arc<AtomicU64>>>,
}

impl GroupRouter {
    pub fn new() -> Self {
        Self {
            counters: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the next member name from the group via round-robin. The
    /// per-group counter persists across calls, so the rotation continues
    /// where the previous request left off.
    pub fn pick(&self, group: &GroupConfig) -> String {
        match group.containers.len() {
            0 => return String::new(),
            1 => return group.containers[0].clone(),
            _ => {}
        }

        let counter = {
            let mut counters = self.counters.lock();
            Arc::clone(
                counters
                    .entry(group.name.clone())
                    .or_insert_with(|| Arc::new(AtomicU64::new(0))),
            )
        };

        let idx = counter.fetch_add(1, Ordering::Relaxed);
        group.containers[(idx % group.containers.len() as u64) as usize].clone()
    }
}

impl Default for GroupRouter {
    fn default() -> Self {
        Self::new()
    }
}

/// Returns container names in dependency-first order for `target`, with the
/// target itself last. Errors on cycles and on dependencies that are not in
/// the container list.
pub fn topological_sort(
    target: &str,
    containers: &[ContainerConfig],
) -> anyhow::Result<Vec<String>> {
    let by_name: HashMap<&str, &ContainerConfig> =
        containers.iter().map(|c| (c.name.as_str(), c)).collect();

    if !by_name.contains_key(target) {
        bail!("target container {target:?} not found");
    }

    fn visit<'a>(
        name: &'a str,
        by_name: &HashMap<&'a str, &'a ContainerConfig>,
        visiting: &mut HashMap<&'a str, bool>,
        visited: &mut HashMap<&'a str, bool>,
        order: &mut Vec<String>,
    ) -> anyhow::Result<()> {
        if visited.get(name).copied().unwrap_or(false) {
            return Ok(());
        }
        if visiting.get(name).copied().unwrap_or(false) {
            bail!("dependency cycle detected involving {name:?}");
        }
        visiting.insert(name, true);

        let Some(cfg) = by_name.get(name) else {
            bail!("dependency {name:?} not found in container list");
        };
        for dep in &cfg.depends_on {
            visit(dep, by_name, visiting, visited, order)?;
        }

        visiting.insert(name, false);
        visited.insert(name, true);
        order.push(name.to_string());
        Ok(())
    }

    let mut order = Vec::new();
    visit(
        target,
        &by_name,
        &mut HashMap::new(),
        &mut HashMap::new(),
        &mut order,
    )?;
    Ok(order)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn container(name: &str, deps: &[&str]) -> ContainerConfig {
        ContainerConfig {
            name: name.to_string(),
            host: format!("{name}.localhost"),
            target_port: "80".to_string(),
            depends_on: deps.iter().map(|d| d.to_string()).collect(),
            ..Default::default()
        }
    }

    fn group(name: &str, members: &[&str]) -> GroupConfig {
        GroupConfig {
            name: name.to_string(),
            host: format!("{name}.localhost"),
            strategy: "round-robin".to_string(),
            containers: members.iter().map(|m| m.to_string()).collect(),
        }
    }

    #[test]
    fn topo_chain_orders_dependencies_first() {
        let containers = vec![
            container("app", &["api"]),
            container("api", &["db"]),
            container("db", &[]),
        ];
        let order = topological_sort("app", &containers).unwrap();
        assert_eq!(order, vec!["db", "api", "app"]);
    }

    #[test]
    fn topo_diamond_keeps_target_last() {
        let containers = vec![
            container("app", &["left", "right"]),
            container("left", &["base"]),
            container("right", &["base"]),
            container("base", &[]),
        ];
        let order = topological_sort("app", &containers).unwrap();

        assert_eq!(order.last().map(String::as_str), Some("app"));
        let pos = |n: &str| order.iter().position(|x| x == n).unwrap();
        assert!(pos("base") < pos("left"));
        assert!(pos("base") < pos("right"));
        assert!(pos("left") < pos("app"));
        assert!(pos("right") < pos("app"));
    }

    #[test]
    fn topo_no_dependencies_is_target_only() {
        let containers = vec![container("solo", &[])];
        assert_eq!(topological_sort("solo", &containers).unwrap(), vec!["solo"]);
    }

    #[test]
    fn topo_rejects_cycle() {
        let containers = vec![container("a", &["b"]), container("b", &["a"])];
        let err = topological_sort("a", &containers).unwrap_err().to_string();
        assert!(err.contains("dependency cycle detected"), "got: {err}");
    }

    #[test]
    fn topo_rejects_unknown_target_and_dependency() {
        let containers = vec![container("a", &["ghost"])];
        assert!(topological_sort("missing", &containers).is_err());

        let err = topological_sort("a", &containers).unwrap_err().to_string();
        assert!(err.contains("ghost"), "got: {err}");
    }

    #[test]
    fn round_robin_cycles_and_wraps() {
        let router = GroupRouter::new();
        let g = group("cluster", &["api-1", "api-2", "api-3"]);

        assert_eq!(router.pick(&g), "api-1");
        assert_eq!(router.pick(&g), "api-2");
        assert_eq!(router.pick(&g), "api-3");
        // Counter persists: fourth pick wraps to the first member.
        assert_eq!(router.pick(&g), "api-1");
    }

    #[test]
    fn round_robin_counters_are_per_group() {
        let router = GroupRouter::new();
        let a = group("a", &["a1", "a2"]);
        let b = group("b", &["b1", "b2"]);

        assert_eq!(router.pick(&a), "a1");
        assert_eq!(router.pick(&b), "b1");
        assert_eq!(router.pick(&a), "a2");
        assert_eq!(router.pick(&b), "b2");
    }

    #[test]
    fn single_member_short_circuits() {
        let router = GroupRouter::new();
        let g = group("solo", &["only"]);
        assert_eq!(router.pick(&g), "only");
        assert_eq!(router.pick(&g), "only");
        // No counter is allocated for single-member groups.
        assert!(router.counters.lock().is_empty());
    }

    #[test]
    fn empty_group_returns_empty_sentinel() {
        let router = GroupRouter::new();
        let g = group("empty", &[]);
        assert_eq!(router.pick(&g), "");
    }
}
