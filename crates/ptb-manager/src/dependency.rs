//! §4.7: Application Dependency Engine. Builds the cross-Instance DAG,
//! validates it, estimates the maximum experiment runtime, and drives the
//! deferred-start rendezvous as Applications report state changes.
//!
//! Mirrors the Python `AppDependencyHelper`/`ReverseApplicationDependency`
//! pair. The graph here is small (one node per Application in a testbed),
//! so it is walked by hand with `HashMap`/`HashSet` rather than pulling in
//! a general-purpose graph crate.

use std::collections::{HashMap, HashSet};

use anyhow::{Result, bail};
use ptb_core::config::{Application, DependencyAt, TestbedConfig};

const PER_HOP_DELAY_OFFSET: u64 = 1;

/// Identifies one Application uniquely across the whole testbed.
pub type AppKey = (String, String);

fn key_for(instance: &str, app: &str) -> AppKey {
    (instance.to_string(), app.to_string())
}

/// One unsatisfied inbound edge of a deferred-start Application.
#[derive(Debug, Clone)]
struct ReverseDependency {
    instance: String,
    application: String,
    at: DependencyAt,
    satisfied: bool,
}

/// An Application waiting on one or more dependencies before it may start.
#[derive(Debug, Clone)]
struct DeferredStart {
    key: AppKey,
    deps: Vec<ReverseDependency>,
}

impl DeferredStart {
    /// Mark every matching inbound edge satisfied; if the whole set is now
    /// satisfied, yield this Application for start. Idempotent on replay —
    /// an edge that is already satisfied is simply matched again.
    fn satisfy_and_check(&mut self, reporting_instance: &str, reporting_app: &str, at: DependencyAt) -> Option<AppKey> {
        if self.deps.iter().all(|d| d.satisfied) {
            return None;
        }
        for dep in &mut self.deps {
            if dep.instance == reporting_instance && dep.application == reporting_app && dep.at == at {
                dep.satisfied = true;
            }
        }
        if self.deps.iter().all(|d| d.satisfied) {
            Some(self.key.clone())
        } else {
            None
        }
    }
}

pub struct DependencyEngine {
    apps: HashMap<AppKey, Application>,
    /// Forward edges: u -> v means v depends on u.
    edges: HashMap<AppKey, Vec<AppKey>>,
    deferred: Vec<DeferredStart>,
    instant_start: Vec<AppKey>,
}

impl DependencyEngine {
    /// Build and validate the dependency graph for `config`. Fails the run
    /// before any Instance is started if the graph is invalid.
    pub fn build(config: &TestbedConfig) -> Result<Self> {
        let mut apps: HashMap<AppKey, Application> = HashMap::new();
        for instance in &config.instances {
            for app in &instance.applications {
                apps.insert(key_for(&instance.name, &app.name), app.clone());
            }
        }

        let mut edges: HashMap<AppKey, Vec<AppKey>> = HashMap::new();
        for key in apps.keys() {
            edges.entry(key.clone()).or_default();
        }

        for instance in &config.instances {
            for app in &instance.applications {
                let this_key = key_for(&instance.name, &app.name);
                for dep in &app.dependencies {
                    let dep_key = key_for(&dep.instance, &dep.application);
                    let target = apps.get(&dep_key).ok_or_else(|| {
                        anyhow::anyhow!(
                            "Application '{}.{}' depends on '{}.{}', but it does not exist",
                            instance.name,
                            app.name,
                            dep.instance,
                            dep.application
                        )
                    })?;
                    if dep.at == DependencyAt::Finish && target.is_daemon() {
                        bail!(
                            "Application '{}.{}' depends on daemon '{}.{}' finishing, but daemons never finish",
                            instance.name,
                            app.name,
                            dep.instance,
                            dep.application
                        );
                    }
                    edges.entry(dep_key).or_default().push(this_key.clone());
                }
            }
        }

        let engine = DependencyEngine {
            apps,
            edges,
            deferred: Vec::new(),
            instant_start: Vec::new(),
        };
        engine.check_reachable_and_acyclic()?;
        Ok(engine)
    }

    fn roots(&self) -> Vec<AppKey> {
        self.apps
            .keys()
            .filter(|key| self.apps[*key].dependencies.is_empty())
            .cloned()
            .collect()
    }

    fn check_reachable_and_acyclic(&self) -> Result<()> {
        let roots = self.roots();
        let mut reachable: HashSet<AppKey> = HashSet::new();
        for root in &roots {
            self.dfs_collect(root, &mut reachable);
        }

        let all: HashSet<AppKey> = self.apps.keys().cloned().collect();
        if reachable != all {
            let unreachable: Vec<String> = all
                .difference(&reachable)
                .map(|(i, a)| format!("{a}@{i}"))
                .collect();
            bail!("Application dependency graph has unreachable nodes (disconnected subgraph?): {unreachable:?}");
        }

        // White/gray/black DFS cycle check over all nodes (roots already
        // cover every node given the reachability check above, but walk
        // explicitly from every node for clarity and defence in depth).
        let mut visiting: HashSet<AppKey> = HashSet::new();
        let mut done: HashSet<AppKey> = HashSet::new();
        for node in self.apps.keys() {
            self.dfs_cycle_check(node, &mut visiting, &mut done)?;
        }
        Ok(())
    }

    fn dfs_collect(&self, node: &AppKey, seen: &mut HashSet<AppKey>) {
        if !seen.insert(node.clone()) {
            return;
        }
        if let Some(children) = self.edges.get(node) {
            for child in children {
                self.dfs_collect(child, seen);
            }
        }
    }

    fn dfs_cycle_check(&self, node: &AppKey, visiting: &mut HashSet<AppKey>, done: &mut HashSet<AppKey>) -> Result<()> {
        if done.contains(node) {
            return Ok(());
        }
        if !visiting.insert(node.clone()) {
            bail!("Application dependency graph has a cycle through '{}.{}'", node.0, node.1);
        }
        if let Some(children) = self.edges.get(node) {
            for child in children {
                self.dfs_cycle_check(child, visiting, done)?;
            }
        }
        visiting.remove(node);
        done.insert(node.clone());
        Ok(())
    }

    /// Longest path across the DAG in seconds, subtracting a predecessor's
    /// contribution on an `at = start` edge, adding a one-second hop per
    /// edge, and 0 for daemon runtimes. 0 if every Application is a daemon.
    pub fn maximum_runtime(&self) -> u64 {
        if self.apps.values().all(|a| a.is_daemon()) {
            return 0;
        }

        let sinks: Vec<&AppKey> = self
            .apps
            .keys()
            .filter(|k| self.edges.get(*k).map(|v| v.is_empty()).unwrap_or(true))
            .collect();

        let mut max_runtime: i64 = 0;
        for root in self.roots() {
            for sink in &sinks {
                let mut paths = Vec::new();
                let mut path = vec![root.clone()];
                self.collect_simple_paths(&root, sink, &mut path, &mut paths);
                for path in paths {
                    max_runtime = max_runtime.max(self.path_runtime(&path));
                }
            }
        }
        max_runtime.max(0) as u64
    }

    fn collect_simple_paths(&self, current: &AppKey, target: &AppKey, path: &mut Vec<AppKey>, out: &mut Vec<Vec<AppKey>>) {
        if current == target {
            out.push(path.clone());
            return;
        }
        let Some(children) = self.edges.get(current) else { return };
        for child in children {
            if path.contains(child) {
                continue;
            }
            path.push(child.clone());
            self.collect_simple_paths(child, target, path, out);
            path.pop();
        }
    }

    fn path_runtime(&self, path: &[AppKey]) -> i64 {
        let mut runtime: i64 = 0;
        for (index, node) in path.iter().enumerate() {
            let app = &self.apps[node];
            if index > 0 {
                let prev = &path[index - 1];
                let prev_app = &self.apps[prev];
                let start_type = app
                    .dependencies
                    .iter()
                    .find(|d| d.instance == prev.0 && d.application == prev.1)
                    .map(|d| d.at);
                if let Some(DependencyAt::Start) = start_type {
                    if let Some(prev_runtime) = prev_app.runtime {
                        runtime -= prev_runtime as i64;
                    }
                }
                runtime += PER_HOP_DELAY_OFFSET as i64;
            }
            if let Some(app_runtime) = app.runtime {
                runtime += app_runtime as i64;
            }
            runtime += app.delay as i64;
        }
        runtime
    }

    /// Pre-compute the deferred-start table. Call once before the run
    /// starts; `instant_start` apps are exactly the DAG roots.
    pub fn compile_dependency_list(&mut self) -> &[AppKey] {
        self.instant_start.clear();
        self.deferred.clear();

        for (key, app) in &self.apps {
            if app.dependencies.is_empty() {
                self.instant_start.push(key.clone());
                continue;
            }
            let deps = app
                .dependencies
                .iter()
                .map(|d| ReverseDependency {
                    instance: d.instance.clone(),
                    application: d.application.clone(),
                    at: d.at,
                    satisfied: false,
                })
                .collect();
            self.deferred.push(DeferredStart { key: key.clone(), deps });
        }

        &self.instant_start
    }

    /// Applications ready to start as a result of this reported transition.
    pub fn satisfy(&mut self, reporting_instance: &str, reporting_app: &str, at: DependencyAt) -> Vec<AppKey> {
        self.deferred
            .iter_mut()
            .filter_map(|d| d.satisfy_and_check(reporting_instance, reporting_app, at))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_from(json: &str) -> TestbedConfig {
        TestbedConfig::from_json(json, true).unwrap()
    }

    #[test]
    fn test_daemon_only_testbed_has_zero_max_runtime() {
        let cfg = config_from(
            r#"{
                "settings": {"management_network": "10.0.0.0/24", "diskimage_basepath": "/x"},
                "networks": [],
                "instances": [
                    {"name": "a", "image": "a.img", "applications": [
                        {"application": "procmon", "name": "mon"}
                    ]}
                ]
            }"#,
        );
        let engine = DependencyEngine::build(&cfg).unwrap();
        assert_eq!(engine.maximum_runtime(), 0);
    }

    #[test]
    fn test_linear_finish_chain_sums_delay_runtime_and_hops() {
        let cfg = config_from(
            r#"{
                "settings": {"management_network": "10.0.0.0/24", "diskimage_basepath": "/x"},
                "networks": [],
                "instances": [
                    {"name": "a", "image": "a.img", "applications": [
                        {"application": "run-program", "name": "first", "runtime": 10},
                        {"application": "run-program", "name": "second", "runtime": 5,
                         "dependencies": [{"instance": "a", "application": "first", "at": "finish"}]}
                    ]}
                ]
            }"#,
        );
        let engine = DependencyEngine::build(&cfg).unwrap();
        // first: 10, +1 hop, second: 5 => 16
        assert_eq!(engine.maximum_runtime(), 16);
    }

    #[test]
    fn test_start_edge_subtracts_predecessor_runtime() {
        let cfg = config_from(
            r#"{
                "settings": {"management_network": "10.0.0.0/24", "diskimage_basepath": "/x"},
                "networks": [],
                "instances": [
                    {"name": "a", "image": "a.img", "applications": [
                        {"application": "run-program", "name": "first", "runtime": 10},
                        {"application": "run-program", "name": "second", "runtime": 5,
                         "dependencies": [{"instance": "a", "application": "first", "at": "start"}]}
                    ]}
                ]
            }"#,
        );
        let engine = DependencyEngine::build(&cfg).unwrap();
        // first: 10, +1 hop, -10 (start overlap), second: 5 => 6
        assert_eq!(engine.maximum_runtime(), 6);
    }

    #[test]
    fn test_compile_and_satisfy_yields_ready_application() {
        let cfg = config_from(
            r#"{
                "settings": {"management_network": "10.0.0.0/24", "diskimage_basepath": "/x"},
                "networks": [],
                "instances": [
                    {"name": "a", "image": "a.img", "applications": [
                        {"application": "run-program", "name": "first", "runtime": 10},
                        {"application": "run-program", "name": "second", "runtime": 5,
                         "dependencies": [{"instance": "a", "application": "first", "at": "finish"}]}
                    ]}
                ]
            }"#,
        );
        let mut engine = DependencyEngine::build(&cfg).unwrap();
        let initial = engine.compile_dependency_list().to_vec();
        assert_eq!(initial, vec![("a".to_string(), "first".to_string())]);

        let ready = engine.satisfy("a", "first", DependencyAt::Finish);
        assert_eq!(ready, vec![("a".to_string(), "second".to_string())]);

        // idempotent replay yields nothing further
        let replay = engine.satisfy("a", "first", DependencyAt::Finish);
        assert!(replay.is_empty());
    }

    #[test]
    fn test_cycle_is_rejected() {
        let cfg = config_from(
            r#"{
                "settings": {"management_network": "10.0.0.0/24", "diskimage_basepath": "/x"},
                "networks": [],
                "instances": [
                    {"name": "a", "image": "a.img", "applications": [
                        {"application": "run-program", "name": "first", "runtime": 1,
                         "dependencies": [{"instance": "a", "application": "second", "at": "finish"}]},
                        {"application": "run-program", "name": "second", "runtime": 1,
                         "dependencies": [{"instance": "a", "application": "first", "at": "finish"}]}
                    ]}
                ]
            }"#,
        );
        assert!(DependencyEngine::build(&cfg).is_err());
    }
}
