//! Pipeline graph construction and traversal

use std::collections::{HashMap, HashSet, VecDeque};

use serde::Serialize;
use tracing::{info, instrument};

use kptn_core::{Config, GraphTasks};

use crate::error::{CacheError, GraphError, StoreError};
use crate::ledger::VersionLedger;
use crate::record::VersionDimension;
use crate::store::StoreResult;
use crate::task::Scope;

/// A task in the pipeline graph
#[derive(Debug, Clone, Serialize)]
pub struct GraphNode {
    /// Task name
    pub name: String,
    /// Upstream tasks, in declaration order
    pub dependencies: Vec<String>,
    /// Downstream tasks
    pub dependents: Vec<String>,
    /// Execution wave (tasks in the same wave are independent of each other)
    pub wave: usize,
    /// Fans out over an upstream collection
    pub mapped: bool,
    /// Emits a data payload
    pub produces_data: bool,
}

impl GraphNode {
    /// Which of this task's counters downstream tasks compare against
    pub fn version_dimension(&self) -> VersionDimension {
        if self.produces_data {
            VersionDimension::OutputData
        } else {
            VersionDimension::Outputs
        }
    }
}

/// Live version of one upstream task at evaluation time
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DependencyVersion {
    pub task: String,
    pub version: u64,
    pub dimension: VersionDimension,
    /// The dependency is itself mapped; `version` is its aggregate
    pub fan_out: bool,
}

/// Dependency graph of one pipeline, with inheritance resolved
#[derive(Debug, Clone)]
pub struct PipelineGraph {
    pipeline: String,
    nodes: HashMap<String, GraphNode>,
    /// Declaration order after inheritance
    declared: Vec<String>,
    waves: Vec<Vec<String>>,
    sorted_order: Vec<String>,
}

impl PipelineGraph {
    /// Load a pipeline from configuration.
    ///
    /// Resolves `extends`, checks every dependency names a task of the
    /// graph, and rejects cycles. All configuration problems surface here,
    /// never at decision time.
    #[instrument(skip(config))]
    pub fn load(config: &Config, pipeline: &str) -> Result<Self, GraphError> {
        let tasks = flatten(config, pipeline, &mut Vec::new())?;
        Self::from_tasks(config, pipeline, &tasks)
    }

    fn from_tasks(config: &Config, pipeline: &str, tasks: &GraphTasks) -> Result<Self, GraphError> {
        let mut nodes: HashMap<String, GraphNode> = HashMap::new();
        let mut declared = Vec::with_capacity(tasks.len());

        for (name, deps) in tasks.iter() {
            let task = config.task(name);
            for dep in deps.iter() {
                if !tasks.contains(dep) {
                    return Err(GraphError::UnknownDependency {
                        task: name.clone(),
                        dependency: dep.clone(),
                    });
                }
            }

            let mut dependencies: Vec<String> = Vec::new();
            for dep in deps.iter() {
                if !dependencies.contains(dep) {
                    dependencies.push(dep.clone());
                }
            }

            nodes.insert(
                name.clone(),
                GraphNode {
                    name: name.clone(),
                    dependencies,
                    dependents: Vec::new(),
                    wave: 0,
                    mapped: task.is_some_and(|t| t.is_mapped()),
                    produces_data: task.is_some_and(|t| t.produces_data()),
                },
            );
            declared.push(name.clone());
        }

        // Reverse edges
        for name in &declared {
            let deps = nodes[name].dependencies.clone();
            for dep in deps {
                if let Some(dep_node) = nodes.get_mut(&dep) {
                    dep_node.dependents.push(name.clone());
                }
            }
        }

        let sorted_order = Self::topological_sort(&nodes, &declared)?;
        let waves = Self::compute_waves(&nodes, &sorted_order);
        for (wave_idx, wave_tasks) in waves.iter().enumerate() {
            for name in wave_tasks {
                if let Some(node) = nodes.get_mut(name) {
                    node.wave = wave_idx;
                }
            }
        }

        info!(
            pipeline,
            task_count = nodes.len(),
            wave_count = waves.len(),
            "pipeline graph loaded"
        );

        Ok(Self {
            pipeline: pipeline.to_string(),
            nodes,
            declared,
            waves,
            sorted_order,
        })
    }

    /// Topological sort using Kahn's algorithm, stable in declaration order
    fn topological_sort(
        nodes: &HashMap<String, GraphNode>,
        declared: &[String],
    ) -> Result<Vec<String>, GraphError> {
        let mut in_degree: HashMap<&str, usize> = HashMap::new();
        let mut queue: VecDeque<&str> = VecDeque::new();
        let mut sorted: Vec<String> = Vec::with_capacity(declared.len());

        for name in declared {
            let degree = nodes[name].dependencies.len();
            in_degree.insert(name, degree);
            if degree == 0 {
                queue.push_back(name);
            }
        }

        while let Some(name) = queue.pop_front() {
            sorted.push(name.to_string());
            for dependent in &nodes[name].dependents {
                if let Some(degree) = in_degree.get_mut(dependent.as_str()) {
                    *degree = degree.saturating_sub(1);
                    if *degree == 0 {
                        queue.push_back(dependent);
                    }
                }
            }
        }

        if sorted.len() != declared.len() {
            let done: HashSet<&str> = sorted.iter().map(String::as_str).collect();
            return Err(GraphError::CyclicDependency(Self::cycle_path(
                nodes, declared, &done,
            )));
        }

        Ok(sorted)
    }

    /// Describe one cycle among the tasks the sort could not place, as
    /// `a -> b -> a`
    fn cycle_path(
        nodes: &HashMap<String, GraphNode>,
        declared: &[String],
        done: &HashSet<&str>,
    ) -> String {
        let Some(start) = declared.iter().find(|n| !done.contains(n.as_str())) else {
            return String::new();
        };

        let mut path: Vec<&str> = Vec::new();
        let mut current = start.as_str();
        loop {
            if let Some(pos) = path.iter().position(|n| *n == current) {
                let mut cycle: Vec<&str> = path[pos..].to_vec();
                cycle.push(current);
                return cycle.join(" -> ");
            }
            path.push(current);
            // Every unplaced task has at least one unplaced dependency
            match nodes[current]
                .dependencies
                .iter()
                .find(|d| !done.contains(d.as_str()))
            {
                Some(next) => current = next.as_str(),
                None => return path.join(" -> "),
            }
        }
    }

    fn compute_waves(nodes: &HashMap<String, GraphNode>, sorted: &[String]) -> Vec<Vec<String>> {
        let mut wave_map: HashMap<&str, usize> = HashMap::new();

        for name in sorted {
            let wave = nodes[name]
                .dependencies
                .iter()
                .filter_map(|dep| wave_map.get(dep.as_str()))
                .max()
                .map(|w| w + 1)
                .unwrap_or(0);
            wave_map.insert(name, wave);
        }

        let wave_count = wave_map.values().max().map_or(0, |w| w + 1);
        let mut waves: Vec<Vec<String>> = vec![Vec::new(); wave_count];
        for name in sorted {
            if let Some(&wave) = wave_map.get(name.as_str()) {
                waves[wave].push(name.clone());
            }
        }
        waves
    }

    pub fn pipeline(&self) -> &str {
        &self.pipeline
    }

    pub fn node(&self, name: &str) -> Result<&GraphNode, GraphError> {
        self.nodes
            .get(name)
            .ok_or_else(|| GraphError::UnknownTask(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.nodes.contains_key(name)
    }

    /// Direct upstream tasks, in declaration order
    pub fn dependencies(&self, name: &str) -> Result<&[String], GraphError> {
        self.node(name).map(|n| n.dependencies.as_slice())
    }

    /// Task names in declaration order
    pub fn task_names(&self) -> &[String] {
        &self.declared
    }

    pub fn waves(&self) -> &[Vec<String>] {
        &self.waves
    }

    pub fn sorted(&self) -> &[String] {
        &self.sorted_order
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Current version of every upstream task of `task`, in declaration order.
    ///
    /// A data-producing dependency is compared by `output_data_version`,
    /// anything else by `outputs_version`. A mapped dependency exposes its
    /// task-level counter, never a per-item one.
    pub async fn live_versions(
        &self,
        task: &str,
        ledger: &VersionLedger,
        scope: &Scope,
    ) -> Result<Vec<DependencyVersion>, CacheError> {
        let node = self.node(task)?;
        let mut versions = Vec::with_capacity(node.dependencies.len());

        for dep in &node.dependencies {
            let dep_node = self.node(dep)?;
            let dimension = dep_node.version_dimension();
            let current = resolve_version(ledger.read(&scope.task(dep)).await, task, dep)?;
            versions.push(DependencyVersion {
                task: dep.clone(),
                version: current.get(dimension),
                dimension,
                fan_out: dep_node.mapped,
            });
        }

        Ok(versions)
    }

    /// Human-readable summary of the execution waves
    pub fn execution_plan(&self) -> String {
        let mut plan = String::new();
        for (i, wave) in self.waves.iter().enumerate() {
            plan.push_str(&format!("Wave {} ({} tasks):\n", i, wave.len()));
            for name in wave {
                let Some(node) = self.nodes.get(name) else {
                    continue;
                };
                let mut flags = Vec::new();
                if node.mapped {
                    flags.push("mapped");
                }
                if node.produces_data {
                    flags.push("data");
                }
                let flags = if flags.is_empty() {
                    String::new()
                } else {
                    format!(" [{}]", flags.join(", "))
                };
                if node.dependencies.is_empty() {
                    plan.push_str(&format!("  {}{}\n", name, flags));
                } else {
                    plan.push_str(&format!(
                        "  {}{} (after: {})\n",
                        name,
                        flags,
                        node.dependencies.join(", ")
                    ));
                }
            }
        }
        plan
    }
}

fn resolve_version<T>(
    result: StoreResult<T>,
    task: &str,
    dependency: &str,
) -> Result<T, CacheError> {
    result.map_err(|e| match e {
        StoreError::NotFound { .. } => CacheError::UnresolvedDependency {
            task: task.to_string(),
            dependency: dependency.to_string(),
            reason: "upstream task has never been evaluated".to_string(),
        },
        other => CacheError::Store(other),
    })
}

/// Resolve a graph's tasks, merging in inherited graphs first.
///
/// Parents are merged in order and the first occurrence of a task wins;
/// the graph's own tasks only add names not already inherited.
fn flatten(
    config: &Config,
    pipeline: &str,
    stack: &mut Vec<String>,
) -> Result<GraphTasks, GraphError> {
    if stack.iter().any(|g| g == pipeline) {
        let mut cycle = stack.clone();
        cycle.push(pipeline.to_string());
        return Err(GraphError::InheritanceCycle(cycle.join(" -> ")));
    }
    let graph = config
        .graphs
        .get(pipeline)
        .ok_or_else(|| GraphError::UnknownGraph(pipeline.to_string()))?;

    stack.push(pipeline.to_string());
    let mut merged = GraphTasks::new();
    for parent in &graph.extends {
        for (name, deps) in flatten(config, parent, stack)?.iter() {
            merged.insert_if_absent(name.clone(), deps.clone());
        }
    }
    for (name, deps) in graph.tasks.iter() {
        merged.insert_if_absent(name.clone(), deps.clone());
    }
    stack.pop();

    Ok(merged)
}

#[cfg(test)]
mod tests {
    use super::*;
    use kptn_core::{Dependencies, GraphConfig, TaskConfig};
    use pretty_assertions::assert_eq;

    fn deps(names: &[&str]) -> Dependencies {
        names.iter().copied().collect()
    }

    fn graph_config(tasks: &[(&str, &[&str])]) -> GraphConfig {
        GraphConfig {
            extends: Vec::new(),
            tasks: tasks.iter().map(|(n, d)| (*n, deps(d))).collect(),
        }
    }

    fn config_with(graphs: Vec<(&str, GraphConfig)>) -> Config {
        let mut config = Config::default();
        for (name, graph) in graphs {
            config.graphs.insert(name.to_string(), graph);
        }
        config
    }

    #[test]
    fn test_waves() {
        let config = config_with(vec![(
            "etl",
            graph_config(&[
                ("extract", &[]),
                ("clean", &["extract"]),
                ("lint", &[]),
                ("load", &["clean", "extract"]),
            ]),
        )]);
        let graph = PipelineGraph::load(&config, "etl").unwrap();

        assert_eq!(graph.node("extract").unwrap().wave, 0);
        assert_eq!(graph.node("lint").unwrap().wave, 0);
        assert_eq!(graph.node("clean").unwrap().wave, 1);
        assert_eq!(graph.node("load").unwrap().wave, 2);
        assert_eq!(graph.dependencies("load").unwrap(), ["clean", "extract"]);
        assert_eq!(graph.sorted(), ["extract", "lint", "clean", "load"]);
    }

    #[test]
    fn test_cycle_rejected_at_load() {
        let config = config_with(vec![("loop", graph_config(&[("a", &["b"]), ("b", &["a"])]))]);
        let err = PipelineGraph::load(&config, "loop").unwrap_err();
        match err {
            GraphError::CyclicDependency(path) => assert_eq!(path, "a -> b -> a"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_self_dependency_is_a_cycle() {
        let config = config_with(vec![("solo", graph_config(&[("a", &["a"])]))]);
        assert!(matches!(
            PipelineGraph::load(&config, "solo"),
            Err(GraphError::CyclicDependency(_))
        ));
    }

    #[test]
    fn test_unknown_dependency() {
        let config = config_with(vec![("etl", graph_config(&[("a", &["missing"])]))]);
        let err = PipelineGraph::load(&config, "etl").unwrap_err();
        assert!(err.to_string().contains("unknown task 'missing'"));
    }

    #[test]
    fn test_extends_first_occurrence_wins() {
        let mut child = graph_config(&[("d", &["b", "c"])]);
        child.extends = vec!["base".to_string(), "other".to_string()];
        let config = config_with(vec![
            ("base", graph_config(&[("a", &[]), ("b", &["a"])])),
            ("other", graph_config(&[("b", &[]), ("c", &["b"])])),
            ("child", child),
        ]);

        let graph = PipelineGraph::load(&config, "child").unwrap();
        assert_eq!(graph.task_names(), ["a", "b", "c", "d"]);
        assert_eq!(graph.dependencies("b").unwrap(), ["a"]);
    }

    #[test]
    fn test_extends_cycle() {
        let mut one = graph_config(&[("a", &[])]);
        one.extends = vec!["two".to_string()];
        let mut two = graph_config(&[("b", &[])]);
        two.extends = vec!["one".to_string()];
        let config = config_with(vec![("one", one), ("two", two)]);

        let err = PipelineGraph::load(&config, "one").unwrap_err();
        assert!(matches!(err, GraphError::InheritanceCycle(ref path) if path == "one -> two -> one"));
    }

    #[test]
    fn test_unknown_graph() {
        let config = Config::default();
        assert!(matches!(
            PipelineGraph::load(&config, "nope"),
            Err(GraphError::UnknownGraph(_))
        ));
    }

    #[test]
    fn test_node_flags_from_task_config() {
        let mut config = config_with(vec![(
            "etl",
            graph_config(&[("list_files", &[]), ("process", &["list_files"])]),
        )]);
        config.tasks.insert(
            "list_files".to_string(),
            TaskConfig::new().with_cache_result(true).with_iterable_item("file"),
        );
        config
            .tasks
            .insert("process".to_string(), TaskConfig::new().with_map_over("file"));

        let graph = PipelineGraph::load(&config, "etl").unwrap();
        let source = graph.node("list_files").unwrap();
        assert!(source.produces_data);
        assert_eq!(source.version_dimension(), VersionDimension::OutputData);
        assert!(graph.node("process").unwrap().mapped);

        let plan = graph.execution_plan();
        assert!(plan.contains("Wave 1 (1 tasks)"));
        assert!(plan.contains("process [mapped] (after: list_files)"));
    }
}
