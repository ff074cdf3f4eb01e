//! Dependency graph builder.
//!
//! Turns a step list into a validated directed acyclic graph with edges from
//! dependency to dependent. Steps without explicit `depends_on` depend on the
//! step declared immediately before them, so a plain list is a chain.

use super::{PipelineDefinition, StepSpec};
use crate::core::StepStatus;
use crate::errors::ConfigError;
use crate::utils::validate_name;
use std::cmp::Reverse;
use std::collections::{BTreeSet, BinaryHeap, HashMap, HashSet};
use std::fmt::Write as _;

/// A validated dependency graph for one pipeline.
#[derive(Debug, Clone)]
pub struct PipelineGraph {
    /// The pipeline name.
    pipeline: String,
    /// Step names in declaration order.
    declaration_order: Vec<String>,
    /// Step specifications by name.
    steps: HashMap<String, StepSpec>,
    /// Resolved dependencies per step, in declaration order.
    dependencies: HashMap<String, Vec<String>>,
    /// Direct dependents per step, in declaration order.
    dependents: HashMap<String, Vec<String>>,
    /// Deterministic topological order.
    topological_order: Vec<String>,
}

impl PipelineGraph {
    /// Builds and validates the graph for a pipeline.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] for empty pipelines, invalid or duplicate
    /// names, dangling dependencies and cycles. Nothing is ever dropped to
    /// make a graph acyclic.
    pub fn build(definition: &PipelineDefinition) -> Result<Self, ConfigError> {
        let pipeline = definition.name.clone();
        validate_name(&pipeline)?;

        if definition.steps.is_empty() {
            return Err(ConfigError::EmptyPipeline { pipeline });
        }

        let mut declaration_order = Vec::with_capacity(definition.steps.len());
        let mut steps = HashMap::with_capacity(definition.steps.len());
        for step in &definition.steps {
            validate_name(&step.name)?;
            step.validate_durations()?;
            if steps.insert(step.name.clone(), step.clone()).is_some() {
                return Err(ConfigError::DuplicateStep {
                    pipeline,
                    step: step.name.clone(),
                });
            }
            declaration_order.push(step.name.clone());
        }

        let mut dependencies: HashMap<String, Vec<String>> = HashMap::new();
        for (i, step) in definition.steps.iter().enumerate() {
            let deps = match &step.depends_on {
                Some(explicit) => {
                    let mut seen = HashSet::new();
                    explicit
                        .iter()
                        .filter(|d| seen.insert(d.as_str()))
                        .cloned()
                        .collect()
                }
                None if i > 0 => vec![definition.steps[i - 1].name.clone()],
                None => Vec::new(),
            };

            for dep in &deps {
                if !steps.contains_key(dep) {
                    return Err(ConfigError::MissingDependency {
                        pipeline,
                        step: step.name.clone(),
                        dependency: dep.clone(),
                    });
                }
            }
            dependencies.insert(step.name.clone(), deps);
        }

        let mut dependents: HashMap<String, Vec<String>> = declaration_order
            .iter()
            .map(|n| (n.clone(), Vec::new()))
            .collect();
        for name in &declaration_order {
            for dep in &dependencies[name] {
                if let Some(list) = dependents.get_mut(dep) {
                    list.push(name.clone());
                }
            }
        }

        if let Some(cycle) = detect_cycle(&declaration_order, &dependencies) {
            return Err(ConfigError::CycleDetected { pipeline, cycle });
        }

        let topological_order = kahn_order(&declaration_order, &dependencies, &dependents);

        Ok(Self {
            pipeline,
            declaration_order,
            steps,
            dependencies,
            dependents,
            topological_order,
        })
    }

    /// Returns the pipeline name.
    #[must_use]
    pub fn pipeline(&self) -> &str {
        &self.pipeline
    }

    /// Returns the number of steps.
    #[must_use]
    pub fn len(&self) -> usize {
        self.declaration_order.len()
    }

    /// Returns true if the graph has no steps. Never true for a built graph.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.declaration_order.is_empty()
    }

    /// Returns a step specification.
    #[must_use]
    pub fn step(&self, name: &str) -> Option<&StepSpec> {
        self.steps.get(name)
    }

    /// Returns true if the graph contains `name`.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.steps.contains_key(name)
    }

    /// Step names in declaration order.
    #[must_use]
    pub fn declaration_order(&self) -> &[String] {
        &self.declaration_order
    }

    /// Step specifications in declaration order.
    pub fn steps(&self) -> impl Iterator<Item = &StepSpec> + '_ {
        self.declaration_order
            .iter()
            .filter_map(move |name| self.steps.get(name))
    }

    /// A deterministic topological order: among ready steps, the one
    /// declared first goes first.
    #[must_use]
    pub fn topological_order(&self) -> &[String] {
        &self.topological_order
    }

    /// Direct dependencies of a step.
    #[must_use]
    pub fn dependencies_of(&self, name: &str) -> &[String] {
        self.dependencies.get(name).map_or(&[][..], Vec::as_slice)
    }

    /// Direct dependents of a step.
    #[must_use]
    pub fn dependents_of(&self, name: &str) -> &[String] {
        self.dependents.get(name).map_or(&[][..], Vec::as_slice)
    }

    /// Every step reachable from `name` along dependent edges, excluding
    /// `name` itself, in topological order.
    #[must_use]
    pub fn transitive_dependents(&self, name: &str) -> Vec<String> {
        let mut reached = HashSet::new();
        let mut stack: Vec<&str> = vec![name];
        while let Some(current) = stack.pop() {
            for child in self.dependents_of(current) {
                if reached.insert(child.as_str()) {
                    stack.push(child);
                }
            }
        }
        self.topological_order
            .iter()
            .filter(|n| reached.contains(n.as_str()))
            .cloned()
            .collect()
    }

    /// All `(dependency, dependent)` edges, sorted.
    #[must_use]
    pub fn edges(&self) -> Vec<(String, String)> {
        let edges: BTreeSet<(String, String)> = self
            .dependencies
            .iter()
            .flat_map(|(to, froms)| froms.iter().map(move |from| (from.clone(), to.clone())))
            .collect();
        edges.into_iter().collect()
    }

    /// Renders the graph in Graphviz DOT. When `statuses` is given, nodes are
    /// filled according to their step status.
    #[must_use]
    pub fn to_dot(&self, statuses: Option<&HashMap<String, StepStatus>>) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "digraph \"{}\" {{", escape(&self.pipeline));
        let _ = writeln!(out, "  rankdir=LR;");
        let _ = writeln!(out, "  node [shape=box, style=\"rounded,filled\", fillcolor=white];");

        for name in &self.declaration_order {
            let task = self.steps.get(name).map_or("", |s| s.task.as_str());
            let status = statuses.and_then(|m| m.get(name)).copied();
            let label = match status {
                Some(status) => format!("{name}\\n{task}\\n[{status}]"),
                None => format!("{name}\\n{task}"),
            };
            let color = status.map_or("white", status_color);
            let _ = writeln!(
                out,
                "  \"{}\" [label=\"{}\", fillcolor={color}];",
                escape(name),
                escape_label(&label)
            );
        }

        for (from, to) in self.edges() {
            let _ = writeln!(out, "  \"{}\" -> \"{}\";", escape(&from), escape(&to));
        }

        out.push_str("}\n");
        out
    }
}

fn status_color(status: StepStatus) -> &'static str {
    match status {
        StepStatus::Pending => "white",
        StepStatus::Running => "lightblue",
        StepStatus::Completed => "palegreen",
        StepStatus::Failed => "lightcoral",
        StepStatus::Skipped => "lightgrey",
    }
}

fn escape(text: &str) -> String {
    text.replace('\\', "\\\\").replace('"', "\\\"")
}

// Keeps the `\n` line breaks already placed in the label.
fn escape_label(text: &str) -> String {
    text.replace('"', "\\\"")
}

/// Finds a cycle, returning its path with the first step repeated at the end.
fn detect_cycle(
    order: &[String],
    dependencies: &HashMap<String, Vec<String>>,
) -> Option<Vec<String>> {
    let mut visited = HashSet::new();
    let mut rec_stack = HashSet::new();
    let mut path = Vec::new();

    for name in order {
        if !visited.contains(name.as_str()) {
            let found = dfs_cycle(name, dependencies, &mut visited, &mut rec_stack, &mut path);
            if found.is_some() {
                return found;
            }
        }
    }
    None
}

fn dfs_cycle<'a>(
    node: &'a str,
    dependencies: &'a HashMap<String, Vec<String>>,
    visited: &mut HashSet<&'a str>,
    rec_stack: &mut HashSet<&'a str>,
    path: &mut Vec<&'a str>,
) -> Option<Vec<String>> {
    visited.insert(node);
    rec_stack.insert(node);
    path.push(node);

    if let Some(deps) = dependencies.get(node) {
        for dep in deps {
            if !visited.contains(dep.as_str()) {
                if let Some(cycle) = dfs_cycle(dep, dependencies, visited, rec_stack, path) {
                    return Some(cycle);
                }
            } else if rec_stack.contains(dep.as_str()) {
                let start = path.iter().position(|n| *n == dep.as_str()).unwrap_or(0);
                // The path runs dependent -> dependency; flip it so the
                // cycle reads in execution direction.
                let mut cycle: Vec<String> =
                    path[start..].iter().rev().map(|s| (*s).to_string()).collect();
                if let Some(first) = cycle.first().cloned() {
                    cycle.push(first);
                }
                return Some(cycle);
            }
        }
    }

    path.pop();
    rec_stack.remove(node);
    None
}

/// Kahn's algorithm with declaration index as tie-breaker.
fn kahn_order(
    order: &[String],
    dependencies: &HashMap<String, Vec<String>>,
    dependents: &HashMap<String, Vec<String>>,
) -> Vec<String> {
    let index: HashMap<&str, usize> = order
        .iter()
        .enumerate()
        .map(|(i, n)| (n.as_str(), i))
        .collect();
    let mut in_degree: HashMap<&str, usize> = order
        .iter()
        .map(|n| (n.as_str(), dependencies.get(n).map_or(0, Vec::len)))
        .collect();

    let mut ready: BinaryHeap<Reverse<usize>> = order
        .iter()
        .enumerate()
        .filter(|(_, n)| in_degree.get(n.as_str()) == Some(&0))
        .map(|(i, _)| Reverse(i))
        .collect();

    let mut result = Vec::with_capacity(order.len());
    while let Some(Reverse(i)) = ready.pop() {
        let name = &order[i];
        result.push(name.clone());
        for child in dependents.get(name).map_or(&[][..], Vec::as_slice) {
            if let Some(degree) = in_degree.get_mut(child.as_str()) {
                *degree = degree.saturating_sub(1);
                if *degree == 0 {
                    if let Some(&ci) = index.get(child.as_str()) {
                        ready.push(Reverse(ci));
                    }
                }
            }
        }
    }
    result
}
