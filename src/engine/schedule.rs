//! Ordering of run-steps.
//!
//! Every task contributes an `init` and a `build` node. Exports that depend
//! on other exports of the same task additionally get an auxiliary node,
//! which only exists to carry ordering constraints and never appears in the
//! emitted order.
//!
//! Edges, written as "runs before":
//!
//! * `init|T` before `build|T`;
//! * `build|B` before `init|A` when A is ordered after B;
//! * `init|B` before `init|A` when A depends on a provider of B, and
//!   `build|A` before `build|B` unless the provider is read-only;
//! * for an export `e1` of T depending on `e2`: `init|T` and `export|T|e2`
//!   before `export|T|e1`; every mutator of `e2` before `export|T|e1`, from
//!   its `build` step if it mutates during build, from its `init` step
//!   otherwise; `export|T|e1` before the `init` of every consumer of `e1`.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::fmt::Write;

use petgraph::Direction;
use petgraph::Graph;
use petgraph::graph::NodeIndex;

use crate::blueprint::{Blueprint, TaskIndex};
use crate::engine::resolve::{DependencyMap, ResolvedDependency};
use crate::error::{ScheduleError, StepKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RunStep {
    Init(TaskIndex),
    Build(TaskIndex),
}

impl RunStep {
    pub fn task(&self) -> TaskIndex {
        match self {
            RunStep::Init(task) | RunStep::Build(task) => *task,
        }
    }

    pub fn kind(&self) -> StepKind {
        match self {
            RunStep::Init(_) => StepKind::Init,
            RunStep::Build(_) => StepKind::Build,
        }
    }

    /// `init|<task id>` or `build|<task id>`.
    pub fn token(&self, blueprint: &Blueprint) -> String {
        format!("{}|{}", self.kind(), blueprint.task(self.task()).id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Node {
    Step(RunStep),
    Export(TaskIndex, String),
}

impl Node {
    fn label(&self, blueprint: &Blueprint) -> String {
        match self {
            Node::Step(step) => step.token(blueprint),
            Node::Export(task, key) => format!("export|{}|{}", blueprint.task(*task).id, key),
        }
    }
}

/// The ordering graph and one topological order of its run-steps.
#[derive(Debug)]
pub struct Schedule {
    graph: Graph<Node, ()>,
    order: Vec<RunStep>,
}

impl Schedule {
    pub(crate) fn build(blueprint: &Blueprint, dependencies: &DependencyMap) -> Result<Self, ScheduleError> {
        let mut graph = Graph::new();

        // init|T is node 2T, build|T is node 2T + 1
        for task in blueprint.task_indices() {
            let init = graph.add_node(Node::Step(RunStep::Init(task)));
            let build = graph.add_node(Node::Step(RunStep::Build(task)));
            graph.update_edge(init, build, ());
        }

        let init = |task: TaskIndex| NodeIndex::new(2 * task.0);
        let build = |task: TaskIndex| NodeIndex::new(2 * task.0 + 1);

        for task in blueprint.task_indices() {
            for &before in &blueprint.task(task).after {
                graph.update_edge(build(before), init(task), ());
            }
        }

        // consumers of every (producer, export key), in task order
        let mut consumers: HashMap<(TaskIndex, &str), Vec<(TaskIndex, &ResolvedDependency)>> =
            HashMap::new();

        for (consumer, dependency) in dependencies.edges() {
            graph.update_edge(init(dependency.task), init(consumer), ());
            if !dependency.read_only {
                graph.update_edge(build(consumer), build(dependency.task), ());
            }

            consumers
                .entry((dependency.task, dependency.export.as_str()))
                .or_default()
                .push((consumer, dependency));
        }

        let mut exports: HashMap<(TaskIndex, String), NodeIndex> = HashMap::new();
        let mut export_node = |graph: &mut Graph<Node, ()>, task: TaskIndex, key: &str| {
            *exports
                .entry((task, key.to_string()))
                .or_insert_with(|| {
                    let node = graph.add_node(Node::Export(task, key.to_string()));
                    graph.update_edge(init(task), node, ());
                    node
                })
        };

        for task in blueprint.task_indices() {
            let entry = blueprint.task(task);

            for (key, export) in &entry.exports {
                for dependency in &export.depends_on {
                    if !entry.exports.contains_key(dependency) {
                        return Err(ScheduleError::UnknownExportDependency {
                            task: entry.id.clone(),
                            export: key.clone(),
                            dependency: dependency.clone(),
                        });
                    }

                    let dependent = export_node(&mut graph, task, key);
                    let settled = export_node(&mut graph, task, dependency);
                    graph.update_edge(settled, dependent, ());

                    let mutators = consumers
                        .get(&(task, dependency.as_str()))
                        .into_iter()
                        .flatten()
                        .filter(|(_, resolved)| !resolved.read_only);

                    for &(mutator, resolved) in mutators {
                        let from = if resolved.modified_in_build {
                            build(mutator)
                        } else {
                            init(mutator)
                        };
                        graph.update_edge(from, dependent, ());
                    }

                    for &(consumer, _) in consumers.get(&(task, key.as_str())).into_iter().flatten() {
                        graph.update_edge(dependent, init(consumer), ());
                    }
                }
            }
        }

        let order = sort(&graph).map_err(|members| ScheduleError::CyclicDependency {
            members: members.iter().map(|n| graph[*n].label(blueprint)).collect(),
        })?;

        tracing::debug!(
            "scheduled {} run-steps over {} nodes",
            order.len(),
            graph.node_count()
        );

        Ok(Self { graph, order })
    }

    pub fn steps(&self) -> &[RunStep] {
        &self.order
    }

    pub fn tokens(&self, blueprint: &Blueprint) -> Vec<String> {
        self.order.iter().map(|step| step.token(blueprint)).collect()
    }

    /// Renders the ordering graph as a Mermaid diagram.
    pub fn render_mermaid(&self, blueprint: &Blueprint) -> String {
        let mut f = String::new();
        let _ = writeln!(f, "graph TD");

        for index in self.graph.node_indices() {
            let node = &self.graph[index];
            let label = node.label(blueprint).replace('"', "\\\"");
            let _ = match node {
                Node::Step(_) => writeln!(f, "    n{}[\"{}\"]", index.index(), label),
                Node::Export(..) => writeln!(f, "    n{}{{{{\"{}\"}}}}", index.index(), label),
            };
        }

        for edge in self.graph.raw_edges() {
            let _ = writeln!(
                f,
                "    n{} --> n{}",
                edge.source().index(),
                edge.target().index()
            );
        }

        f
    }
}

/// Kahn's algorithm, always taking the ready node inserted first. On a cycle
/// returns the members of one strongly connected component.
fn sort(graph: &Graph<Node, ()>) -> Result<Vec<RunStep>, Vec<NodeIndex>> {
    let mut degree: Vec<usize> = graph
        .node_indices()
        .map(|n| graph.neighbors_directed(n, Direction::Incoming).count())
        .collect();

    let mut ready: BinaryHeap<Reverse<usize>> = degree
        .iter()
        .enumerate()
        .filter(|(_, d)| **d == 0)
        .map(|(i, _)| Reverse(i))
        .collect();

    let mut order = Vec::new();
    let mut visited = 0;

    while let Some(Reverse(index)) = ready.pop() {
        let node = NodeIndex::new(index);
        visited += 1;

        if let Node::Step(step) = graph[node] {
            order.push(step);
        }

        for next in graph.neighbors_directed(node, Direction::Outgoing) {
            degree[next.index()] -= 1;
            if degree[next.index()] == 0 {
                ready.push(Reverse(next.index()));
            }
        }
    }

    if visited == graph.node_count() {
        return Ok(order);
    }

    let mut cycles: Vec<Vec<NodeIndex>> = petgraph::algo::tarjan_scc(graph)
        .into_iter()
        .filter(|scc| scc.len() > 1 || graph.contains_edge(scc[0], scc[0]))
        .map(|mut scc| {
            scc.sort();
            scc
        })
        .collect();
    cycles.sort();

    Err(cycles.into_iter().next().unwrap_or_default())
}
