//! The run graph: an arena of target nodes addressed by stable identity.
//!
//! Rebuilt from the plan at the start of every run. Mid-run dynamic
//! expansion grows the graph through explicit [`GraphPatch`]es applied
//! between scheduling steps; patches only ever add nodes and edges, so
//! existing indices stay valid.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use petgraph::Direction;
use petgraph::algo::{tarjan_scc, toposort};
use petgraph::stable_graph::{NodeIndex, StableDiGraph};
use serde::Serialize;

use crate::core::ArcStr;
use crate::error::ConfigError;
use crate::plan::{Body, Plan, TargetSpec};
use crate::value::Value;

/// Scheduler state machine per target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Status {
    Pending,
    Ready,
    Running,
    Completed,
    Failed,
    Skipped,
}

/// How a node participates in dynamic fan-out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Role {
    /// A plain target, including literal constants.
    Static,
    /// A dynamic target: expands into children when its grouping sources
    /// complete, then aggregates their values.
    Parent,
    /// A generated sub-target.
    Child { parent: ArcStr },
}

#[derive(Debug)]
pub(crate) struct Node {
    pub name: ArcStr,
    pub spec: Arc<TargetSpec>,
    pub role: Role,
    /// Literal argument values: the command's declared args, plus the
    /// grouping element for children.
    pub args: Vec<Value>,
    pub status: Status,
}

/// Nodes and edges added by one dynamic expansion.
#[derive(Debug, Default)]
pub(crate) struct GraphPatch {
    pub nodes: Vec<Node>,
    pub edges: Vec<(ArcStr, ArcStr)>,
}

pub(crate) struct TargetGraph {
    pub(crate) graph: StableDiGraph<Node, ()>,
    index: HashMap<ArcStr, NodeIndex>,
}

impl TargetGraph {
    /// Build the dependency graph for a validated plan. An edge A -> B is
    /// added when B's command references A directly or through reachable
    /// user functions, and for every grouping source of a dynamic spec.
    /// Cycles are a fatal configuration error reported with the member
    /// names.
    pub(crate) fn build(plan: &Plan) -> Result<Self, ConfigError> {
        let mut graph = StableDiGraph::new();
        let mut index = HashMap::new();

        for spec in &plan.targets {
            let role = match spec.dynamic {
                Some(_) => Role::Parent,
                None => Role::Static,
            };

            // Literal values double as the node's args so the `depend`
            // trigger notices when a constant is edited.
            let args = match &spec.body {
                Body::Command(command) => command.args.clone(),
                Body::Literal(value) => vec![value.clone()],
            };

            let node = graph.add_node(Node {
                name: spec.name.clone(),
                spec: spec.clone(),
                role,
                args,
                status: Status::Pending,
            });
            index.insert(spec.name.clone(), node);
        }

        for spec in &plan.targets {
            let consumer = index[&spec.name];
            for dependency in dependency_names(plan, spec) {
                let dependency = index[&dependency];
                if !graph.contains_edge(dependency, consumer) {
                    graph.add_edge(dependency, consumer, ());
                }
            }
        }

        let this = Self { graph, index };
        this.check_acyclic()?;
        Ok(this)
    }

    fn check_acyclic(&self) -> Result<(), ConfigError> {
        if toposort(&self.graph, None).is_ok() {
            return Ok(());
        }

        // Recover the offending cycle's member names for the report.
        let cycle = tarjan_scc(&self.graph)
            .into_iter()
            .find(|scc| {
                scc.len() > 1
                    || scc
                        .first()
                        .is_some_and(|&n| self.graph.contains_edge(n, n))
            })
            .unwrap_or_default();

        let mut names: Vec<String> = cycle
            .iter()
            .map(|&n| self.graph[n].name.to_string())
            .collect();
        names.sort();

        Err(ConfigError::Cycle(names))
    }

    pub(crate) fn node(&self, name: &str) -> Option<NodeIndex> {
        self.index.get(name).copied()
    }

    pub(crate) fn dependencies(&self, node: NodeIndex) -> Vec<NodeIndex> {
        self.graph
            .neighbors_directed(node, Direction::Incoming)
            .collect()
    }

    pub(crate) fn dependents(&self, node: NodeIndex) -> Vec<NodeIndex> {
        self.graph
            .neighbors_directed(node, Direction::Outgoing)
            .collect()
    }

    /// The targets whose dependencies are all `Completed` or `Skipped` and
    /// that are still `Pending` themselves.
    pub(crate) fn ready_set(&self) -> Vec<NodeIndex> {
        self.graph
            .node_indices()
            .filter(|&n| self.graph[n].status == Status::Pending)
            .filter(|&n| {
                self.dependencies(n).iter().all(|&dep| {
                    matches!(self.graph[dep].status, Status::Completed | Status::Skipped)
                })
            })
            .collect()
    }

    /// Grow the graph mid-run. Unknown edge endpoints are a programming
    /// error; expansion only ever wires children to existing nodes.
    pub(crate) fn apply(&mut self, patch: GraphPatch) -> Vec<NodeIndex> {
        let mut added = Vec::with_capacity(patch.nodes.len());

        for node in patch.nodes {
            let name = node.name.clone();
            let index = self.graph.add_node(node);
            self.index.insert(name, index);
            added.push(index);
        }

        for (from, to) in patch.edges {
            let from = self.index[&from];
            let to = self.index[&to];
            if !self.graph.contains_edge(from, to) {
                self.graph.add_edge(from, to, ());
            }
        }

        added
    }

    /// Serializable node/edge list with per-node status, for external
    /// rendering. Readiness is never stored on the node; a `Pending`
    /// target whose dependencies are all settled exports as `Ready`.
    pub(crate) fn snapshot(&self) -> GraphSnapshot {
        let ready: HashSet<NodeIndex> = self.ready_set().into_iter().collect();

        let mut nodes: Vec<NodeExport> = self
            .graph
            .node_indices()
            .map(|n| NodeExport {
                name: self.graph[n].name.to_string(),
                status: if ready.contains(&n) {
                    Status::Ready
                } else {
                    self.graph[n].status
                },
                parent: match &self.graph[n].role {
                    Role::Child { parent } => Some(parent.to_string()),
                    _ => None,
                },
            })
            .collect();
        nodes.sort_by(|a, b| a.name.cmp(&b.name));

        let mut edges: Vec<(String, String)> = self
            .graph
            .edge_indices()
            .filter_map(|e| self.graph.edge_endpoints(e))
            .map(|(a, b)| {
                (
                    self.graph[a].name.to_string(),
                    self.graph[b].name.to_string(),
                )
            })
            .collect();
        edges.sort();

        GraphSnapshot { nodes, edges }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct NodeExport {
    pub name: String,
    pub status: Status,
    /// The dynamic target this sub-target was expanded from, if any.
    pub parent: Option<String>,
}

/// Exported view of the run graph, consumed by external visualization.
#[derive(Debug, Clone, Serialize)]
pub struct GraphSnapshot {
    pub nodes: Vec<NodeExport>,
    /// Directed `(dependency, consumer)` pairs.
    pub edges: Vec<(String, String)>,
}

impl GraphSnapshot {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

fn dependency_names(plan: &Plan, spec: &TargetSpec) -> Vec<ArcStr> {
    let mut names = Vec::new();

    if let Body::Command(command) = &spec.body {
        names.extend(plan.symbols.reach(&command.uses).targets);
    }

    if let Some(dynamic) = &spec.dynamic {
        names.extend(dynamic.sources());
    }

    names.sort();
    names.dedup();
    names
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::plan::{Command, Plan};

    fn command(reference: &str, uses: &[&str]) -> Command {
        Command::new(reference, format!("{reference}()")).uses(uses.iter().copied())
    }

    fn plan_of(targets: Vec<TargetSpec>) -> Plan {
        targets
            .into_iter()
            .fold(Plan::builder(), |builder, t| builder.add(t))
            .finish()
            .unwrap()
    }

    #[test]
    fn test_edges_follow_uses() {
        let plan = plan_of(vec![
            TargetSpec::literal("data", vec![1i64]),
            TargetSpec::new("fit", command("fit", &["data"])),
        ]);
        let graph = TargetGraph::build(&plan).unwrap();

        let data = graph.node("data").unwrap();
        let fit = graph.node("fit").unwrap();
        assert_eq!(graph.dependents(data), vec![fit]);
        assert_eq!(graph.dependencies(fit), vec![data]);
    }

    #[test]
    fn test_transitive_function_edge() {
        let plan = Plan::builder()
            .add(TargetSpec::literal("data", vec![1i64]))
            .add(TargetSpec::new("fit", command("fit", &["helper"])))
            .function("helper", "function() preprocess()", ["preprocess"])
            .function("preprocess", "function() data", ["data"])
            .finish()
            .unwrap();
        let graph = TargetGraph::build(&plan).unwrap();

        let fit = graph.node("fit").unwrap();
        assert_eq!(graph.dependencies(fit), vec![graph.node("data").unwrap()]);
    }

    #[test]
    fn test_cycle_rejected_with_names() {
        let plan = plan_of(vec![
            TargetSpec::new("a", command("fa", &["b"])),
            TargetSpec::new("b", command("fb", &["a"])),
        ]);

        match TargetGraph::build(&plan).err() {
            Some(ConfigError::Cycle(names)) => {
                assert_eq!(names, vec!["a".to_string(), "b".to_string()]);
            }
            other => panic!("expected cycle error, got {other:?}"),
        }
    }

    #[test]
    fn test_ready_set_respects_status() {
        let plan = plan_of(vec![
            TargetSpec::literal("data", vec![1i64]),
            TargetSpec::new("fit", command("fit", &["data"])),
        ]);
        let mut graph = TargetGraph::build(&plan).unwrap();

        let data = graph.node("data").unwrap();
        let fit = graph.node("fit").unwrap();
        assert_eq!(graph.ready_set(), vec![data]);

        graph.graph[data].status = Status::Completed;
        assert_eq!(graph.ready_set(), vec![fit]);

        graph.graph[fit].status = Status::Skipped;
        assert!(graph.ready_set().is_empty());
    }

    #[test]
    fn test_patch_adds_children() {
        let plan = plan_of(vec![
            TargetSpec::literal("xs", vec![1i64, 2]),
            TargetSpec::new("fit", command("fit", &[])).map(["xs"]),
        ]);
        let mut graph = TargetGraph::build(&plan).unwrap();
        let fit = graph.node("fit").unwrap();
        let spec = graph.graph[fit].spec.clone();

        let patch = GraphPatch {
            nodes: vec![Node {
                name: ArcStr::from("fit@aaaa"),
                spec,
                role: Role::Child {
                    parent: ArcStr::from("fit"),
                },
                args: vec![Value::Int(1)],
                status: Status::Pending,
            }],
            edges: vec![(ArcStr::from("fit@aaaa"), ArcStr::from("fit"))],
        };

        let added = graph.apply(patch);
        assert_eq!(added.len(), 1);
        assert!(graph.dependencies(fit).contains(&added[0]));

        let snapshot = graph.snapshot();
        assert_eq!(snapshot.nodes.len(), 3);
        assert!(snapshot
            .edges
            .contains(&("fit@aaaa".to_string(), "fit".to_string())));

        let child = snapshot.nodes.iter().find(|n| n.name == "fit@aaaa").unwrap();
        assert_eq!(child.parent.as_deref(), Some("fit"));
    }

    #[test]
    fn test_snapshot_serializes() {
        let plan = plan_of(vec![TargetSpec::literal("data", vec![1i64])]);
        let graph = TargetGraph::build(&plan).unwrap();

        let json = graph.snapshot().to_json().unwrap();
        assert!(json.contains(r#""name":"data""#));
        assert!(json.contains(r#""status":"Ready""#));
    }
}
