//! The incremental run loop.
//!
//! A parallel topological walk of the target graph: targets are stepped as
//! soon as their dependencies settle, stale commands are handed to Rayon
//! workers, and results come back over a channel to the bookkeeping thread.
//! Dynamic targets expand into sub-targets mid-walk; the graph only ever
//! grows, so in-flight work is never invalidated.
//!
//! Dispatch order is deterministic: among the targets ready at any moment,
//! the lexicographically smallest name is stepped first. Completion order
//! still depends on worker timing, but which command is handed out next
//! never does.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::sync::mpsc::{self, Sender};
use std::time::{Duration, Instant};

use indicatif::ProgressStyle;
use petgraph::stable_graph::NodeIndex;
use tracing::Level;
use tracing_indicatif::span_ext::IndicatifSpanExt;

use crate::core::{ArcStr, Hash32};
use crate::dynamic;
use crate::error::{ConfigError, ExecError, RunFailure, StoreError};
use crate::executor::{Executor, Invocation};
use crate::fingerprint::{FingerprintEngine, Snapshot, Staleness};
use crate::graph::{GraphPatch, Node, Role, Status, TargetGraph};
use crate::plan::{Body, Plan, TargetSpec, TriggerContext};
use crate::report::{RunReport, TargetOutcome};
use crate::store::{ContentStore, HistoryRecord, with_retries};
use crate::utils;
use crate::value::Value;

/// What the scheduler does once a target fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailurePolicy {
    /// Fail the dependents of the failed target and keep building every
    /// unaffected branch.
    #[default]
    KeepGoing,
    /// Stop dispatching new targets; in-flight builds run to completion.
    Halt,
}

#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Maximum concurrently executing commands.
    pub jobs: usize,
    pub failure: FailurePolicy,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            jobs: rayon::current_num_threads(),
            failure: FailurePolicy::default(),
        }
    }
}

/// What a Rayon worker sends back after executing one command.
struct BuildResult {
    name: ArcStr,
    result: Result<Value, ExecError>,
    duration: Duration,
}

/// Main-thread state parked while a command runs on a worker.
struct PendingBuild {
    snapshot: Snapshot,
    trigger: &'static str,
}

/// Execute one run of the plan against the store. Configuration problems
/// detectable from the graph alone abort before anything executes.
pub(crate) fn run(
    plan: &Plan,
    store: &dyn ContentStore,
    executor: &dyn Executor,
    options: &RunOptions,
) -> Result<RunReport, ConfigError> {
    let started = Instant::now();
    let graph = TargetGraph::build(plan)?;

    let progress = tracing::span!(Level::INFO, "building_targets");
    progress.pb_set_length(graph.graph.node_count() as u64);
    progress.pb_set_style(&utils::get_style_run());
    progress.pb_set_message("Building targets...");
    let _enter = progress.enter();

    let scheduled = graph.graph.node_count() as u64;
    let mut scheduler = Scheduler {
        store,
        executor,
        engine: FingerprintEngine::new(&plan.symbols, plan.default_seed),
        graph,
        jobs: options.jobs.max(1),
        policy: options.failure,
        values: HashMap::new(),
        prints: HashMap::new(),
        child_order: HashMap::new(),
        expanded: HashSet::new(),
        pending_builds: HashMap::new(),
        outcomes: BTreeMap::new(),
        failures: Vec::new(),
        in_flight: 0,
        halted: false,
        scheduled,
        progress: progress.clone(),
        task_style: utils::get_style_task(),
    };

    // Bookkeeping must stay on the calling thread: `drive` blocks on the
    // result channel, and parking it inside the pool would starve a
    // one-worker pool of the very thread its spawned commands need.
    rayon::in_place_scope(|scope| scheduler.drive(scope));

    let Scheduler {
        graph,
        mut outcomes,
        failures,
        ..
    } = scheduler;

    // Targets never reached (halt, or a branch that failed upstream before
    // they became ready) still appear in the report.
    for index in graph.graph.node_indices() {
        let node = &graph.graph[index];
        outcomes
            .entry(node.name.to_string())
            .or_insert(TargetOutcome {
                status: node.status,
                duration: None,
                trigger: None,
            });
    }

    tracing::info!(elapsed = ?started.elapsed(), "Run complete");

    Ok(RunReport {
        outcomes,
        failures,
        elapsed: started.elapsed(),
        graph: graph.snapshot(),
    })
}

struct Scheduler<'a> {
    store: &'a dyn ContentStore,
    executor: &'a dyn Executor,
    engine: FingerprintEngine<'a>,
    graph: TargetGraph,
    jobs: usize,
    policy: FailurePolicy,
    /// Completed values this run, loaded lazily from the store for skipped
    /// targets whose dependents need them.
    values: HashMap<ArcStr, Value>,
    /// Current-run fingerprint of every settled target.
    prints: HashMap<ArcStr, Hash32>,
    /// Materialized sub-target names per dynamic target, in expansion
    /// order.
    child_order: HashMap<ArcStr, Vec<ArcStr>>,
    expanded: HashSet<ArcStr>,
    pending_builds: HashMap<ArcStr, PendingBuild>,
    outcomes: BTreeMap<String, TargetOutcome>,
    failures: Vec<(String, RunFailure)>,
    in_flight: usize,
    halted: bool,
    scheduled: u64,
    progress: tracing::Span,
    task_style: ProgressStyle,
}

impl<'a> Scheduler<'a> {
    fn drive<'s>(&mut self, scope: &rayon::Scope<'s>)
    where
        'a: 's,
    {
        let (sender, receiver) = mpsc::channel::<BuildResult>();

        loop {
            self.dispatch(scope, &sender);
            if self.in_flight == 0 {
                break;
            }

            // The original sender lives on this side, so the channel stays
            // open for as long as work is in flight.
            let result = receiver.recv().expect("worker result channel closed");
            self.complete(result);
        }
    }

    /// Step ready targets until none remain or the worker budget is full.
    fn dispatch<'s>(&mut self, scope: &rayon::Scope<'s>, sender: &Sender<BuildResult>)
    where
        'a: 's,
    {
        loop {
            if self.halted {
                return;
            }

            let mut ready = self.graph.ready_set();
            if ready.is_empty() {
                return;
            }
            ready.sort_by(|&a, &b| self.graph.graph[a].name.cmp(&self.graph.graph[b].name));

            for node in ready {
                if self.halted {
                    return;
                }
                if !self.step(scope, sender, node) {
                    return;
                }
            }
        }
    }

    /// Advance one ready target: expand, skip, complete inline or hand the
    /// command to a worker. Returns `false` when the worker budget is
    /// exhausted and the target has to wait.
    fn step<'s>(
        &mut self,
        scope: &rayon::Scope<'s>,
        sender: &Sender<BuildResult>,
        node: NodeIndex,
    ) -> bool
    where
        'a: 's,
    {
        let (name, spec, role, args) = {
            let entry = &self.graph.graph[node];
            (
                entry.name.clone(),
                entry.spec.clone(),
                entry.role.clone(),
                entry.args.clone(),
            )
        };

        if matches!(role, Role::Parent) && !self.expanded.contains(&name) {
            self.expand_parent(node, &name, &spec);
            return true;
        }

        let started = Instant::now();

        let mut dep_prints = BTreeMap::new();
        for dep in self.graph.dependencies(node) {
            let dep_name = self.graph.graph[dep].name.clone();
            let print = self.prints[&dep_name];
            dep_prints.insert(dep_name, print);
        }

        let command = match &spec.body {
            Body::Command(command) => Some(command),
            Body::Literal(_) => None,
        };

        let mut snapshot = match self.engine.snapshot(&spec, command, &args, &dep_prints) {
            Ok(snapshot) => snapshot,
            Err(err) => {
                self.fail(node, RunFailure::Exec(err), None);
                return true;
            }
        };

        let record = match with_retries(|| self.store.record(&name)) {
            Ok(record) => record,
            Err(err) => {
                self.fail(node, RunFailure::Exec(err.into()), None);
                return true;
            }
        };

        // Hooks see resolved dependency values; without hooks the decision
        // needs fingerprints only, so values stay unloaded.
        let uses_hooks = spec.trigger.condition.is_some() || spec.trigger.change.is_some();
        let hook_deps = if uses_hooks {
            match self.resolve_deps(node) {
                Ok(deps) => deps,
                Err(err) => {
                    self.fail(node, RunFailure::Exec(err.into()), None);
                    return true;
                }
            }
        } else {
            BTreeMap::new()
        };

        let ctx = TriggerContext {
            target: &name,
            deps: &hook_deps,
        };
        let decision = self.engine.decide(
            &name,
            &spec.trigger,
            &ctx,
            &mut snapshot,
            record.as_ref(),
            record.is_some(),
        );
        let decision = match decision {
            Ok(decision) => decision,
            Err(err) => {
                self.fail(node, RunFailure::Trigger(err), None);
                return true;
            }
        };

        let Staleness::Stale(trigger) = decision else {
            self.skip(node, &snapshot);
            return true;
        };

        if matches!(role, Role::Parent) {
            self.aggregate(node, &name, snapshot, trigger, started);
            return true;
        }

        match &spec.body {
            Body::Literal(value) => {
                // Sub-targets of a literal-bodied dynamic target carry
                // their slice as the argument; that slice is the value.
                let value = match role {
                    Role::Child { .. } => args.first().cloned().unwrap_or_else(|| value.clone()),
                    _ => value.clone(),
                };
                self.finish_build(node, snapshot, value, trigger, started.elapsed(), args);
                true
            }
            Body::Command(command) => {
                if self.in_flight >= self.jobs {
                    return false;
                }

                let deps = if uses_hooks {
                    hook_deps
                } else {
                    match self.resolve_deps(node) {
                        Ok(deps) => deps,
                        Err(err) => {
                            self.fail(node, RunFailure::Exec(err.into()), None);
                            return true;
                        }
                    }
                };

                let invocation = Invocation {
                    target: name.clone(),
                    reference: command.reference.clone(),
                    args,
                    deps,
                    seed: snapshot.seed,
                };

                self.pending_builds
                    .insert(name.clone(), PendingBuild { snapshot, trigger });
                self.graph.graph[node].status = Status::Running;
                self.in_flight += 1;

                let executor = self.executor;
                let sender = sender.clone();
                let style = self.task_style.clone();
                scope.spawn(move |_| {
                    let span = tracing::span!(Level::INFO, "target", name = %invocation.target);
                    span.pb_set_style(&style);
                    span.pb_set_message(&format!("Building {}", invocation.target));
                    let _enter = span.enter();

                    let name = invocation.target.clone();
                    let start = Instant::now();

                    // A panicking command fails its target instead of
                    // tearing down the whole run.
                    let result =
                        std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                            executor.execute(invocation)
                        }))
                        .unwrap_or_else(|panic| {
                            let msg = if let Some(s) = panic.downcast_ref::<&str>() {
                                format!("Command panicked: {s}")
                            } else if let Some(s) = panic.downcast_ref::<String>() {
                                format!("Command panicked: {s}")
                            } else {
                                String::from("Command panicked with unknown payload")
                            };
                            Err(ExecError::Command(anyhow::anyhow!(msg)))
                        });

                    // The drain loop may already be gone on teardown.
                    let _ = sender.send(BuildResult {
                        name,
                        result,
                        duration: start.elapsed(),
                    });
                });
                true
            }
        }
    }

    /// Resolve grouping sources and grow the graph with this target's
    /// sub-targets. The target itself stays pending until they settle.
    fn expand_parent(&mut self, node: NodeIndex, name: &ArcStr, spec: &Arc<TargetSpec>) {
        let dynamic = spec.dynamic.as_ref().expect("dynamic spec for parent role");
        let source_names = dynamic.sources();

        let mut sources = Vec::with_capacity(source_names.len());
        for source in &source_names {
            match self.resolve_value(source) {
                Ok(value) => sources.push((source.clone(), value)),
                Err(err) => {
                    self.fail(node, RunFailure::Exec(err.into()), None);
                    return;
                }
            }
        }

        let expansion = match dynamic::expand(name, dynamic, &sources, spec.cap) {
            Ok(expansion) => expansion,
            Err(err) => {
                self.fail(node, RunFailure::Config(err), None);
                return;
            }
        };

        if expansion.children.len() < expansion.total {
            tracing::debug!(
                name = %name,
                materialized = expansion.children.len(),
                total = expansion.total,
                "expansion capped"
            );
        }

        // Non-grouping dependencies feed every sub-target; grouping values
        // arrive pre-resolved through the arguments.
        let source_set: HashSet<&ArcStr> = source_names.iter().collect();
        let carried: Vec<ArcStr> = self
            .graph
            .dependencies(node)
            .into_iter()
            .map(|dep| self.graph.graph[dep].name.clone())
            .filter(|dep| !source_set.contains(dep))
            .collect();

        let mut patch = GraphPatch::default();
        let mut order = Vec::with_capacity(expansion.children.len());

        for child in expansion.children {
            order.push(child.name.clone());
            for dep in &carried {
                patch.edges.push((dep.clone(), child.name.clone()));
            }
            patch.edges.push((child.name.clone(), name.clone()));
            patch.nodes.push(Node {
                name: child.name,
                spec: spec.clone(),
                role: Role::Child {
                    parent: name.clone(),
                },
                args: child.args,
                status: Status::Pending,
            });
        }

        let added = self.graph.apply(patch);
        self.scheduled += added.len() as u64;
        self.progress.pb_set_length(self.scheduled);

        self.child_order.insert(name.clone(), order);
        self.expanded.insert(name.clone());
    }

    /// A dynamic target's own build: collect sub-target values, in
    /// expansion order, into one list.
    fn aggregate(
        &mut self,
        node: NodeIndex,
        name: &ArcStr,
        snapshot: Snapshot,
        trigger: &'static str,
        started: Instant,
    ) {
        let order = self.child_order.get(name).cloned().unwrap_or_default();

        let mut members = Vec::with_capacity(order.len());
        for child in &order {
            match self.resolve_value(child) {
                Ok(value) => members.push(value),
                Err(err) => {
                    self.fail(node, RunFailure::Exec(err.into()), None);
                    return;
                }
            }
        }

        let args = self.graph.graph[node].args.clone();
        self.finish_build(
            node,
            snapshot,
            Value::List(members),
            trigger,
            started.elapsed(),
            args,
        );
    }

    /// Land a worker result back onto the graph.
    fn complete(&mut self, result: BuildResult) {
        self.in_flight -= 1;

        let BuildResult {
            name,
            result,
            duration,
        } = result;
        let pending = self
            .pending_builds
            .remove(&name)
            .expect("result for unknown build");
        let node = self.graph.node(&name).expect("result for unknown target");

        match result {
            Ok(value) => {
                let args = self.graph.graph[node].args.clone();
                self.finish_build(node, pending.snapshot, value, pending.trigger, duration, args);
            }
            Err(err) => self.fail(node, RunFailure::Exec(err), Some(duration)),
        }
    }

    /// Persist a fresh value and its record, then mark the target built.
    fn finish_build(
        &mut self,
        node: NodeIndex,
        mut snapshot: Snapshot,
        value: Value,
        trigger: &'static str,
        duration: Duration,
        args: Vec<Value>,
    ) {
        let name = self.graph.graph[node].name.clone();
        let spec = self.graph.graph[node].spec.clone();

        // Declared outputs must exist now; their content joins the record
        // so external edits surface through the `file` trigger next run.
        for path in &spec.files_out {
            if !path.exists() {
                let err = ExecError::MissingOutput(path.clone());
                self.fail(node, RunFailure::Exec(err), Some(duration));
                return;
            }
            match Hash32::hash_file(path) {
                Ok(hash) => {
                    snapshot.files.insert(path.to_string(), Some(hash));
                }
                Err(err) => {
                    self.fail(node, RunFailure::Exec(err.into()), Some(duration));
                    return;
                }
            }
        }

        let record = snapshot.into_record();
        let fingerprint = record.fingerprint;
        let history = HistoryRecord::new(fingerprint, duration.as_millis() as u64, args);

        let stored = with_retries(|| {
            self.store
                .put(&name, record.clone(), value.clone(), history.clone())
        });
        if let Err(err) = stored {
            self.fail(node, RunFailure::Exec(err.into()), Some(duration));
            return;
        }

        self.graph.graph[node].status = Status::Completed;
        self.prints.insert(name.clone(), fingerprint);
        self.values.insert(name.clone(), value);
        self.outcomes.insert(name.to_string(), TargetOutcome {
            status: Status::Completed,
            duration: Some(duration),
            trigger: Some(trigger),
        });
        self.progress.pb_inc(1);
    }

    fn skip(&mut self, node: NodeIndex, snapshot: &Snapshot) {
        let name = self.graph.graph[node].name.clone();
        self.graph.graph[node].status = Status::Skipped;
        self.prints.insert(name.clone(), snapshot.fingerprint());
        self.outcomes.insert(name.to_string(), TargetOutcome {
            status: Status::Skipped,
            duration: None,
            trigger: None,
        });
        self.progress.pb_inc(1);
    }

    /// Fail a target and everything transitively downstream of it. Under
    /// [`FailurePolicy::Halt`] no further targets are stepped; in-flight
    /// builds still drain.
    fn fail(&mut self, node: NodeIndex, failure: RunFailure, duration: Option<Duration>) {
        let name = self.graph.graph[node].name.clone();
        self.graph.graph[node].status = Status::Failed;
        tracing::error!(name = %name, error = %failure, "target failed");
        self.outcomes.insert(name.to_string(), TargetOutcome {
            status: Status::Failed,
            duration,
            trigger: None,
        });
        self.failures.push((name.to_string(), failure));
        self.progress.pb_inc(1);

        if self.policy == FailurePolicy::Halt {
            self.halted = true;
        }

        let mut stack = vec![node];
        while let Some(current) = stack.pop() {
            let blame = self.graph.graph[current].name.clone();
            for dependent in self.graph.dependents(current) {
                if self.graph.graph[dependent].status != Status::Pending {
                    continue;
                }
                let dep_name = self.graph.graph[dependent].name.clone();
                self.graph.graph[dependent].status = Status::Failed;
                self.outcomes.insert(dep_name.to_string(), TargetOutcome {
                    status: Status::Failed,
                    duration: None,
                    trigger: None,
                });
                self.failures
                    .push((dep_name.to_string(), RunFailure::Dependency(blame.to_string())));
                self.progress.pb_inc(1);
                stack.push(dependent);
            }
        }
    }

    /// Value of a settled target, from this run's cache or the store.
    fn resolve_value(&mut self, name: &ArcStr) -> Result<Value, StoreError> {
        if let Some(value) = self.values.get(name) {
            return Ok(value.clone());
        }

        let value = with_retries(|| self.store.get(name))?
            .ok_or_else(|| StoreError::Missing(name.to_string()))?;
        self.values.insert(name.clone(), value.clone());
        Ok(value)
    }

    fn resolve_deps(&mut self, node: NodeIndex) -> Result<BTreeMap<ArcStr, Value>, StoreError> {
        let names: Vec<ArcStr> = self
            .graph
            .dependencies(node)
            .into_iter()
            .map(|dep| self.graph.graph[dep].name.clone())
            .collect();

        let mut deps = BTreeMap::new();
        for name in names {
            let value = self.resolve_value(&name)?;
            deps.insert(name, value);
        }

        Ok(deps)
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use camino::Utf8PathBuf;

    use super::*;
    use crate::executor::FnExecutor;
    use crate::plan::Command;
    use crate::store::MemoryStore;

    fn options() -> RunOptions {
        RunOptions::default()
    }

    fn int(value: &Value) -> i64 {
        match value {
            Value::Int(i) => *i,
            other => panic!("expected int, got {other:?}"),
        }
    }

    fn square_executor(calls: &Arc<AtomicUsize>) -> FnExecutor {
        let calls = calls.clone();
        FnExecutor::new().register("square", move |inv| {
            calls.fetch_add(1, Ordering::SeqCst);
            let x = int(&inv.args[0]);
            Ok(Value::Int(x * x))
        })
    }

    #[test]
    fn test_second_run_skips_everything() {
        let store = MemoryStore::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let build = |calls: &Arc<AtomicUsize>| {
            let calls = calls.clone();
            FnExecutor::new().register("fit", move |inv| {
                calls.fetch_add(1, Ordering::SeqCst);
                let Value::List(xs) = inv.dep("data").unwrap() else {
                    panic!("expected list dependency");
                };
                Ok(Value::Int(xs.iter().map(int).sum::<i64>()))
            })
        };

        let plan = || {
            Plan::builder()
                .add(TargetSpec::literal("data", vec![1i64, 2, 3]))
                .add(TargetSpec::new(
                    "fit",
                    Command::new("fit", "fit(data)").uses(["data"]),
                ))
                .finish()
                .unwrap()
        };

        let report = run(&plan(), &store, &build(&calls), &options()).unwrap();
        assert!(report.ok());
        assert_eq!(report.built(), 2);
        assert_eq!(report.outcomes["fit"].trigger, Some("missing"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(store.get("fit").unwrap(), Some(Value::Int(6)));

        let report = run(&plan(), &store, &build(&calls), &options()).unwrap();
        assert!(report.ok());
        assert_eq!(report.built(), 0);
        assert_eq!(report.skipped(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_command_edit_rebuilds_only_consumers() {
        let store = MemoryStore::new();
        let built_b = Arc::new(AtomicUsize::new(0));
        let built_c = Arc::new(AtomicUsize::new(0));

        let executor = |b: &Arc<AtomicUsize>, c: &Arc<AtomicUsize>| {
            let (b, c) = (b.clone(), c.clone());
            FnExecutor::new()
                .register("double", move |inv| {
                    b.fetch_add(1, Ordering::SeqCst);
                    Ok(Value::Int(int(inv.dep("a").unwrap()) * 2))
                })
                .register("report", move |inv| {
                    c.fetch_add(1, Ordering::SeqCst);
                    Ok(Value::Int(int(inv.dep("b").unwrap()) + 1))
                })
        };

        let plan = |report_source: &str| {
            Plan::builder()
                .add(TargetSpec::literal("a", 21i64))
                .add(TargetSpec::new(
                    "b",
                    Command::new("double", "double(a)").uses(["a"]),
                ))
                .add(TargetSpec::new(
                    "c",
                    Command::new("report", report_source).uses(["b"]),
                ))
                .finish()
                .unwrap()
        };

        run(
            &plan("report(b)"),
            &store,
            &executor(&built_b, &built_c),
            &options(),
        )
        .unwrap();
        assert_eq!(built_b.load(Ordering::SeqCst), 1);
        assert_eq!(built_c.load(Ordering::SeqCst), 1);

        // Cosmetic edit: nothing rebuilds.
        let report = run(
            &plan("report( b )  # same thing"),
            &store,
            &executor(&built_b, &built_c),
            &options(),
        )
        .unwrap();
        assert_eq!(report.built(), 0);

        // Substantive edit to c's command: c alone rebuilds.
        let report = run(
            &plan("report(b, digits = 2)"),
            &store,
            &executor(&built_b, &built_c),
            &options(),
        )
        .unwrap();
        assert_eq!(built_b.load(Ordering::SeqCst), 1);
        assert_eq!(built_c.load(Ordering::SeqCst), 2);
        assert_eq!(report.status("b"), Some(Status::Skipped));
        assert_eq!(report.status("c"), Some(Status::Completed));
        assert_eq!(report.outcomes["c"].trigger, Some("command"));
    }

    #[test]
    fn test_failed_dependency_never_dispatched() {
        let store = MemoryStore::new();
        let downstream = Arc::new(AtomicUsize::new(0));
        let sibling = Arc::new(AtomicUsize::new(0));

        let d = downstream.clone();
        let s = sibling.clone();
        let executor = FnExecutor::new()
            .register("explode", |_| anyhow::bail!("no data"))
            .register("consume", move |_| {
                d.fetch_add(1, Ordering::SeqCst);
                Ok(Value::Unit)
            })
            .register("aside", move |_| {
                s.fetch_add(1, Ordering::SeqCst);
                Ok(Value::Unit)
            });

        let plan = Plan::builder()
            .add(TargetSpec::new("bad", Command::new("explode", "explode()")))
            .add(TargetSpec::new(
                "after",
                Command::new("consume", "consume(bad)").uses(["bad"]),
            ))
            .add(TargetSpec::new("other", Command::new("aside", "aside()")))
            .finish()
            .unwrap();

        let report = run(&plan, &store, &executor, &options()).unwrap();
        assert!(!report.ok());
        assert_eq!(downstream.load(Ordering::SeqCst), 0);
        assert_eq!(sibling.load(Ordering::SeqCst), 1);
        assert_eq!(report.status("bad"), Some(Status::Failed));
        assert_eq!(report.status("after"), Some(Status::Failed));
        assert_eq!(report.status("other"), Some(Status::Completed));
        assert!(report.failures.iter().any(|(name, failure)| {
            name == "after" && matches!(failure, RunFailure::Dependency(dep) if dep == "bad")
        }));
    }

    #[test]
    fn test_halt_policy_stops_dispatch() {
        let store = MemoryStore::new();
        let later = Arc::new(AtomicUsize::new(0));

        let l = later.clone();
        let executor = FnExecutor::new()
            .register("explode", |_| anyhow::bail!("boom"))
            .register("work", move |_| {
                l.fetch_add(1, Ordering::SeqCst);
                Ok(Value::Unit)
            });

        let plan = Plan::builder()
            .add(TargetSpec::new("alpha", Command::new("explode", "explode()")))
            .add(TargetSpec::new("omega", Command::new("work", "work()")))
            .finish()
            .unwrap();

        // One worker makes the dispatch order exact: alpha goes out first,
        // fails, and omega must never start.
        let options = RunOptions {
            jobs: 1,
            failure: FailurePolicy::Halt,
        };
        let report = run(&plan, &store, &executor, &options).unwrap();

        assert!(!report.ok());
        assert_eq!(later.load(Ordering::SeqCst), 0);
        assert_eq!(report.status("alpha"), Some(Status::Failed));
        assert_eq!(report.status("omega"), Some(Status::Pending));
    }

    #[test]
    fn test_input_file_edit_marks_stale() {
        let dir = tempfile::tempdir().unwrap();
        let input = Utf8PathBuf::try_from(dir.path().join("data.csv")).unwrap();
        std::fs::write(&input, "1,2,3").unwrap();

        let store = MemoryStore::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        let executor = FnExecutor::new().register("load", move |_| {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(Value::Unit)
        });

        let plan = || {
            Plan::builder()
                .add(
                    TargetSpec::new("data", Command::new("load", "load()")).input_file(&input),
                )
                .finish()
                .unwrap()
        };

        let report = run(&plan(), &store, &executor, &options()).unwrap();
        assert_eq!(report.built(), 1);

        // Same content, no rebuild.
        let report = run(&plan(), &store, &executor, &options()).unwrap();
        assert_eq!(report.built(), 0);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        std::fs::write(&input, "4,5,6").unwrap();
        let report = run(&plan(), &store, &executor, &options()).unwrap();
        assert_eq!(report.built(), 1);
        assert_eq!(report.outcomes["data"].trigger, Some("file"));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_missing_declared_output_fails_target() {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::try_from(dir.path().join("model.bin")).unwrap();

        let store = MemoryStore::new();
        // The command claims to write `model.bin` but never does.
        let executor = FnExecutor::new().register("emit", |_| Ok(Value::Unit));

        let plan = Plan::builder()
            .add(TargetSpec::new("emit", Command::new("emit", "emit()")).output_file(&path))
            .finish()
            .unwrap();

        let report = run(&plan, &store, &executor, &options()).unwrap();
        assert!(!report.ok());
        assert_eq!(report.status("emit"), Some(Status::Failed));
        assert!(matches!(
            &report.failures[0].1,
            RunFailure::Exec(ExecError::MissingOutput(missing)) if *missing == path
        ));
        assert_eq!(store.get("emit").unwrap(), None);
    }

    #[test]
    fn test_cycle_rejected_before_execution() {
        let store = MemoryStore::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        let executor = FnExecutor::new().register("f", move |_| {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(Value::Unit)
        });

        let plan = Plan::builder()
            .add(TargetSpec::new("a", Command::new("f", "f(b)").uses(["b"])))
            .add(TargetSpec::new("b", Command::new("f", "f(a)").uses(["a"])))
            .finish()
            .unwrap();

        let result = run(&plan, &store, &executor, &options());
        assert!(matches!(result, Err(ConfigError::Cycle(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_map_expansion_aggregates_in_order() {
        let store = MemoryStore::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let plan = || {
            Plan::builder()
                .add(TargetSpec::literal("xs", vec![1i64, 2, 3]))
                .add(
                    TargetSpec::new("sq", Command::new("square", "square(xs)").uses(["xs"]))
                        .map(["xs"]),
                )
                .finish()
                .unwrap()
        };

        let report = run(&plan(), &store, &square_executor(&calls), &options()).unwrap();
        assert!(report.ok());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(
            store.get("sq").unwrap(),
            Some(Value::List(vec![
                Value::Int(1),
                Value::Int(4),
                Value::Int(9)
            ]))
        );

        // Sub-targets appear in the final graph, attributed to "sq".
        let children = report
            .graph
            .nodes
            .iter()
            .filter(|n| n.parent.as_deref() == Some("sq"))
            .count();
        assert_eq!(children, 3);

        // Second run: the whole fan-out skips.
        let report = run(&plan(), &store, &square_executor(&calls), &options()).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(report.built(), 0);
    }

    #[test]
    fn test_cap_raises_and_lowers_without_rework() {
        let store = MemoryStore::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let plan = |cap: usize| {
            Plan::builder()
                .add(TargetSpec::literal("xs", vec![1i64, 2, 3, 4]))
                .add(
                    TargetSpec::new("sq", Command::new("square", "square(xs)").uses(["xs"]))
                        .map(["xs"])
                        .cap(cap),
                )
                .finish()
                .unwrap()
        };

        run(&plan(2), &store, &square_executor(&calls), &options()).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(store.get("sq").unwrap().unwrap().len(), 2);

        // Raising the cap builds only the newly materialized sub-targets.
        run(&plan(4), &store, &square_executor(&calls), &options()).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(store.get("sq").unwrap().unwrap().len(), 4);

        // Lowering it narrows the aggregate without deleting anything.
        run(&plan(1), &store, &square_executor(&calls), &options()).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(store.get("sq").unwrap().unwrap().len(), 1);

        // Raising again finds every stored sub-target value intact.
        run(&plan(4), &store, &square_executor(&calls), &options()).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn test_runtime_nonconformable_fails_branch_only() {
        let store = MemoryStore::new();
        let executor = FnExecutor::new()
            .register("xs", |_| Ok(Value::from(vec![1i64, 2, 3])))
            .register("ys", |_| Ok(Value::from(vec![1i64, 2])))
            .register("pair", |inv| Ok(inv.args[0].clone()))
            .register("aside", |_| Ok(Value::Unit));

        let plan = Plan::builder()
            .add(TargetSpec::new("xs", Command::new("xs", "xs()")))
            .add(TargetSpec::new("ys", Command::new("ys", "ys()")))
            .add(
                TargetSpec::new("fit", Command::new("pair", "pair(xs, ys)").uses(["xs", "ys"]))
                    .map(["xs", "ys"]),
            )
            .add(TargetSpec::new("other", Command::new("aside", "aside()")))
            .finish()
            .unwrap();

        let report = run(&plan, &store, &executor, &options()).unwrap();
        assert!(!report.ok());
        assert_eq!(report.status("fit"), Some(Status::Failed));
        assert_eq!(report.status("xs"), Some(Status::Completed));
        assert_eq!(report.status("ys"), Some(Status::Completed));
        assert_eq!(report.status("other"), Some(Status::Completed));
        assert!(report.failures.iter().any(|(name, failure)| {
            name == "fit"
                && matches!(
                    failure,
                    RunFailure::Config(ConfigError::NonConformable { .. })
                )
        }));
    }

    #[test]
    fn test_combine_by_key_end_to_end() {
        let store = MemoryStore::new();
        let executor = FnExecutor::new().register("total", |inv| {
            let Value::List(members) = &inv.args[0] else {
                panic!("expected member list");
            };
            Ok(Value::Int(members.iter().map(int).sum::<i64>()))
        });

        let plan = Plan::builder()
            .add(TargetSpec::literal("hits", vec![10i64, 20, 30]))
            .add(TargetSpec::literal("site", vec!["A", "A", "B"]))
            .add(
                TargetSpec::new(
                    "by_site",
                    Command::new("total", "total(hits, site)").uses(["hits", "site"]),
                )
                .combine("hits", Some("site")),
            )
            .finish()
            .unwrap();

        let report = run(&plan, &store, &executor, &options()).unwrap();
        assert!(report.ok());
        assert_eq!(report.status("by_site@A"), Some(Status::Completed));
        assert_eq!(report.status("by_site@B"), Some(Status::Completed));
        assert_eq!(
            store.get("by_site").unwrap(),
            Some(Value::List(vec![Value::Int(30), Value::Int(30)]))
        );
    }

    #[test]
    fn test_garbage_collect_after_narrowed_plan() {
        let store = MemoryStore::new();
        let executor = FnExecutor::new();

        let wide = Plan::builder()
            .add(TargetSpec::literal("keep", 1i64))
            .add(TargetSpec::literal("drop", 2i64))
            .finish()
            .unwrap();
        run(&wide, &store, &executor, &options()).unwrap();

        let narrow = Plan::builder()
            .add(TargetSpec::literal("keep", 1i64))
            .finish()
            .unwrap();
        let report = run(&narrow, &store, &executor, &options()).unwrap();

        assert_eq!(store.garbage_collect(&report.reachable()).unwrap(), 1);
        assert_eq!(store.get("drop").unwrap(), None);
        assert_eq!(store.get("keep").unwrap(), Some(Value::Int(1)));
    }
}
