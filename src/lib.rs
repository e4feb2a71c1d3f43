#![forbid(unsafe_code)]
#![doc = include_str!("../README.md")]

mod core;
mod dynamic;
mod error;
mod executor;
mod fingerprint;
mod graph;
mod plan;
mod report;
mod scheduler;
mod store;
mod symbols;
mod utils;
mod value;

pub use crate::core::Hash32;
pub use crate::error::{ConfigError, ExecError, RunFailure, StoreError};
pub use crate::executor::{CommandResult, Executor, FnExecutor, Invocation};
pub use crate::graph::{GraphSnapshot, NodeExport, Status};
pub use crate::plan::{
    ChangeFn, Command, ConditionFn, DynamicSpec, Margin, Plan, PlanBuilder, TargetSpec,
    TriggerContext, TriggerMode, TriggerSpec,
};
pub use crate::report::{RunReport, TargetOutcome};
pub use crate::scheduler::{FailurePolicy, RunOptions};
pub use crate::store::{ContentStore, DiskStore, HistoryRecord, MemoryStore, TargetRecord};
#[cfg(feature = "logging")]
pub use crate::utils::init_logging;
pub use crate::value::{Table, Value};

use crate::graph::TargetGraph;

/// A validated plan bound to a content store and an executor. This is the
/// top-level handle: build it once, then call [`run`](Self::run) whenever
/// inputs may have changed; only stale targets execute.
pub struct Pipeline {
    plan: Plan,
    store: Box<dyn ContentStore>,
    executor: Box<dyn Executor>,
    options: RunOptions,
}

impl Pipeline {
    /// A pipeline over a throwaway in-memory store. Use
    /// [`with_store`](Self::with_store) to persist results across
    /// processes.
    pub fn new(plan: Plan, executor: impl Executor + 'static) -> Self {
        Self {
            plan,
            store: Box::new(MemoryStore::new()),
            executor: Box::new(executor),
            options: RunOptions::default(),
        }
    }

    pub fn with_store(mut self, store: impl ContentStore + 'static) -> Self {
        self.store = Box::new(store);
        self
    }

    pub fn with_options(mut self, options: RunOptions) -> Self {
        self.options = options;
        self
    }

    /// Execute one incremental run and account for every target.
    pub fn run(&self) -> Result<RunReport, ConfigError> {
        scheduler::run(
            &self.plan,
            self.store.as_ref(),
            self.executor.as_ref(),
            &self.options,
        )
    }

    /// The dependency graph as configured, without running anything.
    /// Sub-targets of dynamic targets are absent; they only exist once
    /// their grouping sources have values.
    pub fn graph(&self) -> Result<GraphSnapshot, ConfigError> {
        Ok(TargetGraph::build(&self.plan)?.snapshot())
    }

    /// Stored value of a target from its most recent successful build.
    pub fn value(&self, name: &str) -> Result<Option<Value>, StoreError> {
        self.store.get(name)
    }

    /// Build history of a target, oldest entry first.
    pub fn history(&self, name: &str) -> Result<Vec<HistoryRecord>, StoreError> {
        self.store.history(name)
    }

    /// Drop stored state for every target a run no longer reached.
    /// Explicit and destructive; never invoked by [`run`](Self::run).
    pub fn garbage_collect(&self, report: &RunReport) -> Result<usize, StoreError> {
        self.store.garbage_collect(&report.reachable())
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("targets", &self.plan.targets.len())
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod test {
    use camino::Utf8PathBuf;

    use super::*;

    fn plan() -> Plan {
        Plan::builder()
            .add(TargetSpec::literal("base", 20i64))
            .add(TargetSpec::new(
                "answer",
                Command::new("add_22", "base + 22").uses(["base"]),
            ))
            .finish()
            .unwrap()
    }

    fn executor() -> FnExecutor {
        FnExecutor::new().register("add_22", |inv| {
            let Some(Value::Int(base)) = inv.dep("base") else {
                anyhow::bail!("missing base");
            };
            Ok(Value::Int(base + 22))
        })
    }

    #[test]
    fn test_pipeline_end_to_end() {
        let pipeline = Pipeline::new(plan(), executor());

        let report = pipeline.run().unwrap();
        assert!(report.ok());
        assert_eq!(report.built(), 2);
        assert_eq!(pipeline.value("answer").unwrap(), Some(Value::Int(42)));

        let report = pipeline.run().unwrap();
        assert_eq!(report.built(), 0);
        assert_eq!(report.skipped(), 2);
        assert_eq!(pipeline.history("answer").unwrap().len(), 1);
    }

    #[test]
    fn test_pipeline_persists_across_processes() {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::try_from(dir.path().to_path_buf()).unwrap();

        let first = Pipeline::new(plan(), executor())
            .with_store(DiskStore::new(&root).unwrap());
        assert_eq!(first.run().unwrap().built(), 2);
        drop(first);

        let second = Pipeline::new(plan(), executor())
            .with_store(DiskStore::new(&root).unwrap());
        let report = second.run().unwrap();
        assert_eq!(report.built(), 0);
        assert_eq!(report.skipped(), 2);
    }

    #[test]
    fn test_graph_export_without_running() {
        let pipeline = Pipeline::new(plan(), executor());
        let graph = pipeline.graph().unwrap();

        assert_eq!(graph.nodes.len(), 2);
        assert!(graph
            .edges
            .contains(&("base".to_string(), "answer".to_string())));

        // Nothing has run, so dependency-free targets are ready and the
        // rest are still pending behind them.
        let status = |name: &str| graph.nodes.iter().find(|n| n.name == name).unwrap().status;
        assert_eq!(status("base"), Status::Ready);
        assert_eq!(status("answer"), Status::Pending);
    }

    #[test]
    fn test_garbage_collect_is_explicit() {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::try_from(dir.path().to_path_buf()).unwrap();

        let wide = Pipeline::new(
            Plan::builder()
                .add(TargetSpec::literal("base", 20i64))
                .add(TargetSpec::literal("scratch", 1i64))
                .finish()
                .unwrap(),
            FnExecutor::new(),
        )
        .with_store(DiskStore::new(&root).unwrap());
        wide.run().unwrap();

        let narrow = Pipeline::new(plan(), executor())
            .with_store(DiskStore::new(&root).unwrap());
        let report = narrow.run().unwrap();

        // Running alone never deletes; collection is a separate call.
        assert_eq!(narrow.value("scratch").unwrap(), Some(Value::Int(1)));
        assert_eq!(narrow.garbage_collect(&report).unwrap(), 1);
        assert_eq!(narrow.value("scratch").unwrap(), None);
    }
}
