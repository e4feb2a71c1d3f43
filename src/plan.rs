use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};

use crate::core::ArcStr;
use crate::dynamic;
use crate::error::ConfigError;
use crate::symbols::SymbolTable;
use crate::value::Value;

/// Context handed to condition/change trigger hooks. Hooks see the target
/// name and the resolved values of its dependencies, nothing else; they are
/// expected to be cheap and side-effect free.
pub struct TriggerContext<'a> {
    pub target: &'a str,
    pub deps: &'a BTreeMap<ArcStr, Value>,
}

/// User-supplied boolean predicate, participating per the trigger mode.
pub type ConditionFn = Arc<dyn Fn(&TriggerContext) -> anyhow::Result<bool> + Send + Sync>;

/// User-supplied expression whose value is compared against the last
/// recorded one; a difference marks the target stale.
pub type ChangeFn = Arc<dyn Fn(&TriggerContext) -> anyhow::Result<Value> + Send + Sync>;

/// How the condition hook combines with the other triggers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TriggerMode {
    /// Stale if the condition is true OR any other enabled trigger fires.
    #[default]
    Whitelist,
    /// A false condition forces a skip, overriding the other triggers;
    /// otherwise the other triggers decide.
    Blacklist,
    /// The condition alone decides, the other triggers are ignored.
    Condition,
}

/// Which change-detection triggers are enabled for a target and how the
/// condition hook participates. All predicates are enabled by default.
#[derive(Clone)]
pub struct TriggerSpec {
    pub missing: bool,
    pub command: bool,
    pub depend: bool,
    pub file: bool,
    pub seed: bool,
    pub mode: TriggerMode,
    pub condition: Option<ConditionFn>,
    pub change: Option<ChangeFn>,
}

impl Default for TriggerSpec {
    fn default() -> Self {
        Self {
            missing: true,
            command: true,
            depend: true,
            file: true,
            seed: true,
            mode: TriggerMode::default(),
            condition: None,
            change: None,
        }
    }
}

impl std::fmt::Debug for TriggerSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TriggerSpec")
            .field("missing", &self.missing)
            .field("command", &self.command)
            .field("depend", &self.depend)
            .field("file", &self.file)
            .field("seed", &self.seed)
            .field("mode", &self.mode)
            .field("condition", &self.condition.as_ref().map(|_| "*"))
            .field("change", &self.change.as_ref().map(|_| "*"))
            .finish()
    }
}

/// A reference to user code plus its literal arguments. The engine treats
/// `reference` as opaque; invoking it is the executor's job. The `source`
/// text is fingerprinted (whitespace/comment-normalized) and `uses` names
/// the targets and user functions the command reads from.
#[derive(Debug, Clone)]
pub struct Command {
    pub reference: String,
    pub source: String,
    pub uses: Vec<ArcStr>,
    pub args: Vec<Value>,
}

impl Command {
    pub fn new(reference: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            reference: reference.into(),
            source: source.into(),
            uses: Vec::new(),
            args: Vec::new(),
        }
    }

    pub fn uses(mut self, names: impl IntoIterator<Item = impl Into<ArcStr>>) -> Self {
        self.uses.extend(names.into_iter().map(Into::into));
        self
    }

    pub fn arg(mut self, value: impl Into<Value>) -> Self {
        self.args.push(value.into());
        self
    }
}

/// The computation body of a target.
#[derive(Debug, Clone)]
pub(crate) enum Body {
    Command(Command),
    /// A constant value; completed without the executor. Literal targets
    /// make grouping lengths known at plan-build time, which is what allows
    /// static fan-out validation.
    Literal(Value),
}

/// Which axis `split` partitions a table along.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Margin {
    #[default]
    Rows,
    Columns,
}

/// Run-time fan-out specification over named grouping sources (always
/// explicit; the engine never infers grouping variables).
#[derive(Debug, Clone)]
pub enum DynamicSpec {
    /// Element-wise pairing, row-wise for tables. Shorter sources recycle
    /// when their length evenly divides the longest.
    Map { over: Vec<ArcStr> },
    /// Full Cartesian product in row-major order, first source slowest.
    Cross { over: Vec<ArcStr> },
    /// One aggregate per distinct key value (one total without a key).
    Combine { over: ArcStr, by: Option<ArcStr> },
    /// As-even-as-possible contiguous partition into `slices` pieces.
    Split {
        over: ArcStr,
        slices: usize,
        margin: Margin,
    },
}

impl DynamicSpec {
    /// Names of the upstream targets providing grouping values.
    pub(crate) fn sources(&self) -> Vec<ArcStr> {
        match self {
            DynamicSpec::Map { over } | DynamicSpec::Cross { over } => over.clone(),
            DynamicSpec::Combine { over, by } => {
                let mut sources = vec![over.clone()];
                sources.extend(by.clone());
                sources
            }
            DynamicSpec::Split { over, .. } => vec![over.clone()],
        }
    }
}

/// A single named computation: identity, body, declared files, triggers,
/// seed and optional dynamic fan-out.
#[derive(Debug, Clone)]
pub struct TargetSpec {
    pub(crate) name: ArcStr,
    pub(crate) body: Body,
    pub(crate) files_in: Vec<Utf8PathBuf>,
    pub(crate) file_globs: Vec<String>,
    pub(crate) files_out: Vec<Utf8PathBuf>,
    pub(crate) trigger: TriggerSpec,
    pub(crate) seed: Option<u64>,
    pub(crate) dynamic: Option<DynamicSpec>,
    pub(crate) cap: Option<usize>,
}

impl TargetSpec {
    pub fn new(name: impl Into<ArcStr>, command: Command) -> Self {
        Self {
            name: name.into(),
            body: Body::Command(command),
            files_in: Vec::new(),
            file_globs: Vec::new(),
            files_out: Vec::new(),
            trigger: TriggerSpec::default(),
            seed: None,
            dynamic: None,
            cap: None,
        }
    }

    /// A constant target holding a literal value.
    pub fn literal(name: impl Into<ArcStr>, value: impl Into<Value>) -> Self {
        Self {
            name: name.into(),
            body: Body::Literal(value.into()),
            files_in: Vec::new(),
            file_globs: Vec::new(),
            files_out: Vec::new(),
            trigger: TriggerSpec::default(),
            seed: None,
            dynamic: None,
            cap: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Declare a tracked input file; its content hash participates in the
    /// `file` trigger.
    pub fn input_file(mut self, path: impl AsRef<Utf8Path>) -> Self {
        self.files_in.push(path.as_ref().to_owned());
        self
    }

    /// Declare tracked input files by glob pattern, resolved at plan build.
    pub fn input_glob(mut self, pattern: impl Into<String>) -> Self {
        self.file_globs.push(pattern.into());
        self
    }

    /// Declare an output file whose presence is checked after the build and
    /// whose content hash participates in the `file` trigger.
    pub fn output_file(mut self, path: impl AsRef<Utf8Path>) -> Self {
        self.files_out.push(path.as_ref().to_owned());
        self
    }

    pub fn trigger(mut self, trigger: TriggerSpec) -> Self {
        self.trigger = trigger;
        self
    }

    pub fn condition<F>(mut self, mode: TriggerMode, hook: F) -> Self
    where
        F: Fn(&TriggerContext) -> anyhow::Result<bool> + Send + Sync + 'static,
    {
        self.trigger.mode = mode;
        self.trigger.condition = Some(Arc::new(hook));
        self
    }

    pub fn change<F>(mut self, hook: F) -> Self
    where
        F: Fn(&TriggerContext) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        self.trigger.change = Some(Arc::new(hook));
        self
    }

    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn map(mut self, over: impl IntoIterator<Item = impl Into<ArcStr>>) -> Self {
        self.dynamic = Some(DynamicSpec::Map {
            over: over.into_iter().map(Into::into).collect(),
        });
        self
    }

    pub fn cross(mut self, over: impl IntoIterator<Item = impl Into<ArcStr>>) -> Self {
        self.dynamic = Some(DynamicSpec::Cross {
            over: over.into_iter().map(Into::into).collect(),
        });
        self
    }

    pub fn combine(mut self, over: impl Into<ArcStr>, by: Option<&str>) -> Self {
        self.dynamic = Some(DynamicSpec::Combine {
            over: over.into(),
            by: by.map(ArcStr::from),
        });
        self
    }

    pub fn split(mut self, over: impl Into<ArcStr>, slices: usize, margin: Margin) -> Self {
        self.dynamic = Some(DynamicSpec::Split {
            over: over.into(),
            slices,
            margin,
        });
        self
    }

    /// Cap how many sub-targets are materialized per run. Raising the cap
    /// later adds only new sub-targets; lowering it never deletes stored
    /// values.
    pub fn cap(mut self, cap: usize) -> Self {
        self.cap = Some(cap);
        self
    }

    pub(crate) fn literal_value(&self) -> Option<&Value> {
        match &self.body {
            Body::Literal(value) => Some(value),
            Body::Command(_) => None,
        }
    }
}

/// The validated, immutable plan a [`Pipeline`](crate::Pipeline) runs.
/// Rebuilt from specs at the start of every run; only the content store
/// persists across runs.
#[derive(Debug)]
pub struct Plan {
    pub(crate) targets: Vec<Arc<TargetSpec>>,
    pub(crate) symbols: SymbolTable,
    pub(crate) default_seed: Option<u64>,
}

impl Plan {
    pub fn builder() -> PlanBuilder {
        PlanBuilder::default()
    }
}

/// Collects target specs and user function definitions, then validates the
/// whole plan in [`finish`](Self::finish).
#[derive(Default)]
pub struct PlanBuilder {
    targets: Vec<TargetSpec>,
    symbols: SymbolTable,
    default_seed: Option<u64>,
}

impl PlanBuilder {
    pub fn add(mut self, target: TargetSpec) -> Self {
        self.targets.push(target);
        self
    }

    /// Define a user function for transitive dependency tracking. The body
    /// text participates in consumer fingerprints; `uses` names the targets
    /// and functions the body references.
    pub fn function(
        mut self,
        name: impl Into<ArcStr>,
        body: impl Into<String>,
        uses: impl IntoIterator<Item = impl Into<ArcStr>>,
    ) -> Self {
        self.symbols.define(name, body, uses);
        self
    }

    /// Seed applied to every target without an explicit one.
    pub fn default_seed(mut self, seed: u64) -> Self {
        self.default_seed = Some(seed);
        self
    }

    /// Validate and freeze the plan.
    ///
    /// Checks performed here, all fatal: duplicate target names, references
    /// to unknown symbols, condition trigger mode without a hook, zero
    /// split slices, non-conformable map lengths over literal sources, and
    /// declared input files that neither exist nor are produced by another
    /// target.
    pub fn finish(mut self) -> Result<Plan, ConfigError> {
        let mut index: HashMap<ArcStr, usize> = HashMap::new();

        for (i, target) in self.targets.iter().enumerate() {
            if index.insert(target.name.clone(), i).is_some() {
                return Err(ConfigError::DuplicateTarget(target.name.to_string()));
            }
        }

        // Upfront glob resolution keeps the per-run snapshots read-only.
        for target in &mut self.targets {
            for pattern in std::mem::take(&mut target.file_globs) {
                for entry in glob::glob(&pattern)? {
                    target.files_in.push(Utf8PathBuf::try_from(entry?)?);
                }
            }
            target.files_in.sort();
            target.files_in.dedup();
        }

        let produced: HashSet<&Utf8PathBuf> = self
            .targets
            .iter()
            .flat_map(|t| t.files_out.iter())
            .collect();

        for target in &self.targets {
            if let Body::Command(command) = &target.body {
                for name in &command.uses {
                    if !index.contains_key(name) && !self.symbols.contains(name) {
                        return Err(ConfigError::UnknownReference {
                            target: target.name.to_string(),
                            symbol: name.to_string(),
                        });
                    }
                }

                for name in self.symbols.reach(&command.uses).targets {
                    if !index.contains_key(&name) {
                        return Err(ConfigError::UnknownReference {
                            target: target.name.to_string(),
                            symbol: name.to_string(),
                        });
                    }
                }
            }

            if target.trigger.mode == TriggerMode::Condition && target.trigger.condition.is_none() {
                return Err(ConfigError::ConditionModeWithoutHook(target.name.to_string()));
            }

            if let Some(dynamic) = &target.dynamic {
                for source in dynamic.sources() {
                    if !index.contains_key(&source) {
                        return Err(ConfigError::UnknownReference {
                            target: target.name.to_string(),
                            symbol: source.to_string(),
                        });
                    }
                }

                match dynamic {
                    DynamicSpec::Split { slices: 0, .. } => {
                        return Err(ConfigError::EmptySlices(target.name.to_string()));
                    }
                    DynamicSpec::Map { over } => {
                        // Lengths are only checkable now when every grouping
                        // source is a literal target.
                        let lengths: Option<Vec<usize>> = over
                            .iter()
                            .map(|name| {
                                self.targets[index[name]].literal_value().map(Value::len)
                            })
                            .collect();

                        if let Some(lengths) = lengths {
                            dynamic::check_conformable(&target.name, &lengths)?;
                        }
                    }
                    _ => {}
                }
            }

            for path in &target.files_in {
                if !path.exists() && !produced.contains(path) {
                    return Err(ConfigError::MissingInputFile {
                        target: target.name.to_string(),
                        path: path.clone(),
                    });
                }
            }
        }

        Ok(Plan {
            targets: self.targets.into_iter().map(Arc::new).collect(),
            symbols: self.symbols,
            default_seed: self.default_seed,
        })
    }
}
