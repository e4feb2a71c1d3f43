use std::time::Duration;

use camino::Utf8PathBuf;
use thiserror::Error;

/// A fatal plan configuration problem, detected before any target executes.
///
/// The one exception is [`ConfigError::NonConformable`] for grouping
/// variables whose lengths are only known at run time; in that case the
/// error is fatal to the offending expansion and its dependents while
/// sibling branches continue.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Duplicate target name '{0}'")]
    DuplicateTarget(String),

    #[error("Dependency cycle between targets: {}", .0.join(" -> "))]
    Cycle(Vec<String>),

    #[error("Target '{target}': non-conformable grouping lengths {lengths:?}")]
    NonConformable { target: String, lengths: Vec<usize> },

    #[error("Target '{target}' references unknown symbol '{symbol}'")]
    UnknownReference { target: String, symbol: String },

    #[error("Target '{target}': declared input file '{path}' does not exist")]
    MissingInputFile { target: String, path: Utf8PathBuf },

    #[error("Target '{0}' uses the condition trigger mode without a condition hook")]
    ConditionModeWithoutHook(String),

    #[error("Target '{0}': split requires at least one slice")]
    EmptySlices(String),

    #[error("Target '{target}': dynamic expansion over '{grouping}', which is not vector-like")]
    ScalarGrouping { target: String, grouping: String },

    #[error("Couldn't compile glob pattern.\n{0}")]
    GlobPattern(#[from] glob::PatternError),

    #[error("Couldn't run glob.\n{0}")]
    Glob(#[from] glob::GlobError),

    #[error("Couldn't convert path to UTF-8.\n{0}")]
    PathFormat(#[from] camino::FromPathBufError),
}

/// Failure of the content store, retried a bounded number of times before
/// escalating to [`ExecError::Store`] for the affected target.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("Couldn't encode stored entry.\n{0}")]
    Encode(String),

    #[error("Couldn't decode stored entry.\n{0}")]
    Decode(String),

    #[error("No stored value for target '{0}'")]
    Missing(String),
}

/// Failure while building a single target.
#[derive(Debug, Error)]
pub enum ExecError {
    #[error("Command failed.\n{0}")]
    Command(#[source] anyhow::Error),

    #[error("Command timed out after {0:?}")]
    Timeout(Duration),

    #[error("No command registered under '{0}'")]
    UnknownCommand(String),

    #[error("Declared output file '{0}' missing after a successful build")]
    MissingOutput(Utf8PathBuf),

    #[error("Content store gave up after retries.\n{0}")]
    Store(#[from] StoreError),

    #[error("Couldn't hash declared file.\n{0}")]
    File(#[from] std::io::Error),
}

/// Why a target ended up `Failed` this run. Collected into the
/// [`RunReport`](crate::RunReport) so a single run reports every
/// independently-failing branch.
#[derive(Debug, Error)]
pub enum RunFailure {
    #[error("Configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("Trigger evaluation failed.\n{0}")]
    Trigger(#[source] anyhow::Error),

    #[error(transparent)]
    Exec(#[from] ExecError),

    #[error("Dependency '{0}' failed")]
    Dependency(String),
}
