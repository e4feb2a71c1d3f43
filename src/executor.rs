//! The seam between the scheduler and user computations.
//!
//! The engine never interprets a command reference; it hands the resolved
//! inputs to an [`Executor`] and takes back a [`Value`] or a failure. The
//! default [`FnExecutor`] dispatches to registered closures, which is also
//! how every test drives the engine; distributed or multi-process backends
//! implement the same trait.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::mpsc;
use std::time::Duration;

use crate::core::ArcStr;
use crate::error::ExecError;
use crate::value::Value;

/// Everything a command invocation can see: the target identity, the
/// opaque command reference, literal arguments (grouping elements for
/// sub-targets), resolved dependency values and the active seed.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub target: ArcStr,
    pub reference: String,
    pub args: Vec<Value>,
    pub deps: BTreeMap<ArcStr, Value>,
    pub seed: Option<u64>,
}

impl Invocation {
    /// Resolved value of a named dependency.
    pub fn dep(&self, name: &str) -> Option<&Value> {
        self.deps.get(name)
    }
}

/// Executes one target's command. Synchronous from the scheduler's point of
/// view; implementations may be asynchronous or remote internally.
pub trait Executor: Send + Sync {
    fn execute(&self, invocation: Invocation) -> Result<Value, ExecError>;
}

/// Result from a single executed command.
pub type CommandResult = anyhow::Result<Value>;

type CommandFn = Arc<dyn Fn(&Invocation) -> CommandResult + Send + Sync>;

/// In-process executor: a registry of named command closures with an
/// optional per-call timeout.
#[derive(Default, Clone)]
pub struct FnExecutor {
    commands: HashMap<String, CommandFn>,
    timeout: Option<Duration>,
}

impl FnExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(mut self, reference: impl Into<String>, command: F) -> Self
    where
        F: Fn(&Invocation) -> CommandResult + Send + Sync + 'static,
    {
        self.commands.insert(reference.into(), Arc::new(command));
        self
    }

    /// Per-call wall-clock limit. A call past the deadline reports
    /// [`ExecError::Timeout`]; the runaway closure is abandoned on its
    /// helper thread rather than blocking the scheduler's worker.
    pub fn timeout(mut self, limit: Duration) -> Self {
        self.timeout = Some(limit);
        self
    }
}

impl std::fmt::Debug for FnExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<_> = self.commands.keys().collect();
        names.sort();
        f.debug_struct("FnExecutor")
            .field("commands", &names)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl Executor for FnExecutor {
    fn execute(&self, invocation: Invocation) -> Result<Value, ExecError> {
        let command = self
            .commands
            .get(&invocation.reference)
            .cloned()
            .ok_or_else(|| ExecError::UnknownCommand(invocation.reference.clone()))?;

        match self.timeout {
            None => command(&invocation).map_err(ExecError::Command),
            Some(limit) => {
                let (sender, receiver) = mpsc::channel();

                std::thread::spawn(move || {
                    // The receiver may be gone already if we timed out.
                    let _ = sender.send(command(&invocation));
                });

                match receiver.recv_timeout(limit) {
                    Ok(result) => result.map_err(ExecError::Command),
                    Err(_) => Err(ExecError::Timeout(limit)),
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn invocation(reference: &str) -> Invocation {
        Invocation {
            target: ArcStr::from("t"),
            reference: reference.to_string(),
            args: vec![],
            deps: BTreeMap::new(),
            seed: None,
        }
    }

    #[test]
    fn test_dispatch_by_reference() {
        let executor = FnExecutor::new()
            .register("double", |inv| {
                let n = match inv.dep("n") {
                    Some(Value::Int(n)) => *n,
                    _ => 0,
                };
                Ok(Value::Int(n * 2))
            });

        let mut inv = invocation("double");
        inv.deps.insert(ArcStr::from("n"), Value::Int(21));

        assert_eq!(executor.execute(inv).unwrap(), Value::Int(42));
    }

    #[test]
    fn test_unknown_command() {
        let executor = FnExecutor::new();
        let result = executor.execute(invocation("nope"));
        assert!(matches!(result, Err(ExecError::UnknownCommand(name)) if name == "nope"));
    }

    #[test]
    fn test_command_error_wrapped() {
        let executor = FnExecutor::new().register("boom", |_| anyhow::bail!("exploded"));
        let result = executor.execute(invocation("boom"));
        assert!(matches!(result, Err(ExecError::Command(_))));
    }

    #[test]
    fn test_timeout_fires() {
        let executor = FnExecutor::new()
            .register("slow", |_| {
                std::thread::sleep(Duration::from_secs(5));
                Ok(Value::Unit)
            })
            .timeout(Duration::from_millis(20));

        let result = executor.execute(invocation("slow"));
        assert!(matches!(result, Err(ExecError::Timeout(_))));
    }

    #[test]
    fn test_timeout_passes_fast_calls() {
        let executor = FnExecutor::new()
            .register("fast", |_| Ok(Value::Int(1)))
            .timeout(Duration::from_secs(1));

        assert_eq!(executor.execute(invocation("fast")).unwrap(), Value::Int(1));
    }
}
