//! Staleness decisions: snapshots of everything that should invalidate a
//! target, compared against the record of its last successful build.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use crate::core::{ArcStr, Blake3Hasher, Hash32};
use crate::error::ExecError;
use crate::plan::{Command, TargetSpec, TriggerContext, TriggerMode, TriggerSpec};
use crate::store::TargetRecord;
use crate::symbols::SymbolTable;
use crate::value::Value;

/// Whitespace/comment-normalize command or function source text, so purely
/// cosmetic edits never mark a target stale. `#` starts a comment outside
/// quoted strings. A whitespace run survives only as a single space, and
/// only where it separates two identifier characters; spaces around
/// punctuation are dropped entirely, so `f( x )` and `f(x)` agree.
pub(crate) fn normalize_source(source: &str) -> String {
    fn is_ident(c: char) -> bool {
        c.is_alphanumeric() || c == '_'
    }

    let mut out = String::with_capacity(source.len());
    let mut quote: Option<char> = None;
    let mut in_comment = false;
    let mut pending_space = false;

    let mut emit = |out: &mut String, pending: &mut bool, c: char| {
        if *pending
            && is_ident(c)
            && out.chars().last().is_some_and(is_ident)
        {
            out.push(' ');
        }
        *pending = false;
        out.push(c);
    };

    for c in source.chars() {
        if in_comment {
            if c == '\n' {
                in_comment = false;
                pending_space = true;
            }
            continue;
        }

        match quote {
            Some(q) => {
                out.push(c);
                if c == q {
                    quote = None;
                }
            }
            None => match c {
                '#' => in_comment = true,
                '"' | '\'' => {
                    emit(&mut out, &mut pending_space, c);
                    quote = Some(c);
                }
                c if c.is_whitespace() => pending_space = true,
                c => emit(&mut out, &mut pending_space, c),
            },
        }
    }

    out
}

/// The current-run values of every fingerprint component for one target.
/// Compared field-by-field against the stored [`TargetRecord`] by the
/// trigger predicates, then folded into the new fingerprint.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Snapshot {
    pub command: Hash32,
    pub deps: BTreeMap<String, Hash32>,
    pub files: BTreeMap<String, Option<Hash32>>,
    pub seed: Option<u64>,
    pub args: Hash32,
    pub change: Option<Hash32>,
}

impl Snapshot {
    // NUL-separated like `command_hash`, so adjacent entries can never be
    // confused across a field boundary.
    pub(crate) fn fingerprint(&self) -> Hash32 {
        let mut hasher = Blake3Hasher::default();
        hasher.update(self.command.to_hex()).update(b"\0");

        for (name, hash) in &self.deps {
            hasher
                .update(name)
                .update(b"\0")
                .update(hash.to_hex())
                .update(b"\0");
        }

        for (path, hash) in &self.files {
            hasher.update(path).update(b"\0");
            match hash {
                Some(hash) => hasher.update(hash.to_hex()),
                None => hasher.update("-"),
            };
            hasher.update(b"\0");
        }

        if let Some(seed) = self.seed {
            hasher.update(seed.to_le_bytes());
        }
        hasher.update(b"\0");

        hasher.update(self.args.to_hex()).update(b"\0");

        if let Some(change) = self.change {
            hasher.update(change.to_hex());
        }

        hasher.finalize()
    }

    pub(crate) fn into_record(self) -> TargetRecord {
        TargetRecord {
            fingerprint: self.fingerprint(),
            command: self.command,
            deps: self.deps,
            files: self.files,
            seed: self.seed,
            args: self.args,
            change: self.change,
        }
    }
}

/// Outcome of trigger evaluation for a ready target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Staleness {
    Stale(&'static str),
    Fresh,
}

/// Evaluates trigger predicates against store records. Owns the in-memory
/// cache of change-hook value hashes for the run, so each change hook runs
/// at most once per target.
pub(crate) struct FingerprintEngine<'a> {
    symbols: &'a SymbolTable,
    default_seed: Option<u64>,
    change_cache: Mutex<HashMap<ArcStr, Hash32>>,
}

impl<'a> FingerprintEngine<'a> {
    pub(crate) fn new(symbols: &'a SymbolTable, default_seed: Option<u64>) -> Self {
        Self {
            symbols,
            default_seed,
            change_cache: Mutex::new(HashMap::new()),
        }
    }

    /// Hash of the normalized command text folded with the normalized
    /// bodies of every reachable user function. Editing a helper called by
    /// a helper lands here, which is what makes its consumers stale.
    pub(crate) fn command_hash(&self, command: &Command) -> Hash32 {
        let reach = self.symbols.reach(&command.uses);

        let mut hasher = Blake3Hasher::default();
        hasher.update(&command.reference);
        hasher.update(b"\0");
        hasher.update(normalize_source(&command.source));
        hasher.update(b"\0");
        hasher.update(self.symbols.code_hash(&reach.functions).to_hex());
        hasher.finalize()
    }

    /// Capture the current fingerprint components for a target. Dependency
    /// fingerprints are this run's, supplied by the scheduler; the change
    /// component is filled in by [`decide`](Self::decide).
    pub(crate) fn snapshot(
        &self,
        target: &TargetSpec,
        command: Option<&Command>,
        args: &[Value],
        deps: &BTreeMap<ArcStr, Hash32>,
    ) -> Result<Snapshot, ExecError> {
        let command = match command {
            Some(command) => self.command_hash(command),
            None => Hash32::hash(target.name.as_bytes()),
        };

        let mut files = BTreeMap::new();
        for path in target.files_in.iter().chain(&target.files_out) {
            let hash = match path.exists() {
                true => Some(Hash32::hash_file(path)?),
                false => None,
            };
            files.insert(path.to_string(), hash);
        }

        let mut args_hasher = Blake3Hasher::default();
        for arg in args {
            args_hasher.update(arg.fingerprint().to_hex());
        }

        Ok(Snapshot {
            command,
            deps: deps
                .iter()
                .map(|(name, hash)| (name.to_string(), *hash))
                .collect(),
            files,
            seed: target.seed.or(self.default_seed),
            args: args_hasher.finalize(),
            change: None,
        })
    }

    /// Run the configured triggers. Hook failures bubble up as
    /// `anyhow::Error` and are fatal to this target and its dependents
    /// only.
    pub(crate) fn decide(
        &self,
        name: &ArcStr,
        spec: &TriggerSpec,
        ctx: &TriggerContext,
        snapshot: &mut Snapshot,
        record: Option<&TargetRecord>,
        value_stored: bool,
    ) -> anyhow::Result<Staleness> {
        let condition = match &spec.condition {
            Some(hook) => Some(hook(ctx)?),
            None => None,
        };

        match spec.mode {
            TriggerMode::Condition => {
                return Ok(match condition {
                    Some(true) => Staleness::Stale("condition"),
                    _ => Staleness::Fresh,
                });
            }
            TriggerMode::Blacklist if condition == Some(false) => {
                return Ok(Staleness::Fresh);
            }
            TriggerMode::Whitelist if condition == Some(true) => {
                return Ok(Staleness::Stale("condition"));
            }
            _ => {}
        }

        // The change hook runs at most once per target per run; its value
        // hash stays cached for the remainder of the run.
        if let Some(hook) = &spec.change {
            let cached = self.change_cache.lock().unwrap().get(name).copied();
            let hash = match cached {
                Some(hash) => hash,
                None => {
                    let hash = hook(ctx)?.fingerprint();
                    self.change_cache.lock().unwrap().insert(name.clone(), hash);
                    hash
                }
            };
            snapshot.change = Some(hash);
        }

        let Some(record) = record else {
            return Ok(match spec.missing {
                true => Staleness::Stale("missing"),
                false => Staleness::Fresh,
            });
        };

        if spec.missing && !value_stored {
            return Ok(Staleness::Stale("missing"));
        }

        if spec.command && snapshot.command != record.command {
            return Ok(Staleness::Stale("command"));
        }

        if spec.depend && (snapshot.deps != record.deps || snapshot.args != record.args) {
            return Ok(Staleness::Stale("depend"));
        }

        if spec.file && snapshot.files != record.files {
            return Ok(Staleness::Stale("file"));
        }

        if spec.seed && snapshot.seed != record.seed {
            return Ok(Staleness::Stale("seed"));
        }

        if let (Some(current), recorded) = (snapshot.change, record.change)
            && Some(current) != recorded
        {
            return Ok(Staleness::Stale("change"));
        }

        Ok(Staleness::Fresh)
    }
}
