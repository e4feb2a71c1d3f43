//! Static symbol-dependency index for user functions.
//!
//! Commands may call user functions, which may call further functions or
//! reference targets. The engine never introspects user code at run time;
//! instead the plan carries an explicit symbol table and dependency edges
//! are derived from a reachability query over it. A change to a helper used
//! by a helper therefore reaches every consumer through the folded code
//! hash.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use crate::core::{ArcStr, Blake3Hasher, Hash32};
use crate::fingerprint::normalize_source;

/// A user function body plus the symbols it references (functions or
/// targets).
#[derive(Debug, Clone)]
pub struct Function {
    pub(crate) body: String,
    pub(crate) uses: Vec<ArcStr>,
}

/// Everything a command can see from its `uses` list, resolved
/// transitively.
#[derive(Debug, Default)]
pub(crate) struct Reach {
    /// Target names reachable directly or through functions.
    pub targets: BTreeSet<ArcStr>,
    /// Functions visited along the way, in name order.
    pub functions: BTreeSet<ArcStr>,
}

#[derive(Debug, Default)]
pub struct SymbolTable {
    functions: BTreeMap<ArcStr, Function>,
}

impl SymbolTable {
    pub fn define(
        &mut self,
        name: impl Into<ArcStr>,
        body: impl Into<String>,
        uses: impl IntoIterator<Item = impl Into<ArcStr>>,
    ) {
        self.functions.insert(name.into(), Function {
            body: body.into(),
            uses: uses.into_iter().map(Into::into).collect(),
        });
    }

    pub(crate) fn contains(&self, name: &str) -> bool {
        self.functions.contains_key(name)
    }

    /// Breadth-first walk from the given roots. Names that are not
    /// functions are assumed to be targets; the caller validates them
    /// against the plan.
    pub(crate) fn reach(&self, roots: &[ArcStr]) -> Reach {
        let mut reach = Reach::default();
        let mut queue: VecDeque<ArcStr> = roots.iter().cloned().collect();

        while let Some(name) = queue.pop_front() {
            match self.functions.get(&name) {
                Some(function) => {
                    if reach.functions.insert(name) {
                        queue.extend(function.uses.iter().cloned());
                    }
                }
                None => {
                    reach.targets.insert(name);
                }
            }
        }

        reach
    }

    /// Hash of the normalized bodies of the given functions, folded in name
    /// order. This participates in the command fingerprint, so editing any
    /// reachable helper marks its consumers stale.
    pub(crate) fn code_hash(&self, functions: &BTreeSet<ArcStr>) -> Hash32 {
        let mut hasher = Blake3Hasher::default();

        for name in functions {
            if let Some(function) = self.functions.get(name) {
                hasher.update(name.as_bytes());
                hasher.update(b"\0");
                hasher.update(normalize_source(&function.body));
                hasher.update(b"\0");
            }
        }

        hasher.finalize()
    }
}
