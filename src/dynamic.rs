//! Resolution of dynamic fan-out specifications into concrete sub-targets.
//!
//! Expansion happens when a dynamic target's grouping sources have all
//! completed, which is the only point where the run graph grows. Sub-target
//! identities are derived from the grouping element content, so an element
//! that is unchanged since the previous run resolves to the same identity,
//! finds its stored fingerprint, and skips.

use std::collections::HashMap;

use crate::core::{ArcStr, Blake3Hasher};
use crate::error::ConfigError;
use crate::plan::{DynamicSpec, Margin};
use crate::value::Value;

/// One generated sub-target: its derived identity and the literal argument
/// values (grouping elements) its command receives.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct SubTarget {
    pub name: ArcStr,
    pub args: Vec<Value>,
}

/// The ordered result of resolving a dynamic spec.
#[derive(Debug, Default)]
pub(crate) struct Expansion {
    pub children: Vec<SubTarget>,
    /// Sub-target count before the cap was applied.
    pub total: usize,
}

/// Map-expansion length rule: every grouping length must equal the maximum
/// or evenly divide it (shorter sources recycle). Returns the expansion
/// length.
pub(crate) fn check_conformable(target: &str, lengths: &[usize]) -> Result<usize, ConfigError> {
    let max = lengths.iter().copied().max().unwrap_or(0);

    // All-empty groupings conform to zero sub-targets; otherwise every
    // length must divide the longest so shorter ones recycle evenly.
    let conformable = max == 0
        || lengths
            .iter()
            .all(|&len| len > 0 && max % len == 0);

    if conformable {
        Ok(max)
    } else {
        Err(ConfigError::NonConformable {
            target: target.to_string(),
            lengths: lengths.to_vec(),
        })
    }
}

/// Resolve a dynamic spec against the completed grouping values, in spec
/// order. `cap` bounds how many sub-targets are materialized this run; the
/// full count is still reported in [`Expansion::total`].
pub(crate) fn expand(
    target: &str,
    spec: &DynamicSpec,
    sources: &[(ArcStr, Value)],
    cap: Option<usize>,
) -> Result<Expansion, ConfigError> {
    let mut expansion = match spec {
        DynamicSpec::Map { .. } => expand_map(target, sources)?,
        DynamicSpec::Cross { .. } => expand_cross(target, sources)?,
        DynamicSpec::Combine { by, .. } => expand_combine(target, sources, by.is_some())?,
        DynamicSpec::Split { slices, margin, .. } => {
            expand_split(target, sources, *slices, *margin)?
        }
    };

    expansion.total = expansion.children.len();
    if let Some(cap) = cap {
        expansion.children.truncate(cap);
    }

    Ok(expansion)
}

fn expand_map(target: &str, sources: &[(ArcStr, Value)]) -> Result<Expansion, ConfigError> {
    for (name, value) in sources {
        if matches!(value, Value::List(_) | Value::Table(_)) {
            continue;
        }
        return Err(ConfigError::ScalarGrouping {
            target: target.to_string(),
            grouping: name.to_string(),
        });
    }

    let lengths: Vec<usize> = sources.iter().map(|(_, v)| v.len()).collect();
    let len = check_conformable(target, &lengths)?;

    let mut namer = Namer::new(target);
    let children = (0..len)
        .map(|i| {
            let args: Vec<Value> = sources
                .iter()
                .map(|(_, value)| value.element(i % value.len()))
                .collect();

            SubTarget {
                name: namer.derive(&args),
                args,
            }
        })
        .collect();

    Ok(Expansion { children, total: 0 })
}

fn expand_cross(target: &str, sources: &[(ArcStr, Value)]) -> Result<Expansion, ConfigError> {
    let lengths: Vec<usize> = sources.iter().map(|(_, v)| v.len()).collect();
    if lengths.iter().all(|&len| len == 0) {
        return Ok(Expansion::default());
    }
    if lengths.iter().any(|&len| len == 0) {
        return Err(ConfigError::NonConformable {
            target: target.to_string(),
            lengths,
        });
    }

    let count: usize = lengths.iter().product();
    let mut namer = Namer::new(target);
    let mut children = Vec::with_capacity(count);

    // Row-major order with the first-listed source varying slowest.
    for mut index in 0..count {
        let mut args = vec![Value::Unit; sources.len()];
        for (slot, (_, value)) in sources.iter().enumerate().rev() {
            args[slot] = value.element(index % value.len());
            index /= value.len();
        }

        children.push(SubTarget {
            name: namer.derive(&args),
            args,
        });
    }

    Ok(Expansion { children, total: 0 })
}

fn expand_combine(
    target: &str,
    sources: &[(ArcStr, Value)],
    keyed: bool,
) -> Result<Expansion, ConfigError> {
    let (_, members) = &sources[0];
    let len = members.len();

    // Without a key, everything merges into a single aggregate.
    if !keyed {
        let members: Vec<Value> = (0..len).map(|i| members.element(i)).collect();
        return Ok(Expansion {
            children: vec![SubTarget {
                name: ArcStr::from(format!("{target}@all")),
                args: vec![Value::List(members)],
            }],
            total: 0,
        });
    }

    let (by_name, keys) = &sources[1];
    if keys.len() != len {
        return Err(ConfigError::NonConformable {
            target: target.to_string(),
            lengths: vec![len, keys.len()],
        });
    }
    let _ = by_name;

    // Group member values by equal key values, first-appearance order.
    let mut order: Vec<Value> = Vec::new();
    let mut groups: Vec<Vec<Value>> = Vec::new();

    for i in 0..len {
        let key = keys.element(i);
        match order.iter().position(|k| *k == key) {
            Some(slot) => groups[slot].push(members.element(i)),
            None => {
                order.push(key);
                groups.push(vec![members.element(i)]);
            }
        }
    }

    let mut namer = Namer::new(target);
    let children = order
        .into_iter()
        .zip(groups)
        .map(|(key, group)| SubTarget {
            name: namer.derive_keyed(&key),
            args: vec![Value::List(group), key],
        })
        .collect();

    Ok(Expansion { children, total: 0 })
}

fn expand_split(
    target: &str,
    sources: &[(ArcStr, Value)],
    slices: usize,
    margin: Margin,
) -> Result<Expansion, ConfigError> {
    let (_, value) = &sources[0];

    let len = match (value, margin) {
        (Value::Table(table), Margin::Columns) => table.columns.len(),
        (value, _) => value.len(),
    };

    let slices = slices.min(len).max(1);
    let base = len / slices;
    let remainder = len % slices;

    let mut children = Vec::with_capacity(slices);
    let mut cursor = 0;

    for i in 0..slices {
        // Remainder rows go to the first few slices.
        let size = base + usize::from(i < remainder);
        let (from, to) = (cursor, cursor + size);
        cursor = to;

        let slice = match (value, margin) {
            (Value::Table(table), Margin::Rows) => Value::Table(table.slice_rows(from, to)),
            (Value::Table(table), Margin::Columns) => Value::Table(table.slice_columns(from, to)),
            (Value::List(items), _) => Value::List(items[from..to].to_vec()),
            (other, _) => other.clone(),
        };

        children.push(SubTarget {
            // Slices are positional, so the identity is index-based.
            name: ArcStr::from(format!("{target}@{}of{}", i + 1, slices)),
            args: vec![slice],
        });
    }

    Ok(Expansion { children, total: 0 })
}

/// Derives deterministic, unique child names from grouping element content.
/// Identical elements occurring more than once get an occurrence suffix so
/// identities stay unique within the expansion.
struct Namer<'a> {
    parent: &'a str,
    seen: HashMap<ArcStr, usize>,
}

impl<'a> Namer<'a> {
    fn new(parent: &'a str) -> Self {
        Self {
            parent,
            seen: HashMap::new(),
        }
    }

    fn derive(&mut self, args: &[Value]) -> ArcStr {
        let mut hasher = Blake3Hasher::default();
        for arg in args {
            hasher.update(arg.fingerprint().to_hex());
        }
        let key = hasher.finalize().to_hex_short();
        self.unique(format!("{}@{}", self.parent, key))
    }

    fn derive_keyed(&mut self, key: &Value) -> ArcStr {
        let key = key
            .label()
            .unwrap_or_else(|| key.fingerprint().to_hex_short());
        self.unique(format!("{}@{}", self.parent, key))
    }

    fn unique(&mut self, name: String) -> ArcStr {
        let name = ArcStr::from(name);
        let count = self.seen.entry(name.clone()).or_insert(0);
        *count += 1;

        if *count == 1 {
            name
        } else {
            ArcStr::from(format!("{name}-{count}"))
        }
    }
}
