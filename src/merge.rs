//! `(target-kind, attribute) -> merge-function` registry, per `spec.md`
//! §4.5. Frozen alongside the module loader's registry once loading
//! completes.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde_json::Value;

/// Which half of the data model an attribute belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TargetKind {
    Sample,
    Collection,
}

pub type MergeFn = Arc<dyn Fn(&Value, &Value) -> Value + Send + Sync>;

#[derive(Clone, Default)]
pub struct MergeRegistry {
    fns: HashMap<(TargetKind, String), MergeFn>,
}

impl fmt::Debug for MergeRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MergeRegistry")
            .field("attrs", &self.fns.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl MergeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, kind: TargetKind, attr: impl Into<String>, f: F)
    where
        F: Fn(&Value, &Value) -> Value + Send + Sync + 'static,
    {
        self.fns.insert((kind, attr.into()), Arc::new(f));
    }

    /// Merges `this` and `that` for `attr`, using a registered function if
    /// one exists, else the default policy from `spec.md` §4.5: identical
    /// values pass through, nil on one side yields the other side, and
    /// disagreeing scalars become a tuple.
    pub fn merge(&self, kind: TargetKind, attr: &str, this: &Value, that: &Value) -> Value {
        if let Some(f) = self.fns.get(&(kind, attr.to_string())) {
            return f(this, that);
        }
        default_merge(this, that)
    }
}

fn default_merge(this: &Value, that: &Value) -> Value {
    if this == that {
        return this.clone();
    }
    if this.is_null() {
        return that.clone();
    }
    if that.is_null() {
        return this.clone();
    }
    match (this, that) {
        (Value::Array(a), Value::Array(b)) => {
            let mut merged = a.clone();
            merged.extend(b.clone());
            Value::Array(merged)
        }
        _ => Value::Array(flatten_tuple(this, that)),
    }
}

/// Builds the nested-disagreement tuple as a flat `Vec`, per Open Question
/// decision #2: repeated disagreement across >2 shards nests as
/// `[a, b, c]` instead of `[[a, b], c]`. Since a fold always re-passes its
/// own prior output back in as `this`, an existing array on that side is
/// always a tuple being grown rather than a fresh two-element disagreement.
fn flatten_tuple(this: &Value, that: &Value) -> Vec<Value> {
    let mut out = match this {
        Value::Array(existing) => existing.clone(),
        other => vec![other.clone()],
    };
    out.push(that.clone());
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_values_pass_through() {
        let reg = MergeRegistry::new();
        let v = Value::from(3);
        assert_eq!(reg.merge(TargetKind::Sample, "x", &v, &v), v);
    }

    #[test]
    fn nil_side_yields_other() {
        let reg = MergeRegistry::new();
        let other = Value::from("y");
        assert_eq!(reg.merge(TargetKind::Sample, "x", &Value::Null, &other), other);
        assert_eq!(reg.merge(TargetKind::Sample, "x", &other, &Value::Null), other);
    }

    #[test]
    fn disagreeing_scalars_become_tuple() {
        let reg = MergeRegistry::new();
        let merged = reg.merge(TargetKind::Collection, "x", &Value::from(1), &Value::from(2));
        assert_eq!(merged, Value::from(vec![1, 2]));
    }

    #[test]
    fn repeated_disagreement_nests_flat_not_pairwise() {
        let reg = MergeRegistry::new();
        let merged = reg.merge(TargetKind::Collection, "x", &Value::from(1), &Value::from(2));
        let merged = reg.merge(TargetKind::Collection, "x", &merged, &Value::from(3));
        assert_eq!(merged, Value::from(vec![1, 2, 3]));
    }

    #[test]
    fn registered_function_overrides_default() {
        let mut reg = MergeRegistry::new();
        reg.register(TargetKind::Sample, "count", |a, b| {
            Value::from(a.as_i64().unwrap_or(0) + b.as_i64().unwrap_or(0))
        });
        let merged = reg.merge(TargetKind::Sample, "count", &Value::from(2), &Value::from(5));
        assert_eq!(merged, Value::from(7));
    }
}
