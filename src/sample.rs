//! The unit of work, per `spec.md` §3 Data Model: `Sample` and
//! `SampleCollection`, their attribute bags, and the monotonic success/
//! failure state machine.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::output::OutputSet;

/// A sample's processing state. Monotonic: once `Failed`, it never
/// returns to `Complete` (`spec.md` §3 Invariants).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state", content = "reason")]
pub enum SampleState {
    Pending,
    Complete,
    Failed(String),
}

impl SampleState {
    pub fn is_failed(&self) -> bool {
        matches!(self, SampleState::Failed(_))
    }
}

/// One unit of work: identity (not required unique within a collection),
/// its input files, a mutable attribute bag populated from the samples
/// manifest and user mixins, and a per-sample output set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sample {
    pub id: String,
    pub files: Vec<String>,
    state: SampleState,
    #[serde(default)]
    pub attrs: IndexMap<String, Value>,
    #[serde(default)]
    pub outputs: OutputSet,
}

impl Sample {
    pub fn new(id: impl Into<String>, files: Vec<String>) -> Self {
        Self { id: id.into(), files, state: SampleState::Pending, attrs: IndexMap::new(), outputs: OutputSet::default() }
    }

    pub fn state(&self) -> &SampleState {
        &self.state
    }

    /// Transitions this sample to `Complete`. A no-op, per the monotonic
    /// invariant, if the sample is already `Failed`.
    pub fn complete(&mut self) {
        if !self.state.is_failed() {
            self.state = SampleState::Complete;
        }
    }

    /// Transitions this sample to `Failed(reason)`. Always takes effect;
    /// a second failure simply overwrites the reason.
    pub fn fail(&mut self, reason: impl Into<String>) {
        self.state = SampleState::Failed(reason.into());
    }

    pub fn get(&self, attr: &str) -> Option<&Value> {
        self.attrs.get(attr)
    }

    pub fn set(&mut self, attr: impl Into<String>, value: Value) {
        self.attrs.insert(attr.into(), value);
    }
}

/// An ordered sequence of samples, the reserved bucket key used when a
/// `split_by` attribute is absent on a sample.
pub const UNKNOWN_SHARD: &str = "unknown";

/// An ordered sequence of samples plus its own collection-level attribute
/// bag, output set, and a *call id* tag naming workdirs when this
/// collection is a split shard.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SampleCollection {
    pub samples: Vec<Sample>,
    #[serde(default)]
    pub attrs: IndexMap<String, Value>,
    #[serde(default)]
    pub outputs: OutputSet,
    /// Names the shard when this collection was produced by `split_by`;
    /// `None` for the unsplit, top-level collection.
    #[serde(default)]
    pub call_id: Option<String>,
}

impl SampleCollection {
    pub fn new(samples: Vec<Sample>) -> Self {
        Self { samples, ..Default::default() }
    }

    pub fn any_failed(&self) -> bool {
        self.samples.iter().any(|s| s.state().is_failed())
    }

    pub fn all_non_failed(&self) -> bool {
        !self.any_failed()
    }

    /// Partitions the collection by the value of `attr` on each sample.
    /// Samples with no value for `attr` form a shard keyed
    /// [`UNKNOWN_SHARD`]. Shard order is first-occurrence order of each
    /// key, per `spec.md` §5 ("shard dispatch order is the split-key
    /// ordering, stable").
    pub fn split_by(&self, attr: &str) -> Vec<(String, SampleCollection)> {
        let mut order: Vec<String> = Vec::new();
        let mut buckets: IndexMap<String, Vec<Sample>> = IndexMap::new();
        for sample in &self.samples {
            let key = sample
                .get(attr)
                .filter(|v| !v.is_null())
                .map(|v| v.as_str().map(str::to_string).unwrap_or_else(|| v.to_string()))
                .unwrap_or_else(|| UNKNOWN_SHARD.to_string());
            if !buckets.contains_key(&key) {
                order.push(key.clone());
            }
            buckets.entry(key).or_default().push(sample.clone());
        }
        order
            .into_iter()
            .map(|key| {
                let samples = buckets.swap_remove(&key).unwrap_or_default();
                let mut shard = SampleCollection::new(samples);
                shard.call_id = Some(key.clone());
                (key, shard)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_is_monotonic_once_failed() {
        let mut s = Sample::new("a", vec![]);
        s.fail("boom");
        s.complete();
        assert_eq!(s.state(), &SampleState::Failed("boom".to_string()));
    }

    #[test]
    fn split_by_groups_and_preserves_order_with_unknown_bucket() {
        let mut a = Sample::new("a", vec![]);
        a.set("custom_prop", Value::from("x"));
        let mut b = Sample::new("b", vec![]);
        b.set("custom_prop", Value::from("y"));
        let mut c = Sample::new("c", vec![]);
        c.set("custom_prop", Value::from("y"));
        let d = Sample::new("d", vec![]);

        let collection = SampleCollection::new(vec![a, b, c, d]);
        let shards = collection.split_by("custom_prop");
        let keys: Vec<&str> = shards.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["x", "y", UNKNOWN_SHARD]);
        assert_eq!(shards[1].1.samples.len(), 2);
    }

    #[test]
    fn split_by_treats_explicit_null_as_unknown() {
        let mut a = Sample::new("a", vec![]);
        a.set("custom_prop", Value::Null);
        let b = Sample::new("b", vec![]);

        let collection = SampleCollection::new(vec![a, b]);
        let shards = collection.split_by("custom_prop");
        let keys: Vec<&str> = shards.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec![UNKNOWN_SHARD]);
        assert_eq!(shards[0].1.samples.len(), 2);
    }

    #[test]
    fn collection_condition_helpers() {
        let mut a = Sample::new("a", vec![]);
        let b = Sample::new("b", vec![]);
        let collection = SampleCollection::new(vec![a.clone(), b.clone()]);
        assert!(collection.all_non_failed());
        a.fail("x");
        let collection = SampleCollection::new(vec![a, b]);
        assert!(collection.any_failed());
    }
}
