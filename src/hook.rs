//! Hook metadata and the topological scheduler, per `spec.md` §4.2.
//! Pre-hooks run once, sequentially, before dispatch; post-hooks run
//! after all runners, filtered by `condition`.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::sample::SampleCollection;
use crate::{Error, Result};

pub const ALL: &str = "all";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HookKind {
    Pre,
    Post,
}

/// A post-hook's run condition. Ignored (always treated as `Always`) for
/// pre-hooks, which always run once per invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Condition {
    #[default]
    Always,
    Complete,
    Failed,
}

impl Condition {
    fn should_run(self, collection: &SampleCollection) -> bool {
        match self {
            Condition::Always => true,
            Condition::Complete => collection.all_non_failed(),
            Condition::Failed => collection.any_failed(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HookMeta {
    pub kind: Option<HookKind>,
    pub label: String,
    #[serde(default)]
    pub before: Vec<String>,
    #[serde(default)]
    pub after: Vec<String>,
    #[serde(default)]
    pub condition: Condition,
}

impl HookMeta {
    pub fn new(kind: HookKind, label: impl Into<String>) -> Self {
        Self { kind: Some(kind), label: label.into(), before: Vec::new(), after: Vec::new(), condition: Condition::default() }
    }

    pub fn before(mut self, label: impl Into<String>) -> Self {
        self.before.push(label.into());
        self
    }

    pub fn after(mut self, label: impl Into<String>) -> Self {
        self.after.push(label.into());
        self
    }

    pub fn condition(mut self, condition: Condition) -> Self {
        self.condition = condition;
        self
    }
}

pub type HookFn = dyn Fn(SampleCollection) -> Result<SampleCollection> + Send + Sync;

#[derive(Clone)]
pub struct Hook {
    pub meta: HookMeta,
    pub call: Arc<HookFn>,
}

/// Computes a total ordering of `hooks` consistent with their `before`/
/// `after` constraints. Ties break to registration order (the order
/// `hooks` is passed in). Returns `UnresolvedHookDependencies` if the
/// constraint graph has a cycle.
pub fn order(hooks: &[Hook]) -> Result<Vec<usize>> {
    let n = hooks.len();
    let index_of: HashMap<&str, usize> = hooks.iter().enumerate().map(|(i, h)| (h.meta.label.as_str(), i)).collect();

    // A hook naming itself in `before`/`after` is an unresolvable cycle of
    // length one; short-circuit before the Kahn bookkeeping below, which
    // otherwise drops self-edges and would report no constraint at all.
    for hook in hooks {
        if hook.meta.before.iter().any(|l| l == &hook.meta.label) || hook.meta.after.iter().any(|l| l == &hook.meta.label) {
            return Err(Error::UnresolvedHookDependencies);
        }
    }

    // edges[i] = set of nodes that must come after i
    let mut edges: Vec<HashSet<usize>> = vec![HashSet::new(); n];
    let mut indegree = vec![0usize; n];

    let add_edge = |from: usize, to: usize, edges: &mut Vec<HashSet<usize>>, indegree: &mut [usize]| {
        if from != to && edges[from].insert(to) {
            indegree[to] += 1;
        }
    };

    for (i, hook) in hooks.iter().enumerate() {
        for before in &hook.meta.before {
            if before == ALL {
                for j in 0..n {
                    add_edge(i, j, &mut edges, &mut indegree);
                }
            } else if let Some(&j) = index_of.get(before.as_str()) {
                add_edge(i, j, &mut edges, &mut indegree);
            }
        }
        for after in &hook.meta.after {
            if after == ALL {
                for j in 0..n {
                    add_edge(j, i, &mut edges, &mut indegree);
                }
            } else if let Some(&j) = index_of.get(after.as_str()) {
                add_edge(j, i, &mut edges, &mut indegree);
            }
        }
    }

    // Stable Kahn's algorithm: always pick the lowest-index ready node so
    // that, among all legal orderings, the result equals registration
    // order.
    let mut ready: std::collections::BTreeSet<usize> = (0..n).filter(|&i| indegree[i] == 0).collect();
    let mut order = Vec::with_capacity(n);
    while let Some(&next) = ready.iter().next() {
        ready.remove(&next);
        order.push(next);
        for &to in &edges[next] {
            indegree[to] -= 1;
            if indegree[to] == 0 {
                ready.insert(to);
            }
        }
    }

    if order.len() != n {
        return Err(Error::UnresolvedHookDependencies);
    }
    Ok(order)
}

/// Runs pre-hooks sequentially in `ordering`, threading the returned
/// collection through. A hook that panics or returns an error is caught,
/// logged, and does not abort the remaining pre-hooks.
pub fn run_pre_hooks(hooks: &[Hook], ordering: &[usize], mut collection: SampleCollection) -> SampleCollection {
    for &i in ordering {
        let hook = &hooks[i];
        if crate::env::CELLOPHANE_SKIP_HOOK.contains(&hook.meta.label) {
            warn!("{}: skipping hook due to CELLOPHANE_SKIP_HOOK", hook.meta.label);
            continue;
        }
        info!("Running {} hook", hook.meta.label);
        let call = hook.call.clone();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| call(collection.clone())));
        match result {
            Ok(Ok(next)) => collection = next,
            Ok(Err(e)) => warn!("Unhandled exception: {e}"),
            Err(_) => warn!("Unhandled exception: hook '{}' panicked", hook.meta.label),
        }
    }
    collection
}

/// Runs post-hooks sequentially in `ordering`, skipping any whose
/// `condition` the final collection doesn't satisfy.
pub fn run_post_hooks(hooks: &[Hook], ordering: &[usize], mut collection: SampleCollection) -> SampleCollection {
    for &i in ordering {
        let hook = &hooks[i];
        if !hook.meta.condition.should_run(&collection) {
            continue;
        }
        if crate::env::CELLOPHANE_SKIP_HOOK.contains(&hook.meta.label) {
            warn!("{}: skipping hook due to CELLOPHANE_SKIP_HOOK", hook.meta.label);
            continue;
        }
        info!("Running {} hook", hook.meta.label);
        let call = hook.call.clone();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| call(collection.clone())));
        match result {
            Ok(Ok(next)) => collection = next,
            Ok(Err(e)) => warn!("Unhandled exception: {e}"),
            Err(_) => warn!("Unhandled exception: hook '{}' panicked", hook.meta.label),
        }
    }
    collection
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn noop_hook(label: &str, before: Vec<&str>, after: Vec<&str>) -> Hook {
        let mut meta = HookMeta::new(HookKind::Pre, label);
        meta.before = before.into_iter().map(String::from).collect();
        meta.after = after.into_iter().map(String::from).collect();
        Hook { meta, call: Arc::new(Ok) }
    }

    #[test]
    fn orders_by_constraints_then_registration() {
        let hooks = vec![
            noop_hook("b", vec![], vec![]),
            noop_hook("a", vec!["b"], vec![]),
            noop_hook("c", vec![], vec![]),
        ];
        let ordering = order(&hooks).unwrap();
        let labels: Vec<&str> = ordering.iter().map(|&i| hooks[i].meta.label.as_str()).collect();
        assert_eq!(labels, vec!["a", "b", "c"]);
    }

    #[test]
    fn cycle_is_fatal() {
        let hooks = vec![noop_hook("a", vec![], vec!["a"])];
        assert!(matches!(order(&hooks), Err(Error::UnresolvedHookDependencies)));

        let hooks = vec![noop_hook("a", vec![], vec!["b"]), noop_hook("b", vec![], vec!["a"])];
        assert!(matches!(order(&hooks), Err(Error::UnresolvedHookDependencies)));
    }

    #[test]
    fn self_reference_is_fatal() {
        let hooks = vec![noop_hook("a", vec![], vec!["a"])];
        assert!(matches!(order(&hooks), Err(Error::UnresolvedHookDependencies)));

        let hooks = vec![noop_hook("a", vec!["a"], vec![])];
        assert!(matches!(order(&hooks), Err(Error::UnresolvedHookDependencies)));
    }

    #[test]
    fn all_sentinel_pins_to_extremes() {
        let hooks = vec![
            noop_hook("middle", vec![], vec![]),
            noop_hook("first", vec![ALL], vec![]),
            noop_hook("last", vec![], vec![ALL]),
        ];
        let ordering = order(&hooks).unwrap();
        let labels: Vec<&str> = ordering.iter().map(|&i| hooks[i].meta.label.as_str()).collect();
        assert_eq!(labels, vec!["first", "middle", "last"]);
    }

    #[test]
    fn post_hook_condition_filters_execution() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = calls.clone();
        let meta = HookMeta::new(HookKind::Post, "only_on_failure").condition(Condition::Failed);
        let hook = Hook {
            meta,
            call: Arc::new(move |c: SampleCollection| {
                calls2.fetch_add(1, Ordering::SeqCst);
                Ok(c)
            }),
        };
        let hooks = vec![hook];
        let ordering = order(&hooks).unwrap();

        let mut sample = crate::sample::Sample::new("a", vec![]);
        let collection = SampleCollection::new(vec![sample.clone()]);
        run_post_hooks(&hooks, &ordering, collection);
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        sample.fail("boom");
        let collection = SampleCollection::new(vec![sample]);
        run_post_hooks(&hooks, &ordering, collection);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
