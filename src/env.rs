pub use std::env::*;
use std::collections::HashSet;
use std::sync::LazyLock;

/// Hook labels named in `CELLOPHANE_SKIP_HOOK` (comma-separated) are
/// skipped by the scheduler before they would otherwise run.
pub static CELLOPHANE_SKIP_HOOK: LazyLock<HashSet<String>> = LazyLock::new(|| {
    var("CELLOPHANE_SKIP_HOOK")
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
});
