//! Eager and deferred path cleaners, per `spec.md` §4.7. The eager
//! cleaner is used by the driver at scope exit for the global workdir;
//! the deferred cleaner is handed to runners and flushed when their
//! worker scope exits.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Scope {
    InsideRoot,
    OutsideRoot,
}

/// Resolves `path` against `root`, classifying it `InsideRoot` or
/// `OutsideRoot`. `root`-relative strings are joined against `root`
/// first, per `spec.md` §4.7 (`unregister` accepts both forms).
fn classify(root: &Path, path: &Path) -> (PathBuf, Scope) {
    let resolved = if path.is_absolute() { path.to_path_buf() } else { root.join(path) };
    let scope = if resolved.starts_with(root) { Scope::InsideRoot } else { Scope::OutsideRoot };
    (resolved, scope)
}

/// Removes a registered set of paths immediately at scope exit, used for
/// the global workdir. Logs one removal per top-level entry and swallows
/// per-path errors (`spec.md` §7: "cleanup removal errors — logged per
/// path, never fatal").
pub struct EagerCleaner {
    root: PathBuf,
    paths: Vec<PathBuf>,
}

impl EagerCleaner {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into(), paths: Vec::new() }
    }

    pub fn register(&mut self, path: impl AsRef<Path>, ignore_outside_root: bool) {
        let (resolved, scope) = classify(&self.root, path.as_ref());
        if scope == Scope::OutsideRoot && !ignore_outside_root {
            warn!("{} outside {}", resolved.display(), self.root.display());
            return;
        }
        self.paths.push(resolved);
    }

    pub fn clean(&mut self) {
        for path in self.paths.drain(..) {
            info!("Removing {}", path.display());
            let result = if path.is_dir() { std::fs::remove_dir_all(&path) } else { std::fs::remove_file(&path) };
            if let Err(e) = result {
                if !matches!(e.kind(), std::io::ErrorKind::NotFound) {
                    warn!("{}: {e}", path.display());
                }
            }
        }
    }
}

impl Drop for EagerCleaner {
    fn drop(&mut self) {
        self.clean();
    }
}

/// Accumulates `register`/`unregister` calls inside a runner; idempotent,
/// last-write-wins. `clean()` is a documented no-op — flushing happens
/// only through `flush()` at worker scope exit.
#[derive(Default)]
pub struct DeferredCleaner {
    root: PathBuf,
    registered: HashMap<PathBuf, bool>,
}

impl DeferredCleaner {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into(), registered: HashMap::new() }
    }

    pub fn register(&mut self, path: impl AsRef<Path>, ignore_outside_root: bool) {
        let (resolved, scope) = classify(&self.root, path.as_ref());
        if scope == Scope::OutsideRoot && !ignore_outside_root {
            warn!("{} outside {}", resolved.display(), self.root.display());
            return;
        }
        self.registered.insert(resolved, true);
    }

    pub fn unregister(&mut self, path: impl AsRef<Path>) {
        let (resolved, _) = classify(&self.root, path.as_ref());
        self.registered.insert(resolved, false);
    }

    /// `spec.md` §4.7: calling `clean()` on a deferred cleaner is a no-op
    /// that logs `"Deferred cleaner does not support cleaning"`.
    pub fn clean(&self) {
        warn!("Deferred cleaner does not support cleaning");
    }

    /// Removes everything still registered `true`, called at worker scope
    /// exit in place of `clean()`.
    pub fn flush(&mut self) {
        let paths: Vec<PathBuf> = self.registered.drain().filter(|(_, keep)| *keep).map(|(p, _)| p).collect();
        for path in paths {
            info!("Removing {}", path.display());
            let result = if path.is_dir() { std::fs::remove_dir_all(&path) } else { std::fs::remove_file(&path) };
            if let Err(e) = result {
                if !matches!(e.kind(), std::io::ErrorKind::NotFound) {
                    warn!("{}: {e}", path.display());
                }
            }
        }
    }
}

impl Drop for DeferredCleaner {
    fn drop(&mut self) {
        self.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn register_then_unregister_leaves_set_unchanged() {
        let root = tempdir().unwrap();
        let mut cleaner = DeferredCleaner::new(root.path());
        cleaner.register("a.txt", false);
        cleaner.unregister("a.txt");
        assert!(cleaner.registered.values().all(|keep| !keep));
    }

    #[test]
    fn outside_root_rejected_without_flag() {
        let root = tempdir().unwrap();
        let mut cleaner = DeferredCleaner::new(root.path());
        cleaner.register("/tmp/NON_ROOT_CELLOPHANE_TEST", false);
        assert!(cleaner.registered.is_empty());
    }

    #[test]
    fn eager_cleaner_removes_registered_paths() {
        let root = tempdir().unwrap();
        let file = root.path().join("gone.txt");
        std::fs::write(&file, b"x").unwrap();
        let mut cleaner = EagerCleaner::new(root.path());
        cleaner.register(&file, false);
        cleaner.clean();
        assert!(!file.exists());
    }
}
