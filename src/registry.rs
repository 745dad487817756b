//! Module loader & plugin registry, per `spec.md` §4.1. Scans a directory
//! tree for compiled plugin modules, loads each one, and lets it register
//! hooks, runners, mixins, merge functions, and executor backends into a
//! [`Registry`] that is frozen once scanning completes.
//!
//! Plugin ABI (Open Question decision #3 in `DESIGN.md`): a user module is
//! a `cdylib` exposing `extern "C" fn cellophane_register(&mut Registry)`.
//! This is the closest safe-as-possible Rust rendition of "import every
//! source file found" in a dynamic language.

use std::collections::HashMap;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use libloading::{Library, Symbol};

use crate::executor::Executor;
use crate::hook::{Hook, HookMeta};
use crate::merge::MergeRegistry;
use crate::output::Output;
use crate::sample::SampleCollection;
use crate::{Error, Result};

/// Context a runner callable receives, per `spec.md` §4.3: a scoped
/// workdir, a checkpoint store rooted there, an executor instance, and a
/// deferred cleaner.
pub struct RunnerContext {
    pub workdir: PathBuf,
    pub checkpoints: crate::checkpoint::CheckpointStore,
    pub executor: Arc<dyn Executor>,
    pub cleaner: crate::cleaner::DeferredCleaner,
}

pub type RunnerFn = dyn Fn(&mut RunnerContext, SampleCollection) -> Result<SampleCollection> + Send + Sync;

#[derive(Debug, Clone, Default)]
pub struct RunnerMeta {
    pub label: String,
    pub split_by: Option<String>,
    pub outputs: Vec<Output>,
    pub checkpoints: Vec<String>,
}

#[derive(Clone)]
pub struct Runner {
    pub meta: RunnerMeta,
    pub call: Arc<RunnerFn>,
}

pub type ExecutorFactory = Arc<dyn Fn(&Path) -> Arc<dyn Executor> + Send + Sync>;

/// Receives registrations from each loaded plugin module. Mutable while
/// loading; [`Registry::freeze`] turns it into the immutable
/// [`LoadedRegistry`] the hook scheduler and dispatcher read from.
#[derive(Default)]
pub struct Registry {
    hooks: Vec<Hook>,
    runners: HashMap<String, Runner>,
    merge: MergeRegistry,
    executors: HashMap<String, ExecutorFactory>,
    mixins: HashMap<String, (String, serde_json::Value)>,
    mixin_conflict: Option<(String, String, String)>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_hook<F>(&mut self, meta: HookMeta, call: F)
    where
        F: Fn(SampleCollection) -> Result<SampleCollection> + Send + Sync + 'static,
    {
        self.hooks.push(Hook { meta, call: Arc::new(call) });
    }

    /// Registers a sample/collection attribute mixin's default, per
    /// `SPEC_FULL.md` §2. Two mixins declaring the same attribute name
    /// with different defaults is recorded as a conflict and fails the
    /// run once `load_dir` finishes scanning.
    pub fn register_mixin(&mut self, owner: impl Into<String>, attr: impl Into<String>, default: serde_json::Value) {
        let owner = owner.into();
        let attr = attr.into();
        if let Some((first_owner, first_default)) = self.mixins.get(&attr) {
            if *first_default != default && self.mixin_conflict.is_none() {
                self.mixin_conflict = Some((attr.clone(), first_owner.clone(), owner.clone()));
            }
            return;
        }
        self.mixins.insert(attr, (owner, default));
    }

    fn take_mixin_conflict(&mut self) -> Option<(String, String, String)> {
        self.mixin_conflict.take()
    }

    pub fn register_runner<F>(&mut self, meta: RunnerMeta, call: F)
    where
        F: Fn(&mut RunnerContext, SampleCollection) -> Result<SampleCollection> + Send + Sync + 'static,
    {
        self.runners.insert(meta.label.clone(), Runner { meta, call: Arc::new(call) });
    }

    pub fn register_executor<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn(&Path) -> Arc<dyn Executor> + Send + Sync + 'static,
    {
        self.executors.insert(name.into(), Arc::new(factory));
    }

    pub fn merge_mut(&mut self) -> &mut MergeRegistry {
        &mut self.merge
    }

    fn freeze(self) -> LoadedRegistry {
        LoadedRegistry {
            hooks: Arc::new(self.hooks),
            runners: Arc::new(self.runners),
            merge: Arc::new(self.merge),
            executors: Arc::new(self.executors),
            _libraries: Arc::new(Vec::new()),
        }
    }
}

/// The symbol every plugin `cdylib` exports.
///
/// # Safety
/// The loader trusts that the named symbol has exactly this signature.
/// A plugin module built against a mismatched `cellophane` version is
/// undefined behavior to load; there is no ABI version check beyond the
/// symbol name itself.
pub type RegisterFn = unsafe extern "C" fn(&mut Registry);

const REGISTER_SYMBOL: &[u8] = b"cellophane_register";

/// Frozen, process-wide registry of everything the loaded plugins
/// declared. Built once by [`load_dir`] and shared (read-only) by the
/// hook scheduler, the dispatcher, and the output/checkpoint machinery.
#[derive(Clone)]
pub struct LoadedRegistry {
    pub hooks: Arc<Vec<Hook>>,
    pub runners: Arc<HashMap<String, Runner>>,
    pub merge: Arc<MergeRegistry>,
    pub executors: Arc<HashMap<String, ExecutorFactory>>,
    /// Keeps the loaded dynamic libraries alive for the registry's
    /// lifetime; registered closures may call back into plugin code.
    _libraries: Arc<Vec<Library>>,
}

impl LoadedRegistry {
    pub fn runner(&self, label: &str) -> Option<&Runner> {
        self.runners.get(label)
    }

    pub fn executor_factory(&self, name: &str) -> Result<ExecutorFactory> {
        self.executors.get(name).cloned().ok_or_else(|| Error::UnknownExecutor(name.to_string()))
    }

    /// An empty, library-free registry for other modules' unit tests.
    #[cfg(test)]
    pub(crate) fn for_test() -> Self {
        Registry::default().freeze()
    }
}

fn is_plugin_file(path: &Path) -> bool {
    matches!(path.extension().and_then(OsStr::to_str), Some("so" | "dylib" | "dll"))
}

/// Walks `dir`, loads every plugin module found, and calls its
/// `cellophane_register` entry point. Returns a frozen [`LoadedRegistry`]
/// with a default `"subprocess"` executor backend always present.
///
/// Per `spec.md` §4.1: a module that fails to import fails the whole run
/// with `Error::ModuleImport` naming the offending module.
pub fn load_dir(dir: &Path) -> Result<LoadedRegistry> {
    let mut registry = Registry::new();
    registry.register_executor("subprocess", |root| {
        Arc::new(crate::executor::SubprocessExecutor::new(root.to_path_buf())) as Arc<dyn Executor>
    });

    let mut libraries = Vec::new();
    let mut entries: Vec<PathBuf> = walkdir::WalkDir::new(dir)
        .into_iter()
        .filter_map(|e| e.ok())
        .map(|e| e.into_path())
        .filter(|p| is_plugin_file(p))
        .collect();
    entries.sort();

    for path in entries {
        let name = path.display().to_string();
        debug!("Importing module {name}");
        let library = unsafe { Library::new(&path) }
            .map_err(|e| Error::ModuleImport { module: name.clone(), cause: e.to_string() })?;
        unsafe {
            let register: Symbol<RegisterFn> = library
                .get(REGISTER_SYMBOL)
                .map_err(|e| Error::ModuleImport { module: name.clone(), cause: e.to_string() })?;
            register(&mut registry);
        }
        libraries.push(library);
    }

    if let Some((attr, first, second)) = registry.take_mixin_conflict() {
        return Err(Error::MixinConflict { attr, first, second });
    }

    let mut loaded = registry.freeze();
    loaded._libraries = Arc::new(libraries);
    info!("Found {} hooks", loaded.hooks.len());
    info!("Found {} runners", loaded.runners.len());
    Ok(loaded)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_registry_has_subprocess_executor() {
        let dir = tempfile::tempdir().unwrap();
        let registry = load_dir(dir.path()).unwrap();
        assert!(registry.executor_factory("subprocess").is_ok());
        assert!(registry.executor_factory("nonexistent").is_err());
    }

    #[test]
    fn mixin_conflict_is_recorded_once() {
        let mut registry = Registry::new();
        registry.register_mixin("plugin_a", "depth", serde_json::json!(30));
        assert!(registry.mixin_conflict.is_none());
        registry.register_mixin("plugin_b", "depth", serde_json::json!(50));
        assert_eq!(registry.mixin_conflict, Some(("depth".to_string(), "plugin_a".to_string(), "plugin_b".to_string())));

        // A third, still-conflicting registration does not overwrite the first-recorded conflict.
        registry.register_mixin("plugin_c", "depth", serde_json::json!(99));
        assert_eq!(registry.mixin_conflict, Some(("depth".to_string(), "plugin_a".to_string(), "plugin_b".to_string())));
    }

    #[test]
    fn matching_mixin_defaults_do_not_conflict() {
        let mut registry = Registry::new();
        registry.register_mixin("plugin_a", "depth", serde_json::json!(30));
        registry.register_mixin("plugin_b", "depth", serde_json::json!(30));
        assert!(registry.mixin_conflict.is_none());
    }
}
