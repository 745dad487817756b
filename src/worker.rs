//! Worker-process entry point, per Open Question decision #4 in
//! `DESIGN.md`: the dispatcher re-execs the current binary with a hidden
//! `--cellophane-worker` subcommand to give each runner invocation a real
//! OS-process boundary (`spec.md` §4.3 isolation requirement). This
//! module is what runs on the worker side of that boundary.

use std::panic::AssertUnwindSafe;
use std::path::Path;

use crate::cleaner::DeferredCleaner;
use crate::checkpoint::CheckpointStore;
use crate::registry::{self, RunnerContext};
use crate::sample::SampleCollection;
use crate::{Error, Result};

/// Loads the plugin registry fresh (closures can't cross a process
/// boundary), looks up `runner_label`, runs it on the shard read from
/// `shard_path`, and writes the resulting shard to `result_path`.
pub fn run_worker(runner_label: &str, shard_path: &Path, result_path: &Path, workdir: &Path, module_dir: &Path, executor_name: &str) -> Result<()> {
    std::fs::create_dir_all(workdir)?;
    let loaded = registry::load_dir(module_dir)?;
    let runner = loaded
        .runner(runner_label)
        .ok_or_else(|| Error::ModuleImport { module: runner_label.to_string(), cause: "runner not registered".to_string() })?;

    let shard: SampleCollection = serde_json::from_str(&std::fs::read_to_string(shard_path)?)?;

    let executor_factory = loaded.executor_factory(executor_name)?;
    let mut ctx = RunnerContext {
        workdir: workdir.to_path_buf(),
        checkpoints: CheckpointStore::new(workdir),
        executor: executor_factory(workdir),
        cleaner: DeferredCleaner::new(workdir),
    };

    let call = runner.call.clone();
    let shard_for_call = shard.clone();
    let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| call(&mut ctx, shard_for_call)));

    let result_collection = match outcome {
        Ok(Ok(updated)) => updated,
        Ok(Err(e)) => fail_all(shard, &e.to_string()),
        Err(_) => fail_all(shard, "runner panicked"),
    };

    ctx.cleaner.flush();
    std::fs::write(result_path, serde_json::to_string(&result_collection)?)?;
    Ok(())
}

fn fail_all(mut shard: SampleCollection, reason: &str) -> SampleCollection {
    for sample in &mut shard.samples {
        sample.fail(reason.to_string());
    }
    shard
}
