//! Runner dispatcher, per `spec.md` §4.3: `split_by` fan-out, a pool of
//! worker processes, result merge-back, and SIGINT cancellation.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::process::Command;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::merge::TargetKind;
use crate::registry::{LoadedRegistry, RunnerMeta};
use crate::sample::{Sample, SampleCollection};
use crate::{Error, Result};

pub struct DispatchOptions {
    pub root_workdir: PathBuf,
    pub tag: String,
    pub module_dir: PathBuf,
    pub parallelism: usize,
    pub executor_name: String,
}

/// Dispatches one runner invocation across the current collection,
/// fanning out by `split_by` if the runner declares one, and merges the
/// returned shards back in dispatch order.
pub async fn dispatch(registry: &LoadedRegistry, runner_label: &str, collection: SampleCollection, opts: &DispatchOptions) -> Result<SampleCollection> {
    let runner = registry.runner(runner_label).ok_or_else(|| Error::ModuleImport {
        module: runner_label.to_string(),
        cause: "runner not registered".to_string(),
    })?;
    let meta = runner.meta.clone();

    let shards = shard_collection(&collection, &meta);
    if meta.split_by.is_some() {
        for (key, shard) in &shards {
            info!("{key}: {}", shard.samples.len());
        }
    }

    let cancel = CancellationToken::new();
    let semaphore = Arc::new(Semaphore::new(opts.parallelism.max(1)));
    let mut set = tokio::task::JoinSet::new();

    for (index, (key, shard)) in shards.into_iter().enumerate() {
        let semaphore = semaphore.clone();
        let cancel = cancel.clone();
        let runner_label = runner_label.to_string();
        let workdir = shard_workdir(&opts.root_workdir, &opts.tag, &meta.label, meta.split_by.is_some(), &key);
        let module_dir = opts.module_dir.clone();
        let executor_name = opts.executor_name.clone();

        set.spawn(async move {
            let _permit = semaphore.acquire_owned().await.expect("semaphore closed");
            if cancel.is_cancelled() {
                return (index, fail_all(shard, "cancelled before dispatch"));
            }
            match run_worker_process(&runner_label, &shard, &workdir, &module_dir, &executor_name, &cancel).await {
                Ok(result) => (index, result),
                Err(e) => (index, fail_all(shard, &e.to_string())),
            }
        });
    }

    let sigint = tokio::signal::ctrl_c();
    tokio::pin!(sigint);
    let mut results: Vec<(usize, SampleCollection)> = Vec::with_capacity(set.len());

    loop {
        if set.is_empty() {
            break;
        }
        tokio::select! {
            _ = &mut sigint, if !cancel.is_cancelled() => {
                warn!("Received SIGINT, telling runners to shut down...");
                cancel.cancel();
            }
            next = set.join_next() => {
                if let Some(finished) = next {
                    results.push(finished.map_err(|e| Error::RunnerPanicked(runner_label.to_string(), e.to_string()))?);
                }
            }
        }
    }

    if cancel.is_cancelled() {
        return Err(Error::Interrupted);
    }

    merge_results(registry, collection, results)
}

fn shard_collection(collection: &SampleCollection, meta: &RunnerMeta) -> Vec<(String, SampleCollection)> {
    match &meta.split_by {
        Some(attr) => collection.split_by(attr),
        None => vec![(String::new(), collection.clone())],
    }
}

fn shard_workdir(root: &Path, tag: &str, runner_label: &str, split: bool, key: &str) -> PathBuf {
    let base = root.join(tag).join(runner_label);
    if split { base.join(key) } else { base }
}

async fn run_worker_process(
    runner_label: &str,
    shard: &SampleCollection,
    workdir: &Path,
    module_dir: &Path,
    executor_name: &str,
    cancel: &CancellationToken,
) -> Result<SampleCollection> {
    std::fs::create_dir_all(workdir)?;
    let shard_file = tempfile::NamedTempFile::new()?;
    std::fs::write(shard_file.path(), serde_json::to_vec(shard)?)?;
    let result_file = tempfile::NamedTempFile::new()?;

    let exe = std::env::current_exe()?;
    let mut child = Command::new(exe)
        .arg("--cellophane-worker")
        .arg(runner_label)
        .arg(shard_file.path())
        .arg(result_file.path())
        .arg(workdir)
        .arg(module_dir)
        .arg(executor_name)
        .spawn()?;

    let status = tokio::select! {
        status = child.wait() => status?,
        _ = cancel.cancelled() => {
            let _ = child.kill().await;
            return Err(Error::Interrupted);
        }
    };

    if !status.success() {
        return Err(Error::RunnerPanicked(runner_label.to_string(), format!("worker exited with {status}")));
    }

    let raw = std::fs::read_to_string(result_file.path())?;
    Ok(serde_json::from_str(&raw)?)
}

fn fail_all(mut shard: SampleCollection, reason: &str) -> SampleCollection {
    for sample in &mut shard.samples {
        sample.fail(reason.to_string());
    }
    shard
}

/// Merges shard results back into the master collection in dispatch
/// order. Samples are matched by identity (`id` + index within the
/// original collection); collection-level attres are folded pairwise
/// through the merge registry.
fn merge_results(registry: &LoadedRegistry, original: SampleCollection, mut shards: Vec<(usize, SampleCollection)>) -> Result<SampleCollection> {
    shards.sort_by_key(|(index, _)| *index);

    let mut merged = original.clone();
    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        let mut merged_samples: Vec<Sample> = Vec::new();
        for (_, shard) in &shards {
            for sample in &shard.samples {
                merged_samples.push(sample.clone());
            }
        }
        merged.samples = merged_samples;

        for (_, shard) in &shards {
            for (attr, value) in &shard.attrs {
                let current = merged.attrs.get(attr).cloned().unwrap_or(serde_json::Value::Null);
                let next = registry.merge.merge(TargetKind::Collection, attr, &current, value);
                merged.attrs.insert(attr.clone(), next);
            }
        }
        merged
    }));

    match result {
        Ok(merged) => Ok(merged),
        Err(_) => {
            warn!("Unhandled exception when collecting results");
            Ok(original)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shard_workdir_appends_split_key_only_when_splitting() {
        let root = Path::new("/work");
        assert_eq!(shard_workdir(root, "t", "runner_a", false, ""), PathBuf::from("/work/t/runner_a"));
        assert_eq!(shard_workdir(root, "t", "runner_a", true, "x"), PathBuf::from("/work/t/runner_a/x"));
    }

    #[test]
    fn merge_results_follows_dispatch_order_not_key_order() {
        let registry = LoadedRegistry::for_test();
        let original = SampleCollection::new(vec![]);

        // "banana" dispatched first (index 0), "apple" second (index 1); a
        // key-alphabetical sort would wrongly put apple's sample first.
        let banana = SampleCollection::new(vec![Sample::new("banana_sample", vec![])]);
        let apple = SampleCollection::new(vec![Sample::new("apple_sample", vec![])]);
        let shards = vec![(0usize, banana), (1usize, apple)];

        let merged = merge_results(&registry, original, shards).unwrap();
        let ids: Vec<&str> = merged.samples.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["banana_sample", "apple_sample"]);
    }
}
