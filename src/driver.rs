//! Composes the whole run, per `spec.md` §2 item 10: load modules,
//! validate config, run pre-hooks, dispatch runners in declared order,
//! run post-hooks, and copy outputs.

use std::path::PathBuf;
use std::sync::Arc;

use crate::config::Config;
use crate::dispatcher::{self, DispatchOptions};
use crate::hook::{self, HookKind};
use crate::output;
use crate::registry::{self, LoadedRegistry};
use crate::sample::SampleCollection;
use crate::timings::TimingRecorder;
use crate::Result;

pub struct RunOptions {
    pub module_dir: PathBuf,
    pub dry_run: bool,
    pub timing_report: Option<PathBuf>,
}

pub struct RunSummary {
    pub collection: SampleCollection,
    pub outputs_copied: usize,
}

pub async fn run(config: Config, runners: &[String], opts: RunOptions) -> Result<RunSummary> {
    let workdir = config.workdir()?;
    let resultdir = config.resultdir()?;
    let tag = config.tag()?;
    let samples_file = config.samples_file()?;

    let registry = registry::load_dir(&opts.module_dir)?;
    let collection = crate::manifest::read(&samples_file)?;
    let timings = Arc::new(TimingRecorder::new(opts.timing_report.clone()));

    if opts.dry_run {
        render_dry_run_plan(&registry, runners, &tag)?;
        return Ok(RunSummary { collection, outputs_copied: 0 });
    }

    let pre_ordering = ordering_for(&registry, HookKind::Pre)?;
    let pre_hooks: Vec<_> = registry.hooks.iter().filter(|h| h.meta.kind == Some(HookKind::Pre)).cloned().collect();
    let guard = crate::timings::TimingGuard::new(timings.clone(), "pre_hooks");
    let collection = hook::run_pre_hooks(&pre_hooks, &pre_ordering, collection);
    guard.finish();

    let parallelism = config.executor_cpus()?.unwrap_or_else(num_cpus);
    let executor_name = config.executor_name()?;
    let dispatch_opts = DispatchOptions { root_workdir: workdir.clone(), tag: tag.clone(), module_dir: opts.module_dir.clone(), parallelism, executor_name };

    let mut collection = collection;
    for runner_label in runners {
        let guard = crate::timings::TimingGuard::new(timings.clone(), runner_label.clone());
        collection = dispatcher::dispatch(&registry, runner_label, collection, &dispatch_opts).await?;
        guard.finish();
    }

    for sample in &collection.samples {
        match sample.state() {
            crate::sample::SampleState::Failed(reason) => warn!("Sample {} failed - {reason}", sample.id),
            crate::sample::SampleState::Complete => info!("Sample {} processed successfully", sample.id),
            crate::sample::SampleState::Pending => {}
        }
    }

    let post_ordering = ordering_for(&registry, HookKind::Post)?;
    let post_hooks: Vec<_> = registry.hooks.iter().filter(|h| h.meta.kind == Some(HookKind::Post)).cloned().collect();
    let guard = crate::timings::TimingGuard::new(timings.clone(), "post_hooks");
    let collection = hook::run_post_hooks(&post_hooks, &post_ordering, collection);
    guard.finish();

    let outputs_copied = output::resolve_and_copy(&collection.outputs.outputs, &workdir, &resultdir, &collection.samples)?;

    // The root workdir is left in place: `.checkpoints/<label>` files under
    // it must persist across invocations for a later `check()` to see them
    // (spec.md §4.4). The eager cleaner only ever removes scratch paths a
    // runner or hook explicitly registers during the run, never the root.
    timings.write_json()?;

    Ok(RunSummary { collection, outputs_copied })
}

fn ordering_for(registry: &LoadedRegistry, kind: HookKind) -> Result<Vec<usize>> {
    let hooks: Vec<_> = registry.hooks.iter().filter(|h| h.meta.kind == Some(kind)).cloned().collect();
    hook::order(&hooks)
}

fn render_dry_run_plan(registry: &LoadedRegistry, runners: &[String], tag: &str) -> Result<()> {
    use crate::plan::{Plan, PlannedStep, Reason, ReasonKind, StepStatus};

    let mut plan = Plan::new(tag.to_string());
    let mut order_index = 0;

    for kind in [HookKind::Pre, HookKind::Post] {
        let hooks: Vec<_> = registry.hooks.iter().filter(|h| h.meta.kind == Some(kind)).cloned().collect();
        let ordering = hook::order(&hooks)?;
        for &i in &ordering {
            let hook = &hooks[i];
            let reason_kind = if hook.meta.before.is_empty() && hook.meta.after.is_empty() {
                ReasonKind::Always
            } else {
                ReasonKind::HookOrderingConstraint
            };
            plan.add_step(PlannedStep {
                name: hook.meta.label.clone(),
                status: StepStatus::Included,
                order_index,
                parallel_group_id: None,
                reasons: vec![Reason { kind: reason_kind, detail: None }],
                metadata: Default::default(),
            });
            order_index += 1;
        }
    }

    for runner_label in runners {
        let reason_kind = registry.runner(runner_label).and_then(|r| r.meta.split_by.clone()).map(|_| ReasonKind::SplitByShard).unwrap_or(ReasonKind::Always);
        plan.add_step(PlannedStep {
            name: runner_label.clone(),
            status: StepStatus::Included,
            order_index,
            parallel_group_id: None,
            reasons: vec![Reason { kind: reason_kind, detail: None }],
            metadata: Default::default(),
        });
        order_index += 1;
    }

    println!("{}", serde_json::to_string_pretty(&plan)?);
    Ok(())
}

fn num_cpus() -> usize {
    std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
}
