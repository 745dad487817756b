#[macro_use]
extern crate log;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use color_eyre::eyre::{Context, Result};

/// Runs a bioinformatics pipeline wrapper assembled from modules under
/// `--modules`, per `spec.md` §1.5.
#[derive(Debug, Parser)]
#[command(name = "cellophane", version, about)]
struct Cli {
    /// Directory of compiled plugin modules to load.
    #[arg(long, value_name = "DIR")]
    modules: PathBuf,

    /// Config file (TOML, YAML, or JSON).
    #[arg(long, value_name = "FILE")]
    config: PathBuf,

    /// Samples manifest (JSON or YAML), overrides the config's `samples_file`.
    #[arg(long, value_name = "FILE")]
    samples: Option<PathBuf>,

    /// Working directory, overrides the config's `workdir`.
    #[arg(long, value_name = "DIR")]
    workdir: Option<PathBuf>,

    /// Result directory, overrides the config's `resultdir`.
    #[arg(long, value_name = "DIR")]
    resultdir: Option<PathBuf>,

    /// Log directory; when set and `--timing-report` isn't given explicitly,
    /// the wall-clock timing report is written to `<logdir>/timing.json`.
    #[arg(long, value_name = "DIR")]
    logdir: Option<PathBuf>,

    /// Run tag, overrides the config's `tag`.
    #[arg(long)]
    tag: Option<String>,

    /// Executor backend name, overrides the config's `executor.name`.
    #[arg(long)]
    executor: Option<String>,

    /// Number of shards to run concurrently.
    #[arg(long, short = 'j')]
    jobs: Option<usize>,

    /// Runner labels to dispatch, in invocation order.
    #[arg(required = true)]
    runners: Vec<String>,

    /// Print the hook/runner plan without running anything.
    #[arg(long)]
    dry_run: bool,

    /// Write a wall-clock timing report (JSON) to this path.
    #[arg(long, value_name = "FILE")]
    timing_report: Option<PathBuf>,

    #[arg(long, value_enum, default_value = "pretty")]
    log_format: LogFormat,

    #[arg(long, default_value = "info")]
    log_level: String,
}

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
enum LogFormat {
    Pretty,
    Json,
}

/// The dispatcher re-execs the current binary as `cellophane
/// --cellophane-worker <label> <shard> <result> <workdir> <module_dir>
/// <executor>` to give each runner invocation a real OS-process boundary
/// (`spec.md` §4.3). This is intercepted ahead of normal flag parsing since
/// it doesn't share the user-facing CLI's shape.
const WORKER_FLAG: &str = "--cellophane-worker";

fn main() -> ExitCode {
    color_eyre::install().ok();

    let raw: Vec<String> = std::env::args().collect();
    if raw.get(1).map(String::as_str) == Some(WORKER_FLAG) {
        return run_worker(&raw[2..]);
    }

    let cli = Cli::parse();
    cellophane::init_tracing(matches!(cli.log_format, LogFormat::Json)).ok();
    unsafe {
        std::env::set_var("RUST_LOG", &cli.log_level);
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("failed to start async runtime: {e}");
            return ExitCode::from(1);
        }
    };

    match runtime.block_on(run(cli)) {
        Ok(()) => ExitCode::from(0),
        Err(e) if matches!(e.downcast_ref::<cellophane::Error>(), Some(cellophane::Error::Interrupted)) => {
            eprintln!("{e:#}");
            ExitCode::from(130)
        }
        Err(e) => {
            eprintln!("{e:#}");
            ExitCode::from(1)
        }
    }
}

fn run_worker(args: &[String]) -> ExitCode {
    let [label, shard, result, workdir, module_dir, executor_name] = args else {
        eprintln!("{WORKER_FLAG} expects 6 arguments: <label> <shard> <result> <workdir> <module_dir> <executor>");
        return ExitCode::from(2);
    };
    match cellophane::run_worker(label, shard.as_ref(), result.as_ref(), workdir.as_ref(), module_dir.as_ref(), executor_name) {
        Ok(()) => ExitCode::from(0),
        Err(e) => {
            eprintln!("worker failed: {e}");
            ExitCode::from(1)
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let mut config = cellophane::Config::read(&cli.config).context("reading config file")?;
    if let Some(workdir) = &cli.workdir {
        config = override_path(config, "workdir", workdir);
    }
    if let Some(resultdir) = &cli.resultdir {
        config = override_path(config, "resultdir", resultdir);
    }
    if let Some(samples) = &cli.samples {
        config = override_path(config, "samples_file", samples);
    }
    if let Some(tag) = &cli.tag {
        config = override_string(config, "tag", tag);
    }
    if let Some(executor) = &cli.executor {
        config = override_string(config, "executor.name", executor);
    }
    if let Some(jobs) = cli.jobs {
        config = override_value(config, "executor.cpus", serde_json::json!(jobs));
    }

    let timing_report = cli.timing_report.clone().or_else(|| cli.logdir.as_ref().map(|dir| dir.join("timing.json")));
    let opts = cellophane::RunOptions { module_dir: cli.modules.clone(), dry_run: cli.dry_run, timing_report };
    let summary = cellophane::run(config, &cli.runners, opts).await?;

    if !cli.dry_run {
        info!("Copied {} output(s)", summary.outputs_copied);
        if summary.collection.any_failed() {
            return Err(color_eyre::eyre::eyre!("one or more samples failed"));
        }
    }
    Ok(())
}

fn override_path(config: cellophane::Config, path: &str, value: &std::path::Path) -> cellophane::Config {
    override_string(config, path, &value.to_string_lossy())
}

fn override_string(config: cellophane::Config, path: &str, value: &str) -> cellophane::Config {
    override_value(config, path, serde_json::Value::String(value.to_string()))
}

fn override_value(config: cellophane::Config, path: &str, value: serde_json::Value) -> cellophane::Config {
    let mut root = config.into_value();
    set_dotted(&mut root, path, value);
    cellophane::Config::from_value(root)
}

fn set_dotted(root: &mut serde_json::Value, path: &str, value: serde_json::Value) {
    let segments: Vec<&str> = path.split('.').collect();
    let mut cur = root;
    for segment in &segments[..segments.len() - 1] {
        if !cur.is_object() {
            *cur = serde_json::Value::Object(Default::default());
        }
        cur = cur.as_object_mut().unwrap().entry(segment.to_string()).or_insert_with(|| serde_json::Value::Object(Default::default()));
    }
    if !cur.is_object() {
        *cur = serde_json::Value::Object(Default::default());
    }
    cur.as_object_mut().unwrap().insert(segments[segments.len() - 1].to_string(), value);
}
