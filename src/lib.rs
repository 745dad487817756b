#[macro_use]
extern crate log;

mod checkpoint;
mod cleaner;
mod config;
mod dispatcher;
mod driver;
mod env;
mod error;
mod executor;
mod hook;
mod manifest;
mod merge;
mod multi_progress_report;
mod output;
mod plan;
mod progress_bar;
mod progress_report;
mod registry;
mod sample;
mod timings;
mod trace;
mod worker;

pub use checkpoint::{Checkpoint, CheckpointStore};
pub use cleaner::{DeferredCleaner, EagerCleaner};
pub use config::Config;
pub use dispatcher::{dispatch, DispatchOptions};
pub use driver::{run, RunOptions, RunSummary};
pub use error::{Error, Result};
pub use executor::{CmdResult, Executor, JobHandle, JobId, JobStatus, SubprocessExecutor};
pub use hook::{Condition, Hook, HookKind, HookMeta};
pub use merge::{MergeRegistry, TargetKind};
pub use multi_progress_report::{MultiProgressReport, OutputType};
pub use output::{Output, OutputSet};
pub use plan::Plan;
pub use progress_report::{QuietReport, SingleReport, VerboseReport};
pub use registry::{load_dir, LoadedRegistry, Registry, RunnerContext, RunnerMeta};
pub use sample::{Sample, SampleCollection, SampleState};
pub use timings::{TimingGuard, TimingRecorder};
pub use trace::init_tracing;
pub use worker::run_worker;
