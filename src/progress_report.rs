use std::fmt::Debug;
use std::sync::Mutex;

use console::style;
use indicatif::{ProgressBar, ProgressStyle};

/// A single line of progress feedback for one hook, runner shard, or
/// executor job. Implementations decide how `set_message`/`println` render
/// depending on the active `OutputType`.
pub trait SingleReport: Debug + Send + Sync {
    fn set_message(&self, message: String);
    fn println(&self, message: String);
    fn finish(&self) {}
}

#[derive(Debug)]
pub struct ProgressReport {
    pub pb: ProgressBar,
    prefix: String,
}

impl ProgressReport {
    pub fn new(prefix: String) -> Self {
        let pb = ProgressBar::new_spinner();
        pb.set_style(
            ProgressStyle::with_template("{spinner:.dim} {prefix} {wide_msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        pb.set_prefix(prefix.clone());
        pb.enable_steady_tick(std::time::Duration::from_millis(100));
        Self { pb, prefix }
    }
}

impl SingleReport for ProgressReport {
    fn set_message(&self, message: String) {
        self.pb.set_message(message);
    }

    fn println(&self, message: String) {
        self.pb.suspend(|| println!("{} {message}", style(&self.prefix).dim()));
    }

    fn finish(&self) {
        self.pb.finish_and_clear();
    }
}

#[derive(Debug, Default)]
pub struct QuietReport {}

impl QuietReport {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SingleReport for QuietReport {
    fn set_message(&self, _message: String) {}
    fn println(&self, _message: String) {}
}

#[derive(Debug)]
pub struct VerboseReport {
    prefix: String,
    last: Mutex<String>,
}

impl VerboseReport {
    pub fn new(prefix: String) -> Self {
        Self { prefix, last: Mutex::new(String::new()) }
    }
}

impl SingleReport for VerboseReport {
    fn set_message(&self, message: String) {
        let mut last = self.last.lock().unwrap();
        if *last != message {
            println!("{} {message}", style(&self.prefix).dim());
            *last = message;
        }
    }

    fn println(&self, message: String) {
        println!("{} {message}", style(&self.prefix).dim());
    }
}
