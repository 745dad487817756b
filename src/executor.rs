//! Backend-agnostic contract for running external commands, per `spec.md`
//! §4.8. `Executor` is the trait user-registered backends implement;
//! [`SubprocessExecutor`] is the local backend always registered under the
//! name `"subprocess"`.

use std::collections::HashMap;
use std::ffi::OsStr;
use std::fmt::{Debug, Display, Formatter};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};
use std::sync::mpsc::channel;
use std::sync::{Arc, LazyLock as Lazy, Mutex};
use std::thread;

#[cfg(not(any(test, target_os = "windows")))]
use signal_hook::consts::{SIGHUP, SIGINT, SIGQUIT, SIGTERM, SIGUSR1, SIGUSR2};
#[cfg(not(any(test, target_os = "windows")))]
use signal_hook::iterator::Signals;

use crate::Error::ScriptFailed;
use crate::progress_report::SingleReport;
use crate::{Error, Result};

/// A fresh 128-bit identifier minted per `Executor::submit` call.
pub type JobId = uuid::Uuid;

/// Terminal status of an executor job, per `spec.md` Data Model / Executor job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobStatus {
    Succeeded,
    Failed(i32),
    Terminated,
}

impl JobStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, JobStatus::Succeeded)
    }
}

/// Declares an isolated dependency bootstrap (e.g. a conda/virtualenv spec)
/// that must be materialized before the command runs. The abstract backend
/// contract only needs to carry this through; resolving it is a backend
/// concern.
#[derive(Debug, Clone, Default)]
pub struct EnvSpec {
    pub name: String,
    pub requirements: Vec<String>,
}

/// One command submission.
#[derive(Debug, Clone)]
pub struct JobSpec {
    pub cmd: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    pub workdir: PathBuf,
    pub cpus: Option<u32>,
    pub memory_mb: Option<u64>,
    pub env_spec: Option<EnvSpec>,
}

impl JobSpec {
    pub fn new(cmd: impl Into<String>, workdir: impl Into<PathBuf>) -> Self {
        Self {
            cmd: cmd.into(),
            args: Vec::new(),
            env: HashMap::new(),
            workdir: workdir.into(),
            cpus: None,
            memory_mb: None,
            env_spec: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, val: impl Into<String>) -> Self {
        self.env.insert(key.into(), val.into());
        self
    }

    pub fn cpus(mut self, cpus: u32) -> Self {
        self.cpus = Some(cpus);
        self
    }

    pub fn memory_mb(mut self, mb: u64) -> Self {
        self.memory_mb = Some(mb);
        self
    }

    pub fn env_spec(mut self, spec: EnvSpec) -> Self {
        self.env_spec = Some(spec);
        self
    }
}

#[derive(Debug, Default, Clone)]
pub struct CmdResult {
    pub stdout: String,
    pub stderr: String,
    pub code: Option<i32>,
}

type JobOutcome = Result<(CmdResult, JobStatus)>;
type JobSlot = Arc<Mutex<Option<thread::JoinHandle<JobOutcome>>>>;

/// A submitted, possibly still-running job handle. Shares its join handle
/// with the owning executor's outstanding-job list: whichever side reaches
/// it first (`JobHandle::wait`, or the executor's own `Executor::wait`)
/// joins the thread; the other observes it already consumed and treats the
/// job as terminal with no further result to report.
pub struct JobHandle {
    pub id: JobId,
    pub workdir: PathBuf,
    slot: Option<JobSlot>,
}

impl JobHandle {
    pub fn wait(self) -> Result<Option<(CmdResult, JobStatus)>> {
        let Some(slot) = self.slot else { return Ok(None) };
        let handle = slot.lock().unwrap().take();
        match handle {
            Some(h) => h.join().unwrap().map(Some),
            None => Ok(None),
        }
    }
}

/// The abstract job-execution backend contract from `spec.md` §4.8.
pub trait Executor: Send + Sync {
    /// Submits a command. When `wait` is true this blocks until the job
    /// reaches a terminal state and returns its result inline; otherwise it
    /// returns immediately with a handle that can be waited on later.
    fn submit(&self, spec: JobSpec, wait: bool) -> Result<(Option<(CmdResult, JobStatus)>, JobHandle)>;

    /// Blocks until every outstanding job submitted by this executor
    /// reaches a terminal state.
    fn wait(&self) -> Result<()>;

    /// Requests termination of all outstanding jobs.
    fn terminate(&self) -> Result<()>;
}

/// The always-available local subprocess backend. Every job gets a fresh
/// 128-bit id and a per-job workdir `<executor-root>/<id-hex>`.
pub struct SubprocessExecutor {
    root: PathBuf,
    outstanding: Mutex<Vec<JobSlot>>,
    pids: Arc<Mutex<std::collections::HashSet<u32>>>,
}

impl SubprocessExecutor {
    pub fn new(root: PathBuf) -> Self {
        Self { root, outstanding: Mutex::new(Vec::new()), pids: Arc::new(Mutex::new(Default::default())) }
    }

    fn job_workdir(&self, id: JobId) -> PathBuf {
        self.root.join(id.simple().to_string())
    }
}

impl Executor for SubprocessExecutor {
    fn submit(&self, spec: JobSpec, wait: bool) -> Result<(Option<(CmdResult, JobStatus)>, JobHandle)> {
        let id = uuid::Uuid::new_v4();
        let workdir = self.job_workdir(id);
        std::fs::create_dir_all(&workdir)?;

        let runner = CmdLineRunner::new(&spec.cmd)
            .args(spec.args.clone())
            .current_dir(spec.workdir.clone())
            .envs(spec.env.clone())
            .pids(self.pids.clone());

        let handle = thread::spawn(move || -> JobOutcome {
            let result = runner.execute();
            match result {
                Ok(r) => {
                    let status = if r.code == Some(0) { JobStatus::Succeeded } else { JobStatus::Failed(r.code.unwrap_or(-1)) };
                    Ok((r, status))
                }
                Err(Error::ScriptFailed(_, _, r)) => {
                    let status = JobStatus::Failed(r.code.unwrap_or(-1));
                    Ok((r, status))
                }
                Err(e) => Err(e),
            }
        });

        if wait {
            let result = handle.join().unwrap()?;
            Ok((Some(result), JobHandle { id, workdir, slot: None }))
        } else {
            let slot: JobSlot = Arc::new(Mutex::new(Some(handle)));
            self.outstanding.lock().unwrap().push(slot.clone());
            Ok((None, JobHandle { id, workdir, slot: Some(slot) }))
        }
    }

    fn wait(&self) -> Result<()> {
        let mut outstanding = self.outstanding.lock().unwrap();
        for slot in outstanding.drain(..) {
            let handle = slot.lock().unwrap().take();
            if let Some(handle) = handle {
                handle.join().unwrap()?;
            }
        }
        Ok(())
    }

    fn terminate(&self) -> Result<()> {
        #[cfg(unix)]
        {
            let pids = self.pids.lock().unwrap();
            for pid in pids.iter() {
                let _ = nix::sys::signal::kill(nix::unistd::Pid::from_raw(*pid as i32), nix::sys::signal::Signal::SIGTERM);
            }
        }
        Ok(())
    }
}

/// Line-buffered external process runner. Adapted from the teacher's
/// `CmdLineRunner`: spawns, tees stdout/stderr through an optional
/// `SingleReport`, tracks live pids for `terminate`, and forwards signals
/// when `pass_signals` is set.
pub struct CmdLineRunner<'a> {
    cmd: Command,
    pr: Option<Arc<Box<dyn SingleReport>>>,
    stdin: Option<String>,
    pass_signals: bool,
    pids: Option<Arc<Mutex<std::collections::HashSet<u32>>>>,
    on_stdout: Option<Box<dyn Fn(String) + Send + 'a>>,
    on_stderr: Option<Box<dyn Fn(String) + Send + 'a>>,
}

static OUTPUT_LOCK: Mutex<()> = Mutex::new(());
static RUNNING_PIDS: Lazy<Mutex<std::collections::HashSet<u32>>> = Lazy::new(Default::default);

impl<'a> CmdLineRunner<'a> {
    pub fn new<P: AsRef<OsStr>>(program: P) -> Self {
        let mut cmd = if cfg!(windows) {
            let mut cmd = Command::new("cmd.exe");
            cmd.arg("/c").arg(program);
            cmd
        } else {
            Command::new(program)
        };
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        Self {
            cmd,
            pr: None,
            stdin: None,
            pass_signals: false,
            pids: None,
            on_stdout: None,
            on_stderr: None,
        }
    }

    #[cfg(unix)]
    pub fn kill_all(signal: nix::sys::signal::Signal) {
        let pids = RUNNING_PIDS.lock().unwrap();
        for pid in pids.iter() {
            let pid = *pid as i32;
            trace!("{signal}: {pid}");
            if let Err(e) = nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), signal) {
                debug!("Failed to kill cmd {pid}: {e}");
            }
        }
    }

    pub(crate) fn pids(mut self, pids: Arc<Mutex<std::collections::HashSet<u32>>>) -> Self {
        self.pids = Some(pids);
        self
    }

    pub fn with_pr(mut self, pr: Arc<Box<dyn SingleReport>>) -> Self {
        self.pr = Some(pr);
        self
    }

    pub fn current_dir<P: AsRef<Path>>(mut self, dir: P) -> Self {
        self.cmd.current_dir(dir);
        self
    }

    pub fn env<K, V>(mut self, key: K, val: V) -> Self
    where
        K: AsRef<OsStr>,
        V: AsRef<OsStr>,
    {
        self.cmd.env(key, val);
        self
    }

    pub fn envs<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<OsStr>,
        V: AsRef<OsStr>,
    {
        self.cmd.envs(vars);
        self
    }

    pub fn arg<S: AsRef<OsStr>>(mut self, arg: S) -> Self {
        self.cmd.arg(arg.as_ref());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.cmd.args(args);
        self
    }

    pub fn with_pass_signals(mut self) -> Self {
        self.pass_signals = true;
        self
    }

    pub fn stdin_string(mut self, input: impl Into<String>) -> Self {
        self.cmd.stdin(Stdio::piped());
        self.stdin = Some(input.into());
        self
    }

    pub fn execute(mut self) -> Result<CmdResult> {
        debug!("$ {self}");
        let mut cp = self.cmd.spawn()?;
        let id = cp.id();
        RUNNING_PIDS.lock().unwrap().insert(id);
        if let Some(pids) = &self.pids {
            pids.lock().unwrap().insert(id);
        }
        trace!("Started process: {id} for {}", self.get_program());

        let (tx, rx) = channel();
        if let Some(stdout) = cp.stdout.take() {
            let tx = tx.clone();
            thread::spawn(move || {
                for line in BufReader::new(stdout).lines().map_while(std::result::Result::ok) {
                    let _ = tx.send(ChildProcessOutput::Stdout(line));
                }
            });
        }
        if let Some(stderr) = cp.stderr.take() {
            let tx = tx.clone();
            thread::spawn(move || {
                for line in BufReader::new(stderr).lines().map_while(std::result::Result::ok) {
                    let _ = tx.send(ChildProcessOutput::Stderr(line));
                }
            });
        }
        if let Some(text) = self.stdin.take() {
            if let Some(mut stdin) = cp.stdin.take() {
                thread::spawn(move || {
                    let _ = stdin.write_all(text.as_bytes());
                });
            }
        }
        #[cfg(not(any(test, target_os = "windows")))]
        let mut sighandle = None;
        #[cfg(not(any(test, target_os = "windows")))]
        if self.pass_signals {
            if let Ok(mut signals) = Signals::new([SIGINT, SIGTERM, SIGHUP, SIGQUIT, SIGUSR1, SIGUSR2]) {
                sighandle = Some(signals.handle());
                let tx = tx.clone();
                thread::spawn(move || {
                    for sig in &mut signals {
                        let _ = tx.send(ChildProcessOutput::Signal(sig));
                    }
                });
            }
        }
        thread::spawn(move || {
            let status = cp.wait().unwrap_or_else(|_| ExitStatus::default_exit_status());
            #[cfg(not(any(test, target_os = "windows")))]
            if let Some(sighandle) = sighandle {
                sighandle.close();
            }
            let _ = tx.send(ChildProcessOutput::ExitStatus(status));
        });

        let mut result = CmdResult::default();
        let mut status: Option<ExitStatus> = None;
        let mut combined_output = Vec::new();
        for line in rx {
            match line {
                ChildProcessOutput::Stdout(line) => {
                    result.stdout += &line;
                    result.stdout += "\n";
                    self.on_stdout(line.clone());
                    combined_output.push(line);
                }
                ChildProcessOutput::Stderr(line) => {
                    result.stderr += &line;
                    result.stderr += "\n";
                    self.on_stderr(line.clone());
                    combined_output.push(line);
                }
                ChildProcessOutput::ExitStatus(s) => {
                    RUNNING_PIDS.lock().unwrap().remove(&id);
                    if let Some(pids) = &self.pids {
                        pids.lock().unwrap().remove(&id);
                    }
                    result.code = s.code();
                    status = Some(s);
                }
                #[cfg(not(any(test, target_os = "windows")))]
                ChildProcessOutput::Signal(sig) => {
                    if sig != SIGINT {
                        debug!("Received signal {sig}, forwarding to {id}");
                        if let Ok(sig) = nix::sys::signal::Signal::try_from(sig) {
                            let _ = nix::sys::signal::kill(nix::unistd::Pid::from_raw(id as i32), sig);
                        }
                    }
                }
            }
        }
        RUNNING_PIDS.lock().unwrap().remove(&id);
        let status = status.unwrap_or_else(ExitStatus::default_exit_status);

        if !status.success() {
            return Err(ScriptFailed(self.get_program(), combined_output.join("\n"), result));
        }
        Ok(result)
    }

    fn on_stdout(&self, line: String) {
        let _lock = OUTPUT_LOCK.lock().unwrap();
        if let Some(on_stdout) = &self.on_stdout {
            on_stdout(line);
            return;
        }
        if let Some(pr) = &self.pr {
            if !line.trim().is_empty() {
                pr.set_message(line)
            }
        } else {
            println!("{line}");
        }
    }

    fn on_stderr(&self, line: String) {
        let _lock = OUTPUT_LOCK.lock().unwrap();
        if let Some(on_stderr) = &self.on_stderr {
            on_stderr(line);
            return;
        }
        if let Some(pr) = &self.pr {
            if !line.trim().is_empty() {
                pr.println(line)
            }
        } else {
            eprintln!("{line}");
        }
    }

    fn get_program(&self) -> String {
        self.cmd.get_program().to_string_lossy().to_string()
    }

    fn get_args(&self) -> Vec<String> {
        self.cmd.get_args().map(|s| s.to_string_lossy().to_string()).collect()
    }
}

trait DefaultExitStatus {
    fn default_exit_status() -> ExitStatus;
}

impl DefaultExitStatus for ExitStatus {
    #[cfg(unix)]
    fn default_exit_status() -> ExitStatus {
        use std::os::unix::process::ExitStatusExt;
        ExitStatus::from_raw(-1)
    }

    #[cfg(not(unix))]
    fn default_exit_status() -> ExitStatus {
        use std::os::windows::process::ExitStatusExt;
        ExitStatus::from_raw(1)
    }
}

impl Display for CmdLineRunner<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.get_program(), self.get_args().join(" "))
    }
}

impl Debug for CmdLineRunner<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.get_program(), self.get_args().join(" "))
    }
}

enum ChildProcessOutput {
    Stdout(String),
    Stderr(String),
    ExitStatus(ExitStatus),
    #[cfg(not(any(test, target_os = "windows")))]
    Signal(i32),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subprocess_executor_runs_a_job() {
        let tmp = tempfile::tempdir().unwrap();
        let exec = SubprocessExecutor::new(tmp.path().to_path_buf());
        let spec = JobSpec::new("true", tmp.path());
        let (result, _handle) = exec.submit(spec, true).unwrap();
        let (_cmd_result, status) = result.unwrap();
        assert!(status.is_success());
    }

    #[test]
    fn subprocess_executor_reports_failure() {
        let tmp = tempfile::tempdir().unwrap();
        let exec = SubprocessExecutor::new(tmp.path().to_path_buf());
        let spec = JobSpec::new("false", tmp.path());
        let (result, _handle) = exec.submit(spec, true).unwrap();
        let (_cmd_result, status) = result.unwrap();
        assert!(!status.is_success());
    }
}
