use thiserror::Error;

use crate::executor::CmdResult;

/// Framework-structural errors. Per `spec.md` §7: these are always fatal to
/// the run. User-code errors (hook/runner/merge/cleanup exceptions) are
/// never represented here — they are contained at their call site and
/// turned into a domain effect (a failed sample, a skipped hook, a log
/// line) instead of propagating up as an `Error`.
#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    JoinPaths(#[from] std::env::JoinPathsError),
    #[cfg(unix)]
    #[error(transparent)]
    Nix(#[from] nix::errno::Errno),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),
    #[error(transparent)]
    Toml(#[from] toml::de::Error),
    #[error(transparent)]
    Glob(#[from] globset::Error),
    #[error(transparent)]
    Loading(#[from] libloading::Error),

    #[error("{} exited with non-zero status: {}\n{}", .0, render_exit_status(.2), .1)]
    ScriptFailed(String, String, CmdResult),

    #[error("failed to import module '{module}': {cause}")]
    ModuleImport { module: String, cause: String },

    #[error("attribute '{attr}' is declared by mixins '{first}' and '{second}' with incompatible defaults")]
    MixinConflict { attr: String, first: String, second: String },

    #[error("Unable to resolve hook dependencies")]
    UnresolvedHookDependencies,

    #[error("no config value at path '{0}'")]
    ConfigPath(String),

    #[error("config path '{path}' could not be read as the requested type: {cause}")]
    ConfigType { path: String, cause: String },

    #[error("destination already exists")]
    DestinationExists,

    #[error("unknown executor backend '{0}'")]
    UnknownExecutor(String),

    #[error("runner '{0}' panicked: {1}")]
    RunnerPanicked(String, String),

    #[error("interrupted")]
    Interrupted,
}

pub type Result<T> = std::result::Result<T, Error>;

fn render_exit_status(result: &CmdResult) -> String {
    match result.code {
        Some(exit_status) => format!("exit code {exit_status}"),
        None => "no exit status".into(),
    }
}
