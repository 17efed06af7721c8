/// Prerequisite check run before anything that launches the worker.
///
/// Verifies the worker executable exists when it is given as a path, then
/// installs the manifest's requirements with the configured install command.
use crate::config::WorkerConfig;
use crate::log_sink::LogSink;
use std::path::{Path, PathBuf};
use std::process::Command;

#[derive(Debug)]
pub enum DependencyError {
    /// The worker executable path does not exist.
    MissingWorker { path: PathBuf },
    /// The install command could not be launched.
    InstallSpawn {
        command: String,
        source: std::io::Error,
    },
    /// The install command ran and reported failure.
    InstallFailed { command: String, code: Option<i32> },
}

impl std::fmt::Display for DependencyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DependencyError::MissingWorker { path } => {
                write!(f, "dependency check failed: worker not found at {}", path.display())
            }
            DependencyError::InstallSpawn { command, source } => {
                write!(f, "dependency check failed: could not run `{command}`: {source}")
            }
            DependencyError::InstallFailed { command, code } => match code {
                Some(code) => write!(
                    f,
                    "dependency check failed: `{command}` exited with status {code}"
                ),
                None => write!(f, "dependency check failed: `{command}` was killed by a signal"),
            },
        }
    }
}

impl std::error::Error for DependencyError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            DependencyError::InstallSpawn { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// Resolve a config-relative path against the worker's working directory.
fn resolve(worker: &WorkerConfig, path: &Path) -> PathBuf {
    match &worker.working_dir {
        Some(dir) if path.is_relative() => dir.join(path),
        _ => path.to_path_buf(),
    }
}

/// Replace `{manifest}` placeholders in the install command.
fn build_install_args(worker: &WorkerConfig, manifest: &Path) -> Vec<String> {
    let manifest = manifest.to_string_lossy();
    worker
        .install_command
        .iter()
        .map(|arg| arg.replace("{manifest}", &manifest))
        .collect()
}

/// Make sure the worker can be launched.
///
/// A bare command name (no `/`) is left to `PATH` lookup at spawn time.
/// A missing manifest or an empty install command skips installation.
pub fn ensure_prerequisites(worker: &WorkerConfig, log: &LogSink) -> Result<(), DependencyError> {
    if worker.command.contains('/') {
        let exe = resolve(worker, Path::new(&worker.command));
        if !exe.exists() {
            log.record(&format!("ERROR: worker not found at {}", exe.display()));
            return Err(DependencyError::MissingWorker { path: exe });
        }
    }

    let manifest = resolve(worker, &worker.manifest);
    if worker.install_command.is_empty() {
        tracing::debug!("no install command configured, skipping dependency install");
        return Ok(());
    }
    if !manifest.exists() {
        tracing::info!(manifest = %manifest.display(), "manifest not found, skipping dependency install");
        return Ok(());
    }

    let args = build_install_args(worker, &manifest);
    let (program, rest) = match args.split_first() {
        Some(split) => split,
        None => return Ok(()),
    };
    let command_text = args.join(" ");
    tracing::info!(command = %command_text, "installing worker dependencies");
    log.record(&format!("Checking dependencies: {command_text}"));

    let mut command = Command::new(program);
    command.args(rest);
    if let Some(dir) = &worker.working_dir {
        command.current_dir(dir);
    }
    let output = command.output().map_err(|e| {
        log.record(&format!("ERROR: could not run `{command_text}`: {e}"));
        DependencyError::InstallSpawn {
            command: command_text.clone(),
            source: e,
        }
    })?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        tracing::error!(
            code = ?output.status.code(),
            stderr = %stderr.trim(),
            "dependency install failed"
        );
        log.record(&format!(
            "ERROR: dependency install failed: {}",
            stderr.trim()
        ));
        return Err(DependencyError::InstallFailed {
            command: command_text,
            code: output.status.code(),
        });
    }

    log.record("Dependencies are up to date");
    Ok(())
}
