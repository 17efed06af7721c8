/// Liveness marker: the pid of the tracked worker, as plain text in one file.
///
/// The marker is only a claim. Callers must re-validate it against the
/// process table before trusting it (see `ProcessController::is_running`).
use std::io::Write;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Atomically replace the marker with `pid`.
    ///
    /// Writes to a temporary file in the same directory, then renames
    /// so readers never see a partial record.
    pub fn write(&self, pid: u32) -> Result<(), PidFileError> {
        let dir = self.path.parent().unwrap_or(Path::new("."));
        let dir = if dir.as_os_str().is_empty() {
            Path::new(".")
        } else {
            dir
        };

        let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(|e| PidFileError::Write {
            path: dir.to_path_buf(),
            source: e,
        })?;
        writeln!(tmp, "{pid}").map_err(|e| PidFileError::Write {
            path: tmp.path().to_path_buf(),
            source: e,
        })?;
        tmp.as_file().sync_all().map_err(|e| PidFileError::Write {
            path: tmp.path().to_path_buf(),
            source: e,
        })?;
        tmp.persist(&self.path).map_err(|e| PidFileError::Persist {
            path: self.path.clone(),
            source: e.error,
        })?;
        Ok(())
    }

    /// The recorded pid, or `None` if the marker is absent or unparseable.
    pub fn read(&self) -> Option<u32> {
        let contents = std::fs::read_to_string(&self.path).ok()?;
        match parse_pid(&contents) {
            Some(pid) => Some(pid),
            None => {
                tracing::debug!(path = %self.path.display(), "ignoring unparseable pid file");
                None
            }
        }
    }

    /// Remove the marker. Removing an absent marker is fine.
    pub fn clear(&self) {
        match std::fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                tracing::warn!(error = %e, path = %self.path.display(), "failed to remove pid file")
            }
        }
    }
}

fn parse_pid(contents: &str) -> Option<u32> {
    contents.trim().parse::<u32>().ok().filter(|pid| *pid > 0)
}

/// Errors from writing the marker. Reads never fail.
#[derive(Debug)]
pub enum PidFileError {
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    Persist {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl std::fmt::Display for PidFileError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PidFileError::Write { path, source } => {
                write!(f, "failed to write pid file in {}: {source}", path.display())
            }
            PidFileError::Persist { path, source } => {
                write!(f, "failed to persist pid file {}: {source}", path.display())
            }
        }
    }
}

impl std::error::Error for PidFileError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PidFileError::Write { source, .. } => Some(source),
            PidFileError::Persist { source, .. } => Some(source),
        }
    }
}
