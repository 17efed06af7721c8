use std::path::{Path, PathBuf};

/// Manages the `.warden/` directory layout.
///
/// The pid marker, the audit log, and the optional config file all live
/// under a single data directory (default `.warden/`).
#[derive(Debug, Clone)]
pub struct DataDir {
    root: PathBuf,
}

impl DataDir {
    /// Create a new DataDir referencing the given root path.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The root directory (e.g. `.warden/`).
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path to the liveness marker holding the worker pid.
    pub fn pid_file(&self) -> PathBuf {
        self.root.join("worker.pid")
    }

    /// Path to the append-only log shared by warden and the worker.
    pub fn log_file(&self) -> PathBuf {
        self.root.join("warden.log")
    }

    /// Path that scheduled monitor runs send their stderr to.
    pub fn monitor_output(&self) -> PathBuf {
        self.root.join("monitor.out")
    }

    /// Path to the config file (e.g. `.warden/config.toml`).
    pub fn config(&self) -> PathBuf {
        self.root.join("config.toml")
    }

    /// Default content written to `config.toml` when initializing a new data directory.
    const DEFAULT_CONFIG: &str = "\
# Warden configuration

[worker]
command = \"./bot.py\"
args = []
manifest = \"requirements.txt\"

[monitor]
poll_interval_secs = 30
max_restarts = 5
restart_delay_secs = 10
";

    /// Create the root directory and write a default config.toml if missing.
    /// Returns Ok(true) if the directory was created, Ok(false) if it already existed.
    pub fn init(&self) -> std::io::Result<bool> {
        let created = !self.root.exists();
        std::fs::create_dir_all(&self.root)?;

        let config_path = self.config();
        if !config_path.exists() {
            std::fs::write(&config_path, Self::DEFAULT_CONFIG)?;
        }

        Ok(created)
    }

    /// Create the root directory only. Used before every command that writes
    /// the marker or the log.
    pub fn ensure_exists(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.root)
    }
}
