use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration loaded from warden.toml.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct WardenConfig {
    pub worker: WorkerConfig,
    pub storage: StorageConfig,
    pub timing: TimingConfig,
    pub monitor: MonitorConfig,
    pub schedule: ScheduleConfig,
    pub serve: ServeConfig,
    pub keep_alive: KeepAliveConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub command: String,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    pub manifest: PathBuf,
    pub install_command: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub data_dir: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    pub settle_secs: u64,
    pub grace_secs: u64,
    pub kill_wait_secs: u64,
    pub restart_pause_secs: u64,
    pub probe_interval_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub poll_interval_secs: u64,
    pub max_restarts: u32,
    pub restart_delay_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    pub interval_minutes: u32,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServeConfig {
    pub bind: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct KeepAliveConfig {
    pub url: String,
    pub interval_secs: u64,
    pub timeout_secs: u64,
    pub stats_every: u64,
}

// --- Default implementations ---

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            command: "./bot.py".to_string(),
            args: Vec::new(),
            working_dir: None,
            manifest: PathBuf::from("requirements.txt"),
            install_command: vec![
                "pip".to_string(),
                "install".to_string(),
                "-q".to_string(),
                "-r".to_string(),
                "{manifest}".to_string(),
            ],
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(".warden"),
        }
    }
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            settle_secs: 3,
            grace_secs: 5,
            kill_wait_secs: 2,
            restart_pause_secs: 2,
            probe_interval_ms: 100,
        }
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 30,
            max_restarts: 5,
            restart_delay_secs: 10,
        }
    }
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            interval_minutes: 5,
        }
    }
}

impl Default for ServeConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".to_string(),
            port: 8080,
        }
    }
}

impl Default for KeepAliveConfig {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:8080/health".to_string(),
            interval_secs: 300,
            timeout_secs: 10,
            stats_every: 10,
        }
    }
}

/// Fixed waits used by the process controller, resolved from `[timing]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timings {
    /// How long a fresh worker must stay alive before start succeeds.
    pub settle: Duration,
    /// How long to wait after SIGTERM before escalating to SIGKILL.
    pub grace: Duration,
    /// Upper bound on waiting for the kernel to reap a SIGKILLed worker.
    pub kill_wait: Duration,
    /// Pause between stop and start during a restart.
    pub restart_pause: Duration,
    /// Granularity of liveness probes inside the waits above.
    pub probe_interval: Duration,
}

impl From<&TimingConfig> for Timings {
    fn from(config: &TimingConfig) -> Self {
        Self {
            settle: Duration::from_secs(config.settle_secs),
            grace: Duration::from_secs(config.grace_secs),
            kill_wait: Duration::from_secs(config.kill_wait_secs),
            restart_pause: Duration::from_secs(config.restart_pause_secs),
            probe_interval: Duration::from_millis(config.probe_interval_ms.max(1)),
        }
    }
}

/// Errors from loading the config file.
#[derive(Debug)]
pub enum ConfigError {
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Read { path, source } => {
                write!(f, "failed to read config {}: {source}", path.display())
            }
            ConfigError::Parse { path, source } => {
                write!(f, "failed to parse config {}: {source}", path.display())
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Read { source, .. } => Some(source),
            ConfigError::Parse { source, .. } => Some(source),
        }
    }
}

impl WardenConfig {
    /// Make every relative path absolute against `root`.
    ///
    /// The worker runs in `root` unless `working_dir` says otherwise, and a
    /// relative worker path is taken from the working directory.
    pub fn anchor(&mut self, root: &Path) {
        if self.storage.data_dir.is_relative() {
            self.storage.data_dir = root.join(&self.storage.data_dir);
        }

        let working_dir = match self.worker.working_dir.take() {
            Some(dir) if dir.is_relative() => root.join(dir),
            Some(dir) => dir,
            None => root.to_path_buf(),
        };
        if self.worker.command.contains('/') && Path::new(&self.worker.command).is_relative() {
            self.worker.command = working_dir
                .join(&self.worker.command)
                .to_string_lossy()
                .into_owned();
        }
        if self.worker.manifest.is_relative() {
            self.worker.manifest = working_dir.join(&self.worker.manifest);
        }
        self.worker.working_dir = Some(working_dir);
    }
}

/// Directory that relative paths in the config file at `path` refer to.
///
/// That is the file's own directory, or the project directory above it when
/// the file sits inside a `.warden` data directory.
pub fn project_root(path: &Path) -> PathBuf {
    let path = std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf());
    let dir = path.parent().unwrap_or(Path::new("/"));
    match dir.file_name() {
        Some(name) if name == ".warden" => dir.parent().unwrap_or(dir).to_path_buf(),
        _ => dir.to_path_buf(),
    }
}

/// Load config from `path`, with relative paths anchored at its project root.
/// A missing file yields the defaults, anchored the same way.
///
/// Anchoring keeps a `warden monitor` started by cron (whose working
/// directory is `$HOME`) on the same marker and worker as one started by hand.
pub fn load_config(path: &Path) -> Result<WardenConfig, ConfigError> {
    let mut config: WardenConfig = match std::fs::read_to_string(path) {
        Ok(contents) => toml::from_str(&contents).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            source: e,
        })?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!(path = %path.display(), "config file not found, using defaults");
            WardenConfig::default()
        }
        Err(e) => {
            return Err(ConfigError::Read {
                path: path.to_path_buf(),
                source: e,
            })
        }
    };
    config.anchor(&project_root(path));
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = WardenConfig::default();
        assert_eq!(config.timing.settle_secs, 3);
        assert_eq!(config.timing.grace_secs, 5);
        assert_eq!(config.monitor.max_restarts, 5);
        assert_eq!(config.storage.data_dir, PathBuf::from(".warden"));
        assert_eq!(config.serve.port, 8080);
        assert_eq!(config.keep_alive.interval_secs, 300);
        assert_eq!(config.keep_alive.timeout_secs, 10);
    }

    #[test]
    fn test_partial_config_keeps_defaults() {
        let config: WardenConfig = toml::from_str(
            r#"
[worker]
command = "/usr/bin/python3"
args = ["bot.py"]

[monitor]
max_restarts = 3
"#,
        )
        .unwrap();
        assert_eq!(config.worker.command, "/usr/bin/python3");
        assert_eq!(config.worker.args, vec!["bot.py"]);
        assert_eq!(config.worker.manifest, PathBuf::from("requirements.txt"));
        assert_eq!(config.monitor.max_restarts, 3);
        assert_eq!(config.monitor.poll_interval_secs, 30);
        assert_eq!(config.timing.grace_secs, 5);
    }

    #[test]
    fn test_timings_from_config() {
        let timing = TimingConfig {
            settle_secs: 1,
            grace_secs: 4,
            kill_wait_secs: 2,
            restart_pause_secs: 0,
            probe_interval_ms: 0,
        };
        let t = Timings::from(&timing);
        assert_eq!(t.settle, Duration::from_secs(1));
        assert_eq!(t.grace, Duration::from_secs(4));
        assert_eq!(t.restart_pause, Duration::ZERO);
        // A zero probe interval would spin
        assert_eq!(t.probe_interval, Duration::from_millis(1));
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config(&dir.path().join("nope.toml")).unwrap();
        assert_eq!(config.monitor.max_restarts, 5);
        assert_eq!(config.storage.data_dir, dir.path().join(".warden"));
        assert_eq!(
            config.worker.command,
            dir.path().join("./bot.py").to_string_lossy()
        );
    }

    #[test]
    fn test_relative_paths_follow_config_file_not_cwd() {
        let project = tempfile::tempdir().unwrap();
        let path = project.path().join("warden.toml");
        std::fs::write(&path, "[worker]\ncommand = \"./bot.py\"\n").unwrap();

        // Same result whatever directory the caller runs from
        let config = load_config(&path).unwrap();
        assert_eq!(config.storage.data_dir, project.path().join(".warden"));
        assert_eq!(config.worker.working_dir.as_deref(), Some(project.path()));
        assert_eq!(
            PathBuf::from(&config.worker.command),
            project.path().join("./bot.py")
        );
        assert_eq!(
            config.worker.manifest,
            project.path().join("requirements.txt")
        );
    }

    #[test]
    fn test_config_inside_data_dir_anchors_at_project() {
        let project = tempfile::tempdir().unwrap();
        std::fs::create_dir(project.path().join(".warden")).unwrap();
        let path = project.path().join(".warden/config.toml");
        std::fs::write(&path, "").unwrap();

        assert_eq!(project_root(&path), project.path());
        let config = load_config(&path).unwrap();
        assert_eq!(config.storage.data_dir, project.path().join(".warden"));
    }

    #[test]
    fn test_anchor_keeps_absolute_and_bare_paths() {
        let mut config: WardenConfig = toml::from_str(
            r#"
[worker]
command = "python3"
working_dir = "bot"
manifest = "/etc/bot/requirements.txt"

[storage]
data_dir = "/var/lib/warden"
"#,
        )
        .unwrap();
        config.anchor(Path::new("/srv/project"));

        assert_eq!(config.worker.command, "python3");
        assert_eq!(
            config.worker.working_dir,
            Some(PathBuf::from("/srv/project/bot"))
        );
        assert_eq!(
            config.worker.manifest,
            PathBuf::from("/etc/bot/requirements.txt")
        );
        assert_eq!(config.storage.data_dir, PathBuf::from("/var/lib/warden"));
    }

    #[test]
    fn test_load_malformed_file_errors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("warden.toml");
        std::fs::write(&path, "[monitor\nmax_restarts = ").unwrap();
        let err = load_config(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
        assert!(err.to_string().contains("failed to parse config"));
    }
}
