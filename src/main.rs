mod config;
mod data_dir;
mod deps;
mod keep_alive;
mod log_sink;
mod monitor;
mod pidfile;
mod process;
mod schedule;
mod serve;
mod status;

use clap::{Parser, Subcommand};
use config::{Timings, WardenConfig};
use data_dir::DataDir;
use log_sink::LogSink;
use monitor::{Monitor, MonitorSettings};
use pidfile::PidFile;
use process::{ProcessController, StopError, Termination};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

/// Keeps a single long-running worker process alive: start it, stop it,
/// restart it, and watch it with a bounded number of automatic restarts.
#[derive(Parser, Debug)]
#[command(name = "warden", version, about)]
pub struct Cli {
    /// Config file path (default: warden.toml, then .warden/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Extra logging (liveness probes, settle waits)
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Only warnings and errors on stderr
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the worker if it is not already running
    Start,
    /// Stop the worker (SIGTERM, then SIGKILL after the grace period)
    Stop,
    /// Stop the worker if running, then start it
    Restart,
    /// Show whether the worker is running, with pid, uptime and memory
    Status {
        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },
    /// Print the last lines of the log
    Logs {
        /// Number of lines
        #[arg(default_value_t = 50)]
        lines: usize,
    },
    /// Watch the worker and restart it until the restart budget runs out
    Monitor,
    /// Check and install the worker's prerequisites
    InstallDeps,
    /// Manage the periodic `monitor` job in crontab
    Schedule {
        #[command(subcommand)]
        action: ScheduleAction,
    },
    /// Serve /health, /status and /uptime over HTTP
    Serve,
    /// Ping a health URL on an interval so the service is never idled
    KeepAlive {
        /// URL to ping (default: [keep_alive] url)
        url: Option<String>,
        /// Seconds between pings (default: [keep_alive] interval_secs)
        interval: Option<u64>,
        /// Request timeout in seconds
        #[arg(long)]
        timeout: Option<u64>,
    },
    /// Create the data directory and a default config
    Init,
}

#[derive(Subcommand, Debug, Clone, Copy)]
enum ScheduleAction {
    Install,
    Remove,
    Show,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let default_level = if cli.verbose {
        "warden=debug"
    } else if cli.quiet {
        "warden=warn"
    } else {
        "warden=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_target(false)
        .with_thread_ids(false)
        .with_writer(std::io::stderr)
        .init();

    tracing::debug!(?cli, "parsed CLI arguments");

    let config_path = resolve_config_path(cli.config.as_deref());
    let config = match config::load_config(&config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {e}");
            return ExitCode::FAILURE;
        }
    };

    match run(cli.command, &config, &config_path).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn resolve_config_path(explicit: Option<&Path>) -> PathBuf {
    if let Some(path) = explicit {
        return path.to_path_buf();
    }
    let local = PathBuf::from("warden.toml");
    if local.exists() {
        return local;
    }
    DataDir::new(".warden").config()
}

fn controller(config: &WardenConfig, dd: &DataDir) -> ProcessController {
    ProcessController::new(
        config.worker.clone(),
        Timings::from(&config.timing),
        PidFile::new(dd.pid_file()),
        LogSink::new(dd.log_file()),
    )
}

async fn run(
    command: Commands,
    config: &WardenConfig,
    config_path: &Path,
) -> Result<ExitCode, Box<dyn std::error::Error>> {
    let dd = DataDir::new(&config.storage.data_dir);
    if !matches!(
        command,
        Commands::Init | Commands::Schedule { .. } | Commands::KeepAlive { .. }
    ) {
        dd.ensure_exists()?;
    }
    let log = LogSink::new(dd.log_file());

    match command {
        Commands::Start => {
            deps::ensure_prerequisites(&config.worker, &log)?;
            let mut ctl = controller(config, &dd);
            match ctl.start().await {
                Ok(pid) => {
                    println!("Worker started (pid {pid})");
                    Ok(ExitCode::SUCCESS)
                }
                Err(e) => {
                    eprintln!("Start failed: {e}");
                    if matches!(e, process::StartError::StartFailed { .. }) {
                        eprintln!("See `warden logs` for the worker's output");
                    }
                    Ok(ExitCode::FAILURE)
                }
            }
        }
        Commands::Stop => {
            let mut ctl = controller(config, &dd);
            match ctl.stop().await {
                Ok(Termination::Graceful) => println!("Worker stopped"),
                Ok(Termination::Forced) => println!("Worker stopped (forced with SIGKILL)"),
                Err(StopError::NotRunning) => println!("Worker is not running"),
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Restart => {
            deps::ensure_prerequisites(&config.worker, &log)?;
            let mut ctl = controller(config, &dd);
            match ctl.restart().await {
                Ok(pid) => {
                    println!("Worker restarted (pid {pid})");
                    Ok(ExitCode::SUCCESS)
                }
                Err(e) => {
                    eprintln!("Restart failed: {e}");
                    Ok(ExitCode::FAILURE)
                }
            }
        }
        Commands::Status { json } => {
            let mut ctl = controller(config, &dd);
            let report = status::WorkerStatus::for_pid(ctl.running_pid());
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print!("{}", report.render());
                println!("  pid file: {}", ctl.pid_file().path().display());
                println!("  log file: {}", ctl.log().path().display());
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Logs { lines } => {
            match log.tail(lines)? {
                Some(tail) => {
                    for line in tail {
                        println!("{line}");
                    }
                }
                None => eprintln!("Warning: no log file at {}", log.path().display()),
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Monitor => {
            deps::ensure_prerequisites(&config.worker, &log)?;
            let mut ctl = controller(config, &dd);
            let settings = MonitorSettings::from(&config.monitor);
            let report = Monitor::new(&mut ctl, &log, settings).run().await;
            tracing::info!(
                polls = report.polls,
                restart_attempts = report.restart_attempts,
                successful_restarts = report.successful_restarts,
                "monitoring halted"
            );
            eprintln!(
                "Monitoring halted after {} failed restart attempts in a row; see `warden logs`",
                settings.max_restarts
            );
            Ok(ExitCode::SUCCESS)
        }
        Commands::InstallDeps => {
            deps::ensure_prerequisites(&config.worker, &log)?;
            println!("Dependencies OK");
            Ok(ExitCode::SUCCESS)
        }
        Commands::Schedule { action } => {
            let entry = schedule::ScheduleEntry {
                interval_minutes: config.schedule.interval_minutes,
                exe: std::env::current_exe()?,
                config: schedule::absolute(config_path),
                output: schedule::absolute(&dd.monitor_output()),
            };
            match action {
                ScheduleAction::Install => {
                    if schedule::install(&entry)? {
                        println!("Installed: {}", entry.line());
                    } else {
                        println!("Already installed");
                    }
                }
                ScheduleAction::Remove => {
                    if schedule::remove(&entry)? {
                        println!("Removed monitor schedule");
                    } else {
                        println!("No monitor schedule installed");
                    }
                }
                ScheduleAction::Show => {
                    let table = schedule::read_crontab()?;
                    match schedule::find_entry(&table, &entry) {
                        Some(line) => println!("{line}"),
                        None => println!("No monitor schedule installed"),
                    }
                }
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Serve => {
            serve::run(config).await?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::KeepAlive {
            url,
            interval,
            timeout,
        } => {
            let settings =
                keep_alive::KeepAliveSettings::resolve(&config.keep_alive, url, interval, timeout);
            keep_alive::KeepAlive::new(settings)?.run().await;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Init => {
            if dd.init()? {
                println!("Initialized {}", dd.root().display());
            } else {
                println!("{} already exists", dd.root().display());
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_commands() {
        let cli = Cli::parse_from(["warden", "start"]);
        assert!(matches!(cli.command, Commands::Start));
        assert!(cli.config.is_none());

        let cli = Cli::parse_from(["warden", "logs"]);
        assert!(matches!(cli.command, Commands::Logs { lines: 50 }));

        let cli = Cli::parse_from(["warden", "logs", "10"]);
        assert!(matches!(cli.command, Commands::Logs { lines: 10 }));

        let cli = Cli::parse_from(["warden", "status", "--json", "-c", "x.toml"]);
        assert!(matches!(cli.command, Commands::Status { json: true }));
        assert_eq!(cli.config, Some(PathBuf::from("x.toml")));

        let cli = Cli::parse_from(["warden", "schedule", "install"]);
        assert!(matches!(
            cli.command,
            Commands::Schedule {
                action: ScheduleAction::Install
            }
        ));
    }

    #[test]
    fn test_cli_parses_keep_alive() {
        let cli = Cli::parse_from(["warden", "keep-alive"]);
        assert!(matches!(
            cli.command,
            Commands::KeepAlive {
                url: None,
                interval: None,
                timeout: None
            }
        ));

        let cli = Cli::parse_from([
            "warden",
            "keep-alive",
            "https://bot.example.com/health",
            "60",
            "--timeout",
            "3",
        ]);
        match cli.command {
            Commands::KeepAlive {
                url,
                interval,
                timeout,
            } => {
                assert_eq!(url.as_deref(), Some("https://bot.example.com/health"));
                assert_eq!(interval, Some(60));
                assert_eq!(timeout, Some(3));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_scheduled_monitor_uses_project_marker() {
        // Cron runs `warden --config <abs> monitor` from $HOME; the marker
        // must still be the project's.
        let project = tempfile::tempdir().unwrap();
        let config_path = project.path().join("warden.toml");
        std::fs::write(&config_path, "").unwrap();

        let config = config::load_config(&config_path).unwrap();
        let dd = DataDir::new(&config.storage.data_dir);
        assert_eq!(dd.pid_file(), project.path().join(".warden/worker.pid"));

        let ctl = controller(&config, &dd);
        assert_eq!(
            ctl.pid_file().path(),
            project.path().join(".warden/worker.pid")
        );
    }

    #[test]
    fn test_cli_rejects_unknown_and_conflicting() {
        assert!(Cli::try_parse_from(["warden", "explode"]).is_err());
        assert!(Cli::try_parse_from(["warden"]).is_err());
        assert!(Cli::try_parse_from(["warden", "-v", "-q", "status"]).is_err());
    }

    #[test]
    fn test_resolve_explicit_config() {
        assert_eq!(
            resolve_config_path(Some(Path::new("/etc/warden.toml"))),
            PathBuf::from("/etc/warden.toml")
        );
    }

    #[test]
    fn test_cli_debug_assert() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }
}
