/// Periodic `warden monitor` job in the user's crontab.
///
/// The job re-launches monitoring after a reboot or an unexpected exit of
/// the supervisor. Installing and removing are idempotent: the table holds
/// at most one warden line per config file.
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

/// Marker appended to every line warden writes, so it can find them again.
const TAG: &str = "# warden:";

#[derive(Debug)]
pub enum ScheduleError {
    Crontab {
        action: &'static str,
        source: std::io::Error,
    },
    CrontabFailed {
        action: &'static str,
        stderr: String,
    },
}

impl std::fmt::Display for ScheduleError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScheduleError::Crontab { action, source } => {
                write!(f, "failed to {action} crontab: {source}")
            }
            ScheduleError::CrontabFailed { action, stderr } => {
                write!(f, "crontab refused to {action}: {stderr}")
            }
        }
    }
}

impl std::error::Error for ScheduleError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ScheduleError::Crontab { source, .. } => Some(source),
            ScheduleError::CrontabFailed { .. } => None,
        }
    }
}

/// Everything needed to render the cron line.
#[derive(Debug, Clone)]
pub struct ScheduleEntry {
    pub interval_minutes: u32,
    pub exe: PathBuf,
    pub config: PathBuf,
    /// Where cron sends warden's own stderr.
    pub output: PathBuf,
}

impl ScheduleEntry {
    fn tag(&self) -> String {
        format!("{TAG}{}", self.config.display())
    }

    pub fn line(&self) -> String {
        let minutes = self.interval_minutes.clamp(1, 59);
        format!(
            "*/{minutes} * * * * {} --config {} monitor >> {} 2>&1 {}",
            self.exe.display(),
            self.config.display(),
            self.output.display(),
            self.tag()
        )
    }
}

/// Add `entry`, replacing any earlier line for the same config.
/// Returns the new table and whether it changed.
pub fn with_entry(table: &str, entry: &ScheduleEntry) -> (String, bool) {
    let line = entry.line();
    if table.lines().any(|l| l == line) {
        return (table.to_string(), false);
    }
    let (mut lines, _) = without_lines(table, &entry.tag());
    lines.push(line);
    (join_lines(&lines), true)
}

/// Remove the line for `entry`'s config. Returns the new table and whether it changed.
pub fn without_entry(table: &str, entry: &ScheduleEntry) -> (String, bool) {
    let (lines, removed) = without_lines(table, &entry.tag());
    (join_lines(&lines), removed)
}

/// The installed line for `entry`'s config, if any.
pub fn find_entry<'t>(table: &'t str, entry: &ScheduleEntry) -> Option<&'t str> {
    let tag = entry.tag();
    table.lines().find(|l| l.ends_with(&tag))
}

fn without_lines(table: &str, tag: &str) -> (Vec<String>, bool) {
    let mut removed = false;
    let lines = table
        .lines()
        .filter(|l| {
            let ours = l.ends_with(tag);
            removed |= ours;
            !ours
        })
        .map(str::to_string)
        .collect();
    (lines, removed)
}

fn join_lines(lines: &[String]) -> String {
    if lines.is_empty() {
        String::new()
    } else {
        format!("{}\n", lines.join("\n"))
    }
}

/// Current user's crontab; a user without one has an empty table.
pub fn read_crontab() -> Result<String, ScheduleError> {
    let output = Command::new("crontab")
        .arg("-l")
        .output()
        .map_err(|e| ScheduleError::Crontab {
            action: "read",
            source: e,
        })?;
    if output.status.success() {
        return Ok(String::from_utf8_lossy(&output.stdout).into_owned());
    }
    let stderr = String::from_utf8_lossy(&output.stderr);
    if stderr.contains("no crontab") {
        return Ok(String::new());
    }
    Err(ScheduleError::CrontabFailed {
        action: "read",
        stderr: stderr.trim().to_string(),
    })
}

pub fn write_crontab(table: &str) -> Result<(), ScheduleError> {
    let write_err = |e: std::io::Error| ScheduleError::Crontab {
        action: "write",
        source: e,
    };
    let mut child = Command::new("crontab")
        .arg("-")
        .stdin(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(write_err)?;
    if let Some(mut stdin) = child.stdin.take() {
        stdin.write_all(table.as_bytes()).map_err(write_err)?;
    }
    let output = child.wait_with_output().map_err(write_err)?;
    if !output.status.success() {
        return Err(ScheduleError::CrontabFailed {
            action: "write",
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(())
}

/// Install the job. Returns false if it was already present.
pub fn install(entry: &ScheduleEntry) -> Result<bool, ScheduleError> {
    let (table, changed) = with_entry(&read_crontab()?, entry);
    if changed {
        write_crontab(&table)?;
        tracing::info!(line = %entry.line(), "installed monitor schedule");
    }
    Ok(changed)
}

/// Remove the job. Returns false if it was not present.
pub fn remove(entry: &ScheduleEntry) -> Result<bool, ScheduleError> {
    let (table, changed) = without_entry(&read_crontab()?, entry);
    if changed {
        write_crontab(&table)?;
        tracing::info!(config = %entry.config.display(), "removed monitor schedule");
    }
    Ok(changed)
}

/// Absolute form of `path`, so cron (which runs from `$HOME`) finds it.
pub fn absolute(path: &Path) -> PathBuf {
    std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf())
}
