/// Point-in-time view of the worker for `warden status` and `GET /status`.
use crate::pidfile::PidFile;
use crate::process::pid_alive;
use chrono::{DateTime, Local};
use serde::Serialize;
use std::process::Command;

#[derive(Debug, Clone, Serialize)]
pub struct WorkerStatus {
    pub running: bool,
    pub pid: Option<u32>,
    /// Elapsed time as reported by `ps` (`[[dd-]hh:]mm:ss`).
    pub uptime: Option<String>,
    /// Resident set size in KiB.
    pub memory_kb: Option<u64>,
    pub checked_at: DateTime<Local>,
}

impl WorkerStatus {
    /// Status for a worker already confirmed alive (`pid`) or down (`None`).
    pub fn for_pid(pid: Option<u32>) -> Self {
        let stats = pid.and_then(process_stats);
        Self {
            running: pid.is_some(),
            pid,
            uptime: stats.as_ref().map(|s| s.elapsed.clone()),
            memory_kb: stats.map(|s| s.rss_kb),
            checked_at: Local::now(),
        }
    }

    /// Read-only probe of the marker. Unlike the controller's liveness check,
    /// this never removes a stale marker.
    pub fn probe(pid_file: &PidFile) -> Self {
        let pid = pid_file.read().filter(|pid| pid_alive(*pid));
        Self::for_pid(pid)
    }

    /// Human-readable multi-line report.
    pub fn render(&self) -> String {
        match self.pid {
            Some(pid) if self.running => {
                let mut out = format!("Worker is running (pid {pid})\n");
                if let Some(uptime) = &self.uptime {
                    out.push_str(&format!("  uptime: {uptime}\n"));
                }
                if let Some(kb) = self.memory_kb {
                    out.push_str(&format!("  memory: {:.1} MB\n", kb as f64 / 1024.0));
                }
                out
            }
            _ => "Worker is not running\n".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct ProcessStats {
    elapsed: String,
    rss_kb: u64,
}

fn process_stats(pid: u32) -> Option<ProcessStats> {
    let output = Command::new("ps")
        .args(["-o", "etime=,rss=", "-p", &pid.to_string()])
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    parse_ps_line(&String::from_utf8_lossy(&output.stdout))
}

fn parse_ps_line(line: &str) -> Option<ProcessStats> {
    let mut fields = line.split_whitespace();
    let elapsed = fields.next()?.to_string();
    let rss_kb = fields.next()?.parse().ok()?;
    Some(ProcessStats { elapsed, rss_kb })
}

/// Render seconds as `1d 2h 3m 4s`, omitting zero units (`0s` for zero).
pub fn format_duration(total_secs: u64) -> String {
    let days = total_secs / 86_400;
    let hours = (total_secs % 86_400) / 3_600;
    let minutes = (total_secs % 3_600) / 60;
    let secs = total_secs % 60;

    let mut parts = Vec::new();
    if days > 0 {
        parts.push(format!("{days}d"));
    }
    if hours > 0 {
        parts.push(format!("{hours}h"));
    }
    if minutes > 0 {
        parts.push(format!("{minutes}m"));
    }
    if secs > 0 || parts.is_empty() {
        parts.push(format!("{secs}s"));
    }
    parts.join(" ")
}
