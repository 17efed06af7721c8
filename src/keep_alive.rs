/// Keep-alive pinger: GET a health URL on a fixed interval and keep
/// success statistics, so an idle hosted service is never put to sleep.
use crate::config::KeepAliveConfig;
use chrono::{DateTime, Local};
use serde::Serialize;
use std::time::{Duration, Instant};

#[derive(Debug)]
pub enum KeepAliveError {
    Client { source: reqwest::Error },
}

impl std::fmt::Display for KeepAliveError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KeepAliveError::Client { source } => write!(f, "failed to build HTTP client: {source}"),
        }
    }
}

impl std::error::Error for KeepAliveError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            KeepAliveError::Client { source } => Some(source),
        }
    }
}

/// Result of a single ping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PingOutcome {
    /// The endpoint answered 200.
    Healthy,
    /// The endpoint answered with another status.
    BadStatus(u16),
    /// No answer within the timeout.
    Timeout,
    /// Connection refused, DNS failure and the like.
    Network(String),
}

impl PingOutcome {
    pub fn is_healthy(&self) -> bool {
        matches!(self, PingOutcome::Healthy)
    }
}

impl std::fmt::Display for PingOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PingOutcome::Healthy => write!(f, "healthy"),
            PingOutcome::BadStatus(status) => write!(f, "status {status}"),
            PingOutcome::Timeout => write!(f, "timed out"),
            PingOutcome::Network(reason) => write!(f, "network error: {reason}"),
        }
    }
}

/// Resolved pinger settings: `[keep_alive]` plus command-line overrides.
#[derive(Debug, Clone)]
pub struct KeepAliveSettings {
    pub url: String,
    pub interval: Duration,
    pub timeout: Duration,
    /// Log a stats line every this many pings; 0 disables it.
    pub stats_every: u64,
}

impl KeepAliveSettings {
    pub fn resolve(
        config: &KeepAliveConfig,
        url: Option<String>,
        interval_secs: Option<u64>,
        timeout_secs: Option<u64>,
    ) -> Self {
        Self {
            url: url.unwrap_or_else(|| config.url.clone()),
            interval: Duration::from_secs(interval_secs.unwrap_or(config.interval_secs)),
            timeout: Duration::from_secs(timeout_secs.unwrap_or(config.timeout_secs)),
            stats_every: config.stats_every,
        }
    }
}

/// Counters over every ping since the pinger started.
#[derive(Debug, Clone)]
pub struct PingStats {
    started_at: DateTime<Local>,
    started: Instant,
    last_ping: Option<DateTime<Local>>,
    total: u64,
    failed: u64,
}

/// Serializable view of [`PingStats`].
#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub start_time: DateTime<Local>,
    pub uptime_seconds: f64,
    pub uptime_formatted: String,
    pub last_ping: Option<DateTime<Local>>,
    pub total_pings: u64,
    pub failed_pings: u64,
    pub success_rate: f64,
}

impl PingStats {
    pub fn new() -> Self {
        Self {
            started_at: Local::now(),
            started: Instant::now(),
            last_ping: None,
            total: 0,
            failed: 0,
        }
    }

    pub fn record(&mut self, outcome: &PingOutcome) {
        self.total += 1;
        self.last_ping = Some(Local::now());
        if !outcome.is_healthy() {
            self.failed += 1;
        }
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    #[cfg(test)]
    pub fn failed(&self) -> u64 {
        self.failed
    }

    /// Percentage of healthy pings, rounded to two decimals; 0 before the first ping.
    pub fn success_rate(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        let rate = (self.total - self.failed) as f64 / self.total as f64 * 100.0;
        (rate * 100.0).round() / 100.0
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let uptime = self.started.elapsed();
        StatsSnapshot {
            start_time: self.started_at,
            uptime_seconds: uptime.as_secs_f64(),
            uptime_formatted: crate::status::format_duration(uptime.as_secs()),
            last_ping: self.last_ping,
            total_pings: self.total,
            failed_pings: self.failed,
            success_rate: self.success_rate(),
        }
    }
}

impl Default for PingStats {
    fn default() -> Self {
        Self::new()
    }
}

fn stats_due(total: u64, every: u64) -> bool {
    every > 0 && total > 0 && total % every == 0
}

pub struct KeepAlive {
    client: reqwest::Client,
    settings: KeepAliveSettings,
    stats: PingStats,
}

impl KeepAlive {
    pub fn new(settings: KeepAliveSettings) -> Result<Self, KeepAliveError> {
        let client = reqwest::Client::builder()
            .timeout(settings.timeout)
            .build()
            .map_err(|e| KeepAliveError::Client { source: e })?;
        Ok(Self {
            client,
            settings,
            stats: PingStats::new(),
        })
    }

    #[cfg(test)]
    pub fn stats(&self) -> &PingStats {
        &self.stats
    }

    /// Send one GET and record the outcome.
    pub async fn ping(&mut self) -> PingOutcome {
        let outcome = match self.client.get(&self.settings.url).send().await {
            Ok(resp) if resp.status() == reqwest::StatusCode::OK => PingOutcome::Healthy,
            Ok(resp) => PingOutcome::BadStatus(resp.status().as_u16()),
            Err(e) if e.is_timeout() => PingOutcome::Timeout,
            Err(e) => PingOutcome::Network(e.to_string()),
        };
        self.stats.record(&outcome);

        match &outcome {
            PingOutcome::Healthy => tracing::info!(url = %self.settings.url, "ping ok"),
            PingOutcome::BadStatus(_) => {
                tracing::warn!(url = %self.settings.url, outcome = %outcome, "ping failed")
            }
            PingOutcome::Timeout | PingOutcome::Network(_) => {
                tracing::error!(url = %self.settings.url, outcome = %outcome, "ping failed")
            }
        }

        if stats_due(self.stats.total(), self.settings.stats_every) {
            let snapshot = self.stats.snapshot();
            tracing::info!(
                total_pings = snapshot.total_pings,
                failed_pings = snapshot.failed_pings,
                success_rate = snapshot.success_rate,
                uptime = %snapshot.uptime_formatted,
                "keep-alive stats"
            );
        }
        outcome
    }

    /// Ping immediately, then once per interval, until the process is killed.
    pub async fn run(mut self) {
        tracing::info!(
            url = %self.settings.url,
            interval_secs = self.settings.interval.as_secs(),
            timeout_secs = self.settings.timeout.as_secs(),
            "keep-alive started"
        );
        loop {
            self.ping().await;
            tokio::time::sleep(self.settings.interval).await;
        }
    }
}
