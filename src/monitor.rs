use crate::log_sink::LogSink;
use crate::process::{ProcessController, StartError};
use std::time::Duration;

/// The two controller operations the monitor loop needs.
#[allow(async_fn_in_trait)]
pub trait Supervised {
    /// Liveness check; may clear a stale marker.
    fn is_running(&mut self) -> bool;

    /// Launch the worker, returning its pid once it has settled.
    async fn start(&mut self) -> Result<u32, StartError>;
}

impl Supervised for ProcessController {
    fn is_running(&mut self) -> bool {
        ProcessController::is_running(self)
    }

    async fn start(&mut self) -> Result<u32, StartError> {
        ProcessController::start(self).await
    }
}

/// Monitor loop states. `Halted` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorState {
    Polling,
    Restarting,
    Halted,
}

/// Decision returned by the restart budget when the worker is found down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartDecision {
    /// Try again (1-based attempt number within the current failure streak).
    Attempt { attempt: u32 },
    /// Budget exhausted; stop monitoring.
    Halt,
}

/// Counts consecutive failed restarts and decides when to give up.
///
/// Any successful restart resets the count, so a worker that fails once
/// and then runs stably never exhausts the budget.
#[derive(Debug, Clone)]
pub struct RestartBudget {
    max_restarts: u32,
    consecutive_failures: u32,
}

impl RestartBudget {
    pub fn new(max_restarts: u32) -> Self {
        Self {
            max_restarts,
            consecutive_failures: 0,
        }
    }

    /// Whether another restart may be attempted.
    pub fn next(&self) -> RestartDecision {
        if self.consecutive_failures < self.max_restarts {
            RestartDecision::Attempt {
                attempt: self.consecutive_failures + 1,
            }
        } else {
            RestartDecision::Halt
        }
    }

    pub fn record_success(&mut self) {
        self.consecutive_failures = 0;
    }

    pub fn record_failure(&mut self) {
        self.consecutive_failures += 1;
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn max_restarts(&self) -> u32 {
        self.max_restarts
    }
}

/// Loop pacing and budget, resolved from `[monitor]`.
#[derive(Debug, Clone, Copy)]
pub struct MonitorSettings {
    pub poll_interval: Duration,
    pub restart_delay: Duration,
    pub max_restarts: u32,
}

impl From<&crate::config::MonitorConfig> for MonitorSettings {
    fn from(config: &crate::config::MonitorConfig) -> Self {
        Self {
            poll_interval: Duration::from_secs(config.poll_interval_secs),
            restart_delay: Duration::from_secs(config.restart_delay_secs),
            max_restarts: config.max_restarts,
        }
    }
}

/// What a monitoring run did before it halted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MonitorReport {
    pub polls: u64,
    pub restart_attempts: u32,
    pub successful_restarts: u32,
}

/// Sequential poll-then-act-then-sleep loop over a supervised worker.
pub struct Monitor<'a, W: Supervised> {
    worker: &'a mut W,
    log: &'a LogSink,
    settings: MonitorSettings,
    budget: RestartBudget,
    state: MonitorState,
    report: MonitorReport,
}

impl<'a, W: Supervised> Monitor<'a, W> {
    pub fn new(worker: &'a mut W, log: &'a LogSink, settings: MonitorSettings) -> Self {
        Self {
            worker,
            log,
            budget: RestartBudget::new(settings.max_restarts),
            settings,
            state: MonitorState::Polling,
            report: MonitorReport::default(),
        }
    }

    #[cfg(test)]
    pub fn state(&self) -> MonitorState {
        self.state
    }

    /// Run until the restart budget is exhausted.
    ///
    /// There is no other exit: stopping a monitor early means killing the
    /// supervisor process.
    pub async fn run(mut self) -> MonitorReport {
        tracing::info!(
            poll_interval_secs = self.settings.poll_interval.as_secs_f64(),
            max_restarts = self.settings.max_restarts,
            "monitoring started"
        );
        self.log.record(&format!(
            "Monitoring started (poll every {}s, max {} consecutive restarts)",
            self.settings.poll_interval.as_secs(),
            self.settings.max_restarts
        ));

        while self.step().await != MonitorState::Halted {
            tokio::time::sleep(self.settings.poll_interval).await;
        }
        self.report
    }

    /// One poll cycle. Returns the state the loop is in afterwards.
    pub async fn step(&mut self) -> MonitorState {
        if self.state == MonitorState::Halted {
            return self.state;
        }
        self.report.polls += 1;

        if self.worker.is_running() {
            if self.state != MonitorState::Polling {
                tracing::debug!("worker healthy, back to polling");
            }
            self.state = MonitorState::Polling;
            return self.state;
        }

        match self.budget.next() {
            RestartDecision::Halt => {
                tracing::error!(
                    consecutive_failures = self.budget.consecutive_failures(),
                    "restart budget exhausted, monitoring halted"
                );
                self.log.record(&format!(
                    "ERROR: worker failed to restart {} times in a row, monitoring halted",
                    self.budget.consecutive_failures()
                ));
                self.state = MonitorState::Halted;
            }
            RestartDecision::Attempt { attempt } => {
                self.state = MonitorState::Restarting;
                tracing::warn!(
                    attempt,
                    max_restarts = self.budget.max_restarts(),
                    "worker is down, restarting"
                );
                self.log.record(&format!(
                    "WARNING: worker is not running, restart attempt {attempt}/{}",
                    self.budget.max_restarts()
                ));

                if !self.settings.restart_delay.is_zero() {
                    tokio::time::sleep(self.settings.restart_delay).await;
                }
                self.report.restart_attempts += 1;

                match self.worker.start().await {
                    // Someone else brought it up between our check and the start
                    Ok(pid) | Err(StartError::AlreadyRunning { pid }) => {
                        self.budget.record_success();
                        self.report.successful_restarts += 1;
                        tracing::info!(pid, attempt, "worker restarted");
                        self.log
                            .record(&format!("Worker restarted (pid {pid})"));
                        self.state = MonitorState::Polling;
                    }
                    Err(e) => {
                        self.budget.record_failure();
                        tracing::warn!(
                            attempt,
                            error = %e,
                            consecutive_failures = self.budget.consecutive_failures(),
                            "restart failed"
                        );
                        self.log
                            .record(&format!("ERROR: restart attempt {attempt} failed: {e}"));
                    }
                }
            }
        }
        self.state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    /// Worker driven by scripted answers. When a script runs out the worker
    /// reports down and every start fails.
    #[derive(Default)]
    struct ScriptedWorker {
        running: VecDeque<bool>,
        starts: VecDeque<Result<u32, ()>>,
        start_calls: u32,
        checks: u32,
    }

    impl ScriptedWorker {
        fn new(running: &[bool], starts: &[Result<u32, ()>]) -> Self {
            Self {
                running: running.iter().copied().collect(),
                starts: starts.iter().copied().collect(),
                ..Default::default()
            }
        }
    }

    impl Supervised for ScriptedWorker {
        fn is_running(&mut self) -> bool {
            self.checks += 1;
            self.running.pop_front().unwrap_or(false)
        }

        async fn start(&mut self) -> Result<u32, StartError> {
            self.start_calls += 1;
            match self.starts.pop_front() {
                Some(Ok(pid)) => Ok(pid),
                _ => Err(StartError::StartFailed { pid: 999 }),
            }
        }
    }

    fn settings(max_restarts: u32) -> MonitorSettings {
        MonitorSettings {
            poll_interval: Duration::ZERO,
            restart_delay: Duration::ZERO,
            max_restarts,
        }
    }

    fn sink() -> (tempfile::TempDir, LogSink) {
        let dir = tempfile::tempdir().unwrap();
        let log = LogSink::new(dir.path().join("warden.log"));
        (dir, log)
    }

    #[test]
    fn test_budget_allows_max_then_halts() {
        let mut budget = RestartBudget::new(3);
        assert_eq!(budget.next(), RestartDecision::Attempt { attempt: 1 });
        budget.record_failure();
        assert_eq!(budget.next(), RestartDecision::Attempt { attempt: 2 });
        budget.record_failure();
        assert_eq!(budget.next(), RestartDecision::Attempt { attempt: 3 });
        budget.record_failure();
        assert_eq!(budget.next(), RestartDecision::Halt);
    }

    #[test]
    fn test_budget_success_resets() {
        let mut budget = RestartBudget::new(3);
        budget.record_failure();
        budget.record_failure();
        budget.record_success();
        assert_eq!(budget.consecutive_failures(), 0);
        assert_eq!(budget.next(), RestartDecision::Attempt { attempt: 1 });
    }

    #[test]
    fn test_zero_budget_halts_immediately() {
        let budget = RestartBudget::new(0);
        assert_eq!(budget.next(), RestartDecision::Halt);
    }

    #[tokio::test]
    async fn test_always_failing_worker_gets_exactly_max_attempts() {
        let (_dir, log) = sink();
        let mut worker = ScriptedWorker::new(&[], &[]);

        let report = Monitor::new(&mut worker, &log, settings(3)).run().await;

        assert_eq!(worker.start_calls, 3);
        assert_eq!(report.restart_attempts, 3);
        assert_eq!(report.successful_restarts, 0);
        // Three failed attempts plus the poll that found the budget spent
        assert_eq!(report.polls, 4);

        let contents = std::fs::read_to_string(log.path()).unwrap();
        assert!(contents.contains("monitoring halted"));
    }

    #[tokio::test]
    async fn test_success_resets_budget_for_next_crash() {
        let (_dir, log) = sink();
        // down -> start fails; down -> start ok; up; then crash and always fail
        let mut worker = ScriptedWorker::new(&[false, false, true], &[Err(()), Ok(42)]);

        let report = Monitor::new(&mut worker, &log, settings(3)).run().await;

        // 2 attempts before recovery, then a fresh budget of 3
        assert_eq!(worker.start_calls, 5);
        assert_eq!(report.restart_attempts, 5);
        assert_eq!(report.successful_restarts, 1);
    }

    #[tokio::test]
    async fn test_healthy_worker_keeps_polling() {
        let (_dir, log) = sink();
        let mut worker = ScriptedWorker::new(&[true, true, true], &[]);
        let mut monitor = Monitor::new(&mut worker, &log, settings(3));

        for _ in 0..3 {
            assert_eq!(monitor.step().await, MonitorState::Polling);
        }
        drop(monitor);
        assert_eq!(worker.start_calls, 0);
        assert_eq!(worker.checks, 3);
    }

    #[tokio::test]
    async fn test_state_transitions() {
        let (_dir, log) = sink();
        let mut worker = ScriptedWorker::new(&[false, false], &[Err(()), Ok(7)]);
        let mut monitor = Monitor::new(&mut worker, &log, settings(1));

        assert_eq!(monitor.state(), MonitorState::Polling);
        assert_eq!(monitor.step().await, MonitorState::Restarting);
        // One failure with a budget of one: the next outage halts
        assert_eq!(monitor.step().await, MonitorState::Halted);
        // Halted is terminal
        assert_eq!(monitor.step().await, MonitorState::Halted);
        drop(monitor);
        assert_eq!(worker.start_calls, 1);
        assert_eq!(worker.checks, 2);
    }

    #[tokio::test]
    async fn test_already_running_counts_as_recovered() {
        struct RacingWorker;
        impl Supervised for RacingWorker {
            fn is_running(&mut self) -> bool {
                false
            }
            async fn start(&mut self) -> Result<u32, StartError> {
                Err(StartError::AlreadyRunning { pid: 5 })
            }
        }

        let (_dir, log) = sink();
        let mut worker = RacingWorker;
        let mut monitor = Monitor::new(&mut worker, &log, settings(1));
        for _ in 0..5 {
            assert_eq!(monitor.step().await, MonitorState::Polling);
        }
    }

    #[tokio::test]
    async fn test_monitor_restarts_real_worker() {
        use crate::config::{Timings, WorkerConfig};
        use crate::pidfile::PidFile;

        let dir = tempfile::tempdir().unwrap();
        let log = LogSink::new(dir.path().join("warden.log"));
        let worker = WorkerConfig {
            command: "sleep".to_string(),
            args: vec!["30".to_string()],
            ..Default::default()
        };
        let timings = Timings {
            settle: Duration::from_millis(100),
            grace: Duration::from_millis(500),
            kill_wait: Duration::from_secs(1),
            restart_pause: Duration::ZERO,
            probe_interval: Duration::from_millis(20),
        };
        let mut ctl = ProcessController::new(
            worker,
            timings,
            PidFile::new(dir.path().join("worker.pid")),
            log.clone(),
        );

        let mut monitor = Monitor::new(&mut ctl, &log, settings(3));
        assert_eq!(monitor.step().await, MonitorState::Polling);
        assert_eq!(monitor.step().await, MonitorState::Polling);
        drop(monitor);

        assert!(ctl.is_running());
        ctl.stop().await.unwrap();
    }
}
