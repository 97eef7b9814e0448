//! Run controller: one launch, one observation loop, one guaranteed teardown
//!
//! ```text
//! apply env overlay ─► launch ─► loop (mode) ─► teardown
//!                        │                        ▲
//!                        └──── launch error ──────┘
//! ```
//!
//! Teardown always runs in the same order: SIGTERM the process group, reap
//! the leader, remove the log file, revert the overlay. Errors met before or
//! during the loop are recorded on the [`RunReport`]; only a launch failure
//! is returned as `Err`, after teardown has completed.
//!
//! Interrupts arrive on one channel for the whole run. The first ends
//! observation; one arriving while teardown waits for the reap forces SIGKILL.

use crate::config::{HarnessConfig, RunMode};
use crate::env_overlay::EnvOverlay;
use crate::log_tail::{Delta, LogTailWatcher};
use crate::output::OutputLine;
use crate::process::{launch_with, terminate_group_until, LaunchOptions, ProcessHandle};
use crate::{CoreError, Result};
use std::path::Path;
use std::process::ExitStatus;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// How long output drains may keep running after the group is reaped
const OUTPUT_DRAIN_GRACE: Duration = Duration::from_millis(500);

/// Receives log deltas as they are observed
pub trait DeltaSink {
    /// Called once per observed change
    fn emit(&mut self, delta: &Delta);
}

/// Prints each delta to stdout as `DEBUG: <content>`
#[derive(Debug, Default, Clone, Copy)]
pub struct StdoutSink;

impl DeltaSink for StdoutSink {
    fn emit(&mut self, delta: &Delta) {
        println!("DEBUG: {}", delta.content);
    }
}

impl DeltaSink for Vec<Delta> {
    fn emit(&mut self, delta: &Delta) {
        self.push(delta.clone());
    }
}

/// Observation loop state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoopState {
    Running,
    Interrupted,
}

/// Records the first error of a run of consecutive failures
#[derive(Debug, Default)]
struct ErrorStreak {
    failing: bool,
}

impl ErrorStreak {
    fn fail(&mut self, e: CoreError, report: &mut RunReport) {
        if self.failing {
            return;
        }
        warn!(code = e.code(), "{}", e);
        report.errors.push(e);
        self.failing = true;
    }

    fn clear(&mut self) {
        if self.failing {
            debug!("recovered after a failing streak");
        }
        self.failing = false;
    }
}

/// Why the observation phase ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The interrupt signal arrived
    Interrupted,
    /// The timed sample elapsed
    SampleElapsed,
    /// The target could not be launched
    LaunchFailed,
}

/// Everything observed during one run
#[derive(Debug)]
pub struct RunReport {
    /// Mode the run used
    pub mode: RunMode,
    /// Leader pid and process group id
    pub pid: Option<u32>,
    /// Why observation stopped
    pub stop_reason: StopReason,
    /// Status of a target that exited on its own before teardown
    pub exited_early: Option<ExitStatus>,
    /// Final exit status once reaped
    pub exit_status: Option<ExitStatus>,
    /// Whether teardown had to use SIGKILL
    pub escalated: bool,
    /// Number of deltas handed to the sink
    pub deltas: usize,
    /// Time from start of run to end of teardown
    pub elapsed: Duration,
    /// Captured child output, oldest first
    pub output: Vec<OutputLine>,
    /// Captured lines evicted for capacity
    pub output_dropped: u64,
    /// Tolerated errors recorded along the way
    pub errors: Vec<CoreError>,
}

impl RunReport {
    fn new(mode: RunMode) -> Self {
        Self {
            mode,
            pid: None,
            stop_reason: StopReason::LaunchFailed,
            exited_early: None,
            exit_status: None,
            escalated: false,
            deltas: 0,
            elapsed: Duration::ZERO,
            output: Vec::new(),
            output_dropped: 0,
            errors: Vec::new(),
        }
    }

    /// Whether the target was alive when observation ended
    pub fn survived(&self) -> bool {
        self.pid.is_some() && self.exited_early.is_none()
    }
}

/// Drives a single harness run described by a [`HarnessConfig`]
#[derive(Debug, Clone)]
pub struct RunController {
    config: HarnessConfig,
}

impl RunController {
    /// Create a controller after validating `config`
    pub fn new(config: HarnessConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    /// Configuration this controller runs with
    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    /// Run until SIGINT/SIGTERM (Interactive) or the sample elapses, printing deltas
    pub async fn run(&self) -> Result<RunReport> {
        let interrupts = listen_for_interrupts()?;
        self.run_until(interrupts, &mut StdoutSink).await
    }

    /// Run with an explicit interrupt channel and delta sink.
    ///
    /// Each message on `interrupts` plays the role of one external interrupt
    /// signal. A closed channel never interrupts. The first interrupt is
    /// observed between poll ticks and also cuts a timed sample short; a
    /// later one breaks the reap wait during teardown.
    pub async fn run_until<S>(
        &self,
        mut interrupts: mpsc::Receiver<()>,
        sink: &mut S,
    ) -> Result<RunReport>
    where
        S: DeltaSink + ?Sized,
    {
        let started = Instant::now();
        let mut report = RunReport::new(self.config.mode);

        let mut overlay = EnvOverlay::apply(
            self.config
                .environment
                .iter()
                .map(|(k, v)| (k.as_str(), v.as_str())),
        );

        let options = LaunchOptions {
            output: self.config.output,
            output_capacity: self.config.output_capacity,
        };
        let launched = launch_with(&self.config.target, &self.config.args, &options);

        let result = match launched {
            Ok(mut handle) => {
                report.pid = Some(handle.pid());
                let stop = self
                    .observe(&mut handle, &mut interrupts, sink, &mut report)
                    .await;
                report.stop_reason = stop;
                self.stop_process(&mut handle, &mut interrupts, &mut report)
                    .await;
                Ok(())
            }
            Err(e) => {
                warn!("{}", e);
                Err(e)
            }
        };

        remove_log_file(&self.config.log_file, &mut report);
        overlay.revert();

        report.elapsed = started.elapsed();
        info!(
            mode = %report.mode,
            stop = ?report.stop_reason,
            deltas = report.deltas,
            elapsed_ms = report.elapsed.as_millis() as u64,
            "run finished"
        );
        result.map(|()| report)
    }

    async fn observe<S>(
        &self,
        handle: &mut ProcessHandle,
        interrupts: &mut mpsc::Receiver<()>,
        sink: &mut S,
        report: &mut RunReport,
    ) -> StopReason
    where
        S: DeltaSink + ?Sized,
    {
        let mut status_errors = ErrorStreak::default();

        match self.config.mode.sample_duration() {
            Some(duration) => {
                tokio::select! {
                    _ = tokio::time::sleep(duration) => {
                        debug!("sample of {:?} elapsed", duration);
                    }
                    _ = next_interrupt(interrupts) => {
                        info!("Interrupted during timed sample");
                        self.note_early_exit(handle, report, &mut status_errors);
                        return StopReason::Interrupted;
                    }
                }
                self.note_early_exit(handle, report, &mut status_errors);
                StopReason::SampleElapsed
            }
            None => {
                let mut watcher =
                    LogTailWatcher::with_interval(&self.config.log_file, self.config.poll_interval());
                let mut read_errors = ErrorStreak::default();
                let mut state = LoopState::Running;
                while state == LoopState::Running {
                    match watcher.poll().await {
                        Ok(delta) => {
                            read_errors.clear();
                            if let Some(delta) = delta {
                                sink.emit(&delta);
                                report.deltas += 1;
                            }
                        }
                        Err(e) => read_errors.fail(e, report),
                    }
                    if report.exited_early.is_none() {
                        self.note_early_exit(handle, report, &mut status_errors);
                    }
                    tokio::select! {
                        _ = tokio::time::sleep(watcher.interval()) => {}
                        _ = next_interrupt(interrupts) => state = LoopState::Interrupted,
                    }
                }
                info!("Interrupt received, stopping");
                StopReason::Interrupted
            }
        }
    }

    fn note_early_exit(
        &self,
        handle: &mut ProcessHandle,
        report: &mut RunReport,
        errors: &mut ErrorStreak,
    ) {
        match handle.try_status() {
            Ok(Some(status)) => {
                errors.clear();
                if report.exited_early.is_none() {
                    warn!("Target {} exited on its own with {}", handle.pid(), status);
                    report.exited_early = Some(status);
                }
            }
            Ok(None) => errors.clear(),
            Err(e) => errors.fail(e, report),
        }
    }

    async fn stop_process(
        &self,
        handle: &mut ProcessHandle,
        interrupts: &mut mpsc::Receiver<()>,
        report: &mut RunReport,
    ) {
        let termination = terminate_group_until(
            handle,
            self.config.reap_timeout(),
            self.config.escalation,
            next_interrupt(interrupts),
        )
        .await;
        report.exit_status = termination.status;
        report.escalated = termination.escalated;
        report.errors.extend(termination.errors);

        if let Some(capture) = handle.take_output() {
            let (lines, dropped) = capture.finish(OUTPUT_DRAIN_GRACE).await;
            report.output = lines;
            report.output_dropped = dropped;
        }
    }
}

/// Wait for the next interrupt; a closed channel never resolves
async fn next_interrupt(interrupts: &mut mpsc::Receiver<()>) {
    if interrupts.recv().await.is_none() {
        std::future::pending::<()>().await;
    }
}

/// Best-effort removal of the log file; a missing file is not an error
fn remove_log_file(path: &Path, report: &mut RunReport) {
    match std::fs::remove_file(path) {
        Ok(()) => debug!("Removed log file {:?}", path),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => {
            debug!("Could not remove log file {:?}: {}", path, e);
            report.errors.push(CoreError::CleanupError {
                path: path.to_path_buf(),
                source: e,
            });
        }
    }
}

/// Forward every SIGINT and SIGTERM delivered to the harness as one message.
///
/// The listeners are registered before this returns, so a signal sent
/// afterwards is never lost. Must be called from within a Tokio runtime.
pub fn listen_for_interrupts() -> Result<mpsc::Receiver<()>> {
    use tokio::signal::unix::{signal, SignalKind};

    let register = |kind: SignalKind, name: &str| {
        signal(kind).map_err(|e| {
            CoreError::InitializationError(format!("Failed to listen for {}: {}", name, e))
        })
    };
    let mut sigint = register(SignalKind::interrupt(), "SIGINT")?;
    let mut sigterm = register(SignalKind::terminate(), "SIGTERM")?;

    let (tx, rx) = mpsc::channel(4);
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = sigint.recv() => debug!("SIGINT received"),
                _ = sigterm.recv() => debug!("SIGTERM received"),
            }
            if tx.send(()).await.is_err() {
                break;
            }
        }
    });
    Ok(rx)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vec_sink_collects() {
        let mut sink: Vec<Delta> = Vec::new();
        let delta = Delta {
            content: "hello".to_string(),
            observed_at: chrono::Utc::now(),
        };
        sink.emit(&delta);
        assert_eq!(sink, vec![delta]);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut cfg = HarnessConfig::new("/bin/sh");
        cfg.poll_interval_ms = 0;
        assert!(matches!(
            RunController::new(cfg),
            Err(CoreError::ValidationError(_))
        ));
    }

    #[test]
    fn test_report_survived() {
        let mut report = RunReport::new(RunMode::Interactive);
        assert!(!report.survived());
        report.pid = Some(42);
        assert!(report.survived());
    }

    #[test]
    fn test_error_streak_records_once() {
        let mut report = RunReport::new(RunMode::Interactive);
        let mut streak = ErrorStreak::default();
        for _ in 0..5 {
            streak.fail(CoreError::ProcessWait("try_wait failed".into()), &mut report);
        }
        assert_eq!(report.errors.len(), 1);

        // A good tick ends the streak; the next failure is recorded again
        streak.clear();
        streak.fail(CoreError::ProcessWait("try_wait failed".into()), &mut report);
        assert_eq!(report.errors.len(), 2);
    }

    #[tokio::test]
    async fn test_closed_channel_never_interrupts() {
        let (tx, mut rx) = mpsc::channel::<()>(1);
        drop(tx);
        let waited =
            tokio::time::timeout(Duration::from_millis(100), next_interrupt(&mut rx)).await;
        assert!(waited.is_err());
    }

    #[tokio::test]
    #[serial_test::serial]
    async fn test_sigterm_reaches_interrupt_channel() {
        let mut interrupts = listen_for_interrupts().unwrap();
        nix::sys::signal::raise(nix::sys::signal::Signal::SIGTERM).unwrap();
        let received = tokio::time::timeout(Duration::from_secs(5), interrupts.recv()).await;
        assert_eq!(received, Ok(Some(())));

        // The listener stays armed for a second signal
        nix::sys::signal::raise(nix::sys::signal::Signal::SIGTERM).unwrap();
        let received = tokio::time::timeout(Duration::from_secs(5), interrupts.recv()).await;
        assert_eq!(received, Ok(Some(())));
    }

    #[tokio::test]
    async fn test_remove_missing_log_file_is_silent() {
        let dir = tempfile::tempdir().unwrap();
        let mut report = RunReport::new(RunMode::Interactive);
        remove_log_file(&dir.path().join("never.log"), &mut report);
        assert!(report.errors.is_empty());

        // A directory cannot be removed with remove_file
        remove_log_file(dir.path(), &mut report);
        assert_eq!(report.errors.len(), 1);
        assert!(report.errors[0].is_tolerated());
    }
}
