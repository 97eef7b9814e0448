//! Unix process launch and teardown using process groups
//!
//! The target is started with `setsid()` in the child before `exec`, making
//! it the leader of a new session and process group whose id equals its pid.
//! Anything it forks stays in that group unless it calls `setsid()` itself,
//! so one `killpg` reaches the whole tree.
//!
//! ## Handle lifecycle
//!
//! `Spawned → Running → SignalSent → Reaped`. `Running` is entered the first
//! time a non-blocking status check finds the child alive. `Reaped` is
//! terminal and holds the exit status.

// Allow unsafe code for this module since process management requires libc::setsid() calls
#![allow(unsafe_code)]

use crate::config::{EscalationPolicy, OutputMode};
use crate::output::{OutputCapture, OutputStream};
use crate::{CoreError, Result};
use nix::errno::Errno;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
#[allow(unused_imports)]
use std::os::unix::process::CommandExt;
use std::future::Future;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::process::{Child, Command};
use tracing::{debug, error, info, warn};

/// Lifecycle state of a launched process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    /// The OS confirmed process creation
    Spawned,
    /// Observed alive at least once
    Running,
    /// A termination signal was sent to the group
    SignalSent,
    /// The leader was waited on; terminal
    Reaped(ExitStatus),
}

impl ProcessState {
    /// Whether the leader has been reaped
    pub fn is_reaped(&self) -> bool {
        matches!(self, ProcessState::Reaped(_))
    }
}

/// Options controlling how the target is started
#[derive(Debug, Clone, Copy)]
pub struct LaunchOptions {
    /// Capture or discard stdout/stderr
    pub output: OutputMode,
    /// Lines retained when capturing
    pub output_capacity: usize,
}

impl Default for LaunchOptions {
    fn default() -> Self {
        Self {
            output: OutputMode::Capture,
            output_capacity: 256,
        }
    }
}

/// A launched target, leader of its own process group
#[derive(Debug)]
pub struct ProcessHandle {
    pid: Pid,
    child: Child,
    state: ProcessState,
    output: Option<OutputCapture>,
}

impl ProcessHandle {
    /// Process ID of the leader
    pub fn pid(&self) -> u32 {
        self.pid.as_raw() as u32
    }

    /// Process group ID (same as PID for session leaders)
    pub fn pgid(&self) -> u32 {
        self.pid.as_raw() as u32
    }

    /// Current lifecycle state
    pub fn state(&self) -> ProcessState {
        self.state
    }

    /// Take the output capture, if output was captured and not yet taken
    pub fn take_output(&mut self) -> Option<OutputCapture> {
        self.output.take()
    }

    /// Check without blocking whether the leader has exited.
    ///
    /// Reaps and records the status if it has.
    pub fn try_status(&mut self) -> Result<Option<ExitStatus>> {
        if let ProcessState::Reaped(status) = self.state {
            return Ok(Some(status));
        }
        match self.child.try_wait() {
            Ok(Some(status)) => {
                debug!("Process {} exited with status: {}", self.pid, status);
                self.state = ProcessState::Reaped(status);
                Ok(Some(status))
            }
            Ok(None) => {
                if self.state == ProcessState::Spawned {
                    self.state = ProcessState::Running;
                }
                Ok(None)
            }
            Err(e) => Err(CoreError::ProcessWait(format!(
                "Failed to try_wait for process {}: {}",
                self.pid, e
            ))),
        }
    }

    /// Send `signal` to the whole process group.
    ///
    /// A group that no longer exists yields `SignalDeliveryError`, which
    /// callers tolerate.
    pub fn signal_group(&mut self, signal: Signal) -> Result<()> {
        debug!("Sending {} to process group {}", signal, self.pid);
        if !self.state.is_reaped() {
            self.state = ProcessState::SignalSent;
        }
        match killpg(self.pid, signal) {
            Ok(()) => Ok(()),
            Err(Errno::ESRCH) => Err(CoreError::SignalDeliveryError(format!(
                "process group {} already exited",
                self.pid
            ))),
            Err(e) => Err(CoreError::SignalDeliveryError(format!(
                "failed to send {} to process group {}: {}",
                signal, self.pid, e
            ))),
        }
    }

    /// Whether any member of the process group is still alive
    pub fn group_alive(&self) -> bool {
        // Signal 0 only checks existence and permissions
        match killpg(self.pid, Option::<Signal>::None) {
            Ok(()) => true,
            Err(Errno::EPERM) => true,
            Err(_) => false,
        }
    }

    /// Wait for the leader to exit, giving up after `timeout`
    pub async fn reap(&mut self, timeout: Duration) -> Result<ExitStatus> {
        if let ProcessState::Reaped(status) = self.state {
            return Ok(status);
        }
        match tokio::time::timeout(timeout, self.child.wait()).await {
            Ok(Ok(status)) => {
                debug!("Process {} reaped with status: {}", self.pid, status);
                self.state = ProcessState::Reaped(status);
                Ok(status)
            }
            Ok(Err(e)) => Err(CoreError::ProcessWait(format!(
                "Failed to wait for process {}: {}",
                self.pid, e
            ))),
            Err(_) => Err(CoreError::ProcessWait(format!(
                "Process {} was not reaped within {:?}",
                self.pid, timeout
            ))),
        }
    }
}

/// Launch `path` with the default options (output captured)
pub fn launch(path: impl AsRef<Path>, args: &[String]) -> Result<ProcessHandle> {
    launch_with(path, args, &LaunchOptions::default())
}

/// Launch `path` as the leader of a new session and process group.
///
/// Returns as soon as the OS has created the process. stdout/stderr are
/// drained into a bounded buffer or sent to `/dev/null`, never left as
/// unread pipes. Must be called from within a Tokio runtime.
pub fn launch_with(
    path: impl AsRef<Path>,
    args: &[String],
    options: &LaunchOptions,
) -> Result<ProcessHandle> {
    let path = path.as_ref();
    debug!("Launching process: {:?} {:?}", path, args);

    // Bare names are resolved through PATH by the spawn call itself
    if path.components().count() > 1 && !path.exists() {
        error!("Target executable {:?} does not exist", path);
        return Err(CoreError::LaunchError(format!(
            "Target executable {:?} does not exist",
            path
        )));
    }

    let mut command = Command::new(path);
    command.args(args);
    command.kill_on_drop(true);
    match options.output {
        OutputMode::Capture => {
            command.stdout(Stdio::piped());
            command.stderr(Stdio::piped());
        }
        OutputMode::Discard => {
            command.stdout(Stdio::null());
            command.stderr(Stdio::null());
        }
    }

    // Safety: setsid() is async-signal-safe and appropriate for use in pre_exec
    #[deny(unsafe_op_in_unsafe_fn)]
    unsafe {
        command.pre_exec(|| {
            if libc::setsid() == -1 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        });
    }

    let mut child = command.spawn().map_err(|e| {
        error!("Failed to spawn {:?}: {}", path, e);
        CoreError::LaunchError(format!("Failed to spawn {:?}: {}", path, e))
    })?;

    let raw_pid = child
        .id()
        .ok_or_else(|| CoreError::LaunchError("Spawned child did not have a PID".to_string()))?;
    let pid = Pid::from_raw(raw_pid as i32);

    let output = match options.output {
        OutputMode::Capture => {
            let mut capture = OutputCapture::new(options.output_capacity);
            if let Some(stdout) = child.stdout.take() {
                capture.attach(OutputStream::Stdout, stdout);
            }
            if let Some(stderr) = child.stderr.take() {
                capture.attach(OutputStream::Stderr, stderr);
            }
            Some(capture)
        }
        OutputMode::Discard => None,
    };

    info!("Launched {:?} as pid {} in a new process group", path, pid);
    Ok(ProcessHandle {
        pid,
        child,
        state: ProcessState::Spawned,
        output,
    })
}

/// Outcome of tearing down a process group
#[derive(Debug, Default)]
pub struct Termination {
    /// Exit status of the leader, if it was reaped
    pub status: Option<ExitStatus>,
    /// Whether SIGKILL had to be used
    pub escalated: bool,
    /// Non-fatal problems met on the way
    pub errors: Vec<CoreError>,
}

/// How long to wait for the reap after an interrupt forced SIGKILL
pub const FORCED_REAP_TIMEOUT: Duration = Duration::from_secs(1);

/// SIGTERM the group, reap the leader within `reap_timeout`, escalating per `policy`.
///
/// Never fails: a group that is already gone or a child that will not die is
/// recorded in [`Termination::errors`] and the caller carries on.
pub async fn terminate_group(
    handle: &mut ProcessHandle,
    reap_timeout: Duration,
    policy: EscalationPolicy,
) -> Termination {
    terminate_group_until(handle, reap_timeout, policy, std::future::pending()).await
}

/// Like [`terminate_group`], but `abort` completing while the reap after
/// SIGTERM is pending sends SIGKILL to the group straight away and reaps
/// within [`FORCED_REAP_TIMEOUT`], whatever `policy` says.
pub async fn terminate_group_until<F>(
    handle: &mut ProcessHandle,
    reap_timeout: Duration,
    policy: EscalationPolicy,
    abort: F,
) -> Termination
where
    F: Future<Output = ()>,
{
    tokio::pin!(abort);
    let mut outcome = Termination::default();

    if let Err(e) = handle.signal_group(Signal::SIGTERM) {
        debug!("{}", e);
        outcome.errors.push(e);
    }

    let reaped = tokio::select! {
        result = handle.reap(reap_timeout) => Some(result),
        _ = &mut abort => None,
    };

    match reaped {
        Some(Ok(status)) => outcome.status = Some(status),
        Some(Err(e)) => match policy {
            EscalationPolicy::Kill => {
                warn!(
                    "Process {} did not exit within {:?} of SIGTERM, using SIGKILL",
                    handle.pid, reap_timeout
                );
                kill_and_reap(handle, reap_timeout, &mut outcome).await;
            }
            EscalationPolicy::None => {
                warn!("{}; escalation disabled", e);
                outcome.errors.push(e);
            }
        },
        None => {
            warn!(
                "Interrupted while waiting for process {}, using SIGKILL",
                handle.pid
            );
            kill_and_reap(handle, FORCED_REAP_TIMEOUT, &mut outcome).await;
        }
    }

    // The leader may be gone while forked members ignored SIGTERM
    if policy == EscalationPolicy::Kill && outcome.status.is_some() {
        sweep_group(handle, &mut outcome).await;
    }

    outcome
}

async fn kill_and_reap(handle: &mut ProcessHandle, timeout: Duration, outcome: &mut Termination) {
    outcome.escalated = true;
    if let Err(e) = handle.signal_group(Signal::SIGKILL) {
        outcome.errors.push(e);
    }
    match handle.reap(timeout).await {
        Ok(status) => outcome.status = Some(status),
        Err(e) => {
            error!("{}", e);
            outcome.errors.push(e);
        }
    }
}

async fn sweep_group(handle: &mut ProcessHandle, outcome: &mut Termination) {
    const SWEEP_GRACE: Duration = Duration::from_millis(200);
    let start = tokio::time::Instant::now();
    while handle.group_alive() {
        if start.elapsed() >= SWEEP_GRACE {
            warn!("Process group {} outlived its leader, using SIGKILL", handle.pid);
            outcome.escalated = true;
            if let Err(e) = handle.signal_group(Signal::SIGKILL) {
                debug!("{}", e);
            }
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> Vec<String> {
        vec!["-c".to_string(), script.to_string()]
    }

    #[tokio::test]
    async fn test_launch_is_group_leader() {
        let mut handle = launch("/bin/sh", &sh("exit 0")).expect("Failed to launch sh");
        assert!(handle.pid() > 0);
        assert_eq!(handle.pid(), handle.pgid());
        assert_eq!(handle.state(), ProcessState::Spawned);
        let status = handle.reap(Duration::from_secs(5)).await.unwrap();
        assert!(status.success());
        assert!(handle.state().is_reaped());
    }

    #[tokio::test]
    async fn test_launch_missing_path() {
        let result = launch("/nonexistent/dir/nighthub", &[]);
        match result {
            Err(CoreError::LaunchError(msg)) => assert!(msg.contains("does not exist")),
            other => panic!("Expected LaunchError, got: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_launch_not_executable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plain.txt");
        std::fs::write(&path, "not a program").unwrap();
        assert!(matches!(launch(&path, &[]), Err(CoreError::LaunchError(_))));
    }

    #[tokio::test]
    async fn test_state_transitions() {
        let mut handle = launch("/bin/sh", &sh("sleep 10")).unwrap();
        assert_eq!(handle.try_status().unwrap(), None);
        assert_eq!(handle.state(), ProcessState::Running);

        handle.signal_group(Signal::SIGTERM).unwrap();
        assert_eq!(handle.state(), ProcessState::SignalSent);

        let status = handle.reap(Duration::from_secs(5)).await.unwrap();
        assert!(!status.success());
        assert_eq!(handle.state(), ProcessState::Reaped(status));
    }

    #[tokio::test]
    async fn test_signal_after_exit_is_tolerated() {
        let mut handle = launch("/bin/sh", &sh("exit 3")).unwrap();
        let status = handle.reap(Duration::from_secs(5)).await.unwrap();
        assert_eq!(status.code(), Some(3));

        let err = handle.signal_group(Signal::SIGTERM).unwrap_err();
        assert!(err.is_tolerated());
        // Reaped stays terminal
        assert!(handle.state().is_reaped());
    }

    #[tokio::test]
    async fn test_reap_is_bounded() {
        let mut handle = launch("/bin/sh", &sh("trap '' TERM; sleep 10")).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        let _ = handle.signal_group(Signal::SIGTERM);
        let err = handle.reap(Duration::from_millis(200)).await.unwrap_err();
        assert!(matches!(err, CoreError::ProcessWait(_)));
        let _ = handle.signal_group(Signal::SIGKILL);
        handle.reap(Duration::from_secs(5)).await.unwrap();
    }

    #[tokio::test]
    async fn test_terminate_escalates_to_kill() {
        let mut handle = launch("/bin/sh", &sh("trap '' TERM; sleep 10")).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        let outcome =
            terminate_group(&mut handle, Duration::from_millis(200), EscalationPolicy::Kill).await;
        assert!(outcome.escalated);
        assert!(outcome.status.is_some());
        assert!(handle.state().is_reaped());
    }

    #[tokio::test]
    async fn test_terminate_without_escalation_records_wait_error() {
        let mut handle = launch("/bin/sh", &sh("trap '' TERM; sleep 10")).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        let outcome =
            terminate_group(&mut handle, Duration::from_millis(200), EscalationPolicy::None).await;
        assert!(!outcome.escalated);
        assert!(outcome.status.is_none());
        assert!(outcome
            .errors
            .iter()
            .any(|e| matches!(e, CoreError::ProcessWait(_))));
        let _ = handle.signal_group(Signal::SIGKILL);
        handle.reap(Duration::from_secs(5)).await.unwrap();
    }

    #[tokio::test]
    async fn test_abort_during_reap_forces_kill() {
        let mut handle = launch("/bin/sh", &sh("trap '' TERM; sleep 10")).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let start = std::time::Instant::now();
        let outcome = terminate_group_until(
            &mut handle,
            Duration::from_secs(10),
            EscalationPolicy::None,
            tokio::time::sleep(Duration::from_millis(200)),
        )
        .await;
        assert!(start.elapsed() < Duration::from_secs(3), "took {:?}", start.elapsed());
        assert!(outcome.escalated);
        assert!(outcome.status.is_some());
        assert!(handle.state().is_reaped());
    }

    #[tokio::test]
    async fn test_abort_after_reap_is_ignored() {
        let mut handle = launch("/bin/sh", &sh("sleep 10")).unwrap();
        let outcome = terminate_group_until(
            &mut handle,
            Duration::from_secs(5),
            EscalationPolicy::Kill,
            tokio::time::sleep(Duration::from_secs(30)),
        )
        .await;
        assert!(!outcome.escalated);
        assert!(outcome.status.is_some());
    }

    #[tokio::test]
    async fn test_captured_output() {
        let mut handle = launch("/bin/sh", &sh("echo out; echo err 1>&2")).unwrap();
        let capture = handle.take_output().expect("output captured by default");
        handle.reap(Duration::from_secs(5)).await.unwrap();
        let (lines, dropped) = capture.finish(Duration::from_secs(1)).await;
        assert_eq!(dropped, 0);
        assert!(lines
            .iter()
            .any(|l| l.stream == OutputStream::Stdout && l.content == "out"));
        assert!(lines
            .iter()
            .any(|l| l.stream == OutputStream::Stderr && l.content == "err"));
    }

    #[tokio::test]
    async fn test_discarded_output() {
        let options = LaunchOptions {
            output: OutputMode::Discard,
            output_capacity: 1,
        };
        let mut handle = launch_with("/bin/sh", &sh("echo ignored"), &options).unwrap();
        assert!(handle.take_output().is_none());
        assert!(handle.reap(Duration::from_secs(5)).await.unwrap().success());
    }
}
