/// Child-process lifecycle: spawn with verbosity-based output routing,
/// on-demand liveness polling, and a bounded terminate/kill escalation
/// on stop.
use crate::output::OutputMode;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::process::{Child, Command};

/// Grace period between a stop request and the forceful kill of a child
/// that has not exited on its own.
pub const ESCALATION_TIMEOUT: Duration = Duration::from_secs(5);

/// Error returned by [`Supervisor::try_start`] when the child cannot be spawned.
#[derive(Debug)]
pub struct StartError {
    /// The executable that failed to launch.
    pub program: PathBuf,
    /// Underlying OS error.
    pub source: std::io::Error,
}

impl std::fmt::Display for StartError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "failed to spawn {}: {}",
            self.program.display(),
            self.source
        )
    }
}

impl std::error::Error for StartError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.source)
    }
}

/// Supervises at most one child process at a time.
///
/// `start` replaces any previous child (stopping it first), `stop` puts the
/// current child on a terminate/kill escalation path without blocking, and
/// `is_running` answers with a fresh poll of OS process state. All three
/// serialize through an internal mutex, so a `Supervisor` can be shared
/// across threads. Dropping the supervisor stops its child.
pub struct Supervisor {
    program: PathBuf,
    output_mode: Option<OutputMode>,
    child: Mutex<Option<Child>>,
}

impl Supervisor {
    /// Create a supervisor for the given executable.
    ///
    /// Output routing is resolved from the ambient tracing verbosity at each
    /// [`start`](Self::start): debug enabled for the `procwarden` target
    /// forwards the child's stdout/stderr, anything coarser discards them.
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            output_mode: None,
            child: Mutex::new(None),
        }
    }

    /// Create a supervisor with a fixed output mode instead of consulting
    /// the ambient verbosity.
    pub fn with_output_mode(program: impl Into<PathBuf>, mode: OutputMode) -> Self {
        Self {
            program: program.into(),
            output_mode: Some(mode),
            child: Mutex::new(None),
        }
    }

    /// The executable this supervisor launches.
    pub fn program(&self) -> &Path {
        &self.program
    }

    /// OS id of the tracked child, if one is tracked and not yet reaped.
    pub fn pid(&self) -> Option<u32> {
        self.lock().as_ref().and_then(Child::id)
    }

    /// Launch the child with the given arguments, fire-and-forget.
    ///
    /// Any previous child is stopped first, so at most one child is ever
    /// attributable to this supervisor. A spawn failure is logged and NOT
    /// returned; callers that need launch confirmation poll
    /// [`is_running`](Self::is_running) or use [`try_start`](Self::try_start).
    pub fn start<I, S>(&self, args: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        if let Err(e) = self.try_start(args) {
            tracing::warn!(error = %e, "child launch failed");
        }
    }

    /// Like [`start`](Self::start), but surfaces the spawn error.
    pub fn try_start<I, S>(&self, args: I) -> Result<(), StartError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.stop();

        let mut slot = self.lock();
        let mode = self.output_mode.unwrap_or_else(OutputMode::from_ambient);

        tracing::debug!(
            program = %self.program.display(),
            ?mode,
            "spawning child"
        );

        let mut cmd = Command::new(&self.program);
        cmd.args(args)
            .stdout(mode.stdio())
            .stderr(mode.stdio())
            // Last-resort backstop: a handle that never reaches the
            // escalation path (runtime torn down mid-stop) still kills
            // its process when dropped.
            .kill_on_drop(true);

        let child = cmd.spawn().map_err(|e| StartError {
            program: self.program.clone(),
            source: e,
        })?;

        tracing::info!(pid = ?child.id(), program = %self.program.display(), "child started");
        *slot = Some(child);
        Ok(())
    }

    /// Request termination of the tracked child, without blocking.
    ///
    /// No child, or a child that already exited, is released synchronously.
    /// A running child is handed off to a background task that gives it
    /// [`ESCALATION_TIMEOUT`] to exit on its own before terminating and
    /// killing it. The tracked reference is cleared before this returns
    /// either way.
    pub fn stop(&self) {
        let mut slot = self.lock();
        let Some(mut child) = slot.take() else {
            return;
        };

        match child.try_wait() {
            Ok(Some(status)) => {
                tracing::debug!(%status, "child already exited, releasing handle");
            }
            Err(e) => {
                tracing::warn!(error = %e, "could not query child state, releasing handle");
            }
            Ok(None) => match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    // The task becomes the handle's sole owner; nothing it
                    // does races with the slot this supervisor guards.
                    handle.spawn(escalate(child));
                }
                Err(_) => {
                    // No runtime to arm the delayed escalation on.
                    tracing::warn!(
                        pid = ?child.id(),
                        "no runtime for delayed escalation, killing child now"
                    );
                    if let Err(e) = child.start_kill() {
                        tracing::warn!(error = %e, "kill failed");
                    }
                }
            },
        }
    }

    /// Whether the tracked child is currently running.
    ///
    /// Exit notifications are asynchronous, so this refreshes the OS state
    /// with a zero-timeout poll before answering. An observed exit releases
    /// the handle.
    pub fn is_running(&self) -> bool {
        let mut slot = self.lock();
        let Some(child) = slot.as_mut() else {
            return false;
        };

        match child.try_wait() {
            Ok(None) => true,
            Ok(Some(status)) => {
                tracing::debug!(%status, "child exit observed, releasing handle");
                *slot = None;
                false
            }
            Err(e) => {
                tracing::warn!(error = %e, "could not query child state, releasing handle");
                *slot = None;
                false
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<Child>> {
        // A panicking thread must not wedge the supervisor.
        self.child.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Background owner of a stopping child: wait out the grace period, then
/// terminate and kill if the child is still around. Reaps the process in
/// both outcomes.
async fn escalate(mut child: Child) {
    let pid = child.id();
    match tokio::time::timeout(ESCALATION_TIMEOUT, child.wait()).await {
        Ok(Ok(status)) => {
            tracing::debug!(?pid, %status, "child exited before escalation");
        }
        Ok(Err(e)) => {
            tracing::warn!(?pid, error = %e, "wait on stopping child failed");
        }
        Err(_) => {
            tracing::warn!(?pid, "process still running, terminating it now");
            terminate(&child);
            if let Err(e) = child.start_kill() {
                tracing::warn!(?pid, error = %e, "kill failed");
            }
            let _ = child.wait().await;
        }
    }
}

/// Graceful termination request: SIGTERM on Unix. Other platforms have no
/// portable equivalent and rely on the kill that follows.
#[cfg(unix)]
fn terminate(child: &Child) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let Some(pid) = child.id() else {
        return;
    };
    if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
        tracing::warn!(%pid, error = %e, "failed to send SIGTERM");
    }
}

#[cfg(not(unix))]
fn terminate(_child: &Child) {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    /// Poll `is_running` until it reports false or the timeout elapses.
    async fn settles_not_running(sup: &Supervisor, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if !sup.is_running() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        false
    }

    /// Whether a pid refers to a live (or zombie) process.
    #[cfg(unix)]
    fn pid_alive(pid: u32) -> bool {
        use nix::sys::signal::kill;
        use nix::unistd::Pid;
        kill(Pid::from_raw(pid as i32), None).is_ok()
    }

    /// Poll until the pid is gone from the OS or the timeout elapses.
    #[cfg(unix)]
    async fn pid_gone_within(pid: u32, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if !pid_alive(pid) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        false
    }

    #[tokio::test]
    async fn test_is_running_before_any_start() {
        let sup = Supervisor::new("sleep");
        assert!(!sup.is_running());
        assert_eq!(sup.pid(), None);
    }

    #[tokio::test]
    async fn test_stop_without_start_is_noop() {
        let sup = Supervisor::new("sleep");
        sup.stop();
        sup.stop();
        assert!(!sup.is_running());
    }

    #[tokio::test]
    async fn test_program_accessor() {
        let sup = Supervisor::new("/usr/bin/true");
        assert_eq!(sup.program(), Path::new("/usr/bin/true"));
    }

    #[tokio::test]
    async fn test_start_then_running() {
        let sup = Supervisor::with_output_mode("sleep", OutputMode::Discard);
        sup.try_start(["5"]).unwrap();

        assert!(sup.is_running());
        assert!(sup.pid().is_some());

        sup.stop();
    }

    #[tokio::test]
    async fn test_stop_clears_tracked_reference_immediately() {
        let sup = Supervisor::with_output_mode("sleep", OutputMode::Discard);
        sup.try_start(["30"]).unwrap();
        assert!(sup.is_running());

        sup.stop();
        // Fire-and-forget: the reference is gone even though OS-level
        // teardown is still in flight.
        assert!(!sup.is_running());
        assert_eq!(sup.pid(), None);
    }

    #[tokio::test]
    async fn test_natural_exit_observed_without_stop() {
        let sup = Supervisor::with_output_mode("sh", OutputMode::Discard);
        sup.try_start(["-c", "exit 0"]).unwrap();

        assert!(settles_not_running(&sup, Duration::from_secs(2)).await);
        assert_eq!(sup.pid(), None);
    }

    #[tokio::test]
    async fn test_stop_after_child_already_exited() {
        let sup = Supervisor::with_output_mode("sh", OutputMode::Discard);
        sup.try_start(["-c", "exit 7"]).unwrap();

        assert!(settles_not_running(&sup, Duration::from_secs(2)).await);
        // Not an error: treated as the normal not-running branch.
        sup.stop();
        assert!(!sup.is_running());
    }

    #[tokio::test]
    async fn test_try_start_spawn_failure() {
        let sup = Supervisor::new("nonexistent-binary-xyz");
        let err = sup.try_start(["--flag"]).unwrap_err();
        assert!(err.to_string().contains("failed to spawn"));
        assert!(err.source.kind() == std::io::ErrorKind::NotFound);
        assert!(!sup.is_running());
    }

    #[tokio::test]
    async fn test_start_swallows_spawn_failure() {
        let sup = Supervisor::new("nonexistent-binary-xyz");
        // Fire-and-forget contract: no panic, no child.
        sup.start(["--flag"]);
        assert!(!sup.is_running());
    }

    #[cfg(unix)]
    #[tokio::test(flavor = "multi_thread")]
    async fn test_restart_replaces_previous_child() {
        let sup = Supervisor::with_output_mode("sleep", OutputMode::Discard);
        sup.try_start(["30"]).unwrap();
        let first_pid = sup.pid().unwrap();

        sup.try_start(["30"]).unwrap();
        let second_pid = sup.pid().unwrap();
        assert_ne!(first_pid, second_pid);
        assert!(sup.is_running());

        // The first child was put on the escalation path and must be gone
        // within the grace period plus slack.
        assert!(pid_gone_within(first_pid, ESCALATION_TIMEOUT + Duration::from_secs(2)).await);
        assert!(sup.is_running());

        sup.stop();
    }

    #[cfg(unix)]
    #[tokio::test(flavor = "multi_thread")]
    async fn test_child_exiting_in_grace_window_is_reaped_quickly() {
        let sup = Supervisor::with_output_mode("sh", OutputMode::Discard);
        sup.try_start(["-c", "sleep 0.2"]).unwrap();
        let pid = sup.pid().unwrap();

        sup.stop();
        // Exits on its own well before the timer fires; the escalation task
        // reaps it without killing.
        assert!(pid_gone_within(pid, Duration::from_secs(2)).await);
    }

    #[cfg(unix)]
    #[tokio::test(flavor = "multi_thread")]
    async fn test_stop_escalates_to_kill() {
        let sup = Supervisor::with_output_mode("sleep", OutputMode::Discard);
        sup.try_start(["30"]).unwrap();
        let pid = sup.pid().unwrap();
        assert!(pid_alive(pid));

        sup.stop();
        assert!(!sup.is_running());

        // Still alive during most of the grace period.
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(pid_alive(pid));

        // Gone once the escalation has fired and the task reaped it.
        assert!(pid_gone_within(pid, ESCALATION_TIMEOUT + Duration::from_secs(2)).await);
    }

    #[cfg(unix)]
    #[tokio::test(flavor = "multi_thread")]
    async fn test_drop_stops_child() {
        let sup = Supervisor::with_output_mode("sleep", OutputMode::Discard);
        sup.try_start(["30"]).unwrap();
        let pid = sup.pid().unwrap();

        drop(sup);
        assert!(pid_gone_within(pid, ESCALATION_TIMEOUT + Duration::from_secs(2)).await);
    }
}
