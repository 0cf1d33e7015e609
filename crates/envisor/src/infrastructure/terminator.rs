use std::sync::Arc;
use std::thread;
use std::time::Duration;
use std::time::Instant;

use utils::process::send_signal;
use utils::process::ProcessProbe;
use utils::process::ProcfsProbe;
use utils::process::Signal;

/// Set to `0` or `false` to log terminations instead of signalling
pub const TERMINATE_PROCESSES_ENV_VAR: &str = "ENVISOR_TERMINATE_PROCESSES";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminationOutcome {
    /// Exited after the graceful signal
    Terminated,
    /// Needed the forced signal
    Killed,
    /// Was already gone, or the pid now belongs to another process
    AlreadyGone,
    /// Dry run; nothing was signalled
    Skipped,
    Failed(String),
}

impl TerminationOutcome {
    /// Whether the targeted process is known not to run anymore
    pub fn is_gone(&self) -> bool {
        matches!(self, Self::Terminated | Self::Killed | Self::AlreadyGone)
    }
}

pub trait Terminator: Send + Sync {
    /// Stops the process `pid`.
    ///
    /// With `start_token` set, nothing is signalled unless the live process
    /// still has that token.
    fn terminate(&self, pid: u32, start_token: Option<u64>) -> TerminationOutcome;
}

impl<T: Terminator + ?Sized> Terminator for Arc<T> {
    fn terminate(&self, pid: u32, start_token: Option<u64>) -> TerminationOutcome {
        (**self).terminate(pid, start_token)
    }
}

/// Signals local processes: SIGTERM, a bounded wait, then SIGKILL
pub struct LocalTerminator {
    probe: Arc<dyn ProcessProbe>,
    grace: Duration,
    poll_interval: Duration,
    dry_run: bool,
}

impl LocalTerminator {
    pub fn new(grace: Duration, dry_run: bool) -> Self {
        Self {
            probe: Arc::new(ProcfsProbe),
            grace,
            poll_interval: Duration::from_millis(50),
            dry_run,
        }
    }

    pub fn with_probe(mut self, probe: Arc<dyn ProcessProbe>) -> Self {
        self.probe = probe;
        self
    }

    /// Whether the environment asks for a dry run
    pub fn dry_run_from_env() -> bool {
        std::env::var(TERMINATE_PROCESSES_ENV_VAR)
            .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "0" | "false" | "no"))
            .unwrap_or(false)
    }

    fn wait_for_exit(&self, pid: u32, token: u64) -> bool {
        let deadline = Instant::now() + self.grace;
        loop {
            if !self.probe.is_alive(pid, token) {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            thread::sleep(self.poll_interval.min(deadline - now));
        }
    }
}

impl Terminator for LocalTerminator {
    fn terminate(&self, pid: u32, start_token: Option<u64>) -> TerminationOutcome {
        let Some(token) = self.probe.start_token(pid) else {
            return TerminationOutcome::AlreadyGone;
        };
        if start_token.is_some_and(|expected| expected != token) {
            tracing::info!(pid, "pid was recycled, not terminating");
            return TerminationOutcome::AlreadyGone;
        }

        if self.dry_run {
            tracing::info!(pid, "dry run, would terminate process");
            return TerminationOutcome::Skipped;
        }

        match send_signal(pid, Signal::Terminate) {
            Ok(true) => {}
            Ok(false) => return TerminationOutcome::AlreadyGone,
            Err(e) => return TerminationOutcome::Failed(format!("SIGTERM failed: {e}")),
        }
        if self.wait_for_exit(pid, token) {
            return TerminationOutcome::Terminated;
        }

        // the pid might have been reused while we waited
        if !self.probe.is_alive(pid, token) {
            return TerminationOutcome::Terminated;
        }
        tracing::warn!(pid, grace = ?self.grace, "process ignored SIGTERM, killing");
        match send_signal(pid, Signal::Kill) {
            Ok(true) => {
                if self.wait_for_exit(pid, token) {
                    TerminationOutcome::Killed
                } else {
                    TerminationOutcome::Failed("process survived SIGKILL".to_string())
                }
            }
            Ok(false) => TerminationOutcome::Terminated,
            Err(e) => TerminationOutcome::Failed(format!("SIGKILL failed: {e}")),
        }
    }
}
