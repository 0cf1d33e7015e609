//! Process identity and liveness from the proc filesystem.
//!
//! A pid alone is not a stable identity: the kernel recycles pids. Every
//! process is therefore identified by `(pid, start_token)`, where the start
//! token is the `starttime` field of `/proc/<pid>/stat` (clock ticks after
//! boot). A recycled pid yields a different token.

use std::fs;
use std::io;

/// Source of process liveness facts
pub trait ProcessProbe: Send + Sync {
    /// Start token of a live process, `None` when it does not exist or is a zombie.
    fn start_token(&self, pid: u32) -> Option<u64>;

    /// Whether the exact process `(pid, start_token)` is still running.
    fn is_alive(&self, pid: u32, start_token: u64) -> bool {
        self.start_token(pid) == Some(start_token)
    }
}

impl<T: ProcessProbe + ?Sized> ProcessProbe for std::sync::Arc<T> {
    fn start_token(&self, pid: u32) -> Option<u64> {
        (**self).start_token(pid)
    }
}

/// [`ProcessProbe`] backed by `/proc`
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcfsProbe;

impl ProcessProbe for ProcfsProbe {
    fn start_token(&self, pid: u32) -> Option<u64> {
        read_start_token(pid)
    }
}

/// Reads the start token of `pid` from `/proc/<pid>/stat`.
pub fn read_start_token(pid: u32) -> Option<u64> {
    let stat = fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
    let (state, start_token) = parse_stat(&stat)?;
    (state != 'Z' && state != 'X').then_some(start_token)
}

/// Start token of the calling process.
pub fn current_start_token() -> Option<u64> {
    read_start_token(std::process::id())
}

/// Extracts `(state, starttime)` from the content of a stat file.
///
/// The command name is wrapped in parentheses and may itself contain spaces
/// and parentheses, so fields are counted from the last `)`.
pub fn parse_stat(stat: &str) -> Option<(char, u64)> {
    let rest = &stat[stat.rfind(')')? + 1..];
    let mut fields = rest.split_whitespace();

    // field 3 is the state, field 22 the start time
    let state = fields.next()?.chars().next()?;
    let start_token = fields.nth(18)?.parse().ok()?;
    Some((state, start_token))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Terminate,
    Kill,
}

/// Sends `signal` to `pid`.
///
/// Returns `Ok(false)` if the process no longer exists.
pub fn send_signal(pid: u32, signal: Signal) -> io::Result<bool> {
    let signo = match signal {
        Signal::Terminate => libc::SIGTERM,
        Signal::Kill => libc::SIGKILL,
    };
    let pid = libc::pid_t::try_from(pid)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "pid out of range"))?;

    // SAFETY: kill has no memory-safety preconditions.
    if unsafe { libc::kill(pid, signo) } == 0 {
        return Ok(true);
    }

    let err = io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        Ok(false)
    } else {
        Err(err)
    }
}
