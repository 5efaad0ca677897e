//! Signals as readiness: SIGCHLD and the termination signals arrive through a
//! signalfd registered with the loop; SIGPIPE is only blocked.

use nix::errno::Errno;
use nix::sys::signal::{self, SigHandler, SigSet, SigmaskHow, Signal};
use nix::sys::signalfd::{SfdFlags, SignalFd};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use tracing::{debug, warn};

fn watched() -> SigSet {
    let mut set = SigSet::empty();
    set.add(Signal::SIGCHLD);
    set.add(Signal::SIGINT);
    set.add(Signal::SIGTERM);
    set
}

/// Blocks the watched signals plus SIGPIPE for the calling thread and opens
/// a non-blocking signalfd for the watched ones. Call before any other thread
/// or child exists.
pub fn install() -> Result<SignalFd, Errno> {
    let mut blocked = watched();
    blocked.add(Signal::SIGPIPE);
    blocked.thread_block()?;
    SignalFd::with_flags(&watched(), SfdFlags::SFD_NONBLOCK | SfdFlags::SFD_CLOEXEC)
}

/// Run in a forked child right before exec: empty signal mask, default
/// SIGPIPE disposition. Async-signal-safe.
pub fn restore_child_defaults() -> Result<(), Errno> {
    signal::sigprocmask(SigmaskHow::SIG_SETMASK, Some(&SigSet::empty()), None)?;
    // SAFETY: resetting to SIG_DFL installs no Rust handler.
    unsafe { signal::signal(Signal::SIGPIPE, SigHandler::SigDfl) }?;
    Ok(())
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct Drain {
    pub reaped: usize,
    /// Last termination signal seen, if any.
    pub shutdown: Option<Signal>,
    /// A budget ran out; call again.
    pub exhausted: bool,
}

/// Reads up to `budget` pending signal records, then reaps exited children.
pub fn drain(sfd: &mut SignalFd, budget: usize, reap_budget: usize) -> Result<Drain, Errno> {
    let mut out = Drain::default();
    let mut read = 0;
    loop {
        if read == budget {
            out.exhausted = true;
            break;
        }
        let Some(info) = sfd.read_signal()? else { break };
        read += 1;
        match Signal::try_from(info.ssi_signo as i32) {
            Ok(Signal::SIGCHLD) => {}
            Ok(sig @ (Signal::SIGINT | Signal::SIGTERM)) => out.shutdown = Some(sig),
            other => debug!(signal = ?other, "ignoring signal"),
        }
    }
    // SIGCHLD coalesces, so every drain reaps whatever has exited
    let (reaped, more) = reap(reap_budget);
    out.reaped = reaped;
    out.exhausted |= more;
    Ok(out)
}

/// Non-blocking `waitpid(-1)` loop. Returns the number reaped and whether the
/// budget stopped it early.
pub fn reap(budget: usize) -> (usize, bool) {
    let mut reaped = 0;
    while reaped < budget {
        match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) | Err(Errno::ECHILD) => return (reaped, false),
            Ok(status) => {
                debug!(?status, "child reaped");
                reaped += 1;
            }
            Err(Errno::EINTR) => continue,
            Err(e) => {
                warn!(error = %e, "waitpid failed");
                return (reaped, false);
            }
        }
    }
    (reaped, true)
}
