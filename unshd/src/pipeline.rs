//! Pipeline spawner: fork/exec a chain of stages wired with pipes.
//!
//! Every descriptor opened here is an `OwnedFd` (or `File`) created with
//! `O_CLOEXEC`, so any early return closes everything opened so far, and
//! children only keep what was explicitly installed on 0/1/2. Stage argv
//! pointers and error prefixes are built before `fork`, so the child does no
//! allocation before `exec`.

use std::ffi::CString;
use std::ptr;
use std::fs::{File, OpenOptions};
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::os::unix::fs::OpenOptionsExt;

use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::unistd::{close, dup2, fork, pipe2, ForkResult, Pid};
use tracing::debug;

use crate::cmdline::Command;
use crate::error::SpawnError;
use crate::reaper;

/// What the loop keeps after a successful spawn.
#[derive(Debug)]
pub struct Spawned {
    /// Read end of the tail pipe (non-blocking): stdout of the last stage
    /// unless redirected, and stderr of every stage.
    pub output: File,
    /// Write end of the head pipe, when stage 0 is not reading a file.
    pub stdin: Option<OwnedFd>,
    pub pids: Vec<Pid>,
}

struct Stage {
    /// Owns the strings `ptrs` points into.
    _argv: Vec<CString>,
    /// NULL-terminated pointers into `argv`, built before fork so exec needs
    /// no allocation in the child.
    ptrs: Vec<*const libc::c_char>,
    /// `unshd: <prog>: `, prebuilt so the child can report exec failure
    /// without allocating.
    exec_error: Vec<u8>,
}

fn prepare(words: &[String]) -> Result<Stage, SpawnError> {
    let argv = words
        .iter()
        .map(|w| CString::new(w.as_bytes()).map_err(|_| SpawnError::InvalidArgument(w.clone())))
        .collect::<Result<Vec<_>, _>>()?;
    let ptrs = argv.iter().map(|a| a.as_ptr()).chain(std::iter::once(ptr::null())).collect();
    let prog = words.first().map(String::as_str).unwrap_or_default();
    Ok(Stage { _argv: argv, ptrs, exec_error: format!("unshd: {prog}: ").into_bytes() })
}

/// Starts every stage of `cmd` and returns without waiting for any of them.
/// A command with no stages starts nothing and returns `Ok(None)`.
pub fn spawn(cmd: &Command) -> Result<Option<Spawned>, SpawnError> {
    if cmd.is_empty() {
        return Ok(None);
    }
    let stages = cmd.stages.iter().map(|s| prepare(s)).collect::<Result<Vec<_>, _>>()?;

    let (stdin_src, head): (OwnedFd, Option<OwnedFd>) = match &cmd.input {
        Some(path) => {
            let f = File::open(path).map_err(|source| SpawnError::OpenInput { path: path.clone(), source })?;
            (f.into(), None)
        }
        None => {
            let (r, w) = pipe2(OFlag::O_CLOEXEC).map_err(SpawnError::Pipe)?;
            (r, Some(w))
        }
    };
    let out_file: Option<OwnedFd> = match &cmd.output {
        Some(path) => {
            let f = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .mode(0o666)
                .open(path)
                .map_err(|source| SpawnError::OpenOutput { path: path.clone(), source })?;
            Some(f.into())
        }
        None => None,
    };
    let (tail_r, tail_w) = pipe2(OFlag::O_CLOEXEC).map_err(SpawnError::Pipe)?;
    // only the daemon's end; the children's end stays blocking
    fcntl(tail_r.as_raw_fd(), FcntlArg::F_SETFL(OFlag::O_NONBLOCK)).map_err(SpawnError::Pipe)?;

    let mut upstream = stdin_src;
    let mut pids = Vec::with_capacity(stages.len());
    for (i, stage) in stages.iter().enumerate() {
        let last = i + 1 == stages.len();
        let downstream = if last { None } else { Some(pipe2(OFlag::O_CLOEXEC).map_err(SpawnError::Pipe)?) };
        let stdout = match (&downstream, &out_file) {
            (Some((_, w)), _) => w.as_raw_fd(),
            (None, Some(f)) => f.as_raw_fd(),
            (None, None) => tail_w.as_raw_fd(),
        };
        let mut opened = vec![upstream.as_raw_fd(), tail_r.as_raw_fd(), tail_w.as_raw_fd()];
        opened.extend(head.as_ref().map(AsRawFd::as_raw_fd));
        opened.extend(out_file.as_ref().map(AsRawFd::as_raw_fd));
        if let Some((r, w)) = &downstream {
            opened.push(r.as_raw_fd());
            opened.push(w.as_raw_fd());
        }

        // SAFETY: the child only calls async-signal-safe functions before exec.
        match unsafe { fork() } {
            Ok(ForkResult::Child) => exec_stage(stage, upstream.as_raw_fd(), stdout, tail_w.as_raw_fd(), &opened),
            Ok(ForkResult::Parent { child }) => pids.push(child),
            Err(e) => return Err(SpawnError::Fork(e)),
        }

        // the parent keeps only the read end feeding the next stage
        upstream = match downstream {
            Some((r, w)) => {
                drop(w);
                r
            }
            None => break,
        };
    }
    debug!(stages = stages.len(), ?pids, "pipeline forked");
    Ok(Some(Spawned { output: File::from(tail_r), stdin: head, pids }))
}

/// Copies a source that sits on 0, 1 or 2 above them, so installing one
/// stdio slot never overwrites the source of another.
fn lift(fd: RawFd) -> Result<RawFd, Errno> {
    if fd > 2 {
        return Ok(fd);
    }
    fcntl(fd, FcntlArg::F_DUPFD_CLOEXEC(3))
}

fn wire(stdin: RawFd, stdout: RawFd, stderr: RawFd) -> Result<(), Errno> {
    let (stdin, stdout, stderr) = (lift(stdin)?, lift(stdout)?, lift(stderr)?);
    dup2(stdin, 0)?;
    dup2(stdout, 1)?;
    dup2(stderr, 2)?;
    Ok(())
}

fn exec_stage(stage: &Stage, stdin: RawFd, stdout: RawFd, stderr: RawFd, opened: &[RawFd]) -> ! {
    if let Err(e) = wire(stdin, stdout, stderr) {
        die(b"unshd: cannot set up stdio: ", e);
    }
    for &fd in opened {
        if fd > 2 {
            let _ = close(fd);
        }
    }
    if let Err(e) = reaper::restore_child_defaults() {
        die(b"unshd: cannot reset signals: ", e);
    }
    // SAFETY: `ptrs` is NULL-terminated and points into the live `argv`.
    unsafe { libc::execvp(stage.ptrs[0], stage.ptrs.as_ptr()) };
    die(&stage.exec_error, Errno::last())
}

fn die(prefix: &[u8], err: Errno) -> ! {
    let reason = err.desc().as_bytes();
    // SAFETY: plain writes of live buffers to stderr, then _exit.
    unsafe {
        libc::write(2, prefix.as_ptr().cast(), prefix.len());
        libc::write(2, reason.as_ptr().cast(), reason.len());
        libc::write(2, b"\n".as_ptr().cast(), 1);
        libc::_exit(127)
    }
}
