//! unsh: terminal relay for unshd. Lines typed on stdin go to the daemon,
//! whatever the daemon sends back goes to stdout.

use std::io::{self, ErrorKind, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::os::unix::io::{AsRawFd, RawFd};
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use nix::errno::Errno;
use nix::unistd::read as nread;
use tracing::debug;

const DEFAULT_PORT: u16 = 25252;
const BUF_SIZE: usize = 4096;
/// Stop reading stdin while this much is still waiting for the socket.
const PENDING_LIMIT: usize = 64 * 1024;

#[derive(Parser, Debug)]
#[command(name = "unsh", version)]
struct Args {
    /// Daemon host; asked for interactively when omitted.
    host: Option<String>,

    #[arg(long, short = 'p', default_value_t = DEFAULT_PORT)]
    port: u16,

    /// After stdin ends, keep printing daemon output until it has been
    /// silent this long.
    #[arg(long, default_value_t = 500)]
    linger_ms: u64,

    #[arg(long, short = 'v')]
    verbose: bool,
}

fn init_tracing(verbose: bool) {
    use tracing_subscriber::EnvFilter;

    let filter = if verbose { EnvFilter::new("debug") } else { EnvFilter::from_default_env() };
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(io::stderr).init();
}

fn ask_host() -> Result<Option<String>> {
    if atty::is(atty::Stream::Stdin) {
        print!("Enter hostname: ");
        io::stdout().flush()?;
    }
    // byte at a time: buffered stdin would swallow what follows the name
    let mut name = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        match nread(0, &mut byte) {
            Ok(0) => break,
            Ok(_) if byte[0] == b'\n' => break,
            Ok(_) => name.push(byte[0]),
            Err(Errno::EINTR) => {}
            Err(e) => return Err(e).context("read hostname"),
        }
    }
    let name = String::from_utf8_lossy(&name).trim().to_string();
    Ok(if name.is_empty() { None } else { Some(name) })
}

/// Resolves and connects. `Ok(None)` means the name did not resolve.
fn connect(host: &str, port: u16) -> Result<Option<TcpStream>> {
    let addrs: Vec<_> = match (host, port).to_socket_addrs() {
        Ok(a) => a.collect(),
        Err(e) => {
            debug!(host, error = %e, "resolve failed");
            return Ok(None);
        }
    };
    if addrs.is_empty() {
        return Ok(None);
    }
    let mut last = None;
    for addr in &addrs {
        match TcpStream::connect(addr) {
            Ok(s) => {
                debug!(%addr, "connected");
                return Ok(Some(s));
            }
            Err(e) => last = Some(e),
        }
    }
    match last {
        Some(e) => Err(e).context(format!("cannot connect to {host}:{port}")),
        None => Ok(None),
    }
}

fn write_stdout(data: &[u8]) -> Result<()> {
    let mut out = io::stdout().lock();
    out.write_all(data)?;
    out.flush()?;
    Ok(())
}

/// Bytes from stdin the socket has not taken yet.
struct Pending {
    buf: Vec<u8>,
}

impl Pending {
    fn flush(&mut self, sock: &mut TcpStream) -> Result<()> {
        while !self.buf.is_empty() {
            match sock.write(&self.buf) {
                Ok(0) => bail!("daemon stopped accepting data"),
                Ok(n) => {
                    self.buf.drain(..n);
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => return Err(e).context("write to daemon"),
            }
        }
        Ok(())
    }
}

enum SockRead {
    Open,
    Closed,
}

fn drain_socket(sock: &mut TcpStream, buf: &mut [u8]) -> Result<SockRead> {
    loop {
        match sock.read(buf) {
            Ok(0) => return Ok(SockRead::Closed),
            Ok(n) => write_stdout(&buf[..n])?,
            Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(SockRead::Open),
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) if e.kind() == ErrorKind::ConnectionReset => return Ok(SockRead::Closed),
            Err(e) => return Err(e).context("read from daemon"),
        }
    }
}

fn relay(mut sock: TcpStream, linger: Duration) -> Result<()> {
    sock.set_nonblocking(true)?;
    let sock_fd: RawFd = sock.as_raw_fd();
    let mut stdin_open = true;
    let mut pending = Pending { buf: Vec::new() };
    let mut buf = [0u8; BUF_SIZE];
    let linger_ms = i32::try_from(linger.as_millis()).unwrap_or(i32::MAX);

    loop {
        let mut pfds: Vec<libc::pollfd> = Vec::with_capacity(2);
        let mut sock_events = libc::POLLIN;
        if !pending.buf.is_empty() {
            sock_events |= libc::POLLOUT;
        }
        pfds.push(libc::pollfd { fd: sock_fd, events: sock_events, revents: 0 });
        let watch_stdin = stdin_open && pending.buf.len() < PENDING_LIMIT;
        if watch_stdin {
            pfds.push(libc::pollfd { fd: 0, events: libc::POLLIN, revents: 0 });
        }
        let timeout = if stdin_open || !pending.buf.is_empty() { -1 } else { linger_ms };
        // SAFETY: pfds is a live, correctly sized array of pollfd.
        let rc = unsafe { libc::poll(pfds.as_mut_ptr(), pfds.len() as libc::nfds_t, timeout) };
        if rc < 0 {
            let err = Errno::last();
            if err == Errno::EINTR {
                continue;
            }
            bail!("poll failed: {err}");
        }
        if rc == 0 {
            debug!("daemon quiet after stdin ended");
            return Ok(());
        }

        let sock_rev = pfds[0].revents;
        if sock_rev & (libc::POLLIN | libc::POLLHUP | libc::POLLERR) != 0 {
            if let SockRead::Closed = drain_socket(&mut sock, &mut buf)? {
                debug!("daemon closed the connection");
                return Ok(());
            }
        }
        if sock_rev & libc::POLLOUT != 0 {
            pending.flush(&mut sock)?;
        }

        if watch_stdin && pfds[1].revents != 0 {
            match nread(0, &mut buf) {
                Ok(0) => {
                    debug!("stdin closed");
                    stdin_open = false;
                }
                Ok(n) => {
                    pending.buf.extend_from_slice(&buf[..n]);
                    pending.flush(&mut sock)?;
                }
                Err(Errno::EINTR) | Err(Errno::EAGAIN) => {}
                Err(e) => return Err(e).context("read from stdin"),
            }
        }
    }
}

fn main() -> ExitCode {
    let args = Args::parse();
    init_tracing(args.verbose);

    let host = match args.host.clone() {
        Some(h) => h,
        None => match ask_host() {
            Ok(Some(h)) => h,
            Ok(None) => {
                eprintln!("unsh: bad name");
                return ExitCode::from(1);
            }
            Err(e) => {
                eprintln!("unsh: {e:#}");
                return ExitCode::from(1);
            }
        },
    };

    let sock = match connect(&host, args.port) {
        Ok(Some(s)) => s,
        Ok(None) => {
            println!("no such domain");
            return ExitCode::from(2);
        }
        Err(e) => {
            eprintln!("unsh: {e:#}");
            return ExitCode::from(1);
        }
    };

    match relay(sock, Duration::from_millis(args.linger_ms)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("unsh: {e:#}");
            ExitCode::from(1)
        }
    }
}
