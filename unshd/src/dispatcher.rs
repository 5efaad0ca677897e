//! The event loop: one epoll instance, the registry, and the routing table
//! between them.
//!
//! Each registration is tagged with a fresh serial number that travels in the
//! epoll payload next to the descriptor number, so an event that was queued
//! for a descriptor closed earlier in the same batch (and possibly reused)
//! is recognised as stale and skipped.
//!
//! Handlers never drain a descriptor to `EAGAIN` unbounded; a handler that
//! spends its budget puts its key on the backlog, and the next wait polls
//! instead of blocking so the backlog is served right after fresh events.

use std::collections::{HashMap, HashSet};
use std::io::{ErrorKind, Read};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::os::fd::{AsFd, AsRawFd, RawFd};

use nix::errno::Errno;
use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags};
use tracing::{debug, info, warn};

use crate::client::{ClientState, Feed, Hangup};
use crate::cmdline::{self, Command};
use crate::config::Config;
use crate::error::{DaemonError, SpawnError};
use crate::pipeline;
use crate::proxy::{self, Flow, PumpError};
use crate::reaper;
use crate::registry::{Handle, Key, Kind, Payload, Registry};

#[derive(Debug, Clone, Copy)]
struct Route {
    key: Key,
    serial: u32,
}

fn client_interest(want_write: bool) -> EpollFlags {
    let base = EpollFlags::EPOLLIN | EpollFlags::EPOLLRDHUP;
    if want_write { base | EpollFlags::EPOLLOUT } else { base }
}

pub struct Dispatcher {
    epoll: Epoll,
    registry: Registry,
    routes: HashMap<RawFd, Route>,
    serial: u32,
    backlog: Vec<Key>,
    events: Vec<EpollEvent>,
    scratch: Vec<u8>,
    config: Config,
    server: Key,
    signals: Key,
    local_addr: SocketAddr,
    shutdown: bool,
}

impl Dispatcher {
    /// Blocks the daemon's signals, binds the listening socket and registers
    /// both with a new epoll instance. Must run on the thread that will call
    /// [`run`](Self::run).
    pub fn bind(config: Config) -> Result<Self, DaemonError> {
        config.validate()?;
        let sfd = reaper::install().map_err(DaemonError::Signals)?;
        let addr = config.listen_addr();
        let listener = TcpListener::bind(addr).map_err(|source| DaemonError::Bind { addr, source })?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;
        let epoll = Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC).map_err(DaemonError::Epoll)?;

        let mut registry = Registry::new(config.max_line);
        let server = registry.insert(Handle::Listener(listener), Kind::Server);
        let signals = registry.insert(Handle::Signal(sfd), Kind::Signal);
        let mut d = Dispatcher {
            epoll,
            registry,
            routes: HashMap::new(),
            serial: 0,
            backlog: Vec::new(),
            events: vec![EpollEvent::empty(); config.max_events],
            scratch: vec![0u8; config.buf_size],
            config,
            server,
            signals,
            local_addr,
            shutdown: false,
        };
        d.add(server, EpollFlags::EPOLLIN)
            .map_err(|source| DaemonError::Register { what: "listening socket", source })?;
        d.add(signals, EpollFlags::EPOLLIN)
            .map_err(|source| DaemonError::Register { what: "signal descriptor", source })?;
        info!(addr = %local_addr, "listening");
        Ok(d)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Serves events until SIGINT or SIGTERM, then closes every descriptor.
    pub fn run(&mut self) -> Result<(), DaemonError> {
        while !self.shutdown {
            self.turn()?;
        }
        info!(records = self.registry.len(), "shutting down");
        for key in self.registry.keys() {
            self.release(key);
        }
        Ok(())
    }

    /// One wait plus dispatch of everything it reported, then the backlog.
    pub fn turn(&mut self) -> Result<(), DaemonError> {
        let timeout = if self.backlog.is_empty() { -1 } else { 0 };
        let mut events = std::mem::take(&mut self.events);
        let ready = match wait(&self.epoll, &mut events, timeout) {
            Ok(n) => n,
            Err(Errno::EINTR) => 0,
            Err(e) => {
                self.events = events;
                return Err(DaemonError::Wait(e));
            }
        };
        let backlog = std::mem::take(&mut self.backlog);
        let mut served = HashSet::with_capacity(ready);
        let mut result = Ok(());
        for ev in &events[..ready] {
            let fd = (ev.data() & 0xffff_ffff) as u32 as RawFd;
            let serial = (ev.data() >> 32) as u32;
            let route = match self.routes.get(&fd) {
                Some(r) if r.serial == serial => *r,
                _ => {
                    debug!(fd, "stale event");
                    continue;
                }
            };
            served.insert(route.key);
            if let Err(e) = self.dispatch(route.key, ev.events()) {
                result = Err(e);
                break;
            }
        }
        self.events = events;
        result?;
        for key in backlog {
            if served.contains(&key) || !self.registry.contains(key) {
                continue;
            }
            self.dispatch(key, EpollFlags::EPOLLIN)?;
        }
        Ok(())
    }

    /// Registers `key`'s handle with `interest`.
    pub fn add(&mut self, key: Key, interest: EpollFlags) -> Result<(), Errno> {
        let record = self.registry.get(key).ok_or(Errno::EBADF)?;
        if let Payload::ProcessOutput(out) = record.payload() {
            if out.client().is_none() {
                return Err(Errno::EINVAL);
            }
        }
        let handle = record.handle().ok_or(Errno::EBADF)?;
        let fd = handle.as_fd().as_raw_fd();
        let serial = self.serial.wrapping_add(1);
        self.epoll.add(handle, EpollEvent::new(interest, route_data(fd, serial)))?;
        self.serial = serial;
        self.routes.insert(fd, Route { key, serial });
        Ok(())
    }

    /// Deregisters `key`'s handle. A record that is not registered (paused
    /// output, closed client) is left alone.
    pub fn remove(&mut self, key: Key) -> Result<(), Errno> {
        let Some(handle) = self.registry.get(key).and_then(|r| r.handle()) else { return Ok(()) };
        let fd = handle.as_fd().as_raw_fd();
        match self.routes.get(&fd) {
            Some(r) if r.key == key => {}
            _ => return Ok(()),
        }
        self.routes.remove(&fd);
        self.epoll.delete(handle)
    }

    fn modify(&mut self, key: Key, interest: EpollFlags) -> Result<(), Errno> {
        let handle = self.registry.get(key).and_then(|r| r.handle()).ok_or(Errno::EBADF)?;
        let fd = handle.as_fd().as_raw_fd();
        let route = self.routes.get(&fd).filter(|r| r.key == key).ok_or(Errno::ENOENT)?;
        self.epoll.modify(handle, &mut EpollEvent::new(interest, route_data(fd, route.serial)))
    }

    /// Deregister, close, free.
    fn release(&mut self, key: Key) {
        if let Err(e) = self.remove(key) {
            warn!(%key, error = %e, "cannot deregister descriptor");
        }
        drop(self.registry.free(key));
    }

    fn dispatch(&mut self, key: Key, flags: EpollFlags) -> Result<(), DaemonError> {
        let Some(kind) = self.registry.get(key).map(|r| r.kind()) else { return Ok(()) };
        if flags.contains(EpollFlags::EPOLLERR) {
            return self.on_error(key, kind);
        }
        match kind {
            Kind::Server => self.on_accept(),
            Kind::Signal => return self.on_signal(),
            Kind::Client => {
                if flags.intersects(EpollFlags::EPOLLHUP | EpollFlags::EPOLLRDHUP) {
                    self.hang_up(key);
                    return Ok(());
                }
                if flags.contains(EpollFlags::EPOLLOUT) {
                    self.on_client_writable(key);
                }
                if flags.contains(EpollFlags::EPOLLIN) {
                    self.on_client_readable(key);
                }
            }
            // a hung-up pipe may still hold data: read it to end-of-stream
            Kind::ProcessOutput => self.on_output(key),
        }
        Ok(())
    }

    fn on_error(&mut self, key: Key, kind: Kind) -> Result<(), DaemonError> {
        let cause = match self.registry.get(key).and_then(|r| r.handle()) {
            Some(Handle::Listener(l)) => l.take_error().ok().flatten(),
            Some(Handle::Stream(s)) => s.take_error().ok().flatten(),
            _ => None,
        };
        warn!(%key, ?kind, error = ?cause, "descriptor error");
        match kind {
            Kind::Server => Err(DaemonError::Io(
                cause.unwrap_or_else(|| std::io::Error::new(ErrorKind::Other, "listening socket failed")),
            )),
            Kind::Signal => Err(DaemonError::SignalRead(Errno::EIO)),
            Kind::Client => {
                self.hang_up(key);
                Ok(())
            }
            Kind::ProcessOutput => {
                self.finish_pipeline(key);
                Ok(())
            }
        }
    }

    fn on_accept(&mut self) {
        for _ in 0..self.config.read_budget {
            let accepted = match self.registry.get(self.server).and_then(|r| r.handle()) {
                Some(Handle::Listener(l)) => l.accept(),
                _ => return,
            };
            match accepted {
                Ok((stream, peer)) => self.admit(stream, peer),
                Err(e) if e.kind() == ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    return;
                }
            }
        }
        self.backlog.push(self.server);
    }

    fn admit(&mut self, stream: TcpStream, peer: SocketAddr) {
        if let Err(e) = stream.set_nonblocking(true) {
            warn!(%peer, error = %e, "cannot make client socket non-blocking");
            return;
        }
        let key = self.registry.insert(Handle::Stream(stream), Kind::Client);
        if let Err(e) = self.add(key, client_interest(false)) {
            warn!(%peer, error = %e, "cannot register client");
            drop(self.registry.free(key));
            return;
        }
        debug!(%peer, %key, "client connected");
    }

    fn on_signal(&mut self) -> Result<(), DaemonError> {
        let (budget, reap_budget) = (self.config.read_budget, self.config.reap_budget);
        let drained = match self.registry.get_mut(self.signals).and_then(|r| r.handle_mut()) {
            Some(Handle::Signal(sfd)) => reaper::drain(sfd, budget, reap_budget).map_err(DaemonError::SignalRead)?,
            _ => return Ok(()),
        };
        if let Some(sig) = drained.shutdown {
            info!(signal = ?sig, "shutdown requested");
            self.shutdown = true;
        }
        if drained.exhausted {
            self.backlog.push(self.signals);
        }
        Ok(())
    }

    fn on_client_readable(&mut self, key: Key) {
        let max_line = self.config.max_line;
        for _ in 0..self.config.read_budget {
            let read = match self.registry.get_mut(key).and_then(|r| r.handle_mut()) {
                Some(Handle::Stream(s)) => s.read(&mut self.scratch),
                _ => return,
            };
            let n = match read {
                Ok(0) => {
                    self.hang_up(key);
                    return;
                }
                Ok(n) => n,
                Err(e) if e.kind() == ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    debug!(%key, error = %e, "client read failed");
                    self.hang_up(key);
                    return;
                }
            };
            for i in 0..n {
                let byte = self.scratch[i];
                let feed = match self.registry.client_mut(key) {
                    Some(c) if c.state != ClientState::Closed => c.line.push(byte),
                    _ => return,
                };
                match feed {
                    Feed::Partial => {}
                    Feed::Line(line) => self.on_line(key, &line),
                    Feed::Overflow => {
                        let msg = format!("unshd: line too long (max {max_line} bytes), discarded\n");
                        self.send(key, msg.as_bytes());
                    }
                }
            }
        }
        self.backlog.push(key);
    }

    fn on_line(&mut self, key: Key, line: &str) {
        if line.trim().is_empty() {
            return;
        }
        match self.registry.client(key).map(|c| c.state) {
            Some(ClientState::Command) => {}
            Some(ClientState::Input) => {
                debug!(%key, "line refused while pipeline runs");
                self.send(key, b"unshd: busy: a pipeline is still running\n");
                return;
            }
            _ => return,
        }
        let cmd = match cmdline::parse(line) {
            Ok(cmd) => cmd,
            Err(e) => {
                self.send(key, format!("unshd: {e}\n").as_bytes());
                return;
            }
        };
        if let Err(e) = self.start_pipeline(key, &cmd) {
            warn!(%key, error = %e, "spawn failed");
            self.send(key, format!("unshd: {e}\n").as_bytes());
        }
    }

    fn start_pipeline(&mut self, key: Key, cmd: &Command) -> Result<(), SpawnError> {
        let Some(spawned) = pipeline::spawn(cmd)? else { return Ok(()) };
        let out = self.registry.insert(Handle::Pipe(spawned.output), Kind::ProcessOutput);
        if let Some(o) = self.registry.output_mut(out) {
            o.bind(key);
        }
        if let Err(e) = self.add(out, EpollFlags::EPOLLIN) {
            drop(self.registry.free(out));
            return Err(SpawnError::Register(e));
        }
        if let Some(client) = self.registry.client_mut(key) {
            client.attach(out, spawned.stdin);
        }
        debug!(client = %key, output = %out, pids = ?spawned.pids, "pipeline started");
        Ok(())
    }

    /// Queues `bytes` for the client; a dead socket turns into a hangup.
    fn send(&mut self, key: Key, bytes: &[u8]) {
        let sent = match self.registry.get_mut(key).map(|r| r.split_mut()) {
            Some((Some(Handle::Stream(s)), Payload::Client(c))) => c.outbox.send(s, bytes),
            _ => return,
        };
        match sent {
            Ok(()) => self.sync_interest(key),
            Err(e) => {
                debug!(%key, error = %e, "client write failed");
                self.hang_up(key);
            }
        }
    }

    /// Arms EPOLLOUT exactly while the client has queued output, and resumes
    /// a paused pipeline once that queue is empty, whichever path emptied it.
    fn sync_interest(&mut self, key: Key) {
        let Some(client) = self.registry.client_mut(key) else { return };
        if client.state == ClientState::Closed {
            return;
        }
        let want = !client.outbox.is_empty();
        let pipeline = client.pipeline();
        if want != client.want_write {
            client.want_write = want;
            if let Err(e) = self.modify(key, client_interest(want)) {
                warn!(%key, error = %e, "cannot update client interest");
            }
        }
        if want {
            return;
        }
        if let Some(out) = pipeline.filter(|out| self.registry.output(*out).map_or(false, |o| o.paused)) {
            self.resume_output(out);
        }
    }

    fn on_client_writable(&mut self, key: Key) {
        let flushed = match self.registry.get_mut(key).map(|r| r.split_mut()) {
            Some((Some(Handle::Stream(s)), Payload::Client(c))) => c.outbox.flush(s),
            _ => return,
        };
        match flushed {
            Ok(_) => self.sync_interest(key),
            Err(e) => {
                debug!(%key, error = %e, "client flush failed");
                self.hang_up(key);
            }
        }
    }

    /// Socket gone: close it, then free the record or, if a pipeline still
    /// references it, keep it as Closed until that pipeline's output ends.
    fn hang_up(&mut self, key: Key) {
        if self.registry.client(key).map_or(true, |c| c.state == ClientState::Closed) {
            return;
        }
        if let Err(e) = self.remove(key) {
            warn!(%key, error = %e, "cannot deregister client");
        }
        let Some(record) = self.registry.get_mut(key) else { return };
        drop(record.take_handle());
        let verdict = match record.split_mut() {
            (_, Payload::Client(c)) => c.hang_up(),
            _ => Hangup::Free,
        };
        match verdict {
            Hangup::Free => {
                drop(self.registry.free(key));
                debug!(%key, "client disconnected");
            }
            Hangup::Retain(out) => {
                debug!(%key, output = %out, "client disconnected mid-pipeline; output will be discarded");
                if self.registry.output(out).map_or(false, |o| o.paused) {
                    self.resume_output(out);
                }
            }
        }
    }

    fn on_output(&mut self, key: Key) {
        let (budget, high_water) = (self.config.read_budget, self.config.outbox_high_water);
        let client = match self.registry.output(key) {
            Some(o) if o.paused => return,
            Some(o) => o.client(),
            None => return,
        };
        // the back-reference must still name a live client to be written to
        let target = client.filter(|c| {
            self.registry.client(*c).map_or(false, |cl| cl.state != ClientState::Closed)
        });
        let Some(target) = target else {
            if client.map_or(true, |c| self.registry.client(c).is_none()) {
                warn!(output = %key, "pipeline output without a client");
            }
            let drained = match self.registry.get_mut(key).and_then(|r| r.handle_mut()) {
                Some(Handle::Pipe(p)) => proxy::discard(p, &mut self.scratch, budget),
                _ => return,
            };
            match drained {
                Ok(Flow::Exhausted) => self.backlog.push(key),
                Ok(Flow::Drained) | Ok(Flow::Backpressure) => {}
                Ok(Flow::Eof) => self.finish_pipeline(key),
                Err(e) => {
                    warn!(output = %key, error = %e, "pipeline output read failed");
                    self.finish_pipeline(key);
                }
            }
            return;
        };

        let flow = match self.registry.pair_mut(key, target) {
            Some((out_rec, client_rec)) => match (out_rec.handle_mut(), client_rec.split_mut()) {
                (Some(Handle::Pipe(src)), (Some(Handle::Stream(dst)), Payload::Client(c))) => {
                    proxy::forward(src, dst, &mut c.outbox, &mut self.scratch, budget, high_water)
                }
                _ => return,
            },
            None => return,
        };
        match flow {
            Ok(Flow::Drained) => self.sync_interest(target),
            Ok(Flow::Exhausted) => {
                self.backlog.push(key);
                self.sync_interest(target);
            }
            Ok(Flow::Backpressure) => {
                self.pause_output(key);
                self.sync_interest(target);
            }
            Ok(Flow::Eof) => {
                self.finish_pipeline(key);
                self.sync_interest(target);
            }
            Err(PumpError::Source(e)) => {
                warn!(output = %key, error = %e, "pipeline output read failed");
                self.finish_pipeline(key);
                self.sync_interest(target);
            }
            Err(PumpError::Sink(e)) => {
                debug!(client = %target, error = %e, "client write failed");
                self.hang_up(target);
                self.backlog.push(key);
            }
        }
    }

    fn pause_output(&mut self, key: Key) {
        if let Err(e) = self.remove(key) {
            warn!(output = %key, error = %e, "cannot pause pipeline output");
            return;
        }
        if let Some(o) = self.registry.output_mut(key) {
            o.paused = true;
        }
        debug!(output = %key, "pipeline output paused");
    }

    fn resume_output(&mut self, key: Key) {
        if let Some(o) = self.registry.output_mut(key) {
            o.paused = false;
        }
        if let Err(e) = self.add(key, EpollFlags::EPOLLIN) {
            warn!(output = %key, error = %e, "cannot resume pipeline output");
            self.finish_pipeline(key);
            return;
        }
        debug!(output = %key, "pipeline output resumed");
    }

    /// Tail reached end-of-stream: release it, then either return the client
    /// to Command or, if it already disconnected, release it too.
    fn finish_pipeline(&mut self, key: Key) {
        let client = self.registry.output(key).and_then(|o| o.client());
        self.release(key);
        let Some(client) = client else { return };
        match self.registry.client_mut(client) {
            Some(c) if c.state == ClientState::Closed => {
                drop(self.registry.free(client));
                debug!(%client, "released disconnected client");
            }
            Some(c) => {
                c.detach();
                debug!(%client, "pipeline finished");
            }
            None => {}
        }
    }
}

/// `epoll_wait` with a plain millisecond timeout, -1 blocking.
fn wait(epoll: &Epoll, events: &mut [EpollEvent], timeout_ms: i32) -> Result<usize, Errno> {
    let max = i32::try_from(events.len()).unwrap_or(i32::MAX);
    // SAFETY: EpollEvent is a transparent wrapper of epoll_event and the
    // kernel writes at most `max` entries.
    let rc = unsafe { libc::epoll_wait(epoll.0.as_raw_fd(), events.as_mut_ptr().cast(), max, timeout_ms) };
    Errno::result(rc).map(|n| n as usize)
}

fn route_data(fd: RawFd, serial: u32) -> u64 {
    (u64::from(serial) << 32) | u64::from(fd as u32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::net::Ipv4Addr;
    use std::time::Duration;

    fn loopback() -> Dispatcher {
        let cfg = Config { bind: Ipv4Addr::LOCALHOST.into(), port: 0, max_line: 8, ..Config::default() };
        Dispatcher::bind(cfg).unwrap()
    }

    /// Small outbox limit, large reads: a client that stops reading pauses
    /// its pipeline quickly.
    fn throttled() -> Dispatcher {
        let cfg = Config {
            bind: Ipv4Addr::LOCALHOST.into(),
            port: 0,
            buf_size: 64 * 1024,
            outbox_high_water: 4096,
            ..Config::default()
        };
        Dispatcher::bind(cfg).unwrap()
    }

    /// Turns the loop until `done` holds. Callers perform I/O first, so the
    /// first wait always has something to report.
    fn turn_until(d: &mut Dispatcher, done: impl Fn(&Dispatcher) -> bool) {
        for _ in 0..10_000 {
            d.turn().unwrap();
            if done(d) {
                return;
            }
        }
        panic!("condition not reached");
    }

    fn output_key(d: &Dispatcher) -> Option<Key> {
        d.registry().keys().into_iter().find(|k| d.registry().output(*k).is_some())
    }

    fn paused(d: &Dispatcher) -> bool {
        output_key(d).and_then(|k| d.registry().output(k)).map_or(false, |o| o.paused)
    }

    /// A paused output with nothing queued and no write interest has no
    /// event left that could ever resume it.
    fn stalled(d: &Dispatcher, client: Key) -> bool {
        let c = d.registry().client(client).unwrap();
        paused(d) && c.outbox.is_empty() && !c.want_write
    }

    /// Bytes the pipeline writes (`head -c` of /dev/zero); far more than
    /// loopback socket buffers hold.
    const FLOOD: usize = 32 * 1024 * 1024;

    /// Starts the flood and turns until the daemon pauses its output.
    fn flood_until_paused(d: &mut Dispatcher) -> (TcpStream, Key) {
        let mut stream = connect(d);
        let key = only_client(d);
        stream.write_all(format!("head -c {FLOOD} /dev/zero\n").as_bytes()).unwrap();
        turn_until(d, paused);
        let c = d.registry().client(key).unwrap();
        assert_eq!(c.state, ClientState::Input);
        assert!(c.outbox.len() >= 4096, "paused at the high-water mark");
        assert!(c.want_write);
        (stream, key)
    }

    /// Reads whatever the socket holds right now.
    fn drain_now(stream: &mut TcpStream) -> Vec<u8> {
        stream.set_nonblocking(true).unwrap();
        let mut got = Vec::new();
        let mut buf = [0u8; 64 * 1024];
        loop {
            match stream.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => got.extend_from_slice(&buf[..n]),
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) => panic!("read failed: {e}"),
            }
        }
        stream.set_nonblocking(false).unwrap();
        got
    }

    fn connect(d: &mut Dispatcher) -> TcpStream {
        let stream = TcpStream::connect(d.local_addr()).unwrap();
        stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        turn_until(d, |d| d.registry().count(Kind::Client) == 1);
        stream
    }

    fn only_client(d: &Dispatcher) -> Key {
        *d.registry().keys().iter().find(|k| d.registry().client(**k).is_some()).unwrap()
    }

    fn read_line(stream: &mut TcpStream) -> String {
        let mut out = Vec::new();
        let mut byte = [0u8; 1];
        while stream.read(&mut byte).unwrap() == 1 {
            out.push(byte[0]);
            if byte[0] == b'\n' {
                break;
            }
        }
        String::from_utf8(out).unwrap()
    }

    #[test]
    fn startup_registers_server_and_signals() {
        let d = loopback();
        assert_eq!(d.registry().count(Kind::Server), 1);
        assert_eq!(d.registry().count(Kind::Signal), 1);
        assert_ne!(d.local_addr().port(), 0);
    }

    #[test]
    fn partial_line_accumulates_without_spawning() {
        let mut d = loopback();
        let mut stream = connect(&mut d);
        stream.write_all(b"echo").unwrap();
        let key = only_client(&d);
        turn_until(&mut d, |d| d.registry().client(key).unwrap().line.len() == 4);
        let client = d.registry().client(key).unwrap();
        assert_eq!(client.line.as_bytes(), b"echo");
        assert!(!client.has_pipeline());
        assert_eq!(d.registry().count(Kind::ProcessOutput), 0);
    }

    #[test]
    fn oversized_line_is_reported_not_fatal() {
        let mut d = loopback();
        let mut stream = connect(&mut d);
        stream.write_all(b"0123456789abcdef\n").unwrap();
        let key = only_client(&d);
        turn_until(&mut d, |d| d.registry().client(key).unwrap().line.is_empty());
        assert_eq!(read_line(&mut stream), "unshd: line too long (max 8 bytes), discarded\n");
        assert!(d.registry().client(key).is_some());
    }

    #[test]
    fn parse_errors_are_reported() {
        let mut d = loopback();
        let mut stream = connect(&mut d);
        stream.write_all(b"ls |\n").unwrap();
        let key = only_client(&d);
        turn_until(&mut d, |d| d.registry().client(key).unwrap().line.is_empty());
        assert_eq!(read_line(&mut stream), "unshd: empty pipeline stage\n");
        assert_eq!(d.registry().client(key).unwrap().state, ClientState::Command);
    }

    #[test]
    fn idle_hangup_frees_the_record() {
        let mut d = loopback();
        let stream = connect(&mut d);
        drop(stream);
        turn_until(&mut d, |d| d.registry().count(Kind::Client) == 0);
        assert_eq!(d.registry().len(), 2);
    }

    #[test]
    fn unread_output_pauses_pipeline() {
        let mut d = throttled();
        let (_stream, key) = flood_until_paused(&mut d);
        assert!(d.registry().client(key).unwrap().has_pipeline());
        assert!(!stalled(&d, key));
    }

    #[test]
    fn notice_that_empties_outbox_resumes_output() {
        let mut d = throttled();
        let (mut stream, key) = flood_until_paused(&mut d);
        // catch up on the socket, then let a daemon notice flush the outbox
        let drained = drain_now(&mut stream);
        assert!(drained.iter().all(|b| *b == 0));
        let notice = b"unshd: busy: a pipeline is still running\n";
        d.send(key, notice);
        let expected = FLOOD + notice.len() - drained.len();
        let reader = std::thread::spawn(move || {
            let mut total = 0;
            let mut letters = 0;
            let mut buf = [0u8; 64 * 1024];
            while total < expected {
                let n = stream.read(&mut buf).unwrap();
                assert!(n > 0, "connection closed early");
                letters += buf[..n].iter().filter(|b| **b != 0).count();
                total += n;
            }
            (total, letters)
        });
        while output_key(&d).is_some() || !d.registry().client(key).unwrap().outbox.is_empty() {
            assert!(!stalled(&d, key), "output paused with nothing left to flush");
            d.turn().unwrap();
        }
        let (total, letters) = reader.join().unwrap();
        assert_eq!(total, expected);
        assert_eq!(letters, notice.len());
        assert_eq!(d.registry().client(key).unwrap().state, ClientState::Command);
    }

    #[test]
    fn client_reading_everything_receives_every_byte() {
        let mut d = throttled();
        let (mut stream, key) = flood_until_paused(&mut d);
        let reader = std::thread::spawn(move || {
            let mut total = 0;
            let mut buf = [0u8; 64 * 1024];
            while total < FLOOD {
                let n = stream.read(&mut buf).unwrap();
                assert!(n > 0, "connection closed early");
                total += n;
            }
            total
        });
        while output_key(&d).is_some() || !d.registry().client(key).unwrap().outbox.is_empty() {
            d.turn().unwrap();
        }
        assert_eq!(reader.join().unwrap(), FLOOD);
        assert_eq!(d.registry().client(key).unwrap().state, ClientState::Command);
    }

    #[test]
    fn hangup_while_paused_releases_both_records() {
        let mut d = throttled();
        let (stream, _key) = flood_until_paused(&mut d);
        drop(stream);
        turn_until(&mut d, |d| d.registry().count(Kind::Client) == 0 && output_key(d).is_none());
        assert_eq!(d.registry().len(), 2);
    }

    #[test]
    fn unbound_output_cannot_be_registered() {
        let mut d = loopback();
        let null = std::fs::File::open("/dev/null").unwrap();
        let key = d.registry.insert(Handle::Pipe(null), Kind::ProcessOutput);
        assert_eq!(d.add(key, EpollFlags::EPOLLIN), Err(Errno::EINVAL));
    }
}
