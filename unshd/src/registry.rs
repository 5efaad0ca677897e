//! Tagged descriptor records kept in a generation-checked slot map.
//!
//! Records are addressed by [`Key`]. A key stays valid until its slot is
//! freed; after that the slot's generation moves on and the old key never
//! resolves again, even once the index is reused. This is what lets a
//! process-output record point back at its client without owning it.

use std::fmt;
use std::fs::File;
use std::net::{TcpListener, TcpStream};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd};

use nix::sys::signalfd::SignalFd;

use crate::client::Client;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Key {
    index: u32,
    generation: u32,
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}v{}", self.index, self.generation)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    Server,
    Client,
    ProcessOutput,
    Signal,
}

/// The OS object behind a record. Dropping it closes the descriptor.
pub enum Handle {
    Listener(TcpListener),
    Stream(TcpStream),
    Pipe(File),
    Signal(SignalFd),
}

impl AsFd for Handle {
    fn as_fd(&self) -> BorrowedFd<'_> {
        match self {
            Handle::Listener(l) => l.as_fd(),
            Handle::Stream(s) => s.as_fd(),
            Handle::Pipe(p) => p.as_fd(),
            Handle::Signal(s) => s.as_fd(),
        }
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Handle::Listener(_) => "Listener",
            Handle::Stream(_) => "Stream",
            Handle::Pipe(_) => "Pipe",
            Handle::Signal(_) => "Signal",
        };
        f.debug_tuple(name).field(&self.as_fd().as_raw_fd()).finish()
    }
}

/// Read side of a pipeline's tail pipe.
#[derive(Debug, Default)]
pub struct ProcessOutput {
    /// Back-reference to the client that started the pipeline. Unset until
    /// the spawner binds it; the dispatcher refuses to register it unbound.
    client: Option<Key>,
    /// Deregistered from the loop while the client drains its backlog.
    pub paused: bool,
}

impl ProcessOutput {
    pub fn bind(&mut self, client: Key) {
        self.client = Some(client);
    }

    pub fn client(&self) -> Option<Key> {
        self.client
    }
}

#[derive(Debug)]
pub enum Payload {
    Server,
    Client(Client),
    ProcessOutput(ProcessOutput),
    Signal,
}

#[derive(Debug)]
pub struct Record {
    handle: Option<Handle>,
    payload: Payload,
}

impl Record {
    pub fn kind(&self) -> Kind {
        match self.payload {
            Payload::Server => Kind::Server,
            Payload::Client(_) => Kind::Client,
            Payload::ProcessOutput(_) => Kind::ProcessOutput,
            Payload::Signal => Kind::Signal,
        }
    }

    pub fn handle(&self) -> Option<&Handle> {
        self.handle.as_ref()
    }

    pub fn handle_mut(&mut self) -> Option<&mut Handle> {
        self.handle.as_mut()
    }

    /// Detaches the handle, leaving the record in place. The caller closes
    /// it by dropping, after deregistering it from the loop.
    pub fn take_handle(&mut self) -> Option<Handle> {
        self.handle.take()
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn split_mut(&mut self) -> (Option<&mut Handle>, &mut Payload) {
        (self.handle.as_mut(), &mut self.payload)
    }

    fn into_handle(self) -> Option<Handle> {
        let Record { handle, payload } = self;
        drop(payload);
        handle
    }
}

#[derive(Debug)]
struct Slot {
    generation: u32,
    record: Option<Record>,
}

#[derive(Debug)]
pub struct Registry {
    slots: Vec<Slot>,
    vacant: Vec<u32>,
    line_max: usize,
    live: usize,
}

impl Registry {
    /// `line_max` is the line buffer capacity given to every client record.
    pub fn new(line_max: usize) -> Self {
        Registry { slots: Vec::new(), vacant: Vec::new(), line_max, live: 0 }
    }

    /// Creates a record of `kind` owning `handle`, with the kind's initial
    /// payload: clients start in Command state with an empty line buffer,
    /// process outputs start unbound.
    pub fn insert(&mut self, handle: Handle, kind: Kind) -> Key {
        let payload = match kind {
            Kind::Server => Payload::Server,
            Kind::Client => Payload::Client(Client::new(self.line_max)),
            Kind::ProcessOutput => Payload::ProcessOutput(ProcessOutput::default()),
            Kind::Signal => Payload::Signal,
        };
        let record = Record { handle: Some(handle), payload };
        self.live += 1;
        match self.vacant.pop() {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                slot.record = Some(record);
                Key { index, generation: slot.generation }
            }
            None => {
                let index = self.slots.len() as u32;
                self.slots.push(Slot { generation: 0, record: Some(record) });
                Key { index, generation: 0 }
            }
        }
    }

    /// Releases the record's payload and slot and hands back its OS handle,
    /// if it still has one. The handle is not closed here: the caller
    /// deregisters it first, then drops it. Returns `None` for stale keys.
    pub fn free(&mut self, key: Key) -> Option<Handle> {
        let slot = self.slots.get_mut(key.index as usize).filter(|s| s.generation == key.generation)?;
        let record = slot.record.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.vacant.push(key.index);
        self.live -= 1;
        record.into_handle()
    }

    pub fn get(&self, key: Key) -> Option<&Record> {
        self.slots.get(key.index as usize).filter(|s| s.generation == key.generation)?.record.as_ref()
    }

    pub fn get_mut(&mut self, key: Key) -> Option<&mut Record> {
        self.slots.get_mut(key.index as usize).filter(|s| s.generation == key.generation)?.record.as_mut()
    }

    pub fn contains(&self, key: Key) -> bool {
        self.get(key).is_some()
    }

    /// Both records at once; `None` if either key is stale or they are equal.
    pub fn pair_mut(&mut self, a: Key, b: Key) -> Option<(&mut Record, &mut Record)> {
        if a.index == b.index {
            return None;
        }
        let (lo, hi) = if a.index < b.index { (a, b) } else { (b, a) };
        let (left, right) = self.slots.split_at_mut(hi.index as usize);
        let lo_slot = left.get_mut(lo.index as usize).filter(|s| s.generation == lo.generation)?;
        let hi_slot = right.first_mut().filter(|s| s.generation == hi.generation)?;
        let (lo_rec, hi_rec) = (lo_slot.record.as_mut()?, hi_slot.record.as_mut()?);
        if a.index < b.index { Some((lo_rec, hi_rec)) } else { Some((hi_rec, lo_rec)) }
    }

    /// The client payload behind `key`, only if the key is live and still
    /// names a client record.
    pub fn client(&self, key: Key) -> Option<&Client> {
        match self.get(key)?.payload {
            Payload::Client(ref c) => Some(c),
            _ => None,
        }
    }

    pub fn client_mut(&mut self, key: Key) -> Option<&mut Client> {
        match self.get_mut(key)?.payload {
            Payload::Client(ref mut c) => Some(c),
            _ => None,
        }
    }

    pub fn output(&self, key: Key) -> Option<&ProcessOutput> {
        match self.get(key)?.payload {
            Payload::ProcessOutput(ref o) => Some(o),
            _ => None,
        }
    }

    pub fn output_mut(&mut self, key: Key) -> Option<&mut ProcessOutput> {
        match self.get_mut(key)?.payload {
            Payload::ProcessOutput(ref mut o) => Some(o),
            _ => None,
        }
    }

    pub fn keys(&self) -> Vec<Key> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.record.is_some())
            .map(|(i, s)| Key { index: i as u32, generation: s.generation })
            .collect()
    }

    pub fn count(&self, kind: Kind) -> usize {
        self.slots.iter().filter_map(|s| s.record.as_ref()).filter(|r| r.kind() == kind).count()
    }

    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::ClientState;

    fn devnull() -> Handle {
        Handle::Pipe(File::open("/dev/null").unwrap())
    }

    #[test]
    fn client_records_start_idle() {
        let mut reg = Registry::new(16);
        let key = reg.insert(devnull(), Kind::Client);
        let client = reg.client(key).unwrap();
        assert_eq!(client.state, ClientState::Command);
        assert!(client.line.is_empty());
        assert_eq!(client.line.capacity(), 16);
        assert!(!client.has_pipeline());
    }

    #[test]
    fn process_output_starts_unbound() {
        let mut reg = Registry::new(16);
        let client = reg.insert(devnull(), Kind::Client);
        let out = reg.insert(devnull(), Kind::ProcessOutput);
        assert_eq!(reg.output(out).unwrap().client(), None);
        reg.output_mut(out).unwrap().bind(client);
        assert_eq!(reg.output(out).unwrap().client(), Some(client));
    }

    #[test]
    fn free_returns_handle_without_closing_it() {
        let mut reg = Registry::new(16);
        let key = reg.insert(devnull(), Kind::Client);
        let handle = reg.free(key).expect("handle handed back");
        // still a usable descriptor
        assert!(nix::fcntl::fcntl(handle.as_fd().as_raw_fd(), nix::fcntl::FcntlArg::F_GETFD).is_ok());
        assert!(reg.is_empty());
    }

    #[test]
    fn stale_keys_never_resolve() {
        let mut reg = Registry::new(16);
        let first = reg.insert(devnull(), Kind::Client);
        assert!(reg.free(first).is_some());
        assert!(reg.free(first).is_none(), "freed exactly once");
        let second = reg.insert(devnull(), Kind::Client);
        assert_ne!(first, second);
        assert!(reg.get(first).is_none());
        assert!(reg.client(second).is_some());
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn kind_checked_accessors() {
        let mut reg = Registry::new(16);
        let out = reg.insert(devnull(), Kind::ProcessOutput);
        assert!(reg.client(out).is_none());
        assert!(reg.output(out).is_some());
        assert_eq!(reg.count(Kind::ProcessOutput), 1);
        assert_eq!(reg.count(Kind::Client), 0);
    }

    #[test]
    fn record_survives_handle_removal() {
        let mut reg = Registry::new(16);
        let key = reg.insert(devnull(), Kind::Client);
        drop(reg.get_mut(key).unwrap().take_handle());
        assert!(reg.get(key).unwrap().handle().is_none());
        assert!(reg.free(key).is_none());
        assert!(!reg.contains(key));
    }

    #[test]
    fn pair_mut_in_either_order() {
        let mut reg = Registry::new(16);
        let a = reg.insert(devnull(), Kind::Client);
        let b = reg.insert(devnull(), Kind::ProcessOutput);
        let (ra, rb) = reg.pair_mut(b, a).unwrap();
        assert_eq!(ra.kind(), Kind::ProcessOutput);
        assert_eq!(rb.kind(), Kind::Client);
        assert!(reg.pair_mut(a, a).is_none());
        reg.free(b);
        assert!(reg.pair_mut(a, b).is_none());
    }

    #[test]
    fn keys_lists_live_records() {
        let mut reg = Registry::new(16);
        let a = reg.insert(devnull(), Kind::Server);
        let b = reg.insert(devnull(), Kind::Signal);
        reg.free(a);
        assert_eq!(reg.keys(), vec![b]);
    }
}
