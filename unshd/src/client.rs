//! Per-connection state: line accumulation and the pipeline lifecycle.

use std::os::fd::OwnedFd;

use crate::proxy::Outbox;
use crate::registry::Key;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    /// Idle, accumulating a command line.
    Command,
    /// A pipeline is running. The protocol is output-only, so complete lines
    /// received here are refused instead of forwarded.
    Input,
    /// Socket gone; the record only anchors a pipeline still producing output.
    Closed,
}

/// What one byte did to the line buffer.
#[derive(Debug, PartialEq, Eq)]
pub enum Feed {
    Partial,
    Line(String),
    /// The buffer was full: its content is gone and the rest of the line
    /// will be skipped up to the next terminator.
    Overflow,
}

#[derive(Debug)]
pub struct LineBuffer {
    buf: Vec<u8>,
    max: usize,
    discarding: bool,
}

impl LineBuffer {
    pub fn new(max: usize) -> Self {
        LineBuffer { buf: Vec::with_capacity(max), max, discarding: false }
    }

    pub fn push(&mut self, byte: u8) -> Feed {
        if byte == b'\r' || byte == b'\n' {
            if self.discarding {
                self.discarding = false;
                return Feed::Partial;
            }
            let line = String::from_utf8_lossy(&self.buf).into_owned();
            self.buf.clear();
            return Feed::Line(line);
        }
        if self.discarding {
            return Feed::Partial;
        }
        if self.buf.len() >= self.max {
            self.buf.clear();
            self.discarding = true;
            return Feed::Overflow;
        }
        self.buf.push(byte);
        Feed::Partial
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.max
    }
}

/// What happens to a client record when its socket hangs up.
#[derive(Debug, PartialEq, Eq)]
pub enum Hangup {
    Free,
    /// Keep the record (now Closed) until this pipeline output ends.
    Retain(Key),
}

#[derive(Debug)]
pub struct Client {
    pub state: ClientState,
    pub line: LineBuffer,
    /// Process-output record of the running pipeline.
    pipeline: Option<Key>,
    /// Write end of the head pipe, held while the pipeline runs.
    stdin: Option<OwnedFd>,
    pub outbox: Outbox,
    /// Whether EPOLLOUT is currently part of the registered interest.
    pub(crate) want_write: bool,
}

impl Client {
    pub fn new(line_max: usize) -> Self {
        Client {
            state: ClientState::Command,
            line: LineBuffer::new(line_max),
            pipeline: None,
            stdin: None,
            outbox: Outbox::default(),
            want_write: false,
        }
    }

    pub fn has_pipeline(&self) -> bool {
        self.pipeline.is_some()
    }

    pub fn pipeline(&self) -> Option<Key> {
        self.pipeline
    }

    pub fn attach(&mut self, output: Key, stdin: Option<OwnedFd>) {
        self.pipeline = Some(output);
        self.stdin = stdin;
        self.state = ClientState::Input;
    }

    /// Pipeline finished: back to Command unless the socket is already gone.
    pub fn detach(&mut self) {
        self.pipeline = None;
        self.stdin = None;
        if self.state != ClientState::Closed {
            self.state = ClientState::Command;
        }
    }

    pub fn hang_up(&mut self) -> Hangup {
        self.stdin = None;
        self.outbox.clear();
        match self.pipeline {
            Some(output) => {
                self.state = ClientState::Closed;
                Hangup::Retain(output)
            }
            None => Hangup::Free,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{Handle, Kind, Registry};

    fn feed(buf: &mut LineBuffer, bytes: &[u8]) -> Vec<Feed> {
        bytes.iter().map(|b| buf.push(*b)).filter(|f| *f != Feed::Partial).collect()
    }

    #[test]
    fn unterminated_bytes_accumulate_in_order() {
        let mut buf = LineBuffer::new(8);
        assert!(feed(&mut buf, b"ls -l").is_empty());
        assert_eq!(buf.as_bytes(), b"ls -l");
    }

    #[test]
    fn cr_or_lf_ends_a_line() {
        let mut buf = LineBuffer::new(32);
        let got = feed(&mut buf, b"echo a\recho b\n\r\n");
        assert_eq!(
            got,
            vec![
                Feed::Line("echo a".into()),
                Feed::Line("echo b".into()),
                Feed::Line(String::new()),
                Feed::Line(String::new()),
            ]
        );
        assert!(buf.is_empty());
    }

    #[test]
    fn full_buffer_resets_on_next_byte() {
        let mut buf = LineBuffer::new(4);
        assert!(feed(&mut buf, b"abcd").is_empty());
        assert_eq!(buf.len(), 4);
        assert_eq!(buf.push(b'e'), Feed::Overflow);
        assert_eq!(buf.len(), 0);
    }

    #[test]
    fn exactly_max_bytes_then_terminator_is_a_line() {
        let mut buf = LineBuffer::new(4);
        assert_eq!(feed(&mut buf, b"abcd\n"), vec![Feed::Line("abcd".into())]);
    }

    #[test]
    fn oversized_line_is_dropped_whole() {
        let mut buf = LineBuffer::new(4);
        let got = feed(&mut buf, b"abcdefghij\nok\n");
        assert_eq!(got, vec![Feed::Overflow, Feed::Line("ok".into())]);
    }

    #[test]
    fn pipeline_lifecycle() {
        let mut reg = Registry::new(8);
        let out = reg.insert(Handle::Pipe(std::fs::File::open("/dev/null").unwrap()), Kind::ProcessOutput);
        let mut client = Client::new(8);
        client.attach(out, None);
        assert_eq!(client.state, ClientState::Input);
        assert_eq!(client.pipeline(), Some(out));
        client.detach();
        assert_eq!(client.state, ClientState::Command);
        assert!(!client.has_pipeline());
        assert_eq!(client.hang_up(), Hangup::Free);
    }

    #[test]
    fn hangup_mid_pipeline_retains_record() {
        let mut reg = Registry::new(8);
        let out = reg.insert(Handle::Pipe(std::fs::File::open("/dev/null").unwrap()), Kind::ProcessOutput);
        let mut client = Client::new(8);
        client.attach(out, None);
        assert_eq!(client.hang_up(), Hangup::Retain(out));
        assert_eq!(client.state, ClientState::Closed);
        client.detach();
        assert_eq!(client.state, ClientState::Closed, "closed is terminal");
    }
}
