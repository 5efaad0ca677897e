//! Byte pumps between pipeline descriptors and client sockets.
//!
//! Both ends are non-blocking. A pump never loops to `EAGAIN` unbounded: it
//! performs at most `budget` reads and reports [`Flow::Exhausted`] if data may
//! remain, so the dispatcher can re-queue it behind other ready descriptors.

use std::io::{self, ErrorKind, Read, Write};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// The source would block; wait for its next readiness.
    Drained,
    /// Budget spent. The source may still have data.
    Exhausted,
    /// The destination's backlog is above the high-water mark.
    Backpressure,
    /// The source reached end-of-stream.
    Eof,
}

#[derive(Debug, thiserror::Error)]
pub enum PumpError {
    #[error("read from source failed: {0}")]
    Source(io::Error),
    #[error("write to destination failed: {0}")]
    Sink(io::Error),
}

/// Bytes accepted from a pipeline but not yet taken by the client socket.
#[derive(Debug, Default)]
pub struct Outbox {
    data: Vec<u8>,
    sent: usize,
}

impl Outbox {
    pub fn len(&self) -> usize {
        self.data.len() - self.sent
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&mut self) {
        self.data.clear();
        self.sent = 0;
    }

    /// Writes `bytes` after whatever is already queued. Whatever the
    /// destination does not take right now is queued, never dropped.
    pub fn send<W: Write>(&mut self, dst: &mut W, bytes: &[u8]) -> io::Result<()> {
        if !self.is_empty() {
            self.data.extend_from_slice(bytes);
            return self.flush(dst).map(|_| ());
        }
        let mut off = 0;
        while off < bytes.len() {
            match dst.write(&bytes[off..]) {
                Ok(0) => return Err(ErrorKind::WriteZero.into()),
                Ok(n) => off += n,
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        self.data.extend_from_slice(&bytes[off..]);
        Ok(())
    }

    /// Pushes queued bytes out until the destination would block. Returns
    /// whether the outbox is now empty.
    pub fn flush<W: Write>(&mut self, dst: &mut W) -> io::Result<bool> {
        while self.sent < self.data.len() {
            match dst.write(&self.data[self.sent..]) {
                Ok(0) => return Err(ErrorKind::WriteZero.into()),
                Ok(n) => self.sent += n,
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        if self.sent == self.data.len() {
            self.clear();
            return Ok(true);
        }
        // drop the written prefix once it outweighs what is still queued
        if self.sent > self.data.len() / 2 {
            self.data.drain(..self.sent);
            self.sent = 0;
        }
        Ok(false)
    }
}

/// Pipeline output → client. Reads into `scratch` and writes through the
/// client's outbox.
pub fn forward<R: Read, W: Write>(
    src: &mut R,
    dst: &mut W,
    outbox: &mut Outbox,
    scratch: &mut [u8],
    budget: usize,
    high_water: usize,
) -> Result<Flow, PumpError> {
    let mut reads = 0;
    while reads < budget {
        if outbox.len() >= high_water {
            return Ok(Flow::Backpressure);
        }
        let n = match src.read(scratch) {
            Ok(0) => return Ok(Flow::Eof),
            Ok(n) => n,
            Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(Flow::Drained),
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(PumpError::Source(e)),
        };
        reads += 1;
        outbox.send(dst, &scratch[..n]).map_err(PumpError::Sink)?;
    }
    Ok(Flow::Exhausted)
}

/// Pipeline output whose client is gone: read and drop.
pub fn discard<R: Read>(src: &mut R, scratch: &mut [u8], budget: usize) -> io::Result<Flow> {
    let mut reads = 0;
    while reads < budget {
        match src.read(scratch) {
            Ok(0) => return Ok(Flow::Eof),
            Ok(_) => reads += 1,
            Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(Flow::Drained),
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(Flow::Exhausted)
}
