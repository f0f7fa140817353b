//! Non-blocking TCP helpers: bounded receive accumulation and a partial-write
//! aware send queue.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::net::TcpStream;

use crate::error::ProtocolError;

/// Hard bound on one connection's receive accumulator.
pub const MAX_BUFFER_SIZE: usize = 64 * 1024;

/// What one non-blocking read produced.
#[derive(Debug, PartialEq, Eq)]
pub enum StreamRead {
    /// Bytes were appended to the accumulator
    Data(usize),
    /// The peer closed the stream
    Closed,
    /// Nothing available right now
    WouldBlock,
}

/// Read once from `stream` into `accum`, enforcing [`MAX_BUFFER_SIZE`].
pub fn read_into(stream: &mut TcpStream, accum: &mut Vec<u8>) -> Result<StreamRead, ProtocolError> {
    let mut buf = [0u8; 1024];
    match stream.read(&mut buf) {
        Ok(0) => Ok(StreamRead::Closed),
        Ok(n) => {
            if accum.len() + n > MAX_BUFFER_SIZE {
                return Err(ProtocolError::BufferOverflow);
            }
            accum.extend_from_slice(&buf[..n]);
            Ok(StreamRead::Data(n))
        }
        Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => Ok(StreamRead::WouldBlock),
        Err(_) => Ok(StreamRead::Closed),
    }
}

/// Outbound packet queue for one connection.
///
/// Packets are appended whole; `flush` writes as much as the socket accepts
/// and keeps the remainder (including a partially written front packet) for
/// the next tick.
#[derive(Debug, Default)]
pub struct SendQueue {
    queue: VecDeque<Vec<u8>>,
    front_offset: usize,
}

impl SendQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one packet.
    pub fn push(&mut self, packet: Vec<u8>) {
        if !packet.is_empty() {
            self.queue.push_back(packet);
        }
    }

    /// Whether everything queued has been written out.
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Number of queued packets.
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Write queued packets until the socket pushes back.
    ///
    /// Returns `Ok(true)` when the queue drained, `Ok(false)` on
    /// `WouldBlock` with data still pending. Any other I/O error is the
    /// caller's signal to tear the connection down.
    pub fn flush(&mut self, stream: &mut TcpStream) -> io::Result<bool> {
        while let Some(front) = self.queue.front() {
            let remaining = &front[self.front_offset..];
            match stream.write(remaining) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) if n == remaining.len() => {
                    self.queue.pop_front();
                    self.front_offset = 0;
                }
                Ok(n) => {
                    self.front_offset += n;
                    return Ok(false);
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(e) => return Err(e),
            }
        }
        Ok(true)
    }
}
