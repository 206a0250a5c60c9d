//! Wire codec for envelopes crossing a process boundary.

use super::{EndpointId, Message, MessageKind, MessageQueue, Priority};
use crate::error::{Error, Result};

/// Size of the fixed envelope header.
pub const HEADER_SIZE: usize = 14;

/// Largest payload a reader accepts.
pub const MAX_MESSAGE_SIZE: usize = 0x20000;

/// Decoded envelope header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub from: EndpointId,
    pub to: EndpointId,
    pub priority: Priority,
    pub kind: MessageKind,
    pub size: u32,
}

impl Header {
    /// Encode the header into its fixed 14-byte form.
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..4].copy_from_slice(&self.from.0.to_le_bytes());
        buf[4..8].copy_from_slice(&self.to.0.to_le_bytes());
        buf[8] = self.priority as u8;
        buf[9] = self.kind as u8;
        buf[10..14].copy_from_slice(&self.size.to_le_bytes());
        buf
    }

    /// Decode a header from the start of `data`.
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < HEADER_SIZE {
            return Err(Error::InvalidMessage(format!(
                "header truncated: {} bytes",
                data.len()
            )));
        }
        let u32_at = |at: usize| u32::from_le_bytes([data[at], data[at + 1], data[at + 2], data[at + 3]]);

        Ok(Self {
            from: EndpointId(u32_at(0)),
            to: EndpointId(u32_at(4)),
            priority: Priority::try_from(data[8])?,
            kind: MessageKind::try_from(data[9])?,
            size: u32_at(10),
        })
    }
}

impl Message {
    /// Header describing this envelope.
    ///
    /// Fails for payloads larger than a reader accepts.
    pub fn header(&self) -> Result<Header> {
        let size = self.payload().len();
        if size > MAX_MESSAGE_SIZE {
            return Err(Error::InvalidMessage(format!(
                "payload of {} bytes to {} exceeds {}",
                size,
                self.to(),
                MAX_MESSAGE_SIZE
            )));
        }
        Ok(Header {
            from: self.from(),
            to: self.to(),
            priority: self.priority(),
            kind: self.kind(),
            size: size as u32,
        })
    }

    /// Serialize header and payload.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(self.wire_size());
        self.encode_into(&mut out)?;
        Ok(out)
    }

    /// Append the serialized envelope to `out`. Nothing is appended on error.
    pub fn encode_into(&self, out: &mut Vec<u8>) -> Result<()> {
        out.extend_from_slice(&self.header()?.encode());
        out.extend_from_slice(self.payload());
        Ok(())
    }

    /// Decode one envelope from the start of `data`.
    ///
    /// Returns the envelope and the number of bytes consumed, or `None` if
    /// `data` does not yet hold a whole envelope.
    pub fn decode(data: &[u8]) -> Result<Option<(Message, usize)>> {
        if data.len() < HEADER_SIZE {
            return Ok(None);
        }
        let header = Header::decode(data)?;
        let size = header.size as usize;
        if size > MAX_MESSAGE_SIZE {
            return Err(Error::InvalidMessage(format!(
                "declared size {} exceeds {}",
                size, MAX_MESSAGE_SIZE
            )));
        }

        let total = HEADER_SIZE + size;
        if data.len() < total {
            return Ok(None);
        }
        let message = Message::new(
            header.from,
            header.to,
            header.priority,
            header.kind,
            &data[HEADER_SIZE..total],
        );
        Ok(Some((message, total)))
    }
}

/// Decode a buffer that must hold only whole envelopes.
pub fn decode_all(mut data: &[u8]) -> Result<Vec<Message>> {
    let mut messages = Vec::new();
    while !data.is_empty() {
        let (message, used) = Message::decode(data)?.ok_or_else(|| {
            Error::InvalidMessage(format!("{} trailing bytes", data.len()))
        })?;
        messages.push(message);
        data = &data[used..];
    }
    Ok(messages)
}

/// Pack as many whole queued envelopes as fit in `limit` bytes into `out`,
/// back to back. The rest stay queued. Returns how many were packed.
///
/// An envelope too large for any reader can never be sent: once it reaches
/// the head of the queue it is taken off and reported.
pub fn write_queue(queue: &mut MessageQueue, out: &mut Vec<u8>, limit: usize) -> Result<usize> {
    let mut used = 0;
    let mut count = 0;
    while let Some(size) = queue.peek().map(Message::wire_size) {
        if size > HEADER_SIZE + MAX_MESSAGE_SIZE {
            if count > 0 {
                break;
            }
            queue.pop();
            return Err(Error::InvalidMessage(format!(
                "dropped unsendable {} byte envelope",
                size
            )));
        }
        if used + size > limit {
            break;
        }
        if let Some(message) = queue.pop() {
            message.encode_into(out)?;
            used += size;
            count += 1;
        }
    }
    Ok(count)
}

/// Reassembles envelopes from a byte stream delivered in arbitrary pieces.
#[derive(Debug, Default)]
pub struct MessageReader {
    buf: Vec<u8>,
}

impl MessageReader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes received but not yet forming a whole envelope.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    /// Feed bytes from the transport and return every envelope completed by
    /// them.
    ///
    /// A malformed header leaves the stream unrecoverable, so the buffered
    /// bytes are discarded before the error is returned.
    pub fn push(&mut self, data: &[u8]) -> Result<Vec<Message>> {
        self.buf.extend_from_slice(data);

        let mut messages = Vec::new();
        let mut offset = 0;
        loop {
            match Message::decode(&self.buf[offset..]) {
                Ok(Some((message, used))) => {
                    messages.push(message);
                    offset += used;
                }
                Ok(None) => break,
                Err(e) => {
                    self.buf.clear();
                    return Err(e);
                }
            }
        }
        self.buf.drain(..offset);
        Ok(messages)
    }
}
