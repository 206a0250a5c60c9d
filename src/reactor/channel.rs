//! Envelope channels between a daemon and its monitor.

use std::os::fd::{AsRawFd, OwnedFd, RawFd};

use tokio::sync::mpsc::{self, error::TryRecvError};

use super::event::set_nonblocking;
use super::packet::{read_some, SendBuffer, PACKET_BUFFER_SIZE};
use super::{Control, Reactor, ReactorUser, UserId};
use crate::error::Result;
use crate::message::{Message, MessageReader};

type MessageCallback = Box<dyn FnMut(Message, &mut Control<'_>) -> Result<()>>;

/// A packet connection carrying framed envelopes.
///
/// Reads are reassembled into whole envelopes, however the transport
/// splits them, and each one is handed to the callback in order.
pub struct MessageChannel {
    fd: OwnedFd,
    buffer: Box<[u8]>,
    reader: MessageReader,
    outbound: SendBuffer,
    on_message: MessageCallback,
}

impl MessageChannel {
    pub fn new<F>(fd: impl Into<OwnedFd>, on_message: F) -> Result<Self>
    where
        F: FnMut(Message, &mut Control<'_>) -> Result<()> + 'static,
    {
        let fd = fd.into();
        set_nonblocking(fd.as_raw_fd())?;
        Ok(Self {
            fd,
            buffer: vec![0u8; PACKET_BUFFER_SIZE].into_boxed_slice(),
            reader: MessageReader::new(),
            outbound: SendBuffer::default(),
            on_message: Box::new(on_message),
        })
    }

    /// Encode and send one envelope.
    pub fn send_message(&mut self, message: &Message) -> Result<()> {
        self.outbound.send(self.fd.as_raw_fd(), &message.encode()?)
    }

    /// Bytes of an incomplete envelope held back for the next read.
    pub fn pending(&self) -> usize {
        self.reader.pending()
    }
}

impl ReactorUser for MessageChannel {
    fn fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    fn wants_write(&self) -> bool {
        !self.outbound.is_empty()
    }

    fn on_readable(&mut self, control: &mut Control<'_>) -> Result<()> {
        let Some(n) = read_some(self.fd.as_raw_fd(), &mut self.buffer, control.user_id())? else {
            return Ok(());
        };
        let messages = self.reader.push(&self.buffer[..n]).map_err(|e| {
            tracing::warn!(user = control.user_id(), error = %e, "dropping malformed stream data");
            e
        })?;
        for message in messages {
            (self.on_message)(message, control)?;
        }
        Ok(())
    }

    fn on_writable(&mut self, control: &mut Control<'_>) -> Result<()> {
        self.outbound.flush(self.fd.as_raw_fd(), control.user_id())
    }

    fn can_send(&self) -> bool {
        self.outbound.has_room()
    }

    fn send(&mut self, data: &[u8]) -> Result<()> {
        self.outbound.send(self.fd.as_raw_fd(), data)
    }
}

impl std::fmt::Debug for MessageChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageChannel")
            .field("fd", &self.fd)
            .field("pending", &self.reader.pending())
            .finish()
    }
}

/// Drain envelopes a monitor queued on an outbound channel and write them
/// to reactor user `user`. Returns how many were written.
///
/// Never blocks on the channel; call it from the reactor loop, typically
/// after each `select`. Draining stops while the user's send buffer is
/// full, so the channel fills and the monitor's router sheds discardable
/// traffic or reports important traffic as [`Error::QueueFull`].
///
/// [`Error::QueueFull`]: crate::error::Error::QueueFull
pub fn forward_outbound(
    rx: &mut mpsc::Receiver<Vec<u8>>,
    reactor: &mut Reactor,
    user: UserId,
) -> Result<usize> {
    let mut count = 0;
    while reactor.can_send(user) {
        match rx.try_recv() {
            Ok(bytes) => {
                reactor.send(user, &bytes)?;
                count += 1;
            }
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
        }
    }
    Ok(count)
}
