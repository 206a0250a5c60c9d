//! Descriptor-backed packet connections.

use std::io;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};

use super::event::set_nonblocking;
use super::{Control, ReactorUser};
use crate::error::{Error, Result};

/// Read buffer size of a packet user.
pub const PACKET_BUFFER_SIZE: usize = 64 * 1024;

/// Read once from `fd`.
///
/// `Ok(None)` means nothing was available after all; end of stream and a
/// reset peer are reported as [`Error::BrokenConnection`].
pub(crate) fn read_some(fd: RawFd, buf: &mut [u8], user: usize) -> Result<Option<usize>> {
    loop {
        let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut _, buf.len()) };
        if n > 0 {
            return Ok(Some(n as usize));
        }
        if n == 0 {
            return Err(Error::BrokenConnection { user });
        }
        let err = io::Error::last_os_error();
        match err.kind() {
            io::ErrorKind::Interrupted => continue,
            io::ErrorKind::WouldBlock => return Ok(None),
            io::ErrorKind::ConnectionReset => return Err(Error::BrokenConnection { user }),
            _ => return Err(err.into()),
        }
    }
}

/// Outbound bytes a connection holds before refusing more.
pub const SEND_BUFFER_LIMIT: usize = 4 * PACKET_BUFFER_SIZE;

/// Write as much of `data` as `fd` accepts without blocking.
pub(crate) fn write_some(fd: RawFd, data: &[u8]) -> io::Result<usize> {
    loop {
        let n = unsafe { libc::write(fd, data.as_ptr() as *const _, data.len()) };
        if n >= 0 {
            return Ok(n as usize);
        }
        let err = io::Error::last_os_error();
        match err.kind() {
            io::ErrorKind::Interrupted => continue,
            io::ErrorKind::WouldBlock => return Ok(0),
            _ => return Err(err),
        }
    }
}

/// Bytes written to a non-blocking connection but not yet accepted by it.
///
/// Sends never block the reactor thread: what the descriptor does not take
/// right away is kept here and flushed when it becomes writable. Once
/// [`SEND_BUFFER_LIMIT`] bytes are waiting, further sends are refused.
#[derive(Debug, Default)]
pub(crate) struct SendBuffer {
    pending: Vec<u8>,
}

impl SendBuffer {
    pub(crate) fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub(crate) fn has_room(&self) -> bool {
        self.pending.len() < SEND_BUFFER_LIMIT
    }

    /// Queue `data` whole, writing what the descriptor takes now.
    pub(crate) fn send(&mut self, fd: RawFd, data: &[u8]) -> Result<()> {
        if !self.has_room() {
            return Err(Error::SendBufferFull {
                pending: self.pending.len(),
            });
        }
        let written = if self.pending.is_empty() {
            write_some(fd, data)?
        } else {
            0
        };
        self.pending.extend_from_slice(&data[written..]);
        Ok(())
    }

    /// Write pending bytes once the descriptor reports room.
    ///
    /// A peer that went away is reported as [`Error::BrokenConnection`].
    pub(crate) fn flush(&mut self, fd: RawFd, user: usize) -> Result<()> {
        if !self.pending.is_empty() {
            let n = write_some(fd, &self.pending).map_err(|e| match e.kind() {
                io::ErrorKind::BrokenPipe | io::ErrorKind::ConnectionReset => {
                    Error::BrokenConnection { user }
                }
                _ => e.into(),
            })?;
            self.pending.drain(..n);
            crate::debug_reactor!(user, written = n, left = self.pending.len(), "flush");
        }
        Ok(())
    }
}

type ReceiveCallback = Box<dyn FnMut(&[u8], &mut Control<'_>) -> Result<()>>;

/// A connection that hands each chunk it reads to a callback.
pub struct PacketUser {
    fd: OwnedFd,
    buffer: Box<[u8]>,
    outbound: SendBuffer,
    on_receive: ReceiveCallback,
}

impl PacketUser {
    /// Wrap a connected descriptor (a socket, pipe or device handle).
    pub fn new<F>(fd: impl Into<OwnedFd>, on_receive: F) -> Result<Self>
    where
        F: FnMut(&[u8], &mut Control<'_>) -> Result<()> + 'static,
    {
        let fd = fd.into();
        set_nonblocking(fd.as_raw_fd())?;
        Ok(Self {
            fd,
            buffer: vec![0u8; PACKET_BUFFER_SIZE].into_boxed_slice(),
            outbound: SendBuffer::default(),
            on_receive: Box::new(on_receive),
        })
    }
}

impl ReactorUser for PacketUser {
    fn fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    fn wants_write(&self) -> bool {
        !self.outbound.is_empty()
    }

    fn on_readable(&mut self, control: &mut Control<'_>) -> Result<()> {
        match read_some(self.fd.as_raw_fd(), &mut self.buffer, control.user_id())? {
            Some(n) => (self.on_receive)(&self.buffer[..n], control),
            None => Ok(()),
        }
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

impl std::fmt::Debug for PacketUser {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PacketUser")
            .field("fd", &self.fd)
            .field("outbound", &self.outbound.pending.len())
            .finish()
    }
}
