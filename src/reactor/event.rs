//! Self-pipe event object.
//!
//! Worker threads never call into the reactor; they signal an [`Event`]
//! the reactor is already waiting on.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::Arc;
use std::time::Duration;

use super::{poll_timeout, Control, ReactorUser};
use crate::error::Result;

/// A manual-reset event that can be waited on with `poll`.
///
/// Signalled while its pipe holds at least one byte.
#[derive(Debug)]
pub struct Event {
    read: OwnedFd,
    write: OwnedFd,
}

impl Event {
    pub fn new() -> Result<Self> {
        let mut fds = [0 as RawFd; 2];
        if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
            return Err(io::Error::last_os_error().into());
        }
        let (read, write) = unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };
        for fd in [&read, &write] {
            set_nonblocking(fd.as_raw_fd())?;
        }
        Ok(Self { read, write })
    }

    /// Signal the event. Signalling an already signalled event is a no-op.
    pub fn signal(&self) -> Result<()> {
        let byte = 1u8;
        let n = unsafe { libc::write(self.write.as_raw_fd(), &byte as *const u8 as *const _, 1) };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::WouldBlock {
                return Err(err.into());
            }
        }
        Ok(())
    }

    /// Clear the event.
    pub fn reset(&self) {
        let mut buf = [0u8; 64];
        loop {
            let n = unsafe {
                libc::read(self.read.as_raw_fd(), buf.as_mut_ptr() as *mut _, buf.len())
            };
            if n <= 0 {
                break;
            }
        }
    }

    /// Wait until the event is signalled or `timeout` elapses.
    ///
    /// `None` waits forever. Returns whether the event is signalled.
    pub fn wait(&self, timeout: Option<Duration>) -> Result<bool> {
        let mut pfd = libc::pollfd {
            fd: self.read.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        };
        loop {
            let rc = unsafe { libc::poll(&mut pfd, 1, poll_timeout(timeout)) };
            if rc >= 0 {
                return Ok(rc > 0);
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err.into());
            }
        }
    }

    pub fn is_signaled(&self) -> Result<bool> {
        self.wait(Some(Duration::ZERO))
    }

    /// Descriptor that polls readable while the event is signalled.
    pub fn fd(&self) -> RawFd {
        self.read.as_raw_fd()
    }
}

pub(crate) fn set_nonblocking(fd: RawFd) -> Result<()> {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);
        if flags < 0 || libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            return Err(io::Error::last_os_error().into());
        }
    }
    Ok(())
}

type EventCallback = Box<dyn FnMut(&mut Control<'_>) -> Result<()>>;

/// Reactor user that runs a callback each time an event is signalled.
///
/// The event is reset before the callback runs, so a signal raised while
/// the callback executes is not lost.
pub struct EventUser {
    event: Arc<Event>,
    callback: EventCallback,
}

impl EventUser {
    pub fn new<F>(event: Arc<Event>, callback: F) -> Self
    where
        F: FnMut(&mut Control<'_>) -> Result<()> + 'static,
    {
        Self {
            event,
            callback: Box::new(callback),
        }
    }
}

impl ReactorUser for EventUser {
    fn fd(&self) -> RawFd {
        self.event.fd()
    }

    fn on_readable(&mut self, control: &mut Control<'_>) -> Result<()> {
        self.event.reset();
        (self.callback)(control)
    }
}
