//! Background pollers for descriptors the reactor cannot wait on directly.
//!
//! A poller's thread performs the blocking OS call and signals an [`Event`]
//! the reactor waits on. It never touches router or guest memory state.

use std::io;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use super::event::Event;
use super::poll_timeout;
use crate::error::Result;

/// Block until `fd` is readable or `cancel` is signalled.
///
/// Returns `true` when `fd` is readable, `false` when cancelled or timed out.
pub fn wait_readable(fd: RawFd, cancel: &Event, timeout: Option<Duration>) -> Result<bool> {
    let mut fds = [
        libc::pollfd {
            fd,
            events: libc::POLLIN,
            revents: 0,
        },
        libc::pollfd {
            fd: cancel.fd(),
            events: libc::POLLIN,
            revents: 0,
        },
    ];
    loop {
        let rc = unsafe { libc::poll(fds.as_mut_ptr(), 2, poll_timeout(timeout)) };
        if rc >= 0 {
            break;
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err.into());
        }
    }
    Ok(fds[1].revents == 0 && fds[0].revents != 0)
}

/// Marks a worker finished when its thread exits, unwinding included.
struct FinishGuard {
    name: String,
    running: Arc<AtomicBool>,
    finished: Arc<Event>,
}

impl Drop for FinishGuard {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Err(e) = self.finished.signal() {
            tracing::error!(poller = %self.name, error = %e, "failed to signal finish");
        }
        if thread::panicking() {
            tracing::error!(poller = %self.name, "poller work panicked");
        } else {
            tracing::debug!(poller = %self.name, "poller finished");
        }
    }
}

/// A worker thread with cooperative cancellation.
///
/// The work function is called in a loop with the cancel event. It returns
/// `Ok(true)` when it has something for the reactor, which signals
/// [`Poller::ready`]. Cancelling signals the cancel event, the worker
/// observes it and exits, and the owner waits for the finished event before
/// joining.
pub struct Poller {
    name: String,
    cancel: Arc<Event>,
    ready: Arc<Event>,
    finished: Arc<Event>,
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Poller {
    pub fn spawn<F>(name: &str, mut work: F) -> Result<Self>
    where
        F: FnMut(&Event) -> Result<bool> + Send + 'static,
    {
        let cancel = Arc::new(Event::new()?);
        let ready = Arc::new(Event::new()?);
        let finished = Arc::new(Event::new()?);
        let running = Arc::new(AtomicBool::new(true));

        let handle = {
            let cancel = Arc::clone(&cancel);
            let ready = Arc::clone(&ready);
            let finished = Arc::clone(&finished);
            let running = Arc::clone(&running);
            let thread_name = name.to_string();
            thread::Builder::new().name(name.to_string()).spawn(move || {
                let _finish = FinishGuard {
                    name: thread_name.clone(),
                    running: Arc::clone(&running),
                    finished,
                };
                tracing::debug!(poller = %thread_name, "poller started");
                while running.load(Ordering::SeqCst) {
                    match cancel.is_signaled() {
                        Ok(false) => {}
                        Ok(true) => break,
                        Err(e) => {
                            tracing::error!(poller = %thread_name, error = %e, "cancel check failed");
                            break;
                        }
                    }
                    match work(&cancel) {
                        Ok(true) => {
                            if let Err(e) = ready.signal() {
                                tracing::error!(poller = %thread_name, error = %e, "failed to wake reactor");
                                break;
                            }
                        }
                        Ok(false) => {}
                        Err(e) => {
                            tracing::warn!(poller = %thread_name, error = %e, "poller stopped");
                            break;
                        }
                    }
                }
            })?
        };

        Ok(Self {
            name: name.to_string(),
            cancel,
            ready,
            finished,
            running,
            handle: Some(handle),
        })
    }

    /// Event signalled whenever the work function reports data.
    ///
    /// Register it with the reactor through an `EventUser`.
    pub fn ready(&self) -> Arc<Event> {
        Arc::clone(&self.ready)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Stop the worker and wait for it to finish.
    pub fn cancel(&mut self) -> Result<()> {
        let Some(handle) = self.handle.take() else {
            return Ok(());
        };
        self.running.store(false, Ordering::SeqCst);
        self.cancel.signal()?;
        self.finished.wait(None)?;
        if handle.join().is_err() {
            tracing::error!(poller = %self.name, "poller thread panicked");
        }
        Ok(())
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        if let Err(e) = self.cancel() {
            tracing::error!(poller = %self.name, error = %e, "failed to cancel poller");
        }
    }
}

impl std::fmt::Debug for Poller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Poller")
            .field("name", &self.name)
            .field("running", &self.is_running())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactor::{EventUser, Reactor};
    use std::io::{Read, Write};
    use std::os::fd::AsRawFd;
    use std::os::unix::net::UnixStream;
    use std::sync::Mutex;
    use std::time::Instant;

    #[test]
    fn test_poller_wakes_reactor() {
        let (mut device, mut peer) = UnixStream::pair().unwrap();
        let inbox = Arc::new(Mutex::new(Vec::new()));
        let worker_inbox = Arc::clone(&inbox);

        let mut poller = Poller::spawn("test-poller", move |cancel| {
            if !wait_readable(device.as_raw_fd(), cancel, None)? {
                return Ok(false);
            }
            let mut buf = [0u8; 64];
            let n = device.read(&mut buf)?;
            worker_inbox.lock().unwrap().extend_from_slice(&buf[..n]);
            Ok(n > 0)
        })
        .unwrap();

        let delivered = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&delivered);
        let reactor_inbox = Arc::clone(&inbox);
        let mut reactor = Reactor::new();
        reactor.add(Box::new(EventUser::new(poller.ready(), move |_| {
            sink.lock().unwrap().append(&mut reactor_inbox.lock().unwrap());
            Ok(())
        })));

        peer.write_all(b"packet").unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while delivered.lock().unwrap().len() < 6 && Instant::now() < deadline {
            reactor.select(Some(Duration::from_millis(100))).unwrap();
        }
        assert_eq!(delivered.lock().unwrap().as_slice(), b"packet");

        assert!(poller.is_running());
        poller.cancel().unwrap();
        assert!(!poller.is_running());
    }

    #[test]
    fn test_cancel_unblocks_worker() {
        let (device, _peer) = UnixStream::pair().unwrap();
        let mut poller = Poller::spawn("idle-poller", move |cancel| {
            wait_readable(device.as_raw_fd(), cancel, None)
        })
        .unwrap();

        std::thread::sleep(Duration::from_millis(20));
        let start = Instant::now();
        poller.cancel().unwrap();
        assert!(start.elapsed() < Duration::from_secs(2));
        // A second cancel is a no-op.
        poller.cancel().unwrap();
    }

    #[test]
    fn test_work_error_stops_poller() {
        let poller = Poller::spawn("failing-poller", |_| {
            Err(crate::error::Error::DeviceError("device vanished".into()))
        })
        .unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while poller.is_running() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(!poller.is_running());
        drop(poller);
    }

    #[test]
    fn test_panicking_work_still_finishes() {
        let mut poller = Poller::spawn("buggy-poller", |_| -> Result<bool> {
            panic!("driver bug");
        })
        .unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while poller.is_running() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(!poller.is_running());

        let start = Instant::now();
        poller.cancel().unwrap();
        assert!(start.elapsed() < Duration::from_secs(2));
    }
}
