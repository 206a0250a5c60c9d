//! Single-threaded readiness reactor for host-side daemons.
//!
//! A daemon registers every connection it serves (the monitor channel,
//! device descriptors, worker-thread events) as a [`ReactorUser`] and then
//! calls [`Reactor::select`] in a loop. Each call dispatches at most one
//! ready user, rotating the starting point so a busy user cannot starve
//! the others.

pub mod channel;
pub mod event;
pub mod packet;
pub mod poller;

pub use channel::MessageChannel;
pub use event::{Event, EventUser};
pub use packet::PacketUser;
pub use poller::Poller;

use std::cell::Cell;
use std::io;
use std::os::fd::RawFd;
use std::time::Duration;

use crate::error::{Error, Result};

/// Index of a user registered with a [`Reactor`].
pub type UserId = usize;

/// A connection driven by the reactor.
pub trait ReactorUser {
    /// Descriptor polled for readiness.
    fn fd(&self) -> RawFd;

    fn wants_read(&self) -> bool {
        true
    }

    fn wants_write(&self) -> bool {
        false
    }

    /// Called when the descriptor is readable.
    ///
    /// Returning [`Error::BrokenConnection`] unregisters the user.
    fn on_readable(&mut self, control: &mut Control<'_>) -> Result<()>;

    fn on_writable(&mut self, _control: &mut Control<'_>) -> Result<()> {
        Ok(())
    }

    /// Whether [`ReactorUser::send`] would currently accept data.
    fn can_send(&self) -> bool {
        true
    }

    /// Queue `data` on the connection without blocking.
    fn send(&mut self, _data: &[u8]) -> Result<()> {
        Err(Error::DeviceError("reactor user does not accept data".into()))
    }
}

/// What a callback may do to the reactor that is dispatching it.
pub struct Control<'a> {
    current: UserId,
    users: &'a mut [Option<Box<dyn ReactorUser>>],
    removals: &'a mut Vec<UserId>,
}

impl Control<'_> {
    /// Id of the user whose callback is running.
    pub fn user_id(&self) -> UserId {
        self.current
    }

    /// Send to another registered user.
    ///
    /// The running user is borrowed by its own callback and sends directly.
    pub fn send(&mut self, user: UserId, data: &[u8]) -> Result<()> {
        if user == self.current {
            return Err(Error::InvalidState {
                expected: "another reactor user".into(),
                actual: format!("user {} is dispatching", user),
            });
        }
        match self.users.get_mut(user) {
            Some(Some(target)) => target.send(data),
            _ => Err(Error::DeviceNotFound(format!("reactor user {}", user))),
        }
    }

    /// Unregister `user` once the running callback returns.
    pub fn remove(&mut self, user: UserId) {
        if !self.removals.contains(&user) {
            self.removals.push(user);
        }
    }

    /// Unregister the running user once its callback returns.
    pub fn remove_self(&mut self) {
        let current = self.current;
        self.remove(current);
    }
}

thread_local! {
    static IN_SELECT: Cell<bool> = const { Cell::new(false) };
}

struct SelectGuard;

impl SelectGuard {
    fn enter() -> Result<Self> {
        if IN_SELECT.with(|flag| flag.replace(true)) {
            if cfg!(debug_assertions) {
                panic!("Reactor::select called reentrantly");
            }
            return Err(Error::InvalidState {
                expected: "idle reactor".into(),
                actual: "select already running on this thread".into(),
            });
        }
        Ok(SelectGuard)
    }
}

impl Drop for SelectGuard {
    fn drop(&mut self) {
        IN_SELECT.with(|flag| flag.set(false));
    }
}

pub(crate) fn poll_timeout(timeout: Option<Duration>) -> libc::c_int {
    match timeout {
        None => -1,
        Some(d) => {
            // Round up so a sub-millisecond timeout still waits.
            let ms = d.as_micros().div_ceil(1000);
            ms.min(libc::c_int::MAX as u128) as libc::c_int
        }
    }
}

/// Readiness multiplexer over a set of [`ReactorUser`]s.
#[derive(Default)]
pub struct Reactor {
    users: Vec<Option<Box<dyn ReactorUser>>>,
    next: usize,
}

impl Reactor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a user. Its initial state is waiting for input.
    pub fn add(&mut self, user: Box<dyn ReactorUser>) -> UserId {
        if let Some(id) = self.users.iter().position(Option::is_none) {
            self.users[id] = Some(user);
            id
        } else {
            self.users.push(Some(user));
            self.users.len() - 1
        }
    }

    /// Unregister a user, dropping it and closing its descriptor.
    ///
    /// From inside a callback use [`Control::remove`] instead.
    pub fn remove(&mut self, user: UserId) -> bool {
        match self.users.get_mut(user) {
            Some(slot) => slot.take().is_some(),
            None => false,
        }
    }

    pub fn contains(&self, user: UserId) -> bool {
        matches!(self.users.get(user), Some(Some(_)))
    }

    pub fn len(&self) -> usize {
        self.users.iter().filter(|u| u.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether `user` is registered and has room to send.
    pub fn can_send(&self, user: UserId) -> bool {
        matches!(self.users.get(user), Some(Some(target)) if target.can_send())
    }

    /// Send to a registered user from outside any callback.
    pub fn send(&mut self, user: UserId, data: &[u8]) -> Result<()> {
        match self.users.get_mut(user) {
            Some(Some(target)) => target.send(data),
            _ => Err(Error::DeviceNotFound(format!("reactor user {}", user))),
        }
    }

    /// Wait for a user to become ready and dispatch it.
    ///
    /// `None` waits forever; `Some(Duration::ZERO)` only polls. An elapsed
    /// timeout is not an error. A disconnected user is unregistered and
    /// reported as [`Error::BrokenConnection`]. Waiting forever with no
    /// users registered is refused as [`Error::InvalidState`].
    pub fn select(&mut self, timeout: Option<Duration>) -> Result<()> {
        let _guard = SelectGuard::enter()?;

        let slots = self.users.len();
        let order: Vec<UserId> = (0..slots)
            .map(|i| (self.next + i) % slots.max(1))
            .filter(|&id| self.users[id].is_some())
            .collect();

        if order.is_empty() {
            let Some(d) = timeout else {
                return Err(Error::InvalidState {
                    expected: "at least one reactor user".into(),
                    actual: "select without timeout on an empty reactor".into(),
                });
            };
            std::thread::sleep(d);
            return Ok(());
        }

        let mut fds: Vec<libc::pollfd> = order
            .iter()
            .filter_map(|&id| self.users[id].as_ref())
            .map(|user| {
                let mut events = 0;
                if user.wants_read() {
                    events |= libc::POLLIN;
                }
                if user.wants_write() {
                    events |= libc::POLLOUT;
                }
                libc::pollfd {
                    fd: user.fd(),
                    events,
                    revents: 0,
                }
            })
            .collect();

        let rc = unsafe {
            libc::poll(
                fds.as_mut_ptr(),
                fds.len() as libc::nfds_t,
                poll_timeout(timeout),
            )
        };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(());
            }
            return Err(err.into());
        }
        if rc == 0 {
            return Ok(());
        }

        let Some((id, revents)) = order
            .iter()
            .zip(&fds)
            .find(|(_, pfd)| pfd.revents != 0)
            .map(|(&id, pfd)| (id, pfd.revents))
        else {
            return Ok(());
        };
        self.next = (id + 1) % slots;
        crate::debug_reactor!(user = id, revents, "dispatch");

        if revents & (libc::POLLIN | libc::POLLOUT) == 0 {
            // Hangup or error with nothing left to read.
            tracing::debug!(user = id, revents, "reactor user disconnected");
            self.users[id] = None;
            return Err(Error::BrokenConnection { user: id });
        }

        self.dispatch(id, revents)
    }

    fn dispatch(&mut self, id: UserId, revents: libc::c_short) -> Result<()> {
        let Some(mut user) = self.users[id].take() else {
            return Ok(());
        };
        let mut removals = Vec::new();

        let result = {
            let mut control = Control {
                current: id,
                users: &mut self.users,
                removals: &mut removals,
            };
            let mut result = Ok(());
            if revents & libc::POLLIN != 0 {
                result = user.on_readable(&mut control);
            }
            if result.is_ok() && revents & libc::POLLOUT != 0 {
                result = user.on_writable(&mut control);
            }
            result
        };

        let broken = matches!(result, Err(Error::BrokenConnection { .. }));
        if !broken && !removals.contains(&id) {
            self.users[id] = Some(user);
        } else {
            drop(user);
        }
        for other in removals {
            if other != id {
                self.remove(other);
            }
        }

        match result {
            Err(Error::BrokenConnection { .. }) => {
                tracing::debug!(user = id, "reactor user closed its connection");
                Err(Error::BrokenConnection { user: id })
            }
            other => other,
        }
    }
}

impl std::fmt::Debug for Reactor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reactor")
            .field("users", &self.len())
            .field("next", &self.next)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::unix::net::UnixStream;
    use std::rc::Rc;
    use std::sync::Arc;
    use std::time::Instant;

    #[test]
    fn test_poll_timeout() {
        assert_eq!(poll_timeout(None), -1);
        assert_eq!(poll_timeout(Some(Duration::ZERO)), 0);
        assert_eq!(poll_timeout(Some(Duration::from_micros(10))), 1);
        assert_eq!(poll_timeout(Some(Duration::from_secs(2))), 2000);
    }

    #[test]
    fn test_select_nothing_ready() {
        let (a, _b) = UnixStream::pair().unwrap();
        let called = Rc::new(Cell::new(false));
        let flag = Rc::clone(&called);
        let mut reactor = Reactor::new();
        reactor.add(Box::new(
            PacketUser::new(a, move |_, _| {
                flag.set(true);
                Ok(())
            })
            .unwrap(),
        ));

        let start = Instant::now();
        reactor.select(Some(Duration::ZERO)).unwrap();
        reactor.select(Some(Duration::from_millis(20))).unwrap();
        assert!(start.elapsed() < Duration::from_secs(1));
        assert!(!called.get());
        assert_eq!(reactor.len(), 1);
    }

    #[test]
    fn test_select_on_empty_reactor() {
        let mut reactor = Reactor::new();
        assert!(matches!(reactor.select(None), Err(Error::InvalidState { .. })));

        let start = Instant::now();
        reactor.select(Some(Duration::from_millis(10))).unwrap();
        assert!(start.elapsed() >= Duration::from_millis(10));
    }

    #[test]
    fn test_round_robin() {
        let hits = Rc::new(Cell::new([0u32; 2]));
        let mut reactor = Reactor::new();
        let events: Vec<Arc<Event>> = (0..2).map(|_| Arc::new(Event::new().unwrap())).collect();

        for (i, event) in events.iter().enumerate() {
            let hits = Rc::clone(&hits);
            let event_again = Arc::clone(event);
            reactor.add(Box::new(EventUser::new(Arc::clone(event), move |_| {
                let mut h = hits.get();
                h[i] += 1;
                hits.set(h);
                // Stay ready so both users are always eligible.
                event_again.signal()
            })));
            event.signal().unwrap();
        }

        for _ in 0..10 {
            reactor.select(Some(Duration::ZERO)).unwrap();
        }
        assert_eq!(hits.get(), [5, 5]);
    }

    #[test]
    fn test_broken_connection() {
        let (a, b) = UnixStream::pair().unwrap();
        let mut reactor = Reactor::new();
        let id = reactor.add(Box::new(PacketUser::new(a, |_, _| Ok(())).unwrap()));

        drop(b);
        let err = reactor.select(Some(Duration::from_secs(5))).unwrap_err();
        assert!(matches!(err, Error::BrokenConnection { user } if user == id));
        assert!(!reactor.contains(id));
        assert!(reactor.is_empty());
    }

    #[test]
    fn test_remove_from_callback() {
        let (a, mut b) = UnixStream::pair().unwrap();
        let (c, _d) = UnixStream::pair().unwrap();
        let mut reactor = Reactor::new();
        let other = reactor.add(Box::new(PacketUser::new(c, |_, _| Ok(())).unwrap()));
        let id = reactor.add(Box::new(
            PacketUser::new(a, move |_, control| {
                control.remove_self();
                control.remove(other);
                Ok(())
            })
            .unwrap(),
        ));

        b.write_all(b"bye").unwrap();
        reactor.select(Some(Duration::from_secs(5))).unwrap();
        assert!(!reactor.contains(id));
        assert!(!reactor.contains(other));

        // The slot is reused.
        let (e, _f) = UnixStream::pair().unwrap();
        let reused = reactor.add(Box::new(PacketUser::new(e, |_, _| Ok(())).unwrap()));
        assert!(reused == id || reused == other);
    }

    #[test]
    fn test_send_to_other_user_from_callback() {
        let (a, mut a_peer) = UnixStream::pair().unwrap();
        let (c, mut c_peer) = UnixStream::pair().unwrap();
        let mut reactor = Reactor::new();
        let echo_to = reactor.add(Box::new(PacketUser::new(c, |_, _| Ok(())).unwrap()));
        reactor.add(Box::new(
            PacketUser::new(a, move |data, control| control.send(echo_to, data)).unwrap(),
        ));

        a_peer.write_all(b"ping").unwrap();
        reactor.select(Some(Duration::from_secs(5))).unwrap();

        let mut buf = [0u8; 4];
        std::io::Read::read_exact(&mut c_peer, &mut buf).unwrap();
        assert_eq!(&buf, b"ping");
    }

    #[test]
    #[should_panic(expected = "reentrantly")]
    fn test_nested_select_panics() {
        let event = Arc::new(Event::new().unwrap());
        event.signal().unwrap();

        let mut reactor = Reactor::new();
        reactor.add(Box::new(EventUser::new(Arc::clone(&event), |_| {
            let mut inner = Reactor::new();
            inner.select(Some(Duration::ZERO))
        })));
        let _ = reactor.select(Some(Duration::ZERO));
    }
}
