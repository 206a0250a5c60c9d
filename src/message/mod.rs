//! Message envelopes exchanged between the guest kernel, the monitor and
//! host daemons.
//!
//! ## Wire format
//!
//! ```text
//! Message Header (14 bytes, little-endian):
//!   - from: u32      (sending endpoint)
//!   - to: u32        (destination endpoint)
//!   - priority: u8   (0=Discardable, 1=Important)
//!   - kind: u8       (0=String, 1=Other)
//!   - size: u32      (payload length)
//! Payload:
//!   - [u8; size]
//! ```
//!
//! Several envelopes are packed back to back in one transport write; a
//! reader reassembles them from the `size` fields (see [`wire::MessageReader`]).

pub mod payload;
pub mod queue;
pub mod switch;
pub mod wire;

use std::fmt;

use crate::error::{Error, Result};

pub use payload::{
    DaemonMessage, LifecycleMessage, LinuxMessage, PowerMessage, TerminationReason, MAX_SNAPSHOT_SIZE,
};
pub use queue::MessageQueue;
pub use switch::{MessageSink, Router, SwitchControl, Target};
pub use wire::{MessageReader, HEADER_SIZE, MAX_MESSAGE_SIZE};

/// Per-class unit counts of the endpoint namespace.
pub mod limits {
    pub const MAX_CONET: u32 = 32;
    pub const MAX_COBD: u32 = 32;
    pub const MAX_COFS: u32 = 32;
    pub const MAX_SERIAL: u32 = 64;
    pub const MAX_COSCSI: u32 = 32;
    pub const MAX_COVIDEO: u32 = 2;
    pub const MAX_COAUDIO: u32 = 1;
    pub const MAX_EXECUTE: u32 = 8;
}

/// A message source or destination.
///
/// The namespace is partitioned into fixed roles followed by per-unit
/// ranges; ids are stable for the lifetime of an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EndpointId(pub u32);

impl EndpointId {
    pub const LINUX: Self = Self(0);
    pub const MONITOR: Self = Self(1);
    pub const DAEMON: Self = Self(2);
    pub const IDLE: Self = Self(3);
    pub const KERNEL_SWITCH: Self = Self(4);
    pub const USER_SWITCH: Self = Self(5);
    pub const CONSOLE: Self = Self(6);
    pub const PRINTK: Self = Self(7);

    pub const CONET0: Self = Self(8);
    pub const COBD0: Self = Self(Self::CONET0.0 + limits::MAX_CONET);
    pub const COFS0: Self = Self(Self::COBD0.0 + limits::MAX_COBD);
    pub const SERIAL0: Self = Self(Self::COFS0.0 + limits::MAX_COFS);
    pub const COSCSI0: Self = Self(Self::SERIAL0.0 + limits::MAX_SERIAL);
    pub const COVIDEO0: Self = Self(Self::COSCSI0.0 + limits::MAX_COSCSI);
    pub const COAUDIO0: Self = Self(Self::COVIDEO0.0 + limits::MAX_COVIDEO);
    pub const EXECUTE0: Self = Self(Self::COAUDIO0.0 + limits::MAX_COAUDIO);
    pub const USER0: Self = Self(Self::EXECUTE0.0 + limits::MAX_EXECUTE);

    /// Network unit endpoint.
    pub const fn conet(unit: u32) -> Self {
        Self(Self::CONET0.0 + unit)
    }

    /// Block unit endpoint.
    pub const fn cobd(unit: u32) -> Self {
        Self(Self::COBD0.0 + unit)
    }

    /// Serial unit endpoint.
    pub const fn serial(unit: u32) -> Self {
        Self(Self::SERIAL0.0 + unit)
    }

    /// SCSI unit endpoint.
    pub const fn coscsi(unit: u32) -> Self {
        Self(Self::COSCSI0.0 + unit)
    }

    /// Video unit endpoint.
    pub const fn covideo(unit: u32) -> Self {
        Self(Self::COVIDEO0.0 + unit)
    }

    /// Role of this endpoint within the namespace.
    pub fn role(self) -> EndpointRole {
        let id = self.0;
        let unit_in = |first: Self, count: u32| {
            (id >= first.0 && id < first.0 + count).then(|| id - first.0)
        };

        match self {
            Self::LINUX => return EndpointRole::Linux,
            Self::MONITOR => return EndpointRole::Monitor,
            Self::DAEMON => return EndpointRole::Daemon,
            Self::IDLE => return EndpointRole::Idle,
            Self::KERNEL_SWITCH => return EndpointRole::KernelSwitch,
            Self::USER_SWITCH => return EndpointRole::UserSwitch,
            Self::CONSOLE => return EndpointRole::Console,
            Self::PRINTK => return EndpointRole::Printk,
            _ => {}
        }

        if let Some(unit) = unit_in(Self::CONET0, limits::MAX_CONET) {
            EndpointRole::Network(unit)
        } else if let Some(unit) = unit_in(Self::COBD0, limits::MAX_COBD) {
            EndpointRole::Block(unit)
        } else if let Some(unit) = unit_in(Self::COFS0, limits::MAX_COFS) {
            EndpointRole::Filesystem(unit)
        } else if let Some(unit) = unit_in(Self::SERIAL0, limits::MAX_SERIAL) {
            EndpointRole::Serial(unit)
        } else if let Some(unit) = unit_in(Self::COSCSI0, limits::MAX_COSCSI) {
            EndpointRole::Scsi(unit)
        } else if let Some(unit) = unit_in(Self::COVIDEO0, limits::MAX_COVIDEO) {
            EndpointRole::Video(unit)
        } else if let Some(unit) = unit_in(Self::COAUDIO0, limits::MAX_COAUDIO) {
            EndpointRole::Audio(unit)
        } else if let Some(unit) = unit_in(Self::EXECUTE0, limits::MAX_EXECUTE) {
            EndpointRole::Execute(unit)
        } else {
            EndpointRole::User(id - Self::USER0.0)
        }
    }

    /// Check if this endpoint belongs to a per-unit peripheral range.
    pub fn is_unit(self) -> bool {
        matches!(
            self.role(),
            EndpointRole::Network(_)
                | EndpointRole::Block(_)
                | EndpointRole::Filesystem(_)
                | EndpointRole::Serial(_)
                | EndpointRole::Scsi(_)
                | EndpointRole::Video(_)
                | EndpointRole::Audio(_)
        )
    }
}

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.role() {
            EndpointRole::Linux => write!(f, "linux"),
            EndpointRole::Monitor => write!(f, "monitor"),
            EndpointRole::Daemon => write!(f, "daemon"),
            EndpointRole::Idle => write!(f, "idle"),
            EndpointRole::KernelSwitch => write!(f, "kernel"),
            EndpointRole::UserSwitch => write!(f, "user"),
            EndpointRole::Console => write!(f, "console"),
            EndpointRole::Printk => write!(f, "printk"),
            EndpointRole::Network(unit) => write!(f, "net{}", unit),
            EndpointRole::Block(unit) => write!(f, "cobd{}", unit),
            EndpointRole::Scsi(unit) => write!(f, "scsi{}", unit),
            EndpointRole::Serial(unit) => write!(f, "serial{}", unit),
            _ => write!(f, "unknown<{}>", self.0),
        }
    }
}

/// What an endpoint id stands for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointRole {
    Linux,
    Monitor,
    Daemon,
    Idle,
    KernelSwitch,
    UserSwitch,
    Console,
    Printk,
    Network(u32),
    Block(u32),
    Filesystem(u32),
    Serial(u32),
    Scsi(u32),
    Video(u32),
    Audio(u32),
    Execute(u32),
    User(u32),
}

/// Whether an envelope may be lost under backpressure.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    /// Console redraws, network packets, debug output.
    Discardable = 0,
    /// Power control, attach/detach, state snapshots.
    Important = 1,
}

impl TryFrom<u8> for Priority {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(Priority::Discardable),
            1 => Ok(Priority::Important),
            _ => Err(Error::InvalidMessage(format!("invalid priority {}", value))),
        }
    }
}

/// Payload interpretation hint.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    String = 0,
    Other = 1,
}

impl TryFrom<u8> for MessageKind {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(MessageKind::String),
            1 => Ok(MessageKind::Other),
            _ => Err(Error::InvalidMessage(format!("invalid message kind {}", value))),
        }
    }
}

/// Outcome of handing an envelope to the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Accepted by exactly one consumer.
    Delivered,
    /// Discardable envelope dropped under backpressure or routing failure.
    Dropped,
    /// Guest request for a unit that is not attached.
    NotPresent,
}

/// One envelope on the bus.
///
/// Immutable after creation; the payload length is always the length of
/// the owned buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    from: EndpointId,
    to: EndpointId,
    priority: Priority,
    kind: MessageKind,
    payload: Vec<u8>,
}

impl Message {
    /// Create a new envelope.
    pub fn new(
        from: EndpointId,
        to: EndpointId,
        priority: Priority,
        kind: MessageKind,
        payload: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            from,
            to,
            priority,
            kind,
            payload: payload.into(),
        }
    }

    /// Create a discardable `Other` envelope.
    pub fn discardable(from: EndpointId, to: EndpointId, payload: impl Into<Vec<u8>>) -> Self {
        Self::new(from, to, Priority::Discardable, MessageKind::Other, payload)
    }

    /// Create an important `Other` envelope.
    pub fn important(from: EndpointId, to: EndpointId, payload: impl Into<Vec<u8>>) -> Self {
        Self::new(from, to, Priority::Important, MessageKind::Other, payload)
    }

    pub fn from(&self) -> EndpointId {
        self.from
    }

    pub fn to(&self) -> EndpointId {
        self.to
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Take the payload out of the envelope.
    pub fn into_payload(self) -> Vec<u8> {
        self.payload
    }

    /// Check if the envelope may be dropped under backpressure.
    pub fn is_discardable(&self) -> bool {
        self.priority == Priority::Discardable
    }

    /// Bytes this envelope occupies on the wire.
    pub fn wire_size(&self) -> usize {
        HEADER_SIZE + self.payload.len()
    }

    /// Payload as text, for `String` envelopes. Stops at the first NUL.
    pub fn text(&self) -> Option<String> {
        if self.kind != MessageKind::String {
            return None;
        }
        let end = self.payload.iter().position(|&b| b == 0).unwrap_or(self.payload.len());
        Some(String::from_utf8_lossy(&self.payload[..end]).into_owned())
    }
}
