//! Typed payloads carried inside envelopes.
//!
//! All multi-byte fields are little-endian, matching the envelope header.

use super::{EndpointId, Message, MessageKind, Priority, MAX_MESSAGE_SIZE};
use crate::device::DeviceClass;
use crate::error::{Error, Result};

fn read_u32(data: &[u8], at: usize) -> Result<u32> {
    data.get(at..at + 4)
        .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .ok_or_else(|| Error::InvalidMessage(format!("payload truncated at offset {}", at)))
}

/// Why a monitor stopped running the guest.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationReason {
    Normal = 0,
    Reboot = 1,
    PowerOff = 2,
    Panic = 3,
    Halt = 4,
    Forced = 5,
    Bug = 6,
}

impl TryFrom<u32> for TerminationReason {
    type Error = Error;

    fn try_from(value: u32) -> Result<Self> {
        Ok(match value {
            0 => Self::Normal,
            1 => Self::Reboot,
            2 => Self::PowerOff,
            3 => Self::Panic,
            4 => Self::Halt,
            5 => Self::Forced,
            6 => Self::Bug,
            _ => {
                return Err(Error::InvalidMessage(format!(
                    "unknown termination reason {}",
                    value
                )))
            }
        })
    }
}

/// Monitor to daemon notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DaemonMessage {
    Terminated { reason: TerminationReason },
    DebugLine(String),
    TracePoint,
}

impl DaemonMessage {
    const TERMINATED: u32 = 0;
    const DEBUG_LINE: u32 = 1;
    const TRACE_POINT: u32 = 2;

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(8);
        match self {
            DaemonMessage::Terminated { reason } => {
                out.extend_from_slice(&Self::TERMINATED.to_le_bytes());
                out.extend_from_slice(&(*reason as u32).to_le_bytes());
            }
            DaemonMessage::DebugLine(text) => {
                out.extend_from_slice(&Self::DEBUG_LINE.to_le_bytes());
                out.extend_from_slice(text.as_bytes());
            }
            DaemonMessage::TracePoint => {
                out.extend_from_slice(&Self::TRACE_POINT.to_le_bytes());
            }
        }
        out
    }

    /// Envelope from `from` to the daemon carrying this notification.
    ///
    /// Debug lines travel as `String` envelopes holding just the text; the
    /// other notifications are `Other` envelopes in the encoded form.
    pub fn to_message(&self, from: EndpointId) -> Message {
        match self {
            DaemonMessage::DebugLine(text) => Message::new(
                from,
                EndpointId::DAEMON,
                Priority::Important,
                MessageKind::String,
                text.as_bytes(),
            ),
            other => Message::important(from, EndpointId::DAEMON, other.encode()),
        }
    }

    /// Inverse of [`DaemonMessage::to_message`].
    pub fn from_message(message: &Message) -> Result<Self> {
        match message.text() {
            Some(text) => Ok(DaemonMessage::DebugLine(text)),
            None => Self::decode(message.payload()),
        }
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        match read_u32(data, 0)? {
            Self::TERMINATED => Ok(DaemonMessage::Terminated {
                reason: TerminationReason::try_from(read_u32(data, 4)?)?,
            }),
            Self::DEBUG_LINE => Ok(DaemonMessage::DebugLine(
                String::from_utf8_lossy(&data[4..]).into_owned(),
            )),
            Self::TRACE_POINT => Ok(DaemonMessage::TracePoint),
            other => Err(Error::InvalidMessage(format!(
                "unknown daemon message type {}",
                other
            ))),
        }
    }
}

/// Power requests delivered to the guest kernel.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerMessage {
    CtrlAltDel = 0,
    Shutdown = 1,
    Reboot = 2,
}

impl TryFrom<u32> for PowerMessage {
    type Error = Error;

    fn try_from(value: u32) -> Result<Self> {
        match value {
            0 => Ok(Self::CtrlAltDel),
            1 => Ok(Self::Shutdown),
            2 => Ok(Self::Reboot),
            _ => Err(Error::InvalidMessage(format!("unknown power message {}", value))),
        }
    }
}

/// Payload addressed to the guest kernel: which device driver and unit it
/// is for, and the driver-specific data.
///
/// Layout: `device: u32, unit: u32, size: u32, data[size]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinuxMessage {
    pub device: DeviceClass,
    pub unit: u32,
    pub data: Vec<u8>,
}

impl LinuxMessage {
    pub const HEADER_SIZE: usize = 12;

    pub fn new(device: DeviceClass, unit: u32, data: impl Into<Vec<u8>>) -> Self {
        Self {
            device,
            unit,
            data: data.into(),
        }
    }

    /// Power request for the guest.
    pub fn power(kind: PowerMessage) -> Self {
        Self::new(DeviceClass::Power, 0, (kind as u32).to_le_bytes().to_vec())
    }

    /// Decode the power request carried by this message, if any.
    pub fn as_power(&self) -> Option<PowerMessage> {
        if self.device != DeviceClass::Power {
            return None;
        }
        read_u32(&self.data, 0)
            .ok()
            .and_then(|v| PowerMessage::try_from(v).ok())
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::HEADER_SIZE + self.data.len());
        out.extend_from_slice(&(self.device as u32).to_le_bytes());
        out.extend_from_slice(&self.unit.to_le_bytes());
        out.extend_from_slice(&(self.data.len() as u32).to_le_bytes());
        out.extend_from_slice(&self.data);
        out
    }

    pub fn decode(payload: &[u8]) -> Result<Self> {
        let device = DeviceClass::try_from(read_u32(payload, 0)?)?;
        let unit = read_u32(payload, 4)?;
        let size = read_u32(payload, 8)? as usize;
        let data = payload
            .get(Self::HEADER_SIZE..)
            .filter(|rest| rest.len() == size)
            .ok_or_else(|| {
                Error::InvalidMessage(format!(
                    "linux message declares {} bytes, carries {}",
                    size,
                    payload.len().saturating_sub(Self::HEADER_SIZE)
                ))
            })?;
        Ok(Self::new(device, unit, data))
    }
}

/// Largest device snapshot a lifecycle message can carry.
pub const MAX_SNAPSHOT_SIZE: usize = MAX_MESSAGE_SIZE - 1;

/// Consumer attach and detach notifications.
///
/// Both carry an opaque device snapshot: on attach the producer sends its
/// state to the new consumer; on detach the consumer hands its state back.
/// An attach request from the consumer carries an empty snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleMessage {
    Attach(Vec<u8>),
    Detach(Vec<u8>),
}

impl LifecycleMessage {
    const ATTACH: u8 = 1;
    const DETACH: u8 = 2;

    pub fn encode(&self) -> Vec<u8> {
        let (tag, snapshot) = match self {
            LifecycleMessage::Attach(s) => (Self::ATTACH, s),
            LifecycleMessage::Detach(s) => (Self::DETACH, s),
        };
        let mut out = Vec::with_capacity(1 + snapshot.len());
        out.push(tag);
        out.extend_from_slice(snapshot);
        out
    }

    /// Decode a lifecycle message, or `None` if the payload is something else.
    pub fn decode(payload: &[u8]) -> Option<Self> {
        let (&tag, rest) = payload.split_first()?;
        match tag {
            Self::ATTACH => Some(LifecycleMessage::Attach(rest.to_vec())),
            Self::DETACH => Some(LifecycleMessage::Detach(rest.to_vec())),
            _ => None,
        }
    }
}
