//! Peripheral device tables.
//!
//! Each device class keeps a fixed-size table mapping a unit number to a
//! device. Devices expose the same four entry points: `init` when the
//! monitor starts, `request` for synchronous guest requests, and
//! `attach`/`detach` when a host consumer connects or leaves.

pub mod block;
pub mod console;
pub mod network;
pub mod video;

pub use block::{BlockDevice, BlockRequest};
pub use console::{Cell, Console, ConsoleOp};
pub use network::{NetworkDevice, NetworkRequest};
pub use video::{VideoDevice, VideoRequest};

use std::fmt;

use crate::error::{Error, Result};
use crate::memory::GuestMemory;
use crate::message::{limits, EndpointId};

/// Device classes known to the guest kernel.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceClass {
    Block = 0,
    Console = 1,
    Keyboard = 2,
    Network = 3,
    Timer = 4,
    Power = 5,
    Serial = 6,
    Filesystem = 7,
    Mouse = 8,
    Scsi = 9,
    Video = 10,
    Audio = 11,
}

impl DeviceClass {
    /// Units a table of this class can hold.
    pub fn max_units(self) -> u32 {
        match self {
            DeviceClass::Block => limits::MAX_COBD,
            DeviceClass::Network => limits::MAX_CONET,
            DeviceClass::Serial => limits::MAX_SERIAL,
            DeviceClass::Filesystem => limits::MAX_COFS,
            DeviceClass::Scsi => limits::MAX_COSCSI,
            DeviceClass::Video => limits::MAX_COVIDEO,
            DeviceClass::Audio => limits::MAX_COAUDIO,
            _ => 1,
        }
    }

    /// Message endpoint of a unit of this class, if the class has one.
    pub fn endpoint(self, unit: u32) -> Option<EndpointId> {
        if unit >= self.max_units() {
            return None;
        }
        match self {
            DeviceClass::Block => Some(EndpointId::cobd(unit)),
            DeviceClass::Network => Some(EndpointId::conet(unit)),
            DeviceClass::Serial => Some(EndpointId::serial(unit)),
            DeviceClass::Scsi => Some(EndpointId::coscsi(unit)),
            DeviceClass::Video => Some(EndpointId::covideo(unit)),
            DeviceClass::Console => Some(EndpointId::CONSOLE),
            _ => None,
        }
    }
}

impl TryFrom<u32> for DeviceClass {
    type Error = Error;

    fn try_from(value: u32) -> Result<Self> {
        Ok(match value {
            0 => Self::Block,
            1 => Self::Console,
            2 => Self::Keyboard,
            3 => Self::Network,
            4 => Self::Timer,
            5 => Self::Power,
            6 => Self::Serial,
            7 => Self::Filesystem,
            8 => Self::Mouse,
            9 => Self::Scsi,
            10 => Self::Video,
            11 => Self::Audio,
            _ => return Err(Error::InvalidMessage(format!("unknown device class {}", value))),
        })
    }
}

impl fmt::Display for DeviceClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DeviceClass::Block => "block",
            DeviceClass::Console => "console",
            DeviceClass::Keyboard => "keyboard",
            DeviceClass::Network => "network",
            DeviceClass::Timer => "timer",
            DeviceClass::Power => "power",
            DeviceClass::Serial => "serial",
            DeviceClass::Filesystem => "filesystem",
            DeviceClass::Mouse => "mouse",
            DeviceClass::Scsi => "scsi",
            DeviceClass::Video => "video",
            DeviceClass::Audio => "audio",
        };
        f.write_str(name)
    }
}

/// Guest-visible completion status of a device request.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestStatus {
    Ok = 0,
    Error = -1,
    NotPresent = -2,
}

/// A synchronous request from a guest driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceRequest {
    Block(BlockRequest),
    Network(NetworkRequest),
    Console(ConsoleOp),
    Video(VideoRequest),
}

/// Data returned by a successful request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceReply {
    Done,
    Stat { size: u64 },
    Alias(String),
    Mac([u8; 6]),
    Geometry { width: u32, height: u32, bpp: u32 },
}

/// What the guest sees once a request completes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub status: RequestStatus,
    pub reply: DeviceReply,
}

impl Completion {
    pub fn ok(reply: DeviceReply) -> Self {
        Self {
            status: RequestStatus::Ok,
            reply,
        }
    }

    pub fn failed(status: RequestStatus) -> Self {
        Self {
            status,
            reply: DeviceReply::Done,
        }
    }
}

/// Trait for peripheral devices.
pub trait Device: Send {
    /// Class of the device.
    fn class(&self) -> DeviceClass;

    /// Prepare the device once guest memory exists.
    fn init(&mut self, _memory: &mut GuestMemory) -> Result<()> {
        Ok(())
    }

    /// Serve a synchronous guest request.
    fn request(&mut self, memory: &mut GuestMemory, request: &DeviceRequest) -> Result<DeviceReply>;

    /// A consumer connected: serialize current state for it.
    fn attach(&mut self, _memory: &mut GuestMemory) -> Result<Vec<u8>> {
        Ok(Vec::new())
    }

    /// The consumer left, handing back its state.
    fn detach(&mut self, _snapshot: &[u8]) -> Result<()> {
        Ok(())
    }
}

pub(crate) fn unsupported(class: DeviceClass, request: &DeviceRequest) -> Error {
    Error::DeviceError(format!("{} device cannot serve {:?}", class, request))
}

/// Fixed-capacity unit table of one device class.
pub struct DeviceTable {
    class: DeviceClass,
    slots: Vec<Option<Box<dyn Device>>>,
}

impl DeviceTable {
    pub fn new(class: DeviceClass) -> Self {
        let mut slots = Vec::new();
        slots.resize_with(class.max_units() as usize, || None);
        Self { class, slots }
    }

    pub fn class(&self) -> DeviceClass {
        self.class
    }

    /// Register a device under `unit`.
    pub fn register(&mut self, unit: u32, device: Box<dyn Device>) -> Result<()> {
        if device.class() != self.class {
            return Err(Error::InvalidConfig(format!(
                "{} device registered in {} table",
                device.class(),
                self.class
            )));
        }
        let slot = self.slots.get_mut(unit as usize).ok_or_else(|| {
            Error::InvalidConfig(format!("{} unit {} out of range", self.class, unit))
        })?;
        if slot.is_some() {
            return Err(Error::InvalidConfig(format!(
                "{} unit {} already registered",
                self.class, unit
            )));
        }
        *slot = Some(device);
        Ok(())
    }

    pub fn unregister(&mut self, unit: u32) -> Option<Box<dyn Device>> {
        self.slots.get_mut(unit as usize)?.take()
    }

    pub fn get_mut(&mut self, unit: u32) -> Option<&mut (dyn Device + 'static)> {
        self.slots.get_mut(unit as usize)?.as_deref_mut()
    }

    pub fn contains(&self, unit: u32) -> bool {
        matches!(self.slots.get(unit as usize), Some(Some(_)))
    }

    /// Registered units with their devices.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = (u32, &mut Box<dyn Device>)> {
        self.slots
            .iter_mut()
            .enumerate()
            .filter_map(|(unit, slot)| slot.as_mut().map(|dev| (unit as u32, dev)))
    }

    pub fn len(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for DeviceTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceTable")
            .field("class", &self.class)
            .field("units", &self.len())
            .finish()
    }
}

/// All device tables of one monitor.
#[derive(Debug)]
pub struct DeviceTables {
    pub block: DeviceTable,
    pub network: DeviceTable,
    pub console: DeviceTable,
    pub scsi: DeviceTable,
    pub video: DeviceTable,
}

impl DeviceTables {
    pub fn new() -> Self {
        Self {
            block: DeviceTable::new(DeviceClass::Block),
            network: DeviceTable::new(DeviceClass::Network),
            console: DeviceTable::new(DeviceClass::Console),
            scsi: DeviceTable::new(DeviceClass::Scsi),
            video: DeviceTable::new(DeviceClass::Video),
        }
    }

    pub fn table_mut(&mut self, class: DeviceClass) -> Option<&mut DeviceTable> {
        match class {
            DeviceClass::Block => Some(&mut self.block),
            DeviceClass::Network => Some(&mut self.network),
            DeviceClass::Console => Some(&mut self.console),
            DeviceClass::Scsi => Some(&mut self.scsi),
            DeviceClass::Video => Some(&mut self.video),
            _ => None,
        }
    }

    /// Run `init` on every registered device.
    pub fn init_all(&mut self, memory: &mut GuestMemory) -> Result<()> {
        let tables = [
            &mut self.block,
            &mut self.network,
            &mut self.console,
            &mut self.scsi,
            &mut self.video,
        ];
        for table in tables {
            for (unit, device) in table.iter_mut() {
                crate::debug_device!(class = %device.class(), unit, "init");
                device.init(memory)?;
            }
        }
        Ok(())
    }
}

impl Default for DeviceTables {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_class_endpoints() {
        assert_eq!(DeviceClass::Block.endpoint(3), Some(EndpointId::cobd(3)));
        assert_eq!(DeviceClass::Network.endpoint(32), None);
        assert_eq!(DeviceClass::Console.endpoint(0), Some(EndpointId::CONSOLE));
        assert_eq!(DeviceClass::Power.endpoint(0), None);
        assert_eq!(DeviceClass::try_from(10).unwrap(), DeviceClass::Video);
        assert!(DeviceClass::try_from(99).is_err());
    }

    #[test]
    fn test_table_register() {
        let mut table = DeviceTable::new(DeviceClass::Network);
        table.register(2, Box::new(NetworkDevice::new(2, None))).unwrap();
        assert!(table.contains(2));
        assert_eq!(table.len(), 1);

        assert!(table.register(2, Box::new(NetworkDevice::new(2, None))).is_err());
        assert!(table.register(32, Box::new(NetworkDevice::new(32, None))).is_err());

        let mut video = DeviceTable::new(DeviceClass::Video);
        assert!(video.register(0, Box::new(NetworkDevice::new(0, None))).is_err());

        assert!(table.unregister(2).is_some());
        assert!(table.is_empty());
    }

    #[test]
    fn test_every_unit_class_has_a_table() {
        let mut tables = DeviceTables::new();
        for class in [
            DeviceClass::Block,
            DeviceClass::Network,
            DeviceClass::Console,
            DeviceClass::Scsi,
            DeviceClass::Video,
        ] {
            let table = tables.table_mut(class).unwrap();
            assert_eq!(table.class(), class);
            assert!(table.is_empty());
        }
        assert!(tables.table_mut(DeviceClass::Power).is_none());

        let scsi = tables.table_mut(DeviceClass::Scsi).unwrap();
        assert!(scsi.register(0, Box::new(NetworkDevice::new(0, None))).is_err());
    }
}
