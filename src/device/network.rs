//! Network units.
//!
//! Packets never go through guest memory here: the guest driver hands
//! frames to the monitor as envelopes, and the daemon bridging the unit to
//! the host network answers the same way. Both directions are discardable.

use super::{unsupported, Device, DeviceClass, DeviceReply, DeviceRequest};
use crate::error::{Error, Result};
use crate::memory::GuestMemory;
use crate::message::payload::LinuxMessage;
use crate::message::{EndpointId, Message, MessageKind, Priority};

/// Requests the guest network driver issues synchronously.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkRequest {
    GetMac,
}

/// A configured network unit.
#[derive(Debug)]
pub struct NetworkDevice {
    unit: u32,
    /// `None` when the unit is disabled
    mac: Option<[u8; 6]>,
}

impl NetworkDevice {
    pub fn new(unit: u32, mac: Option<[u8; 6]>) -> Self {
        Self { unit, mac }
    }

    pub fn unit(&self) -> u32 {
        self.unit
    }

    pub fn mac(&self) -> Option<[u8; 6]> {
        self.mac
    }

    /// Envelope carrying a frame sent by the guest on `unit`.
    pub fn outgoing(unit: u32, frame: impl Into<Vec<u8>>) -> Message {
        Message::new(
            EndpointId::LINUX,
            EndpointId::conet(unit),
            Priority::Discardable,
            MessageKind::Other,
            frame,
        )
    }

    /// Envelope carrying a frame received from the host for `unit`.
    pub fn incoming(unit: u32, frame: impl Into<Vec<u8>>) -> Message {
        let payload = LinuxMessage::new(DeviceClass::Network, unit, frame).encode();
        Message::new(
            EndpointId::conet(unit),
            EndpointId::LINUX,
            Priority::Discardable,
            MessageKind::Other,
            payload,
        )
    }
}

impl Device for NetworkDevice {
    fn class(&self) -> DeviceClass {
        DeviceClass::Network
    }

    fn request(&mut self, _memory: &mut GuestMemory, request: &DeviceRequest) -> Result<DeviceReply> {
        match request {
            DeviceRequest::Network(NetworkRequest::GetMac) => {
                Ok(DeviceReply::Mac(self.mac.unwrap_or([0; 6])))
            }
            other => Err(unsupported(DeviceClass::Network, other)),
        }
    }
}

/// Parse a MAC address written as six hex octets separated by `:` or `-`.
pub fn parse_mac(text: &str) -> Result<[u8; 6]> {
    let mut mac = [0u8; 6];
    let mut parts = text.split(|c| c == ':' || c == '-');
    for byte in mac.iter_mut() {
        let part = parts
            .next()
            .filter(|p| p.len() == 2)
            .ok_or_else(|| Error::InvalidConfig(format!("invalid MAC address '{}'", text)))?;
        *byte = u8::from_str_radix(part, 16)
            .map_err(|_| Error::InvalidConfig(format!("invalid MAC address '{}'", text)))?;
    }
    if parts.next().is_some() {
        return Err(Error::InvalidConfig(format!("invalid MAC address '{}'", text)));
    }
    Ok(mac)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::layout::{KERNEL_OFFSET, PAGE_SIZE};
    use crate::memory::GuestWindow;

    #[test]
    fn test_get_mac() {
        let mut memory = GuestMemory::new(GuestWindow::new(KERNEL_OFFSET, PAGE_SIZE).unwrap());
        let request = DeviceRequest::Network(NetworkRequest::GetMac);

        let mut dev = NetworkDevice::new(0, Some([0x52, 0x54, 0, 1, 2, 3]));
        assert_eq!(
            dev.request(&mut memory, &request).unwrap(),
            DeviceReply::Mac([0x52, 0x54, 0, 1, 2, 3])
        );

        let mut disabled = NetworkDevice::new(1, None);
        assert_eq!(disabled.request(&mut memory, &request).unwrap(), DeviceReply::Mac([0; 6]));
    }

    #[test]
    fn test_packet_envelopes() {
        let out = NetworkDevice::outgoing(3, vec![0xFF; 60]);
        assert_eq!(out.to(), EndpointId::conet(3));
        assert!(out.is_discardable());

        let inc = NetworkDevice::incoming(3, vec![1, 2, 3]);
        assert_eq!(inc.to(), EndpointId::LINUX);
        let decoded = LinuxMessage::decode(inc.payload()).unwrap();
        assert_eq!(decoded.device, DeviceClass::Network);
        assert_eq!(decoded.unit, 3);
        assert_eq!(decoded.data, vec![1, 2, 3]);
    }

    #[test]
    fn test_parse_mac() {
        assert_eq!(parse_mac("00:FF:10:2a:3B:04").unwrap(), [0, 0xFF, 0x10, 0x2A, 0x3B, 4]);
        assert_eq!(parse_mac("00-11-22-33-44-55").unwrap()[5], 0x55);
        assert!(parse_mac("00:11:22:33:44").is_err());
        assert!(parse_mac("00:11:22:33:44:55:66").is_err());
        assert!(parse_mac("0:11:22:33:44:55").is_err());
        assert!(parse_mac("zz:11:22:33:44:55").is_err());
    }
}
