//! Framebuffer units.
//!
//! The guest keeps its framebuffer in its own memory. When a viewer
//! attaches, the framebuffer is pulled out through the transfer engine and
//! converted to 32-bit XRGB on the way, one page-bounded chunk at a time.

use super::{unsupported, Device, DeviceClass, DeviceReply, DeviceRequest};
use crate::error::{Error, Result};
use crate::memory::GuestMemory;
use crate::message::MAX_SNAPSHOT_SIZE;
use crate::transfer::Direction;

const SNAPSHOT_MAGIC: &[u8; 4] = b"COVF";
const SNAPSHOT_VERSION: u16 = 1;
/// Magic, version, width, height.
pub const SNAPSHOT_HEADER_SIZE: usize = 14;

/// Requests the guest video driver issues.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VideoRequest {
    /// Guest address where the framebuffer lives.
    SetFramebuffer { addr: u64 },
    Geometry,
}

/// Converts guest pixels to XRGB, carrying partial pixels across chunks.
struct PixelMarshal {
    bytes_per_pixel: usize,
    carry: Vec<u8>,
}

impl PixelMarshal {
    fn new(bpp: u32) -> Self {
        Self {
            bytes_per_pixel: bpp as usize / 8,
            carry: Vec::new(),
        }
    }

    fn feed(&mut self, chunk: &[u8], out: &mut Vec<u8>) {
        self.carry.extend_from_slice(chunk);
        let whole = self.carry.len() / self.bytes_per_pixel * self.bytes_per_pixel;
        for px in self.carry[..whole].chunks_exact(self.bytes_per_pixel) {
            out.extend_from_slice(&to_xrgb(px));
        }
        self.carry.drain(..whole);
    }
}

fn to_xrgb(px: &[u8]) -> [u8; 4] {
    match px.len() {
        2 => {
            let v = u16::from_le_bytes([px[0], px[1]]);
            let r = ((v >> 11) & 0x1f) as u8;
            let g = ((v >> 5) & 0x3f) as u8;
            let b = (v & 0x1f) as u8;
            [b << 3 | b >> 2, g << 2 | g >> 4, r << 3 | r >> 2, 0]
        }
        _ => [px[0], px[1], px[2], 0],
    }
}

/// A framebuffer unit.
#[derive(Debug)]
pub struct VideoDevice {
    unit: u32,
    width: u32,
    height: u32,
    bpp: u32,
    framebuffer: Option<u64>,
    attached: bool,
}

impl VideoDevice {
    pub fn new(unit: u32, width: u32, height: u32, bpp: u32) -> Result<Self> {
        if !matches!(bpp, 16 | 24 | 32) || width == 0 || height == 0 {
            return Err(Error::InvalidConfig(format!(
                "unsupported video mode {}x{}x{}",
                width, height, bpp
            )));
        }
        if Self::snapshot_size(width, height) > MAX_SNAPSHOT_SIZE as u64 {
            return Err(Error::InvalidConfig(format!(
                "video mode {}x{} does not fit one attach message ({} bytes max)",
                width, height, MAX_SNAPSHOT_SIZE
            )));
        }
        Ok(Self {
            unit,
            width,
            height,
            bpp,
            framebuffer: None,
            attached: false,
        })
    }

    pub fn unit(&self) -> u32 {
        self.unit
    }

    pub fn is_attached(&self) -> bool {
        self.attached
    }

    /// Size of the guest framebuffer in bytes.
    pub fn framebuffer_size(&self) -> u64 {
        self.width as u64 * self.height as u64 * (self.bpp / 8) as u64
    }

    /// Size of the attach snapshot for a `width` x `height` framebuffer.
    pub fn snapshot_size(width: u32, height: u32) -> u64 {
        SNAPSHOT_HEADER_SIZE as u64 + width as u64 * height as u64 * 4
    }

    /// Split an attach snapshot into its geometry and XRGB pixels.
    pub fn parse_snapshot(data: &[u8]) -> Result<(u32, u32, &[u8])> {
        if data.len() < SNAPSHOT_HEADER_SIZE || &data[..4] != SNAPSHOT_MAGIC {
            return Err(Error::InvalidMessage("bad framebuffer snapshot".to_string()));
        }
        let version = u16::from_le_bytes([data[4], data[5]]);
        if version != SNAPSHOT_VERSION {
            return Err(Error::InvalidMessage(format!(
                "unsupported framebuffer snapshot version {}",
                version
            )));
        }
        let width = u32::from_le_bytes([data[6], data[7], data[8], data[9]]);
        let height = u32::from_le_bytes([data[10], data[11], data[12], data[13]]);
        let pixels = &data[SNAPSHOT_HEADER_SIZE..];
        if data.len() as u64 != Self::snapshot_size(width, height) {
            return Err(Error::InvalidMessage("framebuffer snapshot size mismatch".to_string()));
        }
        Ok((width, height, pixels))
    }
}

impl Device for VideoDevice {
    fn class(&self) -> DeviceClass {
        DeviceClass::Video
    }

    fn request(&mut self, memory: &mut GuestMemory, request: &DeviceRequest) -> Result<DeviceReply> {
        match request {
            DeviceRequest::Video(VideoRequest::SetFramebuffer { addr }) => {
                memory.probe(*addr, self.framebuffer_size())?;
                self.framebuffer = Some(*addr);
                tracing::debug!(unit = self.unit, addr = format_args!("0x{:x}", addr), "framebuffer set");
                Ok(DeviceReply::Done)
            }
            DeviceRequest::Video(VideoRequest::Geometry) => Ok(DeviceReply::Geometry {
                width: self.width,
                height: self.height,
                bpp: self.bpp,
            }),
            other => Err(unsupported(DeviceClass::Video, other)),
        }
    }

    fn attach(&mut self, memory: &mut GuestMemory) -> Result<Vec<u8>> {
        let addr = self
            .framebuffer
            .ok_or_else(|| Error::DeviceError(format!("video{}: no framebuffer", self.unit)))?;

        let pixels = self.width as usize * self.height as usize;
        let mut out = Vec::with_capacity(SNAPSHOT_HEADER_SIZE + pixels * 4);
        out.extend_from_slice(SNAPSHOT_MAGIC);
        out.extend_from_slice(&SNAPSHOT_VERSION.to_le_bytes());
        out.extend_from_slice(&self.width.to_le_bytes());
        out.extend_from_slice(&self.height.to_le_bytes());

        let mut marshal = PixelMarshal::new(self.bpp);
        memory.transfer(addr, self.framebuffer_size(), Direction::GuestToHost, |chunk, _| {
            marshal.feed(chunk, &mut out);
            Ok(())
        })?;

        self.attached = true;
        crate::debug_device!(unit = self.unit, bytes = out.len(), "framebuffer attached");
        Ok(out)
    }

    fn detach(&mut self, _snapshot: &[u8]) -> Result<()> {
        self.attached = false;
        Ok(())
    }
}
