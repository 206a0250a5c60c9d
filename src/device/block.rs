//! File-backed block device.
//!
//! Reads and writes move data straight between the backing file and guest
//! memory, one page-bounded chunk at a time.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use super::{unsupported, Device, DeviceClass, DeviceReply, DeviceRequest};
use crate::error::{Error, Result};
use crate::memory::GuestMemory;
use crate::transfer::Direction;

pub const SECTOR_SIZE: u64 = 512;

/// Block requests issued by the guest driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockRequest {
    Open,
    Close,
    Stat,
    /// Read `count` sectors starting at `sector` into guest memory at `addr`.
    Read { sector: u64, count: u64, addr: u64 },
    /// Write `count` sectors from guest memory at `addr` starting at `sector`.
    Write { sector: u64, count: u64, addr: u64 },
    GetAlias,
}

/// A block unit backed by a host file.
#[derive(Debug)]
pub struct BlockDevice {
    unit: u32,
    path: PathBuf,
    alias: Option<String>,
    readonly: bool,
    /// Open while `use_count > 0`
    file: Option<File>,
    use_count: u32,
}

impl BlockDevice {
    /// Create a block unit for `path`. The file is opened on first `Open`.
    pub fn new(unit: u32, path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if !path.exists() {
            return Err(Error::BackingFileNotFound(path));
        }
        Ok(Self {
            unit,
            path,
            alias: None,
            readonly: false,
            file: None,
            use_count: 0,
        })
    }

    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }

    pub fn readonly(mut self, readonly: bool) -> Self {
        self.readonly = readonly;
        self
    }

    pub fn unit(&self) -> u32 {
        self.unit
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Outstanding opens.
    pub fn use_count(&self) -> u32 {
        self.use_count
    }

    fn open(&mut self) -> Result<()> {
        if self.use_count >= 1 {
            self.use_count += 1;
            crate::debug_device!(unit = self.unit, count = self.use_count, "open");
            return Ok(());
        }

        let file = OpenOptions::new()
            .read(true)
            .write(!self.readonly)
            .open(&self.path)
            .map_err(|e| {
                tracing::warn!(unit = self.unit, path = %self.path.display(), error = %e, "open failed");
                e
            })?;
        self.file = Some(file);
        self.use_count = 1;
        tracing::debug!(unit = self.unit, path = %self.path.display(), "opened");
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        match self.use_count {
            0 => {
                tracing::warn!(unit = self.unit, "close with no open");
                Err(Error::DeviceError(format!("cobd{}: close with no open", self.unit)))
            }
            1 => {
                self.file = None;
                self.use_count = 0;
                tracing::debug!(unit = self.unit, "closed");
                Ok(())
            }
            _ => {
                self.use_count -= 1;
                crate::debug_device!(unit = self.unit, count = self.use_count, "close");
                Ok(())
            }
        }
    }

    fn size(&self) -> Result<u64> {
        match &self.file {
            Some(file) => Ok(file.metadata()?.len()),
            None => Ok(std::fs::metadata(&self.path)?.len()),
        }
    }

    /// Validate a sector range and position the file at its start.
    fn seek_to(&mut self, sector: u64, count: u64) -> Result<(&mut File, u64)> {
        let size = self.size()?;
        let unit = self.unit;
        let offset = sector.checked_mul(SECTOR_SIZE);
        let len = count.checked_mul(SECTOR_SIZE);
        let (offset, len) = match (offset, len) {
            (Some(offset), Some(len)) if offset.checked_add(len).is_some_and(|end| end <= size) => {
                (offset, len)
            }
            _ => {
                return Err(Error::DeviceError(format!(
                    "cobd{}: sectors {}+{} beyond end of device",
                    unit, sector, count
                )))
            }
        };

        let file = self
            .file
            .as_mut()
            .ok_or_else(|| Error::DeviceError(format!("cobd{}: not open", unit)))?;
        file.seek(SeekFrom::Start(offset))?;
        Ok((file, len))
    }

    fn read(&mut self, memory: &mut GuestMemory, sector: u64, count: u64, addr: u64) -> Result<()> {
        let unit = self.unit;
        let (file, len) = self.seek_to(sector, count)?;
        // Nothing is read unless the whole guest range is usable.
        memory.probe(addr, len)?;
        memory.transfer(addr, len, Direction::HostToGuest, |chunk, _| {
            file.read_exact(chunk).map_err(Error::from)
        })?;
        crate::debug_device!(unit, sector, count, addr, "read");
        Ok(())
    }

    fn write(&mut self, memory: &mut GuestMemory, sector: u64, count: u64, addr: u64) -> Result<()> {
        if self.readonly {
            return Err(Error::DeviceError(format!("cobd{}: device is read-only", self.unit)));
        }
        let unit = self.unit;
        let (file, len) = self.seek_to(sector, count)?;
        memory.probe(addr, len)?;
        memory.transfer(addr, len, Direction::GuestToHost, |chunk, _| {
            file.write_all(chunk).map_err(Error::from)
        })?;
        crate::debug_device!(unit, sector, count, addr, "write");
        Ok(())
    }
}

impl Device for BlockDevice {
    fn class(&self) -> DeviceClass {
        DeviceClass::Block
    }

    fn request(&mut self, memory: &mut GuestMemory, request: &DeviceRequest) -> Result<DeviceReply> {
        let DeviceRequest::Block(request) = request else {
            return Err(unsupported(DeviceClass::Block, request));
        };

        match *request {
            BlockRequest::Open => self.open().map(|()| DeviceReply::Done),
            BlockRequest::Close => self.close().map(|()| DeviceReply::Done),
            BlockRequest::Stat => Ok(DeviceReply::Stat { size: self.size()? }),
            BlockRequest::Read { sector, count, addr } => {
                self.read(memory, sector, count, addr).map(|()| DeviceReply::Done)
            }
            BlockRequest::Write { sector, count, addr } => {
                self.write(memory, sector, count, addr).map(|()| DeviceReply::Done)
            }
            BlockRequest::GetAlias => self
                .alias
                .clone()
                .map(DeviceReply::Alias)
                .ok_or_else(|| Error::DeviceError(format!("cobd{}: no alias", self.unit))),
        }
    }
}
