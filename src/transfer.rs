//! Copying between host buffers and guest pseudo-physical memory.
//!
//! Guest memory is made of individually allocated pages, so a copy that
//! spans several frames is split into page-sized chunks. [`GuestMemory::transfer`]
//! walks the frame map and hands each chunk to a caller-supplied copy
//! function; the helpers below are built on top of it.
//!
//! Failure is per chunk: the whole range is checked against the window before
//! anything is copied, but a frame found unmapped halfway through stops the
//! walk after earlier chunks were already copied. Callers that must not expose
//! partial I/O call [`GuestMemory::probe`] first.

use zerocopy::{FromBytes, FromZeros, Immutable, IntoBytes};

use crate::error::{Error, Result};
use crate::memory::layout::{bytes_to_boundary, frame_of, page_offset};
use crate::memory::GuestMemory;

/// Direction of a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// From a host buffer into guest memory.
    HostToGuest,
    /// From guest memory into a host buffer.
    GuestToHost,
}

/// Host side of a plain memory copy, advanced chunk by chunk.
enum HostCursor<'a> {
    Source(&'a [u8]),
    Sink(&'a mut [u8]),
}

impl HostCursor<'_> {
    fn remaining(&self) -> usize {
        match self {
            HostCursor::Source(buf) => buf.len(),
            HostCursor::Sink(buf) => buf.len(),
        }
    }
}

/// Plain memory move of one chunk in either direction.
fn raw_memmove(host: &mut HostCursor<'_>, guest: &mut [u8], dir: Direction) -> Result<()> {
    let len = guest.len();
    if host.remaining() < len {
        return Err(Error::DeviceError(format!(
            "host buffer exhausted: {} < {}",
            host.remaining(),
            len
        )));
    }

    match (host, dir) {
        (HostCursor::Source(buf), Direction::HostToGuest) => {
            let (head, tail) = std::mem::take(buf).split_at(len);
            guest.copy_from_slice(head);
            *buf = tail;
        }
        (HostCursor::Sink(buf), Direction::GuestToHost) => {
            let (head, tail) = std::mem::take(buf).split_at_mut(len);
            head.copy_from_slice(guest);
            *buf = tail;
        }
        _ => {
            return Err(Error::DeviceError(
                "host buffer does not match transfer direction".to_string(),
            ))
        }
    }
    Ok(())
}

impl GuestMemory {
    /// Walk `[addr, addr + size)` one page-bounded chunk at a time.
    ///
    /// `copy_fn` receives the host view of each guest chunk and must handle
    /// all of it or fail; it is never handed a chunk that crosses a page
    /// boundary.
    pub fn transfer<F>(&mut self, addr: u64, size: u64, dir: Direction, mut copy_fn: F) -> Result<()>
    where
        F: FnMut(&mut [u8], Direction) -> Result<()>,
    {
        if !self.window().contains_range(addr, size) {
            tracing::debug!(addr, size, "transfer off bounds");
            return Err(Error::off_bounds(addr, size));
        }

        let mut addr = addr;
        let mut size = size;
        while size > 0 {
            let one_copy = bytes_to_boundary(addr).min(size);
            let offset = page_offset(addr);
            let page = self.frames_mut().lookup_mut(frame_of(addr)).ok_or_else(|| {
                tracing::debug!(addr, "transfer hit unmapped frame");
                Error::FrameNotMapped(frame_of(addr))
            })?;

            let chunk = &mut page.as_mut_slice()[offset..offset + one_copy as usize];
            crate::debug_transfer!(addr, len = one_copy, ?dir, "chunk");
            copy_fn(chunk, dir)?;

            size -= one_copy;
            addr += one_copy;
        }

        Ok(())
    }

    /// Map a single in-page span and return its host view.
    ///
    /// `size` must be non-zero and must not cross a page boundary.
    pub fn transfer_map(&mut self, addr: u64, size: u64) -> Result<&mut [u8]> {
        if !self.window().contains_range(addr, size) {
            return Err(Error::off_bounds(addr, size));
        }
        if size == 0 || size > bytes_to_boundary(addr) {
            return Err(Error::off_bounds(addr, size));
        }

        let offset = page_offset(addr);
        let page = self.page_mut(addr)?;
        Ok(&mut page.as_mut_slice()[offset..offset + size as usize])
    }

    /// Check that `[addr, addr + size)` could be transferred without copying
    /// anything.
    pub fn probe(&self, addr: u64, size: u64) -> Result<()> {
        if !self.window().contains_range(addr, size) {
            return Err(Error::off_bounds(addr, size));
        }
        if size == 0 {
            return Ok(());
        }

        let last = frame_of(addr + size - 1);
        for frame in frame_of(addr)..=last {
            if self.frames().lookup(frame).is_none() {
                return Err(Error::FrameNotMapped(frame));
            }
        }
        Ok(())
    }

    /// Copy `data` into guest memory at `addr`.
    pub fn host_to_guest(&mut self, data: &[u8], addr: u64) -> Result<()> {
        let mut host = HostCursor::Source(data);
        self.transfer(addr, data.len() as u64, Direction::HostToGuest, |chunk, dir| {
            raw_memmove(&mut host, chunk, dir)
        })
    }

    /// Copy guest memory at `addr` into `buf`.
    pub fn guest_to_host(&mut self, addr: u64, buf: &mut [u8]) -> Result<()> {
        let size = buf.len() as u64;
        let mut host = HostCursor::Sink(buf);
        self.transfer(addr, size, Direction::GuestToHost, |chunk, dir| {
            raw_memmove(&mut host, chunk, dir)
        })
    }

    /// Read a plain value from guest memory.
    ///
    /// Only types valid for every bit pattern can be read, since the bytes
    /// come from the guest.
    pub fn read_obj<T: FromBytes + IntoBytes>(&mut self, addr: u64) -> Result<T> {
        let mut value = T::new_zeroed();
        self.guest_to_host(addr, value.as_mut_bytes())?;
        Ok(value)
    }

    /// Write a plain value to guest memory.
    pub fn write_obj<T: IntoBytes + Immutable>(&mut self, addr: u64, value: &T) -> Result<()> {
        self.host_to_guest(value.as_bytes(), addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::layout::{KERNEL_OFFSET, PAGE_SIZE};
    use crate::memory::{GuestWindow, PageAllocator};

    fn memory(frames: u64) -> GuestMemory {
        let allocator = PageAllocator::new(64);
        let window = GuestWindow::new(KERNEL_OFFSET, frames * PAGE_SIZE).unwrap();
        let mut memory = GuestMemory::new(window);
        memory.populate(&allocator).unwrap();
        memory
    }

    fn chunk_lengths(memory: &mut GuestMemory, addr: u64, size: u64) -> Result<Vec<usize>> {
        let mut lens = Vec::new();
        memory.transfer(addr, size, Direction::GuestToHost, |chunk, _| {
            lens.push(chunk.len());
            Ok(())
        })?;
        Ok(lens)
    }

    #[test]
    fn test_round_trip_across_pages() {
        let mut memory = memory(4);
        let data: Vec<u8> = (0..10_000u32).map(|i| (i * 7 % 251) as u8).collect();

        memory.host_to_guest(&data, KERNEL_OFFSET + 123).unwrap();

        let mut back = vec![0u8; data.len()];
        memory.guest_to_host(KERNEL_OFFSET + 123, &mut back).unwrap();
        assert_eq!(back, data);
    }

    #[test]
    fn test_chunks_never_cross_page_boundary() {
        let mut memory = memory(4);

        // The 3000/5000 example: 4096 - 3000 = 1096, then the remaining 3904.
        let lens = chunk_lengths(&mut memory, KERNEL_OFFSET + 3000, 5000).unwrap();
        assert_eq!(lens, vec![1096, 3904]);

        // Three pages' worth starting mid-page touches four frames.
        let lens = chunk_lengths(&mut memory, KERNEL_OFFSET + 100, 3 * PAGE_SIZE).unwrap();
        assert_eq!(lens.len(), 4);
        assert_eq!(lens.iter().sum::<usize>() as u64, 3 * PAGE_SIZE);
        assert_eq!(lens[0], (PAGE_SIZE - 100) as usize);

        // Aligned three-page transfer is exactly three calls.
        let lens = chunk_lengths(&mut memory, KERNEL_OFFSET, 3 * PAGE_SIZE).unwrap();
        assert_eq!(lens, vec![PAGE_SIZE as usize; 3]);
    }

    #[test]
    fn test_off_bounds_never_calls_copy_fn() {
        let mut memory = memory(4);
        let end = KERNEL_OFFSET + 4 * PAGE_SIZE;

        let cases = [
            (KERNEL_OFFSET - 1, 10),
            (KERNEL_OFFSET - PAGE_SIZE, PAGE_SIZE * 2),
            (end - 10, 11),
            (end, 1),
            (u64::MAX - 4, 8),
        ];
        for (addr, size) in cases {
            let mut calls = 0;
            let err = memory
                .transfer(addr, size, Direction::HostToGuest, |_, _| {
                    calls += 1;
                    Ok(())
                })
                .unwrap_err();
            assert!(matches!(err, Error::OffBounds { .. }), "{:x}+{}", addr, size);
            assert_eq!(calls, 0);
        }
    }

    #[test]
    fn test_unmapped_frame_fails_fast_after_earlier_chunks() {
        let mut memory = memory(4);
        let removed = memory.frames_mut().remove(frame_of(KERNEL_OFFSET + PAGE_SIZE));
        assert!(removed.is_some());

        let data = vec![0x5Au8; 2 * PAGE_SIZE as usize];
        let err = memory.host_to_guest(&data, KERNEL_OFFSET).unwrap_err();
        assert!(matches!(err, Error::FrameNotMapped(_)));
        assert!(err.is_off_bounds());

        // The first page was written before the hole was found.
        let mut first = vec![0u8; PAGE_SIZE as usize];
        memory.guest_to_host(KERNEL_OFFSET, &mut first).unwrap();
        assert!(first.iter().all(|&b| b == 0x5A));

        assert!(memory.probe(KERNEL_OFFSET, 2 * PAGE_SIZE).is_err());
        assert!(memory.probe(KERNEL_OFFSET, PAGE_SIZE).is_ok());
    }

    #[test]
    fn test_copy_fn_error_stops_walk() {
        let mut memory = memory(4);
        let mut calls = 0;
        let err = memory
            .transfer(KERNEL_OFFSET, 3 * PAGE_SIZE, Direction::GuestToHost, |_, _| {
                calls += 1;
                if calls == 2 {
                    Err(Error::DeviceError("marshal".into()))
                } else {
                    Ok(())
                }
            })
            .unwrap_err();
        assert!(matches!(err, Error::DeviceError(_)));
        assert_eq!(calls, 2);
    }

    #[test]
    fn test_zero_size_transfer() {
        let mut memory = memory(1);
        let lens = chunk_lengths(&mut memory, KERNEL_OFFSET, 0).unwrap();
        assert!(lens.is_empty());
    }

    #[test]
    fn test_transfer_map_single_page() {
        let mut memory = memory(2);
        memory.transfer_map(KERNEL_OFFSET + 10, 4).unwrap().copy_from_slice(b"abcd");

        let mut buf = [0u8; 4];
        memory.guest_to_host(KERNEL_OFFSET + 10, &mut buf).unwrap();
        assert_eq!(&buf, b"abcd");

        assert!(memory.transfer_map(KERNEL_OFFSET + PAGE_SIZE - 2, 4).is_err());
        assert!(memory.transfer_map(KERNEL_OFFSET, 0).is_err());
    }

    #[test]
    fn test_obj_across_boundary() {
        let mut memory = memory(2);
        let addr = KERNEL_OFFSET + PAGE_SIZE - 3;
        memory.write_obj(addr, &0xDEADBEEF_u32).unwrap();
        let value: u32 = memory.read_obj(addr).unwrap();
        assert_eq!(value, 0xDEADBEEF);
    }

    #[repr(C)]
    #[derive(Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, Immutable)]
    struct RequestDescriptor {
        sector: u64,
        count: u32,
        flags: u32,
    }

    #[test]
    fn test_obj_struct_from_guest_bytes() {
        let mut memory = memory(2);
        let addr = KERNEL_OFFSET + PAGE_SIZE - 8;

        // Whatever the guest wrote is a valid descriptor.
        memory.host_to_guest(&[0x41; 16], addr).unwrap();
        let raw: RequestDescriptor = memory.read_obj(addr).unwrap();
        assert_eq!(raw.sector, 0x4141_4141_4141_4141);
        assert_eq!(raw.flags, 0x4141_4141);

        let desc = RequestDescriptor { sector: 7, count: 8, flags: 1 };
        memory.write_obj(addr, &desc).unwrap();
        assert_eq!(memory.read_obj::<RequestDescriptor>(addr).unwrap(), desc);

        let end = KERNEL_OFFSET + 2 * PAGE_SIZE;
        assert!(memory.read_obj::<RequestDescriptor>(end - 8).unwrap_err().is_off_bounds());
    }
}
