//! Guest pseudo-physical address window and the memory behind it.

use std::sync::Arc;

use super::frame_map::FrameMap;
use super::layout::{frame_of, page_align_up, PAGE_MASK, PAGE_SIZE};
use super::page::{HostPage, PageAllocator};
use crate::error::{Error, Result};

/// The `[base, base + size)` range of guest pseudo-physical addresses.
///
/// Fixed at monitor creation; every transfer must fall inside it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GuestWindow {
    /// First guest address
    pub base: u64,
    /// Size in bytes (whole pages)
    pub size: u64,
}

impl GuestWindow {
    /// Create a window. `base` must be page-aligned; `size` is rounded up
    /// to whole pages.
    pub fn new(base: u64, size: u64) -> Result<Self> {
        if base & !PAGE_MASK != 0 {
            return Err(Error::InvalidConfig(format!(
                "window base 0x{:x} is not page aligned",
                base
            )));
        }
        let size = page_align_up(size);
        if size == 0 || base.checked_add(size).is_none() {
            return Err(Error::InvalidConfig(format!(
                "invalid window size 0x{:x} at 0x{:x}",
                size, base
            )));
        }
        Ok(Self { base, size })
    }

    /// One past the last guest address.
    pub fn end(&self) -> u64 {
        self.base + self.size
    }

    /// Number of frames in the window.
    pub fn frame_count(&self) -> usize {
        (self.size / PAGE_SIZE) as usize
    }

    /// Check if an address falls within this window.
    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.base && addr < self.end()
    }

    /// Check if `[addr, addr + size)` lies entirely inside the window.
    ///
    /// The start must itself be inside the window, even for an empty range.
    pub fn contains_range(&self, addr: u64, size: u64) -> bool {
        match addr.checked_add(size) {
            Some(end) => self.contains(addr) && end <= self.end(),
            None => false,
        }
    }

    /// Get the offset of an address within this window.
    pub fn offset(&self, addr: u64) -> Option<u64> {
        if self.contains(addr) {
            Some(addr - self.base)
        } else {
            None
        }
    }
}

/// Guest pseudo-physical memory: the window plus the frames backing it.
#[derive(Debug)]
pub struct GuestMemory {
    window: GuestWindow,
    frames: FrameMap,
}

impl GuestMemory {
    /// Create guest memory with no frames populated yet.
    pub fn new(window: GuestWindow) -> Self {
        Self {
            frames: FrameMap::new(frame_of(window.base), window.frame_count()),
            window,
        }
    }

    /// The guest address window.
    pub fn window(&self) -> GuestWindow {
        self.window
    }

    /// The frame map backing the window.
    pub fn frames(&self) -> &FrameMap {
        &self.frames
    }

    /// Mutable access to the frame map.
    pub fn frames_mut(&mut self) -> &mut FrameMap {
        &mut self.frames
    }

    /// Back every frame of the window with a fresh page.
    pub fn populate(&mut self, allocator: &Arc<PageAllocator>) -> Result<()> {
        self.populate_range(self.window.base, self.window.size, allocator)
    }

    /// Back every still-unmapped frame touched by `[addr, addr + size)`.
    ///
    /// Already mapped frames are left alone.
    pub fn populate_range(
        &mut self,
        addr: u64,
        size: u64,
        allocator: &Arc<PageAllocator>,
    ) -> Result<()> {
        if size == 0 {
            return Ok(());
        }
        if !self.window.contains_range(addr, size) {
            return Err(Error::off_bounds(addr, size));
        }

        let first = frame_of(addr);
        let last = frame_of(addr + size - 1);
        for frame in first..=last {
            if self.frames.lookup(frame).is_none() {
                let page = allocator.allocate()?;
                self.frames.insert(frame, page)?;
            }
        }

        crate::debug_transfer!(
            first_frame = first,
            last_frame = last,
            mapped = self.frames.mapped_count(),
            "populated guest frames"
        );
        Ok(())
    }

    /// Page backing the frame that contains `addr`.
    pub fn page(&self, addr: u64) -> Result<&HostPage> {
        let frame = frame_of(addr);
        self.frames.lookup(frame).ok_or(Error::FrameNotMapped(frame))
    }

    /// Mutable page backing the frame that contains `addr`.
    pub fn page_mut(&mut self, addr: u64) -> Result<&mut HostPage> {
        let frame = frame_of(addr);
        self.frames.lookup_mut(frame).ok_or(Error::FrameNotMapped(frame))
    }

    /// Release every page.
    pub fn release(&mut self) {
        self.frames.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::layout::KERNEL_OFFSET;

    #[test]
    fn test_window_bounds() {
        let window = GuestWindow::new(KERNEL_OFFSET, 4 * PAGE_SIZE).unwrap();
        assert_eq!(window.frame_count(), 4);
        assert!(window.contains(KERNEL_OFFSET));
        assert!(!window.contains(window.end()));
        assert!(window.contains_range(KERNEL_OFFSET + 10, 4 * PAGE_SIZE - 10));
        assert!(!window.contains_range(KERNEL_OFFSET + 10, 4 * PAGE_SIZE));
        assert!(!window.contains_range(KERNEL_OFFSET - 1, 2));
        assert!(!window.contains_range(u64::MAX - 1, 4));
        assert_eq!(window.offset(KERNEL_OFFSET + 5), Some(5));
        assert_eq!(window.offset(0), None);
    }

    #[test]
    fn test_window_rejects_unaligned_base() {
        assert!(GuestWindow::new(0x1001, PAGE_SIZE).is_err());
        assert!(GuestWindow::new(0x1000, 0).is_err());
        assert_eq!(GuestWindow::new(0, 1).unwrap().size, PAGE_SIZE);
    }

    #[test]
    fn test_populate_maps_every_frame() {
        let allocator = PageAllocator::new(16);
        let window = GuestWindow::new(KERNEL_OFFSET, 4 * PAGE_SIZE).unwrap();
        let mut memory = GuestMemory::new(window);
        assert!(memory.page(KERNEL_OFFSET).is_err());

        memory.populate(&allocator).unwrap();
        assert_eq!(memory.frames().mapped_count(), 4);
        assert_eq!(allocator.in_use(), 4);
        assert!(memory.page(KERNEL_OFFSET + 3 * PAGE_SIZE + 1).is_ok());

        memory.release();
        assert_eq!(allocator.in_use(), 0);
    }

    #[test]
    fn test_populate_range_is_lazy() {
        let allocator = PageAllocator::new(16);
        let window = GuestWindow::new(0, 8 * PAGE_SIZE).unwrap();
        let mut memory = GuestMemory::new(window);

        memory.populate_range(PAGE_SIZE + 10, PAGE_SIZE, &allocator).unwrap();
        assert_eq!(memory.frames().mapped_count(), 2);

        memory.populate_range(PAGE_SIZE, 1, &allocator).unwrap();
        assert_eq!(memory.frames().mapped_count(), 2);

        let err = memory.populate_range(7 * PAGE_SIZE, 2 * PAGE_SIZE, &allocator).unwrap_err();
        assert!(err.is_off_bounds());
    }

    #[test]
    fn test_populate_fails_when_budget_exhausted() {
        let allocator = PageAllocator::new(2);
        let window = GuestWindow::new(0, 4 * PAGE_SIZE).unwrap();
        let mut memory = GuestMemory::new(window);

        let err = memory.populate(&allocator).unwrap_err();
        assert!(matches!(err, Error::AllocationFailed(_)));
        assert_eq!(memory.frames().mapped_count(), 2);
    }
}
