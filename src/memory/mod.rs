//! Guest pseudo-physical memory.
//!
//! The guest kernel's "physical" RAM is not one contiguous host allocation:
//! every frame is backed by an individually allocated host page, and the
//! [`FrameMap`] records which page backs which frame. [`GuestMemory`] ties
//! the frame map to the fixed address window the guest sees.

mod frame_map;
mod guest;
mod page;

pub use frame_map::FrameMap;
pub use guest::{GuestMemory, GuestWindow};
pub use page::{HostPage, OwnedPage, PageAllocator};

/// Page geometry and the default guest address window.
pub mod layout {
    /// log2 of the page size.
    pub const PAGE_SHIFT: u32 = 12;

    /// Size of one guest frame / host page.
    pub const PAGE_SIZE: u64 = 1 << PAGE_SHIFT;

    /// Mask selecting the page-aligned part of an address.
    pub const PAGE_MASK: u64 = !(PAGE_SIZE - 1);

    /// Guest kernel offset: pseudo-physical memory is seen by the guest at
    /// this virtual base.
    pub const KERNEL_OFFSET: u64 = 0xC000_0000;

    /// Largest single message handed to the guest in one passage.
    pub const PASSAGE_MESSAGE_MAX: usize = 2000;

    /// Frame number containing `addr`.
    #[inline]
    pub const fn frame_of(addr: u64) -> u64 {
        addr >> PAGE_SHIFT
    }

    /// Offset of `addr` inside its page.
    #[inline]
    pub const fn page_offset(addr: u64) -> usize {
        (addr & !PAGE_MASK) as usize
    }

    /// Bytes from `addr` up to the next page boundary.
    #[inline]
    pub const fn bytes_to_boundary(addr: u64) -> u64 {
        PAGE_SIZE - (addr & !PAGE_MASK)
    }

    /// Round `size` up to a whole number of pages.
    #[inline]
    pub const fn page_align_up(size: u64) -> u64 {
        (size + PAGE_SIZE - 1) & PAGE_MASK
    }
}

#[cfg(test)]
mod tests {
    use super::layout::*;

    #[test]
    fn test_layout_helpers() {
        assert_eq!(frame_of(KERNEL_OFFSET + 0x1234), (KERNEL_OFFSET >> 12) + 1);
        assert_eq!(page_offset(0x1234), 0x234);
        assert_eq!(bytes_to_boundary(3000), 1096);
        assert_eq!(bytes_to_boundary(0x2000), PAGE_SIZE);
        assert_eq!(page_align_up(1), PAGE_SIZE);
        assert_eq!(page_align_up(PAGE_SIZE), PAGE_SIZE);
    }
}
