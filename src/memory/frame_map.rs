//! Frame number to host page map.

use super::page::{HostPage, OwnedPage};
use crate::error::{Error, Result};

/// Per-instance arena mapping guest frame numbers to host pages.
///
/// Indexed directly by `frame - base_frame`, so every operation is O(1).
/// A frame is mapped to at most one page at a time; unmapped frames look up
/// as `None`.
#[derive(Debug)]
pub struct FrameMap {
    /// First frame number covered
    base_frame: u64,
    /// One slot per frame in the window
    slots: Vec<Option<OwnedPage>>,
    /// Number of occupied slots
    mapped: usize,
}

impl FrameMap {
    /// Create an empty map covering `count` frames starting at `base_frame`.
    pub fn new(base_frame: u64, count: usize) -> Self {
        let mut slots = Vec::with_capacity(count);
        slots.resize_with(count, || None);
        Self {
            base_frame,
            slots,
            mapped: 0,
        }
    }

    /// First frame number covered by the map.
    pub fn base_frame(&self) -> u64 {
        self.base_frame
    }

    /// Number of frames the map can hold.
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Number of frames currently backed by a page.
    pub fn mapped_count(&self) -> usize {
        self.mapped
    }

    /// Check if `frame` falls inside the map.
    pub fn covers(&self, frame: u64) -> bool {
        self.index(frame).is_some()
    }

    /// Map `frame` to `page`.
    ///
    /// An existing mapping is replaced and its page handed back; releasing
    /// it is up to the caller.
    pub fn insert(&mut self, frame: u64, page: OwnedPage) -> Result<Option<OwnedPage>> {
        let index = self.index(frame).ok_or(Error::FrameNotMapped(frame))?;
        let old = self.slots[index].replace(page);
        if old.is_none() {
            self.mapped += 1;
        }
        Ok(old)
    }

    /// Look up the page backing `frame`.
    pub fn lookup(&self, frame: u64) -> Option<&HostPage> {
        let index = self.index(frame)?;
        self.slots[index].as_deref()
    }

    /// Look up the page backing `frame` for writing.
    pub fn lookup_mut(&mut self, frame: u64) -> Option<&mut HostPage> {
        let index = self.index(frame)?;
        self.slots[index].as_deref_mut()
    }

    /// Unmap `frame`, returning its page.
    pub fn remove(&mut self, frame: u64) -> Option<OwnedPage> {
        let index = self.index(frame)?;
        let old = self.slots[index].take();
        if old.is_some() {
            self.mapped -= 1;
        }
        old
    }

    /// Unmap every frame.
    pub fn clear(&mut self) {
        self.slots.iter_mut().for_each(|slot| *slot = None);
        self.mapped = 0;
    }

    fn index(&self, frame: u64) -> Option<usize> {
        let index = usize::try_from(frame.checked_sub(self.base_frame)?).ok()?;
        (index < self.slots.len()).then_some(index)
    }
}
