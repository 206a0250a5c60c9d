//! Host pages and the process-wide page allocator.

use std::fmt;
use std::ops::{Deref, DerefMut};
use std::ptr::NonNull;
use std::sync::{Arc, Mutex};

use super::layout::PAGE_SIZE;
use crate::error::{Error, Result};

/// One page of host memory backing a guest frame.
///
/// The page is page-aligned and zero-initialized.
pub struct HostPage {
    /// Pointer to the mapping
    ptr: NonNull<u8>,
}

// Safety: HostPage owns its mapping and can be sent between threads
unsafe impl Send for HostPage {}
unsafe impl Sync for HostPage {}

impl HostPage {
    /// Map a fresh zeroed page.
    pub fn new() -> Result<Self> {
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                PAGE_SIZE as usize,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_ANONYMOUS | libc::MAP_PRIVATE,
                -1,
                0,
            )
        };

        if ptr == libc::MAP_FAILED {
            return Err(Error::AllocationFailed(format!(
                "mmap failed: {}",
                std::io::Error::last_os_error()
            )));
        }

        NonNull::new(ptr as *mut u8)
            .map(|ptr| Self { ptr })
            .ok_or_else(|| Error::AllocationFailed("mmap returned null".to_string()))
    }

    /// Get a raw pointer to the page.
    pub fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    /// Get a slice view of the page.
    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), PAGE_SIZE as usize) }
    }

    /// Get a mutable slice view of the page.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), PAGE_SIZE as usize) }
    }
}

impl Drop for HostPage {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.ptr.as_ptr() as *mut libc::c_void, PAGE_SIZE as usize);
        }
    }
}

impl fmt::Debug for HostPage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("HostPage").field(&self.ptr).finish()
    }
}

#[derive(Debug, Default)]
struct AllocatorState {
    in_use: usize,
    peak: usize,
}

/// Process-wide physical page allocator shared by every monitor instance.
///
/// It enforces a budget on the number of pages handed out. The lock only
/// guards the accounting; the mapping itself happens outside it.
#[derive(Debug)]
pub struct PageAllocator {
    limit: usize,
    state: Mutex<AllocatorState>,
}

impl PageAllocator {
    /// Create an allocator that hands out at most `limit` pages.
    pub fn new(limit: usize) -> Arc<Self> {
        Arc::new(Self {
            limit,
            state: Mutex::new(AllocatorState::default()),
        })
    }

    /// Allocate one zeroed page.
    pub fn allocate(self: &Arc<Self>) -> Result<OwnedPage> {
        self.reserve()?;

        match HostPage::new() {
            Ok(page) => Ok(OwnedPage {
                page,
                allocator: Arc::clone(self),
            }),
            Err(e) => {
                self.release();
                Err(e)
            }
        }
    }

    /// Pages currently handed out.
    pub fn in_use(&self) -> usize {
        self.lock_state().in_use
    }

    /// Highest number of pages handed out at once.
    pub fn peak(&self) -> usize {
        self.lock_state().peak
    }

    /// Page budget.
    pub fn limit(&self) -> usize {
        self.limit
    }

    fn reserve(&self) -> Result<()> {
        let mut state = self.lock_state();
        if state.in_use >= self.limit {
            return Err(Error::AllocationFailed(format!(
                "page budget exhausted ({} pages)",
                self.limit
            )));
        }
        state.in_use += 1;
        state.peak = state.peak.max(state.in_use);
        Ok(())
    }

    fn release(&self) {
        let mut state = self.lock_state();
        state.in_use = state.in_use.saturating_sub(1);
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, AllocatorState> {
        // The accounting stays consistent even if a holder panicked.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// A host page charged against a [`PageAllocator`].
///
/// Dropping it unmaps the page and returns it to the allocator's budget.
pub struct OwnedPage {
    page: HostPage,
    allocator: Arc<PageAllocator>,
}

impl Deref for OwnedPage {
    type Target = HostPage;

    fn deref(&self) -> &HostPage {
        &self.page
    }
}

impl DerefMut for OwnedPage {
    fn deref_mut(&mut self) -> &mut HostPage {
        &mut self.page
    }
}

impl Drop for OwnedPage {
    fn drop(&mut self) {
        self.allocator.release();
    }
}

impl fmt::Debug for OwnedPage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OwnedPage").field("page", &self.page).finish()
    }
}
