//! Allocation accounting for the process-memory sampler.
//!
//! Rust has no runtime memory statistics, so the binary installs
//! [`CountingAllocator`] as its `#[global_allocator]`:
//!
//! ```ignore
//! #[global_allocator]
//! static ALLOC: metricpush_agent::alloc::CountingAllocator =
//!     metricpush_agent::alloc::CountingAllocator;
//! ```
//!
//! Without it every counter stays at zero.

use std::alloc::{GlobalAlloc, Layout, System};
use std::sync::atomic::{AtomicU64, Ordering};

static LIVE_BYTES: AtomicU64 = AtomicU64::new(0);
static TOTAL_BYTES: AtomicU64 = AtomicU64::new(0);
static MALLOCS: AtomicU64 = AtomicU64::new(0);
static FREES: AtomicU64 = AtomicU64::new(0);

/// System allocator wrapper that counts allocations and live bytes.
pub struct CountingAllocator;

fn record_alloc(size: usize) {
    LIVE_BYTES.fetch_add(size as u64, Ordering::Relaxed);
    TOTAL_BYTES.fetch_add(size as u64, Ordering::Relaxed);
    MALLOCS.fetch_add(1, Ordering::Relaxed);
}

fn record_free(size: usize) {
    LIVE_BYTES.fetch_sub(size as u64, Ordering::Relaxed);
    FREES.fetch_add(1, Ordering::Relaxed);
}

unsafe impl GlobalAlloc for CountingAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let ptr = unsafe { System.alloc(layout) };
        if !ptr.is_null() {
            record_alloc(layout.size());
        }
        ptr
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        let ptr = unsafe { System.alloc_zeroed(layout) };
        if !ptr.is_null() {
            record_alloc(layout.size());
        }
        ptr
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        unsafe { System.dealloc(ptr, layout) };
        record_free(layout.size());
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        let new_ptr = unsafe { System.realloc(ptr, layout, new_size) };
        if !new_ptr.is_null() {
            record_free(layout.size());
            record_alloc(new_size);
        }
        new_ptr
    }
}

/// Point-in-time allocation counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AllocStats {
    /// Bytes currently allocated.
    pub alloc: u64,
    /// Bytes allocated over the process lifetime.
    pub total_alloc: u64,
    pub mallocs: u64,
    pub frees: u64,
}

impl AllocStats {
    /// Live allocations.
    pub fn heap_objects(&self) -> u64 {
        self.mallocs.saturating_sub(self.frees)
    }
}

pub fn stats() -> AllocStats {
    AllocStats {
        alloc: LIVE_BYTES.load(Ordering::Relaxed),
        total_alloc: TOTAL_BYTES.load(Ordering::Relaxed),
        mallocs: MALLOCS.load(Ordering::Relaxed),
        frees: FREES.load(Ordering::Relaxed),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocator_counts_through_direct_calls() {
        let before = stats();
        let layout = Layout::from_size_align(64, 8).unwrap();
        unsafe {
            let ptr = CountingAllocator.alloc(layout);
            assert!(!ptr.is_null());
            let ptr = CountingAllocator.realloc(ptr, layout, 128);
            assert!(!ptr.is_null());
            CountingAllocator.dealloc(ptr, Layout::from_size_align(128, 8).unwrap());
        }
        let after = stats();
        assert!(after.mallocs >= before.mallocs + 2);
        assert!(after.frees >= before.frees + 2);
        assert!(after.total_alloc >= before.total_alloc + 192);
    }

    #[test]
    fn test_heap_objects_saturates() {
        let s = AllocStats {
            mallocs: 1,
            frees: 3,
            ..AllocStats::default()
        };
        assert_eq!(s.heap_objects(), 0);
    }
}
