//! Huge-page-backed buddy allocator for message buffers.
//!
//! Regions are reserved with `mmap(MAP_HUGETLB)` and fall back to plain
//! anonymous mappings when no huge pages are reserved on the host, so the
//! engine (and its tests) run on unconfigured machines at reduced TLB
//! efficiency. Buffers are carved from power-of-two size classes with
//! split-on-demand; chunks return to their class free list on free.

use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::{Error, Result};

/// Smallest size class: 64 B (one cache line).
const MIN_CLASS_BITS: usize = 6;

/// Largest size class, and the unit of region reservation: 8 MiB.
const MAX_CLASS_BITS: usize = 23;

/// Largest allocation the allocator will serve.
pub const MAX_CLASS_SIZE: usize = 1 << MAX_CLASS_BITS;

const NUM_CLASSES: usize = MAX_CLASS_BITS - MIN_CLASS_BITS + 1;

static HUGEPAGE_WARNED: AtomicBool = AtomicBool::new(false);

struct Region {
    base: *mut u8,
    len: usize,
}

/// Buddy-style allocator over huge-page regions.
///
/// One instance exists per endpoint, behind the allocator lock: background
/// workers may allocate and free concurrently with the creator thread.
pub struct HugeAlloc {
    regions: Vec<Region>,
    freelists: [Vec<*mut u8>; NUM_CLASSES],
    /// Bytes handed out and not yet freed, in size-class units, excluding
    /// engine-internal control buffers.
    stat_user_alloc: usize,
    /// Total bytes reserved from the OS.
    stat_reserved: usize,
    /// Region size used when the current reservation is exhausted.
    grow_bytes: usize,
}

impl HugeAlloc {
    /// Reserve the initial region. Reservation failure here is fatal for
    /// the owning endpoint.
    pub fn new(initial_bytes: usize) -> Result<Self> {
        let mut alloc = Self {
            regions: Vec::new(),
            freelists: std::array::from_fn(|_| Vec::new()),
            stat_user_alloc: 0,
            stat_reserved: 0,
            grow_bytes: round_up_region(initial_bytes),
        };
        alloc.reserve_region(alloc.grow_bytes)?;
        Ok(alloc)
    }

    fn reserve_region(&mut self, bytes: usize) -> Result<()> {
        let len = round_up_region(bytes);
        let base = unsafe { mmap_region(len)? };
        for off in (0..len).step_by(MAX_CLASS_SIZE) {
            self.freelists[NUM_CLASSES - 1].push(unsafe { base.add(off) });
        }
        self.regions.push(Region { base, len });
        self.stat_reserved += len;
        Ok(())
    }

    #[inline]
    fn class_index(bytes: usize) -> usize {
        let bits = bytes.next_power_of_two().trailing_zeros() as usize;
        bits.max(MIN_CLASS_BITS) - MIN_CLASS_BITS
    }

    #[inline]
    fn class_bytes(class: usize) -> usize {
        1 << (class + MIN_CLASS_BITS)
    }

    /// Allocate at least `bytes`, counted against the user statistics.
    ///
    /// Returns the chunk and its size-class length, or `None` on
    /// out-of-memory (a non-fatal condition).
    pub fn alloc(&mut self, bytes: usize) -> Option<(NonNull<u8>, usize)> {
        let r = self.alloc_inner(bytes);
        if let Some((_, class_bytes)) = r {
            self.stat_user_alloc += class_bytes;
        }
        r
    }

    /// Allocate without touching the user statistics. Used for the
    /// endpoint's own control buffers.
    pub fn alloc_raw(&mut self, bytes: usize) -> Option<(NonNull<u8>, usize)> {
        self.alloc_inner(bytes)
    }

    fn alloc_inner(&mut self, bytes: usize) -> Option<(NonNull<u8>, usize)> {
        if bytes > MAX_CLASS_SIZE {
            log::warn!(
                "allocation of {} bytes exceeds the maximum class size {}",
                bytes,
                MAX_CLASS_SIZE
            );
            return None;
        }
        let class = Self::class_index(bytes);

        if self.freelists[class].is_empty() {
            // Split the nearest larger chunk down to this class.
            let mut donor = None;
            for c in class + 1..NUM_CLASSES {
                if !self.freelists[c].is_empty() {
                    donor = Some(c);
                    break;
                }
            }
            let donor = match donor {
                Some(c) => c,
                None => {
                    if self.reserve_region(self.grow_bytes).is_err() {
                        return None;
                    }
                    NUM_CLASSES - 1
                }
            };
            let mut cur = donor;
            let chunk = self.freelists[donor].pop()?;
            while cur > class {
                cur -= 1;
                let half = Self::class_bytes(cur);
                // Keep the lower half, donate the upper half to `cur`.
                self.freelists[cur].push(unsafe { chunk.add(half) });
            }
            self.freelists[class].push(chunk);
        }

        let ptr = self.freelists[class].pop()?;
        Some((NonNull::new(ptr)?, Self::class_bytes(class)))
    }

    /// Return a chunk obtained from [`alloc`](Self::alloc).
    pub fn free(&mut self, ptr: *mut u8, class_bytes: usize) {
        self.free_inner(ptr, class_bytes);
        self.stat_user_alloc = self.stat_user_alloc.saturating_sub(class_bytes);
    }

    /// Return a chunk obtained from [`alloc_raw`](Self::alloc_raw).
    pub fn free_raw(&mut self, ptr: *mut u8, class_bytes: usize) {
        self.free_inner(ptr, class_bytes);
    }

    fn free_inner(&mut self, ptr: *mut u8, class_bytes: usize) {
        debug_assert!(class_bytes.is_power_of_two());
        let class = Self::class_index(class_bytes);
        debug_assert!(
            !self.freelists[class].contains(&ptr),
            "double free of {:p}",
            ptr
        );
        self.freelists[class].push(ptr);
    }

    /// Total user bytes outstanding, in size-class units.
    #[inline]
    pub fn stat_user_alloc_tot(&self) -> usize {
        self.stat_user_alloc
    }

    /// Total bytes reserved from the OS.
    #[inline]
    pub fn stat_reserved(&self) -> usize {
        self.stat_reserved
    }
}

impl Drop for HugeAlloc {
    fn drop(&mut self) {
        for region in &self.regions {
            unsafe {
                libc::munmap(region.base as *mut libc::c_void, region.len);
            }
        }
    }
}

// Regions are plain anonymous memory; the owning endpoint serializes
// access behind the allocator lock.
unsafe impl Send for HugeAlloc {}

#[inline]
fn round_up_region(bytes: usize) -> usize {
    let bytes = bytes.max(MAX_CLASS_SIZE);
    (bytes + MAX_CLASS_SIZE - 1) & !(MAX_CLASS_SIZE - 1)
}

/// Reserve `len` bytes, preferring explicit huge pages.
unsafe fn mmap_region(len: usize) -> Result<*mut u8> {
    unsafe {
        let prot = libc::PROT_READ | libc::PROT_WRITE;
        let flags = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS;

        let p = libc::mmap(std::ptr::null_mut(), len, prot, flags | libc::MAP_HUGETLB, -1, 0);
        if p != libc::MAP_FAILED {
            return Ok(p as *mut u8);
        }

        if !HUGEPAGE_WARNED.swap(true, Ordering::Relaxed) {
            log::warn!(
                "MAP_HUGETLB failed ({}); falling back to 4 KiB pages",
                std::io::Error::last_os_error()
            );
        }

        let p = libc::mmap(std::ptr::null_mut(), len, prot, flags, -1, 0);
        if p == libc::MAP_FAILED {
            return Err(Error::HugeAllocFailed(std::io::Error::last_os_error()));
        }
        Ok(p as *mut u8)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_free_roundtrip() {
        let mut a = HugeAlloc::new(MAX_CLASS_SIZE).unwrap();
        assert_eq!(a.stat_user_alloc_tot(), 0);

        let (p, n) = a.alloc(100).unwrap();
        assert_eq!(n, 128);
        assert_eq!(a.stat_user_alloc_tot(), 128);

        a.free(p.as_ptr(), n);
        assert_eq!(a.stat_user_alloc_tot(), 0);
    }

    #[test]
    fn test_class_rounding() {
        assert_eq!(HugeAlloc::class_index(1), 0);
        assert_eq!(HugeAlloc::class_index(64), 0);
        assert_eq!(HugeAlloc::class_index(65), 1);
        assert_eq!(HugeAlloc::class_bytes(0), 64);
        assert_eq!(HugeAlloc::class_bytes(NUM_CLASSES - 1), MAX_CLASS_SIZE);
    }

    #[test]
    fn test_split_and_reuse() {
        let mut a = HugeAlloc::new(MAX_CLASS_SIZE).unwrap();
        let (p1, n1) = a.alloc(4096).unwrap();
        let (p2, n2) = a.alloc(4096).unwrap();
        assert_ne!(p1, p2);
        a.free(p1.as_ptr(), n1);
        a.free(p2.as_ptr(), n2);
        // The freed chunk is recycled for an equal-class request.
        let (p3, _) = a.alloc(4096).unwrap();
        assert!(p3 == p1 || p3 == p2);
    }

    #[test]
    fn test_grows_when_exhausted() {
        let mut a = HugeAlloc::new(MAX_CLASS_SIZE).unwrap();
        let reserved = a.stat_reserved();
        let mut chunks = Vec::new();
        // Two full-class allocations force a second region.
        for _ in 0..2 {
            chunks.push(a.alloc(MAX_CLASS_SIZE).unwrap());
        }
        assert!(a.stat_reserved() > reserved);
        for (p, n) in chunks {
            a.free(p.as_ptr(), n);
        }
        assert_eq!(a.stat_user_alloc_tot(), 0);
    }

    #[test]
    fn test_oversize_refused() {
        let mut a = HugeAlloc::new(MAX_CLASS_SIZE).unwrap();
        assert!(a.alloc(MAX_CLASS_SIZE + 1).is_none());
    }

    #[test]
    fn test_raw_alloc_uncounted() {
        let mut a = HugeAlloc::new(MAX_CLASS_SIZE).unwrap();
        let (p, n) = a.alloc_raw(64).unwrap();
        assert_eq!(a.stat_user_alloc_tot(), 0);
        a.free_raw(p.as_ptr(), n);
    }
}
