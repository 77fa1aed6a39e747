//! Executable memory for compiled code
//!
//! Each allocation is page-granular and starts out read+write. The encoder
//! copies code, pdata and xdata in, then `CodeHandle::finalize` flips the
//! pages to read+execute; after that the handle refuses writes. The
//! allocator keeps its own lock, independent of any heap allocator.

use super::lower::MachineConstants;
use crate::config::CodegenConfig;
use crate::error::{Error, Result};
use std::ptr::NonNull;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, warn};

// ==================== Platform ====================

#[cfg(unix)]
fn map_pages(size: usize) -> Option<NonNull<u8>> {
    // SAFETY: anonymous private mapping, no file descriptor involved
    let ptr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        )
    };
    if ptr == libc::MAP_FAILED {
        return None;
    }
    NonNull::new(ptr as *mut u8)
}

#[cfg(unix)]
fn unmap_pages(ptr: NonNull<u8>, size: usize) {
    // SAFETY: `ptr..ptr+size` was returned by `map_pages` and is unmapped once
    unsafe {
        libc::munmap(ptr.as_ptr() as *mut libc::c_void, size);
    }
}

#[cfg(unix)]
fn protect(ptr: NonNull<u8>, size: usize, executable: bool) -> bool {
    let prot = if executable {
        libc::PROT_READ | libc::PROT_EXEC
    } else {
        libc::PROT_READ | libc::PROT_WRITE
    };
    // SAFETY: the range is page aligned and owned by a live mapping
    unsafe { libc::mprotect(ptr.as_ptr() as *mut libc::c_void, size, prot) == 0 }
}

#[cfg(not(unix))]
fn map_pages(size: usize) -> Option<NonNull<u8>> {
    let layout = std::alloc::Layout::from_size_align(size, 4096).ok()?;
    // SAFETY: layout has non-zero size
    NonNull::new(unsafe { std::alloc::alloc_zeroed(layout) })
}

#[cfg(not(unix))]
fn unmap_pages(ptr: NonNull<u8>, size: usize) {
    if let Ok(layout) = std::alloc::Layout::from_size_align(size, 4096) {
        // SAFETY: allocated by `map_pages` with this layout
        unsafe { std::alloc::dealloc(ptr.as_ptr(), layout) }
    }
}

#[cfg(not(unix))]
fn protect(_ptr: NonNull<u8>, _size: usize, _executable: bool) -> bool {
    true
}

// ==================== Reserved region ====================

/// Pages mapped once up front and carved into allocations
struct Region {
    base: NonNull<u8>,
    size: usize,
}

// SAFETY: the region is plain memory; carving is serialized by the allocator lock
unsafe impl Send for Region {}
unsafe impl Sync for Region {}

impl Drop for Region {
    fn drop(&mut self) {
        unmap_pages(self.base, self.size);
    }
}

/// Return `(offset, len)` to a free list kept sorted by offset, merging it
/// with the ranges on either side
fn release_range(free: &mut Vec<(usize, usize)>, offset: usize, len: usize) {
    let i = free.partition_point(|(o, _)| *o < offset);
    free.insert(i, (offset, len));
    if i + 1 < free.len() && free[i].0 + free[i].1 == free[i + 1].0 {
        free[i].1 += free[i + 1].1;
        free.remove(i + 1);
    }
    if i > 0 && free[i - 1].0 + free[i - 1].1 == free[i].0 {
        free[i - 1].1 += free[i].1;
        free.remove(i);
    }
}

struct AllocatorState {
    live_bytes: usize,
    peak_bytes: usize,
    allocations: u64,
    region: Option<Arc<Region>>,
    /// Free ranges of the reserved region, `(offset, len)`
    free: Vec<(usize, usize)>,
}

struct Shared {
    config: CodegenConfig,
    state: Mutex<AllocatorState>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, AllocatorState> {
        // The state stays consistent across a panicking holder
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Allocation counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AllocatorStats {
    pub live_bytes: usize,
    pub peak_bytes: usize,
    pub allocations: u64,
    pub reserved_bytes: usize,
}

/// Hands out executable memory
#[derive(Clone)]
pub struct CodeAllocator {
    shared: Arc<Shared>,
    machine: &'static MachineConstants,
}

enum Origin {
    Mapped,
    Reserved { region: Arc<Region>, offset: usize },
}

/// An allocation holding one function's code, pdata and xdata
pub struct CodeHandle {
    ptr: NonNull<u8>,
    size: usize,
    code_size: usize,
    pdata_offset: usize,
    xdata_offset: usize,
    executable: bool,
    origin: Origin,
    shared: Arc<Shared>,
}

// SAFETY: the handle owns its pages; after finalize they are read-only
unsafe impl Send for CodeHandle {}
unsafe impl Sync for CodeHandle {}

impl CodeAllocator {
    pub fn new(config: &CodegenConfig, machine: &'static MachineConstants) -> Self {
        let mut region = None;
        let mut free = Vec::new();
        if config.reserve_pages > 0 {
            let size = config.reserve_pages * config.page_size;
            match map_pages(size) {
                Some(base) => {
                    debug!(bytes = size, "Reserved code region");
                    free.push((0, size));
                    region = Some(Arc::new(Region { base, size }));
                }
                None => warn!(bytes = size, "Could not reserve code region"),
            }
        }
        Self {
            shared: Arc::new(Shared {
                config: config.clone(),
                state: Mutex::new(AllocatorState {
                    live_bytes: 0,
                    peak_bytes: 0,
                    allocations: 0,
                    region,
                    free,
                }),
            }),
            machine,
        }
    }

    fn round_to_pages(&self, bytes: usize) -> usize {
        let page = self.shared.config.page_size;
        bytes.div_ceil(page).max(1) * page
    }

    /// Allocate room for `bytes` of code followed by `pdata_count` pdata
    /// entries and `xdata_size` bytes of unwind data
    pub fn allocate(&self, bytes: usize, pdata_count: usize, xdata_size: usize) -> Result<CodeHandle> {
        let pointer = self.machine.pointer_size as usize;
        let pdata_offset = bytes.div_ceil(pointer) * pointer;
        let xdata_offset = pdata_offset + pdata_count * self.machine.pdata_entry_size as usize;
        let requested = xdata_offset + xdata_size;
        let size = self.round_to_pages(requested);

        let mut state = self.shared.lock();
        if state.live_bytes + size > self.shared.config.max_code_bytes {
            warn!(requested = size, live = state.live_bytes, "Code allocation over limit");
            return Err(Error::OutOfMemory { requested: size });
        }

        let carved = state.region.clone().and_then(|region| {
            let i = state.free.iter().position(|(_, len)| *len >= size)?;
            let (offset, len) = state.free[i];
            if len == size {
                state.free.remove(i);
            } else {
                state.free[i] = (offset + size, len - size);
            }
            // SAFETY: offset + size lies inside the region
            let ptr = unsafe { NonNull::new_unchecked(region.base.as_ptr().add(offset)) };
            Some((ptr, Origin::Reserved { region, offset }))
        });
        let (ptr, origin) = match carved {
            Some(c) => c,
            None => (
                map_pages(size).ok_or(Error::OutOfMemory { requested: size })?,
                Origin::Mapped,
            ),
        };

        state.live_bytes += size;
        state.peak_bytes = state.peak_bytes.max(state.live_bytes);
        state.allocations += 1;
        debug!(bytes = size, live = state.live_bytes, reserved = matches!(origin, Origin::Reserved { .. }), "Allocated code pages");

        Ok(CodeHandle {
            ptr,
            size,
            code_size: bytes,
            pdata_offset,
            xdata_offset,
            executable: false,
            origin,
            shared: Arc::clone(&self.shared),
        })
    }

    pub fn stats(&self) -> AllocatorStats {
        let state = self.shared.lock();
        AllocatorStats {
            live_bytes: state.live_bytes,
            peak_bytes: state.peak_bytes,
            allocations: state.allocations,
            reserved_bytes: state.region.as_ref().map_or(0, |r| r.size),
        }
    }
}

impl CodeHandle {
    /// Copy `data` in at `offset`; fails once the code is finalized
    pub fn write(&mut self, offset: usize, data: &[u8]) -> Result<()> {
        if self.executable {
            return Err(Error::internal("write to finalized code"));
        }
        if offset + data.len() > self.size {
            return Err(Error::internal(format!(
                "code write of {} bytes at {} overflows {}-byte allocation",
                data.len(),
                offset,
                self.size
            )));
        }
        // SAFETY: bounds checked above and the pages are writable
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), self.ptr.as_ptr().add(offset), data.len());
        }
        Ok(())
    }

    /// Flip the pages to read+execute
    pub fn finalize(&mut self) -> Result<()> {
        if self.executable {
            return Ok(());
        }
        if !protect(self.ptr, self.size, true) {
            return Err(Error::OutOfMemory { requested: self.size });
        }
        self.executable = true;
        Ok(())
    }

    pub fn is_executable(&self) -> bool {
        self.executable
    }

    /// Allocation size in bytes (page multiple)
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn code_size(&self) -> usize {
        self.code_size
    }

    pub fn pdata_offset(&self) -> usize {
        self.pdata_offset
    }

    pub fn xdata_offset(&self) -> usize {
        self.xdata_offset
    }

    pub fn address(&self) -> usize {
        self.ptr.as_ptr() as usize
    }

    /// The code bytes
    pub fn code(&self) -> &[u8] {
        // SAFETY: the pages are readable in both states and outlive `self`
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.code_size) }
    }
}

impl Drop for CodeHandle {
    fn drop(&mut self) {
        let mut state = self.shared.lock();
        state.live_bytes = state.live_bytes.saturating_sub(self.size);
        match &self.origin {
            Origin::Mapped => unmap_pages(self.ptr, self.size),
            Origin::Reserved { offset, .. } => {
                protect(self.ptr, self.size, false);
                release_range(&mut state.free, *offset, self.size);
            }
        }
    }
}

impl std::fmt::Debug for CodeHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CodeHandle")
            .field("address", &format_args!("{:#x}", self.address()))
            .field("size", &self.size)
            .field("code_size", &self.code_size)
            .field("executable", &self.executable)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jit::lower::machine::X64;

    fn allocator(config: CodegenConfig) -> CodeAllocator {
        CodeAllocator::new(&config, &X64)
    }

    #[test]
    fn test_allocation_is_page_rounded_and_finalizes() {
        let alloc = allocator(CodegenConfig::default());
        let mut handle = alloc.allocate(100, 1, 8).unwrap();
        assert_eq!(handle.size(), 4096);
        assert_eq!(handle.pdata_offset(), 104);
        assert_eq!(handle.xdata_offset(), 116);
        handle.write(0, &[0x90; 100]).unwrap();
        handle.finalize().unwrap();
        assert!(handle.is_executable());
        assert!(handle.size() >= 100 + 12 + 8);
        assert_eq!(handle.code()[99], 0x90);
        assert!(handle.write(0, &[0]).is_err());
    }

    #[test]
    fn test_limit_reports_out_of_memory() {
        let alloc = allocator(CodegenConfig {
            max_code_bytes: 4096,
            ..CodegenConfig::default()
        });
        let first = alloc.allocate(10, 0, 0).unwrap();
        let err = alloc.allocate(10, 0, 0).unwrap_err();
        assert!(matches!(err, Error::OutOfMemory { .. }));
        drop(first);
        assert_eq!(alloc.stats().live_bytes, 0);
        assert!(alloc.allocate(10, 0, 0).is_ok());
    }

    #[test]
    fn test_reserved_region_is_reused() {
        let alloc = allocator(CodegenConfig {
            reserve_pages: 2,
            ..CodegenConfig::default()
        });
        assert_eq!(alloc.stats().reserved_bytes, 8192);
        let a = alloc.allocate(5000, 0, 0).unwrap();
        let addr = a.address();
        drop(a);
        let mut b = alloc.allocate(5000, 0, 0).unwrap();
        assert_eq!(b.address(), addr);
        b.write(0, &[1, 2, 3]).unwrap();
        b.finalize().unwrap();
        assert_eq!(&b.code()[..3], &[1, 2, 3]);
    }

    #[test]
    fn test_freed_neighbours_serve_a_larger_request() {
        let alloc = allocator(CodegenConfig {
            reserve_pages: 2,
            ..CodegenConfig::default()
        });
        let a = alloc.allocate(10, 0, 0).unwrap();
        let b = alloc.allocate(10, 0, 0).unwrap();
        let base = a.address();
        assert_eq!(b.address(), base + 4096);
        drop(b);
        drop(a);
        let big = alloc.allocate(5000, 0, 0).unwrap();
        assert_eq!(big.address(), base);
    }

    #[test]
    fn test_release_range_coalesces() {
        let mut free = vec![(0, 4096), (12288, 4096)];
        release_range(&mut free, 4096, 8192);
        assert_eq!(free, vec![(0, 16384)]);

        let mut free = vec![(8192, 4096)];
        release_range(&mut free, 0, 4096);
        assert_eq!(free, vec![(0, 4096), (8192, 4096)]);
        release_range(&mut free, 4096, 4096);
        assert_eq!(free, vec![(0, 12288)]);
    }

    #[test]
    fn test_write_bounds() {
        let alloc = allocator(CodegenConfig::default());
        let mut handle = alloc.allocate(16, 0, 0).unwrap();
        assert!(handle.write(4090, &[0; 10]).is_err());
    }
}
