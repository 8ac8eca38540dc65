//! Shared memory pool (C2).
//!
//! Allocates, seals, maps, and distributes file-descriptor-backed memory
//! regions. Callers get back a [`MemoryBlock`] handle (id, offset, size)
//! rather than a copy; the backing bytes are reached only by [`map`].
//!
//! Grounded on `memfd::{Memfd, MemfdOptions, FileSeal}` for anonymous
//! sealed regions and on `nix::sys::mman::{mmap, munmap}` for the
//! `map_twice` double mapping a ring buffer needs to read across its
//! wrap point without a copy.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use memfd::{FileSeal, Memfd, MemfdOptions};
use nix::sys::mman::{mmap, munmap, MapFlags, ProtFlags};
use nix::unistd::{sysconf, SysconfVar};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ShmError {
    #[error("out of memory")]
    Oom,
    #[error("fd limit reached")]
    FdLimit,
    #[error("kernel rejected seal: {0}")]
    SealRejected(#[from] memfd::Error),
    #[error("block closed")]
    BlockClosed,
    #[error("peer sent an unsealed memory block where sealing is required")]
    Unsealed,
    #[error("mmap failed: {0}")]
    Mmap(#[from] nix::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct BlockFlags: u32 {
        const WITH_FD    = 1 << 0;
        const SEALED     = 1 << 1;
        const MAP_READ   = 1 << 2;
        const MAP_WRITE  = 1 << 3;
        const MAP_TWICE  = 1 << 4;
    }
}

/// A `(fd, offset, size, flags)` reference to a shared region (§3 Memory
/// block). Cloning shares the underlying fd via a refcount; the region
/// is freed when the last clone drops.
#[derive(Debug, Clone)]
pub struct MemoryBlock {
    inner: Arc<BlockInner>,
    pub offset: u64,
    pub size: u64,
}

#[derive(Debug)]
struct BlockInner {
    fd: OwnedFd,
    flags: BlockFlags,
    closed: AtomicU32,
}

impl MemoryBlock {
    pub fn flags(&self) -> BlockFlags {
        self.inner.flags
    }

    pub fn is_sealed(&self) -> bool {
        self.inner.flags.contains(BlockFlags::SEALED)
    }

    pub fn as_raw_fd(&self) -> RawFd {
        self.inner.fd.as_raw_fd()
    }

    pub fn as_fd(&self) -> BorrowedFd<'_> {
        self.inner.fd.as_fd()
    }

    fn mark_closed(&self) {
        self.inner.closed.store(1, Ordering::Release);
    }

    fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire) != 0
    }
}

/// A mapping of a [`MemoryBlock`] into this process's address space.
/// `data()` always returns a slice starting at the block's logical
/// offset, with the page-alignment shift already applied; if the block
/// was mapped with `map_twice` the slice appears contiguous across the
/// ring's wrap point even though it physically aliases a single region
/// twice.
pub struct Mapping {
    ptr: NonNull<u8>,
    mapped_len: usize,
    page_shift: usize,
    logical_len: usize,
    doubled: bool,
}

// SAFETY: `ptr` refers to a shared-memory mapping; the pages themselves
// are what requires synchronization (via the IO area atomics), not this
// handle. Mirrors memmap2's own Send/Sync impls for MmapRaw.
unsafe impl Send for Mapping {}
unsafe impl Sync for Mapping {}

impl Mapping {
    /// Length of the slice `data`/`data_mut` expose: the logical region
    /// once, or twice back-to-back when `map_twice` was requested, so a
    /// ring's wrap point can be read without a copy.
    fn exposed_len(&self) -> usize {
        if self.doubled { self.logical_len * 2 } else { self.logical_len }
    }

    pub fn data(&self) -> &[u8] {
        unsafe {
            std::slice::from_raw_parts(self.ptr.as_ptr().add(self.page_shift), self.exposed_len())
        }
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        unsafe {
            std::slice::from_raw_parts_mut(self.ptr.as_ptr().add(self.page_shift), self.exposed_len())
        }
    }

    pub fn is_doubled(&self) -> bool {
        self.doubled
    }
}

impl Drop for Mapping {
    fn drop(&mut self) {
        unsafe {
            let _ = munmap(self.ptr.cast(), self.mapped_len);
        }
    }
}

fn page_size() -> usize {
    sysconf(SysconfVar::PAGE_SIZE)
        .ok()
        .flatten()
        .map(|v| v as usize)
        .unwrap_or(4096)
}

/// Key used to dedup mappings of a region a peer already imported once:
/// `(originating peer id, region id)`, per spec.md §4.2.
type DedupKey = (u32, u32);

/// Process-local pool of shared memory regions.
pub struct ShmPool {
    dedup: Mutex<HashMap<DedupKey, MemoryBlock>>,
}

impl Default for ShmPool {
    fn default() -> Self {
        Self::new()
    }
}

impl ShmPool {
    pub fn new() -> Self {
        Self { dedup: Mutex::new(HashMap::new()) }
    }

    /// Allocate a fresh anonymous memfd-backed region of `size` bytes.
    /// `WITH_FD` is implied; `SEALED` additionally forbids grow/shrink
    /// and further sealing, per §4.2.
    pub fn allocate(&mut self, flags: BlockFlags, size: u64) -> Result<MemoryBlock, ShmError> {
        let opts = MemfdOptions::default().allow_sealing(flags.contains(BlockFlags::SEALED));
        let mfd: Memfd = opts.create("patchbay-region").map_err(|_| ShmError::FdLimit)?;
        mfd.as_file().set_len(size).map_err(ShmError::Io)?;

        if flags.contains(BlockFlags::SEALED) {
            for seal in [FileSeal::SealShrink, FileSeal::SealGrow, FileSeal::SealSeal] {
                mfd.add_seal(seal).map_err(ShmError::SealRejected)?;
            }
        }

        let fd: OwnedFd = mfd.into_file().into();
        let block = MemoryBlock {
            inner: Arc::new(BlockInner {
                fd,
                flags: flags | BlockFlags::WITH_FD,
                closed: AtomicU32::new(0),
            }),
            offset: 0,
            size,
        };
        Ok(block)
    }

    /// Import a block a peer handed us a fd for. `origin_peer_id` and
    /// `region_id` identify the region for the cross-peer dedup index;
    /// if we already mapped this exact region for this peer, the same
    /// [`MemoryBlock`] (sharing one fd) is returned instead of a second
    /// `dup`. `require_sealed` is set whenever the receiving side is
    /// about to trust the block's advertised size without re-checking
    /// it (e.g. a buffer backing store, §5 "the `sealed` flag, when
    /// set, is a hard requirement the receiver checks before trusting a
    /// region's size") - a peer that omits `SEALED` there is rejected
    /// rather than mapped.
    pub fn import(
        &mut self,
        origin_peer_id: u32,
        region_id: u32,
        fd: OwnedFd,
        offset: u64,
        size: u64,
        flags: BlockFlags,
        require_sealed: bool,
    ) -> Result<MemoryBlock, ShmError> {
        if require_sealed && !flags.contains(BlockFlags::SEALED) {
            return Err(ShmError::Unsealed);
        }
        let mut dedup = self.dedup.lock().expect("shm dedup mutex poisoned");
        if let Some(existing) = dedup.get(&(origin_peer_id, region_id)) {
            return Ok(existing.clone());
        }
        let block = MemoryBlock {
            inner: Arc::new(BlockInner { fd, flags, closed: AtomicU32::new(0) }),
            offset,
            size,
        };
        dedup.insert((origin_peer_id, region_id), block.clone());
        Ok(block)
    }

    /// Map `block` into this process. Offset is rounded down to the page
    /// boundary; the in-page shift is folded back into the returned
    /// slice so callers never see it. `map_twice` maps the region twice
    /// back-to-back so a ring of `block.size` bytes reads contiguously
    /// across the wrap point.
    pub fn map(&self, block: &MemoryBlock) -> Result<Mapping, ShmError> {
        if block.is_closed() {
            return Err(ShmError::BlockClosed);
        }
        let page = page_size() as u64;
        let page_shift = (block.offset % page) as usize;
        let map_offset = block.offset - page_shift as u64;
        let logical_len = block.size as usize;
        let single_len = logical_len + page_shift;

        let mut prot = ProtFlags::empty();
        if block.flags().contains(BlockFlags::MAP_READ) || block.flags().is_empty() {
            prot |= ProtFlags::PROT_READ;
        }
        if block.flags().contains(BlockFlags::MAP_WRITE) {
            prot |= ProtFlags::PROT_WRITE;
        }
        if prot.is_empty() {
            prot = ProtFlags::PROT_READ | ProtFlags::PROT_WRITE;
        }

        let doubled = block.flags().contains(BlockFlags::MAP_TWICE);
        let mapped_len = if doubled { single_len * 2 } else { single_len };
        let len = NonZeroUsize::new(mapped_len).ok_or(ShmError::Oom)?;

        if !doubled {
            let ptr = unsafe {
                mmap(None, len, prot, MapFlags::MAP_SHARED, block.as_fd(), map_offset as i64)
                    .map_err(ShmError::Mmap)?
            }
            .cast::<u8>();
            return Ok(Mapping { ptr, mapped_len, page_shift, logical_len, doubled });
        }

        // Reserve a contiguous region big enough for two copies, then
        // re-map each half onto the same backing fd at MAP_FIXED.
        let reserve_len = NonZeroUsize::new(mapped_len).ok_or(ShmError::Oom)?;
        let base = unsafe {
            nix::sys::mman::mmap_anonymous(None, reserve_len, ProtFlags::PROT_NONE, MapFlags::MAP_PRIVATE)
        }
        .map_err(ShmError::Mmap)?
        .cast::<u8>();

        let half_len = NonZeroUsize::new(single_len).ok_or(ShmError::Oom)?;
        unsafe {
            mmap(
                NonZeroUsize::new(base.as_ptr() as usize),
                half_len,
                prot,
                MapFlags::MAP_SHARED | MapFlags::MAP_FIXED,
                block.as_fd(),
                map_offset as i64,
            )
            .map_err(ShmError::Mmap)?;
            mmap(
                NonZeroUsize::new(base.as_ptr().add(single_len) as usize),
                half_len,
                prot,
                MapFlags::MAP_SHARED | MapFlags::MAP_FIXED,
                block.as_fd(),
                map_offset as i64,
            )
            .map_err(ShmError::Mmap)?;
        }

        Ok(Mapping { ptr: base, mapped_len, page_shift, logical_len, doubled })
    }

    pub fn unmap(&self, mapping: Mapping) {
        drop(mapping);
    }

    pub fn free(&mut self, block: MemoryBlock) {
        block.mark_closed();
        let mut dedup = self.dedup.lock().expect("shm dedup mutex poisoned");
        dedup.retain(|_, v| !Arc::ptr_eq(&v.inner, &block.inner));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_and_map_roundtrip() {
        let mut pool = ShmPool::new();
        let block = pool.allocate(BlockFlags::MAP_READ | BlockFlags::MAP_WRITE, 4096).unwrap();
        let mut mapping = pool.map(&block).unwrap();
        mapping.data_mut()[0] = 0x42;
        assert_eq!(mapping.data()[0], 0x42);
    }

    #[test]
    fn sealed_block_reports_sealed() {
        let mut pool = ShmPool::new();
        let block = pool.allocate(BlockFlags::SEALED | BlockFlags::MAP_READ, 4096).unwrap();
        assert!(block.is_sealed());
    }

    #[test]
    fn dedup_returns_same_block_for_same_peer_region() {
        let mut pool = ShmPool::new();
        let backing = pool.allocate(BlockFlags::MAP_READ, 4096).unwrap();
        let fd1 = backing.inner.fd.try_clone().unwrap();
        let fd2 = backing.inner.fd.try_clone().unwrap();

        let a = pool.import(7, 1, fd1, 0, 4096, BlockFlags::MAP_READ, false).unwrap();
        let b = pool.import(7, 1, fd2, 0, 4096, BlockFlags::MAP_READ, false).unwrap();
        assert!(Arc::ptr_eq(&a.inner, &b.inner));
    }

    #[test]
    fn unsealed_block_is_rejected_when_sealing_is_required() {
        let mut pool = ShmPool::new();
        let backing = pool.allocate(BlockFlags::MAP_READ, 4096).unwrap();
        let fd = backing.inner.fd.try_clone().unwrap();

        let result = pool.import(7, 2, fd, 0, 4096, BlockFlags::MAP_READ, true);
        assert!(matches!(result, Err(ShmError::Unsealed)));
    }

    #[test]
    fn sealed_block_is_accepted_when_sealing_is_required() {
        let mut pool = ShmPool::new();
        let backing = pool.allocate(BlockFlags::SEALED | BlockFlags::MAP_READ, 4096).unwrap();
        let fd = backing.inner.fd.try_clone().unwrap();

        let result = pool.import(7, 3, fd, 0, 4096, BlockFlags::SEALED | BlockFlags::MAP_READ, true);
        assert!(result.is_ok());
    }

    #[test]
    fn map_twice_reads_contiguously_across_wrap() {
        let mut pool = ShmPool::new();
        let block = pool
            .allocate(BlockFlags::MAP_READ | BlockFlags::MAP_WRITE | BlockFlags::MAP_TWICE, 4096)
            .unwrap();
        let mut mapping = pool.map(&block).unwrap();
        mapping.data_mut()[4095] = 0xaa;
        // the second copy should mirror the write made through the first
        assert_eq!(mapping.data()[4095 + 4096], 0xaa);
    }
}
