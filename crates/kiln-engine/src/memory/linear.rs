use std::ops::Range;
use std::ptr::NonNull;
use std::sync::{Arc, Mutex};

use bytemuck::Pod;

use super::PagePool;
use crate::command::CommandBuffer;
use crate::device::{
    align_up, Backend, DeviceError, GpuAddress, MemoryKind, MemoryPageId, MemoryPageInfo,
    PAGE_ALIGNMENT,
};
use crate::sync::{lock, RetireStamp};

/// Alignment used when callers have no stronger requirement (constant-buffer size).
pub const DEFAULT_ALIGNMENT: u64 = 256;

/// Which kind of transient memory an allocator hands out.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum LinearAllocatorKind {
    /// CPU-writable, GPU-readable: per-draw constants, dynamic vertices, uploads.
    Upload,
    /// GPU-only scratch written by shaders or copies.
    DeviceLocal,
}

impl LinearAllocatorKind {
    /// Page size used unless configured otherwise.
    pub const fn default_page_size(self) -> u64 {
        match self {
            LinearAllocatorKind::Upload => 2 * 1024 * 1024,
            LinearAllocatorKind::DeviceLocal => 64 * 1024,
        }
    }

    const fn memory_kind(self) -> MemoryKind {
        match self {
            LinearAllocatorKind::Upload => MemoryKind::Upload,
            LinearAllocatorKind::DeviceLocal => MemoryKind::DeviceLocal,
        }
    }
}

/// Shared pool of fixed-size memory pages for [`LinearAllocator`]s.
///
/// Pages are created lazily and kept until the device is dropped.
pub struct LinearPageManager {
    kind: LinearAllocatorKind,
    page_size: u64,
    backend: Arc<dyn Backend>,
    pool: Mutex<PagePool<MemoryPageInfo>>,
}

impl LinearPageManager {
    pub fn new(backend: Arc<dyn Backend>, kind: LinearAllocatorKind, page_size: u64) -> Self {
        assert!(page_size > 0, "linear pages need a non-zero size");
        Self {
            kind,
            page_size,
            backend,
            pool: Mutex::new(PagePool::new()),
        }
    }

    #[inline]
    pub fn kind(&self) -> LinearAllocatorKind {
        self.kind
    }

    #[inline]
    pub fn page_size(&self) -> u64 {
        self.page_size
    }

    /// Total pages ever created.
    pub fn page_count(&self) -> usize {
        lock(&self.pool).len()
    }

    /// Pages ready for immediate reuse.
    pub fn available_count(&self) -> usize {
        lock(&self.pool).available_len()
    }

    /// Pages waiting on a fence before they can be reused.
    pub fn retired_count(&self) -> usize {
        lock(&self.pool).retired_len()
    }

    fn request_page(&self) -> Result<(usize, MemoryPageInfo), DeviceError> {
        let mut pool = lock(&self.pool);
        let index = pool.request(|| {
            let info = self
                .backend
                .create_memory_page(self.page_size, self.kind.memory_kind())?;
            log::debug!(
                "{:?} linear pages: created page {:?} ({} bytes at {:#x})",
                self.kind,
                info.id,
                info.size,
                info.base.get()
            );
            Ok(info)
        })?;
        Ok((index, *pool.get(index)))
    }

    fn release_pages(&self, indices: impl IntoIterator<Item = usize>) {
        lock(&self.pool).release(indices);
    }

    fn retire_pages(&self, indices: impl IntoIterator<Item = usize>, stamp: RetireStamp) {
        lock(&self.pool).retire(indices, stamp);
    }
}

/// A transient range carved out of a linear page.
///
/// Valid until the owning allocator is freed and the GPU work reading it has
/// completed. Bytes written through [`TransientAllocation::write`] are what the GPU
/// reads at [`TransientAllocation::gpu_address`] once the allocator's host writes
/// have been recorded into the submitted command buffer.
#[derive(Debug)]
pub struct TransientAllocation {
    page: MemoryPageId,
    offset: u64,
    size: u64,
    gpu: GpuAddress,
    cpu: Option<NonNull<u8>>,
}

impl TransientAllocation {
    #[inline]
    pub fn gpu_address(&self) -> GpuAddress {
        self.gpu
    }

    /// Host pointer to the first byte, `None` for device-local memory.
    #[inline]
    pub fn cpu_ptr(&self) -> Option<NonNull<u8>> {
        self.cpu
    }

    #[inline]
    pub fn size(&self) -> u64 {
        self.size
    }

    #[inline]
    pub fn page(&self) -> MemoryPageId {
        self.page
    }

    /// Offset of the allocation inside its page.
    #[inline]
    pub fn page_offset(&self) -> u64 {
        self.offset
    }

    /// Copies `bytes` into the allocation at `offset`.
    ///
    /// # Safety
    /// The allocator that produced this range must not have been freed since, and
    /// the device that owns the page must still be alive.
    ///
    /// # Panics
    /// Panics on device-local memory or when the write does not fit.
    pub unsafe fn write(&self, offset: u64, bytes: &[u8]) {
        let Some(cpu) = self.cpu else {
            panic!("device-local transient memory has no CPU mapping");
        };
        assert!(
            offset + bytes.len() as u64 <= self.size,
            "write of {} bytes at {offset} overflows a {}-byte allocation",
            bytes.len(),
            self.size
        );
        // SAFETY: bounds checked above; liveness and exclusivity are the caller's contract.
        unsafe {
            std::ptr::copy_nonoverlapping(
                bytes.as_ptr(),
                cpu.as_ptr().add(offset as usize),
                bytes.len(),
            );
        }
    }

    /// Writes a plain-data value at `offset`.
    ///
    /// # Safety
    /// Same contract as [`TransientAllocation::write`].
    pub unsafe fn write_pod<T: Pod>(&self, offset: u64, value: &T) {
        // SAFETY: forwarded contract.
        unsafe { self.write(offset, bytemuck::bytes_of(value)) }
    }

    /// Writes a slice of plain-data values at `offset`.
    ///
    /// # Safety
    /// Same contract as [`TransientAllocation::write`].
    pub unsafe fn write_slice<T: Pod>(&self, offset: u64, values: &[T]) {
        // SAFETY: forwarded contract.
        unsafe { self.write(offset, bytemuck::cast_slice(values)) }
    }
}

/// Per-context bump allocator over pages from a [`LinearPageManager`].
///
/// Not shared between threads; each recording context owns one. Nothing is
/// reclaimed per allocation: [`LinearAllocator::free`] or
/// [`LinearAllocator::free_after`] returns every page used since the last free.
///
/// CPU-visible allocations are remembered until
/// [`LinearAllocator::record_host_writes`] moves them into the command buffer
/// that reads them.
pub struct LinearAllocator {
    manager: Arc<LinearPageManager>,
    current: Option<(usize, MemoryPageInfo)>,
    offset: u64,
    /// Pages filled since the last free, excluding `current`.
    used: Vec<usize>,
    /// CPU-visible ranges handed out since the last `record_host_writes`.
    host_writes: Vec<(MemoryPageId, Range<u64>)>,
}

impl LinearAllocator {
    pub fn new(manager: Arc<LinearPageManager>) -> Self {
        Self {
            manager,
            current: None,
            offset: 0,
            used: Vec::new(),
            host_writes: Vec::new(),
        }
    }

    #[inline]
    pub fn kind(&self) -> LinearAllocatorKind {
        self.manager.kind
    }

    /// Carves `size` bytes aligned to `alignment` out of the current page.
    ///
    /// Moves to a new page when the request does not fit in what is left. Never
    /// blocks on the GPU.
    ///
    /// # Panics
    /// Panics if `alignment` is not a power of two no larger than
    /// [`PAGE_ALIGNMENT`], or if the aligned size exceeds one page.
    pub fn allocate(&mut self, size: u64, alignment: u64) -> Result<TransientAllocation, DeviceError> {
        assert!(
            alignment.is_power_of_two() && alignment <= PAGE_ALIGNMENT,
            "alignment {alignment} must be a power of two no larger than {PAGE_ALIGNMENT}"
        );
        let page_size = self.manager.page_size;
        let aligned_size = align_up(size, alignment);
        assert!(
            aligned_size <= page_size,
            "transient allocation of {size} bytes exceeds page size of {page_size}"
        );

        let mut offset = align_up(self.offset, alignment);
        if self.current.is_none() || offset + aligned_size > page_size {
            if let Some((index, _)) = self.current.take() {
                self.used.push(index);
            }
            let page = self.manager.request_page().inspect_err(|err| {
                log::error!("{:?} linear allocator: page request failed: {err}", self.manager.kind)
            })?;
            self.current = Some(page);
            offset = 0;
        }

        let Some((_, info)) = self.current else {
            unreachable!("current page set above");
        };
        self.offset = offset + aligned_size;

        if info.cpu.is_some() && aligned_size > 0 {
            match self.host_writes.last_mut() {
                Some((page, range)) if *page == info.id && range.end == offset => {
                    range.end = offset + aligned_size;
                }
                _ => self.host_writes.push((info.id, offset..offset + aligned_size)),
            }
        }

        Ok(TransientAllocation {
            page: info.id,
            offset,
            size,
            gpu: info.base.offset(offset),
            // SAFETY: offset + aligned_size <= page size, so the pointer stays inside
            // the page mapping.
            cpu: info.cpu.map(|base| unsafe { base.add(offset as usize) }),
        })
    }

    /// Moves the CPU-visible ranges handed out since the last call into `cmd`.
    ///
    /// Call once everything has been written, before `cmd` is submitted.
    pub fn record_host_writes(&mut self, cmd: &mut CommandBuffer) {
        for (page, range) in self.host_writes.drain(..) {
            cmd.note_host_write(page, range);
        }
    }

    /// Number of pages touched since the last free.
    pub fn pages_in_use(&self) -> usize {
        self.used.len() + usize::from(self.current.is_some())
    }

    /// Returns every page used since the last free to the shared pool at once.
    ///
    /// The caller guarantees the GPU has finished reading them (for example after
    /// waiting on the submission that used them).
    pub fn free(&mut self) {
        let pages = self.take_pages();
        self.manager.release_pages(pages);
    }

    /// Returns every page used since the last free, reusable once `stamp` completes.
    pub fn free_after(&mut self, stamp: RetireStamp) {
        let pages = self.take_pages();
        self.manager.retire_pages(pages, stamp);
    }

    fn take_pages(&mut self) -> Vec<usize> {
        let mut pages = std::mem::take(&mut self.used);
        if let Some((index, _)) = self.current.take() {
            pages.push(index);
        }
        self.offset = 0;
        self.host_writes.clear();
        pages
    }
}
