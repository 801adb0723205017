use std::alloc::Layout;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};

use super::DeviceError;

/// Alignment of every memory page, both for its host mapping and its GPU base address.
///
/// Sub-allocations may request any power-of-two alignment up to this value and get
/// the same alignment on the CPU pointer and on the GPU address.
pub const PAGE_ALIGNMENT: u64 = 64 * 1024;

/// First GPU address handed out by an [`AddressSpace`]. Zero stays reserved for null.
const ADDRESS_SPACE_BASE: u64 = 0x1_0000_0000;

/// Device-visible address of a byte in GPU memory.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Default)]
pub struct GpuAddress(pub u64);

impl GpuAddress {
    pub const NULL: GpuAddress = GpuAddress(0);

    #[inline]
    pub const fn get(self) -> u64 {
        self.0
    }

    #[inline]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub const fn offset(self, bytes: u64) -> GpuAddress {
        GpuAddress(self.0 + bytes)
    }
}

/// Index of a memory page inside the device that created it.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct MemoryPageId(pub(crate) u32);

/// Which side of the bus a memory page is optimized for.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum MemoryKind {
    /// CPU-writable, GPU-readable. Persistently mapped.
    Upload,
    /// GPU-only scratch. No CPU mapping is exposed.
    DeviceLocal,
}

/// Description of a page created by [`Backend::create_memory_page`](super::Backend::create_memory_page).
///
/// The page itself is owned by the device and lives until the device is dropped.
#[derive(Debug, Copy, Clone)]
pub struct MemoryPageInfo {
    pub id: MemoryPageId,
    pub kind: MemoryKind,
    pub size: u64,
    pub base: GpuAddress,
    /// Host mapping of the page. `None` for [`MemoryKind::DeviceLocal`].
    pub cpu: Option<NonNull<u8>>,
}

// SAFETY: `cpu` points into device-owned memory that stays allocated for the device
// lifetime. Moving the description between threads does not access that memory;
// writers go through `unsafe` APIs that carry the fence contract.
unsafe impl Send for MemoryPageInfo {}
unsafe impl Sync for MemoryPageInfo {}

/// Rounds `value` up to `alignment`, which must be a power of two.
#[inline]
pub(crate) fn align_up(value: u64, alignment: u64) -> u64 {
    debug_assert!(alignment.is_power_of_two());
    (value + alignment - 1) & !(alignment - 1)
}

/// Monotonic allocator of GPU base addresses.
///
/// Addresses are never returned; pages live for the device lifetime.
#[derive(Debug)]
pub(crate) struct AddressSpace {
    next: AtomicU64,
}

impl AddressSpace {
    pub(crate) fn new() -> Self {
        Self {
            next: AtomicU64::new(ADDRESS_SPACE_BASE),
        }
    }

    pub(crate) fn reserve(&self, size: u64) -> GpuAddress {
        let span = align_up(size.max(1), PAGE_ALIGNMENT);
        GpuAddress(self.next.fetch_add(span, Ordering::Relaxed))
    }
}

/// Zero-initialized, page-aligned host allocation backing a memory page.
pub(crate) struct HostBlock {
    ptr: NonNull<u8>,
    layout: Layout,
}

// SAFETY: the block is a plain heap allocation; concurrent access to its bytes is
// governed by the fence contract and only happens through raw-pointer `unsafe` paths.
unsafe impl Send for HostBlock {}
unsafe impl Sync for HostBlock {}

impl HostBlock {
    pub(crate) fn zeroed(size: u64) -> Result<Self, DeviceError> {
        let size = usize::try_from(size).map_err(|_| DeviceError::OutOfMemory)?;
        let layout = Layout::from_size_align(size.max(1), PAGE_ALIGNMENT as usize)
            .map_err(|_| DeviceError::OutOfMemory)?;

        // SAFETY: layout has a non-zero size.
        let raw = unsafe { std::alloc::alloc_zeroed(layout) };
        NonNull::new(raw)
            .map(|ptr| Self { ptr, layout })
            .ok_or(DeviceError::OutOfMemory)
    }

    #[inline]
    pub(crate) fn ptr(&self) -> NonNull<u8> {
        self.ptr
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.layout.size()
    }

    /// Copies `len` bytes starting at `offset` out of the block.
    ///
    /// # Safety
    /// No other thread may be writing the range concurrently.
    pub(crate) unsafe fn read(&self, offset: usize, len: usize) -> Vec<u8> {
        assert!(offset + len <= self.len(), "host block read out of bounds");
        let mut out = vec![0u8; len];
        // SAFETY: bounds checked above; the caller guarantees no concurrent writer.
        unsafe {
            std::ptr::copy_nonoverlapping(self.ptr.as_ptr().add(offset), out.as_mut_ptr(), len);
        }
        out
    }

    /// Writes `bytes` at `offset`.
    ///
    /// # Safety
    /// No other thread may be accessing the range concurrently.
    pub(crate) unsafe fn write(&self, offset: usize, bytes: &[u8]) {
        assert!(offset + bytes.len() <= self.len(), "host block write out of bounds");
        // SAFETY: bounds checked above; the caller guarantees exclusive access.
        unsafe {
            std::ptr::copy_nonoverlapping(
                bytes.as_ptr(),
                self.ptr.as_ptr().add(offset),
                bytes.len(),
            );
        }
    }
}

impl Drop for HostBlock {
    fn drop(&mut self) {
        // SAFETY: allocated in `zeroed` with exactly this layout.
        unsafe { std::alloc::dealloc(self.ptr.as_ptr(), self.layout) }
    }
}

/// One registered page: its description, host storage and backend payload.
pub(crate) struct MemoryEntry<E> {
    pub info: MemoryPageInfo,
    pub host: HostBlock,
    pub extra: E,
}

/// Page table of a device: pages in creation order, which is also address order.
pub(crate) struct MemoryTable<E> {
    entries: Vec<MemoryEntry<E>>,
}

impl<E> MemoryTable<E> {
    pub(crate) fn new() -> Self {
        Self { entries: Vec::new() }
    }

    pub(crate) fn next_id(&self) -> MemoryPageId {
        MemoryPageId(self.entries.len() as u32)
    }

    pub(crate) fn push(&mut self, entry: MemoryEntry<E>) {
        debug_assert_eq!(entry.info.id, self.next_id());
        debug_assert!(
            self.entries
                .last()
                .is_none_or(|last| last.info.base < entry.info.base),
            "pages must be registered in address order"
        );
        self.entries.push(entry);
    }

    pub(crate) fn get(&self, id: MemoryPageId) -> Option<&MemoryEntry<E>> {
        self.entries.get(id.0 as usize)
    }

    pub(crate) fn entries(&self) -> &[MemoryEntry<E>] {
        &self.entries
    }

    /// Resolves `[addr, addr + len)` to a page and an offset inside it.
    ///
    /// Ranges crossing a page boundary do not resolve.
    pub(crate) fn resolve(&self, addr: GpuAddress, len: u64) -> Option<(&MemoryEntry<E>, u64)> {
        let idx = self
            .entries
            .partition_point(|e| e.info.base.get() <= addr.get());
        let entry = self.entries.get(idx.checked_sub(1)?)?;
        let offset = addr.get() - entry.info.base.get();
        (offset + len <= entry.info.size).then_some((entry, offset))
    }
}
