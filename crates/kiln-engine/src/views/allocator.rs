use std::sync::{Arc, Mutex};

use crate::device::{Backend, DeviceError, ViewDesc, ViewPageId, ViewSlot, ViewVisibility};
use crate::sync::lock;

/// Slots per page of a [`ViewSlotAllocator`] unless configured otherwise.
pub const DEFAULT_VIEW_PAGE_CAPACITY: u32 = 256;

/// Contiguous run of view slots on one page.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct ViewSlotRange {
    first: ViewSlot,
    count: u32,
}

impl ViewSlotRange {
    #[inline]
    pub fn first(&self) -> ViewSlot {
        self.first
    }

    #[inline]
    pub fn count(&self) -> u32 {
        self.count
    }

    /// Slot `i` of the range.
    #[inline]
    pub fn slot(&self, i: u32) -> ViewSlot {
        assert!(i < self.count, "slot {i} out of range of {} slots", self.count);
        self.first.offset(i)
    }

    pub fn iter(&self) -> impl Iterator<Item = ViewSlot> + '_ {
        (0..self.count).map(|i| self.first.offset(i))
    }
}

struct AllocatorState {
    pages: Vec<ViewPageId>,
    /// Next free slot on the last page.
    cursor: u32,
}

/// Bump allocator for long-lived view slots.
///
/// Slots are never reclaimed individually; pages are created on demand and kept for
/// the device lifetime. Intended for views created once per resource (textures,
/// persistent constant buffers). Allocation is serialized by a single lock.
pub struct ViewSlotAllocator {
    backend: Arc<dyn Backend>,
    page_capacity: u32,
    state: Mutex<AllocatorState>,
}

impl ViewSlotAllocator {
    pub fn new(backend: Arc<dyn Backend>, page_capacity: u32) -> Self {
        assert!(page_capacity > 0, "view pages need at least one slot");
        Self {
            backend,
            page_capacity,
            state: Mutex::new(AllocatorState {
                pages: Vec::new(),
                cursor: 0,
            }),
        }
    }

    /// Allocates `count` contiguous slots, all initially null views.
    ///
    /// # Panics
    /// Panics if `count` is zero or larger than one page.
    pub fn allocate(&self, count: u32) -> Result<ViewSlotRange, DeviceError> {
        assert!(count > 0, "cannot allocate zero view slots");
        assert!(
            count <= self.page_capacity,
            "request for {count} view slots exceeds page capacity of {}",
            self.page_capacity
        );

        let mut state = lock(&self.state);
        let fits = !state.pages.is_empty() && state.cursor + count <= self.page_capacity;
        if !fits {
            let page = self
                .backend
                .create_view_page(self.page_capacity, ViewVisibility::CpuOnly)
                .inspect_err(|err| log::error!("failed to create view page: {err}"))?;
            state.pages.push(page);
            state.cursor = 0;
            log::debug!(
                "view slot allocator: page {} created ({} slots)",
                state.pages.len(),
                self.page_capacity
            );
        }

        let page = state.pages[state.pages.len() - 1];
        let first = ViewSlot::new(page, state.cursor);
        state.cursor += count;
        Ok(ViewSlotRange { first, count })
    }

    /// Rewrites the view stored at `slot`.
    pub fn write(&self, slot: ViewSlot, desc: ViewDesc) {
        self.backend.view_pages().write(slot, &[desc]);
    }

    /// Rewrites every view of `range`.
    pub fn write_range(&self, range: &ViewSlotRange, descs: &[ViewDesc]) {
        assert_eq!(descs.len(), range.count as usize, "view count does not match range");
        self.backend.view_pages().write(range.first, descs);
    }

    pub fn read(&self, slot: ViewSlot) -> Option<ViewDesc> {
        self.backend.view_pages().read(slot)
    }

    #[inline]
    pub fn page_capacity(&self) -> u32 {
        self.page_capacity
    }

    pub fn page_count(&self) -> usize {
        lock(&self.state).pages.len()
    }
}
