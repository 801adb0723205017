use std::sync::RwLock;

use super::GpuAddress;
use crate::sync::{read_lock, write_lock};

/// How a GPU consumer interprets the memory behind a view.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum ViewKind {
    ReadOnly,
    ReadWrite,
    Constant,
}

impl ViewKind {
    pub const ALL: [ViewKind; 3] = [ViewKind::ReadOnly, ViewKind::ReadWrite, ViewKind::Constant];
}

/// Contents of one view slot.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Default)]
pub enum ViewDesc {
    /// Reads return zero, writes are dropped.
    #[default]
    Null,
    ReadOnly {
        address: GpuAddress,
        size: u64,
        stride: u32,
    },
    ReadWrite {
        address: GpuAddress,
        size: u64,
        stride: u32,
    },
    Constant {
        address: GpuAddress,
        size: u64,
    },
}

impl ViewDesc {
    /// Returns the view kind, or `None` for a null view.
    pub fn kind(&self) -> Option<ViewKind> {
        match self {
            ViewDesc::Null => None,
            ViewDesc::ReadOnly { .. } => Some(ViewKind::ReadOnly),
            ViewDesc::ReadWrite { .. } => Some(ViewKind::ReadWrite),
            ViewDesc::Constant { .. } => Some(ViewKind::Constant),
        }
    }
}

/// Index of a view page inside the device that created it.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct ViewPageId(pub(crate) u32);

/// Handle to a single view slot: a page and an index into it.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct ViewSlot {
    pub page: ViewPageId,
    pub index: u32,
}

impl ViewSlot {
    #[inline]
    pub const fn new(page: ViewPageId, index: u32) -> Self {
        Self { page, index }
    }

    /// Returns the slot `n` positions further into the same page.
    #[inline]
    pub const fn offset(self, n: u32) -> Self {
        Self {
            page: self.page,
            index: self.index + n,
        }
    }
}

/// Whether shaders can reference a view page directly.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum ViewVisibility {
    /// Staging storage; views are copied out of it before use.
    CpuOnly,
    /// Bindable storage; tables point into it.
    ShaderVisible,
}

struct ViewPage {
    visibility: ViewVisibility,
    slots: Box<[ViewDesc]>,
}

/// View memory of a device.
///
/// View slots are plain descriptors on every backend, so all backends share this
/// store. Pages are append-only and live for the device lifetime.
pub struct ViewPages {
    pages: RwLock<Vec<ViewPage>>,
}

impl ViewPages {
    pub(crate) fn new() -> Self {
        Self {
            pages: RwLock::new(Vec::new()),
        }
    }

    /// Creates a page of `capacity` null views.
    pub fn create(&self, capacity: u32, visibility: ViewVisibility) -> ViewPageId {
        let mut pages = write_lock(&self.pages);
        let id = ViewPageId(pages.len() as u32);
        pages.push(ViewPage {
            visibility,
            slots: vec![ViewDesc::Null; capacity as usize].into_boxed_slice(),
        });
        id
    }

    pub fn capacity(&self, page: ViewPageId) -> Option<u32> {
        read_lock(&self.pages)
            .get(page.0 as usize)
            .map(|p| p.slots.len() as u32)
    }

    pub fn visibility(&self, page: ViewPageId) -> Option<ViewVisibility> {
        read_lock(&self.pages).get(page.0 as usize).map(|p| p.visibility)
    }

    pub fn page_count(&self) -> usize {
        read_lock(&self.pages).len()
    }

    /// Writes `views` into consecutive slots starting at `first`.
    ///
    /// # Panics
    /// Panics if the range does not fit inside the page; slots are engine-issued,
    /// so an out-of-range slot is a bookkeeping bug.
    pub fn write(&self, first: ViewSlot, views: &[ViewDesc]) {
        let mut pages = write_lock(&self.pages);
        let page = &mut pages[first.page.0 as usize];
        let start = first.index as usize;
        page.slots[start..start + views.len()].copy_from_slice(views);
    }

    /// Copies the views at `sources` into consecutive slots starting at `dst`.
    ///
    /// Sources may live on any page, including the destination page.
    pub fn copy(&self, dst: ViewSlot, sources: &[ViewSlot]) {
        let mut pages = write_lock(&self.pages);
        for (i, src) in sources.iter().enumerate() {
            let desc = pages[src.page.0 as usize].slots[src.index as usize];
            pages[dst.page.0 as usize].slots[dst.index as usize + i] = desc;
        }
    }

    pub fn read(&self, slot: ViewSlot) -> Option<ViewDesc> {
        read_lock(&self.pages)
            .get(slot.page.0 as usize)?
            .slots
            .get(slot.index as usize)
            .copied()
    }

    /// Reads `count` consecutive views starting at `first`.
    pub fn read_range(&self, first: ViewSlot, count: u32) -> Option<Vec<ViewDesc>> {
        let pages = read_lock(&self.pages);
        let page = pages.get(first.page.0 as usize)?;
        let start = first.index as usize;
        page.slots
            .get(start..start + count as usize)
            .map(|s| s.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn constant(addr: u64) -> ViewDesc {
        ViewDesc::Constant {
            address: GpuAddress(addr),
            size: 256,
        }
    }

    #[test]
    fn new_pages_hold_null_views() {
        let views = ViewPages::new();
        let page = views.create(4, ViewVisibility::CpuOnly);
        assert_eq!(views.capacity(page), Some(4));
        assert_eq!(views.read_range(ViewSlot::new(page, 0), 4), Some(vec![ViewDesc::Null; 4]));
        assert_eq!(views.read(ViewSlot::new(page, 4)), None);
    }

    #[test]
    fn copy_gathers_scattered_sources() {
        let views = ViewPages::new();
        let src = views.create(8, ViewVisibility::CpuOnly);
        let dst = views.create(8, ViewVisibility::ShaderVisible);

        views.write(ViewSlot::new(src, 1), &[constant(0x10)]);
        views.write(ViewSlot::new(src, 5), &[constant(0x50)]);

        views.copy(
            ViewSlot::new(dst, 2),
            &[ViewSlot::new(src, 5), ViewSlot::new(src, 1)],
        );

        assert_eq!(
            views.read_range(ViewSlot::new(dst, 2), 2),
            Some(vec![constant(0x50), constant(0x10)])
        );
        assert_eq!(views.visibility(dst), Some(ViewVisibility::ShaderVisible));
    }

    #[test]
    fn desc_kind_matches_variant() {
        assert_eq!(ViewDesc::Null.kind(), None);
        assert_eq!(constant(1).kind(), Some(ViewKind::Constant));
    }
}
