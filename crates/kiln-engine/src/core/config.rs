use crate::memory::LinearAllocatorKind;
use crate::views::{DEFAULT_DYNAMIC_PAGE_CAPACITY, DEFAULT_VIEW_PAGE_CAPACITY};

/// Sizes of the pooled pages a [`GpuContext`](super::GpuContext) hands out.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Bytes per CPU-writable transient page.
    ///
    /// Also the largest single upload allocation.
    pub upload_page_size: u64,

    /// Bytes per GPU-only transient page.
    pub device_local_page_size: u64,

    /// Slots per page of the long-lived view slot allocator.
    pub view_page_capacity: u32,

    /// Slots per shader-visible page used by dynamic view tables.
    ///
    /// Bounds how many views one commit may copy.
    pub dynamic_page_capacity: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            upload_page_size: LinearAllocatorKind::Upload.default_page_size(),
            device_local_page_size: LinearAllocatorKind::DeviceLocal.default_page_size(),
            view_page_capacity: DEFAULT_VIEW_PAGE_CAPACITY,
            dynamic_page_capacity: DEFAULT_DYNAMIC_PAGE_CAPACITY,
        }
    }
}
