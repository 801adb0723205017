//! View-slot (descriptor) management.
//!
//! - [`ViewSlotAllocator`]: long-lived slots for resources created once
//! - [`DynamicViewHeap`]: per-draw tables staged on the CPU and copied into
//!   shader-visible pages only when they change
//! - [`ShaderSignature`]: the binding layout both of them are checked against

mod allocator;
mod dynamic_heap;
mod signature;

pub use allocator::{ViewSlotAllocator, ViewSlotRange, DEFAULT_VIEW_PAGE_CAPACITY};
pub use dynamic_heap::{
    CommitStats, DynamicPagePool, DynamicViewHeap, NullViews, ShaderResource,
    DEFAULT_DYNAMIC_PAGE_CAPACITY,
};
pub use signature::{BindingParam, PipelineStage, ShaderSignature, ViewRange, MAX_BINDINGS};
