//! Transient GPU memory.
//!
//! A [`LinearAllocator`] bump-allocates short-lived ranges out of pages borrowed
//! from a shared [`LinearPageManager`]. Pages go back to the manager in bulk when
//! the allocator is freed.

mod linear;
mod page_pool;

pub use linear::{
    LinearAllocator, LinearAllocatorKind, LinearPageManager, TransientAllocation,
    DEFAULT_ALIGNMENT,
};

pub(crate) use page_pool::PagePool;
