//! Command recording and command-buffer recycling.
//!
//! Command buffers record a backend-neutral command stream. Submitted buffers
//! return to a per-queue [`CommandBufferPool`] tagged with the completion value
//! of their batch, and are handed out again only once that value has completed.

mod buffer;
mod pool;

pub use buffer::{Command, CommandBuffer, CommandBufferId};
pub use pool::CommandBufferPool;
