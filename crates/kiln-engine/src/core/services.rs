use std::time::Duration;

use crate::command::CommandBuffer;
use crate::device::{DeviceError, QueueKind};
use crate::sync::CompletionToken;
use crate::views::ViewSlotRange;

/// What the layers above the memory manager (scene, GUI, asset upload) may ask of
/// the GPU.
pub trait RenderServices: Send + Sync {
    /// Submits `buffers` as one batch on the queue of `kind`.
    fn submit(&self, kind: QueueKind, buffers: Vec<CommandBuffer>) -> Result<CompletionToken, DeviceError>;

    /// Blocks until `token` completes on the queue that issued it.
    fn wait_for(&self, token: CompletionToken, timeout: Option<Duration>) -> bool;

    fn is_complete(&self, token: CompletionToken) -> bool;

    /// Reserves long-lived view slots.
    fn allocate_view_slots(&self, count: u32) -> Result<ViewSlotRange, DeviceError>;

    /// Waits for every queue to drain.
    fn idle(&self);
}
