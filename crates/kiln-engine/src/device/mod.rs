//! Device backends.
//!
//! The rest of the engine talks to a device only through two closed capability
//! interfaces:
//! - [`Backend`]: creates queues, memory pages and view pages
//! - [`HardwareQueue`]: executes batches and signals/waits fences on the GPU timeline
//!
//! Two backends implement them:
//! - [`SoftDevice`]: an in-process device whose queues execute on their own threads
//! - [`WgpuBackend`]: a headless wgpu device

mod error;
mod gpu;
mod init;
mod memory;
mod soft;
mod views;

use std::sync::Arc;
use std::time::Duration;

use crate::command::{CommandBuffer, CommandBufferId};
use crate::sync::Fence;

pub use error::DeviceError;
pub use gpu::WgpuBackend;
pub use init::DeviceInit;
pub use memory::{GpuAddress, MemoryKind, MemoryPageId, MemoryPageInfo, PAGE_ALIGNMENT};
pub use soft::{ExecutedWork, SoftDevice, SoftDeviceConfig};
pub use views::{ViewDesc, ViewKind, ViewPageId, ViewPages, ViewSlot, ViewVisibility};

pub(crate) use memory::align_up;

/// Hardware queue family. The discriminant is the tag stored in completion tokens.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
#[repr(u8)]
pub enum QueueKind {
    Graphics = 1,
    Compute = 2,
    Copy = 3,
}

impl QueueKind {
    pub const ALL: [QueueKind; 3] = [QueueKind::Graphics, QueueKind::Compute, QueueKind::Copy];

    pub(crate) fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(QueueKind::Graphics),
            2 => Some(QueueKind::Compute),
            3 => Some(QueueKind::Copy),
            _ => None,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            QueueKind::Graphics => "graphics",
            QueueKind::Compute => "compute",
            QueueKind::Copy => "copy",
        }
    }
}

/// GPU-timeline side of one queue.
pub trait HardwareQueue: Send + Sync {
    fn kind(&self) -> QueueKind;

    /// Issues `batch` and arranges for `fence` to reach `value` once the whole batch
    /// has finished executing. Batches complete in the order they were issued.
    fn execute(
        &self,
        batch: &[&CommandBuffer],
        fence: &Arc<Fence>,
        value: u64,
    ) -> Result<(), DeviceError>;

    /// Signals `fence` to `value` after all previously issued work.
    fn signal(&self, fence: &Arc<Fence>, value: u64) -> Result<(), DeviceError>;

    /// Makes all later work on this queue wait until `fence` reaches `value`.
    fn wait(&self, fence: &Arc<Fence>, value: u64) -> Result<(), DeviceError>;

    /// Blocks the calling thread until `fence` reaches `value`.
    ///
    /// Backends whose completion callbacks need pumping override this.
    fn host_wait(&self, fence: &Fence, value: u64, timeout: Option<Duration>) -> bool {
        fence.wait(value, timeout)
    }

    /// Called before a recycled command buffer is handed out again.
    fn prepare_reuse(&self, id: CommandBufferId) -> Result<(), DeviceError> {
        let _ = id;
        Ok(())
    }
}

/// Device-wide resource creation.
pub trait Backend: Send + Sync {
    fn name(&self) -> &'static str;

    fn create_queue(&self, kind: QueueKind) -> Result<Box<dyn HardwareQueue>, DeviceError>;

    /// Creates a page of `size` bytes. The page lives as long as the device.
    fn create_memory_page(&self, size: u64, kind: MemoryKind) -> Result<MemoryPageInfo, DeviceError>;

    fn view_pages(&self) -> &ViewPages;

    fn create_view_page(
        &self,
        capacity: u32,
        visibility: ViewVisibility,
    ) -> Result<ViewPageId, DeviceError> {
        Ok(self.view_pages().create(capacity, visibility))
    }
}
