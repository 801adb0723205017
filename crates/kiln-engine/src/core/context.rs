use std::sync::Arc;
use std::time::Duration;

use anyhow::{ensure, Context, Result};

use super::{EngineConfig, RecordingContext, RenderServices};
use crate::command::CommandBuffer;
use crate::device::{Backend, DeviceError, QueueKind, PAGE_ALIGNMENT};
use crate::memory::{LinearAllocatorKind, LinearPageManager};
use crate::submit::SubmissionQueue;
use crate::sync::CompletionToken;
use crate::views::{DynamicPagePool, NullViews, ViewSlotAllocator, ViewSlotRange};

/// The device together with everything shared between recording threads.
///
/// Owns one [`SubmissionQueue`] per [`QueueKind`], the transient page pools and
/// the long-lived view slot allocator. Shared by reference; all methods take
/// `&self`.
pub struct GpuContext {
    backend: Arc<dyn Backend>,
    config: EngineConfig,
    /// Indexed by [`queue_index`].
    queues: [SubmissionQueue; 3],
    upload_pages: Arc<LinearPageManager>,
    device_local_pages: Arc<LinearPageManager>,
    dynamic_pages: Arc<DynamicPagePool>,
    view_slots: ViewSlotAllocator,
    nulls: Arc<NullViews>,
}

#[inline]
fn queue_index(kind: QueueKind) -> usize {
    match kind {
        QueueKind::Graphics => 0,
        QueueKind::Compute => 1,
        QueueKind::Copy => 2,
    }
}

impl GpuContext {
    pub fn new(backend: Arc<dyn Backend>, config: EngineConfig) -> Result<Self> {
        ensure!(
            config.upload_page_size > 0 && config.device_local_page_size > 0,
            "transient page sizes must be non-zero"
        );
        ensure!(
            config.view_page_capacity >= 3,
            "view pages need room for the null views"
        );
        ensure!(
            config.dynamic_page_capacity > 0,
            "dynamic view pages need at least one slot"
        );

        let queue = |kind: QueueKind| {
            SubmissionQueue::new(backend.as_ref(), kind)
                .with_context(|| format!("failed to create {} queue", kind.label()))
        };
        let queues = [
            queue(QueueKind::Graphics)?,
            queue(QueueKind::Compute)?,
            queue(QueueKind::Copy)?,
        ];

        let view_slots = ViewSlotAllocator::new(backend.clone(), config.view_page_capacity);
        let nulls = NullViews::new(&view_slots).context("failed to reserve null views")?;

        log::info!(
            "gpu context on '{}': upload pages {} KiB, device-local pages {} KiB, dynamic view pages {} slots",
            backend.name(),
            config.upload_page_size / 1024,
            config.device_local_page_size / 1024,
            config.dynamic_page_capacity
        );
        if config.upload_page_size % PAGE_ALIGNMENT != 0 {
            log::warn!(
                "upload page size {} is not a multiple of {PAGE_ALIGNMENT}; large alignments waste more space",
                config.upload_page_size
            );
        }

        Ok(Self {
            upload_pages: Arc::new(LinearPageManager::new(
                backend.clone(),
                LinearAllocatorKind::Upload,
                config.upload_page_size,
            )),
            device_local_pages: Arc::new(LinearPageManager::new(
                backend.clone(),
                LinearAllocatorKind::DeviceLocal,
                config.device_local_page_size,
            )),
            dynamic_pages: Arc::new(DynamicPagePool::new(
                backend.clone(),
                config.dynamic_page_capacity,
            )),
            view_slots,
            nulls: Arc::new(nulls),
            queues,
            backend,
            config,
        })
    }

    #[inline]
    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    #[inline]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    #[inline]
    pub fn queue(&self, kind: QueueKind) -> &SubmissionQueue {
        &self.queues[queue_index(kind)]
    }

    /// Starts recording for the queue of `kind`.
    pub fn recording_context(&self, kind: QueueKind) -> RecordingContext<'_> {
        RecordingContext::new(
            self.queue(kind),
            self.upload_pages.clone(),
            self.device_local_pages.clone(),
            self.dynamic_pages.clone(),
            self.nulls.clone(),
        )
    }

    #[inline]
    pub fn view_slots(&self) -> &ViewSlotAllocator {
        &self.view_slots
    }

    #[inline]
    pub fn null_views(&self) -> &NullViews {
        &self.nulls
    }

    #[inline]
    pub fn upload_pages(&self) -> &LinearPageManager {
        &self.upload_pages
    }

    #[inline]
    pub fn device_local_pages(&self) -> &LinearPageManager {
        &self.device_local_pages
    }

    #[inline]
    pub fn dynamic_pages(&self) -> &DynamicPagePool {
        &self.dynamic_pages
    }

    /// Queue that issued `token`, `None` for [`CompletionToken::NONE`].
    fn issuer(&self, token: CompletionToken) -> Option<&SubmissionQueue> {
        token.queue_kind().map(|kind| self.queue(kind))
    }
}

impl RenderServices for GpuContext {
    fn submit(&self, kind: QueueKind, buffers: Vec<CommandBuffer>) -> Result<CompletionToken, DeviceError> {
        self.queue(kind).submit(buffers)
    }

    fn wait_for(&self, token: CompletionToken, timeout: Option<Duration>) -> bool {
        match self.issuer(token) {
            Some(queue) => queue.wait_for(token, timeout),
            None => true,
        }
    }

    fn is_complete(&self, token: CompletionToken) -> bool {
        self.issuer(token)
            .is_none_or(|queue| queue.is_complete(token))
    }

    fn allocate_view_slots(&self, count: u32) -> Result<ViewSlotRange, DeviceError> {
        self.view_slots.allocate(count)
    }

    fn idle(&self) {
        for queue in &self.queues {
            queue.idle();
        }
    }
}

impl Drop for GpuContext {
    fn drop(&mut self) {
        // Pooled pages die with the backend; nothing may still be reading them.
        self.idle();
    }
}
