use std::any::Any;
use std::sync::Arc;

use crate::command::CommandBuffer;
use crate::device::{DeviceError, GpuAddress, QueueKind};
use crate::memory::{LinearAllocator, LinearPageManager, TransientAllocation};
use crate::submit::SubmissionQueue;
use crate::sync::CompletionToken;
use crate::views::{
    CommitStats, DynamicPagePool, DynamicViewHeap, NullViews, PipelineStage, ShaderResource,
    ShaderSignature,
};

/// Per-thread recorder for one queue.
///
/// Owns the command buffer being recorded plus the transient memory and dynamic
/// view tables it references. [`RecordingContext::finish`] submits the buffer and
/// hands the transient pages back, reusable once that submission completes.
/// Dropping a context discards whatever was recorded since the last finish and
/// returns its command buffer to the queue's pool.
pub struct RecordingContext<'a> {
    queue: &'a SubmissionQueue,
    /// Taken from the pool on first record.
    cmd: Option<CommandBuffer>,
    upload: LinearAllocator,
    scratch: LinearAllocator,
    views: DynamicViewHeap,
}

impl<'a> RecordingContext<'a> {
    pub(crate) fn new(
        queue: &'a SubmissionQueue,
        upload_pages: Arc<LinearPageManager>,
        device_local_pages: Arc<LinearPageManager>,
        dynamic_pages: Arc<DynamicPagePool>,
        nulls: Arc<NullViews>,
    ) -> Self {
        Self {
            queue,
            cmd: None,
            upload: LinearAllocator::new(upload_pages),
            scratch: LinearAllocator::new(device_local_pages),
            views: DynamicViewHeap::new(dynamic_pages, nulls),
        }
    }

    #[inline]
    pub fn kind(&self) -> QueueKind {
        self.queue.kind()
    }

    /// The command buffer currently being recorded.
    #[inline]
    pub fn commands(&mut self) -> &mut CommandBuffer {
        let queue = self.queue;
        self.cmd.get_or_insert_with(|| queue.command_buffer())
    }

    /// CPU-writable memory valid until the work recorded here has completed.
    pub fn allocate_transient(&mut self, size: u64, alignment: u64) -> Result<TransientAllocation, DeviceError> {
        self.upload.allocate(size, alignment)
    }

    /// GPU-only scratch memory with the same lifetime as transient memory.
    pub fn allocate_scratch(&mut self, size: u64, alignment: u64) -> Result<TransientAllocation, DeviceError> {
        self.scratch.allocate(size, alignment)
    }

    pub fn set_signature(&mut self, stage: PipelineStage, signature: &ShaderSignature) {
        self.views.set_signature(stage, signature);
    }

    pub fn stage_view_bindings(
        &mut self,
        stage: PipelineStage,
        binding: u32,
        offset: u32,
        resources: &[Arc<dyn ShaderResource>],
    ) {
        self.views
            .stage_view_bindings(stage, binding, offset, resources);
    }

    /// Copies changed view tables of `stage` and records their binds.
    pub fn commit_bindings(&mut self, stage: PipelineStage) -> Result<CommitStats, DeviceError> {
        let queue = self.queue;
        let cmd = self.cmd.get_or_insert_with(|| queue.command_buffer());
        self.views.commit_bindings(stage, cmd)
    }

    /// Commits graphics tables, then records a draw.
    pub fn draw(&mut self, vertex_count: u32, instance_count: u32) -> Result<CommitStats, DeviceError> {
        let stats = self.commit_bindings(PipelineStage::Graphics)?;
        self.commands().draw(vertex_count, instance_count);
        Ok(stats)
    }

    /// Commits compute tables, then records a dispatch.
    pub fn dispatch(&mut self, x: u32, y: u32, z: u32) -> Result<CommitStats, DeviceError> {
        let stats = self.commit_bindings(PipelineStage::Compute)?;
        self.commands().dispatch(x, y, z);
        Ok(stats)
    }

    pub fn copy_memory(&mut self, src: GpuAddress, dst: GpuAddress, size: u64) {
        self.commands().copy_memory(src, dst, size);
    }

    /// Keeps `resource` alive until the current command buffer has executed.
    pub fn retain(&mut self, resource: Arc<dyn Any + Send + Sync>) {
        self.commands().retain(resource);
    }

    /// Submits everything recorded so far. Recording afterwards starts a fresh
    /// command buffer.
    ///
    /// Transient pages and dynamic view pages return to their pools stamped with
    /// the returned token. Resources staged into view tables stay alive with the
    /// submitted buffer until it has executed. If the submission is rejected the
    /// pages return immediately and the error is passed on.
    pub fn finish(&mut self) -> Result<CompletionToken, DeviceError> {
        let mut cmd = self
            .cmd
            .take()
            .unwrap_or_else(|| self.queue.command_buffer());
        self.upload.record_host_writes(&mut cmd);
        self.views.retain_into(&mut cmd);
        match self.queue.submit(vec![cmd]) {
            Ok(token) => {
                self.upload.free_after(self.queue.stamp(token));
                self.scratch.free_after(self.queue.stamp(token));
                self.views.free_after(self.queue.stamp(token));
                Ok(token)
            }
            Err(err) => {
                self.reset();
                Err(err)
            }
        }
    }

    /// Returns transient and dynamic view pages to their pools right away.
    ///
    /// The caller guarantees no submitted work still reads them, e.g. after waiting
    /// on the token returned by the last [`RecordingContext::finish`].
    pub fn reset(&mut self) {
        self.upload.free();
        self.scratch.free();
        self.views.free();
    }

    pub fn dynamic_views(&self) -> &DynamicViewHeap {
        &self.views
    }
}

impl Drop for RecordingContext<'_> {
    fn drop(&mut self) {
        // Nothing recorded since the last finish was submitted.
        self.reset();
        if let Some(cmd) = self.cmd.take() {
            self.queue.pool().restore(cmd);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytemuck::{Pod, Zeroable};

    use super::*;
    use crate::core::{EngineConfig, GpuContext, RenderServices};
    use crate::device::{SoftDevice, SoftDeviceConfig, ViewDesc, ViewKind, ViewSlot};
    use crate::views::ViewRange;

    fn setup(latency_ms: u64) -> (Arc<SoftDevice>, GpuContext) {
        let device = Arc::new(SoftDevice::new(SoftDeviceConfig {
            batch_latency: Duration::from_millis(latency_ms),
            record_trace: true,
        }));
        let config = EngineConfig {
            upload_page_size: 64 * 1024,
            ..EngineConfig::default()
        };
        let gpu = GpuContext::new(device.clone(), config).unwrap();
        (device, gpu)
    }

    struct Buffer {
        view: ViewSlot,
    }

    impl ShaderResource for Buffer {
        fn view_slot(&self, kind: ViewKind) -> Option<ViewSlot> {
            (kind == ViewKind::ReadOnly).then_some(self.view)
        }
    }

    fn buffer(gpu: &GpuContext, address: u64) -> Arc<dyn ShaderResource> {
        let view = gpu.view_slots().allocate(1).unwrap().first();
        gpu.view_slots().write(
            view,
            ViewDesc::ReadOnly {
                address: GpuAddress(address),
                size: 64,
                stride: 16,
            },
        );
        Arc::new(Buffer { view })
    }

    #[repr(C)]
    #[derive(Debug, Copy, Clone, Pod, Zeroable)]
    struct DrawConstants {
        transform: [[f32; 4]; 3],
        color: [f32; 4],
    }

    // ── transient memory ──────────────────────────────────────────────────

    #[test]
    fn transient_bytes_reach_the_gpu() {
        let (device, gpu) = setup(0);
        let mut ctx = gpu.recording_context(QueueKind::Copy);

        let constants = DrawConstants {
            transform: [[1.0, 0.0, 0.0, 2.0], [0.0, 1.0, 0.0, 3.0], [0.0, 0.0, 1.0, 4.0]],
            color: [0.25, 0.5, 0.75, 1.0],
        };
        let src = ctx.allocate_transient(64, 16).unwrap();
        unsafe { src.write_pod(0, &constants) };
        let dst = ctx.allocate_scratch(64, 16).unwrap();
        assert!(dst.cpu_ptr().is_none());

        ctx.copy_memory(src.gpu_address(), dst.gpu_address(), 64);
        let token = ctx.finish().unwrap();
        assert!(gpu.wait_for(token, Some(Duration::from_secs(5))));

        let bytes = unsafe { device.read_memory(dst.gpu_address(), 64).unwrap() };
        assert_eq!(bytes, bytemuck::bytes_of(&constants));
    }

    #[test]
    #[should_panic(expected = "exceeds page size")]
    fn transient_larger_than_page_panics() {
        let (_, gpu) = setup(0);
        let mut ctx = gpu.recording_context(QueueKind::Graphics);
        let _ = ctx.allocate_transient(64 * 1024 + 1, 16);
    }

    #[test]
    fn finished_pages_wait_for_their_token() {
        let (device, gpu) = setup(30);
        let mut ctx = gpu.recording_context(QueueKind::Graphics);

        ctx.allocate_transient(1024, 256).unwrap();
        let token = ctx.finish().unwrap();
        assert_eq!(gpu.upload_pages().retired_count(), 1);

        // Still in flight: a second page is created.
        ctx.allocate_transient(1024, 256).unwrap();
        assert_eq!(device.memory_page_count(), 2);
        ctx.reset();

        assert!(gpu.wait_for(token, None));
        ctx.allocate_transient(1024, 256).unwrap();
        ctx.allocate_transient(64 * 1024, 256).unwrap();
        assert_eq!(device.memory_page_count(), 2);
    }

    // ── dynamic views ─────────────────────────────────────────────────────

    #[test]
    fn repeated_draws_with_same_bindings_copy_once() {
        let (device, gpu) = setup(0);
        let mut ctx = gpu.recording_context(QueueKind::Graphics);
        let signature = ShaderSignature::new()
            .with_inline()
            .with_table([ViewRange::new(ViewKind::ReadOnly, 2)]);
        ctx.set_signature(PipelineStage::Graphics, &signature);

        let meshes = [buffer(&gpu, 0x1000), buffer(&gpu, 0x2000)];
        ctx.stage_view_bindings(PipelineStage::Graphics, 1, 0, &meshes);
        let first = ctx.draw(3, 1).unwrap();
        ctx.stage_view_bindings(PipelineStage::Graphics, 1, 0, &meshes);
        let second = ctx.draw(3, 1).unwrap();

        assert_eq!(first.views_copied, 2);
        assert_eq!(second.views_copied, 0);

        let token = ctx.finish().unwrap();
        assert!(gpu.wait_for(token, Some(Duration::from_secs(5))));

        let trace = device.take_trace();
        assert_eq!(trace.len(), 2);
        assert_eq!(trace[0].tables, trace[1].tables);
        assert_eq!(trace[0].tables[0].0, 1);
        assert_eq!(trace[0].tables[0].1.len(), 2);
    }

    #[test]
    fn staged_resources_outlive_the_caller_until_the_gpu_is_done() {
        let (_, gpu) = setup(200);
        let mut ctx = gpu.recording_context(QueueKind::Graphics);
        let signature = ShaderSignature::new().with_table([ViewRange::new(ViewKind::ReadOnly, 1)]);
        ctx.set_signature(PipelineStage::Graphics, &signature);

        let mesh = buffer(&gpu, 0x1000);
        let weak = Arc::downgrade(&mesh);
        ctx.stage_view_bindings(PipelineStage::Graphics, 0, 0, &[mesh]);
        ctx.draw(3, 1).unwrap();
        let token = ctx.finish().unwrap();

        assert!(!gpu.is_complete(token));
        assert!(weak.upgrade().is_some());
        assert_eq!(ctx.dynamic_views().retained_count(), 0);

        assert!(gpu.wait_for(token, Some(Duration::from_secs(5))));
        gpu.queue(QueueKind::Graphics).idle();
        assert!(weak.upgrade().is_none());
    }

    #[test]
    fn finish_clears_staged_tables() {
        let (_, gpu) = setup(0);
        let mut ctx = gpu.recording_context(QueueKind::Compute);
        let signature = ShaderSignature::new().with_table([ViewRange::new(ViewKind::ReadOnly, 1)]);
        ctx.set_signature(PipelineStage::Compute, &signature);

        let input = buffer(&gpu, 0x1000);
        ctx.stage_view_bindings(PipelineStage::Compute, 0, 0, &[input.clone()]);
        ctx.dispatch(8, 8, 1).unwrap();
        ctx.finish().unwrap();

        assert_eq!(ctx.dynamic_views().cursor(), 0);
        assert_eq!(ctx.dynamic_views().stale_bits(PipelineStage::Compute), 0);
        ctx.stage_view_bindings(PipelineStage::Compute, 0, 0, &[input]);
        assert_eq!(ctx.dispatch(8, 8, 1).unwrap().views_copied, 1);
    }

    // ── command buffers ───────────────────────────────────────────────────

    #[test]
    fn dropped_context_returns_its_buffer_to_the_pool() {
        let (_, gpu) = setup(0);
        let queue = gpu.queue(QueueKind::Graphics);
        {
            let mut ctx = gpu.recording_context(QueueKind::Graphics);
            ctx.commands().marker("abandoned");
        }
        assert_eq!(queue.pool().created(), 1);
        assert_eq!(queue.available_command_buffers(), 1);

        let mut ctx = gpu.recording_context(QueueKind::Graphics);
        ctx.commands().marker("frame");
        assert_eq!(ctx.commands().commands().len(), 1);
        ctx.finish().unwrap();
        assert_eq!(queue.pool().created(), 1);
    }

    #[test]
    fn short_lived_contexts_cycle_one_buffer() {
        let (_, gpu) = setup(0);
        for _ in 0..10 {
            let mut ctx = gpu.recording_context(QueueKind::Copy);
            ctx.commands().marker("upload");
            let token = ctx.finish().unwrap();
            assert!(gpu.wait_for(token, Some(Duration::from_secs(5))));
        }

        gpu.idle();
        let pool = gpu.queue(QueueKind::Copy).pool();
        assert_eq!(pool.created(), 1);
        assert_eq!(pool.len(), 1);
    }

    // ── failures ──────────────────────────────────────────────────────────

    #[test]
    fn rejected_submission_releases_pages() {
        let (_, gpu) = setup(0);
        let mut ctx = gpu.recording_context(QueueKind::Copy);
        let src = ctx.allocate_transient(64, 16).unwrap();
        ctx.copy_memory(src.gpu_address(), GpuAddress(0x20), 64);

        let err = ctx.finish().unwrap_err();
        assert!(matches!(err, DeviceError::InvalidAddress(0x20)));
        assert_eq!(gpu.upload_pages().retired_count(), 0);
        assert_eq!(gpu.upload_pages().available_count(), 1);
    }
}
