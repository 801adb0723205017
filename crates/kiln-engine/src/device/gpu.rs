use std::collections::HashMap;
use std::ops::Range;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};

use super::memory::{align_up, AddressSpace, HostBlock, MemoryEntry, MemoryTable};
use super::{
    Backend, DeviceError, DeviceInit, HardwareQueue, MemoryKind, MemoryPageId, MemoryPageInfo,
    QueueKind, ViewPages,
};
use crate::command::{Command, CommandBuffer};
use crate::sync::{lock, read_lock, write_lock, Fence};

/// Granularity of buffer writes and copies on wgpu.
const COPY_ALIGNMENT: u64 = wgpu::COPY_BUFFER_ALIGNMENT;

/// How long a host wait sleeps between device polls.
const HOST_POLL_INTERVAL: Duration = Duration::from_millis(1);

struct Inner {
    adapter_info: wgpu::AdapterInfo,
    device: wgpu::Device,
    queue: wgpu::Queue,
    addresses: AddressSpace,
    /// Every page keeps a host shadow; CPU writes land there and are uploaded
    /// with the batch whose command buffers report them.
    memory: RwLock<MemoryTable<wgpu::Buffer>>,
    views: ViewPages,
    lost: Arc<AtomicBool>,
}

/// Headless wgpu device.
///
/// All queue kinds share the single wgpu queue, so work is executed in the order
/// it was issued across kinds. Only memory copies reach the GPU; draw, dispatch and
/// table binds are kept as metadata for the layers that own pipelines.
pub struct WgpuBackend {
    inner: Arc<Inner>,
}

impl WgpuBackend {
    /// Creates the adapter, device and queue.
    ///
    /// Adapter/device acquisition is asynchronous under wgpu.
    pub async fn new(init: DeviceInit) -> Result<Self> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: init.backends,
            ..Default::default()
        });

        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: init.power_preference,
                compatible_surface: None,
                force_fallback_adapter: init.force_fallback_adapter,
            })
            .await
            .context("failed to find a suitable GPU adapter")?;

        let (device, queue) = adapter
            .request_device(&wgpu::DeviceDescriptor {
                label: Some("kiln-engine device"),
                required_features: init.required_features,
                required_limits: init.required_limits,
                experimental_features: wgpu::ExperimentalFeatures::disabled(),
                memory_hints: init.memory_hints,
                trace: wgpu::Trace::Off,
            })
            .await
            .context("failed to create wgpu device/queue")?;

        let lost = Arc::new(AtomicBool::new(false));
        {
            let lost = lost.clone();
            device.set_device_lost_callback(move |reason, message| {
                log::error!("wgpu device lost ({reason:?}): {message}");
                lost.store(true, Ordering::Release);
            });
        }

        let adapter_info = adapter.get_info();
        log::info!(
            "wgpu backend: {} ({:?}, {:?})",
            adapter_info.name,
            adapter_info.backend,
            adapter_info.device_type
        );

        Ok(Self {
            inner: Arc::new(Inner {
                adapter_info,
                device,
                queue,
                addresses: AddressSpace::new(),
                memory: RwLock::new(MemoryTable::new()),
                views: ViewPages::new(),
                lost,
            }),
        })
    }

    /// Blocking wrapper around [`WgpuBackend::new`] for callers without an executor.
    pub fn new_blocking(init: DeviceInit) -> Result<Self> {
        pollster::block_on(Self::new(init))
    }

    pub fn adapter_info(&self) -> &wgpu::AdapterInfo {
        &self.inner.adapter_info
    }

    /// Returns a reference to the logical device.
    pub fn device(&self) -> &wgpu::Device {
        &self.inner.device
    }

    /// Returns a reference to the command queue.
    pub fn queue(&self) -> &wgpu::Queue {
        &self.inner.queue
    }
}

impl Backend for WgpuBackend {
    fn name(&self) -> &'static str {
        "wgpu"
    }

    fn create_queue(&self, kind: QueueKind) -> Result<Box<dyn HardwareQueue>, DeviceError> {
        self.inner.check_alive()?;
        Ok(Box::new(WgpuQueue {
            kind,
            inner: self.inner.clone(),
            pending_waits: Mutex::new(Vec::new()),
        }))
    }

    fn create_memory_page(&self, size: u64, kind: MemoryKind) -> Result<MemoryPageInfo, DeviceError> {
        self.inner.check_alive()?;
        let size = align_up(size, COPY_ALIGNMENT);
        if size > self.inner.device.limits().max_buffer_size {
            return Err(DeviceError::OutOfMemory);
        }

        let host = HostBlock::zeroed(size)?;
        let mut memory = write_lock(&self.inner.memory);
        let id = memory.next_id();
        let buffer = self.inner.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(match kind {
                MemoryKind::Upload => "kiln upload page",
                MemoryKind::DeviceLocal => "kiln device-local page",
            }),
            size,
            usage: wgpu::BufferUsages::COPY_SRC
                | wgpu::BufferUsages::COPY_DST
                | wgpu::BufferUsages::STORAGE,
            mapped_at_creation: false,
        });

        let info = MemoryPageInfo {
            id,
            kind,
            size,
            base: self.inner.addresses.reserve(size),
            cpu: match kind {
                MemoryKind::Upload => Some(host.ptr()),
                MemoryKind::DeviceLocal => None,
            },
        };
        memory.push(MemoryEntry {
            info,
            host,
            extra: buffer,
        });
        Ok(info)
    }

    fn view_pages(&self) -> &ViewPages {
        &self.inner.views
    }
}

impl Inner {
    fn check_alive(&self) -> Result<(), DeviceError> {
        if self.lost.load(Ordering::Acquire) {
            Err(DeviceError::DeviceLost)
        } else {
            Ok(())
        }
    }

    /// Uploads the host ranges written for `batch`.
    fn upload_host_writes(&self, batch: &[&CommandBuffer]) {
        let writes = host_writes_by_page(batch);
        if writes.is_empty() {
            return;
        }

        let memory = read_lock(&self.memory);
        for (page, ranges) in writes {
            let Some(entry) = memory.get(page) else {
                log::warn!("wgpu: host write to unknown page {page:?} skipped");
                continue;
            };
            for range in coalesce(ranges, COPY_ALIGNMENT, entry.info.size) {
                // SAFETY: the ranges belong to allocations of the recording context
                // that submitted `batch`; it finished writing them before submitting
                // and the pages stay with it until the batch completes.
                let bytes = unsafe {
                    entry
                        .host
                        .read(range.start as usize, (range.end - range.start) as usize)
                };
                self.queue.write_buffer(&entry.extra, range.start, &bytes);
            }
        }
    }

    /// Blocks until `fence` reaches `value`, pumping device callbacks.
    fn poll_until(&self, fence: &Fence, value: u64, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            if let Err(err) = self.device.poll(wgpu::PollType::Poll) {
                log::error!("wgpu poll failed: {err}");
                return fence.is_complete(value);
            }
            if fence.wait(value, Some(HOST_POLL_INTERVAL)) {
                return true;
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                return false;
            }
        }
    }
}

/// Groups the host writes of every buffer in `batch` by page.
fn host_writes_by_page(batch: &[&CommandBuffer]) -> HashMap<MemoryPageId, Vec<Range<u64>>> {
    let mut writes: HashMap<MemoryPageId, Vec<Range<u64>>> = HashMap::new();
    for cb in batch {
        for (page, range) in cb.host_writes() {
            writes.entry(*page).or_default().push(range.clone());
        }
    }
    writes
}

/// Sorts `ranges`, widens them to `alignment` and merges overlapping ones.
fn coalesce(mut ranges: Vec<Range<u64>>, alignment: u64, limit: u64) -> Vec<Range<u64>> {
    ranges.sort_by_key(|r| r.start);
    let mut merged: Vec<Range<u64>> = Vec::with_capacity(ranges.len());
    for range in ranges {
        let start = range.start & !(alignment - 1);
        let end = align_up(range.end, alignment).min(limit);
        match merged.last_mut() {
            Some(last) if start <= last.end => last.end = last.end.max(end),
            _ => merged.push(start..end),
        }
    }
    merged
}

struct WgpuQueue {
    kind: QueueKind,
    inner: Arc<Inner>,
    /// Semaphore waits requested since the last batch.
    pending_waits: Mutex<Vec<(Arc<Fence>, u64)>>,
}

impl WgpuQueue {
    /// wgpu has no GPU-side cross-queue waits; they are resolved on the CPU before
    /// the next batch is issued.
    fn resolve_waits(&self) {
        let waits = std::mem::take(&mut *lock(&self.pending_waits));
        for (fence, value) in waits {
            if !fence.is_complete(value) {
                log::debug!(
                    "wgpu {} queue: blocking on '{}' for {value}",
                    self.kind.label(),
                    fence.label()
                );
                self.inner.poll_until(&fence, value, None);
            }
        }
    }

    fn encode(&self, batch: &[&CommandBuffer]) -> Result<wgpu::CommandBuffer, DeviceError> {
        let memory = read_lock(&self.inner.memory);
        let mut encoder = self
            .inner
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some(self.kind.label()),
            });

        for cb in batch {
            for command in cb.commands() {
                match *command {
                    Command::CopyMemory { src, dst, size } => {
                        let (src_page, src_offset) = memory
                            .resolve(src, size)
                            .ok_or(DeviceError::InvalidAddress(src.get()))?;
                        let (dst_page, dst_offset) = memory
                            .resolve(dst, size)
                            .ok_or(DeviceError::InvalidAddress(dst.get()))?;
                        if (src_offset | dst_offset | size) % COPY_ALIGNMENT != 0 {
                            return Err(DeviceError::Unsupported(
                                "wgpu copies need 4-byte aligned offsets and sizes",
                            ));
                        }
                        encoder.copy_buffer_to_buffer(
                            &src_page.extra,
                            src_offset,
                            &dst_page.extra,
                            dst_offset,
                            size,
                        );
                    }
                    Command::Marker(label) => encoder.insert_debug_marker(label),
                    ref other => log::trace!("wgpu {} queue: {other:?}", self.kind.label()),
                }
            }
        }
        Ok(encoder.finish())
    }
}

impl HardwareQueue for WgpuQueue {
    fn kind(&self) -> QueueKind {
        self.kind
    }

    fn execute(
        &self,
        batch: &[&CommandBuffer],
        fence: &Arc<Fence>,
        value: u64,
    ) -> Result<(), DeviceError> {
        self.inner.check_alive()?;
        let commands = self.encode(batch)?;
        self.resolve_waits();
        self.inner.upload_host_writes(batch);
        self.inner.queue.submit(std::iter::once(commands));
        self.signal(fence, value)
    }

    fn signal(&self, fence: &Arc<Fence>, value: u64) -> Result<(), DeviceError> {
        self.inner.check_alive()?;
        let fence = fence.clone();
        self.inner
            .queue
            .on_submitted_work_done(move || fence.signal(value));
        Ok(())
    }

    fn wait(&self, fence: &Arc<Fence>, value: u64) -> Result<(), DeviceError> {
        lock(&self.pending_waits).push((fence.clone(), value));
        Ok(())
    }

    fn host_wait(&self, fence: &Fence, value: u64, timeout: Option<Duration>) -> bool {
        self.inner.poll_until(fence, value, timeout)
    }
}
