use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use super::memory::{AddressSpace, HostBlock, MemoryEntry, MemoryTable};
use super::{
    Backend, DeviceError, GpuAddress, HardwareQueue, MemoryKind, MemoryPageInfo, QueueKind,
    ViewDesc, ViewPages, ViewSlot,
};
use crate::command::{Command, CommandBuffer, CommandBufferId};
use crate::sync::{lock, read_lock, write_lock, Fence};
use crate::views::{PipelineStage, MAX_BINDINGS};

/// How often a GPU-side semaphore wait re-checks for queue shutdown.
const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Software device configuration.
#[derive(Debug, Clone)]
pub struct SoftDeviceConfig {
    /// Simulated GPU time spent on every batch before its fence is signaled.
    ///
    /// Zero executes batches as soon as their thread picks them up.
    pub batch_latency: Duration,

    /// Record every draw/dispatch together with the view tables it saw.
    ///
    /// Intended for tests and debugging; the trace grows until drained with
    /// [`SoftDevice::take_trace`].
    pub record_trace: bool,
}

impl Default for SoftDeviceConfig {
    fn default() -> Self {
        Self {
            batch_latency: Duration::ZERO,
            record_trace: false,
        }
    }
}

/// A draw or dispatch as observed by the software GPU.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutedWork {
    pub queue: QueueKind,
    pub command: Command,
    /// `(binding, views)` for every table bound on the command's stage.
    pub tables: Vec<(u32, Vec<ViewDesc>)>,
}

struct Shared {
    config: SoftDeviceConfig,
    addresses: AddressSpace,
    memory: RwLock<MemoryTable<()>>,
    views: ViewPages,
    trace: Mutex<Vec<ExecutedWork>>,
    /// Command buffers issued to a queue whose batch has not completed yet.
    in_flight: Mutex<HashSet<(QueueKind, u32)>>,
}

/// In-process GPU.
///
/// Memory and view pages are host allocations. Each queue owns an execution thread
/// that runs batches strictly in issue order, performs memory copies, resolves
/// bound view tables for draws and dispatches, then signals the batch fence.
pub struct SoftDevice {
    shared: Arc<Shared>,
}

impl SoftDevice {
    pub fn new(config: SoftDeviceConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                addresses: AddressSpace::new(),
                memory: RwLock::new(MemoryTable::new()),
                views: ViewPages::new(),
                trace: Mutex::new(Vec::new()),
                in_flight: Mutex::new(HashSet::new()),
            }),
        }
    }

    /// Reads device memory the way a shader would.
    ///
    /// # Safety
    /// No CPU writer and no in-flight GPU copy may target the range; normally the
    /// caller has waited for the relevant completion token first.
    pub unsafe fn read_memory(&self, addr: GpuAddress, len: u64) -> Result<Vec<u8>, DeviceError> {
        let memory = read_lock(&self.shared.memory);
        let (entry, offset) = memory
            .resolve(addr, len)
            .ok_or(DeviceError::InvalidAddress(addr.get()))?;
        // SAFETY: range resolved inside the page; exclusivity is the caller's contract.
        Ok(unsafe { entry.host.read(offset as usize, len as usize) })
    }

    /// Drains the execution trace recorded so far.
    pub fn take_trace(&self) -> Vec<ExecutedWork> {
        std::mem::take(&mut *lock(&self.shared.trace))
    }

    pub fn memory_page_count(&self) -> usize {
        read_lock(&self.shared.memory).entries().len()
    }
}

impl Default for SoftDevice {
    fn default() -> Self {
        Self::new(SoftDeviceConfig::default())
    }
}

impl Backend for SoftDevice {
    fn name(&self) -> &'static str {
        "soft"
    }

    fn create_queue(&self, kind: QueueKind) -> Result<Box<dyn HardwareQueue>, DeviceError> {
        let (sender, receiver) = mpsc::channel();
        let shutdown = Arc::new(AtomicBool::new(false));

        let worker = {
            let shared = self.shared.clone();
            let shutdown = shutdown.clone();
            thread::Builder::new()
                .name(format!("kiln-soft-{}", kind.label()))
                .spawn(move || run_queue(kind, &shared, receiver, &shutdown))
                .map_err(|e| DeviceError::Backend(format!("failed to spawn queue thread: {e}")))?
        };

        log::debug!("soft device: {} queue online", kind.label());
        Ok(Box::new(SoftQueue {
            kind,
            shared: self.shared.clone(),
            sender: Some(sender),
            worker: Some(worker),
            shutdown,
        }))
    }

    fn create_memory_page(&self, size: u64, kind: MemoryKind) -> Result<MemoryPageInfo, DeviceError> {
        let host = HostBlock::zeroed(size)?;
        let mut memory = write_lock(&self.shared.memory);
        let info = MemoryPageInfo {
            id: memory.next_id(),
            kind,
            size,
            base: self.shared.addresses.reserve(size),
            cpu: match kind {
                MemoryKind::Upload => Some(host.ptr()),
                MemoryKind::DeviceLocal => None,
            },
        };
        memory.push(MemoryEntry { info, host, extra: () });
        Ok(info)
    }

    fn view_pages(&self) -> &ViewPages {
        &self.shared.views
    }
}

enum Work {
    Batch {
        lists: Vec<(CommandBufferId, Vec<Command>)>,
        fence: Arc<Fence>,
        value: u64,
    },
    Signal {
        fence: Arc<Fence>,
        value: u64,
    },
    Wait {
        fence: Arc<Fence>,
        value: u64,
    },
}

struct SoftQueue {
    kind: QueueKind,
    shared: Arc<Shared>,
    sender: Option<Sender<Work>>,
    worker: Option<JoinHandle<()>>,
    shutdown: Arc<AtomicBool>,
}

impl SoftQueue {
    fn send(&self, work: Work) -> Result<(), DeviceError> {
        self.sender
            .as_ref()
            .ok_or(DeviceError::DeviceLost)?
            .send(work)
            .map_err(|_| DeviceError::DeviceLost)
    }

    /// Rejects copies whose ranges do not map to memory, before the GPU sees them.
    fn validate(&self, commands: &[Command]) -> Result<(), DeviceError> {
        let memory = read_lock(&self.shared.memory);
        for command in commands {
            if let Command::CopyMemory { src, dst, size } = *command {
                for addr in [src, dst] {
                    if memory.resolve(addr, size).is_none() {
                        return Err(DeviceError::InvalidAddress(addr.get()));
                    }
                }
            }
        }
        Ok(())
    }
}

impl HardwareQueue for SoftQueue {
    fn kind(&self) -> QueueKind {
        self.kind
    }

    fn execute(
        &self,
        batch: &[&CommandBuffer],
        fence: &Arc<Fence>,
        value: u64,
    ) -> Result<(), DeviceError> {
        for cb in batch {
            self.validate(cb.commands())?;
        }

        {
            let mut in_flight = lock(&self.shared.in_flight);
            for cb in batch {
                in_flight.insert((self.kind, cb.id().index));
            }
        }

        let lists = batch
            .iter()
            .map(|cb| (cb.id(), cb.commands().to_vec()))
            .collect();

        let sent = self.send(Work::Batch {
            lists,
            fence: fence.clone(),
            value,
        });
        if sent.is_err() {
            let mut in_flight = lock(&self.shared.in_flight);
            for cb in batch {
                in_flight.remove(&(self.kind, cb.id().index));
            }
        }
        sent
    }

    fn signal(&self, fence: &Arc<Fence>, value: u64) -> Result<(), DeviceError> {
        self.send(Work::Signal {
            fence: fence.clone(),
            value,
        })
    }

    fn wait(&self, fence: &Arc<Fence>, value: u64) -> Result<(), DeviceError> {
        self.send(Work::Wait {
            fence: fence.clone(),
            value,
        })
    }

    fn prepare_reuse(&self, id: CommandBufferId) -> Result<(), DeviceError> {
        if lock(&self.shared.in_flight).contains(&(self.kind, id.index)) {
            return Err(DeviceError::CommandBufferInFlight {
                index: id.index,
                generation: id.generation,
            });
        }
        Ok(())
    }
}

impl Drop for SoftQueue {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        // Closing the channel ends the worker loop once queued work has drained.
        drop(self.sender.take());
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                log::error!("soft device: {} queue thread panicked", self.kind.label());
            }
        }
    }
}

/// Table bound at each binding of each stage: first slot and view count.
type BoundTables = [[Option<(ViewSlot, u32)>; MAX_BINDINGS]; PipelineStage::COUNT];

fn run_queue(kind: QueueKind, shared: &Shared, receiver: Receiver<Work>, shutdown: &AtomicBool) {
    for work in receiver {
        match work {
            Work::Batch { lists, fence, value } => {
                if !shared.config.batch_latency.is_zero() {
                    thread::sleep(shared.config.batch_latency);
                }

                for (_, commands) in &lists {
                    // Binding state does not carry over between command buffers.
                    let mut bound: BoundTables = [[None; MAX_BINDINGS]; PipelineStage::COUNT];
                    for command in commands {
                        execute_command(kind, shared, &mut bound, command);
                    }
                }

                {
                    let mut in_flight = lock(&shared.in_flight);
                    for (id, _) in &lists {
                        in_flight.remove(&(kind, id.index));
                    }
                }
                fence.signal(value);
            }
            Work::Signal { fence, value } => fence.signal(value),
            Work::Wait { fence, value } => {
                while !fence.wait(value, Some(WAIT_POLL_INTERVAL)) {
                    if shutdown.load(Ordering::Acquire) {
                        log::warn!(
                            "soft device: {} queue shut down while waiting on '{}' for {value}",
                            kind.label(),
                            fence.label()
                        );
                        return;
                    }
                }
            }
        }
    }
    log::debug!("soft device: {} queue retired", kind.label());
}

fn execute_command(kind: QueueKind, shared: &Shared, bound: &mut BoundTables, command: &Command) {
    match *command {
        Command::BindViewTable {
            stage,
            binding,
            first,
            count,
        } => {
            bound[stage.index()][binding as usize] = Some((first, count));
        }
        Command::Draw { .. } => record(kind, shared, &bound[PipelineStage::Graphics.index()], command),
        Command::Dispatch { .. } => record(kind, shared, &bound[PipelineStage::Compute.index()], command),
        Command::CopyMemory { src, dst, size } => {
            let memory = read_lock(&shared.memory);
            let (Some((src_page, src_off)), Some((dst_page, dst_off))) =
                (memory.resolve(src, size), memory.resolve(dst, size))
            else {
                log::error!("soft device: copy {src:?} -> {dst:?} ({size} bytes) faulted");
                return;
            };
            // SAFETY: both ranges were resolved inside their pages. The fence contract
            // guarantees the CPU is not writing them while this batch executes.
            unsafe {
                let bytes = src_page.host.read(src_off as usize, size as usize);
                dst_page.host.write(dst_off as usize, &bytes);
            }
        }
        Command::Marker(label) => log::trace!("soft device: {} marker '{label}'", kind.label()),
    }
}

fn record(
    kind: QueueKind,
    shared: &Shared,
    bound: &[Option<(ViewSlot, u32)>; MAX_BINDINGS],
    command: &Command,
) {
    if !shared.config.record_trace {
        return;
    }

    let tables = bound
        .iter()
        .enumerate()
        .filter_map(|(binding, table)| {
            let (first, count) = (*table)?;
            let views = shared.views.read_range(first, count).unwrap_or_default();
            Some((binding as u32, views))
        })
        .collect();

    lock(&shared.trace).push(ExecutedWork {
        queue: kind,
        command: command.clone(),
        tables,
    });
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use super::*;
    use crate::device::ViewVisibility;

    fn device(latency_ms: u64) -> SoftDevice {
        SoftDevice::new(SoftDeviceConfig {
            batch_latency: Duration::from_millis(latency_ms),
            record_trace: true,
        })
    }

    fn closed_buffer(kind: QueueKind, index: u32, record: impl FnOnce(&mut CommandBuffer)) -> CommandBuffer {
        let mut cb = CommandBuffer::new(kind, index);
        record(&mut cb);
        cb.close();
        cb
    }

    // ── execution ─────────────────────────────────────────────────────────

    #[test]
    fn batch_signals_fence_after_latency() {
        let dev = device(30);
        let queue = dev.create_queue(QueueKind::Graphics).unwrap();
        let fence = Arc::new(Fence::new("test", 0));
        let cb = closed_buffer(QueueKind::Graphics, 0, |cb| cb.draw(3, 1));

        let start = Instant::now();
        queue.execute(&[&cb], &fence, 1).unwrap();
        assert!(!fence.is_complete(1));
        assert!(queue.host_wait(&fence, 1, None));
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn copy_memory_moves_bytes_between_pages() {
        let dev = device(0);
        let queue = dev.create_queue(QueueKind::Copy).unwrap();
        let src = dev.create_memory_page(4096, MemoryKind::Upload).unwrap();
        let dst = dev.create_memory_page(4096, MemoryKind::DeviceLocal).unwrap();
        assert!(dst.cpu.is_none());

        unsafe {
            std::ptr::copy_nonoverlapping([9u8, 8, 7, 6].as_ptr(), src.cpu.unwrap().as_ptr().add(16), 4);
        }

        let fence = Arc::new(Fence::new("test", 0));
        let cb = closed_buffer(QueueKind::Copy, 0, |cb| {
            cb.copy_memory(src.base.offset(16), dst.base.offset(32), 4)
        });
        queue.execute(&[&cb], &fence, 1).unwrap();
        assert!(queue.host_wait(&fence, 1, None));

        let bytes = unsafe { dev.read_memory(dst.base.offset(32), 4).unwrap() };
        assert_eq!(bytes, vec![9, 8, 7, 6]);
    }

    #[test]
    fn copy_to_unmapped_address_is_rejected_at_submit() {
        let dev = device(0);
        let queue = dev.create_queue(QueueKind::Copy).unwrap();
        let src = dev.create_memory_page(256, MemoryKind::Upload).unwrap();
        let fence = Arc::new(Fence::new("test", 0));
        let cb = closed_buffer(QueueKind::Copy, 0, |cb| {
            cb.copy_memory(src.base, GpuAddress(0x10), 16)
        });

        assert_eq!(
            queue.execute(&[&cb], &fence, 1),
            Err(DeviceError::InvalidAddress(0x10))
        );
    }

    #[test]
    fn draws_observe_bound_tables() {
        let dev = device(0);
        let queue = dev.create_queue(QueueKind::Graphics).unwrap();
        let page = dev.create_view_page(8, ViewVisibility::ShaderVisible).unwrap();
        let view = ViewDesc::Constant {
            address: GpuAddress(0x1000),
            size: 256,
        };
        dev.view_pages().write(ViewSlot::new(page, 2), &[view]);

        let fence = Arc::new(Fence::new("test", 0));
        let cb = closed_buffer(QueueKind::Graphics, 0, |cb| {
            cb.bind_view_table(PipelineStage::Graphics, 1, ViewSlot::new(page, 2), 1);
            cb.draw(6, 2);
        });
        queue.execute(&[&cb], &fence, 1).unwrap();
        assert!(queue.host_wait(&fence, 1, None));

        let trace = dev.take_trace();
        assert_eq!(trace.len(), 1);
        assert_eq!(trace[0].tables, vec![(1, vec![view])]);
        assert!(dev.take_trace().is_empty());
    }

    // ── reuse validation ──────────────────────────────────────────────────

    #[test]
    fn in_flight_buffers_are_refused_for_reuse() {
        let dev = device(40);
        let queue = dev.create_queue(QueueKind::Graphics).unwrap();
        let fence = Arc::new(Fence::new("test", 0));
        let cb = closed_buffer(QueueKind::Graphics, 4, |cb| cb.draw(3, 1));

        queue.execute(&[&cb], &fence, 1).unwrap();
        assert!(matches!(
            queue.prepare_reuse(cb.id()),
            Err(DeviceError::CommandBufferInFlight { index: 4, .. })
        ));

        assert!(queue.host_wait(&fence, 1, None));
        assert_eq!(queue.prepare_reuse(cb.id()), Ok(()));
    }

    // ── cross-queue waits ─────────────────────────────────────────────────

    #[test]
    fn gpu_wait_holds_later_batches() {
        let dev = device(0);
        let queue = dev.create_queue(QueueKind::Compute).unwrap();
        let gate = Arc::new(Fence::new("gate", 0));
        let fence = Arc::new(Fence::new("test", 0));
        let cb = closed_buffer(QueueKind::Compute, 0, |cb| cb.dispatch(1, 1, 1));

        queue.wait(&gate, 1).unwrap();
        queue.execute(&[&cb], &fence, 1).unwrap();
        assert!(!queue.host_wait(&fence, 1, Some(Duration::from_millis(30))));

        gate.signal(1);
        assert!(queue.host_wait(&fence, 1, None));
    }

    #[test]
    fn dropping_a_waiting_queue_does_not_hang() {
        let dev = device(0);
        let queue = dev.create_queue(QueueKind::Compute).unwrap();
        let gate = Arc::new(Fence::new("gate", 0));
        queue.wait(&gate, 1).unwrap();
        drop(queue);
    }
}
