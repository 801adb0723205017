use std::any::Any;
use std::ops::Range;
use std::sync::Arc;

use crate::device::{GpuAddress, MemoryPageId, QueueKind, ViewSlot};
use crate::views::{PipelineStage, MAX_BINDINGS};

/// Identity of a pooled command buffer.
///
/// `index` is the buffer's slot in its pool; `generation` increments every time the
/// buffer is re-begun, so a stale id never matches a recycled buffer.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct CommandBufferId {
    pub index: u32,
    pub generation: u32,
}

/// A single recorded GPU command.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Points binding `binding` of `stage` at `count` views starting at `first`.
    BindViewTable {
        stage: PipelineStage,
        binding: u32,
        first: ViewSlot,
        count: u32,
    },
    Draw {
        vertex_count: u32,
        instance_count: u32,
    },
    Dispatch {
        groups: [u32; 3],
    },
    /// Copies `size` bytes between two GPU addresses.
    CopyMemory {
        src: GpuAddress,
        dst: GpuAddress,
        size: u64,
    },
    /// Debug marker; no GPU effect.
    Marker(&'static str),
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum RecordState {
    Recording,
    Closed,
}

/// Recorded command stream for one queue.
///
/// Obtained from `SubmissionQueue::command_buffer` and given back through
/// `SubmissionQueue::submit`. The command vector keeps its capacity across reuse.
pub struct CommandBuffer {
    id: CommandBufferId,
    kind: QueueKind,
    state: RecordState,
    commands: Vec<Command>,
    /// References the GPU may read through until the buffer's batch completes.
    retained: Vec<Arc<dyn Any + Send + Sync>>,
    /// Host-visible ranges the CPU wrote for this buffer's commands.
    host_writes: Vec<(MemoryPageId, Range<u64>)>,
}

impl std::fmt::Debug for CommandBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandBuffer")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("state", &self.state)
            .field("commands", &self.commands.len())
            .field("retained", &self.retained.len())
            .field("host_writes", &self.host_writes.len())
            .finish()
    }
}

impl CommandBuffer {
    pub(crate) fn new(kind: QueueKind, index: u32) -> Self {
        Self {
            id: CommandBufferId { index, generation: 0 },
            kind,
            state: RecordState::Recording,
            commands: Vec::new(),
            retained: Vec::new(),
            host_writes: Vec::new(),
        }
    }

    #[inline]
    pub fn id(&self) -> CommandBufferId {
        self.id
    }

    #[inline]
    pub fn kind(&self) -> QueueKind {
        self.kind
    }

    #[inline]
    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.state == RecordState::Closed
    }

    #[inline]
    pub fn retained_count(&self) -> usize {
        self.retained.len()
    }

    /// Ranges of host-visible pages written for this buffer, in recording order.
    #[inline]
    pub fn host_writes(&self) -> &[(MemoryPageId, Range<u64>)] {
        &self.host_writes
    }

    pub fn bind_view_table(&mut self, stage: PipelineStage, binding: u32, first: ViewSlot, count: u32) {
        debug_assert!(
            self.kind != QueueKind::Copy,
            "copy queues cannot bind view tables"
        );
        assert!(
            (binding as usize) < MAX_BINDINGS,
            "binding index {binding} exceeds the {MAX_BINDINGS}-entry binding layout"
        );
        self.push(Command::BindViewTable {
            stage,
            binding,
            first,
            count,
        });
    }

    pub fn draw(&mut self, vertex_count: u32, instance_count: u32) {
        debug_assert_eq!(self.kind, QueueKind::Graphics, "draws need a graphics queue");
        self.push(Command::Draw {
            vertex_count,
            instance_count,
        });
    }

    pub fn dispatch(&mut self, x: u32, y: u32, z: u32) {
        debug_assert!(self.kind != QueueKind::Copy, "copy queues cannot dispatch");
        self.push(Command::Dispatch { groups: [x, y, z] });
    }

    pub fn copy_memory(&mut self, src: GpuAddress, dst: GpuAddress, size: u64) {
        self.push(Command::CopyMemory { src, dst, size });
    }

    pub fn marker(&mut self, label: &'static str) {
        self.push(Command::Marker(label));
    }

    /// Keeps `resource` alive until this buffer's batch has completed on the GPU.
    pub fn retain(&mut self, resource: Arc<dyn Any + Send + Sync>) {
        self.retained.push(resource);
    }

    /// Records that the CPU wrote `range` of `page` for work in this buffer.
    ///
    /// Backends that shadow host memory upload these ranges when the buffer's
    /// batch is executed.
    pub fn note_host_write(&mut self, page: MemoryPageId, range: Range<u64>) {
        if range.is_empty() {
            return;
        }
        self.host_writes.push((page, range));
    }

    fn push(&mut self, command: Command) {
        assert_eq!(
            self.state,
            RecordState::Recording,
            "recording into closed command buffer {:?}",
            self.id
        );
        self.commands.push(command);
    }

    pub(crate) fn close(&mut self) {
        assert_eq!(
            self.state,
            RecordState::Recording,
            "command buffer {:?} closed twice",
            self.id
        );
        self.state = RecordState::Closed;
    }

    /// Restarts recording. Clears commands, drops retained references and bumps
    /// the generation.
    pub(crate) fn begin(&mut self) {
        self.commands.clear();
        self.retained.clear();
        self.host_writes.clear();
        self.id.generation = self.id.generation.wrapping_add(1);
        self.state = RecordState::Recording;
    }

    /// Drops retained references. Returns how many were held.
    pub(crate) fn release_retained(&mut self) -> usize {
        let n = self.retained.len();
        self.retained.clear();
        n
    }
}
