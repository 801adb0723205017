use std::collections::VecDeque;
use std::sync::Mutex;

use super::CommandBuffer;
use crate::device::{HardwareQueue, QueueKind};
use crate::sync::{lock, CompletionToken};

/// A submitted command buffer waiting for its batch to complete.
struct Entry {
    target: u64,
    buffer: CommandBuffer,
}

#[derive(Default)]
struct PoolState {
    /// Submitted buffers in submission order.
    ready: VecDeque<Entry>,
    /// Number of command buffers ever created; also the next buffer index.
    created: u32,
}

/// Per-queue recycler of command buffers.
///
/// Buffers are created on demand and never destroyed; the pool only grows. Reuse
/// checks the oldest entry first because it is the likeliest to have completed,
/// but every reuse is gated on that entry's own completion value.
pub struct CommandBufferPool {
    kind: QueueKind,
    state: Mutex<PoolState>,
}

impl CommandBufferPool {
    pub fn new(kind: QueueKind) -> Self {
        Self {
            kind,
            state: Mutex::new(PoolState::default()),
        }
    }

    /// Hands out a command buffer ready for recording.
    ///
    /// `completed` is the queue's current fence value. Never blocks on the GPU:
    /// when the oldest entry is still in flight a new buffer is created instead.
    pub fn acquire(&self, completed: u64, queue: &dyn HardwareQueue) -> CommandBuffer {
        let recycled = {
            let mut state = lock(&self.state);
            match state.ready.front() {
                Some(front) if front.target <= completed => state.ready.pop_front(),
                _ => None,
            }
        };

        if let Some(Entry { mut buffer, target }) = recycled {
            match queue.prepare_reuse(buffer.id()) {
                Ok(()) => {
                    buffer.begin();
                    return buffer;
                }
                Err(err) => {
                    // The device disagrees with the fence bookkeeping; park the buffer
                    // again rather than record into memory the GPU may still read.
                    log::error!(
                        "{} command buffer {:?} (target {target:#x}) rejected for reuse: {err}",
                        self.kind.label(),
                        buffer.id()
                    );
                    lock(&self.state).ready.push_back(Entry { target, buffer });
                }
            }
        }

        let index = {
            let mut state = lock(&self.state);
            let index = state.created;
            state.created += 1;
            index
        };
        log::debug!(
            "{} command buffer pool grew to {} buffers",
            self.kind.label(),
            index + 1
        );
        CommandBuffer::new(self.kind, index)
    }

    /// Files submitted buffers, all tagged with the completion value of their batch.
    pub fn recycle(&self, buffers: impl IntoIterator<Item = CommandBuffer>, target: u64) {
        let mut state = lock(&self.state);
        for buffer in buffers {
            debug_assert_eq!(buffer.kind(), self.kind);
            state.ready.push_back(Entry { target, buffer });
        }
    }

    /// Returns a buffer the GPU never saw. It is first in line for reuse.
    pub fn restore(&self, buffer: CommandBuffer) {
        debug_assert_eq!(buffer.kind(), self.kind);
        lock(&self.state).ready.push_front(Entry {
            target: CompletionToken::NONE.value(),
            buffer,
        });
    }

    /// Completion values of every pooled buffer, oldest first.
    pub fn targets(&self) -> Vec<u64> {
        lock(&self.state).ready.iter().map(|e| e.target).collect()
    }

    /// Drops the references held by every pooled buffer whose batch has completed.
    ///
    /// Returns the number of references released.
    pub fn release_completed(&self, completed: u64) -> usize {
        lock(&self.state)
            .ready
            .iter_mut()
            .filter(|e| e.target <= completed)
            .map(|e| e.buffer.release_retained())
            .sum()
    }

    /// Number of buffers currently parked in the pool.
    pub fn len(&self) -> usize {
        lock(&self.state).ready.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of pooled buffers that could be reused right now.
    pub fn available(&self, completed: u64) -> usize {
        lock(&self.state)
            .ready
            .iter()
            .filter(|e| e.target <= completed)
            .count()
    }

    /// Number of command buffers ever created by this pool.
    pub fn created(&self) -> u32 {
        lock(&self.state).created
    }
}
