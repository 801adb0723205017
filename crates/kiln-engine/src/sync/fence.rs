use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::Duration;

use super::lock;
use crate::device::QueueKind;

/// Bit position of the queue kind inside a completion value.
const QUEUE_KIND_SHIFT: u32 = 56;

/// Value a queue's fence reaches once a given submission has finished on the GPU.
///
/// The top 8 bits carry the [`QueueKind`] of the issuing queue, so a token alone is
/// enough to route a wait to the right queue. [`CompletionToken::NONE`] is complete
/// on every queue.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Default)]
pub struct CompletionToken(u64);

impl CompletionToken {
    pub const NONE: CompletionToken = CompletionToken(0);

    #[inline]
    pub(crate) const fn from_raw(value: u64) -> Self {
        Self(value)
    }

    /// Value the queue starts from before its first submission.
    #[inline]
    pub(crate) const fn initial_value(kind: QueueKind) -> u64 {
        (kind as u64) << QUEUE_KIND_SHIFT
    }

    #[inline]
    pub const fn value(self) -> u64 {
        self.0
    }

    #[inline]
    pub const fn is_none(self) -> bool {
        self.0 == 0
    }

    /// Returns the queue that issued this token.
    pub fn queue_kind(self) -> Option<QueueKind> {
        QueueKind::from_tag((self.0 >> QUEUE_KIND_SHIFT) as u8)
    }
}

/// Monotonic GPU-progress counter with blocking waits.
///
/// The GPU side calls [`Fence::signal`] as work retires; the CPU side polls
/// [`Fence::completed`] or blocks in [`Fence::wait`]. The wait lock is private to
/// the fence, so a long wait never stalls pool bookkeeping elsewhere.
#[derive(Debug)]
pub struct Fence {
    label: &'static str,
    completed: AtomicU64,
    state: Mutex<u64>,
    signaled: Condvar,
}

impl Fence {
    pub fn new(label: &'static str, initial: u64) -> Self {
        Self {
            label,
            completed: AtomicU64::new(initial),
            state: Mutex::new(initial),
            signaled: Condvar::new(),
        }
    }

    #[inline]
    pub fn label(&self) -> &'static str {
        self.label
    }

    /// Highest value signaled so far. Never blocks.
    #[inline]
    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::Acquire)
    }

    #[inline]
    pub fn is_complete(&self, value: u64) -> bool {
        self.completed() >= value
    }

    /// Advances the fence to `value` and wakes waiters.
    ///
    /// Signals never move the fence backwards; a stale value is ignored.
    pub fn signal(&self, value: u64) {
        let mut current = lock(&self.state);
        if value <= *current {
            return;
        }
        *current = value;
        self.completed.store(value, Ordering::Release);
        drop(current);
        self.signaled.notify_all();
    }

    /// Blocks until the fence reaches `value` or `timeout` elapses.
    ///
    /// `None` waits without bound. Returns whether `value` was reached.
    pub fn wait(&self, value: u64, timeout: Option<Duration>) -> bool {
        if self.is_complete(value) {
            return true;
        }

        let guard = lock(&self.state);
        match timeout {
            None => {
                let _reached = self
                    .signaled
                    .wait_while(guard, |c| *c < value)
                    .unwrap_or_else(PoisonError::into_inner);
                true
            }
            Some(timeout) => {
                let (reached, _) = self
                    .signaled
                    .wait_timeout_while(guard, timeout, |c| *c < value)
                    .unwrap_or_else(PoisonError::into_inner);
                *reached >= value
            }
        }
    }
}

/// A fence value that must complete before a retired page may be handed out again.
#[derive(Debug, Clone)]
pub struct RetireStamp {
    fence: Arc<Fence>,
    value: u64,
}

impl RetireStamp {
    pub fn new(fence: Arc<Fence>, value: u64) -> Self {
        Self { fence, value }
    }

    #[inline]
    pub fn value(&self) -> u64 {
        self.value
    }

    #[inline]
    pub fn is_complete(&self) -> bool {
        self.fence.is_complete(self.value)
    }
}
