use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use super::Fence;

/// Timeline semaphore shared between queues.
///
/// A producer queue signals it GPU-side (`SubmissionQueue::signal_to`) and a consumer
/// queue waits on the signaled value GPU-side (`SubmissionQueue::wait`). Without such
/// a pair, independent queues have no ordering relative to each other.
#[derive(Debug)]
pub struct Semaphore {
    fence: Arc<Fence>,
    next: AtomicU64,
}

impl Semaphore {
    pub fn new(label: &'static str) -> Arc<Self> {
        Arc::new(Self {
            fence: Arc::new(Fence::new(label, 0)),
            next: AtomicU64::new(0),
        })
    }

    /// Reserves the next value to be signaled.
    #[inline]
    pub(crate) fn next_value(&self) -> u64 {
        self.next.fetch_add(1, Ordering::AcqRel) + 1
    }

    #[inline]
    pub fn fence(&self) -> &Arc<Fence> {
        &self.fence
    }

    /// Highest value reached so far.
    #[inline]
    pub fn completed(&self) -> u64 {
        self.fence.completed()
    }
}
