use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::command::{CommandBuffer, CommandBufferPool};
use crate::device::{Backend, DeviceError, HardwareQueue, QueueKind};
use crate::sync::{lock, CompletionToken, Fence, RetireStamp, Semaphore};

/// One hardware queue together with its fence and command buffer pool.
///
/// Completion values are allocated under a submission lock, so they strictly
/// increase in submission order. The pool and the fence each have their own lock;
/// waiting never holds either of the other two.
pub struct SubmissionQueue {
    kind: QueueKind,
    hw: Box<dyn HardwareQueue>,
    fence: Arc<Fence>,
    /// Last value handed to the hardware queue.
    last_value: Mutex<u64>,
    pool: CommandBufferPool,
}

impl SubmissionQueue {
    pub fn new(backend: &dyn Backend, kind: QueueKind) -> Result<Self, DeviceError> {
        let hw = backend.create_queue(kind).inspect_err(|err| {
            log::error!("{}: failed to create {} queue: {err}", backend.name(), kind.label())
        })?;
        let initial = CompletionToken::initial_value(kind);
        log::debug!("{}: {} queue ready", backend.name(), kind.label());

        Ok(Self {
            kind,
            hw,
            fence: Arc::new(Fence::new(kind.label(), initial)),
            last_value: Mutex::new(initial),
            pool: CommandBufferPool::new(kind),
        })
    }

    #[inline]
    pub fn kind(&self) -> QueueKind {
        self.kind
    }

    /// Returns a command buffer ready for recording. Never blocks on the GPU.
    pub fn command_buffer(&self) -> CommandBuffer {
        self.pool.acquire(self.fence.completed(), self.hw.as_ref())
    }

    /// Executes `buffers` as one batch and returns the value the fence reaches
    /// once all of them have finished.
    ///
    /// If the device rejects the batch the buffers go straight back to the pool
    /// (the GPU never saw them) and the error is returned.
    pub fn submit(&self, mut buffers: Vec<CommandBuffer>) -> Result<CompletionToken, DeviceError> {
        for buffer in &mut buffers {
            assert_eq!(
                buffer.kind(),
                self.kind,
                "{:?} recorded for another queue",
                buffer.id()
            );
            buffer.close();
        }

        let value = {
            let mut last = lock(&self.last_value);
            let value = *last + 1;
            let batch: Vec<&CommandBuffer> = buffers.iter().collect();
            if let Err(err) = self.hw.execute(&batch, &self.fence, value) {
                drop(last);
                log::error!(
                    "{} queue: batch of {} command buffers rejected: {err}",
                    self.kind.label(),
                    buffers.len()
                );
                for buffer in buffers {
                    self.pool.restore(buffer);
                }
                return Err(err);
            }
            *last = value;
            value
        };

        log::trace!(
            "{} queue: submitted {} command buffers as {value:#x}",
            self.kind.label(),
            buffers.len()
        );
        self.pool.recycle(buffers, value);
        Ok(CompletionToken::from_raw(value))
    }

    /// Allocates the next value and signals it after all previously submitted work.
    pub fn signal(&self) -> Result<CompletionToken, DeviceError> {
        let mut last = lock(&self.last_value);
        let value = *last + 1;
        self.hw
            .signal(&self.fence, value)
            .inspect_err(|err| log::error!("{} queue: signal failed: {err}", self.kind.label()))?;
        *last = value;
        Ok(CompletionToken::from_raw(value))
    }

    /// Signals the next value of `semaphore` once previously submitted work is done.
    ///
    /// Returns the value another queue passes to [`SubmissionQueue::wait`].
    pub fn signal_to(&self, semaphore: &Semaphore) -> Result<u64, DeviceError> {
        let _ordered = lock(&self.last_value);
        let value = semaphore.next_value();
        self.hw
            .signal(semaphore.fence(), value)
            .inspect_err(|err| {
                log::error!(
                    "{} queue: signal of '{}' failed: {err}",
                    self.kind.label(),
                    semaphore.fence().label()
                )
            })?;
        Ok(value)
    }

    /// Holds work submitted after this call until `semaphore` reaches `value`.
    pub fn wait(&self, semaphore: &Semaphore, value: u64) -> Result<(), DeviceError> {
        let _ordered = lock(&self.last_value);
        self.hw
            .wait(semaphore.fence(), value)
            .inspect_err(|err| log::error!("{} queue: wait failed: {err}", self.kind.label()))
    }

    /// Holds work submitted after this call until `token` completes on `other`.
    pub fn stall_for(&self, other: &SubmissionQueue, token: CompletionToken) -> Result<(), DeviceError> {
        if token.is_none() {
            return Ok(());
        }
        debug_assert_eq!(token.queue_kind(), Some(other.kind), "token of another queue");
        let _ordered = lock(&self.last_value);
        self.hw.wait(&other.fence, token.value()).inspect_err(|err| {
            log::error!(
                "{} queue: stall for {} queue failed: {err}",
                self.kind.label(),
                other.kind.label()
            )
        })
    }

    /// Non-blocking completion check.
    #[inline]
    pub fn is_complete(&self, token: CompletionToken) -> bool {
        token.is_none() || self.fence.is_complete(token.value())
    }

    /// Blocks until `token` completes or `timeout` elapses (`None` waits forever).
    ///
    /// Returns whether the token completed.
    pub fn wait_for(&self, token: CompletionToken, timeout: Option<Duration>) -> bool {
        if self.is_complete(token) {
            return true;
        }
        debug_assert_eq!(token.queue_kind(), Some(self.kind), "token of another queue");
        debug_assert!(
            token.value() <= *lock(&self.last_value),
            "waiting on {:#x}, which was never submitted",
            token.value()
        );

        let reached = self.hw.host_wait(&self.fence, token.value(), timeout);
        if !reached {
            log::warn!(
                "{} queue: timed out after {timeout:?} waiting for {:#x} (completed {:#x})",
                self.kind.label(),
                token.value(),
                self.fence.completed()
            );
        }
        reached
    }

    /// Waits for every submitted batch, then drops the references held by the
    /// pooled command buffers.
    pub fn idle(&self) {
        for target in self.pool.targets() {
            self.hw.host_wait(&self.fence, target, None);
        }
        let last = *lock(&self.last_value);
        self.hw.host_wait(&self.fence, last, None);

        let released = self.pool.release_completed(self.fence.completed());
        log::debug!(
            "{} queue idle at {last:#x}, released {released} retained references",
            self.kind.label()
        );
    }

    /// Last value handed out by [`SubmissionQueue::submit`] or [`SubmissionQueue::signal`].
    pub fn last_submitted(&self) -> CompletionToken {
        CompletionToken::from_raw(*lock(&self.last_value))
    }

    #[inline]
    pub fn completed_value(&self) -> u64 {
        self.fence.completed()
    }

    #[inline]
    pub fn fence(&self) -> &Arc<Fence> {
        &self.fence
    }

    /// Stamp that completes together with `token`; used to retire pooled pages.
    pub fn stamp(&self, token: CompletionToken) -> RetireStamp {
        RetireStamp::new(self.fence.clone(), token.value())
    }

    #[inline]
    pub fn pool(&self) -> &CommandBufferPool {
        &self.pool
    }

    /// Pooled command buffers that could be reused right now.
    pub fn available_command_buffers(&self) -> usize {
        self.pool.available(self.fence.completed())
    }
}

#[cfg(test)]
mod tests {
    use std::thread;
    use std::time::Instant;

    use super::*;
    use crate::device::{GpuAddress, SoftDevice, SoftDeviceConfig};

    fn device(latency_ms: u64) -> SoftDevice {
        SoftDevice::new(SoftDeviceConfig {
            batch_latency: Duration::from_millis(latency_ms),
            record_trace: false,
        })
    }

    // ── tokens ────────────────────────────────────────────────────────────

    #[test]
    fn tokens_strictly_increase_and_carry_queue_kind() {
        let device = device(0);
        let queue = SubmissionQueue::new(&device, QueueKind::Compute).unwrap();

        let mut previous = CompletionToken::NONE;
        for _ in 0..5 {
            let token = queue.submit(vec![queue.command_buffer()]).unwrap();
            assert!(token > previous);
            assert_eq!(token.queue_kind(), Some(QueueKind::Compute));
            previous = token;
        }
        assert_eq!(
            previous.value(),
            CompletionToken::initial_value(QueueKind::Compute) + 5
        );
        assert_eq!(queue.last_submitted(), previous);
    }

    #[test]
    fn signal_without_work_advances_counter() {
        let device = device(0);
        let queue = SubmissionQueue::new(&device, QueueKind::Graphics).unwrap();
        let a = queue.submit(vec![queue.command_buffer()]).unwrap();
        let b = queue.signal().unwrap();
        assert_eq!(b.value(), a.value() + 1);
        assert!(queue.wait_for(b, Some(Duration::from_secs(5))));
    }

    // ── waiting ───────────────────────────────────────────────────────────

    #[test]
    fn wait_for_never_returns_early() {
        let device = device(40);
        let queue = SubmissionQueue::new(&device, QueueKind::Graphics).unwrap();
        let token = queue.submit(vec![queue.command_buffer()]).unwrap();

        assert!(!queue.is_complete(token));
        assert!(!queue.wait_for(token, Some(Duration::from_millis(1))));

        let start = Instant::now();
        assert!(queue.wait_for(token, None));
        assert!(queue.completed_value() >= token.value());
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn none_token_is_always_complete() {
        let device = device(0);
        let queue = SubmissionQueue::new(&device, QueueKind::Copy).unwrap();
        assert!(queue.is_complete(CompletionToken::NONE));
        assert!(queue.wait_for(CompletionToken::NONE, Some(Duration::ZERO)));
    }

    #[test]
    fn idle_makes_whole_batch_available() {
        let device = device(10);
        let queue = SubmissionQueue::new(&device, QueueKind::Graphics).unwrap();
        let buffers: Vec<_> = (0..3).map(|_| queue.command_buffer()).collect();
        let token = queue.submit(buffers).unwrap();

        queue.idle();
        assert!(queue.is_complete(token));
        assert_eq!(queue.available_command_buffers(), 3);
        assert_eq!(queue.pool().created(), 3);
    }

    #[test]
    fn idle_releases_retained_references() {
        let device = device(0);
        let queue = SubmissionQueue::new(&device, QueueKind::Graphics).unwrap();
        let resource = Arc::new(42u32);
        let mut cmd = queue.command_buffer();
        cmd.retain(resource.clone());
        queue.submit(vec![cmd]).unwrap();

        queue.idle();
        assert_eq!(Arc::strong_count(&resource), 1);
    }

    // ── recycling ─────────────────────────────────────────────────────────

    #[test]
    fn buffers_are_not_reissued_before_completion() {
        let device = device(40);
        let queue = SubmissionQueue::new(&device, QueueKind::Graphics).unwrap();
        let first = queue.command_buffer();
        let first_id = first.id();
        let token = queue.submit(vec![first]).unwrap();

        let second = queue.command_buffer();
        assert_ne!(second.id().index, first_id.index);

        assert!(queue.wait_for(token, None));
        let third = queue.command_buffer();
        assert_eq!(third.id().index, first_id.index);
        assert_eq!(third.id().generation, first_id.generation + 1);
    }

    #[test]
    fn rejected_batch_returns_buffers_immediately() {
        let device = device(0);
        let queue = SubmissionQueue::new(&device, QueueKind::Copy).unwrap();
        let before = queue.last_submitted();

        let mut cmd = queue.command_buffer();
        cmd.copy_memory(GpuAddress(0x10), GpuAddress(0x20), 4);
        let err = queue.submit(vec![cmd]).unwrap_err();

        assert!(matches!(err, DeviceError::InvalidAddress(_)));
        assert_eq!(queue.last_submitted(), before);
        assert_eq!(queue.available_command_buffers(), 1);
        assert_eq!(queue.command_buffer().id().index, 0);
    }

    // ── concurrency ───────────────────────────────────────────────────────

    #[test]
    fn concurrent_submitters_get_unique_ordered_tokens() {
        let device = device(1);
        let queue = SubmissionQueue::new(&device, QueueKind::Graphics).unwrap();
        let queue = &queue;

        let per_thread: Vec<Vec<CompletionToken>> = thread::scope(|s| {
            let workers: Vec<_> = (0..4)
                .map(|_| {
                    s.spawn(move || {
                        let mut tokens = Vec::new();
                        for i in 0..20 {
                            let token = queue.submit(vec![queue.command_buffer()]).unwrap();
                            if i % 5 == 4 {
                                assert!(queue.wait_for(token, Some(Duration::from_secs(5))));
                            }
                            tokens.push(token);
                        }
                        tokens
                    })
                })
                .collect();
            workers.into_iter().map(|w| w.join().unwrap()).collect()
        });

        let mut all = std::collections::HashSet::new();
        for tokens in &per_thread {
            assert!(tokens.windows(2).all(|w| w[0] < w[1]));
            all.extend(tokens.iter().copied());
        }
        assert_eq!(all.len(), 80);
        assert_eq!(queue.last_submitted(), *all.iter().max().unwrap());

        queue.idle();
        assert_eq!(queue.pool().len(), queue.pool().created() as usize);
        assert_eq!(queue.available_command_buffers(), queue.pool().len());
    }

    #[test]
    fn long_wait_does_not_block_recording_threads() {
        let device = device(200);
        let queue = SubmissionQueue::new(&device, QueueKind::Graphics).unwrap();
        let token = queue.submit(vec![queue.command_buffer()]).unwrap();

        thread::scope(|s| {
            let waiter = s.spawn(|| queue.wait_for(token, None));
            thread::sleep(Duration::from_millis(20));

            let next = queue.submit(vec![queue.command_buffer()]).unwrap();
            assert!(next > token);
            assert!(!queue.is_complete(token));
            assert!(waiter.join().unwrap());
        });
    }

    // ── cross-queue ordering ──────────────────────────────────────────────

    #[test]
    fn semaphore_orders_work_between_queues() {
        let device = device(0);
        let graphics = SubmissionQueue::new(&device, QueueKind::Graphics).unwrap();
        let compute = SubmissionQueue::new(&device, QueueKind::Compute).unwrap();
        let semaphore = Semaphore::new("shadow-ready");

        compute.wait(&semaphore, 1).unwrap();
        let token = compute.submit(vec![compute.command_buffer()]).unwrap();
        thread::sleep(Duration::from_millis(20));
        assert!(!compute.is_complete(token));

        graphics.submit(vec![graphics.command_buffer()]).unwrap();
        assert_eq!(graphics.signal_to(&semaphore).unwrap(), 1);
        assert!(compute.wait_for(token, Some(Duration::from_secs(5))));
    }

    #[test]
    fn stall_for_waits_on_other_queue() {
        let device = device(30);
        let graphics = SubmissionQueue::new(&device, QueueKind::Graphics).unwrap();
        let copy = SubmissionQueue::new(&device, QueueKind::Copy).unwrap();

        let produced = graphics.submit(vec![graphics.command_buffer()]).unwrap();
        copy.stall_for(&graphics, produced).unwrap();
        let consumed = copy.submit(vec![copy.command_buffer()]).unwrap();

        assert!(copy.wait_for(consumed, Some(Duration::from_secs(5))));
        assert!(graphics.is_complete(produced));
    }

    #[test]
    fn stamps_follow_queue_fence() {
        let device = device(20);
        let queue = SubmissionQueue::new(&device, QueueKind::Graphics).unwrap();
        let token = queue.submit(vec![queue.command_buffer()]).unwrap();
        let stamp = queue.stamp(token);
        assert!(!stamp.is_complete());
        queue.idle();
        assert!(stamp.is_complete());
    }
}
