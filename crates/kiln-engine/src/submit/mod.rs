//! Work submission.
//!
//! A [`SubmissionQueue`] wraps one hardware queue: it hands out command buffers,
//! submits them in batches and turns the queue's fence into [`CompletionToken`]s
//! callers can poll or wait on.
//!
//! [`CompletionToken`]: crate::sync::CompletionToken

mod queue;

pub use queue::SubmissionQueue;
