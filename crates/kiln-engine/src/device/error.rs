use std::fmt;

/// Failure reported by a device backend at runtime.
///
/// Construction of devices and contexts goes through `anyhow`; this type covers
/// the operations a frame loop performs repeatedly (page creation, submission),
/// where callers decide between skipping work and aborting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceError {
    /// The device could not back a new page or command buffer.
    OutOfMemory,
    /// The device (or its execution thread) is gone; nothing further will complete.
    DeviceLost,
    /// A GPU address did not resolve to a live memory page.
    InvalidAddress(u64),
    /// A command buffer was re-begun while a submission using it was still executing.
    CommandBufferInFlight { index: u32, generation: u32 },
    /// The backend cannot express the requested operation.
    Unsupported(&'static str),
    /// Backend-specific failure message.
    Backend(String),
}

impl fmt::Display for DeviceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceError::OutOfMemory => write!(f, "device out of memory"),
            DeviceError::DeviceLost => write!(f, "device lost"),
            DeviceError::InvalidAddress(addr) => {
                write!(f, "gpu address {addr:#x} does not map to a memory page")
            }
            DeviceError::CommandBufferInFlight { index, generation } => write!(
                f,
                "command buffer {index} (generation {generation}) is still executing"
            ),
            DeviceError::Unsupported(what) => write!(f, "unsupported by backend: {what}"),
            DeviceError::Backend(msg) => write!(f, "backend error: {msg}"),
        }
    }
}

impl std::error::Error for DeviceError {}
