//! Engine-facing entry points.
//!
//! [`GpuContext`] owns the device, its queues and the shared pools. Recording
//! threads each take a [`RecordingContext`] from it; everything else talks to the
//! context through [`RenderServices`].

mod config;
mod context;
mod recording;
mod services;

pub use config::EngineConfig;
pub use context::GpuContext;
pub use recording::RecordingContext;
pub use services::RenderServices;
