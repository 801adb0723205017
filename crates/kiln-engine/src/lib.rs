//! Kiln engine crate.
//!
//! GPU submission and transient-resource memory management: queues and fences,
//! recycled command buffers, view-slot allocators and linear transient memory,
//! on a software device or on wgpu.

pub mod command;
pub mod core;
pub mod device;
pub mod logging;
pub mod memory;
pub mod submit;
pub mod sync;
pub mod views;
