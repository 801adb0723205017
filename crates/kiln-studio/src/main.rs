use std::sync::Arc;
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use bytemuck::{Pod, Zeroable};

use kiln_engine::core::{EngineConfig, GpuContext, RenderServices};
use kiln_engine::device::{
    Backend, DeviceInit, GpuAddress, MemoryKind, QueueKind, SoftDevice, SoftDeviceConfig,
    ViewDesc, ViewKind, ViewSlot, WgpuBackend,
};
use kiln_engine::logging::{init_logging, LoggingConfig};
use kiln_engine::memory::DEFAULT_ALIGNMENT;
use kiln_engine::sync::CompletionToken;
use kiln_engine::views::{PipelineStage, ShaderResource, ShaderSignature, ViewRange};

const DEFAULT_FRAMES: u32 = 120;

/// Frames the update thread may run ahead of the present thread.
const FRAMES_IN_FLIGHT: usize = 2;

const MESH_COUNT: u32 = 16;
const PARTICLE_BYTES: u64 = 16 * 1024;

/// Longest a present waits before reporting a stalled frame.
const PRESENT_TIMEOUT: Duration = Duration::from_secs(2);

#[repr(C)]
#[derive(Debug, Copy, Clone, Pod, Zeroable)]
struct DrawConstants {
    offset: [f32; 4],
    tint: [f32; 4],
}

/// Long-lived geometry: vertex and instance views in static slots.
struct Mesh {
    vertices: ViewSlot,
    instances: ViewSlot,
}

impl ShaderResource for Mesh {
    fn view_slot(&self, kind: ViewKind) -> Option<ViewSlot> {
        match kind {
            ViewKind::ReadOnly => Some(self.vertices),
            ViewKind::Constant => Some(self.instances),
            ViewKind::ReadWrite => None,
        }
    }
}

/// Simulation state written by the compute pass and read by every draw.
struct Particles {
    state: ViewSlot,
}

impl ShaderResource for Particles {
    fn view_slot(&self, kind: ViewKind) -> Option<ViewSlot> {
        matches!(kind, ViewKind::ReadOnly | ViewKind::ReadWrite).then_some(self.state)
    }
}

struct Scene {
    meshes: Vec<Arc<dyn ShaderResource>>,
    particles: Arc<dyn ShaderResource>,
    particle_memory: GpuAddress,
}

/// A frame handed from the update thread to the present thread.
struct FrameSubmission {
    index: u32,
    token: CompletionToken,
    recorded_at: Instant,
}

fn main() -> Result<()> {
    init_logging(LoggingConfig::default());

    let frames = match std::env::var("KILN_FRAMES") {
        Ok(value) => value
            .parse::<u32>()
            .with_context(|| format!("KILN_FRAMES must be a frame count, got '{value}'"))?,
        Err(_) => DEFAULT_FRAMES,
    };

    let backend = create_backend()?;
    let gpu = GpuContext::new(backend, EngineConfig::default())
        .context("failed to create gpu context")?;
    let scene = build_scene(&gpu)?;

    println!();
    println!("  kiln studio · {} backend · {frames} frames", gpu.backend().name());
    println!();

    let started = Instant::now();
    let (frames_tx, frames_rx) = mpsc::sync_channel::<FrameSubmission>(FRAMES_IN_FLIGHT);

    thread::scope(|s| -> Result<()> {
        let present = s.spawn(|| present_loop(&gpu, frames_rx));
        let updated = update_loop(&gpu, &scene, frames, frames_tx);
        let presented = present
            .join()
            .map_err(|_| anyhow::anyhow!("present thread panicked"))?;
        updated?;
        log::info!("presented {presented} of {frames} frames");
        Ok(())
    })?;

    gpu.idle();
    let elapsed = started.elapsed();
    println!(
        "  {frames} frames in {:.1} ms ({:.2} ms/frame)",
        elapsed.as_secs_f64() * 1e3,
        elapsed.as_secs_f64() * 1e3 / f64::from(frames.max(1))
    );
    println!(
        "  pages: upload {} · device-local {} · dynamic views {} · command buffers {}",
        gpu.upload_pages().page_count(),
        gpu.device_local_pages().page_count(),
        gpu.dynamic_pages().page_count(),
        gpu.queue(QueueKind::Graphics).pool().created()
    );
    println!();
    Ok(())
}

fn create_backend() -> Result<Arc<dyn Backend>> {
    let choice = std::env::var("KILN_BACKEND").unwrap_or_else(|_| "soft".to_owned());
    match choice.as_str() {
        "soft" => Ok(Arc::new(SoftDevice::new(SoftDeviceConfig {
            batch_latency: Duration::from_millis(2),
            record_trace: false,
        }))),
        "wgpu" => {
            let backend = WgpuBackend::new_blocking(DeviceInit::default())
                .context("failed to initialize wgpu backend")?;
            Ok(Arc::new(backend))
        }
        other => bail!("unknown KILN_BACKEND '{other}' (expected 'soft' or 'wgpu')"),
    }
}

/// Creates persistent memory and static views, then uploads initial particle data.
fn build_scene(gpu: &GpuContext) -> Result<Scene> {
    let geometry = gpu
        .backend()
        .create_memory_page(MESH_COUNT as u64 * 4096, MemoryKind::DeviceLocal)
        .context("failed to allocate mesh memory")?;
    let particle_page = gpu
        .backend()
        .create_memory_page(PARTICLE_BYTES, MemoryKind::DeviceLocal)
        .context("failed to allocate particle memory")?;

    let meshes = (0..MESH_COUNT)
        .map(|i| -> Result<Arc<dyn ShaderResource>> {
            let slots = gpu.view_slots().allocate(2)?;
            let base = geometry.base.offset(i as u64 * 4096);
            gpu.view_slots().write_range(
                &slots,
                &[
                    ViewDesc::ReadOnly {
                        address: base,
                        size: 3072,
                        stride: 32,
                    },
                    ViewDesc::Constant {
                        address: base.offset(3072),
                        size: 1024,
                    },
                ],
            );
            Ok(Arc::new(Mesh {
                vertices: slots.slot(0),
                instances: slots.slot(1),
            }))
        })
        .collect::<Result<Vec<_>>>()?;

    let particle_slot = gpu.view_slots().allocate(1)?.first();
    gpu.view_slots().write(
        particle_slot,
        ViewDesc::ReadWrite {
            address: particle_page.base,
            size: PARTICLE_BYTES,
            stride: 16,
        },
    );

    // Seed particles through the copy queue.
    let mut upload = gpu.recording_context(QueueKind::Copy);
    let seed = upload.allocate_transient(PARTICLE_BYTES, DEFAULT_ALIGNMENT)?;
    let positions: Vec<[f32; 4]> = (0..PARTICLE_BYTES / 16)
        .map(|i| [i as f32, 0.0, 0.0, 1.0])
        .collect();
    // SAFETY: the allocation is fresh and owned by this context until finish.
    unsafe { seed.write_slice(0, &positions) };
    upload.copy_memory(seed.gpu_address(), particle_page.base, PARTICLE_BYTES);
    let seeded = upload.finish().context("failed to upload particle seed")?;
    gpu.queue(QueueKind::Compute)
        .stall_for(gpu.queue(QueueKind::Copy), seeded)?;

    log::info!("scene ready: {MESH_COUNT} meshes, {PARTICLE_BYTES} bytes of particles");
    Ok(Scene {
        meshes,
        particles: Arc::new(Particles {
            state: particle_slot,
        }),
        particle_memory: particle_page.base,
    })
}

fn update_loop(
    gpu: &GpuContext,
    scene: &Scene,
    frames: u32,
    submissions: mpsc::SyncSender<FrameSubmission>,
) -> Result<()> {
    let simulate = ShaderSignature::new()
        .with_inline()
        .with_table([ViewRange::new(ViewKind::ReadWrite, 1)]);
    let draw = ShaderSignature::new()
        .with_inline()
        .with_table([
            ViewRange::new(ViewKind::ReadOnly, 1),
            ViewRange::new(ViewKind::Constant, 1),
        ])
        .with_table([ViewRange::new(ViewKind::ReadOnly, 1)]);

    let mut compute = gpu.recording_context(QueueKind::Compute);
    let mut graphics = gpu.recording_context(QueueKind::Graphics);

    for index in 0..frames {
        compute.set_signature(PipelineStage::Compute, &simulate);
        compute.stage_view_bindings(PipelineStage::Compute, 1, 0, &[scene.particles.clone()]);
        compute.dispatch((PARTICLE_BYTES / 16 / 64) as u32, 1, 1)?;
        compute.commands().marker("simulate");
        let simulated = compute.finish()?;

        gpu.queue(QueueKind::Graphics)
            .stall_for(gpu.queue(QueueKind::Compute), simulated)?;

        graphics.set_signature(PipelineStage::Graphics, &draw);
        graphics.stage_view_bindings(PipelineStage::Graphics, 2, 0, &[scene.particles.clone()]);
        let mut copied = 0;
        for (i, mesh) in scene.meshes.iter().enumerate() {
            let constants = graphics.allocate_transient(
                std::mem::size_of::<DrawConstants>() as u64,
                DEFAULT_ALIGNMENT,
            )?;
            let phase = (index as f32 + i as f32) * 0.1;
            // SAFETY: fresh allocation, read by the GPU only after finish.
            unsafe {
                constants.write_pod(
                    0,
                    &DrawConstants {
                        offset: [phase.sin(), phase.cos(), 0.0, 0.0],
                        tint: [1.0, i as f32 / MESH_COUNT as f32, 0.5, 1.0],
                    },
                );
            }

            graphics.stage_view_bindings(PipelineStage::Graphics, 1, 0, &[mesh.clone(), mesh.clone()]);
            copied += graphics.draw(36, 1)?.views_copied;
        }
        let token = graphics.finish()?;
        log::trace!("frame {index}: {copied} views copied");

        let frame = FrameSubmission {
            index,
            token,
            recorded_at: Instant::now(),
        };
        if submissions.send(frame).is_err() {
            bail!("present thread stopped early");
        }
    }

    log::debug!(
        "particle state lives at {:#x}",
        scene.particle_memory.get()
    );
    Ok(())
}

/// Waits for each frame's work and reports how long it sat in flight.
fn present_loop(gpu: &GpuContext, frames: mpsc::Receiver<FrameSubmission>) -> u32 {
    let mut presented = 0;
    let mut worst = Duration::ZERO;
    for frame in frames {
        if !gpu.wait_for(frame.token, Some(PRESENT_TIMEOUT)) {
            log::warn!("frame {} still running after {PRESENT_TIMEOUT:?}", frame.index);
            continue;
        }
        let latency = frame.recorded_at.elapsed();
        worst = worst.max(latency);
        presented += 1;
        if frame.index % 30 == 0 {
            log::info!("frame {} presented ({latency:?} after submit)", frame.index);
        }
    }
    log::info!("worst submit-to-present latency: {worst:?}");
    presented
}
