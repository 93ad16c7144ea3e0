use anyhow::{ensure, Result};
use nalgebra::{Matrix4, Point3};

use crate::grass::batching::GrassBatch;
use crate::grass::lod::GpuLod;
use crate::grass::placement::SurfaceGeometry;
use crate::rendering::graphics::Instance;
use crate::rendering::model::Model;

pub mod batching;
pub mod lod;
pub mod placement;

#[derive(Debug, Clone)]
pub struct GrassConfig {
    /// Probability that a surface vertex spawns a blade.
    pub density: f32,
    /// Maximum random offset from the vertex within its tangent plane.
    pub offset_radius: f32,
    /// Orient blades along the surface normal instead of straight up.
    pub align_to_normal: bool,
    /// Small vertical bias against z-fighting with the surface.
    pub y_lift: f32,
    /// Near/far LOD threshold in world units.
    pub lod_distance: f32,
    pub random_seed: u64,
    /// Measure viewer distance in the XZ plane only.
    pub planar_distance: bool,
    /// Partition on the compute device; false selects the chunked CPU path.
    pub use_gpu_lod: bool,
    /// Blocking per-frame readback of bucket counts for the overlay. Expensive.
    pub debug_readback: bool,
    /// Hardware cap honored by the direct instanced draws of the CPU path.
    pub max_instances_per_draw: u32,
}

impl Default for GrassConfig {
    fn default() -> Self {
        Self {
            density: 1.0,
            offset_radius: 0.2,
            align_to_normal: true,
            y_lift: 0.02,
            lod_distance: 20.0,
            random_seed: 12345,
            planar_distance: false,
            use_gpu_lod: true,
            debug_readback: false,
            max_instances_per_draw: 1023,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LodTier {
    Near,
    Far,
}

/// Owns the generated placement, the two LOD meshes and, when the compute
/// path is active, every device buffer of the partition pipeline. The
/// instance set is generated once here and never mutated afterwards.
pub struct GrassSystem {
    pub config: GrassConfig,
    instances: Vec<Instance>,
    high_model: Model,
    low_model: Model,
    gpu: Option<GpuLod>,
}

impl GrassSystem {
    pub fn new(
        device: &wgpu::Device,
        config: GrassConfig,
        surface: &SurfaceGeometry,
        local_to_world: &Matrix4<f32>,
        high_model: Model,
        low_model: Model,
        texture_layout: &wgpu::BindGroupLayout,
        camera_layout: &wgpu::BindGroupLayout,
        color_format: wgpu::TextureFormat,
    ) -> Result<Self> {
        ensure!(
            !high_model.meshes.is_empty() && !high_model.materials.is_empty(),
            "high LOD model has no geometry or material"
        );
        ensure!(
            !low_model.meshes.is_empty() && !low_model.materials.is_empty(),
            "low LOD model has no geometry or material"
        );

        let instances = placement::generate(surface, local_to_world, &config);
        log::info!(
            "generated {} grass instances from {} surface vertices",
            instances.len(),
            surface.positions.len()
        );

        let gpu = if config.use_gpu_lod && !instances.is_empty() {
            let raws = instances.iter().map(Instance::to_raw).collect::<Vec<_>>();
            Some(GpuLod::new(
                device,
                &raws,
                &high_model,
                &low_model,
                texture_layout,
                camera_layout,
                color_format,
            )?)
        } else {
            None
        };

        Ok(Self {
            config,
            instances,
            high_model,
            low_model,
            gpu,
        })
    }

    pub fn instance_count(&self) -> u32 {
        self.instances.len() as u32
    }

    pub fn uses_gpu_lod(&self) -> bool {
        self.gpu.is_some()
    }

    pub fn model_for(&self, tier: LodTier) -> &Model {
        match tier {
            LodTier::Near => &self.high_model,
            LodTier::Far => &self.low_model,
        }
    }

    /// Encodes this frame's counter reset, partition dispatch and count
    /// copies. Must run in the same encoder as the draw so the draw observes
    /// the finished partition.
    pub fn encode_frame(
        &self,
        queue: &wgpu::Queue,
        encoder: &mut wgpu::CommandEncoder,
        viewer: Option<&Point3<f32>>,
    ) {
        if let Some(gpu) = &self.gpu {
            gpu.encode_frame(queue, encoder, viewer, &self.config);
        }
    }

    /// One indirect draw per bucket, near tier first.
    pub fn draw_indirect<'a>(
        &'a self,
        render_pass: &mut wgpu::RenderPass<'a>,
        camera_bind_group: &'a wgpu::BindGroup,
    ) {
        if let Some(gpu) = &self.gpu {
            gpu.draw(
                render_pass,
                &self.high_model,
                &self.low_model,
                camera_bind_group,
            );
        }
    }

    /// CPU fallback: rebuilds the per-tier chunked instance buffers for this
    /// frame. Nothing is retained between frames.
    pub fn build_batches(
        &self,
        device: &wgpu::Device,
        viewer: Option<&Point3<f32>>,
    ) -> Vec<GrassBatch> {
        batching::build_batches(device, &self.instances, viewer, &self.config)
    }

    /// Diagnostic only: blocks on a count readback. Never call on a path
    /// that gates the draw.
    pub fn debug_counts(&self, device: &wgpu::Device, queue: &wgpu::Queue) -> Option<(u32, u32)> {
        self.gpu
            .as_ref()
            .and_then(|gpu| gpu.read_counts_blocking(device, queue))
    }

    /// Releases the device buffers. Safe to call more than once.
    pub fn release(&mut self) {
        if let Some(gpu) = &mut self.gpu {
            gpu.release();
        }
    }
}
