use anyhow::{ensure, Result};
use nalgebra::Point3;
use wgpu::util::DeviceExt;

use crate::grass::GrassConfig;
use crate::rendering::graphics::InstanceRaw;
use crate::rendering::model::{Mesh, Model, ModelVertex, Vertex};
use crate::rendering::texture::Texture;

pub const WORKGROUP_SIZE: u32 = 64;

/// Byte offset of `instance_count` inside [`DrawArgs`], the copy target of
/// the per-frame count transfer.
const INSTANCE_COUNT_OFFSET: u64 = 4;
const COUNTER_SIZE: u64 = std::mem::size_of::<u32>() as u64;

/// Indexed indirect draw record, five 32-bit words. Everything except
/// `instance_count` is fixed at initialization; `instance_count` is
/// overwritten on the device each frame from the bucket counter.
#[repr(C)]
#[derive(Debug, Copy, Clone, bytemuck::Pod, bytemuck::Zeroable)]
pub struct DrawArgs {
    pub index_count: u32,
    pub instance_count: u32,
    pub first_index: u32,
    pub base_vertex: u32,
    pub first_instance: u32,
}

impl DrawArgs {
    pub fn for_index_count(index_count: u32) -> Self {
        Self {
            index_count,
            instance_count: 0,
            first_index: 0,
            base_vertex: 0,
            first_instance: 0,
        }
    }

    pub fn for_mesh(mesh: &Mesh) -> Self {
        Self::for_index_count(mesh.num_elements)
    }
}

/// Uniform block read by the partition kernel.
#[repr(C)]
#[derive(Debug, Copy, Clone, bytemuck::Pod, bytemuck::Zeroable)]
struct PartitionParams {
    viewer_pos: [f32; 4],
    lod_distance_sqr: f32,
    instance_count: u32,
    planar: u32,
    _pad: u32,
}

impl PartitionParams {
    fn new(viewer: Option<&Point3<f32>>, config: &GrassConfig, instance_count: u32) -> Self {
        // Without a viewer the threshold collapses to zero and every
        // instance resolves to the far bucket.
        let (viewer_pos, lod_distance_sqr) = match viewer {
            Some(p) => ([p.x, p.y, p.z, 1.0], config.lod_distance * config.lod_distance),
            None => ([0.0; 4], 0.0),
        };
        Self {
            viewer_pos,
            lod_distance_sqr,
            instance_count,
            planar: config.planar_distance as u32,
            _pad: 0,
        }
    }
}

pub fn workgroup_count(instance_count: u32) -> u32 {
    ((instance_count + WORKGROUP_SIZE - 1) / WORKGROUP_SIZE).max(1)
}

/// All blade transforms, uploaded once at initialization and read-only for
/// the rest of the session.
pub struct TransformStore {
    buffer: wgpu::Buffer,
    len: u32,
}

impl TransformStore {
    pub fn new(device: &wgpu::Device, raws: &[InstanceRaw]) -> Self {
        let buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("Grass Transform Store"),
            contents: bytemuck::cast_slice(raws),
            usage: wgpu::BufferUsages::STORAGE,
        });
        Self {
            buffer,
            len: raws.len() as u32,
        }
    }

    pub fn len(&self) -> u32 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Per-tier output of the partition pass: a transform buffer sized to the
/// whole instance set (so an append can never overflow) plus the indirect
/// args consumed by the draw.
struct Bucket {
    transforms: wgpu::Buffer,
    args: wgpu::Buffer,
    bind_group: wgpu::BindGroup,
}

impl Bucket {
    fn new(
        device: &wgpu::Device,
        layout: &wgpu::BindGroupLayout,
        mesh: &Mesh,
        capacity_bytes: u64,
        label: &str,
    ) -> Self {
        let transforms = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(label),
            size: capacity_bytes,
            usage: wgpu::BufferUsages::STORAGE,
            mapped_at_creation: false,
        });
        let args = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("Grass Draw Args"),
            contents: bytemuck::bytes_of(&DrawArgs::for_mesh(mesh)),
            usage: wgpu::BufferUsages::INDIRECT | wgpu::BufferUsages::COPY_DST,
        });
        let bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some(label),
            layout,
            entries: &[wgpu::BindGroupEntry {
                binding: 0,
                resource: transforms.as_entire_binding(),
            }],
        });
        Self {
            transforms,
            args,
            bind_group,
        }
    }
}

/// Compute stage that appends every stored transform into exactly one of
/// the two buckets each frame, keyed on squared viewer distance.
pub struct LodPartitioner {
    pipeline: wgpu::ComputePipeline,
    bind_group: wgpu::BindGroup,
    params_buffer: wgpu::Buffer,
    counters: wgpu::Buffer,
}

impl LodPartitioner {
    fn new(
        device: &wgpu::Device,
        store: &TransformStore,
        near_transforms: &wgpu::Buffer,
        far_transforms: &wgpu::Buffer,
    ) -> Self {
        let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("Grass LOD Partition Shader"),
            source: wgpu::ShaderSource::Wgsl(include_str!("lod_partition.wgsl").into()),
        });

        let params_buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Grass Partition Params"),
            size: std::mem::size_of::<PartitionParams>() as u64,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let counters = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("Grass Bucket Counters"),
            contents: bytemuck::cast_slice(&[0u32; 2]),
            usage: wgpu::BufferUsages::STORAGE
                | wgpu::BufferUsages::COPY_DST
                | wgpu::BufferUsages::COPY_SRC,
        });

        let storage_entry = |binding, read_only| wgpu::BindGroupLayoutEntry {
            binding,
            visibility: wgpu::ShaderStages::COMPUTE,
            ty: wgpu::BindingType::Buffer {
                ty: wgpu::BufferBindingType::Storage { read_only },
                has_dynamic_offset: false,
                min_binding_size: None,
            },
            count: None,
        };
        let bind_group_layout =
            device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: Some("grass_partition_bind_group_layout"),
                entries: &[
                    wgpu::BindGroupLayoutEntry {
                        binding: 0,
                        visibility: wgpu::ShaderStages::COMPUTE,
                        ty: wgpu::BindingType::Buffer {
                            ty: wgpu::BufferBindingType::Uniform,
                            has_dynamic_offset: false,
                            min_binding_size: None,
                        },
                        count: None,
                    },
                    storage_entry(1, true),
                    storage_entry(2, false),
                    storage_entry(3, false),
                    storage_entry(4, false),
                ],
            });

        let bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("grass_partition_bind_group"),
            layout: &bind_group_layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: params_buffer.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: store.buffer.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: near_transforms.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 3,
                    resource: far_transforms.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 4,
                    resource: counters.as_entire_binding(),
                },
            ],
        });

        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("Grass Partition Pipeline Layout"),
            bind_group_layouts: &[&bind_group_layout],
            push_constant_ranges: &[],
        });
        let pipeline = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label: Some("Grass Partition Pipeline"),
            layout: Some(&pipeline_layout),
            module: &shader,
            entry_point: "partition",
        });

        Self {
            pipeline,
            bind_group,
            params_buffer,
            counters,
        }
    }

    /// Zeroes the bucket counters, refreshes the params and encodes one
    /// dispatch covering every instance.
    fn encode(
        &self,
        queue: &wgpu::Queue,
        encoder: &mut wgpu::CommandEncoder,
        viewer: Option<&Point3<f32>>,
        config: &GrassConfig,
        instance_count: u32,
    ) {
        let params = PartitionParams::new(viewer, config, instance_count);
        queue.write_buffer(&self.params_buffer, 0, bytemuck::bytes_of(&params));
        queue.write_buffer(&self.counters, 0, bytemuck::cast_slice(&[0u32; 2]));

        let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
            label: Some("Grass LOD Partition Pass"),
        });
        pass.set_pipeline(&self.pipeline);
        pass.set_bind_group(0, &self.bind_group, &[]);
        pass.dispatch_workgroups(workgroup_count(instance_count), 1, 1);
    }

    /// Device-side transfer of each bucket counter into its draw args.
    /// Sequenced after the dispatch in the same encoder, so the draw that
    /// follows always sees this frame's counts.
    fn copy_counts(
        &self,
        encoder: &mut wgpu::CommandEncoder,
        near_args: &wgpu::Buffer,
        far_args: &wgpu::Buffer,
    ) {
        encoder.copy_buffer_to_buffer(
            &self.counters,
            0,
            near_args,
            INSTANCE_COUNT_OFFSET,
            COUNTER_SIZE,
        );
        encoder.copy_buffer_to_buffer(
            &self.counters,
            COUNTER_SIZE,
            far_args,
            INSTANCE_COUNT_OFFSET,
            COUNTER_SIZE,
        );
    }
}

/// Device half of the grass system: transform store, partitioner, buckets
/// and the storage-transform draw pipeline.
pub struct GpuLod {
    store: TransformStore,
    partitioner: LodPartitioner,
    near: Bucket,
    far: Bucket,
    pipeline: wgpu::RenderPipeline,
    released: bool,
}

impl GpuLod {
    pub fn new(
        device: &wgpu::Device,
        raws: &[InstanceRaw],
        high_model: &Model,
        low_model: &Model,
        texture_layout: &wgpu::BindGroupLayout,
        camera_layout: &wgpu::BindGroupLayout,
        color_format: wgpu::TextureFormat,
    ) -> Result<Self> {
        let capacity_bytes = (raws.len() * std::mem::size_of::<InstanceRaw>()) as u64;
        let limit = device.limits().max_storage_buffer_binding_size as u64;
        ensure!(
            capacity_bytes <= limit,
            "grass transform set needs {} bytes per bucket, device allows {}",
            capacity_bytes,
            limit
        );

        let store = TransformStore::new(device, raws);

        let transforms_layout =
            device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: Some("grass_transforms_bind_group_layout"),
                entries: &[wgpu::BindGroupLayoutEntry {
                    binding: 0,
                    visibility: wgpu::ShaderStages::VERTEX,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Storage { read_only: true },
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                }],
            });

        let near = Bucket::new(
            device,
            &transforms_layout,
            &high_model.meshes[0],
            capacity_bytes,
            "Grass Near Bucket",
        );
        let far = Bucket::new(
            device,
            &transforms_layout,
            &low_model.meshes[0],
            capacity_bytes,
            "Grass Far Bucket",
        );

        let partitioner = LodPartitioner::new(device, &store, &near.transforms, &far.transforms);

        let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("Grass Draw Shader"),
            source: wgpu::ShaderSource::Wgsl(include_str!("grass.wgsl").into()),
        });
        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("Grass Draw Pipeline Layout"),
            bind_group_layouts: &[texture_layout, camera_layout, &transforms_layout],
            push_constant_ranges: &[],
        });
        let pipeline = device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
            label: Some("Grass Draw Pipeline"),
            layout: Some(&pipeline_layout),
            vertex: wgpu::VertexState {
                module: &shader,
                entry_point: "vs_main",
                buffers: &[ModelVertex::desc()],
            },
            primitive: wgpu::PrimitiveState {
                topology: wgpu::PrimitiveTopology::TriangleList,
                strip_index_format: None,
                front_face: wgpu::FrontFace::Ccw,
                // Blades are visible from both sides.
                cull_mode: None,
                unclipped_depth: false,
                polygon_mode: wgpu::PolygonMode::Fill,
                conservative: false,
            },
            depth_stencil: Some(wgpu::DepthStencilState {
                format: Texture::DEPTH_FORMAT,
                depth_write_enabled: true,
                depth_compare: wgpu::CompareFunction::Less,
                stencil: wgpu::StencilState::default(),
                bias: wgpu::DepthBiasState::default(),
            }),
            multisample: wgpu::MultisampleState {
                count: 1,
                mask: !0,
                alpha_to_coverage_enabled: false,
            },
            fragment: Some(wgpu::FragmentState {
                module: &shader,
                entry_point: "fs_main",
                targets: &[Some(wgpu::ColorTargetState {
                    format: color_format,
                    blend: Some(wgpu::BlendState::REPLACE),
                    write_mask: wgpu::ColorWrites::ALL,
                })],
            }),
            multiview: None,
        });

        Ok(Self {
            store,
            partitioner,
            near,
            far,
            pipeline,
            released: false,
        })
    }

    pub fn encode_frame(
        &self,
        queue: &wgpu::Queue,
        encoder: &mut wgpu::CommandEncoder,
        viewer: Option<&Point3<f32>>,
        config: &GrassConfig,
    ) {
        if self.released || self.store.is_empty() {
            return;
        }
        self.partitioner
            .encode(queue, encoder, viewer, config, self.store.len());
        self.partitioner
            .copy_counts(encoder, &self.near.args, &self.far.args);
    }

    /// Near/high first, then far/low. A bucket whose count landed at zero is
    /// a no-op draw on the device.
    pub fn draw<'a>(
        &'a self,
        render_pass: &mut wgpu::RenderPass<'a>,
        high_model: &'a Model,
        low_model: &'a Model,
        camera_bind_group: &'a wgpu::BindGroup,
    ) {
        if self.released {
            return;
        }
        render_pass.set_pipeline(&self.pipeline);
        for (bucket, model) in [(&self.near, high_model), (&self.far, low_model)] {
            let mesh = &model.meshes[0];
            let material = &model.materials[mesh.material];
            render_pass.set_bind_group(0, &material.bind_group, &[]);
            render_pass.set_bind_group(1, camera_bind_group, &[]);
            render_pass.set_bind_group(2, &bucket.bind_group, &[]);
            render_pass.set_vertex_buffer(0, mesh.vertex_buffer.slice(..));
            render_pass.set_index_buffer(mesh.index_buffer.slice(..), wgpu::IndexFormat::Uint32);
            render_pass.draw_indexed_indirect(&bucket.args, 0);
        }
    }

    /// Diagnostic path: copies the counters to a staging buffer and blocks
    /// until it maps. Reflects the most recently submitted partition pass.
    pub fn read_counts_blocking(
        &self,
        device: &wgpu::Device,
        queue: &wgpu::Queue,
    ) -> Option<(u32, u32)> {
        if self.released {
            return None;
        }
        let staging = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Grass Count Readback"),
            size: 2 * COUNTER_SIZE,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("Grass Count Readback Encoder"),
        });
        encoder.copy_buffer_to_buffer(&self.partitioner.counters, 0, &staging, 0, 2 * COUNTER_SIZE);
        queue.submit(std::iter::once(encoder.finish()));

        let (tx, rx) = std::sync::mpsc::channel();
        let slice = staging.slice(..);
        slice.map_async(wgpu::MapMode::Read, move |result| {
            tx.send(result).ok();
        });
        device.poll(wgpu::Maintain::Wait);

        match rx.recv() {
            Ok(Ok(())) => {
                let data = slice.get_mapped_range();
                let counts: &[u32] = bytemuck::cast_slice(&data);
                let out = (counts[0], counts[1]);
                drop(data);
                staging.unmap();
                Some(out)
            }
            _ => {
                log::warn!("grass count readback failed");
                None
            }
        }
    }

    /// Destroys every device buffer. Calling again is a no-op.
    pub fn release(&mut self) {
        if self.released {
            return;
        }
        self.store.buffer.destroy();
        self.near.transforms.destroy();
        self.near.args.destroy();
        self.far.transforms.destroy();
        self.far.args.destroy();
        self.partitioner.params_buffer.destroy();
        self.partitioner.counters.destroy();
        self.released = true;
    }
}

impl Drop for GpuLod {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn draw_args_record_is_five_words() {
        assert_eq!(std::mem::size_of::<DrawArgs>(), 20);
    }

    #[test]
    fn instance_count_sits_at_the_copy_offset() {
        let args = DrawArgs {
            index_count: 1,
            instance_count: 7,
            first_index: 3,
            base_vertex: 4,
            first_instance: 5,
        };
        let bytes = bytemuck::bytes_of(&args);
        let lo = INSTANCE_COUNT_OFFSET as usize;
        assert_eq!(&bytes[lo..lo + 4], &7u32.to_le_bytes());
    }

    #[test]
    fn fresh_args_only_carry_mesh_geometry() {
        let args = DrawArgs::for_index_count(42);
        assert_eq!(args.index_count, 42);
        assert_eq!(args.instance_count, 0);
        assert_eq!(args.first_index, 0);
        assert_eq!(args.base_vertex, 0);
        assert_eq!(args.first_instance, 0);
    }

    #[test]
    fn params_block_matches_shader_layout() {
        assert_eq!(std::mem::size_of::<PartitionParams>(), 32);
    }

    #[test]
    fn params_without_viewer_collapse_the_threshold() {
        let config = GrassConfig::default();
        let params = PartitionParams::new(None, &config, 10);
        assert_eq!(params.lod_distance_sqr, 0.0);
        assert_eq!(params.instance_count, 10);
    }

    #[test]
    fn params_square_the_configured_distance() {
        let config = GrassConfig {
            lod_distance: 20.0,
            planar_distance: true,
            ..Default::default()
        };
        let viewer = Point3::new(1.0, 2.0, 3.0);
        let params = PartitionParams::new(Some(&viewer), &config, 4);
        assert_eq!(params.lod_distance_sqr, 400.0);
        assert_eq!(params.viewer_pos[0], 1.0);
        assert_eq!(params.viewer_pos[1], 2.0);
        assert_eq!(params.viewer_pos[2], 3.0);
        assert_eq!(params.planar, 1);
    }

    #[test]
    fn dispatch_covers_every_instance() {
        assert_eq!(workgroup_count(0), 1);
        assert_eq!(workgroup_count(1), 1);
        assert_eq!(workgroup_count(WORKGROUP_SIZE), 1);
        assert_eq!(workgroup_count(WORKGROUP_SIZE + 1), 2);
        assert_eq!(workgroup_count(1000), 16);
    }
}
