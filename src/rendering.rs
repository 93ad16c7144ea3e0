use std::f32::consts::{FRAC_PI_2, FRAC_PI_8, PI};
use std::time::Duration;

use anyhow::Result;
use imgui::{Condition, FontSource};
use imgui_wgpu::{Renderer, RendererConfig};
use nalgebra::{Matrix4, Point3, UnitQuaternion, Vector3};
use wgpu::util::DeviceExt;
use wgpu::BindGroupLayout;
use winit::{event::*, window::Window};

use self::camera::Camera;
use self::model::DrawModel;

use crate::grass::{GrassConfig, GrassSystem};
use crate::rendering::graphics::InstanceRaw;
use crate::rendering::model::{Model, Vertex};
use crate::rendering::texture::Texture;
use crate::resources;

use self::graphics::Instance;

pub mod graphics;
pub mod texture;

mod camera;
pub mod model;

#[repr(C)]
#[derive(Debug, Copy, Clone, bytemuck::Pod, bytemuck::Zeroable)]
struct CameraUniform {
    view_proj: [[f32; 4]; 4],
}

impl CameraUniform {
    fn new() -> Self {
        Self {
            view_proj: Matrix4::identity().into(),
        }
    }

    fn update_view_proj(&mut self, camera: &Camera, projection: &camera::Projection) {
        self.view_proj = (projection.calc_matrix() * camera.calc_matrix()).into();
    }
}

pub struct RenderingState {
    surface: wgpu::Surface,
    pub(crate) device: wgpu::Device,
    pub(crate) queue: wgpu::Queue,
    config: wgpu::SurfaceConfiguration,
    pub(crate) size: winit::dpi::PhysicalSize<u32>,
    render_pipeline: wgpu::RenderPipeline,
    camera: Camera,
    projection: camera::Projection,
    pub(crate) camera_controller: camera::CameraController,
    camera_uniform: CameraUniform,
    camera_buffer: wgpu::Buffer,
    camera_bind_group: wgpu::BindGroup,
    camera_bind_group_layout: BindGroupLayout,
    depth_texture: Texture,
    pub(crate) mouse_pressed: bool,
    pub(crate) imgui: imgui::Context,
    imgui_renderer: Renderer,
    pub(crate) imgui_winit_platform: imgui_winit_support::WinitPlatform,
    pub texture_bind_group_layout: BindGroupLayout,
    grass_config: GrassConfig,
    terrain: Option<Model>,
    terrain_instance_buffer: wgpu::Buffer,
    pub grass: Option<GrassSystem>,
    last_counts: Option<(u32, u32)>,
}

impl RenderingState {
    pub(crate) fn input(&mut self, event: &WindowEvent) -> bool {
        match event {
            WindowEvent::KeyboardInput {
                input:
                    KeyboardInput {
                        state,
                        virtual_keycode: Some(key),
                        ..
                    },
                ..
            } => self.camera_controller.process_keyboard(*key, *state),
            WindowEvent::MouseWheel { delta, .. } => {
                self.camera_controller.process_scroll(delta);
                true
            }
            WindowEvent::MouseInput {
                state,
                button: MouseButton::Right,
                ..
            } => {
                self.mouse_pressed = *state == ElementState::Pressed;
                true
            }
            _ => false,
        }
    }

    pub(crate) async fn new(window: &Window, grass_config: GrassConfig) -> Self {
        let size = window.inner_size();

        let instance = wgpu::Instance::new(wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            ..Default::default()
        });

        let surface = unsafe { instance.create_surface(window) }.unwrap();
        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptionsBase {
                power_preference: wgpu::PowerPreference::default(),
                force_fallback_adapter: false,
                compatible_surface: Some(&surface),
            })
            .await
            .unwrap();

        let (device, queue) = adapter
            .request_device(
                &wgpu::DeviceDescriptor {
                    label: None,
                    features: wgpu::Features::empty(),
                    limits: wgpu::Limits::default(),
                },
                None,
            )
            .await
            .unwrap();

        let config = wgpu::SurfaceConfiguration {
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT,
            format: wgpu::TextureFormat::Bgra8UnormSrgb,
            width: size.width,
            height: size.height,
            present_mode: wgpu::PresentMode::Fifo,
            alpha_mode: wgpu::CompositeAlphaMode::Auto,
            view_formats: vec![wgpu::TextureFormat::Bgra8UnormSrgb],
        };
        surface.configure(&device, &config);

        let camera = Camera::new(Point3::new(0.0, 2.5, 8.0), -FRAC_PI_2, -PI / 20.0);
        let projection =
            camera::Projection::new(config.width, config.height, FRAC_PI_8, 0.1, 200.0);
        let camera_controller = camera::CameraController::new(4.0, 0.4);
        let mut camera_uniform = CameraUniform::new();
        camera_uniform.update_view_proj(&camera, &projection);

        let camera_buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("Camera Buffer"),
            contents: bytemuck::cast_slice(&[camera_uniform]),
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
        });

        let camera_bind_group_layout =
            device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: Some("camera_bind_group_layout"),
                entries: &[wgpu::BindGroupLayoutEntry {
                    binding: 0,
                    visibility: wgpu::ShaderStages::VERTEX,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Uniform,
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                }],
            });

        let camera_bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("camera_bind_group"),
            layout: &camera_bind_group_layout,
            entries: &[wgpu::BindGroupEntry {
                binding: 0,
                resource: camera_buffer.as_entire_binding(),
            }],
        });

        let texture_bind_group_layout =
            device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: Some("texture_bind_group_layout"),
                entries: &[
                    wgpu::BindGroupLayoutEntry {
                        binding: 0,
                        visibility: wgpu::ShaderStages::FRAGMENT,
                        ty: wgpu::BindingType::Texture {
                            sample_type: wgpu::TextureSampleType::Float { filterable: true },
                            view_dimension: wgpu::TextureViewDimension::D2,
                            multisampled: false,
                        },
                        count: None,
                    },
                    wgpu::BindGroupLayoutEntry {
                        binding: 1,
                        visibility: wgpu::ShaderStages::FRAGMENT,
                        ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering),
                        count: None,
                    },
                ],
            });

        let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("Shader"),
            source: wgpu::ShaderSource::Wgsl(include_str!("shader.wgsl").into()),
        });

        let depth_texture = Texture::create_depth_texture(&device, &config, "depth_texture");

        let render_pipeline_layout =
            device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: Some("Render Pipeline Layout"),
                bind_group_layouts: &[&texture_bind_group_layout, &camera_bind_group_layout],
                push_constant_ranges: &[],
            });

        let render_pipeline = device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
            label: Some("Render Pipeline"),
            layout: Some(&render_pipeline_layout),
            vertex: wgpu::VertexState {
                module: &shader,
                entry_point: "vs_main",
                buffers: &[model::ModelVertex::desc(), InstanceRaw::desc()],
            },
            primitive: wgpu::PrimitiveState {
                topology: wgpu::PrimitiveTopology::TriangleList,
                strip_index_format: None,
                front_face: wgpu::FrontFace::Ccw,
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
                    format: config.format,
                    blend: Some(wgpu::BlendState::REPLACE),
                    write_mask: wgpu::ColorWrites::ALL,
                })],
            }),
            multiview: None,
        });

        // imGUI
        let mut imgui = imgui::Context::create();
        let mut platform = imgui_winit_support::WinitPlatform::init(&mut imgui);
        platform.attach_window(
            imgui.io_mut(),
            &window,
            imgui_winit_support::HiDpiMode::Default,
        );

        let font_size = (13.0 * window.scale_factor()) as f32;
        imgui.set_ini_filename(None);
        imgui.fonts().add_font(&[FontSource::DefaultFontData {
            config: Some(imgui::FontConfig {
                size_pixels: font_size,
                oversample_h: 1,
                pixel_snap_h: true,
                ..Default::default()
            }),
        }]);

        let renderer_config = RendererConfig {
            texture_format: config.format,
            ..Default::default()
        };

        let imgui_renderer = Renderer::new(&mut imgui, &device, &queue, renderer_config);

        // The terrain is one static instance at the origin.
        let terrain_instances = vec![Instance {
            position: Vector3::zeros(),
            rotation: UnitQuaternion::default(),
            scale: Vector3::repeat(1.0),
        }
        .to_raw()];

        let terrain_instance_buffer =
            device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("Terrain Instance Buffer"),
                contents: bytemuck::cast_slice(&terrain_instances),
                usage: wgpu::BufferUsages::VERTEX,
            });

        Self {
            surface,
            device,
            queue,
            config,
            size,
            render_pipeline,
            camera,
            projection,
            camera_controller,
            camera_uniform,
            camera_buffer,
            camera_bind_group,
            camera_bind_group_layout,
            depth_texture,
            mouse_pressed: false,
            texture_bind_group_layout,
            grass_config,
            terrain: None,
            terrain_instance_buffer,
            grass: None,
            last_counts: None,
            imgui,
            imgui_renderer,
            imgui_winit_platform: platform,
        }
    }

    /// Loads the terrain and both grass LOD meshes, then generates the
    /// placement and allocates the partition buffers. On failure the grass
    /// subsystem stays disabled and the rest of the app keeps running.
    pub async fn load_scene(&mut self, surface_file: &str) {
        if let Err(e) = self.try_load_scene(surface_file).await {
            log::error!("grass subsystem disabled: {:#}", e);
        }
    }

    async fn try_load_scene(&mut self, surface_file: &str) -> Result<()> {
        let terrain = resources::load_model(
            surface_file,
            &self.device,
            &self.queue,
            &self.texture_bind_group_layout,
        )
        .await?;
        let surface_geometry = resources::load_surface(surface_file).await?;

        let high_model = resources::load_model(
            "grass_high.obj",
            &self.device,
            &self.queue,
            &self.texture_bind_group_layout,
        )
        .await?;
        let low_model = resources::load_model(
            "grass_low.obj",
            &self.device,
            &self.queue,
            &self.texture_bind_group_layout,
        )
        .await?;

        let grass = GrassSystem::new(
            &self.device,
            self.grass_config.clone(),
            &surface_geometry,
            &Matrix4::identity(),
            high_model,
            low_model,
            &self.texture_bind_group_layout,
            &self.camera_bind_group_layout,
            self.config.format,
        )?;

        self.terrain = Some(terrain);
        self.grass = Some(grass);
        Ok(())
    }

    pub(crate) fn render(
        &mut self,
        dt: Duration,
        window: &Window,
    ) -> Result<(), wgpu::SurfaceError> {
        let output = self.surface.get_current_texture()?;
        let view = output
            .texture
            .create_view(&wgpu::TextureViewDescriptor::default());

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("Render Encoder"),
            });

        // Counter reset, partition dispatch and count copies go in front of
        // the render pass, so the indirect draws consume this frame's counts.
        if let Some(grass) = &self.grass {
            grass.encode_frame(&self.queue, &mut encoder, Some(&self.camera.position));
        }

        let cpu_batches = match &self.grass {
            Some(grass) if !grass.uses_gpu_lod() => {
                grass.build_batches(&self.device, Some(&self.camera.position))
            }
            _ => Vec::new(),
        };

        {
            let mut render_pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("Render Pass"),
                color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                    view: &view,
                    resolve_target: None,
                    ops: wgpu::Operations {
                        load: wgpu::LoadOp::Clear(wgpu::Color {
                            r: 0.1,
                            g: 0.15,
                            b: 0.25,
                            a: 1.0,
                        }),
                        store: true,
                    },
                })],
                depth_stencil_attachment: Some(wgpu::RenderPassDepthStencilAttachment {
                    view: &self.depth_texture.view,
                    depth_ops: Some(wgpu::Operations {
                        load: wgpu::LoadOp::Clear(1.0),
                        store: true,
                    }),
                    stencil_ops: None,
                }),
            });

            render_pass.set_pipeline(&self.render_pipeline);
            if let Some(terrain) = &self.terrain {
                render_pass.set_vertex_buffer(1, self.terrain_instance_buffer.slice(..));
                render_pass.draw_model_instanced(terrain, 0..1, &self.camera_bind_group);
            }

            if let Some(grass) = &self.grass {
                if grass.uses_gpu_lod() {
                    grass.draw_indirect(&mut render_pass, &self.camera_bind_group);
                } else {
                    for batch in &cpu_batches {
                        render_pass.set_vertex_buffer(1, batch.instance_buffer.slice(..));
                        render_pass.draw_model_instanced(
                            grass.model_for(batch.tier),
                            0..batch.instance_count,
                            &self.camera_bind_group,
                        );
                    }
                }
            }

            drop(render_pass);
        }
        {
            self.imgui.io_mut().update_delta_time(dt);

            self.imgui_winit_platform
                .prepare_frame(self.imgui.io_mut(), window)
                .expect("Failed to prepare frame");

            self.prepare_imgui(dt);
            let mut render_pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("imGUI Render Pass"),
                color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                    view: &view,
                    resolve_target: None,

                    ops: wgpu::Operations {
                        load: wgpu::LoadOp::Load,
                        store: true,
                    },
                })],
                depth_stencil_attachment: None,
            });
            self.imgui_renderer
                .render(
                    self.imgui.render(),
                    &self.queue,
                    &self.device,
                    &mut render_pass,
                )
                .expect("Could not render imgui");
        }

        self.queue.submit(std::iter::once(encoder.finish()));
        output.present();

        // Diagnostic only; stalls on a device round trip, so it stays off
        // unless explicitly enabled.
        if self.grass_config.debug_readback {
            if let Some(grass) = &self.grass {
                self.last_counts = grass.debug_counts(&self.device, &self.queue);
                if let Some((near, far)) = self.last_counts {
                    log::debug!("grass buckets: near {} far {}", near, far);
                }
            }
        }

        Ok(())
    }

    pub(crate) fn resize(&mut self, new_size: winit::dpi::PhysicalSize<u32>) {
        if new_size.width > 0 && new_size.height > 0 {
            self.size = new_size;
            self.config.width = new_size.width;
            self.config.height = new_size.height;
            self.surface.configure(&self.device, &self.config);
            self.depth_texture =
                Texture::create_depth_texture(&self.device, &self.config, "depth_texture");
            self.projection.resize(new_size.width, new_size.height);
        }
    }

    pub(crate) fn update(&mut self, dt: Duration) {
        self.camera_controller.update_camera(&mut self.camera, dt);
        self.camera_uniform
            .update_view_proj(&self.camera, &self.projection);
        self.queue.write_buffer(
            &self.camera_buffer,
            0,
            bytemuck::cast_slice(&[self.camera_uniform]),
        );
    }

    fn prepare_imgui(&mut self, dt: Duration) {
        let total = self
            .grass
            .as_ref()
            .map(|grass| grass.instance_count())
            .unwrap_or(0);
        let gpu_lod = self.grass.as_ref().map(|grass| grass.uses_gpu_lod());
        let counts = self.last_counts;

        let ui = self.imgui.frame();

        {
            let window = ui.window("Grass");
            window
                .size([300.0, 130.0], Condition::FirstUseEver)
                .build(|| {
                    ui.text(format!("Instances: {}", total));
                    match gpu_lod {
                        Some(true) => ui.text("Partition: compute"),
                        Some(false) => ui.text("Partition: host batching"),
                        None => ui.text("Partition: disabled"),
                    }
                    ui.separator();
                    match counts {
                        Some((near, far)) => {
                            ui.text(format!("Near bucket: {}", near));
                            ui.text(format!("Far bucket: {}", far));
                        }
                        None => ui.text("Bucket counts: readback off"),
                    }
                });

            let window = ui.window("Frame");

            window
                .size([300.0, 70.0], Condition::FirstUseEver)
                .position([0.0, 140.0], Condition::FirstUseEver)
                .build(|| {
                    ui.text(format!("FPS: {:.1}", 1.0 / dt.as_secs_f32()));
                });
        }
    }
}
