//! GPU compositing backend on top of wgpu.
//!
//! Each output gets an offscreen render target; paint operations are
//! recorded into the frame and encoded as one render pass on submission,
//! with scissor rectangles providing the damage clipping.

use std::collections::HashMap;
use std::rc::Rc;

use anyhow::Context as _;
use glam::{Mat4, Vec3};
use wgpu::util::DeviceExt;

use crate::backend::{
    buffer_to_rgba, Color, ImportError, ReleaseQueue, SubmitError, Submission, Texture, TextureId,
};
use crate::buffer::BufferSource;
use crate::output::Output;
use crate::utils::geometry::{Buffer, Physical, Rect, Size};
use crate::utils::region::Region;

const TARGET_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Rgba8Unorm;

#[repr(C)]
#[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
struct QuadUniforms {
    transform: [[f32; 4]; 4],
    src_rect: [f32; 4],
    color: [f32; 4],
    opacity: f32,
    textured: f32,
    _pad: [f32; 2],
}

struct GpuTexture {
    texture: wgpu::Texture,
    view: wgpu::TextureView,
    size: Size<i32, Buffer>,
}

struct GpuTarget {
    view: wgpu::TextureView,
    size: Size<i32, Physical>,
}

pub struct GpuBackend {
    device: wgpu::Device,
    queue: wgpu::Queue,
    pipeline: wgpu::RenderPipeline,
    bind_group_layout: wgpu::BindGroupLayout,
    sampler: wgpu::Sampler,
    /// Bound for untextured draws; shaders always need something to sample.
    dummy: GpuTexture,
    textures: HashMap<TextureId, GpuTexture>,
    releases: ReleaseQueue,
    next_texture_id: u64,
    targets: HashMap<Output, GpuTarget>,
    imported: u64,
    released: u64,
    fail_submissions: u32,
    sequence: u64,
}

impl GpuBackend {
    pub fn new() -> anyhow::Result<Self> {
        let instance = wgpu::Instance::new(wgpu::InstanceDescriptor::default());

        let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: wgpu::PowerPreference::HighPerformance,
            force_fallback_adapter: false,
            compatible_surface: None,
        }))
        .context("no suitable GPU adapter")?;

        let (device, queue) = pollster::block_on(adapter.request_device(
            &wgpu::DeviceDescriptor {
                label: Some("scrim device"),
                required_features: wgpu::Features::empty(),
                required_limits: wgpu::Limits::downlevel_defaults(),
                memory_hints: wgpu::MemoryHints::default(),
            },
            None,
        ))
        .context("error requesting GPU device")?;

        let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("quad shader"),
            source: wgpu::ShaderSource::Wgsl(include_str!("quad.wgsl").into()),
        });

        let bind_group_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("quad bind group layout"),
            entries: &[
                wgpu::BindGroupLayoutEntry {
                    binding: 0,
                    visibility: wgpu::ShaderStages::VERTEX_FRAGMENT,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Uniform,
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                },
                wgpu::BindGroupLayoutEntry {
                    binding: 1,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Texture {
                        sample_type: wgpu::TextureSampleType::Float { filterable: true },
                        view_dimension: wgpu::TextureViewDimension::D2,
                        multisampled: false,
                    },
                    count: None,
                },
                wgpu::BindGroupLayoutEntry {
                    binding: 2,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering),
                    count: None,
                },
            ],
        });

        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("quad pipeline layout"),
            bind_group_layouts: &[&bind_group_layout],
            push_constant_ranges: &[],
        });

        let pipeline = device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
            label: Some("quad pipeline"),
            layout: Some(&pipeline_layout),
            vertex: wgpu::VertexState {
                module: &shader,
                entry_point: Some("vs_main"),
                buffers: &[],
                compilation_options: wgpu::PipelineCompilationOptions::default(),
            },
            fragment: Some(wgpu::FragmentState {
                module: &shader,
                entry_point: Some("fs_main"),
                targets: &[Some(wgpu::ColorTargetState {
                    format: TARGET_FORMAT,
                    blend: Some(wgpu::BlendState::PREMULTIPLIED_ALPHA_BLENDING),
                    write_mask: wgpu::ColorWrites::ALL,
                })],
                compilation_options: wgpu::PipelineCompilationOptions::default(),
            }),
            primitive: wgpu::PrimitiveState::default(),
            depth_stencil: None,
            multisample: wgpu::MultisampleState::default(),
            multiview: None,
            cache: None,
        });

        let sampler = device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("quad sampler"),
            mag_filter: wgpu::FilterMode::Linear,
            min_filter: wgpu::FilterMode::Linear,
            ..Default::default()
        });

        let dummy = upload_texture(&device, &queue, Size::new(1, 1), &[0xff; 4]);

        Ok(Self {
            device,
            queue,
            pipeline,
            bind_group_layout,
            sampler,
            dummy,
            textures: HashMap::new(),
            releases: Rc::new(std::cell::RefCell::new(Vec::new())),
            next_texture_id: 1,
            targets: HashMap::new(),
            imported: 0,
            released: 0,
            fail_submissions: 0,
            sequence: 0,
        })
    }

    pub fn add_output(&mut self, output: &Output) {
        let size = output.physical_size();
        let target = self.create_target(size);
        self.targets.insert(output.clone(), target);
    }

    pub fn remove_output(&mut self, output: &Output) {
        self.targets.remove(output);
    }

    fn create_target(&self, size: Size<i32, Physical>) -> GpuTarget {
        let texture = self.device.create_texture(&wgpu::TextureDescriptor {
            label: Some("output target"),
            size: wgpu::Extent3d {
                width: size.w.max(1) as u32,
                height: size.h.max(1) as u32,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: TARGET_FORMAT,
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT | wgpu::TextureUsages::COPY_SRC,
            view_formats: &[],
        });
        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());

        // Start from a defined (black) frame.
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("target clear"),
            });
        {
            let _pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("target clear"),
                color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                    view: &view,
                    resolve_target: None,
                    ops: wgpu::Operations {
                        load: wgpu::LoadOp::Clear(wgpu::Color::BLACK),
                        store: wgpu::StoreOp::Store,
                    },
                })],
                depth_stencil_attachment: None,
                timestamp_writes: None,
                occlusion_query_set: None,
            });
        }
        self.queue.submit(Some(encoder.finish()));

        GpuTarget { view, size }
    }

    pub fn import_buffer(
        &mut self,
        source: &BufferSource,
        reuse: Option<&Texture>,
    ) -> Result<Texture, ImportError> {
        self.collect_released();

        let rgba = buffer_to_rgba(source)?;
        let size = source.size();
        let format = source.format();

        if let Some(reuse) = reuse {
            if reuse.size() == size && reuse.format() == format {
                if let Some(existing) = self.textures.get(&reuse.id()) {
                    write_pixels(&self.queue, &existing.texture, size, &rgba);
                    return Ok(reuse.clone());
                }
            }
        }

        let id = TextureId::from_raw(self.next_texture_id);
        self.next_texture_id += 1;

        let texture = upload_texture(&self.device, &self.queue, size, &rgba);
        self.textures.insert(id, texture);
        self.imported += 1;

        Ok(Texture::new(id, size, format, self.releases.clone()))
    }

    pub fn begin_frame(&mut self, output: &Output) -> Result<GpuFrame, SubmitError> {
        self.collect_released();

        if !self.targets.contains_key(output) {
            return Err(SubmitError::OutputLost);
        }

        let size = output.physical_size();
        let stale = self.targets[output].size != size;
        if stale {
            let target = self.create_target(size);
            self.targets.insert(output.clone(), target);
        }

        Ok(GpuFrame {
            size,
            ops: Vec::new(),
        })
    }

    pub fn submit_frame(
        &mut self,
        output: &Output,
        frame: GpuFrame,
    ) -> Result<Submission, SubmitError> {
        let target = self.targets.get(output).ok_or(SubmitError::OutputLost)?;

        if self.fail_submissions > 0 {
            self.fail_submissions -= 1;
            return Err(SubmitError::CommitFailed);
        }
        if frame.size != target.size {
            return Err(SubmitError::CommitFailed);
        }

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("frame encoder"),
            });

        {
            let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("composite pass"),
                color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                    view: &target.view,
                    resolve_target: None,
                    ops: wgpu::Operations {
                        load: wgpu::LoadOp::Load,
                        store: wgpu::StoreOp::Store,
                    },
                })],
                depth_stencil_attachment: None,
                timestamp_writes: None,
                occlusion_query_set: None,
            });

            pass.set_pipeline(&self.pipeline);

            for op in &frame.ops {
                let (view, uniforms) = match &op.kind {
                    OpKind::Textured { texture, opacity } => {
                        let Some(stored) = self.textures.get(texture) else {
                            // Sampling a released texture paints nothing.
                            warn!("draw with a released texture {texture:?}");
                            continue;
                        };
                        let tex_size = stored.size.to_f64();
                        let src = [
                            (op.src.loc.x / tex_size.w) as f32,
                            (op.src.loc.y / tex_size.h) as f32,
                            (op.src.size.w / tex_size.w) as f32,
                            (op.src.size.h / tex_size.h) as f32,
                        ];
                        (
                            &stored.view,
                            QuadUniforms {
                                transform: quad_transform(frame.size, op.dst),
                                src_rect: src,
                                color: [0.; 4],
                                opacity: *opacity,
                                textured: 1.,
                                _pad: [0.; 2],
                            },
                        )
                    }
                    OpKind::Fill { color } => (
                        &self.dummy.view,
                        QuadUniforms {
                            transform: quad_transform(frame.size, op.dst),
                            src_rect: [0., 0., 1., 1.],
                            color: *color,
                            opacity: 1.,
                            textured: 0.,
                            _pad: [0.; 2],
                        },
                    ),
                };

                let buffer = self
                    .device
                    .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                        label: Some("quad uniforms"),
                        contents: bytemuck::bytes_of(&uniforms),
                        usage: wgpu::BufferUsages::UNIFORM,
                    });

                let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
                    label: Some("quad bind group"),
                    layout: &self.bind_group_layout,
                    entries: &[
                        wgpu::BindGroupEntry {
                            binding: 0,
                            resource: buffer.as_entire_binding(),
                        },
                        wgpu::BindGroupEntry {
                            binding: 1,
                            resource: wgpu::BindingResource::TextureView(view),
                        },
                        wgpu::BindGroupEntry {
                            binding: 2,
                            resource: wgpu::BindingResource::Sampler(&self.sampler),
                        },
                    ],
                });

                pass.set_bind_group(0, &bind_group, &[]);

                let bounds = Rect::from_size(frame.size);
                for &clip in &op.clip {
                    let Some(clip) = clip.intersection(op.dst).and_then(|r| r.intersection(bounds))
                    else {
                        continue;
                    };
                    pass.set_scissor_rect(
                        clip.left() as u32,
                        clip.top() as u32,
                        clip.size.w as u32,
                        clip.size.h as u32,
                    );
                    pass.draw(0..6, 0..1);
                }
            }
        }

        self.queue.submit(Some(encoder.finish()));
        self.device.poll(wgpu::Maintain::Wait);

        self.sequence += 1;
        Ok(Submission {
            sequence: self.sequence,
        })
    }

    pub fn live_texture_count(&mut self) -> usize {
        self.collect_released();
        self.textures.len()
    }

    pub fn set_fail_frame_submissions(&mut self, count: u32) {
        self.fail_submissions = count;
    }

    pub fn texture_counters(&mut self) -> (u64, u64) {
        self.collect_released();
        (self.imported, self.released)
    }

    fn collect_released(&mut self) {
        let ids: Vec<_> = self.releases.borrow_mut().drain(..).collect();
        for id in ids {
            if self.textures.remove(&id).is_some() {
                self.released += 1;
            }
        }
    }
}

fn upload_texture(
    device: &wgpu::Device,
    queue: &wgpu::Queue,
    size: Size<i32, Buffer>,
    rgba: &[u8],
) -> GpuTexture {
    let texture = device.create_texture(&wgpu::TextureDescriptor {
        label: Some("client texture"),
        size: wgpu::Extent3d {
            width: size.w.max(1) as u32,
            height: size.h.max(1) as u32,
            depth_or_array_layers: 1,
        },
        mip_level_count: 1,
        sample_count: 1,
        dimension: wgpu::TextureDimension::D2,
        format: TARGET_FORMAT,
        usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
        view_formats: &[],
    });

    write_pixels(queue, &texture, size, rgba);

    let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
    GpuTexture {
        texture,
        view,
        size,
    }
}

fn write_pixels(queue: &wgpu::Queue, texture: &wgpu::Texture, size: Size<i32, Buffer>, rgba: &[u8]) {
    queue.write_texture(
        wgpu::ImageCopyTexture {
            texture,
            mip_level: 0,
            origin: wgpu::Origin3d::ZERO,
            aspect: wgpu::TextureAspect::All,
        },
        rgba,
        wgpu::ImageDataLayout {
            offset: 0,
            bytes_per_row: Some(size.w.max(1) as u32 * 4),
            rows_per_image: None,
        },
        wgpu::Extent3d {
            width: size.w.max(1) as u32,
            height: size.h.max(1) as u32,
            depth_or_array_layers: 1,
        },
    );
}

fn quad_transform(target: Size<i32, Physical>, dst: Rect<i32, Physical>) -> [[f32; 4]; 4] {
    let ortho = Mat4::orthographic_rh(0., target.w as f32, target.h as f32, 0., -1., 1.);
    let model = Mat4::from_translation(Vec3::new(dst.left() as f32, dst.top() as f32, 0.))
        * Mat4::from_scale(Vec3::new(dst.size.w as f32, dst.size.h as f32, 1.));
    (ortho * model).to_cols_array_2d()
}

// =============================================================================
// GpuFrame
// =============================================================================

enum OpKind {
    Textured { texture: TextureId, opacity: f32 },
    Fill { color: Color },
}

struct DrawOp {
    kind: OpKind,
    dst: Rect<i32, Physical>,
    src: Rect<f64, Buffer>,
    clip: Vec<Rect<i32, Physical>>,
}

pub struct GpuFrame {
    size: Size<i32, Physical>,
    ops: Vec<DrawOp>,
}

impl GpuFrame {
    pub fn fill(&mut self, color: Color, region: &Region<Physical>) {
        for &rect in region.rects() {
            self.ops.push(DrawOp {
                kind: OpKind::Fill { color },
                dst: rect,
                src: Rect::from_loc_and_size((0., 0.), (1., 1.)),
                clip: vec![rect],
            });
        }
    }

    pub fn draw_texture(
        &mut self,
        texture: &Texture,
        dst: Rect<i32, Physical>,
        src: Rect<f64, Buffer>,
        opacity: f64,
        clip: &Region<Physical>,
    ) {
        self.ops.push(DrawOp {
            kind: OpKind::Textured {
                texture: texture.id(),
                opacity: opacity.clamp(0., 1.) as f32,
            },
            dst,
            src,
            clip: clip.rects().to_vec(),
        });
    }
}
