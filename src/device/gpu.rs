//! wgpu compute tracer.
//!
//! Acceleration structures are built by an inner [`SoftwareDevice`]; at
//! dispatch time its trees are flattened into storage buffers (re-uploaded
//! only when structures or objects changed) and traced by the
//! `trace-kernel` WGSL kernel into an `Rgba32Float` storage texture.
//!
//! ## Usage
//! ```ignore
//! let device = GpuDevice::new()?;
//! let mut renderer = Renderer::new(config, device)?;
//! ```

use std::collections::HashMap;

use bytemuck::Pod;
use trace_kernel::{BvhNode, GpuInstance, GpuMaterial, GpuTriangle, TraceUniform, SHADER_SOURCE, WORKGROUP_SIZE};
use wgpu::util::DeviceExt;

use super::{ObjectDesc, SoftwareDevice, TraceBackend};
use crate::accel::{AccelBackend, AccelHandle, BlasGeometry, BuildFlags, DeviceAddress, InstanceRecord};
use crate::output::{OutputImage, PixelFormat};
use crate::util::{Error, Result};

/// Bytes per texel of the output texture.
const TEXEL_BYTES: u32 = 16;

/// Trees of one top-level structure laid out for the kernel.
#[derive(Debug, Default)]
struct FlatScene {
    blas_nodes: Vec<BvhNode>,
    /// In bottom-level leaf order; leaves index this directly.
    triangles: Vec<GpuTriangle>,
    tlas_nodes: Vec<BvhNode>,
    /// In top-level leaf order.
    instances: Vec<GpuInstance>,
    materials: Vec<GpuMaterial>,
}

impl FlatScene {
    fn build(soft: &SoftwareDevice, tlas: AccelHandle) -> Result<Self> {
        let top = soft
            .top(tlas)
            .ok_or_else(|| Error::device("dispatch_rays", format!("{:?} is not a top-level structure", tlas)))?;
        let objects = soft.objects();
        let mut flat = FlatScene::default();

        let mut material_base = Vec::with_capacity(objects.len());
        for obj in objects {
            material_base.push(flat.materials.len() as u32);
            flat.materials.extend_from_slice(&obj.materials);
        }

        let mut roots: HashMap<AccelHandle, u32> = HashMap::new();
        for &i in &top.active {
            let inst = &top.instances[i as usize];
            if roots.contains_key(&inst.blas) {
                continue;
            }
            let blas = soft.bottom(inst.blas).ok_or_else(|| {
                Error::device("dispatch_rays", format!("instance {} references a destroyed bottom-level", i))
            })?;
            let obj = object(objects, inst.custom_index)?;

            let node_base = flat.blas_nodes.len() as u32;
            let tri_base = flat.triangles.len() as u32;
            for &prim in &blas.bvh.prim_indices {
                let [a, b, c] = blas.triangles[prim as usize];
                let material = obj.material_indices.get(prim as usize).copied().ok_or_else(|| {
                    Error::device(
                        "dispatch_rays",
                        format!("object {} has no material for triangle {}", inst.custom_index, prim),
                    )
                })?;
                flat.triangles.push(GpuTriangle::new(a, b, c, material));
            }
            flat.blas_nodes.extend(blas.bvh.nodes.iter().map(|n| {
                let mut n = *n;
                n.left_or_first += if n.is_leaf() { tri_base } else { node_base };
                n
            }));
            roots.insert(inst.blas, node_base);
        }

        flat.tlas_nodes = top.bvh.nodes.clone();
        for &slot in &top.bvh.prim_indices {
            let inst = &top.instances[top.active[slot as usize] as usize];
            object(objects, inst.custom_index)?;
            flat.instances.push(GpuInstance::new(
                &inst.object_to_world,
                roots[&inst.blas],
                material_base[inst.custom_index as usize],
                inst.custom_index,
                inst.mask as u32,
            ));
        }
        Ok(flat)
    }
}

fn object(objects: &[ObjectDesc], custom_index: u32) -> Result<&ObjectDesc> {
    objects.get(custom_index as usize).ok_or_else(|| {
        Error::device(
            "dispatch_rays",
            format!("custom index {} outside object table of {}", custom_index, objects.len()),
        )
    })
}

struct SceneBuffers {
    revision: u64,
    tlas: AccelHandle,
    tlas_node_count: u32,
    instance_count: u32,
    blas_nodes: wgpu::Buffer,
    triangles: wgpu::Buffer,
    tlas_nodes: wgpu::Buffer,
    instances: wgpu::Buffer,
    materials: wgpu::Buffer,
}

struct OutputTexture {
    texture: wgpu::Texture,
    view: wgpu::TextureView,
    width: u32,
    height: u32,
}

/// Device tracing on the GPU through wgpu compute.
pub struct GpuDevice {
    soft: SoftwareDevice,
    device: wgpu::Device,
    queue: wgpu::Queue,
    pipeline: wgpu::ComputePipeline,
    bind_group_layout: wgpu::BindGroupLayout,
    uniform_buffer: wgpu::Buffer,
    uniform: TraceUniform,
    output: Option<OutputTexture>,
    scene: Option<SceneBuffers>,
    dispatches: u64,
}

impl GpuDevice {
    /// Open the default adapter and compile the kernel. Blocks.
    pub fn new() -> Result<Self> {
        futures::executor::block_on(Self::new_async())
    }

    async fn new_async() -> Result<Self> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor::default());
        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                compatible_surface: None,
                force_fallback_adapter: false,
            })
            .await
            .map_err(|e| Error::device("request_adapter", e.to_string()))?;
        let (device, queue) = adapter
            .request_device(&wgpu::DeviceDescriptor {
                label: Some("headless_rt_device"),
                ..Default::default()
            })
            .await
            .map_err(|e| Error::device("request_device", e.to_string()))?;
        tracing::info!(adapter = %adapter.get_info().name, "GPU device ready");
        Ok(Self::with_device(device, queue))
    }

    /// Use an existing wgpu device.
    pub fn with_device(device: wgpu::Device, queue: wgpu::Queue) -> Self {
        let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("trace_shader"),
            source: wgpu::ShaderSource::Wgsl(SHADER_SOURCE.into()),
        });

        let storage = |binding: u32| wgpu::BindGroupLayoutEntry {
            binding,
            visibility: wgpu::ShaderStages::COMPUTE,
            ty: wgpu::BindingType::Buffer {
                ty: wgpu::BufferBindingType::Storage { read_only: true },
                has_dynamic_offset: false,
                min_binding_size: None,
            },
            count: None,
        };
        let bind_group_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("trace_bind_group_layout"),
            entries: &[
                // @binding(0..=4) scene storage
                storage(0),
                storage(1),
                storage(2),
                storage(3),
                storage(4),
                // @binding(5) params uniform
                wgpu::BindGroupLayoutEntry {
                    binding: 5,
                    visibility: wgpu::ShaderStages::COMPUTE,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Uniform,
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                },
                // @binding(6) output storage texture
                wgpu::BindGroupLayoutEntry {
                    binding: 6,
                    visibility: wgpu::ShaderStages::COMPUTE,
                    ty: wgpu::BindingType::StorageTexture {
                        access: wgpu::StorageTextureAccess::WriteOnly,
                        format: wgpu::TextureFormat::Rgba32Float,
                        view_dimension: wgpu::TextureViewDimension::D2,
                    },
                    count: None,
                },
            ],
        });

        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("trace_pipeline_layout"),
            bind_group_layouts: &[&bind_group_layout],
            push_constant_ranges: &[],
        });

        let pipeline = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label: Some("trace_pipeline"),
            layout: Some(&pipeline_layout),
            module: &shader,
            entry_point: Some("main"),
            compilation_options: Default::default(),
            cache: None,
        });

        let uniform_buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("trace_params"),
            size: std::mem::size_of::<TraceUniform>() as u64,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        Self {
            soft: SoftwareDevice::new(),
            device,
            queue,
            pipeline,
            bind_group_layout,
            uniform_buffer,
            uniform: TraceUniform::default(),
            output: None,
            scene: None,
            dispatches: 0,
        }
    }

    /// Builds, updates and dispatches issued so far.
    pub fn submissions(&self) -> u64 {
        self.soft.submissions() + self.dispatches
    }

    /// Storage buffer from a slice; wgpu rejects empty buffers, so an
    /// empty slice gets one zeroed element.
    fn storage_buffer<T: Pod>(&self, label: &str, data: &[T]) -> wgpu::Buffer {
        let placeholder = [T::zeroed()];
        let data = if data.is_empty() { &placeholder[..] } else { data };
        self.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some(label),
            contents: bytemuck::cast_slice(data),
            usage: wgpu::BufferUsages::STORAGE,
        })
    }

    /// Re-upload the flattened scene when structures or objects changed.
    fn sync_scene(&mut self, tlas: AccelHandle) -> Result<()> {
        let revision = self.soft.revision();
        if matches!(&self.scene, Some(s) if s.revision == revision && s.tlas == tlas) {
            return Ok(());
        }
        let flat = FlatScene::build(&self.soft, tlas)?;
        tracing::debug!(
            blas_nodes = flat.blas_nodes.len(),
            triangles = flat.triangles.len(),
            instances = flat.instances.len(),
            "scene buffers uploaded"
        );
        self.scene = Some(SceneBuffers {
            revision,
            tlas,
            tlas_node_count: if flat.instances.is_empty() { 0 } else { flat.tlas_nodes.len() as u32 },
            instance_count: flat.instances.len() as u32,
            blas_nodes: self.storage_buffer("trace_blas_nodes", &flat.blas_nodes),
            triangles: self.storage_buffer("trace_triangles", &flat.triangles),
            tlas_nodes: self.storage_buffer("trace_tlas_nodes", &flat.tlas_nodes),
            instances: self.storage_buffer("trace_instances", &flat.instances),
            materials: self.storage_buffer("trace_materials", &flat.materials),
        });
        Ok(())
    }
}

impl AccelBackend for GpuDevice {
    fn build_bottom_level(&mut self, geometry: &BlasGeometry<'_>, flags: BuildFlags) -> Result<AccelHandle> {
        self.soft.build_bottom_level(geometry, flags)
    }

    fn update_bottom_level(&mut self, handle: AccelHandle, geometry: &BlasGeometry<'_>) -> Result<()> {
        self.soft.update_bottom_level(handle, geometry)
    }

    fn build_top_level(&mut self, instances: &[InstanceRecord], flags: BuildFlags) -> Result<AccelHandle> {
        self.soft.build_top_level(instances, flags)
    }

    fn update_top_level(&mut self, handle: AccelHandle, instances: &[InstanceRecord]) -> Result<()> {
        self.soft.update_top_level(handle, instances)
    }

    fn device_address(&self, handle: AccelHandle) -> Result<DeviceAddress> {
        self.soft.device_address(handle)
    }

    fn destroy(&mut self, handle: AccelHandle) {
        self.soft.destroy(handle)
    }
}

impl TraceBackend for GpuDevice {
    fn allocate_output(&mut self, width: u32, height: u32) -> Result<()> {
        if width == 0 || height == 0 {
            return Err(Error::precondition(format!("invalid output size {}x{}", width, height)));
        }
        let texture = self.device.create_texture(&wgpu::TextureDescriptor {
            label: Some("trace_output"),
            size: wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: wgpu::TextureFormat::Rgba32Float,
            usage: wgpu::TextureUsages::STORAGE_BINDING | wgpu::TextureUsages::COPY_SRC,
            view_formats: &[],
        });
        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
        self.output = Some(OutputTexture {
            texture,
            view,
            width,
            height,
        });
        tracing::debug!(width, height, "output texture allocated");
        Ok(())
    }

    fn output_size(&self) -> Option<(u32, u32)> {
        self.output.as_ref().map(|o| (o.width, o.height))
    }

    fn upload_objects(&mut self, objects: &[ObjectDesc]) -> Result<()> {
        self.soft.upload_objects(objects)
    }

    fn update_uniform(&mut self, uniform: &TraceUniform) -> Result<()> {
        self.uniform = *uniform;
        Ok(())
    }

    #[tracing::instrument(skip_all, fields(width, height))]
    fn dispatch_rays(&mut self, tlas: AccelHandle, width: u32, height: u32) -> Result<()> {
        match self.output_size() {
            Some(size) if size == (width, height) => {}
            Some((w, h)) => {
                return Err(Error::device(
                    "dispatch_rays",
                    format!("dispatch {}x{} does not match output texture {}x{}", width, height, w, h),
                ))
            }
            None => return Err(Error::device("dispatch_rays", "no output texture allocated")),
        }
        self.sync_scene(tlas)?;
        let (Some(scene), Some(output)) = (&self.scene, &self.output) else {
            return Err(Error::device("dispatch_rays", "scene buffers missing"));
        };

        let mut uniform = self.uniform;
        uniform.dims = [width, height, scene.tlas_node_count, scene.instance_count];
        self.queue
            .write_buffer(&self.uniform_buffer, 0, bytemuck::bytes_of(&uniform));

        let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("trace_bind_group"),
            layout: &self.bind_group_layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: scene.blas_nodes.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: scene.triangles.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: scene.tlas_nodes.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 3,
                    resource: scene.instances.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 4,
                    resource: scene.materials.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 5,
                    resource: self.uniform_buffer.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 6,
                    resource: wgpu::BindingResource::TextureView(&output.view),
                },
            ],
        });

        let mut encoder = self.device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("trace_encoder"),
        });
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("trace_pass"),
                timestamp_writes: None,
            });
            pass.set_pipeline(&self.pipeline);
            pass.set_bind_group(0, &bind_group, &[]);
            pass.dispatch_workgroups(width.div_ceil(WORKGROUP_SIZE), height.div_ceil(WORKGROUP_SIZE), 1);
        }
        self.queue.submit(Some(encoder.finish()));
        self.device
            .poll(wgpu::PollType::wait_indefinitely())
            .map_err(|e| Error::device("dispatch_rays", e.to_string()))?;
        self.dispatches += 1;
        Ok(())
    }

    fn read_output(&mut self) -> Result<OutputImage> {
        let output = self
            .output
            .as_ref()
            .ok_or_else(|| Error::device("read_output", "no output texture allocated"))?;
        let (width, height) = (output.width, output.height);

        // bytes_per_row must be aligned to 256 (COPY_BYTES_PER_ROW_ALIGNMENT)
        let tight_bpr = width * TEXEL_BYTES;
        let padded_bpr = tight_bpr.div_ceil(wgpu::COPY_BYTES_PER_ROW_ALIGNMENT) * wgpu::COPY_BYTES_PER_ROW_ALIGNMENT;
        let staging = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("trace_readback"),
            size: padded_bpr as u64 * height as u64,
            usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
            mapped_at_creation: false,
        });

        let mut encoder = self.device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("trace_readback_encoder"),
        });
        encoder.copy_texture_to_buffer(
            wgpu::TexelCopyTextureInfo {
                texture: &output.texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            wgpu::TexelCopyBufferInfo {
                buffer: &staging,
                layout: wgpu::TexelCopyBufferLayout {
                    offset: 0,
                    bytes_per_row: Some(padded_bpr),
                    rows_per_image: Some(height),
                },
            },
            wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
        );
        self.queue.submit(Some(encoder.finish()));

        let slice = staging.slice(..);
        let (tx, rx) = futures::channel::oneshot::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = tx.send(result);
        });
        self.device
            .poll(wgpu::PollType::wait_indefinitely())
            .map_err(|e| Error::device("read_output", e.to_string()))?;
        futures::executor::block_on(rx)
            .map_err(|_| Error::device("read_output", "map_async callback dropped"))?
            .map_err(|e| Error::device("read_output", e.to_string()))?;

        let mut data = Vec::with_capacity((width * height * 4) as usize);
        {
            let mapped = slice.get_mapped_range();
            // Depad rows
            for row in mapped.chunks_exact(padded_bpr as usize) {
                data.extend(bytemuck::pod_collect_to_vec::<u8, f32>(&row[..tight_bpr as usize]));
            }
        }
        staging.unmap();
        OutputImage::from_data(width, height, PixelFormat::Rgba32Float, data)
    }
}
