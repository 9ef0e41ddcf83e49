// SPDX-License-Identifier: GPL-3.0-only

//! GPU-accelerated YUV_420_888 to RGBA conversion
//!
//! Uploads the three planes as storage buffers and runs one compute
//! invocation per destination pixel. The destination texture belongs to the
//! caller; the processor only caches its upload and readback buffers.

use crate::backends::camera::{FrameView, Resolution, TextureTransform};
use crate::gpu::wgpu;
use crate::shaders::gpu_processor::{
    CachedDimensions, compute_dispatch_size, padded_bytes_per_row, read_buffer_async,
    strip_row_padding,
};
use std::sync::Arc;
use tracing::debug;

/// WGSL source of the conversion kernel
pub const YUV_TO_RGBA_SHADER: &str = include_str!("yuv_to_rgba.wgsl");

const WORKGROUP_SIZE: u32 = 16;

/// Uniform buffer for shader parameters
#[repr(C)]
#[derive(Debug, Copy, Clone, bytemuck::Pod, bytemuck::Zeroable)]
struct YuvParams {
    src_width: u32,
    src_height: u32,
    dst_width: u32,
    dst_height: u32,
    y_row_stride: u32,
    uv_row_stride: u32,
    uv_pixel_stride: u32,
    y_len: u32,
    uv_len: u32,
    _pad: [u32; 3],
    transform: [f32; 16],
}

/// Storage buffer that grows on demand
struct PlaneBuffer {
    label: &'static str,
    buffer: Option<wgpu::Buffer>,
    capacity: u64,
}

impl PlaneBuffer {
    fn new(label: &'static str) -> Self {
        Self {
            label,
            buffer: None,
            capacity: 0,
        }
    }

    fn ensure(&mut self, device: &wgpu::Device, size: u64) {
        // Bindings need a non-zero size
        let size = size.max(4);
        if self.buffer.is_none() || self.capacity < size {
            self.buffer = Some(device.create_buffer(&wgpu::BufferDescriptor {
                label: Some(self.label),
                size,
                usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_DST,
                mapped_at_creation: false,
            }));
            self.capacity = size;
        }
    }
}

/// GPU processor for YUV to RGBA conversion
pub struct YuvConvertProcessor {
    device: Arc<wgpu::Device>,
    queue: Arc<wgpu::Queue>,
    pipeline: wgpu::ComputePipeline,
    bind_group_layout: wgpu::BindGroupLayout,
    uniform_buffer: wgpu::Buffer,
    planes: [PlaneBuffer; 3],
    upload: Vec<u8>,
    // Readback staging, sized for the last output
    cached_dims: CachedDimensions,
    staging_buffer: Option<wgpu::Buffer>,
}

impl YuvConvertProcessor {
    /// Compile the conversion pipeline on an existing device
    pub fn new(device: Arc<wgpu::Device>, queue: Arc<wgpu::Queue>) -> Self {
        let shader_module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("YUV to RGBA Shader"),
            source: wgpu::ShaderSource::Wgsl(YUV_TO_RGBA_SHADER.into()),
        });

        let storage_entry = |binding| wgpu::BindGroupLayoutEntry {
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
            label: Some("YUV Convert Bind Group Layout"),
            entries: &[
                // Params uniform
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
                // Y, U and V planes
                storage_entry(1),
                storage_entry(2),
                storage_entry(3),
                // Output RGBA texture
                wgpu::BindGroupLayoutEntry {
                    binding: 4,
                    visibility: wgpu::ShaderStages::COMPUTE,
                    ty: wgpu::BindingType::StorageTexture {
                        access: wgpu::StorageTextureAccess::WriteOnly,
                        format: wgpu::TextureFormat::Rgba8Unorm,
                        view_dimension: wgpu::TextureViewDimension::D2,
                    },
                    count: None,
                },
            ],
        });

        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("YUV Convert Pipeline Layout"),
            bind_group_layouts: &[&bind_group_layout],
            push_constant_ranges: &[],
        });

        let pipeline = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label: Some("YUV to RGBA Pipeline"),
            layout: Some(&pipeline_layout),
            module: &shader_module,
            entry_point: Some("main"),
            compilation_options: Default::default(),
            cache: None,
        });

        let uniform_buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("YUV Params Buffer"),
            size: std::mem::size_of::<YuvParams>() as u64,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        Self {
            device,
            queue,
            pipeline,
            bind_group_layout,
            uniform_buffer,
            planes: [
                PlaneBuffer::new("Y Plane Buffer"),
                PlaneBuffer::new("U Plane Buffer"),
                PlaneBuffer::new("V Plane Buffer"),
            ],
            upload: Vec::new(),
            cached_dims: CachedDimensions::default(),
            staging_buffer: None,
        }
    }

    /// Allocate an RGBA texture the processor can write into
    pub fn create_output_texture(&self, size: Resolution) -> wgpu::Texture {
        self.device.create_texture(&wgpu::TextureDescriptor {
            label: Some("RGBA Output Texture"),
            size: wgpu::Extent3d {
                width: size.width.max(1),
                height: size.height.max(1),
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: wgpu::TextureFormat::Rgba8Unorm,
            usage: wgpu::TextureUsages::STORAGE_BINDING
                | wgpu::TextureUsages::COPY_SRC
                | wgpu::TextureUsages::TEXTURE_BINDING,
            view_formats: &[],
        })
    }

    fn ensure_staging(&mut self, width: u32, height: u32) {
        if !self.cached_dims.needs_update(width, height) && self.staging_buffer.is_some() {
            return;
        }
        debug!(width, height, "Allocating RGBA staging buffer");
        let size = padded_bytes_per_row(width) as u64 * height as u64;
        self.staging_buffer = Some(self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("RGBA Staging Buffer"),
            size,
            usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
            mapped_at_creation: false,
        }));
        self.cached_dims.update(width, height);
    }

    fn upload_plane(&mut self, index: usize, data: &[u8]) {
        // Buffer writes must be a multiple of four bytes
        self.upload.clear();
        self.upload.extend_from_slice(data);
        let padded = self.upload.len().div_ceil(4) * 4;
        self.upload.resize(padded.max(4), 0);

        self.planes[index].ensure(&self.device, self.upload.len() as u64);
        if let Some(buffer) = &self.planes[index].buffer {
            self.queue.write_buffer(buffer, 0, &self.upload);
        }
    }

    /// Convert `frame` into `texture` at `output` size.
    ///
    /// Returns the RGBA pixels when `read_back` is set.
    pub async fn convert(
        &mut self,
        frame: &FrameView<'_>,
        transform: &TextureTransform,
        texture: &wgpu::Texture,
        output: Resolution,
        read_back: bool,
    ) -> Result<Option<Vec<u8>>, String> {
        let source = frame.layout.resolution();
        if source.is_empty() || output.is_empty() {
            return Err(format!("cannot convert {} frame to {}", source, output));
        }

        let params = YuvParams {
            src_width: source.width,
            src_height: source.height,
            dst_width: output.width,
            dst_height: output.height,
            y_row_stride: frame.layout.y_row_stride,
            uv_row_stride: frame.layout.uv_row_stride,
            uv_pixel_stride: frame.layout.uv_pixel_stride,
            y_len: frame.y.len() as u32,
            uv_len: frame.u.len().min(frame.v.len()) as u32,
            _pad: [0; 3],
            transform: transform.0,
        };
        self.queue
            .write_buffer(&self.uniform_buffer, 0, bytemuck::bytes_of(&params));

        self.upload_plane(0, frame.y);
        self.upload_plane(1, frame.u);
        self.upload_plane(2, frame.v);

        let output_view = texture.create_view(&wgpu::TextureViewDescriptor::default());
        let [y_buffer, u_buffer, v_buffer] = &self.planes;
        let (Some(y_buffer), Some(u_buffer), Some(v_buffer)) =
            (&y_buffer.buffer, &u_buffer.buffer, &v_buffer.buffer)
        else {
            return Err("plane buffers not allocated".to_string());
        };

        let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("YUV Convert Bind Group"),
            layout: &self.bind_group_layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: self.uniform_buffer.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: y_buffer.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: u_buffer.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 3,
                    resource: v_buffer.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 4,
                    resource: wgpu::BindingResource::TextureView(&output_view),
                },
            ],
        });

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("YUV Convert Encoder"),
            });

        {
            let mut compute_pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("YUV to RGBA Pass"),
                timestamp_writes: None,
            });
            compute_pass.set_pipeline(&self.pipeline);
            compute_pass.set_bind_group(0, &bind_group, &[]);
            compute_pass.dispatch_workgroups(
                compute_dispatch_size(output.width, WORKGROUP_SIZE),
                compute_dispatch_size(output.height, WORKGROUP_SIZE),
                1,
            );
        }

        if !read_back {
            self.queue.submit(std::iter::once(encoder.finish()));
            return Ok(None);
        }

        self.ensure_staging(output.width, output.height);
        let Some(staging_buffer) = self.staging_buffer.as_ref() else {
            return Err("staging buffer not allocated".to_string());
        };
        encoder.copy_texture_to_buffer(
            wgpu::TexelCopyTextureInfo {
                texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            wgpu::TexelCopyBufferInfo {
                buffer: staging_buffer,
                layout: wgpu::TexelCopyBufferLayout {
                    offset: 0,
                    bytes_per_row: Some(padded_bytes_per_row(output.width)),
                    rows_per_image: Some(output.height),
                },
            },
            wgpu::Extent3d {
                width: output.width,
                height: output.height,
                depth_or_array_layers: 1,
            },
        );
        self.queue.submit(std::iter::once(encoder.finish()));

        let padded = read_buffer_async(&self.device, staging_buffer).await?;
        Ok(Some(strip_row_padding(&padded, output.width, output.height)))
    }

    pub fn device(&self) -> &Arc<wgpu::Device> {
        &self.device
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Validate that a WGSL shader compiles successfully using naga
    fn validate_shader(name: &str, source: &str) {
        let module = match naga::front::wgsl::parse_str(source) {
            Ok(module) => module,
            Err(e) => panic!("Shader '{}' parse failed: {:?}", name, e),
        };
        if let Err(e) = naga::valid::Validator::new(
            naga::valid::ValidationFlags::all(),
            naga::valid::Capabilities::all(),
        )
        .validate(&module)
        {
            panic!("Shader '{}' validation failed: {:?}", name, e);
        }
    }

    #[test]
    fn test_yuv_to_rgba_shader_validates() {
        validate_shader("yuv_to_rgba", YUV_TO_RGBA_SHADER);
    }

    #[test]
    fn test_params_layout_matches_shader() {
        // 12 scalars, then the 16-byte aligned matrix
        assert_eq!(std::mem::size_of::<YuvParams>(), 48 + 64);
    }
}
