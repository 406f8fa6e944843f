//! `TextureSink` backed by wgpu: one 2D texture per table, sub-region
//! updates through `Queue::write_texture`.

use crate::error::{DtxError, Result};
use crate::sink::{Scalar, TexelFormat, TexelRegion, TextureDesc, TextureHandle, TextureSink};
use hashbrown::HashMap;
use std::sync::Arc;

pub fn texture_format(format: TexelFormat) -> Option<wgpu::TextureFormat> {
    use wgpu::TextureFormat as F;
    Some(match (format.scalar, format.channels) {
        (Scalar::U8, 1) => F::R8Uint,
        (Scalar::U8, 2) => F::Rg8Uint,
        (Scalar::U8, 4) => F::Rgba8Uint,
        (Scalar::U16, 1) => F::R16Uint,
        (Scalar::U16, 2) => F::Rg16Uint,
        (Scalar::U16, 4) => F::Rgba16Uint,
        (Scalar::U32, 1) => F::R32Uint,
        (Scalar::U32, 2) => F::Rg32Uint,
        (Scalar::U32, 4) => F::Rgba32Uint,
        (Scalar::F16, 1) => F::R16Float,
        (Scalar::F16, 2) => F::Rg16Float,
        (Scalar::F16, 4) => F::Rgba16Float,
        (Scalar::F32, 1) => F::R32Float,
        (Scalar::F32, 2) => F::Rg32Float,
        (Scalar::F32, 4) => F::Rgba32Float,
        _ => return None,
    })
}

/// A table's GPU texture and the view shaders bind.
pub struct GpuTable {
    pub desc: TextureDesc,
    pub texture: wgpu::Texture,
    pub view: wgpu::TextureView,
}

pub struct WgpuSink {
    device: Arc<wgpu::Device>,
    queue: Arc<wgpu::Queue>,
    tables: HashMap<TextureHandle, GpuTable>,
    next: u64,
}

impl WgpuSink {
    pub fn new(device: Arc<wgpu::Device>, queue: Arc<wgpu::Queue>) -> Self {
        Self {
            device,
            queue,
            tables: HashMap::new(),
            next: 0,
        }
    }

    /// Device without a surface, with the adapter's own limits so tall
    /// tables fit.
    pub fn headless() -> Result<Self> {
        let instance = wgpu::Instance::new(wgpu::InstanceDescriptor::default());
        let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: wgpu::PowerPreference::HighPerformance,
            compatible_surface: None,
            force_fallback_adapter: false,
        }))
        .ok_or_else(|| DtxError::backend("no suitable GPU adapter"))?;

        let (device, queue) = pollster::block_on(adapter.request_device(
            &wgpu::DeviceDescriptor {
                label: Some("dtx"),
                required_features: wgpu::Features::empty(),
                required_limits: adapter.limits(),
            },
            None,
        ))
        .map_err(|e| DtxError::backend(format!("request_device: {e}")))?;

        Ok(Self::new(Arc::new(device), Arc::new(queue)))
    }

    pub fn table(&self, handle: TextureHandle) -> Option<&GpuTable> {
        self.tables.get(&handle)
    }

    pub fn num_tables(&self) -> usize {
        self.tables.len()
    }

    fn write(&self, texture: &wgpu::Texture, bpt: u32, region: TexelRegion, data: &[u8]) {
        self.queue.write_texture(
            wgpu::ImageCopyTexture {
                texture,
                mip_level: 0,
                origin: wgpu::Origin3d {
                    x: region.x,
                    y: region.y,
                    z: 0,
                },
                aspect: wgpu::TextureAspect::All,
            },
            data,
            wgpu::ImageDataLayout {
                offset: 0,
                bytes_per_row: Some(region.width * bpt),
                rows_per_image: None,
            },
            wgpu::Extent3d {
                width: region.width,
                height: region.height,
                depth_or_array_layers: 1,
            },
        );
    }
}

impl TextureSink for WgpuSink {
    fn upload(&mut self, desc: &TextureDesc, data: &[u8]) -> Result<TextureHandle> {
        let format = texture_format(desc.format)
            .ok_or_else(|| DtxError::backend(format!("{}: no texture format for {:?}", desc.label, desc.format)))?;

        let max = self.device.limits().max_texture_dimension_2d;
        if desc.width > max || desc.height > max {
            return Err(DtxError::backend(format!(
                "{}: {}x{} exceeds device limit {max}",
                desc.label, desc.width, desc.height
            )));
        }

        let texture = self.device.create_texture(&wgpu::TextureDescriptor {
            label: Some(&desc.label),
            size: wgpu::Extent3d {
                width: desc.width,
                height: desc.height,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format,
            usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
            view_formats: &[],
        });

        let bpt = desc.format.bytes_per_texel();
        let rows = (data.len() as u32 / (desc.width * bpt)).min(desc.height);
        if rows > 0 {
            let region = TexelRegion {
                x: 0,
                y: 0,
                width: desc.width,
                height: rows,
            };
            self.write(&texture, bpt, region, &data[..(rows * desc.width * bpt) as usize]);
        }

        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
        self.next += 1;
        let handle = TextureHandle(self.next);
        self.tables.insert(
            handle,
            GpuTable {
                desc: desc.clone(),
                texture,
                view,
            },
        );
        Ok(handle)
    }

    fn update(&mut self, handle: TextureHandle, region: TexelRegion, data: &[u8]) -> Result<()> {
        let table = self
            .tables
            .get(&handle)
            .ok_or_else(|| DtxError::backend(format!("update of unknown texture {handle:?}")))?;

        let bpt = table.desc.format.bytes_per_texel();
        if region.x + region.width > table.desc.width || region.y + region.height > table.desc.height {
            return Err(DtxError::backend(format!("{}: region outside texture", table.desc.label)));
        }
        if data.len() != (region.width * region.height * bpt) as usize {
            return Err(DtxError::backend(format!("{}: region data size mismatch", table.desc.label)));
        }

        self.write(&table.texture, bpt, region, data);
        Ok(())
    }

    fn release(&mut self, handle: TextureHandle) {
        if let Some(table) = self.tables.remove(&handle) {
            table.texture.destroy();
        }
    }
}
