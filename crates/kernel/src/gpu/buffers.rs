//! GPU buffer management for primitive calls.
//!
//! Host arrays are uploaded into fresh storage buffers for each call and the
//! written buffers are read back before the call returns.

use wgpu::util::DeviceExt;

use crate::array::Dtype;
use crate::backend::Primitive;
use crate::backends::Numeric;
use crate::error::{Error, Result};

/// Uniform parameter block shared by every shader.
/// Must match the `Params` struct in `shaders/params.wgsl` exactly.
#[repr(C)]
#[derive(Debug, Default, Copy, Clone, bytemuck::Pod, bytemuck::Zeroable)]
pub struct GpuParams {
    /// Buffer length.
    pub n: u32,
    /// Active index length.
    pub length: u32,
    /// Invocation count (pairs, partials or padded slots).
    pub count: u32,
    /// Shader-specific mode selector.
    pub mode: u32,
    /// Bitonic compare distance.
    pub j: u32,
    /// Bitonic block size.
    pub k: u32,
    /// Attribute rows.
    pub rows: u32,
    pub _pad: u32,
}

/// Element type substituted into templated shaders.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Elem {
    F64,
    I64,
}

impl Elem {
    pub fn of(dtype: Dtype, primitive: Primitive) -> Result<Self> {
        match dtype {
            Dtype::Float => Ok(Elem::F64),
            Dtype::Int => Ok(Elem::I64),
            Dtype::Bool => Err(Error::dtype(primitive, Dtype::Bool)),
        }
    }

    pub fn wgsl(self) -> &'static str {
        match self {
            Elem::F64 => "f64",
            Elem::I64 => "i64",
        }
    }

    pub fn zero(self) -> &'static str {
        match self {
            Elem::F64 => "0.0lf",
            Elem::I64 => "0li",
        }
    }
}

/// Smallest binding we create; an empty runtime-sized array still needs one
/// 8-byte element.
const MIN_BINDING: u64 = 8;

const STORAGE: wgpu::BufferUsages = wgpu::BufferUsages::STORAGE
    .union(wgpu::BufferUsages::COPY_SRC)
    .union(wgpu::BufferUsages::COPY_DST);

/// Storage buffer initialised from `data`.
pub fn storage<T: bytemuck::Pod>(device: &wgpu::Device, label: &str, data: &[T]) -> wgpu::Buffer {
    if (std::mem::size_of_val(data) as u64) < MIN_BINDING {
        let mut bytes = bytemuck::cast_slice::<T, u8>(data).to_vec();
        bytes.resize(MIN_BINDING as usize, 0);
        return device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some(label),
            contents: &bytes,
            usage: STORAGE,
        });
    }
    device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
        label: Some(label),
        contents: bytemuck::cast_slice(data),
        usage: STORAGE,
    })
}

/// Zero-initialised storage buffer of `bytes` bytes.
pub fn zeroed(device: &wgpu::Device, label: &str, bytes: u64) -> wgpu::Buffer {
    device.create_buffer(&wgpu::BufferDescriptor {
        label: Some(label),
        size: bytes.max(MIN_BINDING).next_multiple_of(wgpu::COPY_BUFFER_ALIGNMENT),
        usage: STORAGE,
        mapped_at_creation: false,
    })
}

/// Uniform buffer holding `params`.
pub fn uniform(device: &wgpu::Device, label: &str, params: &GpuParams) -> wgpu::Buffer {
    device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
        label: Some(label),
        contents: bytemuck::bytes_of(params),
        usage: wgpu::BufferUsages::UNIFORM,
    })
}

/// Upload a numeric host array.
pub fn numeric(device: &wgpu::Device, label: &str, values: Numeric<'_>) -> (wgpu::Buffer, Elem) {
    match values {
        Numeric::Float(v) => (storage(device, label, v), Elem::F64),
        Numeric::Int(v) => (storage(device, label, v), Elem::I64),
    }
}

/// Upload index values as `u32`; they must already be validated against the
/// buffer they address.
pub fn index(device: &wgpu::Device, label: &str, values: &[i64]) -> Result<wgpu::Buffer> {
    let narrowed = values
        .iter()
        .map(|&v| u32::try_from(v))
        .collect::<std::result::Result<Vec<u32>, _>>()
        .map_err(|_| Error::Device(format!("{label}: index value does not fit in u32")))?;
    Ok(storage(device, label, &narrowed))
}

/// Copy the first `len` elements of `buffer` back to the host.
///
/// Blocks until the device has finished every submitted command.
pub fn read_back<T: bytemuck::Pod>(
    device: &wgpu::Device,
    queue: &wgpu::Queue,
    buffer: &wgpu::Buffer,
    len: usize,
) -> Result<Vec<T>> {
    if len == 0 {
        return Ok(Vec::new());
    }
    let byte_len = (len * std::mem::size_of::<T>()) as u64;
    let staging_len = byte_len.next_multiple_of(wgpu::COPY_BUFFER_ALIGNMENT);

    let staging = device.create_buffer(&wgpu::BufferDescriptor {
        label: Some("readback_staging"),
        size: staging_len,
        usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
        mapped_at_creation: false,
    });

    let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
        label: Some("readback"),
    });
    encoder.copy_buffer_to_buffer(buffer, 0, &staging, 0, staging_len);
    queue.submit(std::iter::once(encoder.finish()));

    let slice = staging.slice(..);
    let (tx, rx) = std::sync::mpsc::channel();
    slice.map_async(wgpu::MapMode::Read, move |result| {
        let _ = tx.send(result);
    });
    device.poll(wgpu::Maintain::Wait);
    rx.recv()
        .map_err(|e| Error::Device(format!("readback channel closed: {e}")))?
        .map_err(|e| Error::Device(format!("buffer map failed: {e}")))?;

    let data = slice.get_mapped_range();
    let values: Vec<T> = bytemuck::cast_slice(&data[..byte_len as usize]).to_vec();
    drop(data);
    staging.unmap();
    Ok(values)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn params_match_the_shader_block_size() {
        assert_eq!(std::mem::size_of::<GpuParams>(), 32);
    }

    #[test]
    fn elem_names() {
        assert_eq!(Elem::of(Dtype::Float, Primitive::Fill).unwrap().wgsl(), "f64");
        assert_eq!(Elem::of(Dtype::Int, Primitive::Fill).unwrap().zero(), "0li");
        assert!(Elem::of(Dtype::Bool, Primitive::Fill).is_err());
    }
}
