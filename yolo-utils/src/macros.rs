//! Macros for reducing wgpu compute boilerplate.
//!
//! They cover the repetitive parts of a compute dispatch: bind group layout entries,
//! pipeline creation, uniform struct layout, and mapped-buffer readback.

/// Creates a storage buffer bind group layout entry for a compute shader.
///
/// ```ignore
/// let entry = storage_buffer_entry!(0, read_only);
/// ```
#[macro_export]
macro_rules! storage_buffer_entry {
    ($binding:expr, read_only) => {
        $crate::storage_buffer_entry!(@entry $binding, true)
    };
    ($binding:expr, read_write) => {
        $crate::storage_buffer_entry!(@entry $binding, false)
    };
    (@entry $binding:expr, $read_only:expr) => {
        wgpu::BindGroupLayoutEntry {
            binding: $binding,
            visibility: wgpu::ShaderStages::COMPUTE,
            ty: wgpu::BindingType::Buffer {
                ty: wgpu::BufferBindingType::Storage {
                    read_only: $read_only,
                },
                has_dynamic_offset: false,
                min_binding_size: None,
            },
            count: None,
        }
    };
}

/// Creates a uniform buffer bind group layout entry for a compute shader.
#[macro_export]
macro_rules! uniform_buffer_entry {
    ($binding:expr) => {
        wgpu::BindGroupLayoutEntry {
            binding: $binding,
            visibility: wgpu::ShaderStages::COMPUTE,
            ty: wgpu::BindingType::Buffer {
                ty: wgpu::BufferBindingType::Uniform,
                has_dynamic_offset: false,
                min_binding_size: None,
            },
            count: None,
        }
    };
}

/// Creates a compute pipeline and its bind group layout from WGSL source.
///
/// Returns `(ComputePipeline, BindGroupLayout)`. The shader entry point must be `main`.
///
/// ```ignore
/// let (pipeline, layout) = create_gpu_pipeline!(
///     device,
///     "letterbox",
///     LETTERBOX_WGSL,
///     [
///         storage_buffer_entry!(0, read_only),
///         storage_buffer_entry!(1, read_write),
///         uniform_buffer_entry!(2),
///     ]
/// );
/// ```
#[macro_export]
macro_rules! create_gpu_pipeline {
    ($device:expr, $label:literal, $shader_source:expr, [$($entry:expr),* $(,)?]) => {{
        let shader = $device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some(concat!("yolo_", $label, "_shader")),
            source: wgpu::ShaderSource::Wgsl($shader_source.into()),
        });

        let bind_group_layout = $device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some(concat!("yolo_", $label, "_bgl")),
            entries: &[$($entry),*],
        });

        let pipeline_layout = $device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some(concat!("yolo_", $label, "_layout")),
            bind_group_layouts: &[&bind_group_layout],
            push_constant_ranges: &[],
        });

        let pipeline = $device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label: Some(concat!("yolo_", $label, "_pipeline")),
            layout: Some(&pipeline_layout),
            module: &shader,
            entry_point: Some("main"),
            compilation_options: wgpu::PipelineCompilationOptions::default(),
            cache: None,
        });

        (pipeline, bind_group_layout)
    }};
}

/// Maps a readback buffer, waits for the device, and copies out `$expected_len` elements.
///
/// Only the leading `$expected_len * size_of::<$elem>()` bytes are read, so pooled
/// readback buffers larger than the current request are fine. The elements are appended
/// to `$out` (a `Vec<$elem>`), letting callers supply a recycled allocation.
///
/// Evaluates to `anyhow::Result<()>`.
///
/// ```ignore
/// gpu_readback!(readback, device, tensor_len, "letterbox", f32 => staging)?;
/// ```
#[macro_export]
macro_rules! gpu_readback {
    ($readback:expr, $device:expr, $expected_len:expr, $operation:literal, $elem:ty => $out:expr) => {{
        use std::sync::mpsc;

        let byte_len = ($expected_len * std::mem::size_of::<$elem>()) as wgpu::BufferAddress;
        let slice = $readback.slice(..byte_len);
        let (sender, receiver) = mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |res| {
            let _ = sender.send(res);
        });

        $device
            .poll(wgpu::PollType::Wait {
                submission_index: None,
                timeout: None,
            })
            .map_err(|err| anyhow::anyhow!("device poll failed during {}: {err}", $operation))?;

        receiver
            .recv()
            .map_err(|_| anyhow::anyhow!("GPU {} map callback dropped", $operation))?
            .map_err(|err| anyhow::anyhow!("GPU {} map error: {err}", $operation))?;

        let mapped = slice.get_mapped_range();
        let values: &[$elem] = bytemuck::cast_slice(&mapped);
        let copied = values.len();
        $out.extend_from_slice(values);
        drop(mapped);
        $readback.unmap();

        anyhow::ensure!(
            copied == $expected_len,
            "unexpected GPU {} output size (expected {}, got {})",
            $operation,
            $expected_len,
            copied
        );

        Ok::<(), anyhow::Error>(())
    }};
}

/// Defines a GPU uniform struct with explicit trailing padding.
///
/// Uniform structs must be a multiple of 16 bytes. Padding is
/// `(16 - (field_count * 4) % 16) / 4` when that is not already zero.
///
/// ```ignore
/// gpu_uniforms!(LetterboxUniforms, 0, {
///     src_w: u32,
///     src_h: u32,
///     dst_w: u32,
///     dst_h: u32,
/// });
/// ```
#[macro_export]
macro_rules! gpu_uniforms {
    ($name:ident, $padding:expr, { $($field:ident: $ty:ty),+ $(,)? }) => {
        #[repr(C)]
        #[derive(Clone, Copy, Debug, bytemuck::Pod, bytemuck::Zeroable)]
        struct $name {
            $(pub $field: $ty,)+
            pub __padding: [u32; $padding],
        }
    };
}

#[cfg(test)]
mod tests {
    #[test]
    fn uniform_padding_rounds_to_sixteen_bytes() {
        gpu_uniforms!(ThreeFields, 1, {
            a: u32,
            b: u32,
            c: f32,
        });
        assert_eq!(std::mem::size_of::<ThreeFields>(), 16);

        gpu_uniforms!(TwelveFields, 0, {
            a: u32,
            b: u32,
            c: u32,
            d: u32,
            e: u32,
            f: u32,
            g: u32,
            h: u32,
            i: f32,
            j: f32,
            k: f32,
            l: u32,
        });
        assert_eq!(std::mem::size_of::<TwelveFields>(), 48);
    }

    #[test]
    fn uniforms_are_pod() {
        gpu_uniforms!(PodUniforms, 2, {
            x: u32,
            y: f32,
        });

        let bytes = bytemuck::bytes_of(&PodUniforms {
            x: 42,
            y: 1.5,
            __padding: [0; 2],
        });
        assert_eq!(bytes.len(), 16);
        assert_eq!(&bytes[..4], &42u32.to_le_bytes());
    }
}
