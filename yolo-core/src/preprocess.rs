//! Letterbox preprocessing that turns a frame into the model's input tensor.
//!
//! Two interchangeable backends implement [`Preprocessor`]: a scan-line CPU path and a
//! `wgpu` compute-shader path. Both resize with bilinear sampling at half-pixel centers,
//! fill padding with [`LETTERBOX_FILL`], and normalize as `(value - mean) / std`, so they
//! produce the same tensor up to float rounding. The backend is picked once by
//! [`select_preprocessor`].

use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{Context, Result};
use bytemuck::{bytes_of, cast_slice};
use image::{DynamicImage, GenericImageView};
use log::{debug, info, warn};
use tract_onnx::prelude::Tensor;
use yolo_utils::{
    config::{AppSettings, TensorLayout},
    gpu::{GpuAvailability, GpuContext, GpuContextOptions, LETTERBOX_WGSL, packed_channel},
    pack_image_pixels,
    pool::ScratchBuffers,
    telemetry::timing_guard,
};
use yolo_utils::{
    create_gpu_pipeline, gpu_readback, gpu_uniforms, storage_buffer_entry, uniform_buffer_entry,
};

use crate::letterbox::{LETTERBOX_FILL, LetterboxParams, PaddingMode};
use crate::mapping::Region;

/// Model input geometry and normalization.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PreprocessConfig {
    pub model_width: u32,
    pub model_height: u32,
    pub mean: f32,
    pub std: f32,
    pub layout: TensorLayout,
    pub padding: PaddingMode,
}

impl Default for PreprocessConfig {
    fn default() -> Self {
        Self {
            model_width: 640,
            model_height: 640,
            mean: 0.0,
            std: 255.0,
            layout: TensorLayout::Nchw,
            padding: PaddingMode::Centered,
        }
    }
}

impl PreprocessConfig {
    /// Configure model size and normalization; layout and padding keep their defaults.
    pub fn new(model_width: u32, model_height: u32, mean: f32, std: f32) -> Result<Self> {
        let config = Self {
            model_width,
            model_height,
            mean,
            std,
            ..Self::default()
        };
        config.validate()?;
        Ok(config)
    }

    pub fn with_layout(mut self, layout: TensorLayout) -> Self {
        self.layout = layout;
        self
    }

    pub fn with_padding(mut self, padding: PaddingMode) -> Self {
        self.padding = padding;
        self
    }

    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            self.model_width > 0 && self.model_height > 0,
            "model input dimensions must be greater than zero (got {}x{})",
            self.model_width,
            self.model_height
        );
        anyhow::ensure!(self.mean.is_finite(), "normalization mean must be finite");
        anyhow::ensure!(
            self.std.is_finite() && self.std != 0.0,
            "normalization std must be finite and non-zero"
        );
        Ok(())
    }

    /// Input tensor shape for a batch of one.
    pub fn tensor_shape(&self) -> [usize; 4] {
        let (w, h) = (self.model_width as usize, self.model_height as usize);
        match self.layout {
            TensorLayout::Nchw => [1, 3, h, w],
            TensorLayout::Nhwc => [1, h, w, 3],
        }
    }

    pub fn tensor_len(&self) -> usize {
        self.model_width as usize * self.model_height as usize * 3
    }

    /// The padding value after normalization.
    pub fn normalized_fill(&self) -> f32 {
        (LETTERBOX_FILL - self.mean) / self.std
    }

    pub fn letterbox_for(&self, frame_width: u32, frame_height: u32) -> LetterboxParams {
        LetterboxParams::compute(
            (frame_width, frame_height),
            (self.model_width, self.model_height),
            self.padding,
        )
    }
}

impl From<&AppSettings> for PreprocessConfig {
    fn from(settings: &AppSettings) -> Self {
        Self {
            model_width: settings.input.width,
            model_height: settings.input.height,
            mean: settings.normalization.mean,
            std: settings.normalization.std,
            layout: settings.input.layout,
            padding: PaddingMode::from(&settings.letterbox),
        }
    }
}

/// Model-ready tensor plus the letterbox that produced it.
#[derive(Debug)]
pub struct PreprocessOutput {
    pub tensor: Tensor,
    pub letterbox: LetterboxParams,
}

/// Identifies which backend a [`Preprocessor`] runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreprocessBackend {
    Cpu,
    Gpu,
}

/// Abstraction over letterbox backends.
pub trait Preprocessor: Send + Sync + std::fmt::Debug {
    fn backend(&self) -> PreprocessBackend;

    /// Letterbox `image` into a normalized tensor. Scratch memory comes from `scratch`
    /// and is returned to it before this call ends.
    fn preprocess(
        &self,
        image: &DynamicImage,
        config: &PreprocessConfig,
        scratch: &mut ScratchBuffers,
    ) -> Result<PreprocessOutput>;
}

/// Pick the preprocessing backend once, from runtime capability detection.
///
/// Returns the GPU backend when `options` enable it and an adapter initializes, the CPU
/// backend otherwise. The resolved [`GpuAvailability`] is returned for reporting.
pub fn select_preprocessor(
    options: &GpuContextOptions,
) -> (Box<dyn Preprocessor>, GpuAvailability) {
    let availability = GpuContext::init_with_fallback(options);
    let preprocessor: Box<dyn Preprocessor> = match availability.context() {
        Some(context) => match WgpuPreprocessor::new(Arc::clone(context)) {
            Ok(gpu) => {
                info!("GPU preprocessing enabled ({})", availability.describe());
                Box::new(gpu)
            }
            Err(err) => {
                warn!("GPU preprocessor unavailable ({err:#}); using CPU preprocessing.");
                Box::new(CpuPreprocessor)
            }
        },
        None => {
            debug!("CPU preprocessing selected (GPU {})", availability.describe());
            Box::new(CpuPreprocessor)
        }
    };
    (preprocessor, availability)
}

fn check_frame(image: &DynamicImage, config: &PreprocessConfig) -> Result<(u32, u32)> {
    config.validate()?;
    let (width, height) = image.dimensions();
    anyhow::ensure!(
        width > 0 && height > 0,
        "frame dimensions must be greater than zero (got {width}x{height})"
    );
    Ok((width, height))
}

fn build_tensor(config: &PreprocessConfig, data: &[f32]) -> Result<Tensor> {
    Tensor::from_shape(&config.tensor_shape(), data)
        .map_err(|e| anyhow::anyhow!("failed to build input tensor: {e}"))
}

/// Scan-line CPU backend.
#[derive(Debug, Default, Clone, Copy)]
pub struct CpuPreprocessor;

impl Preprocessor for CpuPreprocessor {
    fn backend(&self) -> PreprocessBackend {
        PreprocessBackend::Cpu
    }

    fn preprocess(
        &self,
        image: &DynamicImage,
        config: &PreprocessConfig,
        scratch: &mut ScratchBuffers,
    ) -> Result<PreprocessOutput> {
        let _guard = timing_guard("yolo_core::preprocess::cpu", log::Level::Trace);
        let (width, height) = check_frame(image, config)?;
        let letterbox = config.letterbox_for(width, height);

        let mut pixels = scratch.pixels.acquire(width as usize * height as usize);
        pack_image_pixels(image, &mut pixels);
        let mut staging = scratch.tensors.acquire(config.tensor_len());
        letterbox_into(&pixels, &letterbox, config, &mut staging);
        let tensor = build_tensor(config, &staging);
        scratch.pixels.release(pixels);
        scratch.tensors.release(staging);

        Ok(PreprocessOutput {
            tensor: tensor?,
            letterbox,
        })
    }
}

/// Source position, neighbour and weight for one destination coordinate.
#[derive(Clone, Copy)]
struct SampleTap {
    lo: usize,
    hi: usize,
    weight: f32,
}

fn sample_tap(dst: u32, ratio: f32, src_len: u32) -> SampleTap {
    let max = (src_len - 1) as f32;
    let s = ((dst as f32 + 0.5) * ratio - 0.5).clamp(0.0, max);
    let lo = s.floor() as usize;
    SampleTap {
        lo,
        hi: (lo + 1).min(src_len as usize - 1),
        weight: s - lo as f32,
    }
}

#[inline]
fn lerp(a: f32, b: f32, t: f32) -> f32 {
    a * (1.0 - t) + b * t
}

/// Letterbox packed RGBA `pixels` into `out` (cleared and resized to the tensor length).
fn letterbox_into(
    pixels: &[u32],
    letterbox: &LetterboxParams,
    config: &PreprocessConfig,
    out: &mut Vec<f32>,
) {
    out.clear();
    out.resize(config.tensor_len(), config.normalized_fill());

    let src_w = letterbox.orig_width as usize;
    let dst_w = config.model_width as usize;
    let plane = dst_w * config.model_height as usize;
    let (mean, std) = (config.mean, config.std);

    let ratio_x = letterbox.sample_ratio_x();
    let ratio_y = letterbox.sample_ratio_y();
    let columns: Vec<SampleTap> = (0..letterbox.scaled_width)
        .map(|x| sample_tap(x, ratio_x, letterbox.orig_width))
        .collect();

    for row in 0..letterbox.scaled_height {
        let tap_y = sample_tap(row, ratio_y, letterbox.orig_height);
        let upper = &pixels[tap_y.lo * src_w..(tap_y.lo + 1) * src_w];
        let lower = &pixels[tap_y.hi * src_w..(tap_y.hi + 1) * src_w];
        let dst_row = (row + letterbox.pad_y) as usize * dst_w + letterbox.pad_x as usize;

        for (offset, tap_x) in columns.iter().enumerate() {
            let index = dst_row + offset;
            for channel in 0..3u32 {
                let value = |p: u32| f32::from(packed_channel(p, channel));
                let top = lerp(value(upper[tap_x.lo]), value(upper[tap_x.hi]), tap_x.weight);
                let bottom = lerp(value(lower[tap_x.lo]), value(lower[tap_x.hi]), tap_x.weight);
                let normalized = (lerp(top, bottom, tap_y.weight) - mean) / std;
                let slot = match config.layout {
                    TensorLayout::Nchw => channel as usize * plane + index,
                    TensorLayout::Nhwc => index * 3 + channel as usize,
                };
                out[slot] = normalized;
            }
        }
    }
}

gpu_uniforms!(LetterboxUniforms, 0, {
    src_w: u32,
    src_h: u32,
    dst_w: u32,
    dst_h: u32,
    scaled_w: u32,
    scaled_h: u32,
    pad_x: u32,
    pad_y: u32,
    mean: f32,
    std: f32,
    fill: f32,
    channels_first: u32,
});

/// GPU buffers reused between frames; they only ever grow.
struct GpuWorkBuffers {
    input: wgpu::Buffer,
    input_bytes: u64,
    output: wgpu::Buffer,
    readback: wgpu::Buffer,
    output_bytes: u64,
    uniform: wgpu::Buffer,
}

impl GpuWorkBuffers {
    fn new(device: &wgpu::Device, input_bytes: u64, output_bytes: u64) -> Self {
        Self {
            input: create_input_buffer(device, input_bytes),
            input_bytes,
            output: create_output_buffer(device, output_bytes),
            readback: create_readback_buffer(device, output_bytes),
            output_bytes,
            uniform: device.create_buffer(&wgpu::BufferDescriptor {
                label: Some("yolo_letterbox_uniforms"),
                size: std::mem::size_of::<LetterboxUniforms>() as u64,
                usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
                mapped_at_creation: false,
            }),
        }
    }

    fn ensure(&mut self, device: &wgpu::Device, input_bytes: u64, output_bytes: u64) {
        if self.input_bytes < input_bytes {
            self.input = create_input_buffer(device, input_bytes);
            self.input_bytes = input_bytes;
        }
        if self.output_bytes < output_bytes {
            self.output = create_output_buffer(device, output_bytes);
            self.readback = create_readback_buffer(device, output_bytes);
            self.output_bytes = output_bytes;
        }
    }
}

fn create_input_buffer(device: &wgpu::Device, size: u64) -> wgpu::Buffer {
    device.create_buffer(&wgpu::BufferDescriptor {
        label: Some("yolo_letterbox_input"),
        size,
        usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_DST,
        mapped_at_creation: false,
    })
}

fn create_output_buffer(device: &wgpu::Device, size: u64) -> wgpu::Buffer {
    device.create_buffer(&wgpu::BufferDescriptor {
        label: Some("yolo_letterbox_output"),
        size,
        usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC,
        mapped_at_creation: false,
    })
}

fn create_readback_buffer(device: &wgpu::Device, size: u64) -> wgpu::Buffer {
    device.create_buffer(&wgpu::BufferDescriptor {
        label: Some("yolo_letterbox_readback"),
        size,
        usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
        mapped_at_creation: false,
    })
}

/// Compute-shader backend: one invocation per output pixel.
pub struct WgpuPreprocessor {
    context: Arc<GpuContext>,
    pipeline: wgpu::ComputePipeline,
    bind_group_layout: wgpu::BindGroupLayout,
    buffers: Mutex<Option<GpuWorkBuffers>>,
}

impl std::fmt::Debug for WgpuPreprocessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WgpuPreprocessor")
            .field("adapter", &self.context.adapter_info().name)
            .finish()
    }
}

impl WgpuPreprocessor {
    /// Create a GPU preprocessor from an existing `GpuContext`.
    pub fn new(context: Arc<GpuContext>) -> Result<Self> {
        let device = context.device();
        let (pipeline, bind_group_layout) = create_gpu_pipeline!(
            device,
            "letterbox",
            LETTERBOX_WGSL,
            [
                storage_buffer_entry!(0, read_only),
                storage_buffer_entry!(1, read_write),
                uniform_buffer_entry!(2),
            ]
        );

        Ok(Self {
            context,
            pipeline,
            bind_group_layout,
            buffers: Mutex::new(None),
        })
    }

    fn fits_device(&self, input_bytes: u64, output_bytes: u64) -> bool {
        let limit = u64::from(self.context.limits().max_storage_buffer_binding_size);
        input_bytes <= limit && output_bytes <= limit
    }
}

impl Preprocessor for WgpuPreprocessor {
    fn backend(&self) -> PreprocessBackend {
        PreprocessBackend::Gpu
    }

    fn preprocess(
        &self,
        image: &DynamicImage,
        config: &PreprocessConfig,
        scratch: &mut ScratchBuffers,
    ) -> Result<PreprocessOutput> {
        let _guard = timing_guard("yolo_core::preprocess::gpu", log::Level::Trace);
        let (width, height) = check_frame(image, config)?;
        let pixel_count = width as usize * height as usize;
        let tensor_len = config.tensor_len();
        let input_bytes = (pixel_count * std::mem::size_of::<u32>()) as u64;
        let output_bytes = (tensor_len * std::mem::size_of::<f32>()) as u64;

        if !self.fits_device(input_bytes, output_bytes) {
            debug!(
                "frame {width}x{height} exceeds GPU storage binding limits; letterboxing on CPU"
            );
            return CpuPreprocessor.preprocess(image, config, scratch);
        }

        let letterbox = config.letterbox_for(width, height);
        let mut pixels = scratch.pixels.acquire(pixel_count);
        pack_image_pixels(image, &mut pixels);
        let mut staging = scratch.tensors.acquire(tensor_len);

        let dispatched = self.dispatch(
            &pixels,
            &letterbox,
            config,
            input_bytes,
            output_bytes,
            &mut staging,
        );
        let tensor = dispatched.and_then(|()| build_tensor(config, &staging));
        scratch.pixels.release(pixels);
        scratch.tensors.release(staging);

        Ok(PreprocessOutput {
            tensor: tensor.context("GPU letterbox failed")?,
            letterbox,
        })
    }
}

impl WgpuPreprocessor {
    fn dispatch(
        &self,
        pixels: &[u32],
        letterbox: &LetterboxParams,
        config: &PreprocessConfig,
        input_bytes: u64,
        output_bytes: u64,
        staging: &mut Vec<f32>,
    ) -> Result<()> {
        let device = self.context.device();
        let queue = self.context.queue();

        let mut slot = self.buffers.lock().unwrap_or_else(PoisonError::into_inner);
        let buffers =
            slot.get_or_insert_with(|| GpuWorkBuffers::new(device, input_bytes, output_bytes));
        buffers.ensure(device, input_bytes, output_bytes);

        let uniforms = LetterboxUniforms {
            src_w: letterbox.orig_width,
            src_h: letterbox.orig_height,
            dst_w: config.model_width,
            dst_h: config.model_height,
            scaled_w: letterbox.scaled_width,
            scaled_h: letterbox.scaled_height,
            pad_x: letterbox.pad_x,
            pad_y: letterbox.pad_y,
            mean: config.mean,
            std: config.std,
            fill: LETTERBOX_FILL,
            channels_first: u32::from(config.layout == TensorLayout::Nchw),
            __padding: [],
        };
        queue.write_buffer(&buffers.input, 0, cast_slice(pixels));
        queue.write_buffer(&buffers.uniform, 0, bytes_of(&uniforms));

        let bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("yolo_letterbox_bg"),
            layout: &self.bind_group_layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: buffers.input.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: buffers.output.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: buffers.uniform.as_entire_binding(),
                },
            ],
        });

        let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("yolo_letterbox_encoder"),
        });
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("yolo_letterbox_pass"),
                timestamp_writes: None,
            });
            pass.set_pipeline(&self.pipeline);
            pass.set_bind_group(0, &bind_group, &[]);
            pass.dispatch_workgroups(
                config.model_width.div_ceil(8),
                config.model_height.div_ceil(8),
                1,
            );
        }
        encoder.copy_buffer_to_buffer(&buffers.output, 0, &buffers.readback, 0, output_bytes);
        queue.submit(std::iter::once(encoder.finish()));

        staging.clear();
        let tensor_len = config.tensor_len();
        gpu_readback!(buffers.readback, device, tensor_len, "letterbox", f32 => staging)
    }
}

/// One tile of a frame cut by [`slice_image`].
#[derive(Debug, Clone)]
pub struct ImageTile {
    pub image: DynamicImage,
    /// Where the tile sits in the source frame.
    pub region: Region,
}

/// Cut `image` into a row-major grid of `tile_width x tile_height` tiles.
///
/// The grid has `ceil(w / tile_width)` columns and `ceil(h / tile_height)` rows; tiles on
/// the last row and column are clipped to the frame rather than padded.
pub fn slice_image(
    image: &DynamicImage,
    tile_width: u32,
    tile_height: u32,
) -> Result<Vec<ImageTile>> {
    anyhow::ensure!(
        tile_width > 0 && tile_height > 0,
        "tile dimensions must be greater than zero (got {tile_width}x{tile_height})"
    );
    let (width, height) = image.dimensions();
    let columns = width.div_ceil(tile_width);
    let rows = height.div_ceil(tile_height);

    let mut tiles = Vec::with_capacity((columns * rows) as usize);
    for row in 0..rows {
        for column in 0..columns {
            let x = column * tile_width;
            let y = row * tile_height;
            let w = tile_width.min(width - x);
            let h = tile_height.min(height - y);
            tiles.push(ImageTile {
                image: image.crop_imm(x, y, w, h),
                region: Region::new(x as i32, y as i32, w, h),
            });
        }
    }
    Ok(tiles)
}
