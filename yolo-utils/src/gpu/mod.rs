//! GPU context management built on top of `wgpu`.
//!
//! Initialization lives in one place so the preprocessing backend can be chosen once, at
//! detector construction, with a CPU fallback when no compatible adapter is present.

/// Letterbox resize + normalize + layout WGSL compute shader.
pub const LETTERBOX_WGSL: &str = include_str!("letterbox.wgsl");

use std::sync::Arc;

use log::{debug, info, warn};
use pollster::block_on;
use thiserror::Error;
use wgpu::{
    AdapterInfo, Backends, Device, DeviceDescriptor, ExperimentalFeatures, Features,
    Instance, InstanceDescriptor, InstanceFlags, Limits, MemoryHints, PowerPreference, Queue,
    RequestAdapterError, RequestAdapterOptions, RequestDeviceError, Trace,
};

/// High-level configuration for creating a [`GpuContext`].
#[derive(Clone, Debug)]
pub struct GpuContextOptions {
    /// Whether GPU support is enabled.
    pub enabled: bool,
    /// Allow environment variables (e.g. `WGPU_BACKEND`) to override defaults.
    pub respect_env: bool,
    /// Which backends should be considered.
    pub backends: Backends,
    /// Instance flags (debug/validation toggles).
    pub flags: InstanceFlags,
    /// Adapter preference (high-performance vs low-power).
    pub power_preference: PowerPreference,
    /// Force wgpu to pick its fallback adapter implementation.
    pub force_fallback_adapter: bool,
    /// Features that must be present on the selected adapter.
    pub required_features: Features,
    /// Limits that must be available. Defaults to the adapter limits.
    pub required_limits: Option<Limits>,
    /// Optional debug label for the logical device.
    pub label: Option<String>,
}

impl Default for GpuContextOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            respect_env: true,
            backends: Backends::PRIMARY,
            flags: InstanceFlags::from_build_config(),
            power_preference: PowerPreference::HighPerformance,
            force_fallback_adapter: false,
            required_features: Features::empty(),
            required_limits: None,
            label: Some("yolo preprocessing device".to_string()),
        }
    }
}

impl GpuContextOptions {
    /// Convenience helper for explicitly disabling GPU usage.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }
}

/// Result of attempting to initialize a GPU context while supporting CPU fallback.
#[derive(Debug)]
pub enum GpuAvailability {
    /// GPU resources are ready to use.
    Available(Arc<GpuContext>),
    /// GPU code path has been disabled by configuration.
    Disabled { reason: String },
    /// GPU initialization failed; callers should fall back to CPU.
    Unavailable { error: GpuInitError },
}

impl GpuAvailability {
    pub fn is_available(&self) -> bool {
        matches!(self, Self::Available(_))
    }

    /// Returns a reference to the underlying GPU context when it exists.
    pub fn context(&self) -> Option<&Arc<GpuContext>> {
        match self {
            Self::Available(ctx) => Some(ctx),
            _ => None,
        }
    }

    /// One-line status suitable for logs and CLI output.
    pub fn describe(&self) -> String {
        match self {
            Self::Available(ctx) => {
                let info = ctx.adapter_info();
                format!("using '{}' ({:?})", info.name, info.backend)
            }
            Self::Disabled { reason } => format!("disabled: {reason}"),
            Self::Unavailable { error } => format!("unavailable: {error}"),
        }
    }
}

/// Shared GPU device/queue wrapper with adapter metadata.
#[derive(Debug)]
pub struct GpuContext {
    device: Device,
    queue: Queue,
    info: AdapterInfo,
    limits: Limits,
}

impl GpuContext {
    /// Initialize a new GPU context with the provided options.
    pub fn initialize(options: &GpuContextOptions) -> Result<Self, GpuInitError> {
        if !options.enabled {
            return Err(GpuInitError::Disabled);
        }

        let mut instance_desc = if options.respect_env {
            InstanceDescriptor::from_env_or_default()
        } else {
            InstanceDescriptor::default()
        };

        let backends = if options.respect_env {
            options.backends.with_env()
        } else {
            options.backends
        };
        instance_desc.backends = backends;
        instance_desc.flags = if options.respect_env {
            options.flags.with_env()
        } else {
            options.flags
        };

        let instance = Instance::new(&instance_desc);
        let adapter = block_on(instance.request_adapter(&RequestAdapterOptions {
            power_preference: options.power_preference,
            force_fallback_adapter: options.force_fallback_adapter,
            compatible_surface: None,
        }))
        .map_err(|source| GpuInitError::Adapter { backends, source })?;

        let info = adapter.get_info();
        let supported = adapter.features();
        if !supported.contains(options.required_features) {
            return Err(GpuInitError::MissingFeatures {
                requested: options.required_features,
                supported,
            });
        }

        let limits = options
            .required_limits
            .clone()
            .unwrap_or_else(|| adapter.limits());

        let device_desc = DeviceDescriptor {
            label: options.label.as_deref(),
            required_features: options.required_features,
            required_limits: limits.clone(),
            experimental_features: ExperimentalFeatures::default(),
            memory_hints: MemoryHints::Performance,
            trace: Trace::default(),
        };

        let (device, queue) =
            block_on(adapter.request_device(&device_desc)).map_err(GpuInitError::from)?;

        info!(
            target: "yolo::gpu",
            "Using GPU adapter '{}' ({:?}/{:?})",
            info.name, info.backend, info.device_type
        );
        debug!(
            target: "yolo::gpu",
            "max storage buffer binding size: {} bytes", limits.max_storage_buffer_binding_size
        );

        Ok(Self {
            device,
            queue,
            info,
            limits,
        })
    }

    /// Attempt to create a GPU context and gracefully fall back to CPU if that fails.
    pub fn init_with_fallback(options: &GpuContextOptions) -> GpuAvailability {
        if !options.enabled {
            return GpuAvailability::Disabled {
                reason: "GPU acceleration disabled via configuration".to_string(),
            };
        }

        match Self::initialize(options) {
            Ok(ctx) => GpuAvailability::Available(Arc::new(ctx)),
            Err(GpuInitError::Disabled) => GpuAvailability::Disabled {
                reason: "GPU acceleration disabled via configuration".to_string(),
            },
            Err(err) => {
                warn!(
                    target: "yolo::gpu",
                    "GPU initialization failed ({err}); falling back to CPU."
                );
                GpuAvailability::Unavailable { error: err }
            }
        }
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn queue(&self) -> &Queue {
        &self.queue
    }

    /// Adapter metadata handy for logging.
    pub fn adapter_info(&self) -> &AdapterInfo {
        &self.info
    }

    /// `wgpu::Limits` negotiated for this context.
    pub fn limits(&self) -> &Limits {
        &self.limits
    }
}

/// Pack little-endian RGBA bytes into a single `u32` per pixel, appending to `out`.
///
/// Each element stores the channels as `R | G << 8 | B << 16 | A << 24`.
pub fn pack_rgba_into(bytes: &[u8], out: &mut Vec<u32>) {
    debug_assert!(
        bytes.len().is_multiple_of(4),
        "RGBA buffer must have a multiple of 4 elements"
    );
    out.extend(
        bytes
            .chunks_exact(4)
            .map(|chunk| u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]])),
    );
}

/// Pack tightly interleaved RGB bytes into one `u32` per pixel with an opaque alpha.
pub fn pack_rgb_into(bytes: &[u8], out: &mut Vec<u32>) {
    debug_assert!(
        bytes.len().is_multiple_of(3),
        "RGB buffer must have a multiple of 3 elements"
    );
    out.extend(
        bytes
            .chunks_exact(3)
            .map(|chunk| u32::from_le_bytes([chunk[0], chunk[1], chunk[2], u8::MAX])),
    );
}

/// Extract one 8-bit channel (0 = R, 1 = G, 2 = B, 3 = A) from a packed pixel.
#[inline]
pub fn packed_channel(pixel: u32, channel: u32) -> u8 {
    (pixel >> (8 * channel)) as u8
}

/// Tracks GPU initialization failures and reasons for CPU fallback.
#[derive(Debug, Error)]
pub enum GpuInitError {
    #[error("GPU adapter request failed for {backends:?}: {source}")]
    Adapter {
        backends: Backends,
        #[source]
        source: RequestAdapterError,
    },
    #[error(
        "GPU adapter missing required features (requested={requested:?}, supported={supported:?})"
    )]
    MissingFeatures {
        requested: Features,
        supported: Features,
    },
    #[error("GPU device creation failed: {0}")]
    Device(#[from] RequestDeviceError),
    #[error("GPU acceleration disabled")]
    Disabled,
}
