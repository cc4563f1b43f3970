//! Common helpers shared across the YOLO detection crates.

/// Settings persisted as JSON and shared by the CLI and library callers.
pub mod config;
/// Shared GPU context initialization and pixel packing helpers.
pub mod gpu;
/// Image loading and pixel packing.
pub mod image_utils;
/// Declarative macros for wgpu compute boilerplate.
#[macro_use]
pub mod macros;
/// Best-fit pools for per-frame scratch buffers.
pub mod pool;
/// Instrumentation helpers for optional performance tracing.
pub mod telemetry;

use std::path::Path;

use anyhow::Result;
use log::LevelFilter;

pub use config::{AppSettings, BoxUnits, PaddingStyle, TensorLayout};
pub use gpu::{GpuAvailability, GpuContext, GpuContextOptions, GpuInitError};
pub use image_utils::{is_image_path, load_image, pack_image_pixels};
pub use pool::{Scratch, ScratchBuffers, ScratchPool};
pub use telemetry::{
    TimingGuard, configure as configure_telemetry, telemetry_allows, telemetry_enabled,
    telemetry_level, timing_guard, timing_guard_if,
};

/// Initialize logging once for CLI and test environments.
///
/// `RUST_LOG` takes precedence when set; otherwise `default_filter` applies. Telemetry
/// records are always let through so [`configure_telemetry`] alone decides whether they
/// appear.
pub fn init_logging(default_filter: LevelFilter) -> Result<()> {
    let mut builder = env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(default_filter.as_str()),
    );
    builder.filter_module(telemetry::TELEMETRY_TARGET, LevelFilter::Trace);

    if builder.try_init().is_err() {
        // Logger already initialized; nothing to do.
    }
    Ok(())
}

/// Validate that a path exists and resolve it to an absolute path.
pub fn normalize_path<P: AsRef<Path>>(path: P) -> Result<std::path::PathBuf> {
    let path = path.as_ref();
    anyhow::ensure!(path.exists(), "path does not exist: {}", path.display());
    Ok(path.canonicalize()?)
}
