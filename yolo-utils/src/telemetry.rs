//! Scoped timing for the detection pipeline stages.
//!
//! A [`TimingGuard`] measures one stage (letterbox, inference, decode, NMS) and logs the
//! elapsed time under the `yolo::telemetry` target when it is dropped. Guards only log when
//! telemetry has been switched on with [`configure`] and the global logger accepts the
//! requested level, so inactive guards cost a single `Instant::now()`.

use std::{
    borrow::Cow,
    sync::atomic::{AtomicBool, AtomicU8, Ordering},
    time::{Duration, Instant},
};

use log::{Level, LevelFilter, log, log_enabled};

/// Log target shared by every timing guard.
pub const TELEMETRY_TARGET: &str = "yolo::telemetry";

static TELEMETRY_ENABLED: AtomicBool = AtomicBool::new(false);
static TELEMETRY_LEVEL: AtomicU8 = AtomicU8::new(0);

/// RAII helper that logs how long a pipeline stage took when dropped.
pub struct TimingGuard {
    label: Cow<'static, str>,
    level: Level,
    start: Instant,
    active: bool,
}

impl TimingGuard {
    /// Returns `true` when the guard will emit a log entry on drop.
    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Elapsed time since the guard was created.
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Stop the clock and return the duration. Still logs if the guard is active.
    pub fn finish(self) -> Duration {
        self.start.elapsed()
    }
}

impl Drop for TimingGuard {
    fn drop(&mut self) {
        if self.active {
            log!(
                target: TELEMETRY_TARGET,
                self.level,
                "{} completed in {:.2?}",
                self.label,
                self.start.elapsed()
            );
        }
    }
}

/// Create a timing guard that logs at `level` when telemetry allows it.
pub fn timing_guard(label: impl Into<Cow<'static, str>>, level: Level) -> TimingGuard {
    timing_guard_if(label, level, true)
}

/// Like [`timing_guard`], with an extra caller-controlled switch.
pub fn timing_guard_if(
    label: impl Into<Cow<'static, str>>,
    level: Level,
    enabled: bool,
) -> TimingGuard {
    let active =
        enabled && telemetry_allows(level) && log_enabled!(target: TELEMETRY_TARGET, level);
    TimingGuard {
        label: label.into(),
        level,
        start: Instant::now(),
        active,
    }
}

/// Configure the global telemetry state.
pub fn configure(enabled: bool, level: LevelFilter) {
    TELEMETRY_ENABLED.store(enabled, Ordering::Relaxed);
    TELEMETRY_LEVEL.store(level as usize as u8, Ordering::Relaxed);
}

/// Whether telemetry logging is currently enabled.
pub fn telemetry_enabled() -> bool {
    TELEMETRY_ENABLED.load(Ordering::Relaxed)
}

/// The most verbose level telemetry will emit.
pub fn telemetry_level() -> LevelFilter {
    match TELEMETRY_LEVEL.load(Ordering::Relaxed) {
        1 => LevelFilter::Error,
        2 => LevelFilter::Warn,
        3 => LevelFilter::Info,
        4 => LevelFilter::Debug,
        5 => LevelFilter::Trace,
        _ => LevelFilter::Off,
    }
}

/// Returns `true` when telemetry is enabled and `level` is within the configured threshold.
pub fn telemetry_allows(level: Level) -> bool {
    telemetry_enabled() && level <= telemetry_level()
}
