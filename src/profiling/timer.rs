//! Wall-clock timers handed out by backends
//!
//! Each backend's [`crate::backend::BackendConfig::timer`] returns a boxed
//! [`Timer`]. The host backends here all measure on the CPU; a device backend
//! would return one that brackets its queue instead.

use std::time::{Duration, Instant};

/// Timer produced by a backend for profiling one sequence at a time
pub trait Timer: Send {
    /// Mark the start of a timed region. Calling again restarts the timer.
    fn handle_begin(&mut self);

    /// Mark the end of the timed region.
    fn handle_end(&mut self);

    /// Microseconds between the last begin/end pair, if both happened
    fn elapsed_us(&self) -> Option<u64>;
}

/// CPU-side timer based on [`Instant`]
#[derive(Debug, Default)]
pub struct CpuTimer {
    start: Option<Instant>,
    elapsed: Option<Duration>,
}

impl CpuTimer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_started(&self) -> bool {
        self.start.is_some()
    }
}

impl Timer for CpuTimer {
    fn handle_begin(&mut self) {
        self.start = Some(Instant::now());
        self.elapsed = None;
    }

    fn handle_end(&mut self) {
        if let Some(start) = self.start {
            self.elapsed = Some(start.elapsed());
        }
    }

    fn elapsed_us(&self) -> Option<u64> {
        self.elapsed.map(|d| d.as_micros() as u64)
    }
}

/// Logs its lifetime at debug level when dropped.
#[derive(Debug)]
pub struct ScopedTimer {
    name: String,
    start: Instant,
}

impl ScopedTimer {
    pub fn new(name: impl Into<String>) -> Self {
        ScopedTimer {
            name: name.into(),
            start: Instant::now(),
        }
    }

    /// Elapsed time in milliseconds
    pub fn elapsed_ms(&self) -> f64 {
        self.start.elapsed().as_secs_f64() * 1000.0
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for ScopedTimer {
    fn drop(&mut self) {
        tracing::debug!(target: "graphforge::profiling", "{}: {:.3} ms", self.name, self.elapsed_ms());
    }
}
