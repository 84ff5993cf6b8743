//! Runtime configuration.
//!
//! This module defines the knobs shared by graph compilation, execution and
//! cost estimation, and keeps the process-wide default computation mode.
//!
//! # Computation Modes
//!
//! - `Training` — forward and backward phases are planned, executed and measured (default).
//! - `Inference` — only init and forward are meaningful; the simulator skips backward.
//!
//! The default mode is stored globally using an `AtomicU8`, so a freshly
//! built [`Config`] picks up whatever mode the process selected last.

use core::convert::TryFrom;
use core::sync::atomic::{AtomicU8, Ordering};

/// Whether gradients are part of the computation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum ComputationMode {
    /// Forward and backward (default).
    #[default]
    Training = 0,
    /// Forward only.
    Inference = 1,
}

impl TryFrom<u8> for ComputationMode {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Training),
            1 => Ok(Self::Inference),
            _ => Err(()),
        }
    }
}

/// Process-wide default computation mode.
///
/// Relaxed ordering is enough: the mode is chosen once at startup and only
/// read when a configuration is built.
static GLOBAL_COMPUTATION_MODE: AtomicU8 = AtomicU8::new(ComputationMode::Training as u8);

/// Sets the default computation mode for configurations built afterwards.
///
/// # Example
/// ```
/// use briny_dist::config::{set_computation_mode, ComputationMode};
/// set_computation_mode(ComputationMode::Training);
/// ```
pub fn set_computation_mode(mode: ComputationMode) {
    GLOBAL_COMPUTATION_MODE.store(mode as u8, Ordering::Relaxed);
}

/// Returns the default computation mode.
///
/// If the stored value is invalid, defaults to `ComputationMode::Training`.
pub fn get_computation_mode() -> ComputationMode {
    ComputationMode::try_from(GLOBAL_COMPUTATION_MODE.load(Ordering::Relaxed)).unwrap_or_default()
}

/// Configuration for compiling, executing and measuring operators.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Training or inference.
    pub computation_mode: ComputationMode,

    /// Time and log every kernel invocation.
    pub profiling: bool,

    /// Let [`Model::compile`](crate::graph::Model::compile) alias outputs onto
    /// operand-1 for eligible operators that were not explicitly requested.
    pub enable_inplace_optimizations: bool,

    /// Partition degree applied to the outermost dimension of every tensor
    /// when it divides that dimension.
    pub data_parallelism_degree: usize,

    /// Worker threads in the execution pool; `0` lets rayon decide.
    pub workers: usize,

    /// Untimed runs before each cost measurement.
    pub warmup_iters: usize,

    /// Timed runs averaged into each cost measurement.
    pub repeat_iters: usize,

    /// Scratch arena size of the simulator, in bytes.
    pub simulator_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            computation_mode: get_computation_mode(),
            profiling: false,
            enable_inplace_optimizations: false,
            data_parallelism_degree: 1,
            workers: 0,
            warmup_iters: 1,
            repeat_iters: 4,
            simulator_capacity: 64 << 20,
        }
    }
}

impl Config {
    /// Sets the computation mode.
    #[must_use]
    pub const fn with_computation_mode(mut self, mode: ComputationMode) -> Self {
        self.computation_mode = mode;
        self
    }

    /// Enables or disables kernel profiling.
    #[must_use]
    pub const fn with_profiling(mut self, profiling: bool) -> Self {
        self.profiling = profiling;
        self
    }

    /// Enables or disables automatic in-place aliasing.
    #[must_use]
    pub const fn with_inplace_optimizations(mut self, enable: bool) -> Self {
        self.enable_inplace_optimizations = enable;
        self
    }

    /// Sets the data-parallel degree (clamped to at least 1).
    #[must_use]
    pub fn with_data_parallelism(mut self, degree: usize) -> Self {
        self.data_parallelism_degree = degree.max(1);
        self
    }

    /// Sets the number of worker threads.
    #[must_use]
    pub const fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// Sets the warmup and timed iteration counts of cost measurements.
    #[must_use]
    pub fn with_measurement_iters(mut self, warmup: usize, repeat: usize) -> Self {
        self.warmup_iters = warmup;
        self.repeat_iters = repeat.max(1);
        self
    }

    /// Sets the simulator arena size in bytes.
    #[must_use]
    pub const fn with_simulator_capacity(mut self, bytes: usize) -> Self {
        self.simulator_capacity = bytes;
        self
    }

    /// True if backward phases are planned and measured.
    pub fn is_training(&self) -> bool {
        self.computation_mode == ComputationMode::Training
    }
}
