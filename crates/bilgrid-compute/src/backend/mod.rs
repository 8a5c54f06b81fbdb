//! Compute backends for bilateral grid kernels.
//!
//! Provides a CPU (rayon) device and an optional CUDA device with automatic
//! selection.
//!
//! # Architecture
//!
//! ```text
//! ComputeDevice (query_limits / allocate / exec_* / finish)
//!     +-- CpuDevice  (rayon, emulated work-groups)
//!     +-- CudaDevice (NVIDIA CUDA)
//! ```
//!
//! Both devices validate every dispatch against their own limits, so a
//! work-group shape that would be rejected by real hardware is rejected by
//! the CPU device too.

mod device;
mod limits;
mod detect;
mod cpu_backend;

#[cfg(feature = "cuda")]
mod cuda_backend;

use std::fmt;
use std::str::FromStr;

// Core types
pub use device::{
    BLUR_WEIGHTS, ComputeDevice, DeviceBuffer, Dispatch, GRID_PLANES, GridDims, GridMapping,
    KernelId, LineStrides, RANGE_EXTENT, SLICE_MIN_WEIGHT, SPLAT_LOCAL_BYTES_PER_ITEM, SliceMode,
};
pub use limits::DeviceLimits;
pub use detect::{detect_backends, select_best_backend, describe_backends, BackendInfo};

// Backends
pub use cpu_backend::{CpuDevice, CpuBuffer};

#[cfg(feature = "cuda")]
pub use cuda_backend::{CudaDevice, CudaBuffer};

/// Available compute backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Backend {
    /// Auto-select best available (CUDA > CPU).
    #[default]
    Auto,
    /// CPU backend using rayon for parallelization.
    Cpu,
    /// NVIDIA CUDA backend.
    Cuda,
}

impl Backend {
    /// Backends that map to a device, in probe order.
    pub const CONCRETE: [Backend; 2] = [Backend::Cpu, Backend::Cuda];

    /// Check if this backend is available on current system.
    pub fn is_available(&self) -> bool {
        match self {
            Self::Auto => true,
            Self::Cpu => true,
            #[cfg(feature = "cuda")]
            Self::Cuda => CudaDevice::is_available(),
            #[cfg(not(feature = "cuda"))]
            Self::Cuda => false,
        }
    }

    /// Get human-readable name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::Cpu => "cpu",
            Self::Cuda => "cuda",
        }
    }

    /// Resolve `Auto` to a concrete backend.
    pub fn resolve(self) -> Backend {
        match self {
            Self::Auto => select_best_backend(),
            other => other,
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Backend {
    type Err = crate::ComputeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "cpu" => Ok(Self::Cpu),
            "cuda" | "gpu" => Ok(Self::Cuda),
            other => Err(crate::ComputeError::BackendNotAvailable(format!(
                "unknown backend '{other}' (expected auto, cpu or cuda)"
            ))),
        }
    }
}
