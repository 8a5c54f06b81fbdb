//! Compute backends for bilateral grid filtering.
//!
//! Provides a CPU (rayon) device and an optional CUDA device behind one
//! narrow device trait. The filter core only ever talks to [`ComputeDevice`].
//!
//! # Architecture
//!
//! ```text
//! Session (bilgrid crate)
//!     └── ComputeDevice trait
//!             ├── CpuDevice  (rayon, work-group emulation)
//!             └── CudaDevice (NVRTC-compiled kernels)
//! ```
//!
//! # Example
//!
//! ```ignore
//! use bilgrid_compute::{ComputeDevice, CpuDevice, KernelId};
//!
//! let device = CpuDevice::new();
//! let limits = device.query_limits()?;
//! let ceiling = device.kernel_work_group_size(KernelId::Splat)?;
//! ```

pub mod backend;
pub mod config;

pub use backend::{
    BLUR_WEIGHTS, Backend, BackendInfo, ComputeDevice, CpuBuffer, CpuDevice, DeviceBuffer,
    DeviceLimits, Dispatch, GRID_PLANES, GridDims, GridMapping, KernelId, LineStrides,
    RANGE_EXTENT, SLICE_MIN_WEIGHT, SPLAT_LOCAL_BYTES_PER_ITEM, SliceMode, describe_backends,
    detect_backends, select_best_backend,
};

#[cfg(feature = "cuda")]
pub use backend::{CudaBuffer, CudaDevice};

use thiserror::Error;

/// Compute device errors
#[derive(Error, Debug)]
pub enum ComputeError {
    #[error("Backend not available: {0}")]
    BackendNotAvailable(String),

    #[error("Failed to create device: {0}")]
    DeviceCreation(String),

    #[error("Device query failed: {0}")]
    DeviceQuery(String),

    #[error("Failed to allocate {bytes} bytes of device memory: {reason}")]
    Allocation { bytes: u64, reason: String },

    #[error("Failed to compile kernels: {0}")]
    ShaderCompilation(String),

    #[error("Buffer size mismatch: expected {expected}, got {actual}")]
    BufferSizeMismatch { expected: usize, actual: usize },

    #[error("Invalid dispatch for {kernel}: {reason}")]
    InvalidDispatch { kernel: &'static str, reason: String },

    #[error("Kernel {kernel} failed: {reason}")]
    LaunchFailed { kernel: &'static str, reason: String },

    #[error("Device operation failed: {0}")]
    OperationFailed(String),
}

pub type ComputeResult<T> = Result<T, ComputeError>;
