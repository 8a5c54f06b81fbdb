//! # bilgrid
//!
//! Edge-aware smoothing with a bilateral grid.
//!
//! The image is splatted into a small 3-D grid (x, y, intensity), the grid is
//! blurred along each axis, and every pixel reads its smoothed value back by
//! trilinear interpolation. Cost scales with the grid, not with the filter
//! radius.
//!
//! # Modules
//!
//! - [`probe`] - Device capability queries
//! - [`geometry`] - Grid resolution, effective sigmas, work-group sizing
//! - [`grid`] - Device grid storage and host snapshots
//! - [`session`] - Session lifecycle and the splat/blur/slice stages
//! - [`filter`] - One-call host API
//!
//! # Example
//!
//! ```rust,ignore
//! use bilgrid::{Session, BilateralParams};
//! use bilgrid_compute::{ComputeDevice, CpuDevice};
//!
//! let device = CpuDevice::new();
//! let input = device.upload(&pixels)?;
//! let mut output = device.allocate(pixels.len())?;
//!
//! let mut session = Session::create(&device, width, height, 8.0, 10.0)?;
//! session.splat_and_blur(&input)?;
//! session.slice_to_output(&input, &mut output, 0.5)?;
//! session.destroy()?;
//! ```

mod error;
pub mod filter;
pub mod geometry;
pub mod grid;
pub mod probe;
pub mod session;

pub use error::{BilateralError, BilateralResult, Stage};
pub use filter::{BilateralParams, FilterMode, bilateral_filter, bilateral_filter_onto};
pub use geometry::{GridGeometry, WorkGroupShape};
pub use grid::{GridSnapshot, GridStore};
pub use probe::DeviceCapabilities;
pub use session::{Session, SessionState, destroy_session};
