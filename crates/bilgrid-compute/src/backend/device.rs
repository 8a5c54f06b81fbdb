//! Device abstraction consumed by the bilateral grid pipeline.
//!
//! The trait mirrors what a compute runtime offers: limit queries, raw
//! buffer allocation, one enqueue entry point per kernel and a completion
//! barrier. Everything above it (geometry, sequencing, error policy) lives in
//! the `bilgrid` crate.

use crate::{ComputeError, ComputeResult};
use super::DeviceLimits;

/// Local memory one splat work item needs: eight trilinear weights plus one
/// cell index.
pub const SPLAT_LOCAL_BYTES_PER_ITEM: usize = 8 * size_of::<f32>() + size_of::<i32>();

/// Planes stored per grid: accumulated weight, then weighted value.
pub const GRID_PLANES: usize = 2;

/// Extent of the range axis in grid units. Normalised intensities in `[0, 1]`
/// map onto `[0, RANGE_EXTENT]`.
pub const RANGE_EXTENT: f32 = 100.0;

/// Binomial 5-tap stencil shared by all three blur passes.
pub const BLUR_WEIGHTS: [f32; 5] = [1.0 / 16.0, 4.0 / 16.0, 6.0 / 16.0, 4.0 / 16.0, 1.0 / 16.0];

/// Sampled weights below this are treated as empty grid space during slicing.
pub const SLICE_MIN_WEIGHT: f32 = 1e-6;

/// Kernels of the bilateral grid program.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KernelId {
    Zero,
    Splat,
    BlurLine,
    Slice,
}

impl KernelId {
    /// Every kernel in program order.
    pub const ALL: [KernelId; 4] = [Self::Zero, Self::Splat, Self::BlurLine, Self::Slice];

    /// Entry point name inside the compiled program.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Zero => "bilgrid_zero",
            Self::Splat => "bilgrid_splat",
            Self::BlurLine => "bilgrid_blur_line",
            Self::Slice => "bilgrid_slice",
        }
    }

    /// Local memory reserved per work item when this kernel runs with an
    /// explicit work-group shape.
    pub fn local_bytes_per_item(&self) -> usize {
        match self {
            Self::Splat => SPLAT_LOCAL_BYTES_PER_ITEM,
            _ => 0,
        }
    }
}

/// Handle to a device-resident `f32` buffer.
pub trait DeviceBuffer: Send + Sync {
    /// Number of `f32` elements.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Size in bytes of device memory used.
    fn size_bytes(&self) -> u64 {
        self.len() as u64 * size_of::<f32>() as u64
    }
}

/// Launch geometry of one 2-D kernel enqueue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dispatch {
    /// Global work size; kernels bound-check against their logical extent.
    pub global: [usize; 2],
    /// Work-group shape, or `None` to let the device choose.
    pub local: Option<[usize; 2]>,
}

impl Dispatch {
    /// Granularity global sizes are rounded to when no local size is given.
    pub const ROUNDING: usize = 16;

    /// Dispatch with a device-chosen work-group shape.
    pub fn rounded(width: usize, height: usize) -> Self {
        Self {
            global: [round_up(width, Self::ROUNDING), round_up(height, Self::ROUNDING)],
            local: None,
        }
    }

    /// Dispatch covering `width x height` items with an explicit work-group shape.
    pub fn with_local(width: usize, height: usize, local: [usize; 2]) -> Self {
        Self {
            global: [round_up(width, local[0]), round_up(height, local[1])],
            local: Some(local),
        }
    }

    /// Check this dispatch the way a runtime would before launching `kernel`.
    pub fn validate(&self, kernel: KernelId, limits: &DeviceLimits, kernel_limit: usize) -> ComputeResult<()> {
        let invalid = |reason: String| ComputeError::InvalidDispatch { kernel: kernel.name(), reason };

        if self.global[0] == 0 || self.global[1] == 0 {
            return Err(invalid(format!("empty global size {:?}", self.global)));
        }

        let Some(local) = self.local else {
            return Ok(());
        };

        if local[0] == 0 || local[1] == 0 {
            return Err(invalid(format!("empty local size {local:?}")));
        }
        if self.global[0] % local[0] != 0 || self.global[1] % local[1] != 0 {
            return Err(invalid(format!(
                "global size {:?} is not a multiple of local size {local:?}",
                self.global
            )));
        }
        if local[0] > limits.max_work_item_sizes[0] || local[1] > limits.max_work_item_sizes[1] {
            return Err(invalid(format!(
                "local size {local:?} exceeds max work item sizes {:?}",
                limits.max_work_item_sizes
            )));
        }

        let items = local[0] * local[1];
        if items > limits.max_work_group_size || items > kernel_limit {
            return Err(invalid(format!(
                "{items} work items exceed device limit {} / kernel limit {kernel_limit}",
                limits.max_work_group_size
            )));
        }

        let local_bytes = (items * kernel.local_bytes_per_item()) as u64;
        if local_bytes > limits.local_mem_size {
            return Err(invalid(format!(
                "{local_bytes} bytes of local memory exceed budget {}",
                limits.local_mem_size
            )));
        }
        Ok(())
    }

    /// Check that the global size covers a logical `width x height` extent.
    pub fn ensure_covers(&self, kernel: KernelId, width: usize, height: usize) -> ComputeResult<()> {
        if self.global[0] < width || self.global[1] < height {
            return Err(ComputeError::InvalidDispatch {
                kernel: kernel.name(),
                reason: format!("global size {:?} does not cover {width}x{height}", self.global),
            });
        }
        Ok(())
    }
}

#[inline]
fn round_up(value: usize, multiple: usize) -> usize {
    value.div_ceil(multiple).max(1) * multiple
}

/// Grid resolution; `x` varies fastest in memory, then `y`, then `z`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GridDims {
    pub size_x: usize,
    pub size_y: usize,
    pub size_z: usize,
}

impl GridDims {
    pub fn new(size_x: usize, size_y: usize, size_z: usize) -> Self {
        Self { size_x, size_y, size_z }
    }

    /// Cells in one plane.
    pub fn cells(&self) -> usize {
        self.size_x * self.size_y * self.size_z
    }

    /// Elements of the full grid buffer (all planes).
    pub fn buffer_len(&self) -> usize {
        self.cells() * GRID_PLANES
    }

    /// Linear index of a cell within one plane.
    #[inline]
    pub fn index(&self, x: usize, y: usize, z: usize) -> usize {
        (z * self.size_y + y) * self.size_x + x
    }
}

/// Mapping from pixel space onto grid space, shared by splat and slice.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GridMapping {
    pub width: usize,
    pub height: usize,
    pub dims: GridDims,
    /// Effective spatial sigma (pixels per grid cell).
    pub sigma_s: f32,
    /// Effective range sigma (range units per grid cell).
    pub sigma_r: f32,
}

impl GridMapping {
    /// Continuous grid coordinates of pixel `(x, y)` with value `v`, clamped
    /// into the grid.
    #[inline]
    pub fn grid_coords(&self, x: usize, y: usize, v: f32) -> [f32; 3] {
        let gx = x as f32 / self.sigma_s;
        let gy = y as f32 / self.sigma_s;
        let gz = v * RANGE_EXTENT / self.sigma_r;
        [
            clamp_coord(gx, self.dims.size_x),
            clamp_coord(gy, self.dims.size_y),
            clamp_coord(gz, self.dims.size_z),
        ]
    }

    /// Base cell and fractional offsets of the trilinear stencil around
    /// pixel `(x, y)` with value `v`. The base never exceeds `size - 2`.
    #[inline]
    pub fn trilinear(&self, x: usize, y: usize, v: f32) -> ([usize; 3], [f32; 3]) {
        let c = self.grid_coords(x, y, v);
        let sizes = [self.dims.size_x, self.dims.size_y, self.dims.size_z];
        let mut base = [0usize; 3];
        let mut frac = [0f32; 3];
        for axis in 0..3 {
            let b = (c[axis].floor() as usize).min(sizes[axis] - 2);
            base[axis] = b;
            frac[axis] = (c[axis] - b as f32).clamp(0.0, 1.0);
        }
        (base, frac)
    }
}

#[inline]
fn clamp_coord(c: f32, size: usize) -> f32 {
    if c.is_nan() {
        return 0.0;
    }
    c.clamp(0.0, (size - 1) as f32)
}

/// Strides describing a family of grid lines for the separable blur.
///
/// Line `(k, j)` starts at `k * stride1 + j * stride2` and walks `size3`
/// elements with step `stride3`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineStrides {
    pub stride1: usize,
    pub stride2: usize,
    pub stride3: usize,
    pub size1: usize,
    pub size2: usize,
    pub size3: usize,
}

impl LineStrides {
    /// Number of independent lines.
    pub fn lines(&self) -> usize {
        self.size1 * self.size2
    }

    /// One past the largest element index touched, relative to the plane offset.
    pub fn extent(&self) -> usize {
        (self.size1 - 1) * self.stride1 + (self.size2 - 1) * self.stride2 + (self.size3 - 1) * self.stride3 + 1
    }
}

/// How the slice kernel combines the smoothed sample `s` with the original `v`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SliceMode {
    /// `out = v + detail * (v - s)`.
    Detail { detail: f32 },
    /// `out = out + detail * (v - s)`, reading the existing output as base.
    Combine { detail: f32 },
    /// `out = s`.
    Smooth,
}

impl SliceMode {
    /// Numeric code passed to device kernels.
    pub fn code(&self) -> i32 {
        match self {
            Self::Detail { .. } => 0,
            Self::Combine { .. } => 1,
            Self::Smooth => 2,
        }
    }

    pub fn detail(&self) -> f32 {
        match self {
            Self::Detail { detail } | Self::Combine { detail } => *detail,
            Self::Smooth => 0.0,
        }
    }

    /// Apply the combination for one pixel.
    #[inline]
    pub fn combine(&self, v: f32, s: f32, base: f32) -> f32 {
        match *self {
            Self::Detail { detail } => v + detail * (v - s),
            Self::Combine { detail } => base + detail * (v - s),
            Self::Smooth => s,
        }
    }
}

/// Compute device offering the bilateral grid kernels.
pub trait ComputeDevice: Send + Sync {
    /// Backend-specific buffer handle type.
    type Buffer: DeviceBuffer;

    /// Backend name.
    fn name(&self) -> &'static str;

    /// Device identifier within its backend.
    fn ordinal(&self) -> usize;

    /// Work-group and memory limits of the device.
    fn query_limits(&self) -> ComputeResult<DeviceLimits>;

    /// Work-group item ceiling for one specific kernel.
    fn kernel_work_group_size(&self, kernel: KernelId) -> ComputeResult<usize>;

    /// Allocate `len` floats of device memory. Contents are unspecified.
    fn allocate(&self, len: usize) -> ComputeResult<Self::Buffer>;

    /// Release a buffer. Callers must `finish` first if work may be in flight.
    fn release(&self, buffer: Self::Buffer) {
        drop(buffer);
    }

    /// Upload host data into a new buffer.
    fn upload(&self, data: &[f32]) -> ComputeResult<Self::Buffer>;

    /// Download a buffer to the host.
    fn download(&self, buffer: &Self::Buffer) -> ComputeResult<Vec<f32>>;

    /// Fill `width x height` elements with zero.
    fn exec_zero(&self, buffer: &mut Self::Buffer, width: usize, height: usize, dispatch: Dispatch) -> ComputeResult<()>;

    /// Accumulate every pixel of `input` into `grid`.
    fn exec_splat(&self, input: &Self::Buffer, grid: &mut Self::Buffer,
                  mapping: &GridMapping, dispatch: Dispatch) -> ComputeResult<()>;

    /// Blur one family of lines of the plane starting at `offset`.
    fn exec_blur_line(&self, grid: &mut Self::Buffer, offset: usize,
                      strides: &LineStrides, dispatch: Dispatch) -> ComputeResult<()>;

    /// Sample `grid` for every pixel and write the combination into `output`.
    fn exec_slice(&self, input: &Self::Buffer, output: &mut Self::Buffer, grid: &Self::Buffer,
                  mapping: &GridMapping, mode: SliceMode, dispatch: Dispatch) -> ComputeResult<()>;

    /// Block until all enqueued work has completed.
    fn finish(&self) -> ComputeResult<()>;
}
