//! Grid geometry and work-group sizing.
//!
//! Turns an image size plus requested sigmas into the integer grid
//! resolution, the effective sigmas that resolution implies, and the splat
//! work-group shape the device can run.

use bilgrid_compute::{
    Dispatch, GridDims, GridMapping, LineStrides, RANGE_EXTENT,
    SPLAT_LOCAL_BYTES_PER_ITEM,
};
use tracing::debug;

use crate::error::{BilateralError, BilateralResult};
use crate::probe::DeviceCapabilities;

/// Spatial grid resolution bounds before the `+1`.
pub const SPATIAL_CELLS: (f32, f32) = (4.0, 900.0);
/// Range grid resolution bounds before the `+1`.
pub const RANGE_CELLS: (f32, f32) = (4.0, 50.0);

/// Splat work-group shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkGroupShape {
    pub x: usize,
    pub y: usize,
}

impl WorkGroupShape {
    /// Edge length the search starts from.
    pub const INITIAL: usize = 64;
    /// Smallest acceptable work-group, 16x16.
    pub const MIN_ITEMS: usize = 16 * 16;

    pub fn items(&self) -> usize {
        self.x * self.y
    }

    /// Local memory the splat kernel reserves for this shape.
    pub fn local_bytes(&self) -> u64 {
        (self.items() * SPLAT_LOCAL_BYTES_PER_ITEM) as u64
    }

    fn fits(&self, caps: &DeviceCapabilities) -> bool {
        let l = &caps.limits;
        self.x <= l.max_work_item_sizes[0]
            && self.y <= l.max_work_item_sizes[1]
            && self.items() <= l.max_work_group_size
            && self.items() <= caps.splat_work_group_size
            && self.local_bytes() <= l.local_mem_size
    }

    /// Largest shape the device accepts, halving the larger side from 64x64
    /// (`y` on ties).
    pub fn fit(caps: &DeviceCapabilities) -> BilateralResult<Self> {
        let mut shape = Self { x: Self::INITIAL, y: Self::INITIAL };

        while !shape.fits(caps) {
            if shape.x == 1 || shape.y == 1 {
                break;
            }
            if shape.x > shape.y {
                shape.x >>= 1;
            } else {
                shape.y >>= 1;
            }
        }

        if shape.items() < Self::MIN_ITEMS {
            return Err(BilateralError::InsufficientDeviceResources(format!(
                "splat work-group shrank to {}x{}, below 16x16 (local memory {} bytes, max {} items)",
                shape.x, shape.y, caps.limits.local_mem_size, caps.limits.max_work_group_size
            )));
        }
        Ok(shape)
    }
}

/// Complete geometry of one filter session.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GridGeometry {
    pub width: usize,
    pub height: usize,
    pub dims: GridDims,
    /// Effective spatial sigma implied by the clamped grid size.
    pub sigma_s: f32,
    /// Effective range sigma implied by the clamped grid size.
    pub sigma_r: f32,
    pub block: WorkGroupShape,
}

/// Reject empty images and sigmas that are not positive finite numbers.
pub fn validate_params(width: usize, height: usize, sigma_s: f32, sigma_r: f32) -> BilateralResult<()> {
    if width == 0 || height == 0 {
        return Err(BilateralError::InvalidParameter(format!("image size {width}x{height} is empty")));
    }
    for (name, sigma) in [("sigma_s", sigma_s), ("sigma_r", sigma_r)] {
        if !sigma.is_finite() || sigma <= 0.0 {
            return Err(BilateralError::InvalidParameter(format!("{name} must be positive, got {sigma}")));
        }
    }
    Ok(())
}

#[inline]
fn cells(extent: f32, sigma: f32, bounds: (f32, f32)) -> usize {
    (extent / sigma).round().clamp(bounds.0, bounds.1) as usize + 1
}

impl GridGeometry {
    /// Grid resolution for an image and requested sigmas.
    pub fn grid_dims(width: usize, height: usize, sigma_s: f32, sigma_r: f32) -> GridDims {
        GridDims::new(
            cells(width as f32, sigma_s, SPATIAL_CELLS),
            cells(height as f32, sigma_s, SPATIAL_CELLS),
            cells(RANGE_EXTENT, sigma_r, RANGE_CELLS),
        )
    }

    /// Effective `(sigma_s, sigma_r)` of a grid covering `width x height`.
    pub fn effective_sigmas(width: usize, height: usize, dims: &GridDims) -> (f32, f32) {
        let sigma_s = (height as f32 / (dims.size_y - 1) as f32).max(width as f32 / (dims.size_x - 1) as f32);
        let sigma_r = RANGE_EXTENT / (dims.size_z - 1) as f32;
        (sigma_s, sigma_r)
    }

    /// Derive the session geometry, refusing grids or work-groups the device
    /// cannot hold.
    pub fn compute(
        width: usize,
        height: usize,
        sigma_s: f32,
        sigma_r: f32,
        caps: &DeviceCapabilities,
    ) -> BilateralResult<Self> {
        validate_params(width, height, sigma_s, sigma_r)?;

        let dims = Self::grid_dims(width, height, sigma_s, sigma_r);
        let (eff_s, eff_r) = Self::effective_sigmas(width, height, &dims);
        let block = WorkGroupShape::fit(caps)?;

        let geometry = Self { width, height, dims, sigma_s: eff_s, sigma_r: eff_r, block };
        let bytes = geometry.grid_bytes();
        if !caps.limits.fits_allocation(bytes) {
            return Err(BilateralError::InsufficientDeviceResources(format!(
                "grid of {bytes} bytes exceeds device memory (max allocation {}, total {})",
                caps.limits.max_alloc_bytes, caps.limits.total_memory
            )));
        }

        debug!(
            width, height,
            size_x = dims.size_x, size_y = dims.size_y, size_z = dims.size_z,
            sigma_s = eff_s, sigma_r = eff_r,
            block_x = block.x, block_y = block.y,
            "bilateral grid geometry"
        );
        Ok(geometry)
    }

    /// Pixel-to-grid mapping shared by splat and slice.
    pub fn mapping(&self) -> GridMapping {
        GridMapping {
            width: self.width,
            height: self.height,
            dims: self.dims,
            sigma_s: self.sigma_s,
            sigma_r: self.sigma_r,
        }
    }

    /// Device bytes of the grid buffer, all planes.
    pub fn grid_bytes(&self) -> u64 {
        self.dims.buffer_len() as u64 * size_of::<f32>() as u64
    }

    /// Splat dispatch: the whole image in blocks of the fitted shape.
    pub fn splat_dispatch(&self) -> Dispatch {
        Dispatch::with_local(self.width, self.height, [self.block.x, self.block.y])
    }

    /// Line families of the three blur passes, in order: along z, along y,
    /// along x.
    pub fn blur_passes(&self) -> [LineStrides; 3] {
        let GridDims { size_x: sx, size_y: sy, size_z: sz } = self.dims;
        [
            LineStrides { stride1: 1, stride2: sx, stride3: sx * sy, size1: sx, size2: sy, size3: sz },
            LineStrides { stride1: 1, stride2: sx * sy, stride3: sx, size1: sx, size2: sz, size3: sy },
            LineStrides { stride1: sx, stride2: sx * sy, stride3: 1, size1: sy, size2: sz, size3: sx },
        ]
    }
}
