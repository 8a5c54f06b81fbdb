//! Device-resident grid storage.

use bilgrid_compute::{ComputeDevice, DeviceBuffer, Dispatch, GridDims};
use tracing::{trace, warn};

use crate::error::{BilateralError, BilateralResult, Stage};

/// The grid buffer of one session: a weight plane followed by a value plane,
/// `x` fastest within each.
pub struct GridStore<B: DeviceBuffer> {
    buffer: B,
    dims: GridDims,
}

impl<B: DeviceBuffer> GridStore<B> {
    /// Allocate a grid for `dims` and zero-fill it. The allocator's contents
    /// are never trusted.
    pub(crate) fn create<D>(device: &D, dims: GridDims) -> BilateralResult<Self>
    where
        D: ComputeDevice<Buffer = B>,
    {
        let buffer = device.allocate(dims.buffer_len()).map_err(BilateralError::Allocation)?;
        let mut grid = Self { buffer, dims };

        let zeroed = grid.zero(device).and_then(|_| device.finish().map_err(BilateralError::kernel(Stage::Zero)));
        if let Err(e) = zeroed {
            if let Err(wait) = device.finish() {
                warn!(error = %wait, "device did not drain before releasing a failed grid");
            }
            device.release(grid.buffer);
            return Err(e);
        }
        Ok(grid)
    }

    fn zero<D: ComputeDevice<Buffer = B>>(&mut self, device: &D) -> BilateralResult<()> {
        let width = self.dims.size_x;
        let height = self.dims.buffer_len() / width;
        trace!(width, height, "grid::zero");
        device
            .exec_zero(&mut self.buffer, width, height, Dispatch::rounded(width, height))
            .map_err(BilateralError::kernel(Stage::Zero))
    }

    pub fn dims(&self) -> GridDims {
        self.dims
    }

    pub(crate) fn buffer(&self) -> &B {
        &self.buffer
    }

    pub(crate) fn buffer_mut(&mut self) -> &mut B {
        &mut self.buffer
    }

    pub(crate) fn into_buffer(self) -> B {
        self.buffer
    }
}

/// Host copy of a grid, for inspection and tests.
#[derive(Debug, Clone, PartialEq)]
pub struct GridSnapshot {
    pub dims: GridDims,
    /// Accumulated trilinear weights.
    pub weights: Vec<f32>,
    /// Accumulated weighted values.
    pub values: Vec<f32>,
}

impl GridSnapshot {
    pub(crate) fn from_raw(dims: GridDims, mut raw: Vec<f32>) -> BilateralResult<Self> {
        if raw.len() != dims.buffer_len() {
            return Err(BilateralError::InvalidParameter(format!(
                "grid download returned {} values, expected {}",
                raw.len(),
                dims.buffer_len()
            )));
        }
        let values = raw.split_off(dims.cells());
        Ok(Self { dims, weights: raw, values })
    }

    pub fn weight(&self, x: usize, y: usize, z: usize) -> f32 {
        self.weights[self.dims.index(x, y, z)]
    }

    pub fn value(&self, x: usize, y: usize, z: usize) -> f32 {
        self.values[self.dims.index(x, y, z)]
    }

    /// Mean intensity stored in a cell, if anything landed there.
    pub fn mean(&self, x: usize, y: usize, z: usize) -> Option<f32> {
        let w = self.weight(x, y, z);
        (w > 0.0).then(|| self.value(x, y, z) / w)
    }

    /// Sum of the weight plane.
    pub fn total_weight(&self) -> f64 {
        self.weights.iter().map(|&w| w as f64).sum()
    }

    /// Largest element-wise difference to `other`, both planes.
    pub fn max_abs_diff(&self, other: &GridSnapshot) -> f32 {
        self.weights
            .iter()
            .chain(&self.values)
            .zip(other.weights.iter().chain(&other.values))
            .map(|(a, b)| (a - b).abs())
            .fold(0.0, f32::max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bilgrid_compute::{CpuDevice, DeviceLimits};

    #[test]
    fn test_create_zeroes_poisoned_memory() {
        let device = CpuDevice::with_limits(DeviceLimits::default());
        let dims = GridDims::new(5, 6, 7);
        let grid = GridStore::create(&device, dims).unwrap();
        let raw = device.download(grid.buffer()).unwrap();
        assert_eq!(raw.len(), dims.buffer_len());
        assert!(raw.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_create_allocation_failure() {
        let device = CpuDevice::with_limits(DeviceLimits::default().with_memory(64, 64));
        let err = GridStore::create(&device, GridDims::new(5, 5, 5));
        assert!(matches!(err, Err(BilateralError::Allocation(_))));
    }

    #[test]
    fn test_snapshot_planes() {
        let dims = GridDims::new(5, 5, 5);
        let mut raw = vec![0.0; dims.buffer_len()];
        raw[dims.index(1, 2, 3)] = 2.0;
        raw[dims.cells() + dims.index(1, 2, 3)] = 1.0;
        let snap = GridSnapshot::from_raw(dims, raw).unwrap();
        assert_eq!(snap.weight(1, 2, 3), 2.0);
        assert_eq!(snap.mean(1, 2, 3), Some(0.5));
        assert_eq!(snap.mean(0, 0, 0), None);
        assert_eq!(snap.total_weight(), 2.0);
        assert_eq!(snap.max_abs_diff(&snap), 0.0);
    }
}
