//! CPU backend using rayon for parallelization.
//!
//! Kernels run synchronously on the rayon pool, one rayon task per emulated
//! work-group (splat) or per independent line/pixel (blur, slice, zero).
//! Buffers are stored as `f32` bit patterns in atomics so that scattered
//! accumulation and strided line writes stay race-free without `unsafe`.

use std::sync::atomic::{AtomicU32, Ordering};

use rayon::prelude::*;
use tracing::trace;

use super::DeviceLimits;
use super::device::{
    BLUR_WEIGHTS, ComputeDevice, DeviceBuffer, Dispatch, GridMapping, KernelId,
    LineStrides, SLICE_MIN_WEIGHT, SliceMode,
};
use crate::{ComputeError, ComputeResult, config};

/// Bit pattern fresh CPU buffers are filled with (a quiet NaN), so reads of
/// memory no kernel wrote are visible.
const POISON_BITS: u32 = 0x7fc0_dead;

/// CPU buffer handle - data stored in RAM.
pub struct CpuBuffer {
    data: Vec<AtomicU32>,
}

impl CpuBuffer {
    fn poisoned(len: usize) -> ComputeResult<Self> {
        let mut data = Vec::new();
        data.try_reserve_exact(len).map_err(|e| ComputeError::Allocation {
            bytes: len as u64 * 4,
            reason: e.to_string(),
        })?;
        data.resize_with(len, || AtomicU32::new(POISON_BITS));
        Ok(Self { data })
    }

    #[inline]
    fn load(&self, i: usize) -> f32 {
        f32::from_bits(self.data[i].load(Ordering::Relaxed))
    }

    #[inline]
    fn store(&self, i: usize, v: f32) {
        self.data[i].store(v.to_bits(), Ordering::Relaxed);
    }

    /// Copy of the contents as floats.
    pub fn to_vec(&self) -> Vec<f32> {
        self.data.iter().map(|a| f32::from_bits(a.load(Ordering::Relaxed))).collect()
    }
}

impl DeviceBuffer for CpuBuffer {
    fn len(&self) -> usize {
        self.data.len()
    }
}

/// Order-independent `f32` addition on an atomic cell.
#[inline]
fn atomic_add(cell: &AtomicU32, v: f32) {
    let mut current = cell.load(Ordering::Relaxed);
    loop {
        let next = (f32::from_bits(current) + v).to_bits();
        match cell.compare_exchange_weak(current, next, Ordering::Relaxed, Ordering::Relaxed) {
            Ok(_) => return,
            Err(actual) => current = actual,
        }
    }
}

/// CPU device implementation.
pub struct CpuDevice {
    limits: DeviceLimits,
    /// Work-group item ceiling of the splat kernel.
    splat_ceiling: usize,
}

impl CpuDevice {
    /// CPU device with default limits, environment overrides and system RAM.
    pub fn new() -> Self {
        let mut limits = DeviceLimits::default();
        if let Some(bytes) = config::local_mem_override() {
            limits.local_mem_size = bytes;
        }
        if let Some(items) = config::work_group_override() {
            limits.max_work_group_size = items;
        }
        let total = config::system_memory();
        limits.total_memory = total;
        limits.max_alloc_bytes = limits.max_alloc_bytes.max(total / 4);

        Self::with_limits(limits)
    }

    /// CPU device reporting exactly `limits`.
    pub fn with_limits(limits: DeviceLimits) -> Self {
        let splat_ceiling = limits.max_work_group_size;
        Self { limits, splat_ceiling }
    }

    /// Lower the splat kernel ceiling below the device work-group limit.
    pub fn with_splat_ceiling(mut self, items: usize) -> Self {
        self.splat_ceiling = items;
        self
    }

    fn ceiling(&self, kernel: KernelId) -> usize {
        match kernel {
            KernelId::Splat => self.splat_ceiling.min(self.limits.max_work_group_size),
            _ => self.limits.max_work_group_size,
        }
    }

    fn check_len(expected: usize, buffer: &CpuBuffer) -> ComputeResult<()> {
        if buffer.len() != expected {
            return Err(ComputeError::BufferSizeMismatch { expected, actual: buffer.len() });
        }
        Ok(())
    }
}

impl Default for CpuDevice {
    fn default() -> Self {
        Self::new()
    }
}

/// Local accumulation area of one work-group: the grid cells its pixels
/// can reach, both planes.
struct LocalTile {
    x0: usize,
    y0: usize,
    nx: usize,
    ny: usize,
    nz: usize,
    weights: Vec<f32>,
    values: Vec<f32>,
}

impl LocalTile {
    fn new(x0: usize, y0: usize, nx: usize, ny: usize, nz: usize) -> Self {
        let n = nx * ny * nz;
        Self { x0, y0, nx, ny, nz, weights: vec![0.0; n], values: vec![0.0; n] }
    }

    #[inline]
    fn accumulate(&mut self, base: [usize; 3], frac: [f32; 3], v: f32) {
        for dz in 0..2 {
            let wz = if dz == 0 { 1.0 - frac[2] } else { frac[2] };
            for dy in 0..2 {
                let wy = if dy == 0 { 1.0 - frac[1] } else { frac[1] };
                for dx in 0..2 {
                    let wx = if dx == 0 { 1.0 - frac[0] } else { frac[0] };
                    let w = wx * wy * wz;
                    let lx = base[0] + dx - self.x0;
                    let ly = base[1] + dy - self.y0;
                    let i = ((base[2] + dz) * self.ny + ly) * self.nx + lx;
                    self.weights[i] += w;
                    self.values[i] += w * v;
                }
            }
        }
    }

    /// Add the local sums into the global grid.
    fn flush(&self, grid: &CpuBuffer, mapping: &GridMapping) {
        let plane = mapping.dims.cells();
        for z in 0..self.nz {
            for ly in 0..self.ny {
                for lx in 0..self.nx {
                    let i = (z * self.ny + ly) * self.nx + lx;
                    let w = self.weights[i];
                    if w == 0.0 {
                        continue;
                    }
                    let g = mapping.dims.index(self.x0 + lx, self.y0 + ly, z);
                    atomic_add(&grid.data[g], w);
                    atomic_add(&grid.data[plane + g], self.values[i]);
                }
            }
        }
    }
}

/// Convolve one line with the blur stencil; taps outside the line are zero.
fn blur_line(src: &[f32], dst: &mut [f32]) {
    let n = src.len() as isize;
    let radius = (BLUR_WEIGHTS.len() / 2) as isize;
    for (i, out) in dst.iter_mut().enumerate() {
        let mut acc = 0.0;
        for (t, w) in BLUR_WEIGHTS.iter().enumerate() {
            let j = i as isize + t as isize - radius;
            if (0..n).contains(&j) {
                acc += w * src[j as usize];
            }
        }
        *out = acc;
    }
}

/// Trilinear sample of one grid plane.
#[inline]
fn sample(grid: &CpuBuffer, offset: usize, mapping: &GridMapping, base: [usize; 3], frac: [f32; 3]) -> f32 {
    let dims = &mapping.dims;
    let at = |dx: usize, dy: usize, dz: usize| grid.load(offset + dims.index(base[0] + dx, base[1] + dy, base[2] + dz));

    let c00 = at(0, 0, 0) + frac[0] * (at(1, 0, 0) - at(0, 0, 0));
    let c10 = at(0, 1, 0) + frac[0] * (at(1, 1, 0) - at(0, 1, 0));
    let c01 = at(0, 0, 1) + frac[0] * (at(1, 0, 1) - at(0, 0, 1));
    let c11 = at(0, 1, 1) + frac[0] * (at(1, 1, 1) - at(0, 1, 1));

    let c0 = c00 + frac[1] * (c10 - c00);
    let c1 = c01 + frac[1] * (c11 - c01);

    c0 + frac[2] * (c1 - c0)
}

impl ComputeDevice for CpuDevice {
    type Buffer = CpuBuffer;

    fn name(&self) -> &'static str {
        "CPU"
    }

    fn ordinal(&self) -> usize {
        0
    }

    fn query_limits(&self) -> ComputeResult<DeviceLimits> {
        Ok(self.limits.clone())
    }

    fn kernel_work_group_size(&self, kernel: KernelId) -> ComputeResult<usize> {
        Ok(self.ceiling(kernel))
    }

    fn allocate(&self, len: usize) -> ComputeResult<Self::Buffer> {
        let bytes = len as u64 * 4;
        if !self.limits.fits_allocation(bytes) {
            return Err(ComputeError::Allocation {
                bytes,
                reason: format!("exceeds max allocation of {}", config::format_bytes(self.limits.max_alloc_bytes)),
            });
        }
        CpuBuffer::poisoned(len)
    }

    fn upload(&self, data: &[f32]) -> ComputeResult<Self::Buffer> {
        Ok(CpuBuffer { data: data.iter().map(|v| AtomicU32::new(v.to_bits())).collect() })
    }

    fn download(&self, buffer: &Self::Buffer) -> ComputeResult<Vec<f32>> {
        Ok(buffer.to_vec())
    }

    fn exec_zero(&self, buffer: &mut Self::Buffer, width: usize, height: usize, dispatch: Dispatch) -> ComputeResult<()> {
        dispatch.validate(KernelId::Zero, &self.limits, self.ceiling(KernelId::Zero))?;
        dispatch.ensure_covers(KernelId::Zero, width, height)?;
        let n = width * height;
        if n > buffer.len() {
            return Err(ComputeError::BufferSizeMismatch { expected: n, actual: buffer.len() });
        }
        trace!(width, height, "cpu::zero");

        buffer.data[..n].par_iter_mut().for_each(|cell| *cell.get_mut() = 0);
        Ok(())
    }

    fn exec_splat(&self, input: &Self::Buffer, grid: &mut Self::Buffer,
                  mapping: &GridMapping, dispatch: Dispatch) -> ComputeResult<()> {
        dispatch.validate(KernelId::Splat, &self.limits, self.ceiling(KernelId::Splat))?;
        let Some(local) = dispatch.local else {
            return Err(ComputeError::InvalidDispatch {
                kernel: KernelId::Splat.name(),
                reason: "splat needs an explicit work-group shape".into(),
            });
        };
        dispatch.ensure_covers(KernelId::Splat, mapping.width, mapping.height)?;
        Self::check_len(mapping.width * mapping.height, input)?;
        Self::check_len(mapping.dims.buffer_len(), grid)?;

        let (width, height) = (mapping.width, mapping.height);
        let groups_x = dispatch.global[0] / local[0];
        let groups_y = dispatch.global[1] / local[1];
        trace!(width, height, groups_x, groups_y, local_x = local[0], local_y = local[1], "cpu::splat");

        let grid: &CpuBuffer = grid;
        (0..groups_x * groups_y).into_par_iter().for_each(|group| {
            let px0 = (group % groups_x) * local[0];
            let py0 = (group / groups_x) * local[1];
            if px0 >= width || py0 >= height {
                return;
            }
            let px1 = (px0 + local[0]).min(width);
            let py1 = (py0 + local[1]).min(height);

            // Base cells are monotonic in pixel position, so the corners bound the footprint.
            let (lo, _) = mapping.trilinear(px0, py0, 0.0);
            let (hi, _) = mapping.trilinear(px1 - 1, py1 - 1, 0.0);
            let mut tile = LocalTile::new(
                lo[0],
                lo[1],
                hi[0] - lo[0] + 2,
                hi[1] - lo[1] + 2,
                mapping.dims.size_z,
            );

            for y in py0..py1 {
                for x in px0..px1 {
                    let v = input.load(y * width + x);
                    let (base, frac) = mapping.trilinear(x, y, v);
                    tile.accumulate(base, frac, v);
                }
            }
            tile.flush(grid, mapping);
        });

        Ok(())
    }

    fn exec_blur_line(&self, grid: &mut Self::Buffer, offset: usize,
                      strides: &LineStrides, dispatch: Dispatch) -> ComputeResult<()> {
        dispatch.validate(KernelId::BlurLine, &self.limits, self.ceiling(KernelId::BlurLine))?;
        dispatch.ensure_covers(KernelId::BlurLine, strides.size1, strides.size2)?;
        if strides.lines() == 0 || strides.size3 == 0 {
            return Ok(());
        }
        let end = offset + strides.extent();
        if end > grid.len() {
            return Err(ComputeError::BufferSizeMismatch { expected: end, actual: grid.len() });
        }
        trace!(offset, ?strides, "cpu::blur_line");

        let grid: &CpuBuffer = grid;
        let s = *strides;
        (0..s.lines()).into_par_iter().for_each_init(
            || (vec![0.0f32; s.size3], vec![0.0f32; s.size3]),
            |(line, blurred), l| {
                let k = l % s.size1;
                let j = l / s.size1;
                let start = offset + k * s.stride1 + j * s.stride2;
                for (i, v) in line.iter_mut().enumerate() {
                    *v = grid.load(start + i * s.stride3);
                }
                blur_line(line.as_slice(), blurred.as_mut_slice());
                for (i, v) in blurred.iter().enumerate() {
                    grid.store(start + i * s.stride3, *v);
                }
            },
        );

        Ok(())
    }

    fn exec_slice(&self, input: &Self::Buffer, output: &mut Self::Buffer, grid: &Self::Buffer,
                  mapping: &GridMapping, mode: SliceMode, dispatch: Dispatch) -> ComputeResult<()> {
        dispatch.validate(KernelId::Slice, &self.limits, self.ceiling(KernelId::Slice))?;
        dispatch.ensure_covers(KernelId::Slice, mapping.width, mapping.height)?;
        let n = mapping.width * mapping.height;
        Self::check_len(n, input)?;
        Self::check_len(n, output)?;
        Self::check_len(mapping.dims.buffer_len(), grid)?;
        trace!(width = mapping.width, height = mapping.height, ?mode, "cpu::slice");

        let plane = mapping.dims.cells();
        let width = mapping.width;
        output.data.par_iter_mut().enumerate().for_each(|(i, out)| {
            let (x, y) = (i % width, i / width);
            let v = input.load(i);
            let (base, frac) = mapping.trilinear(x, y, v);
            let weight = sample(grid, 0, mapping, base, frac);
            let s = if weight > SLICE_MIN_WEIGHT {
                sample(grid, plane, mapping, base, frac) / weight
            } else {
                v
            };
            let prior = f32::from_bits(*out.get_mut());
            *out.get_mut() = mode.combine(v, s, prior).to_bits();
        });

        Ok(())
    }

    fn finish(&self) -> ComputeResult<()> {
        // Every CPU kernel has completed by the time its exec_* call returns.
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::GridDims;

    fn device() -> CpuDevice {
        CpuDevice::with_limits(DeviceLimits::default())
    }

    fn mapping(width: usize, height: usize, dims: GridDims, sigma_s: f32, sigma_r: f32) -> GridMapping {
        GridMapping { width, height, dims, sigma_s, sigma_r }
    }

    #[test]
    fn test_allocate_is_poisoned() {
        let buf = device().allocate(8).unwrap();
        assert!(buf.to_vec().iter().all(|v| v.is_nan()));
    }

    #[test]
    fn test_allocate_rejects_oversized() {
        let dev = CpuDevice::with_limits(DeviceLimits::default().with_memory(1024, 1024));
        assert!(matches!(dev.allocate(1000), Err(ComputeError::Allocation { .. })));
    }

    #[test]
    fn test_zero_fill() {
        let dev = device();
        let mut buf = dev.allocate(5 * 12).unwrap();
        dev.exec_zero(&mut buf, 5, 12, Dispatch::rounded(5, 12)).unwrap();
        assert!(buf.to_vec().iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_atomic_add() {
        let cell = AtomicU32::new(0f32.to_bits());
        (0..1000).into_par_iter().for_each(|_| atomic_add(&cell, 0.5));
        assert_eq!(f32::from_bits(cell.load(Ordering::Relaxed)), 500.0);
    }

    #[test]
    fn test_splat_conserves_weight() {
        let dev = device();
        let dims = GridDims::new(5, 5, 5);
        let m = mapping(8, 8, dims, 2.0, 25.0);
        let data: Vec<f32> = (0..64).map(|i| (i % 7) as f32 / 7.0).collect();
        let input = dev.upload(&data).unwrap();
        let mut grid = dev.allocate(dims.buffer_len()).unwrap();
        dev.exec_zero(&mut grid, dims.size_x, dims.size_y * dims.size_z * 2, Dispatch::rounded(5, 50)).unwrap();
        dev.exec_splat(&input, &mut grid, &m, Dispatch::with_local(8, 8, [4, 4])).unwrap();

        let g = grid.to_vec();
        let plane = dims.cells();
        let total_w: f32 = g[..plane].iter().sum();
        let total_v: f32 = g[plane..].iter().sum();
        let expected_v: f32 = data.iter().sum();
        assert!((total_w - 64.0).abs() < 1e-3);
        assert!((total_v - expected_v).abs() < 1e-3);
    }

    #[test]
    fn test_splat_requires_local_size() {
        let dev = device();
        let dims = GridDims::new(5, 5, 5);
        let m = mapping(4, 4, dims, 1.0, 25.0);
        let input = dev.upload(&[0.5; 16]).unwrap();
        let mut grid = dev.allocate(dims.buffer_len()).unwrap();
        let err = dev.exec_splat(&input, &mut grid, &m, Dispatch::rounded(4, 4));
        assert!(matches!(err, Err(ComputeError::InvalidDispatch { .. })));
    }

    #[test]
    fn test_blur_line_interior_and_edges() {
        let mut src = vec![0.0f32; 9];
        src[4] = 16.0;
        let mut dst = vec![0.0f32; 9];
        blur_line(&src, &mut dst);
        assert_eq!(&dst[2..7], &[1.0, 4.0, 6.0, 4.0, 1.0]);

        // taps past the end contribute nothing
        let src = vec![16.0f32; 3];
        let mut dst = vec![0.0f32; 3];
        blur_line(&src, &mut dst);
        assert_eq!(dst, vec![11.0, 14.0, 11.0]);
    }

    #[test]
    fn test_blur_strided_lines() {
        let dev = device();
        // 3 columns of 5, blur along the column (stride 3)
        let mut data = vec![0.0f32; 15];
        data[2 * 3 + 1] = 16.0;
        let mut buf = dev.upload(&data).unwrap();
        let strides = LineStrides { stride1: 1, stride2: 0, stride3: 3, size1: 3, size2: 1, size3: 5 };
        dev.exec_blur_line(&mut buf, 0, &strides, Dispatch::rounded(3, 1)).unwrap();
        let out = buf.to_vec();
        let column: Vec<f32> = (0..5).map(|i| out[i * 3 + 1]).collect();
        assert_eq!(column, vec![1.0, 4.0, 6.0, 4.0, 1.0]);
        assert!((0..5).all(|i| out[i * 3] == 0.0 && out[i * 3 + 2] == 0.0));
    }

    #[test]
    fn test_blur_rejects_out_of_bounds() {
        let dev = device();
        let mut buf = dev.upload(&[0.0; 10]).unwrap();
        let strides = LineStrides { stride1: 1, stride2: 0, stride3: 5, size1: 5, size2: 1, size3: 3 };
        assert!(dev.exec_blur_line(&mut buf, 0, &strides, Dispatch::rounded(5, 1)).is_err());
    }

    #[test]
    fn test_slice_empty_grid_returns_input() {
        let dev = device();
        let dims = GridDims::new(5, 5, 5);
        let m = mapping(2, 2, dims, 1.0, 25.0);
        let mut grid = dev.allocate(dims.buffer_len()).unwrap();
        dev.exec_zero(&mut grid, 5, 50, Dispatch::rounded(5, 50)).unwrap();
        let input = dev.upload(&[0.1, 0.2, 0.3, 0.4]).unwrap();
        let mut output = dev.upload(&[0.0; 4]).unwrap();
        dev.exec_slice(&input, &mut output, &grid, &m, SliceMode::Smooth, Dispatch::rounded(2, 2)).unwrap();
        assert_eq!(output.to_vec(), vec![0.1, 0.2, 0.3, 0.4]);
    }
}
