//! Filter command
//!
//! Smooths or detail-grades an image with the bilateral grid. By default the
//! luminance is filtered and the change is added back to R, G and B; with
//! `--per-channel` each colour channel runs its own session.

use crate::FilterArgs;
use anyhow::{Context, Result};
use bilgrid::{BilateralParams, BilateralResult, FilterMode, bilateral_filter};
use bilgrid_compute::{Backend, ComputeDevice, CpuDevice};
use rayon::prelude::*;
use tracing::{debug, info, trace, warn};

/// Rec.709 luminance weights.
const LUMA: [f32; 3] = [0.2126, 0.7152, 0.0722];

pub fn run(args: FilterArgs, backend: Backend, verbose: u8) -> Result<()> {
    trace!(input = %args.input.display(), sigma_s = args.sigma_s, sigma_r = args.sigma_r, detail = args.detail, "filter::run");

    let image = super::load_image(&args.input)?;
    let source = image.color();
    let mut pixels = image.to_rgba32f();
    let (width, height) = (pixels.width() as usize, pixels.height() as usize);

    let params = BilateralParams::new(args.sigma_s, args.sigma_r, args.detail);
    let mode = if args.smooth { FilterMode::Smooth } else { FilterMode::Detail };

    info!(w = width, h = height, ?params, ?mode, per_channel = args.per_channel, "Filtering");
    if verbose > 0 {
        println!("Filtering {} ({}x{}) sigma_s={} sigma_r={} detail={}",
            args.input.display(), width, height, args.sigma_s, args.sigma_r, args.detail);
    }

    let planes: Vec<Vec<f32>> = if args.per_channel {
        (0..3).map(|c| pixels.pixels().map(|p| p.0[c]).collect()).collect()
    } else {
        vec![pixels.pixels().map(|p| luminance(&p.0)).collect()]
    };

    let filtered = filter_with_fallback(backend, &planes, width, height, &params, mode)?;

    if args.per_channel {
        for (i, p) in pixels.pixels_mut().enumerate() {
            for (c, plane) in filtered.iter().enumerate() {
                p.0[c] = plane[i];
            }
        }
    } else {
        let (before, after) = (&planes[0], &filtered[0]);
        for (i, p) in pixels.pixels_mut().enumerate() {
            let delta = after[i] - before[i];
            for c in 0..3 {
                p.0[c] += delta;
            }
        }
    }

    super::save_image(&args.output, pixels, source)?;

    if verbose > 0 {
        println!("Done.");
    }
    Ok(())
}

fn luminance(rgba: &[f32; 4]) -> f32 {
    LUMA[0] * rgba[0] + LUMA[1] * rgba[1] + LUMA[2] * rgba[2]
}

/// One session per plane, planes in parallel.
fn filter_planes<D: ComputeDevice>(
    device: &D,
    planes: &[Vec<f32>],
    width: usize,
    height: usize,
    params: &BilateralParams,
    mode: FilterMode,
) -> BilateralResult<Vec<Vec<f32>>> {
    debug!(device = device.name(), planes = planes.len(), "filter_planes");
    planes
        .par_iter()
        .map(|plane| bilateral_filter(device, plane, width, height, params, mode))
        .collect()
}

/// Filter on the requested backend, dropping to the CPU when the GPU is
/// missing or too small for the grid.
fn filter_with_fallback(
    backend: Backend,
    planes: &[Vec<f32>],
    width: usize,
    height: usize,
    params: &BilateralParams,
    mode: FilterMode,
) -> Result<Vec<Vec<f32>>> {
    match backend.resolve() {
        #[cfg(feature = "cuda")]
        Backend::Cuda => match bilgrid_compute::CudaDevice::new(0) {
            Ok(device) => match filter_planes(&device, planes, width, height, params, mode) {
                Ok(out) => return Ok(out),
                Err(e) if e.is_fallback() => warn!(error = %e, "CUDA device unsuitable, falling back to CPU"),
                Err(e) => return Err(e).context("Filtering failed"),
            },
            Err(e) => warn!(error = %e, "CUDA device unavailable, falling back to CPU"),
        },
        #[cfg(not(feature = "cuda"))]
        Backend::Cuda => anyhow::bail!("CUDA backend requested but this build has no CUDA support"),
        Backend::Auto | Backend::Cpu => {}
    }

    let device = CpuDevice::new();
    filter_planes(&device, planes, width, height, params, mode).context("Filtering failed")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_luminance_of_gray() {
        assert!((luminance(&[0.4, 0.4, 0.4, 1.0]) - 0.4).abs() < 1e-6);
    }

    #[test]
    fn test_cpu_planes_flat() {
        let planes = vec![vec![0.3; 64], vec![0.6; 64]];
        let out = filter_with_fallback(Backend::Cpu, &planes, 8, 8, &BilateralParams::new(2.0, 10.0, 0.0), FilterMode::Smooth)
            .unwrap();
        assert!(out[0].iter().all(|v| (v - 0.3).abs() < 1e-4));
        assert!(out[1].iter().all(|v| (v - 0.6).abs() < 1e-4));
    }
}
