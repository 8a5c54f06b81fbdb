//! Host-side convenience API.
//!
//! Runs a complete session on host data: upload, create, splat and blur,
//! slice, download, destroy.

use bilgrid_compute::ComputeDevice;
use tracing::{debug, trace};

use crate::error::{BilateralError, BilateralResult, Stage};
use crate::session::Session;

/// Filter parameters as a caller (UI, batch tool) supplies them.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BilateralParams {
    /// Spatial sigma in pixels.
    pub sigma_s: f32,
    /// Range sigma in range units (the full `[0, 1]` intensity span is 100).
    pub sigma_r: f32,
    /// Detail amount: negative smooths further, positive boosts detail.
    pub detail: f32,
}

impl Default for BilateralParams {
    fn default() -> Self {
        Self { sigma_s: 8.0, sigma_r: 10.0, detail: 0.0 }
    }
}

impl BilateralParams {
    pub fn new(sigma_s: f32, sigma_r: f32, detail: f32) -> Self {
        Self { sigma_s, sigma_r, detail }
    }

    /// Builder-style detail setter.
    pub fn with_detail(mut self, detail: f32) -> Self {
        self.detail = detail;
        self
    }
}

/// What the slice stage writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FilterMode {
    /// `v + detail * (v - smoothed)`.
    #[default]
    Detail,
    /// The smoothed value; `detail` is ignored.
    Smooth,
}

fn check_len(what: &str, len: usize, width: usize, height: usize) -> BilateralResult<()> {
    if len != width * height {
        return Err(BilateralError::InvalidParameter(format!(
            "{what} holds {len} values, expected {width}x{height}"
        )));
    }
    Ok(())
}

/// Filter a single-channel `width x height` image of normalised intensities.
pub fn bilateral_filter<D: ComputeDevice>(
    device: &D,
    data: &[f32],
    width: usize,
    height: usize,
    params: &BilateralParams,
    mode: FilterMode,
) -> BilateralResult<Vec<f32>> {
    trace!(width, height, ?params, ?mode, "bilateral_filter");
    check_len("input", data.len(), width, height)?;

    let mut session = Session::create(device, width, height, params.sigma_s, params.sigma_r)?;
    let input = device.upload(data).map_err(BilateralError::Allocation)?;
    let mut output = device.allocate(data.len()).map_err(BilateralError::Allocation)?;

    session.splat_and_blur(&input)?;
    match mode {
        FilterMode::Detail => session.slice_to_output(&input, &mut output, params.detail)?,
        FilterMode::Smooth => session.smooth(&input, &mut output)?,
    }

    let result = device.download(&output).map_err(BilateralError::kernel(Stage::Transfer))?;
    session.destroy()?;
    device.release(input);
    device.release(output);

    debug!(width, height, "bilateral filter done");
    Ok(result)
}

/// Add `detail * (data - smoothed)` onto `base` in place, for compositing the
/// detail layer of `data` over another image.
pub fn bilateral_filter_onto<D: ComputeDevice>(
    device: &D,
    data: &[f32],
    base: &mut [f32],
    width: usize,
    height: usize,
    params: &BilateralParams,
) -> BilateralResult<()> {
    trace!(width, height, ?params, "bilateral_filter_onto");
    check_len("input", data.len(), width, height)?;
    check_len("base", base.len(), width, height)?;

    let mut session = Session::create(device, width, height, params.sigma_s, params.sigma_r)?;
    let input = device.upload(data).map_err(BilateralError::Allocation)?;
    let mut output = device.upload(base).map_err(BilateralError::Allocation)?;

    session.splat_and_blur(&input)?;
    session.slice_onto(&input, &mut output, params.detail)?;

    let result = device.download(&output).map_err(BilateralError::kernel(Stage::Transfer))?;
    base.copy_from_slice(&result);
    session.destroy()?;
    device.release(input);
    device.release(output);
    Ok(())
}
