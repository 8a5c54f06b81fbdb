//! Filter session lifecycle.
//!
//! A [`Session`] owns one grid on one device and walks it through
//! `Created -> Splatted -> Blurred`, after which it can be sliced any number
//! of times. Every stage waits for the device before returning. A device
//! failure moves the session to `Failed`; from there only destruction is
//! allowed.

use std::fmt;

use bilgrid_compute::{ComputeDevice, ComputeResult, DeviceBuffer, Dispatch, GRID_PLANES, GridDims, SliceMode};
use tracing::{debug, trace, warn};

use crate::error::{BilateralError, BilateralResult, Stage};
use crate::geometry::{GridGeometry, WorkGroupShape};
use crate::grid::{GridSnapshot, GridStore};
use crate::probe::DeviceCapabilities;

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Grid allocated and zeroed.
    Created,
    Splatted,
    /// Ready for slicing.
    Blurred,
    /// A kernel failed; the grid contents are undefined.
    Failed,
    Destroyed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Created => "created",
            Self::Splatted => "splatted",
            Self::Blurred => "blurred",
            Self::Failed => "failed",
            Self::Destroyed => "destroyed",
        })
    }
}

/// One bilateral grid bound to one device.
pub struct Session<'d, D: ComputeDevice> {
    device: &'d D,
    geometry: GridGeometry,
    grid: Option<GridStore<D::Buffer>>,
    state: SessionState,
}

impl<'d, D: ComputeDevice> Session<'d, D> {
    /// Probe `device`, size the grid for a `width x height` image and
    /// allocate it zeroed.
    ///
    /// Fails without allocating when the device is unsuitable.
    pub fn create(device: &'d D, width: usize, height: usize, sigma_s: f32, sigma_r: f32) -> BilateralResult<Self> {
        trace!(device = device.name(), width, height, sigma_s, sigma_r, "session::create");

        let caps = DeviceCapabilities::probe(device)?;
        let geometry = GridGeometry::compute(width, height, sigma_s, sigma_r, &caps)?;
        let grid = GridStore::create(device, geometry.dims)?;

        debug!(bytes = geometry.grid_bytes(), "bilateral grid allocated");
        Ok(Self { device, geometry, grid: Some(grid), state: SessionState::Created })
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn geometry(&self) -> &GridGeometry {
        &self.geometry
    }

    pub fn dims(&self) -> GridDims {
        self.geometry.dims
    }

    pub fn effective_sigma_s(&self) -> f32 {
        self.geometry.sigma_s
    }

    pub fn effective_sigma_r(&self) -> f32 {
        self.geometry.sigma_r
    }

    pub fn work_group(&self) -> WorkGroupShape {
        self.geometry.block
    }

    pub fn device(&self) -> &'d D {
        self.device
    }

    /// Accumulate every pixel of `input` into the grid.
    pub fn splat(&mut self, input: &D::Buffer) -> BilateralResult<()> {
        self.expect("splat", SessionState::Created)?;
        self.check_image("input", input)?;
        trace!(width = self.geometry.width, height = self.geometry.height, "session::splat");

        let mapping = self.geometry.mapping();
        let dispatch = self.geometry.splat_dispatch();
        self.run_stage(Stage::Splat, |device, grid| device.exec_splat(input, grid, &mapping, dispatch))?;

        self.state = SessionState::Splatted;
        Ok(())
    }

    /// Blur the grid along z, then y, then x. Each pass finishes before the
    /// next starts.
    pub fn blur(&mut self) -> BilateralResult<()> {
        self.expect("blur", SessionState::Splatted)?;
        let plane = self.geometry.dims.cells();

        for (axis, strides) in ["z", "y", "x"].into_iter().zip(self.geometry.blur_passes()) {
            trace!(axis, ?strides, "session::blur");
            let dispatch = Dispatch::rounded(strides.size1, strides.size2);
            self.run_stage(Stage::Blur, |device, grid| {
                (0..GRID_PLANES).try_for_each(|p| device.exec_blur_line(grid, p * plane, &strides, dispatch))
            })?;
        }

        self.state = SessionState::Blurred;
        Ok(())
    }

    /// Splat `input` and blur the result.
    pub fn splat_and_blur(&mut self, input: &D::Buffer) -> BilateralResult<()> {
        self.splat(input)?;
        self.blur()
    }

    /// Write `input + detail * (input - smoothed)` into `output`. The
    /// previous contents of `output` are ignored, so repeated calls with the
    /// same `detail` give the same result.
    pub fn slice_to_output(&mut self, input: &D::Buffer, output: &mut D::Buffer, detail: f32) -> BilateralResult<()> {
        self.slice_with("slice_to_output", input, output, SliceMode::Detail { detail })
    }

    /// Add `detail * (input - smoothed)` onto the existing contents of
    /// `output`, for compositing over another layer.
    pub fn slice_onto(&mut self, input: &D::Buffer, output: &mut D::Buffer, detail: f32) -> BilateralResult<()> {
        self.slice_with("slice_onto", input, output, SliceMode::Combine { detail })
    }

    /// Write the smoothed value alone into `output`.
    pub fn smooth(&mut self, input: &D::Buffer, output: &mut D::Buffer) -> BilateralResult<()> {
        self.slice_with("smooth", input, output, SliceMode::Smooth)
    }

    fn slice_with(&mut self, operation: &'static str, input: &D::Buffer, output: &mut D::Buffer,
                  mode: SliceMode) -> BilateralResult<()> {
        self.expect(operation, SessionState::Blurred)?;
        self.check_image("input", input)?;
        self.check_image("output", output)?;
        trace!(operation, ?mode, "session::slice");

        let mapping = self.geometry.mapping();
        let dispatch = Dispatch::rounded(self.geometry.width, self.geometry.height);
        self.run_stage(Stage::Slice, |device, grid| {
            device.exec_slice(input, output, grid, &mapping, mode, dispatch)
        })
    }

    /// Read the grid back to the host.
    pub fn snapshot(&self) -> BilateralResult<GridSnapshot> {
        let grid = match (&self.grid, self.state) {
            (Some(grid), SessionState::Created | SessionState::Splatted | SessionState::Blurred) => grid,
            _ => return Err(BilateralError::SessionUnusable { operation: "snapshot", actual: self.state }),
        };
        let raw = self.device.download(grid.buffer()).map_err(BilateralError::kernel(Stage::Transfer))?;
        GridSnapshot::from_raw(grid.dims(), raw)
    }

    /// Wait for outstanding device work and release the grid.
    pub fn destroy(mut self) -> BilateralResult<()> {
        self.teardown()
    }

    fn teardown(&mut self) -> BilateralResult<()> {
        let Some(grid) = self.grid.take() else {
            return Ok(());
        };
        self.state = SessionState::Destroyed;

        let finished = self.device.finish();
        self.device.release(grid.into_buffer());
        trace!("session::destroy");
        finished.map_err(BilateralError::kernel(Stage::Finish))
    }

    fn expect(&self, operation: &'static str, expected: SessionState) -> BilateralResult<()> {
        if self.state != expected {
            return Err(BilateralError::InvalidSequence { operation, expected, actual: self.state });
        }
        Ok(())
    }

    fn check_image(&self, what: &str, buffer: &D::Buffer) -> BilateralResult<()> {
        let expected = self.geometry.width * self.geometry.height;
        if buffer.len() != expected {
            return Err(BilateralError::InvalidParameter(format!(
                "{what} holds {} values, expected {}x{} = {expected}",
                buffer.len(),
                self.geometry.width,
                self.geometry.height
            )));
        }
        Ok(())
    }

    /// Enqueue one stage and wait for it. Any failure contaminates the session.
    fn run_stage<F>(&mut self, stage: Stage, launch: F) -> BilateralResult<()>
    where
        F: FnOnce(&D, &mut D::Buffer) -> ComputeResult<()>,
    {
        let device = self.device;
        let Some(grid) = self.grid.as_mut() else {
            return Err(BilateralError::SessionUnusable { operation: "stage", actual: self.state });
        };

        let result = launch(device, grid.buffer_mut()).and_then(|_| device.finish());
        if let Err(source) = result {
            warn!(%stage, error = %source, "bilateral grid stage failed, session is unusable");
            self.state = SessionState::Failed;
            return Err(BilateralError::Kernel { stage, source });
        }
        Ok(())
    }
}

impl<D: ComputeDevice> Drop for Session<'_, D> {
    fn drop(&mut self) {
        if let Err(e) = self.teardown() {
            warn!(error = %e, "bilateral grid teardown failed");
        }
    }
}

/// Destroy `session` if there is one.
pub fn destroy_session<D: ComputeDevice>(session: Option<Session<'_, D>>) -> BilateralResult<()> {
    match session {
        Some(session) => session.destroy(),
        None => Ok(()),
    }
}
