//! Instrumented CPU device for integration tests.

#![allow(dead_code)]

use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use bilgrid_compute::{
    ComputeDevice, ComputeError, ComputeResult, CpuBuffer, CpuDevice, DeviceLimits, Dispatch,
    GridMapping, KernelId, LineStrides, SliceMode,
};

/// Device event, in call order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    Allocate,
    Exec(KernelId),
    Finish,
    Release,
}

/// Wraps a `CpuDevice`, records every call and fails on request.
pub struct TestDevice {
    inner: CpuDevice,
    fail_kernel: Option<KernelId>,
    /// Launches of `fail_kernel` that succeed before it starts failing.
    fail_after: usize,
    launches: AtomicUsize,
    fail_query: bool,
    fail_allocate: bool,
    fail_finish: bool,
    events: Mutex<Vec<Event>>,
}

impl TestDevice {
    pub fn new(limits: DeviceLimits) -> Self {
        Self {
            inner: CpuDevice::with_limits(limits),
            fail_kernel: None,
            fail_after: 0,
            launches: AtomicUsize::new(0),
            fail_query: false,
            fail_allocate: false,
            fail_finish: false,
            events: Mutex::new(Vec::new()),
        }
    }

    pub fn failing_kernel(mut self, kernel: KernelId, after: usize) -> Self {
        self.fail_kernel = Some(kernel);
        self.fail_after = after;
        self
    }

    pub fn failing_query(mut self) -> Self {
        self.fail_query = true;
        self
    }

    pub fn failing_allocate(mut self) -> Self {
        self.fail_allocate = true;
        self
    }

    pub fn failing_finish(mut self) -> Self {
        self.fail_finish = true;
        self
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    pub fn count(&self, event: Event) -> usize {
        self.events().iter().filter(|&&e| e == event).count()
    }

    fn record(&self, event: Event) {
        self.events.lock().unwrap().push(event);
    }

    fn launch(&self, kernel: KernelId) -> ComputeResult<()> {
        self.record(Event::Exec(kernel));
        if self.fail_kernel == Some(kernel) && self.launches.fetch_add(1, Ordering::SeqCst) >= self.fail_after {
            return Err(ComputeError::LaunchFailed { kernel: kernel.name(), reason: "injected failure".into() });
        }
        Ok(())
    }
}

impl ComputeDevice for TestDevice {
    type Buffer = CpuBuffer;

    fn name(&self) -> &'static str {
        "test"
    }

    fn ordinal(&self) -> usize {
        0
    }

    fn query_limits(&self) -> ComputeResult<DeviceLimits> {
        if self.fail_query {
            return Err(ComputeError::DeviceQuery("injected failure".into()));
        }
        self.inner.query_limits()
    }

    fn kernel_work_group_size(&self, kernel: KernelId) -> ComputeResult<usize> {
        self.inner.kernel_work_group_size(kernel)
    }

    fn allocate(&self, len: usize) -> ComputeResult<Self::Buffer> {
        self.record(Event::Allocate);
        if self.fail_allocate {
            return Err(ComputeError::Allocation { bytes: len as u64 * 4, reason: "injected failure".into() });
        }
        self.inner.allocate(len)
    }

    fn release(&self, buffer: Self::Buffer) {
        self.record(Event::Release);
        self.inner.release(buffer);
    }

    fn upload(&self, data: &[f32]) -> ComputeResult<Self::Buffer> {
        self.inner.upload(data)
    }

    fn download(&self, buffer: &Self::Buffer) -> ComputeResult<Vec<f32>> {
        self.inner.download(buffer)
    }

    fn exec_zero(&self, buffer: &mut Self::Buffer, width: usize, height: usize, dispatch: Dispatch) -> ComputeResult<()> {
        self.launch(KernelId::Zero)?;
        self.inner.exec_zero(buffer, width, height, dispatch)
    }

    fn exec_splat(&self, input: &Self::Buffer, grid: &mut Self::Buffer,
                  mapping: &GridMapping, dispatch: Dispatch) -> ComputeResult<()> {
        self.launch(KernelId::Splat)?;
        self.inner.exec_splat(input, grid, mapping, dispatch)
    }

    fn exec_blur_line(&self, grid: &mut Self::Buffer, offset: usize,
                      strides: &LineStrides, dispatch: Dispatch) -> ComputeResult<()> {
        self.launch(KernelId::BlurLine)?;
        self.inner.exec_blur_line(grid, offset, strides, dispatch)
    }

    fn exec_slice(&self, input: &Self::Buffer, output: &mut Self::Buffer, grid: &Self::Buffer,
                  mapping: &GridMapping, mode: SliceMode, dispatch: Dispatch) -> ComputeResult<()> {
        self.launch(KernelId::Slice)?;
        self.inner.exec_slice(input, output, grid, mapping, mode, dispatch)
    }

    fn finish(&self) -> ComputeResult<()> {
        self.record(Event::Finish);
        if self.fail_finish {
            return Err(ComputeError::OperationFailed("injected failure".into()));
        }
        self.inner.finish()
    }
}

/// Row-major image where `f(x, y)` gives each pixel.
pub fn image(width: usize, height: usize, f: impl Fn(usize, usize) -> f32) -> Vec<f32> {
    (0..height).flat_map(|y| (0..width).map(move |x| (x, y))).map(|(x, y)| f(x, y)).collect()
}
