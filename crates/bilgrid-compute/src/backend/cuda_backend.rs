//! CUDA GPU compute backend for bilateral grid kernels.
//!
//! Requires the `cuda` feature and NVIDIA GPU with CUDA support.

use std::sync::{Arc, OnceLock};

use cudarc::driver::sys::{CUdevice_attribute, CUfunction_attribute};
use cudarc::driver::{CudaContext, CudaFunction, CudaModule, CudaSlice, CudaStream, LaunchConfig, PushKernelArg};
use cudarc::nvrtc::Ptx;
use tracing::{debug, trace};

use super::DeviceLimits;
use super::device::{
    ComputeDevice, DeviceBuffer, Dispatch, GridMapping, KernelId, LineStrides, SliceMode,
};
use crate::{ComputeError, ComputeResult};

// =============================================================================
// CUDA Kernel Source
// =============================================================================

/// CUDA kernel source for the bilateral grid program.
///
/// Compiled at runtime via NVRTC, once per process. Contains:
/// - `bilgrid_zero`: zero-fill a 2-D range of a buffer
/// - `bilgrid_splat`: trilinear scatter into weight and value planes (atomicAdd)
/// - `bilgrid_blur_line`: in-place 5-tap blur along strided lines
/// - `bilgrid_slice`: trilinear gather and detail combination
///
/// `RANGE_EXTENT`, the stencil and the slice weight floor match the constants
/// in `device.rs`.
const CUDA_KERNELS: &str = r#"
#define RANGE_EXTENT 100.0f
#define MIN_WEIGHT 1e-6f
#define W0 (6.0f / 16.0f)
#define W1 (4.0f / 16.0f)
#define W2 (1.0f / 16.0f)

extern "C" {

__device__ __forceinline__ float clamp_coord(float c, int size) {
    if (isnan(c)) return 0.0f;
    return fminf(fmaxf(c, 0.0f), (float)(size - 1));
}

__device__ __forceinline__ void cell_of(float c, int size, int* base, float* frac) {
    int b = min((int)floorf(c), size - 2);
    *base = b;
    *frac = fminf(fmaxf(c - (float)b, 0.0f), 1.0f);
}

__device__ float trilinear(const float* g, int sx, int sy,
                           int x, int y, int z, float fx, float fy, float fz) {
    #define AT(dx, dy, dz) g[((z + (dz)) * sy + (y + (dy))) * sx + (x + (dx))]
    float c00 = AT(0,0,0) + fx * (AT(1,0,0) - AT(0,0,0));
    float c10 = AT(0,1,0) + fx * (AT(1,1,0) - AT(0,1,0));
    float c01 = AT(0,0,1) + fx * (AT(1,0,1) - AT(0,0,1));
    float c11 = AT(0,1,1) + fx * (AT(1,1,1) - AT(0,1,1));
    #undef AT
    float c0 = c00 + fy * (c10 - c00);
    float c1 = c01 + fy * (c11 - c01);
    return c0 + fz * (c1 - c0);
}

// ============================================================================
// Zero fill
// ============================================================================
__global__ void bilgrid_zero(float* buf, int width, int height) {
    int x = blockIdx.x * blockDim.x + threadIdx.x;
    int y = blockIdx.y * blockDim.y + threadIdx.y;
    if (x >= width || y >= height) return;
    buf[y * width + x] = 0.0f;
}

// ============================================================================
// Splat
// ============================================================================
__global__ void bilgrid_splat(
    const float* __restrict__ in,
    float* grid,
    int width, int height,
    int sx, int sy, int sz,
    float sigma_s, float sigma_r
) {
    int x = blockIdx.x * blockDim.x + threadIdx.x;
    int y = blockIdx.y * blockDim.y + threadIdx.y;
    if (x >= width || y >= height) return;

    float v = in[y * width + x];
    int xi, yi, zi;
    float fx, fy, fz;
    cell_of(clamp_coord(x / sigma_s, sx), sx, &xi, &fx);
    cell_of(clamp_coord(y / sigma_s, sy), sy, &yi, &fy);
    cell_of(clamp_coord(v * RANGE_EXTENT / sigma_r, sz), sz, &zi, &fz);

    int plane = sx * sy * sz;
    for (int dz = 0; dz < 2; dz++) {
        float wz = dz ? fz : 1.0f - fz;
        for (int dy = 0; dy < 2; dy++) {
            float wy = dy ? fy : 1.0f - fy;
            for (int dx = 0; dx < 2; dx++) {
                float w = (dx ? fx : 1.0f - fx) * wy * wz;
                int idx = ((zi + dz) * sy + (yi + dy)) * sx + (xi + dx);
                atomicAdd(&grid[idx], w);
                atomicAdd(&grid[plane + idx], w * v);
            }
        }
    }
}

// ============================================================================
// Line blur (one thread per line, sliding window keeps unblurred neighbours)
// ============================================================================
__global__ void bilgrid_blur_line(
    float* buf, int offset,
    int stride1, int stride2, int stride3,
    int size1, int size2, int size3
) {
    int k = blockIdx.x * blockDim.x + threadIdx.x;
    int j = blockIdx.y * blockDim.y + threadIdx.y;
    if (k >= size1 || j >= size2) return;

    int index = offset + k * stride1 + j * stride2;
    float prev2 = 0.0f, prev1 = 0.0f;
    for (int i = 0; i < size3; i++) {
        float cur = buf[index + i * stride3];
        float next1 = (i + 1 < size3) ? buf[index + (i + 1) * stride3] : 0.0f;
        float next2 = (i + 2 < size3) ? buf[index + (i + 2) * stride3] : 0.0f;
        buf[index + i * stride3] = W0 * cur + W1 * (prev1 + next1) + W2 * (prev2 + next2);
        prev2 = prev1;
        prev1 = cur;
    }
}

// ============================================================================
// Slice
// ============================================================================
__global__ void bilgrid_slice(
    const float* __restrict__ in,
    float* out,
    const float* __restrict__ grid,
    int width, int height,
    int sx, int sy, int sz,
    float sigma_s, float sigma_r,
    int mode, float detail
) {
    int x = blockIdx.x * blockDim.x + threadIdx.x;
    int y = blockIdx.y * blockDim.y + threadIdx.y;
    if (x >= width || y >= height) return;

    int i = y * width + x;
    float v = in[i];
    int xi, yi, zi;
    float fx, fy, fz;
    cell_of(clamp_coord(x / sigma_s, sx), sx, &xi, &fx);
    cell_of(clamp_coord(y / sigma_s, sy), sy, &yi, &fy);
    cell_of(clamp_coord(v * RANGE_EXTENT / sigma_r, sz), sz, &zi, &fz);

    int plane = sx * sy * sz;
    float weight = trilinear(grid, sx, sy, xi, yi, zi, fx, fy, fz);
    float s = v;
    if (weight > MIN_WEIGHT) {
        s = trilinear(grid + plane, sx, sy, xi, yi, zi, fx, fy, fz) / weight;
    }

    if (mode == 0)      out[i] = v + detail * (v - s);
    else if (mode == 1) out[i] = out[i] + detail * (v - s);
    else                out[i] = s;
}

} // extern "C"
"#;

/// Process-wide compiled program. Devices load it, nothing recompiles it.
static PROGRAM: OnceLock<Result<Ptx, String>> = OnceLock::new();

fn program() -> ComputeResult<Ptx> {
    PROGRAM
        .get_or_init(|| {
            debug!("compiling bilateral grid CUDA program");
            cudarc::nvrtc::compile_ptx(CUDA_KERNELS).map_err(|e| format!("{e:?}"))
        })
        .clone()
        .map_err(ComputeError::ShaderCompilation)
}

// =============================================================================
// CUDA Handle
// =============================================================================

/// CUDA buffer handle. Memory is freed by cudarc when dropped.
pub struct CudaBuffer {
    buffer: CudaSlice<f32>,
    len: usize,
}

impl DeviceBuffer for CudaBuffer {
    fn len(&self) -> usize {
        self.len
    }
}

/// Kernel handles loaded from the shared program, with the block-size ceiling
/// each one compiled to.
struct Kernels {
    zero: CudaFunction,
    splat: CudaFunction,
    blur_line: CudaFunction,
    slice: CudaFunction,
    ceilings: [usize; KernelId::ALL.len()],
}

impl Kernels {
    fn load(module: &CudaModule, device_max: usize) -> ComputeResult<Self> {
        let load = |id: KernelId| {
            module.load_function(id.name()).map_err(|e| {
                ComputeError::ShaderCompilation(format!("Failed to load {}: {e:?}", id.name()))
            })
        };
        let mut kernels = Self {
            zero: load(KernelId::Zero)?,
            splat: load(KernelId::Splat)?,
            blur_line: load(KernelId::BlurLine)?,
            slice: load(KernelId::Slice)?,
            ceilings: [device_max; KernelId::ALL.len()],
        };

        for id in KernelId::ALL {
            let reported = kernels
                .function(id)
                .get_attribute(CUfunction_attribute::CU_FUNC_ATTRIBUTE_MAX_THREADS_PER_BLOCK)
                .map_err(|e| ComputeError::DeviceQuery(format!("{}: {e:?}", id.name())))?;
            let ceiling = kernel_ceiling(device_max, reported);
            debug!(kernel = id.name(), ceiling, "cuda kernel block limit");
            kernels.ceilings[id as usize] = ceiling;
        }
        Ok(kernels)
    }

    fn function(&self, id: KernelId) -> &CudaFunction {
        match id {
            KernelId::Zero => &self.zero,
            KernelId::Splat => &self.splat,
            KernelId::BlurLine => &self.blur_line,
            KernelId::Slice => &self.slice,
        }
    }

    fn ceiling(&self, id: KernelId) -> usize {
        self.ceilings[id as usize]
    }
}

/// Threads per block a kernel can launch with. Register pressure can hold a
/// function below the device limit; a non-positive report means no limit.
fn kernel_ceiling(device_max: usize, reported: i32) -> usize {
    match usize::try_from(reported) {
        Ok(n) if n > 0 => n.min(device_max),
        _ => device_max,
    }
}

fn attribute(ctx: &CudaContext, attr: CUdevice_attribute) -> ComputeResult<usize> {
    ctx.attribute(attr)
        .map(|v| v.max(0) as usize)
        .map_err(|e| ComputeError::DeviceQuery(format!("{attr:?}: {e:?}")))
}

// =============================================================================
// CudaDevice
// =============================================================================

/// CUDA device implementing `ComputeDevice`.
pub struct CudaDevice {
    ordinal: usize,
    ctx: Arc<CudaContext>,
    stream: Arc<CudaStream>,
    /// Loaded module - kept alive for kernel lifetime.
    #[allow(dead_code)]
    module: Arc<CudaModule>,
    kernels: Kernels,
    /// Fixed device limits read at construction. Memory figures are
    /// refreshed by `query_limits`.
    limits: DeviceLimits,
}

impl CudaDevice {
    /// Open CUDA device `ordinal` and load the bilateral grid program.
    pub fn new(ordinal: usize) -> ComputeResult<Self> {
        let ctx = CudaContext::new(ordinal).map_err(|e| {
            ComputeError::DeviceCreation(format!("CUDA init failed: {e:?}"))
        })?;
        let stream = ctx.default_stream();

        let limits = Self::read_limits(&ctx)?;
        let module = ctx.load_module(program()?).map_err(|e| {
            ComputeError::ShaderCompilation(format!("CUDA module load failed: {e:?}"))
        })?;
        let kernels = Kernels::load(&module, limits.max_work_group_size)?;

        Ok(Self { ordinal, ctx, stream, module, kernels, limits })
    }

    /// Check if CUDA is available.
    pub fn is_available() -> bool {
        CudaContext::new(0).is_ok()
    }

    fn read_limits(ctx: &CudaContext) -> ComputeResult<DeviceLimits> {
        ctx.bind_to_thread().map_err(|e| ComputeError::DeviceQuery(format!("{e:?}")))?;
        let (free, total) = query_memory()?;
        Ok(DeviceLimits {
            max_work_item_sizes: [
                attribute(ctx, CUdevice_attribute::CU_DEVICE_ATTRIBUTE_MAX_BLOCK_DIM_X)?,
                attribute(ctx, CUdevice_attribute::CU_DEVICE_ATTRIBUTE_MAX_BLOCK_DIM_Y)?,
            ],
            max_work_group_size: attribute(ctx, CUdevice_attribute::CU_DEVICE_ATTRIBUTE_MAX_THREADS_PER_BLOCK)?,
            local_mem_size: attribute(ctx, CUdevice_attribute::CU_DEVICE_ATTRIBUTE_MAX_SHARED_MEMORY_PER_BLOCK)? as u64,
            max_alloc_bytes: free,
            total_memory: total,
        })
    }

    /// Launch config for a dispatch; without a local size 16x16 blocks are used.
    fn launch_config(dispatch: &Dispatch) -> LaunchConfig {
        let local = dispatch.local.unwrap_or([Dispatch::ROUNDING, Dispatch::ROUNDING]);
        LaunchConfig {
            block_dim: (local[0] as u32, local[1] as u32, 1),
            grid_dim: (
                dispatch.global[0].div_ceil(local[0]) as u32,
                dispatch.global[1].div_ceil(local[1]) as u32,
                1,
            ),
            shared_mem_bytes: 0,
        }
    }

    fn validate(&self, kernel: KernelId, dispatch: &Dispatch) -> ComputeResult<()> {
        dispatch.validate(kernel, &self.limits, self.kernels.ceiling(kernel))
    }

    fn launch_err(kernel: KernelId) -> impl Fn(cudarc::driver::DriverError) -> ComputeError {
        move |e| ComputeError::LaunchFailed { kernel: kernel.name(), reason: format!("{e:?}") }
    }
}

impl ComputeDevice for CudaDevice {
    type Buffer = CudaBuffer;

    fn name(&self) -> &'static str {
        "CUDA"
    }

    fn ordinal(&self) -> usize {
        self.ordinal
    }

    fn query_limits(&self) -> ComputeResult<DeviceLimits> {
        self.ctx.bind_to_thread().map_err(|e| ComputeError::DeviceQuery(format!("{e:?}")))?;
        let (free, total) = query_memory()?;
        Ok(DeviceLimits { max_alloc_bytes: free, total_memory: total, ..self.limits.clone() })
    }

    fn kernel_work_group_size(&self, kernel: KernelId) -> ComputeResult<usize> {
        Ok(self.kernels.ceiling(kernel))
    }

    fn allocate(&self, len: usize) -> ComputeResult<Self::Buffer> {
        let buffer: CudaSlice<f32> = self.stream.alloc_zeros(len).map_err(|e| {
            ComputeError::Allocation { bytes: len as u64 * 4, reason: format!("{e:?}") }
        })?;
        Ok(CudaBuffer { buffer, len })
    }

    fn upload(&self, data: &[f32]) -> ComputeResult<Self::Buffer> {
        let buffer = self.stream.clone_htod(data).map_err(|e| {
            ComputeError::Allocation { bytes: data.len() as u64 * 4, reason: format!("Upload failed: {e:?}") }
        })?;
        Ok(CudaBuffer { buffer, len: data.len() })
    }

    fn download(&self, buffer: &Self::Buffer) -> ComputeResult<Vec<f32>> {
        self.stream.clone_dtoh(&buffer.buffer).map_err(|e| {
            ComputeError::OperationFailed(format!("Download failed: {e:?}"))
        })
    }

    fn exec_zero(&self, buffer: &mut Self::Buffer, width: usize, height: usize, dispatch: Dispatch) -> ComputeResult<()> {
        self.validate(KernelId::Zero, &dispatch)?;
        dispatch.ensure_covers(KernelId::Zero, width, height)?;
        if width * height > buffer.len {
            return Err(ComputeError::BufferSizeMismatch { expected: width * height, actual: buffer.len });
        }
        trace!(width, height, "cuda::zero");

        let (w, h) = (width as i32, height as i32);
        let mut builder = self.stream.launch_builder(self.kernels.function(KernelId::Zero));
        builder.arg(&buffer.buffer);
        builder.arg(&w);
        builder.arg(&h);

        #[allow(unsafe_code)]
        unsafe { builder.launch(Self::launch_config(&dispatch)) }.map_err(Self::launch_err(KernelId::Zero))?;
        Ok(())
    }

    fn exec_splat(&self, input: &Self::Buffer, grid: &mut Self::Buffer,
                  mapping: &GridMapping, dispatch: Dispatch) -> ComputeResult<()> {
        self.validate(KernelId::Splat, &dispatch)?;
        dispatch.ensure_covers(KernelId::Splat, mapping.width, mapping.height)?;
        if input.len != mapping.width * mapping.height {
            return Err(ComputeError::BufferSizeMismatch { expected: mapping.width * mapping.height, actual: input.len });
        }
        if grid.len != mapping.dims.buffer_len() {
            return Err(ComputeError::BufferSizeMismatch { expected: mapping.dims.buffer_len(), actual: grid.len });
        }
        trace!(width = mapping.width, height = mapping.height, local = ?dispatch.local, "cuda::splat");

        let (w, h) = (mapping.width as i32, mapping.height as i32);
        let (sx, sy, sz) = (mapping.dims.size_x as i32, mapping.dims.size_y as i32, mapping.dims.size_z as i32);
        let mut builder = self.stream.launch_builder(self.kernels.function(KernelId::Splat));
        builder.arg(&input.buffer);
        builder.arg(&grid.buffer);
        builder.arg(&w); builder.arg(&h);
        builder.arg(&sx); builder.arg(&sy); builder.arg(&sz);
        builder.arg(&mapping.sigma_s); builder.arg(&mapping.sigma_r);

        #[allow(unsafe_code)]
        unsafe { builder.launch(Self::launch_config(&dispatch)) }.map_err(Self::launch_err(KernelId::Splat))?;
        Ok(())
    }

    fn exec_blur_line(&self, grid: &mut Self::Buffer, offset: usize,
                      strides: &LineStrides, dispatch: Dispatch) -> ComputeResult<()> {
        self.validate(KernelId::BlurLine, &dispatch)?;
        dispatch.ensure_covers(KernelId::BlurLine, strides.size1, strides.size2)?;
        if strides.lines() == 0 || strides.size3 == 0 {
            return Ok(());
        }
        if offset + strides.extent() > grid.len {
            return Err(ComputeError::BufferSizeMismatch { expected: offset + strides.extent(), actual: grid.len });
        }
        trace!(offset, ?strides, "cuda::blur_line");

        let args = [
            offset as i32,
            strides.stride1 as i32, strides.stride2 as i32, strides.stride3 as i32,
            strides.size1 as i32, strides.size2 as i32, strides.size3 as i32,
        ];
        let mut builder = self.stream.launch_builder(self.kernels.function(KernelId::BlurLine));
        builder.arg(&grid.buffer);
        for a in &args {
            builder.arg(a);
        }

        #[allow(unsafe_code)]
        unsafe { builder.launch(Self::launch_config(&dispatch)) }.map_err(Self::launch_err(KernelId::BlurLine))?;
        Ok(())
    }

    fn exec_slice(&self, input: &Self::Buffer, output: &mut Self::Buffer, grid: &Self::Buffer,
                  mapping: &GridMapping, mode: SliceMode, dispatch: Dispatch) -> ComputeResult<()> {
        self.validate(KernelId::Slice, &dispatch)?;
        dispatch.ensure_covers(KernelId::Slice, mapping.width, mapping.height)?;
        let n = mapping.width * mapping.height;
        for len in [input.len, output.len] {
            if len != n {
                return Err(ComputeError::BufferSizeMismatch { expected: n, actual: len });
            }
        }
        if grid.len != mapping.dims.buffer_len() {
            return Err(ComputeError::BufferSizeMismatch { expected: mapping.dims.buffer_len(), actual: grid.len });
        }
        trace!(width = mapping.width, height = mapping.height, ?mode, "cuda::slice");

        let (w, h) = (mapping.width as i32, mapping.height as i32);
        let (sx, sy, sz) = (mapping.dims.size_x as i32, mapping.dims.size_y as i32, mapping.dims.size_z as i32);
        let (code, detail) = (mode.code(), mode.detail());
        let mut builder = self.stream.launch_builder(self.kernels.function(KernelId::Slice));
        builder.arg(&input.buffer);
        builder.arg(&output.buffer);
        builder.arg(&grid.buffer);
        builder.arg(&w); builder.arg(&h);
        builder.arg(&sx); builder.arg(&sy); builder.arg(&sz);
        builder.arg(&mapping.sigma_s); builder.arg(&mapping.sigma_r);
        builder.arg(&code); builder.arg(&detail);

        #[allow(unsafe_code)]
        unsafe { builder.launch(Self::launch_config(&dispatch)) }.map_err(Self::launch_err(KernelId::Slice))?;
        Ok(())
    }

    fn finish(&self) -> ComputeResult<()> {
        self.stream.synchronize().map_err(|e| {
            ComputeError::OperationFailed(format!("Synchronize failed: {e:?}"))
        })
    }
}

// =============================================================================
// VRAM Detection
// =============================================================================

/// Query free and total device memory from the CUDA driver.
fn query_memory() -> ComputeResult<(u64, u64)> {
    use cudarc::driver::sys as cuda_sys;

    let mut free: usize = 0;
    let mut total: usize = 0;

    #[allow(unsafe_code)]
    let result = unsafe {
        cuda_sys::cuMemGetInfo_v2(&raw mut free, &raw mut total)
    };

    if result == cuda_sys::CUresult::CUDA_SUCCESS {
        Ok((free as u64, total as u64))
    } else {
        Err(ComputeError::DeviceQuery(format!("cuMemGetInfo failed: {result:?}")))
    }
}
