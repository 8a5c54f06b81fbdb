//! Info command
//!
//! Lists backends, the selected device's limits, the splat work-group it can
//! run, and optionally the grid geometry for an image size.

use crate::InfoArgs;
use anyhow::Result;
use bilgrid::{DeviceCapabilities, GridGeometry, WorkGroupShape};
use bilgrid_compute::config::format_bytes;
use bilgrid_compute::{Backend, ComputeDevice, CpuDevice, describe_backends};
use tracing::trace;

pub fn run(args: InfoArgs, backend: Backend) -> Result<()> {
    trace!(%backend, "info::run");

    println!("Backends:");
    print!("{}", describe_backends());

    let resolved = backend.resolve();
    println!("Selected: {resolved}");

    match resolved {
        #[cfg(feature = "cuda")]
        Backend::Cuda => report(&bilgrid_compute::CudaDevice::new(0)?, &args),
        #[cfg(not(feature = "cuda"))]
        Backend::Cuda => anyhow::bail!("CUDA backend requested but this build has no CUDA support"),
        Backend::Auto | Backend::Cpu => report(&CpuDevice::new(), &args),
    }
}

fn report<D: ComputeDevice>(device: &D, args: &InfoArgs) -> Result<()> {
    let caps = match DeviceCapabilities::probe(device) {
        Ok(caps) => caps,
        Err(e) => {
            println!("Device {} #{}: unavailable ({e})", device.name(), device.ordinal());
            return Ok(());
        }
    };
    let l = &caps.limits;

    println!();
    println!("Device {} #{}", device.name(), device.ordinal());
    println!("  Max work-item sizes: {} x {}", l.max_work_item_sizes[0], l.max_work_item_sizes[1]);
    println!("  Max work-group size: {}", l.max_work_group_size);
    println!("  Splat kernel limit:  {}", caps.splat_work_group_size);
    println!("  Local memory:        {}", format_bytes(l.local_mem_size));
    println!("  Max allocation:      {}", format_bytes(l.max_alloc_bytes));
    println!("  Total memory:        {}", format_bytes(l.total_memory));

    match WorkGroupShape::fit(&caps) {
        Ok(shape) => println!("  Splat work-group:    {} x {} ({} local)", shape.x, shape.y, format_bytes(shape.local_bytes())),
        Err(e) => println!("  Splat work-group:    unsuitable ({e})"),
    }

    if let (Some(width), Some(height)) = (args.width, args.height) {
        println!();
        println!("Geometry for {width}x{height}, sigma_s={} sigma_r={}", args.sigma_s, args.sigma_r);
        match GridGeometry::compute(width, height, args.sigma_s, args.sigma_r, &caps) {
            Ok(g) => {
                println!("  Grid:            {} x {} x {}", g.dims.size_x, g.dims.size_y, g.dims.size_z);
                println!("  Effective sigma: s={:.3} r={:.3}", g.sigma_s, g.sigma_r);
                println!("  Grid memory:     {}", format_bytes(g.grid_bytes()));
            }
            Err(e) => println!("  Not filterable on this device: {e}"),
        }
    }

    Ok(())
}
