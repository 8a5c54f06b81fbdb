//! Device capability probe.

use bilgrid_compute::{ComputeDevice, DeviceLimits, KernelId};
use tracing::debug;

use crate::error::{BilateralError, BilateralResult};

/// What a device can offer the splat kernel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceCapabilities {
    /// Device-wide work-group and memory limits.
    pub limits: DeviceLimits,
    /// Work-group item ceiling of the splat kernel itself.
    pub splat_work_group_size: usize,
}

impl DeviceCapabilities {
    /// Query `device`. Failure means the filter is unavailable on this device.
    pub fn probe<D: ComputeDevice>(device: &D) -> BilateralResult<Self> {
        let limits = device.query_limits().map_err(BilateralError::DeviceQuery)?;
        let splat_work_group_size = device
            .kernel_work_group_size(KernelId::Splat)
            .map_err(BilateralError::DeviceQuery)?;

        debug!(
            device = device.name(),
            ordinal = device.ordinal(),
            max_dims = ?limits.max_work_item_sizes,
            max_items = limits.max_work_group_size,
            local_mem = limits.local_mem_size,
            splat_items = splat_work_group_size,
            "probed device"
        );

        Ok(Self { limits, splat_work_group_size })
    }

    /// Capabilities from known limits, without a device.
    pub fn from_limits(limits: DeviceLimits, splat_work_group_size: usize) -> Self {
        Self { limits, splat_work_group_size }
    }
}
