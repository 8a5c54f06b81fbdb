//! Device resource limits.
//!
//! Work-group and memory limits reported by a device. The filter core uses
//! them to pick a work-group shape for the splat kernel and to refuse grids
//! the device cannot hold.

/// Default assumptions when device info unavailable.
const DEFAULT_MAX_WORK_ITEM_SIZE: usize = 1024;
const DEFAULT_MAX_WORK_GROUP_SIZE: usize = 1024;
const DEFAULT_LOCAL_MEM_BYTES: u64 = 48 * 1024;
const DEFAULT_MAX_ALLOC_BYTES: u64 = 512 * 1024 * 1024; // 512 MB
const DEFAULT_TOTAL_MEMORY: u64 = 2 * 1024 * 1024 * 1024; // 2 GB

/// Device resource limits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceLimits {
    /// Maximum work-group extent along x and y.
    pub max_work_item_sizes: [usize; 2],
    /// Maximum number of items in one work-group.
    pub max_work_group_size: usize,
    /// Local (per work-group) memory in bytes.
    pub local_mem_size: u64,
    /// Largest single buffer allocation in bytes.
    pub max_alloc_bytes: u64,
    /// Total device memory in bytes.
    pub total_memory: u64,
}

impl Default for DeviceLimits {
    fn default() -> Self {
        Self {
            max_work_item_sizes: [DEFAULT_MAX_WORK_ITEM_SIZE, DEFAULT_MAX_WORK_ITEM_SIZE],
            max_work_group_size: DEFAULT_MAX_WORK_GROUP_SIZE,
            local_mem_size: DEFAULT_LOCAL_MEM_BYTES,
            max_alloc_bytes: DEFAULT_MAX_ALLOC_BYTES,
            total_memory: DEFAULT_TOTAL_MEMORY,
        }
    }
}

impl DeviceLimits {
    /// Replace the local memory budget.
    pub fn with_local_mem(mut self, bytes: u64) -> Self {
        self.local_mem_size = bytes;
        self
    }

    /// Replace the work-group item ceiling.
    pub fn with_max_work_group_size(mut self, items: usize) -> Self {
        self.max_work_group_size = items;
        self
    }

    /// Replace the per-axis work-group extents.
    pub fn with_max_work_item_sizes(mut self, sizes: [usize; 2]) -> Self {
        self.max_work_item_sizes = sizes;
        self
    }

    /// Replace both memory sizes.
    pub fn with_memory(mut self, max_alloc_bytes: u64, total_memory: u64) -> Self {
        self.max_alloc_bytes = max_alloc_bytes;
        self.total_memory = total_memory;
        self
    }

    /// Check if a single allocation of `bytes` fits the device.
    pub fn fits_allocation(&self, bytes: u64) -> bool {
        bytes <= self.max_alloc_bytes && bytes <= self.total_memory
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_limits() {
        let l = DeviceLimits::default();
        assert_eq!(l.max_work_item_sizes, [1024, 1024]);
        assert!(l.local_mem_size >= 16 * 16 * 36);
    }

    #[test]
    fn test_fits_allocation() {
        let l = DeviceLimits::default().with_memory(1000, 800);
        assert!(l.fits_allocation(800));
        assert!(!l.fits_allocation(801));
    }
}
