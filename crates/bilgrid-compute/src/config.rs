//! Environment configuration for compute devices.
//!
//! # Environment Variables
//!
//! - `BILGRID_BACKEND` - Backend to use: `auto`, `cpu` or `cuda`
//! - `BILGRID_LOCAL_MEM_KB` - CPU device local memory budget in KB
//! - `BILGRID_MAX_WORK_GROUP` - CPU device work-group item ceiling

use std::env;
use std::sync::OnceLock;

use crate::backend::Backend;

const FALLBACK_SYSTEM_MEMORY: u64 = 8 << 30;

static SYSTEM_MEMORY: OnceLock<u64> = OnceLock::new();

/// Total system RAM in bytes, read once per process.
pub fn system_memory() -> u64 {
    *SYSTEM_MEMORY.get_or_init(|| match sys_info::mem_info() {
        Ok(info) => info.total * 1024,
        Err(e) => {
            tracing::warn!(error = %e, "cannot read system memory, assuming 8 GiB");
            FALLBACK_SYSTEM_MEMORY
        }
    })
}

/// Backend requested through `BILGRID_BACKEND`.
pub fn backend_override() -> Option<Backend> {
    env::var("BILGRID_BACKEND").ok().and_then(|v| parse_backend(&v))
}

/// CPU local memory budget from `BILGRID_LOCAL_MEM_KB`, in bytes.
pub fn local_mem_override() -> Option<u64> {
    env::var("BILGRID_LOCAL_MEM_KB").ok().and_then(|v| parse_local_mem_kb(&v))
}

/// CPU work-group ceiling from `BILGRID_MAX_WORK_GROUP`.
pub fn work_group_override() -> Option<usize> {
    env::var("BILGRID_MAX_WORK_GROUP").ok().and_then(|v| parse_work_group(&v))
}

// =============================================================================
// Parsing Helpers
// =============================================================================

fn parse_backend(value: &str) -> Option<Backend> {
    match value.parse() {
        Ok(backend) => Some(backend),
        Err(e) => {
            tracing::warn!(value, error = %e, "ignoring BILGRID_BACKEND");
            None
        }
    }
}

fn parse_local_mem_kb(value: &str) -> Option<u64> {
    value
        .trim()
        .parse::<u64>()
        .ok()
        .filter(|&kb| (1..=1024 * 1024).contains(&kb))
        .map(|kb| kb * 1024)
}

fn parse_work_group(value: &str) -> Option<usize> {
    value
        .trim()
        .parse::<usize>()
        .ok()
        .filter(|&n| (1..=65536).contains(&n))
}

/// Human-readable byte count using binary units.
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [(u64, &str); 3] = [(1 << 30, "GiB"), (1 << 20, "MiB"), (1 << 10, "KiB")];
    UNITS
        .iter()
        .find(|(scale, _)| bytes >= *scale)
        .map(|(scale, unit)| format!("{:.1} {unit}", bytes as f64 / *scale as f64))
        .unwrap_or_else(|| format!("{bytes} B"))
}
