//! Backend probing and auto-selection.
//!
//! Every concrete backend is probed, including ones compiled out of this
//! build, so `bilgrid info` can show what is missing.

use std::cmp::Reverse;

use super::Backend;

/// Probe result for one concrete backend.
#[derive(Debug, Clone)]
pub struct BackendInfo {
    pub backend: Backend,
    pub available: bool,
    /// Auto-selection rank, zero when unavailable.
    pub priority: u32,
    pub description: &'static str,
}

impl BackendInfo {
    fn probe(backend: Backend) -> Self {
        let (rank, description) = match backend {
            Backend::Cuda if cfg!(feature = "cuda") => (150, "NVIDIA GPU, NVRTC kernels, atomic splat"),
            Backend::Cuda => (0, "not compiled in (build with --features cuda)"),
            Backend::Cpu | Backend::Auto => (10, "rayon tasks, one per emulated work-group"),
        };
        let available = backend.is_available();
        Self {
            backend,
            available,
            priority: if available { rank } else { 0 },
            description,
        }
    }

    /// Upper-case display label.
    pub fn label(&self) -> &'static str {
        match self.backend {
            Backend::Cuda => "CUDA",
            Backend::Cpu | Backend::Auto => "CPU",
        }
    }
}

/// Probe every concrete backend, best first.
pub fn detect_backends() -> Vec<BackendInfo> {
    let mut found: Vec<_> = Backend::CONCRETE.into_iter().map(BackendInfo::probe).collect();
    found.sort_by_key(|info| Reverse(info.priority));
    found
}

/// Backend named by `BILGRID_BACKEND`, if it can actually run here.
fn forced_backend() -> Option<Backend> {
    let forced = crate::config::backend_override()?;
    match forced {
        Backend::Auto => None,
        b if b.is_available() => Some(b),
        b => {
            tracing::warn!(backend = %b, "BILGRID_BACKEND names an unavailable backend, auto-selecting");
            None
        }
    }
}

/// Pick the backend `Backend::Auto` resolves to.
pub fn select_best_backend() -> Backend {
    forced_backend().unwrap_or_else(|| {
        detect_backends()
            .into_iter()
            .find(|info| info.available)
            .map_or(Backend::Cpu, |info| info.backend)
    })
}

/// One line per backend, the auto-selected one marked.
pub fn describe_backends() -> String {
    let selected = select_best_backend();
    detect_backends()
        .iter()
        .map(|info| {
            let status = if info.available { '+' } else { '-' };
            let mark = if info.backend == selected { "  <- selected" } else { "" };
            format!("[{status}] {:<5} {}{mark}\n", info.label(), info.description)
        })
        .collect()
}
