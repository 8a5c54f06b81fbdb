//! Error types for bilateral grid filtering.

use std::fmt;

use bilgrid_compute::ComputeError;
use thiserror::Error;

use crate::session::SessionState;

/// Pipeline stage a device failure happened in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Grid zero-fill during session creation.
    Zero,
    Splat,
    /// One of the three axis passes.
    Blur,
    Slice,
    /// Host/device copies.
    Transfer,
    /// Waiting for device completion.
    Finish,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Zero => "zero",
            Self::Splat => "splat",
            Self::Blur => "blur",
            Self::Slice => "slice",
            Self::Transfer => "transfer",
            Self::Finish => "finish",
        })
    }
}

/// Error type for bilateral grid filtering.
#[derive(Error, Debug)]
pub enum BilateralError {
    /// The device could not report its limits; the filter is unavailable on it.
    #[error("device query failed: {0}")]
    DeviceQuery(#[source] ComputeError),

    /// The device cannot fit the minimum work-group or the grid.
    #[error("insufficient device resources: {0}")]
    InsufficientDeviceResources(String),

    /// Device memory allocation failed. No session was created.
    #[error("device allocation failed: {0}")]
    Allocation(#[source] ComputeError),

    /// A kernel failed. The session is contaminated and must be destroyed.
    #[error("{stage} stage failed: {source}")]
    Kernel {
        stage: Stage,
        #[source]
        source: ComputeError,
    },

    /// A stage was called out of order.
    #[error("{operation} requires a {expected} session, found {actual}")]
    InvalidSequence {
        operation: &'static str,
        expected: SessionState,
        actual: SessionState,
    },

    /// The session failed or was destroyed; its grid cannot be used.
    #[error("{operation} requires a live session, found {actual}")]
    SessionUnusable {
        operation: &'static str,
        actual: SessionState,
    },

    /// Invalid dimensions, sigmas or buffer sizes.
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),
}

impl BilateralError {
    pub(crate) fn kernel(stage: Stage) -> impl FnOnce(ComputeError) -> Self {
        move |source| Self::Kernel { stage, source }
    }

    /// Whether the caller should fall back to another path or device rather
    /// than report a failure.
    pub fn is_fallback(&self) -> bool {
        matches!(self, Self::DeviceQuery(_) | Self::InsufficientDeviceResources(_))
    }
}

/// Result type for bilateral grid filtering.
pub type BilateralResult<T> = Result<T, BilateralError>;
