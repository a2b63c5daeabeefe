use crate::core::accelerator::AcceleratorError;
use crate::core::grid::GridError;
use crate::core::io::PersistError;
use crate::core::measurement::MeasurementError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Grid(#[from] GridError),

    #[error(transparent)]
    Accelerator(#[from] AcceleratorError),

    #[error(transparent)]
    Measurement(#[from] MeasurementError),

    #[error("Wave function array must have at least 2 dimensions, got {rank}")]
    InvalidWaveRank { rank: usize },

    #[error("Energy mismatch between wave functions ({waves_ev} eV) and contrast transfer function ({ctf_ev} eV)")]
    CtfEnergyMismatch { waves_ev: f64, ctf_ev: f64 },

    #[error("Invalid downsampling limit '{0}': expected 'limit', 'valid' or an angle in mrad")]
    InvalidDownsampleLimit(String),

    #[error("Interpolation factor must be at least 1")]
    InvalidInterpolation,

    #[error("Operation '{operation}' is not available on a non-periodic (cropped) scattering matrix")]
    NotPeriodic { operation: &'static str },

    #[error("Operation '{operation}' supports only rectangular grid scans")]
    UnsupportedScan { operation: &'static str },

    #[error("Measurement set does not match detectors: {reason}")]
    MeasurementMismatch { reason: String },

    #[error("Potential error: {0}")]
    Potential(String),

    #[error("Persistence failed: {0}")]
    Persist(#[from] PersistError),

    #[error("Internal logic error: {0}")]
    Internal(String),
}
