//! Interfaces to the collaborators this core consumes: the potential builder,
//! detectors, scans, the contrast-transfer-function model and device memory
//! queries. The engine depends only on these traits; concrete implementations
//! live with the scan-and-detect driver.

use super::error::EngineError;
use super::waves::{Waves, WavesLike};
use crate::core::grid::Grid;
use crate::core::measurement::Measurement;
use nalgebra::Vector2;
use ndarray::{Array2, ArrayD};
use num_complex::Complex64;

/// One thin transmission slice: a complex transmission function and the
/// free-space thickness to the next slice.
#[derive(Debug, Clone)]
pub struct TransmissionSlice {
    pub thickness: f64,
    pub array: Array2<Complex64>,
}

impl TransmissionSlice {
    /// The real-space interaction step: elementwise multiply the wave
    /// functions by the transmission function, broadcast over the batch.
    pub fn transmit(&self, waves: &mut Waves) -> Result<(), EngineError> {
        let gpts = waves.grid().defined_gpts()?;
        if self.array.dim() != (gpts[0], gpts[1]) {
            return Err(EngineError::Potential(format!(
                "transmission function shape {:?} does not match wave function gpts {:?}",
                self.array.shape(),
                gpts
            )));
        }
        let dim = waves.array().raw_dim();
        let kernel = self.array.broadcast(dim).ok_or_else(|| {
            EngineError::Internal("transmission function broadcast failed".to_string())
        })?;
        ndarray::Zip::from(waves.array_mut().view_mut())
            .and(&kernel)
            .for_each(|value, &t| *value *= t);
        Ok(())
    }
}

/// A group of consecutive transmission slices, covering `start..end` of the
/// potential, materialized together for I/O efficiency.
#[derive(Debug, Clone)]
pub struct TransmissionChunk {
    pub start: usize,
    pub end: usize,
    pub slices: Vec<TransmissionSlice>,
}

/// The potential collaborator: produces per-slice transmission functions
/// from the atomic structure, lazily, keyed by the electron energy.
pub trait Potential {
    /// The real-space grid the transmission functions are sampled on.
    fn grid(&self) -> Grid;

    /// Number of slices in one configuration.
    fn num_slices(&self) -> usize;

    /// Cursor over transmission chunks of at most `max_batch` slices, in
    /// propagation order.
    fn transmission_functions(
        &self,
        energy: f64,
        max_batch: usize,
    ) -> Result<Box<dyn Iterator<Item = Result<TransmissionChunk, EngineError>> + '_>, EngineError>;

    /// Number of frozen-phonon configurations carried by this potential.
    fn frozen_phonon_configs(&self) -> usize {
        1
    }

    /// The individual configurations, in averaging order.
    ///
    /// Implementations reporting more than one configuration must override
    /// this; the default yields nothing.
    fn frozen_phonon_potentials(&self) -> Vec<Box<dyn Potential + '_>> {
        Vec::new()
    }
}

/// The detector collaborator: consumes an exit wave and produces a recorded
/// measurement.
pub trait Detector {
    /// Reduce a batch of exit waves to one value set per batch item.
    fn detect(&self, waves: &Waves) -> Result<ArrayD<f64>, EngineError>;

    /// Pre-size a measurement for results laid out as `shape` (a scan shape
    /// or a wave batch shape).
    fn allocate_measurement(&self, waves: &Waves, shape: &[usize])
    -> Result<Measurement, EngineError>;
}

/// One batch of probe positions with their flat indices into the scan.
#[derive(Debug, Clone)]
pub struct PositionBatch {
    pub indices: Vec<usize>,
    pub positions: Vec<Vector2<f64>>,
}

/// The scan collaborator: enumerates probe positions in batches and owns the
/// layout of recorded measurements.
pub trait Scan {
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Measurement layout, e.g. `[ny, nx]` for a rectangular scan.
    fn shape(&self) -> Vec<usize>;

    fn generate_positions(&self, max_batch: usize) -> Box<dyn Iterator<Item = PositionBatch> + '_>;

    /// Accumulate `values` into the entries addressed by `indices`. Called
    /// once per frozen-phonon configuration with pre-divided values, so the
    /// accumulation realizes the configuration average.
    fn insert_new_measurement(
        &self,
        measurement: &mut Measurement,
        indices: &[usize],
        values: &ArrayD<f64>,
    ) -> Result<(), EngineError>;

    /// Corner coordinates for rectangular grid scans; `None` otherwise.
    fn rect_bounds(&self) -> Option<([f64; 2], [f64; 2])> {
        None
    }
}

/// The contrast-transfer-function collaborator: maps spatial frequency to a
/// complex aberration phasor.
pub trait Ctf {
    /// Electron energy [eV] the aberration phases are defined for.
    fn energy(&self) -> Option<f64>;

    fn set_energy(&mut self, energy: f64);

    /// Evaluate the phasor on polar frequency coordinates: `alpha` is the
    /// scattering angle [rad], `phi` the azimuthal angle.
    fn evaluate(&self, alpha: &ArrayD<f64>, phi: &ArrayD<f64>) -> ArrayD<Complex64>;

    /// Monotone change counter; bumped by every parameter mutation. Kernel
    /// caches key on this to invalidate without observer wiring.
    fn version(&self) -> u64;

    fn clone_box(&self) -> Box<dyn Ctf>;
}

impl Clone for Box<dyn Ctf> {
    fn clone(&self) -> Self {
        self.clone_box()
    }
}

/// The trivial transfer function: a unit phasor everywhere. Used when no
/// aberration model is supplied.
#[derive(Debug, Clone, Default)]
pub struct OpenCtf {
    energy: Option<f64>,
    version: u64,
}

impl OpenCtf {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_energy(energy: f64) -> Self {
        Self {
            energy: Some(energy),
            version: 0,
        }
    }
}

impl Ctf for OpenCtf {
    fn energy(&self) -> Option<f64> {
        self.energy
    }

    fn set_energy(&mut self, energy: f64) {
        self.energy = Some(energy);
        self.version += 1;
    }

    fn evaluate(&self, alpha: &ArrayD<f64>, _phi: &ArrayD<f64>) -> ArrayD<Complex64> {
        ArrayD::from_elem(alpha.raw_dim(), Complex64::new(1.0, 0.0))
    }

    fn version(&self) -> u64 {
        self.version
    }

    fn clone_box(&self) -> Box<dyn Ctf> {
        Box::new(self.clone())
    }
}

/// Device memory query collaborator.
pub trait DeviceMemory: Send + Sync {
    fn available_bytes(&self) -> usize;
}

/// No memory constraint; batch sizes fall back to their caps.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnboundedMemory;

impl DeviceMemory for UnboundedMemory {
    fn available_bytes(&self) -> usize {
        usize::MAX
    }
}

/// A fixed budget, mainly for tests and deliberate throttling.
#[derive(Debug, Clone, Copy)]
pub struct FixedMemory(pub usize);

impl DeviceMemory for FixedMemory {
    fn available_bytes(&self) -> usize {
        self.0
    }
}
