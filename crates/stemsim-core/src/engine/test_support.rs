//! Shared mock collaborators for engine tests.

use super::batching::BatchRanges;
use super::error::EngineError;
use super::interfaces::{
    Ctf, Detector, PositionBatch, Potential, Scan, TransmissionChunk, TransmissionSlice,
};
use super::waves::Waves;
use crate::core::grid::Grid;
use crate::core::measurement::Measurement;
use nalgebra::Vector2;
use ndarray::{Array2, ArrayD, Axis, IxDyn};
use num_complex::Complex64;

/// A potential with explicit transmission slices, one configuration.
#[derive(Debug, Clone)]
pub(crate) struct SlicedPotential {
    pub grid: Grid,
    pub slices: Vec<TransmissionSlice>,
}

impl SlicedPotential {
    pub fn new(gpts: [usize; 2], sampling: [f64; 2], slices: Vec<TransmissionSlice>) -> Self {
        Self {
            grid: Grid::new(None, Some(gpts), Some(sampling)).unwrap(),
            slices,
        }
    }

    /// Unit transmission, zero thickness: the identity potential.
    pub fn uniform(gpts: [usize; 2], sampling: [f64; 2], n_slices: usize) -> Self {
        let slices = (0..n_slices)
            .map(|_| TransmissionSlice {
                thickness: 0.0,
                array: Array2::from_elem((gpts[0], gpts[1]), Complex64::new(1.0, 0.0)),
            })
            .collect();
        Self::new(gpts, sampling, slices)
    }

    /// A weak pure-phase grating followed by free space.
    pub fn phase_grating(gpts: [usize; 2], sampling: [f64; 2], strength: f64, dz: f64) -> Self {
        let array = Array2::from_shape_fn((gpts[0], gpts[1]), |(i, j)| {
            let phase = strength
                * ((2.0 * std::f64::consts::PI * i as f64 / gpts[0] as f64).cos()
                    + (2.0 * std::f64::consts::PI * j as f64 / gpts[1] as f64).sin());
            Complex64::new(phase.cos(), phase.sin())
        });
        Self::new(
            gpts,
            sampling,
            vec![TransmissionSlice {
                thickness: dz,
                array,
            }],
        )
    }
}

impl Potential for SlicedPotential {
    fn grid(&self) -> Grid {
        self.grid.clone()
    }

    fn num_slices(&self) -> usize {
        self.slices.len()
    }

    fn transmission_functions(
        &self,
        _energy: f64,
        max_batch: usize,
    ) -> Result<Box<dyn Iterator<Item = Result<TransmissionChunk, EngineError>> + '_>, EngineError>
    {
        let iter = BatchRanges::new(self.slices.len(), max_batch).map(move |(start, end)| {
            Ok(TransmissionChunk {
                start,
                end,
                slices: self.slices[start..end].to_vec(),
            })
        });
        Ok(Box::new(iter))
    }
}

/// A frozen-phonon potential with explicit configurations.
#[derive(Debug, Clone)]
pub(crate) struct PhononPotential {
    pub configs: Vec<SlicedPotential>,
}

impl PhononPotential {
    /// Identical unit configurations; the average must be a no-op.
    pub fn uniform(
        gpts: [usize; 2],
        sampling: [f64; 2],
        n_configs: usize,
        n_slices: usize,
    ) -> Self {
        Self {
            configs: (0..n_configs)
                .map(|_| SlicedPotential::uniform(gpts, sampling, n_slices))
                .collect(),
        }
    }
}

impl Potential for PhononPotential {
    fn grid(&self) -> Grid {
        self.configs[0].grid.clone()
    }

    fn num_slices(&self) -> usize {
        self.configs[0].num_slices()
    }

    fn transmission_functions(
        &self,
        energy: f64,
        max_batch: usize,
    ) -> Result<Box<dyn Iterator<Item = Result<TransmissionChunk, EngineError>> + '_>, EngineError>
    {
        self.configs[0].transmission_functions(energy, max_batch)
    }

    fn frozen_phonon_configs(&self) -> usize {
        self.configs.len()
    }

    fn frozen_phonon_potentials(&self) -> Vec<Box<dyn Potential + '_>> {
        self.configs
            .iter()
            .map(|config| Box::new(config.clone()) as Box<dyn Potential>)
            .collect()
    }
}

/// Detects the integrated intensity of each wave in the batch.
#[derive(Debug, Clone, Copy)]
pub(crate) struct IntegratedIntensityDetector;

impl Detector for IntegratedIntensityDetector {
    fn detect(&self, waves: &Waves) -> Result<ArrayD<f64>, EngineError> {
        let intensity = waves.backend().abs2(&waves.array().view());
        let ndim = intensity.ndim();
        let summed = intensity.sum_axis(Axis(ndim - 1)).sum_axis(Axis(ndim - 2));
        Ok(summed)
    }

    fn allocate_measurement(
        &self,
        _waves: &Waves,
        shape: &[usize],
    ) -> Result<Measurement, EngineError> {
        let values = ArrayD::zeros(IxDyn(shape));
        let calibrations = vec![None; shape.len()];
        Ok(Measurement::new(values, calibrations)?)
    }
}

/// Detects the intensity at the central pixel of each wave in the batch;
/// position-sensitive, unlike the integrated intensity.
#[derive(Debug, Clone, Copy)]
pub(crate) struct CenterIntensityDetector;

impl Detector for CenterIntensityDetector {
    fn detect(&self, waves: &Waves) -> Result<ArrayD<f64>, EngineError> {
        let array = waves.array();
        let ndim = array.ndim();
        let center = [array.shape()[ndim - 2] / 2, array.shape()[ndim - 1] / 2];
        let centered = array
            .index_axis(Axis(ndim - 1), center[1])
            .index_axis(Axis(ndim - 2), center[0])
            .to_owned();
        Ok(centered.mapv(|value| value.norm_sqr()))
    }

    fn allocate_measurement(
        &self,
        _waves: &Waves,
        shape: &[usize],
    ) -> Result<Measurement, EngineError> {
        let values = ArrayD::zeros(IxDyn(shape));
        let calibrations = vec![None; shape.len()];
        Ok(Measurement::new(values, calibrations)?)
    }
}

/// A scan over an explicit list of positions with a flat measurement layout.
#[derive(Debug, Clone)]
pub(crate) struct ListScan {
    pub positions: Vec<Vector2<f64>>,
    rect: Option<([f64; 2], [f64; 2])>,
}

impl ListScan {
    pub fn new(positions: Vec<Vector2<f64>>) -> Self {
        Self {
            positions,
            rect: None,
        }
    }

    pub fn rectangular(positions: Vec<Vector2<f64>>, start: [f64; 2], end: [f64; 2]) -> Self {
        Self {
            positions,
            rect: Some((start, end)),
        }
    }
}

impl Scan for ListScan {
    fn len(&self) -> usize {
        self.positions.len()
    }

    fn shape(&self) -> Vec<usize> {
        vec![self.positions.len()]
    }

    fn generate_positions(&self, max_batch: usize) -> Box<dyn Iterator<Item = PositionBatch> + '_> {
        Box::new(
            BatchRanges::new(self.positions.len(), max_batch).map(move |(start, end)| {
                PositionBatch {
                    indices: (start..end).collect(),
                    positions: self.positions[start..end].to_vec(),
                }
            }),
        )
    }

    fn insert_new_measurement(
        &self,
        measurement: &mut Measurement,
        indices: &[usize],
        values: &ArrayD<f64>,
    ) -> Result<(), EngineError> {
        for (offset, &index) in indices.iter().enumerate() {
            measurement.values[&[index][..]] += values[&[offset][..]];
        }
        Ok(())
    }

    fn rect_bounds(&self) -> Option<([f64; 2], [f64; 2])> {
        self.rect
    }
}

/// An ideal aperture: unit transmission below the cutoff angle, zero above.
#[derive(Debug, Clone)]
pub(crate) struct ApertureCtf {
    cutoff_mrad: f64,
    energy: Option<f64>,
    version: u64,
}

impl ApertureCtf {
    pub fn new(cutoff_mrad: f64, energy: Option<f64>) -> Self {
        Self {
            cutoff_mrad,
            energy,
            version: 0,
        }
    }
}

impl Ctf for ApertureCtf {
    fn energy(&self) -> Option<f64> {
        self.energy
    }

    fn set_energy(&mut self, energy: f64) {
        self.energy = Some(energy);
        self.version += 1;
    }

    fn evaluate(&self, alpha: &ArrayD<f64>, _phi: &ArrayD<f64>) -> ArrayD<Complex64> {
        let cutoff = self.cutoff_mrad / 1e3;
        alpha.mapv(|angle| {
            if angle < cutoff {
                Complex64::new(1.0, 0.0)
            } else {
                Complex64::new(0.0, 0.0)
            }
        })
    }

    fn version(&self) -> u64 {
        self.version
    }

    fn clone_box(&self) -> Box<dyn Ctf> {
        Box::new(self.clone())
    }
}
