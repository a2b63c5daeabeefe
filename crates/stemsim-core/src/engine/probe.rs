//! The focused probe: builds wave functions from a contrast transfer
//! function at given positions and drives scanning via the multislice
//! driver.

use super::cache::{KernelCache, key_bits};
use super::error::EngineError;
use super::interfaces::{Ctf, Detector, DeviceMemory, Potential, Scan, UnboundedMemory};
use super::multislice;
use super::progress::{Progress, ProgressReporter};
use super::propagator::FresnelPropagator;
use super::waves::{Waves, WavesLike};
use crate::core::accelerator::Accelerator;
use crate::core::backend::{CpuBackend, SpectralBackend};
use crate::core::filters::AntialiasFilter;
use crate::core::fourier::{fourier_translation_operator, polar_coordinates, spatial_frequencies};
use crate::core::grid::Grid;
use crate::core::measurement::Measurement;
use nalgebra::Vector2;
use ndarray::{Array2, Axis};
use num_complex::Complex64;
use std::sync::Arc;
use tracing::instrument;

const MAX_SCAN_BATCH: usize = 32;
const SCAN_MEMORY_FRACTION: f64 = 0.4;

#[derive(Debug, Clone, PartialEq)]
struct CtfKernelKey {
    gpts: [usize; 2],
    sampling: [u64; 2],
    energy: u64,
    ctf_version: u64,
}

/// Probe wave function builder for scanning transmission simulations.
///
/// Probes are synthesized by inverse-transforming the transfer function
/// times a translation phasor per position; sub-pixel positioning costs no
/// resampling. The evaluated transfer function is cached and invalidated
/// whenever the CTF, grid or energy change.
pub struct Probe {
    grid: Grid,
    accelerator: Accelerator,
    ctf: Box<dyn Ctf>,
    tilt: Option<[f64; 2]>,
    ctf_cache: KernelCache<CtfKernelKey, Array2<Complex64>>,
    memory: Arc<dyn DeviceMemory>,
    backend: Arc<dyn SpectralBackend>,
}

impl WavesLike for Probe {
    fn grid(&self) -> &Grid {
        &self.grid
    }

    fn accelerator(&self) -> &Accelerator {
        &self.accelerator
    }

    fn tilt(&self) -> Option<[f64; 2]> {
        self.tilt
    }

    fn antialiasing_aperture(&self) -> f64 {
        AntialiasFilter::CUTOFF
    }
}

impl Probe {
    pub fn new(
        extent: Option<[f64; 2]>,
        gpts: Option<[usize; 2]>,
        sampling: Option<[f64; 2]>,
        energy: Option<f64>,
        mut ctf: Box<dyn Ctf>,
    ) -> Result<Self, EngineError> {
        if let (Some(probe_energy), Some(ctf_energy)) = (energy, ctf.energy()) {
            if probe_energy != ctf_energy {
                return Err(EngineError::CtfEnergyMismatch {
                    waves_ev: probe_energy,
                    ctf_ev: ctf_energy,
                });
            }
        }
        if let (Some(probe_energy), None) = (energy, ctf.energy()) {
            ctf.set_energy(probe_energy);
        }
        Ok(Self {
            grid: Grid::new(extent, gpts, sampling)?,
            accelerator: Accelerator::new(ctf.energy()),
            ctf,
            tilt: None,
            ctf_cache: KernelCache::new(),
            memory: Arc::new(UnboundedMemory),
            backend: CpuBackend::shared(),
        })
    }

    pub fn with_tilt(mut self, tilt: Option<[f64; 2]>) -> Self {
        self.tilt = tilt;
        self
    }

    pub fn with_memory(mut self, memory: Arc<dyn DeviceMemory>) -> Self {
        self.memory = memory;
        self
    }

    pub fn with_backend(mut self, backend: Arc<dyn SpectralBackend>) -> Self {
        self.backend = backend;
        self
    }

    pub fn ctf(&self) -> &dyn Ctf {
        self.ctf.as_ref()
    }

    /// Mutate the grid; the cached transfer function keys on the grid, so a
    /// change invalidates on the next build.
    pub fn set_extent(&mut self, extent: [f64; 2]) -> Result<(), EngineError> {
        self.grid.set_extent(extent)?;
        Ok(())
    }

    pub fn set_gpts(&mut self, gpts: [usize; 2]) -> Result<(), EngineError> {
        self.grid.set_gpts(gpts)?;
        Ok(())
    }

    pub fn set_sampling(&mut self, sampling: [f64; 2]) -> Result<(), EngineError> {
        self.grid.set_sampling(sampling)?;
        Ok(())
    }

    /// Number of transfer-function evaluations so far (cache observability).
    pub fn ctf_evaluations(&self) -> usize {
        self.ctf_cache.builds()
    }

    fn evaluated_ctf(&mut self) -> Result<&Array2<Complex64>, EngineError> {
        let gpts = self.grid.defined_gpts()?;
        let sampling = self.grid.defined_sampling()?;
        let energy = self.accelerator.defined_energy()?;
        let wavelength = self.accelerator.wavelength()?;
        let key = CtfKernelKey {
            gpts,
            sampling: [key_bits(sampling[0]), key_bits(sampling[1])],
            energy: key_bits(energy),
            ctf_version: self.ctf.version(),
        };
        let ctf = &self.ctf;
        self.ctf_cache.try_get_or_insert_with(key, || {
            let (kx, ky) = spatial_frequencies(gpts, sampling);
            let kx: Vec<f64> = kx.iter().map(|k| k * wavelength).collect();
            let ky: Vec<f64> = ky.iter().map(|k| k * wavelength).collect();
            let (alpha, phi) = polar_coordinates(&kx, &ky);
            ctf.evaluate(&alpha.into_dyn(), &phi.into_dyn())
                .into_dimensionality::<ndarray::Ix2>()
                .map_err(|_| EngineError::Internal("CTF evaluation must be 2D".to_string()))
        })
    }

    /// Build probe wave functions at the given positions (grid center when
    /// none are given), normalized so the first probe carries unit
    /// integrated intensity in the diffraction plane.
    pub fn build(&mut self, positions: Option<&[Vector2<f64>]>) -> Result<Waves, EngineError> {
        self.grid.check_is_defined()?;
        self.accelerator.check_is_defined()?;
        let gpts = self.grid.defined_gpts()?;
        let sampling = self.grid.defined_sampling()?;
        let extent = self.grid.defined_extent()?;

        let center = [Vector2::new(extent[0] / 2.0, extent[1] / 2.0)];
        let positions: &[Vector2<f64>] = positions.unwrap_or(&center);
        let positions_px: Vec<Vector2<f64>> = positions
            .iter()
            .map(|p| Vector2::new(p.x / sampling[0], p.y / sampling[1]))
            .collect();

        let mut array = fourier_translation_operator(&positions_px, gpts);
        {
            let kernel = self.evaluated_ctf()?;
            for mut wave in array.axis_iter_mut(Axis(0)) {
                wave *= &kernel.view();
            }
        }
        let mut array = array.into_dyn();
        self.backend.ifft2(&mut array.view_mut());

        let first_power: f64 = array
            .index_axis(Axis(0), 0)
            .iter()
            .map(|v| v.norm_sqr())
            .sum();
        let norm = first_power.sqrt() * ((gpts[0] * gpts[1]) as f64).sqrt();
        array.mapv_inplace(|v| v / norm);

        Ok(Waves::new(array, Some(extent), None, self.accelerator.energy())?
            .with_tilt(self.tilt)
            .with_backend(self.backend.clone()))
    }

    /// Build probes at the given positions and propagate them through the
    /// potential.
    pub fn multislice(
        &mut self,
        positions: &[Vector2<f64>],
        potential: &dyn Potential,
        reporter: &ProgressReporter,
    ) -> Result<Waves, EngineError> {
        self.grid.match_with(&potential.grid())?;
        let mut exit_waves = self.build(Some(positions))?;
        let mut propagator = FresnelPropagator::new();
        multislice::run(&mut exit_waves, potential, &mut propagator, 1, reporter)?;
        Ok(exit_waves)
    }

    fn scan_batch_size(&self, max_batch: Option<usize>) -> Result<usize, EngineError> {
        if let Some(batch) = max_batch {
            return Ok(batch.max(1));
        }
        let gpts = self.grid.defined_gpts()?;
        let bytes_per_wave = std::mem::size_of::<Complex64>() * gpts[0] * gpts[1];
        Ok(super::batching::memory_limited_batch(
            self.memory.available_bytes(),
            SCAN_MEMORY_FRACTION,
            bytes_per_wave,
            MAX_SCAN_BATCH,
        ))
    }

    /// Raster the probe over the potential and record a measurement per
    /// detector.
    ///
    /// Positions arrive in batches sized either explicitly or from available
    /// device memory. Frozen-phonon configurations are scanned sequentially
    /// and each detection is divided by the configuration count before
    /// accumulation: the configuration average runs over detections, never
    /// over wave functions.
    #[instrument(skip_all, name = "probe_scan")]
    pub fn scan(
        &mut self,
        scan: &dyn Scan,
        detectors: &[&dyn Detector],
        potential: &dyn Potential,
        measurements: Option<Vec<Measurement>>,
        max_batch: Option<usize>,
        reporter: &ProgressReporter,
    ) -> Result<Vec<Measurement>, EngineError> {
        self.grid.match_with(&potential.grid())?;
        self.grid.check_is_defined()?;

        let mut measurements = validate_measurements(measurements, detectors.len())?;
        let max_batch = self.scan_batch_size(max_batch)?;
        let n_configs = potential.frozen_phonon_configs();

        reporter.report(Progress::PhaseStart { name: "Scan" });
        if n_configs > 1 {
            let configs = potential.frozen_phonon_potentials();
            if configs.len() != n_configs {
                return Err(EngineError::Potential(format!(
                    "potential reports {n_configs} frozen phonon configurations but yielded {}",
                    configs.len()
                )));
            }
            for config in &configs {
                self.scan_configuration(
                    scan,
                    detectors,
                    config.as_ref(),
                    &mut measurements,
                    max_batch,
                    1.0 / n_configs as f64,
                    reporter,
                )?;
            }
        } else {
            self.scan_configuration(
                scan,
                detectors,
                potential,
                &mut measurements,
                max_batch,
                1.0,
                reporter,
            )?;
        }
        reporter.report(Progress::PhaseFinish);

        finalize_measurements(measurements)
    }

    #[allow(clippy::too_many_arguments)]
    fn scan_configuration(
        &mut self,
        scan: &dyn Scan,
        detectors: &[&dyn Detector],
        potential: &dyn Potential,
        measurements: &mut [Option<Measurement>],
        max_batch: usize,
        factor: f64,
        reporter: &ProgressReporter,
    ) -> Result<(), EngineError> {
        reporter.report(Progress::TaskStart {
            total_steps: scan.len() as u64,
        });
        let quiet = ProgressReporter::new();
        for batch in scan.generate_positions(max_batch) {
            let exit_waves = self.multislice(&batch.positions, potential, &quiet)?;
            record_detections(
                scan,
                detectors,
                &exit_waves,
                &batch.indices,
                measurements,
                factor,
            )?;
            reporter.report(Progress::TaskAdvance {
                steps: batch.indices.len() as u64,
            });
        }
        reporter.report(Progress::TaskFinish);
        Ok(())
    }
}

/// Fail fast when supplied measurements do not line up with the detectors.
pub(crate) fn validate_measurements(
    measurements: Option<Vec<Measurement>>,
    n_detectors: usize,
) -> Result<Vec<Option<Measurement>>, EngineError> {
    match measurements {
        None => Ok((0..n_detectors).map(|_| None).collect()),
        Some(supplied) => {
            if supplied.len() != n_detectors {
                return Err(EngineError::MeasurementMismatch {
                    reason: format!(
                        "{} measurements supplied for {} detectors",
                        supplied.len(),
                        n_detectors
                    ),
                });
            }
            Ok(supplied.into_iter().map(Some).collect())
        }
    }
}

pub(crate) fn finalize_measurements(
    measurements: Vec<Option<Measurement>>,
) -> Result<Vec<Measurement>, EngineError> {
    measurements
        .into_iter()
        .map(|entry| {
            entry.ok_or_else(|| EngineError::MeasurementMismatch {
                reason: "scan produced no positions to measure".to_string(),
            })
        })
        .collect()
}

/// Detect one batch of exit waves into the per-detector measurements,
/// allocating each measurement lazily on first insertion.
pub(crate) fn record_detections(
    scan: &dyn Scan,
    detectors: &[&dyn Detector],
    exit_waves: &Waves,
    indices: &[usize],
    measurements: &mut [Option<Measurement>],
    factor: f64,
) -> Result<(), EngineError> {
    for (slot, detector) in measurements.iter_mut().zip(detectors) {
        let mut detection = detector.detect(exit_waves)?;
        if factor != 1.0 {
            detection.mapv_inplace(|value| value * factor);
        }
        if slot.is_none() {
            *slot = Some(detector.allocate_measurement(exit_waves, &scan.shape())?);
        }
        let measurement = slot.as_mut().expect("slot allocated above");
        scan.insert_new_measurement(measurement, indices, &detection)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::test_support::{
        ApertureCtf, IntegratedIntensityDetector, ListScan, PhononPotential, SlicedPotential,
    };
    use ndarray::ArrayD;

    fn test_probe() -> Probe {
        Probe::new(
            Some([3.2, 3.2]),
            Some([32, 32]),
            None,
            Some(80e3),
            Box::new(ApertureCtf::new(60.0, None)),
        )
        .unwrap()
    }

    #[test]
    fn conflicting_energies_are_rejected_at_construction() {
        let result = Probe::new(
            Some([3.2, 3.2]),
            Some([32, 32]),
            None,
            Some(80e3),
            Box::new(ApertureCtf::new(60.0, Some(100e3))),
        );
        assert!(matches!(
            result,
            Err(EngineError::CtfEnergyMismatch { .. })
        ));
    }

    #[test]
    fn built_probe_is_normalized() {
        let mut probe = test_probe();
        let waves = probe.build(None).unwrap();
        let gpts = waves.grid().defined_gpts().unwrap();
        let power: f64 = waves.array().iter().map(|v| v.norm_sqr()).sum();
        // Unit integrated intensity in the diffraction plane.
        assert!((power * (gpts[0] * gpts[1]) as f64 - 1.0).abs() < 1e-9);
    }

    #[test]
    fn build_centers_the_probe_on_the_requested_position() {
        let mut probe = test_probe();
        let position = Vector2::new(1.6, 0.8);
        let waves = probe.build(Some(&[position])).unwrap();
        let intensity = waves.intensity().unwrap();

        let mut best = (0usize, 0usize, f64::MIN);
        for ((_, i, j), value) in intensity
            .values
            .view()
            .into_dimensionality::<ndarray::Ix3>()
            .unwrap()
            .indexed_iter()
        {
            if *value > best.2 {
                best = (i, j, *value);
            }
        }
        assert_eq!(best.0, 16);
        assert_eq!(best.1, 8);
    }

    #[test]
    fn ctf_evaluation_is_cached_across_builds() {
        let mut probe = test_probe();
        probe.build(None).unwrap();
        probe.build(Some(&[Vector2::new(1.0, 1.0)])).unwrap();
        assert_eq!(probe.ctf_evaluations(), 1);
    }

    #[test]
    fn grid_change_invalidates_the_ctf_cache() {
        let mut probe = test_probe();
        probe.build(None).unwrap();
        probe.set_sampling([0.05, 0.05]).unwrap();
        probe.build(None).unwrap();
        assert_eq!(probe.ctf_evaluations(), 2);
    }

    #[test]
    fn scan_records_one_value_per_position() {
        let mut probe = test_probe();
        let scan = ListScan::new(vec![
            Vector2::new(0.8, 0.8),
            Vector2::new(1.6, 1.6),
            Vector2::new(2.4, 2.4),
        ]);
        let detector = IntegratedIntensityDetector;
        let potential = SlicedPotential::uniform([32, 32], [0.1, 0.1], 2);

        let measurements = probe
            .scan(
                &scan,
                &[&detector],
                &potential,
                None,
                Some(2),
                &ProgressReporter::new(),
            )
            .unwrap();

        assert_eq!(measurements.len(), 1);
        assert_eq!(measurements[0].values.shape(), &[3]);
        for value in measurements[0].values.iter() {
            assert!(*value > 0.0);
        }
    }

    #[test]
    fn identical_phonon_configurations_scan_to_the_single_config_result() {
        let scan = ListScan::new(vec![Vector2::new(1.6, 1.6), Vector2::new(0.8, 2.4)]);
        let detector = IntegratedIntensityDetector;
        let reporter = ProgressReporter::new();

        let mut probe = test_probe();
        let single = SlicedPotential::uniform([32, 32], [0.1, 0.1], 2);
        let baseline = probe
            .scan(&scan, &[&detector], &single, None, Some(4), &reporter)
            .unwrap();

        let mut probe = test_probe();
        let repeated = PhononPotential::uniform([32, 32], [0.1, 0.1], 3, 2);
        let averaged = probe
            .scan(&scan, &[&detector], &repeated, None, Some(4), &reporter)
            .unwrap();

        for (a, b) in averaged[0].values.iter().zip(baseline[0].values.iter()) {
            assert!((a - b).abs() < 1e-9, "{a} vs {b}");
        }
    }

    #[test]
    fn mismatched_measurement_count_fails_before_any_computation() {
        let mut probe = test_probe();
        let scan = ListScan::new(vec![Vector2::new(1.6, 1.6)]);
        let detector = IntegratedIntensityDetector;
        let other = IntegratedIntensityDetector;
        let potential = SlicedPotential::uniform([32, 32], [0.1, 0.1], 1);
        let supplied = vec![Measurement::new(ArrayD::zeros(ndarray::IxDyn(&[1])), vec![None]).unwrap()];

        let result = probe.scan(
            &scan,
            &[&detector, &other],
            &potential,
            Some(supplied),
            Some(1),
            &ProgressReporter::new(),
        );
        assert!(matches!(
            result,
            Err(EngineError::MeasurementMismatch { .. })
        ));
    }
}
