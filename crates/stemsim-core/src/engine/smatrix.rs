//! The PRISM scattering matrix: a plane-wave expansion of the probe that is
//! propagated through the potential once and collapsed per scan position by
//! a linear combination, instead of repeating multislice per position.

use super::batching::{BatchRanges, memory_limited_batch};
use super::error::EngineError;
use super::interfaces::{Ctf, Detector, DeviceMemory, OpenCtf, Potential, Scan, UnboundedMemory};
use super::probe::{finalize_measurements, record_detections, validate_measurements};
use super::progress::{Progress, ProgressReporter};
use super::waves::{DownsampleLimit, Waves, WavesLike};
use crate::core::accelerator::Accelerator;
use crate::core::backend::{CpuBackend, SpectralBackend, complex_exponential};
use crate::core::filters::AntialiasFilter;
use crate::core::fourier::periodic_crop;
use crate::core::grid::Grid;
use crate::core::measurement::Measurement;
use nalgebra::Vector2;
use ndarray::{Array1, Array2, Array3, Axis, Ix1, Ix3, s};
use num_complex::Complex64;
use std::f64::consts::PI;
use std::sync::Arc;
use tracing::{info, instrument};

const EXPANSION_MEMORY_FRACTION: f64 = 0.2;
const MAX_COLLAPSE_BATCH: usize = 1024;

fn bytes_per_wave(gpts: [usize; 2]) -> usize {
    std::mem::size_of::<Complex64>() * gpts[0] * gpts[1]
}

/// Builder for [`SMatrixArray`]: holds the expansion cutoff, interpolation
/// factor, transfer function and grid, but no array data until `build()`.
pub struct SMatrix {
    expansion_cutoff: f64,
    interpolation: usize,
    ctf: Box<dyn Ctf>,
    grid: Grid,
    accelerator: Accelerator,
    tilt: Option<[f64; 2]>,
    memory: Arc<dyn DeviceMemory>,
    backend: Arc<dyn SpectralBackend>,
}

impl WavesLike for SMatrix {
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

impl SMatrix {
    /// `expansion_cutoff` is the angular cutoff of the plane-wave expansion
    /// [mrad]; `interpolation` trades probe-window resolution for basis size.
    pub fn new(
        expansion_cutoff: f64,
        energy: f64,
        interpolation: usize,
        ctf: Option<Box<dyn Ctf>>,
        extent: Option<[f64; 2]>,
        gpts: Option<[usize; 2]>,
        sampling: Option<[f64; 2]>,
    ) -> Result<Self, EngineError> {
        if interpolation < 1 {
            return Err(EngineError::InvalidInterpolation);
        }
        let mut ctf = ctf.unwrap_or_else(|| Box::new(OpenCtf::new()));
        match ctf.energy() {
            None => ctf.set_energy(energy),
            Some(ctf_energy) if ctf_energy != energy => {
                return Err(EngineError::CtfEnergyMismatch {
                    waves_ev: energy,
                    ctf_ev: ctf_energy,
                });
            }
            Some(_) => {}
        }
        Ok(Self {
            expansion_cutoff,
            interpolation,
            ctf,
            grid: Grid::new(extent, gpts, sampling)?,
            accelerator: Accelerator::new(Some(energy)),
            tilt: None,
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

    pub fn expansion_cutoff(&self) -> f64 {
        self.expansion_cutoff
    }

    pub fn interpolation(&self) -> usize {
        self.interpolation
    }

    pub fn ctf(&self) -> &dyn Ctf {
        self.ctf.as_ref()
    }

    /// The grid of the interpolated probe window.
    pub fn interpolated_grid(&self) -> Result<Grid, EngineError> {
        let gpts = self.grid.defined_gpts()?;
        let sampling = self.grid.defined_sampling()?;
        let cropped = [gpts[0] / self.interpolation, gpts[1] / self.interpolation];
        Ok(Grid::new(None, Some(cropped), Some(sampling))?.lock_gpts())
    }

    /// Spatial frequencies of the plane-wave expansion: the reciprocal
    /// lattice scaled by the interpolation factor, masked to the disk below
    /// the expansion cutoff.
    pub fn k(&self) -> Result<Vec<Vector2<f64>>, EngineError> {
        let extent = self.grid.defined_extent()?;
        let wavelength = self.accelerator.wavelength()?;
        let interpolation = self.interpolation as f64;
        let k_cutoff = self.expansion_cutoff / 1e3 / wavelength;

        let n_max = (self.expansion_cutoff / 1e3 / (wavelength / extent[0] * interpolation)).ceil()
            as i64;
        let m_max = (self.expansion_cutoff / 1e3 / (wavelength / extent[1] * interpolation)).ceil()
            as i64;

        let mut k = Vec::new();
        for n in -n_max..=n_max {
            for m in -m_max..=m_max {
                let kx = n as f64 / extent[0] * interpolation;
                let ky = m as f64 / extent[1] * interpolation;
                if kx * kx + ky * ky < k_cutoff * k_cutoff {
                    k.push(Vector2::new(kx, ky));
                }
            }
        }
        Ok(k)
    }

    /// Synthesize the plane-wave basis over the real-space grid.
    ///
    /// The set is normalized jointly, never per wave: the coherent sum of
    /// all plane waves, cropped to the interpolated probe window, carries
    /// unit integrated intensity.
    #[instrument(skip_all, name = "smatrix_build")]
    pub fn build(&self) -> Result<SMatrixArray, EngineError> {
        self.grid.check_is_defined()?;
        self.accelerator.check_is_defined()?;
        let gpts = self.grid.defined_gpts()?;
        let sampling = self.grid.defined_sampling()?;
        let extent = self.grid.defined_extent()?;
        let energy = self.accelerator.defined_energy()?;

        let k = self.k()?;
        info!(planewaves = k.len(), "building plane wave expansion");

        let x: Vec<f64> = (0..gpts[0]).map(|i| i as f64 * sampling[0]).collect();
        let y: Vec<f64> = (0..gpts[1]).map(|j| j as f64 * sampling[1]).collect();

        let mut array = Array3::<Complex64>::zeros((k.len(), gpts[0], gpts[1]));
        for (index, kvec) in k.iter().enumerate() {
            let row_phase: Vec<Complex64> = x
                .iter()
                .map(|&xv| complex_exponential(-2.0 * PI * kvec.x * xv))
                .collect();
            let col_phase: Vec<Complex64> = y
                .iter()
                .map(|&yv| complex_exponential(-2.0 * PI * kvec.y * yv))
                .collect();
            let mut wave = array.index_axis_mut(Axis(0), index);
            for i in 0..gpts[0] {
                for j in 0..gpts[1] {
                    wave[[i, j]] = row_phase[i] * col_phase[j];
                }
            }
        }

        let cropped_shape = [
            gpts[0] / self.interpolation,
            gpts[1] / self.interpolation,
        ];
        let coherent_sum = array.sum_axis(Axis(0));
        let window_power: f64 = coherent_sum
            .slice(s![..cropped_shape[0], ..cropped_shape[1]])
            .iter()
            .map(|v| v.norm_sqr())
            .sum();
        let norm = window_power.sqrt() * ((cropped_shape[0] * cropped_shape[1]) as f64).sqrt();
        array.mapv_inplace(|v| v / norm);

        Ok(SMatrixArray {
            array,
            k,
            expansion_cutoff: self.expansion_cutoff,
            ctf: self.ctf.clone(),
            grid: Grid::new(Some(extent), Some(gpts), None)?.lock_gpts(),
            accelerator: Accelerator::new(Some(energy)),
            tilt: self.tilt,
            antialiasing_aperture: AntialiasFilter::CUTOFF,
            cropped_shape,
            offset: [0, 0],
            periodic: true,
            memory: self.memory.clone(),
            backend: self.backend.clone(),
        })
    }

    /// Build the scattering matrix and propagate it through the potential.
    pub fn multislice(
        &mut self,
        potential: &dyn Potential,
        max_batch: Option<usize>,
        reporter: &ProgressReporter,
    ) -> Result<SMatrixArray, EngineError> {
        self.grid.match_with(&potential.grid())?;
        let mut s_matrix = self.build()?;
        s_matrix.multislice(potential, max_batch, reporter)?;
        Ok(s_matrix)
    }

    /// Build, propagate and raster-scan: the PRISM STEM simulation.
    ///
    /// Batching and accumulation follow the same contract as the probe scan;
    /// probe batches come from `collapse` instead of per-batch multislice.
    /// With frozen phonons the basis is rebuilt and re-propagated per
    /// configuration and each detection is divided by the configuration
    /// count before accumulation.
    #[instrument(skip_all, name = "smatrix_scan")]
    #[allow(clippy::too_many_arguments)]
    pub fn scan(
        &mut self,
        scan: &dyn Scan,
        detectors: &[&dyn Detector],
        potential: &dyn Potential,
        measurements: Option<Vec<Measurement>>,
        max_batch_probes: Option<usize>,
        max_batch_expansion: Option<usize>,
        reporter: &ProgressReporter,
    ) -> Result<Vec<Measurement>, EngineError> {
        self.grid.match_with(&potential.grid())?;
        self.grid.check_is_defined()?;

        let mut measurements = validate_measurements(measurements, detectors.len())?;
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
                let mut s_matrix = self.build()?;
                s_matrix.multislice(config.as_ref(), max_batch_expansion, reporter)?;
                let s_matrix = s_matrix.downsample(DownsampleLimit::Limit)?;
                s_matrix.scan_into(
                    scan,
                    detectors,
                    &mut measurements,
                    max_batch_probes,
                    max_batch_expansion,
                    1.0 / n_configs as f64,
                    reporter,
                )?;
            }
        } else {
            let mut s_matrix = self.build()?;
            s_matrix.multislice(potential, max_batch_expansion, reporter)?;
            s_matrix.scan_into(
                scan,
                detectors,
                &mut measurements,
                max_batch_probes,
                max_batch_expansion,
                1.0,
                reporter,
            )?;
        }
        reporter.report(Progress::PhaseFinish);

        finalize_measurements(measurements)
    }
}

/// A built plane-wave expansion: the PRISM scattering matrix.
///
/// Owns an array of shape `(n_planewaves, ny, nx)` together with the spatial
/// frequency of each plane wave. `multislice` mutates the array in place;
/// `collapse` synthesizes probe wave functions per position without
/// repeating the multislice pass.
#[derive(Clone)]
pub struct SMatrixArray {
    array: Array3<Complex64>,
    k: Vec<Vector2<f64>>,
    expansion_cutoff: f64,
    ctf: Box<dyn Ctf>,
    grid: Grid,
    accelerator: Accelerator,
    tilt: Option<[f64; 2]>,
    antialiasing_aperture: f64,
    cropped_shape: [usize; 2],
    offset: [isize; 2],
    periodic: bool,
    memory: Arc<dyn DeviceMemory>,
    backend: Arc<dyn SpectralBackend>,
}

impl WavesLike for SMatrixArray {
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
        self.antialiasing_aperture
    }
}

impl SMatrixArray {
    /// Number of plane waves in the expansion.
    pub fn len(&self) -> usize {
        self.array.shape()[0]
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn array(&self) -> &Array3<Complex64> {
        &self.array
    }

    pub fn k(&self) -> &[Vector2<f64>] {
        &self.k
    }

    pub fn expansion_cutoff(&self) -> f64 {
        self.expansion_cutoff
    }

    pub fn periodic(&self) -> bool {
        self.periodic
    }

    pub fn cropped_shape(&self) -> [usize; 2] {
        self.cropped_shape
    }

    pub fn offset(&self) -> [isize; 2] {
        self.offset
    }

    /// The grid of the interpolated probe window.
    pub fn cropped_grid(&self) -> Result<Grid, EngineError> {
        let sampling = self.grid.defined_sampling()?;
        Ok(Grid::new(None, Some(self.cropped_shape), Some(sampling))?.lock_gpts())
    }

    /// Largest plane-wave sub-batch fitting the expansion memory budget.
    pub fn max_batch_expansion(&self) -> usize {
        let gpts = match self.grid.gpts() {
            Some(gpts) => gpts,
            None => return 1,
        };
        memory_limited_batch(
            self.memory.available_bytes(),
            EXPANSION_MEMORY_FRACTION,
            bytes_per_wave(gpts),
            self.len().max(1),
        )
    }

    /// Largest probe batch fitting what the expansion batch leaves over.
    pub fn max_batch_probes(&self) -> usize {
        let gpts = match self.grid.gpts() {
            Some(gpts) => gpts,
            None => return 1,
        };
        let expansion_bytes = bytes_per_wave(gpts) * self.max_batch_expansion();
        let budget = self.memory.available_bytes() as f64 * EXPANSION_MEMORY_FRACTION
            - expansion_bytes as f64;
        let per_probe = bytes_per_wave(self.cropped_shape) as f64;
        ((budget / per_probe) as isize).clamp(1, MAX_COLLAPSE_BATCH as isize) as usize
    }

    fn require_periodic(&self, operation: &'static str) -> Result<(), EngineError> {
        if self.periodic {
            Ok(())
        } else {
            Err(EngineError::NotPeriodic { operation })
        }
    }

    // A sub-batch of plane waves materialized as ordinary Waves.
    fn partial_waves(&self, start: usize, end: usize) -> Result<Waves, EngineError> {
        let extent = self.grid.defined_extent()?;
        let array = self
            .array
            .slice(s![start..end, .., ..])
            .to_owned()
            .into_dyn();
        Ok(
            Waves::new(array, Some(extent), None, self.accelerator.energy())?
                .with_tilt(self.tilt)
                .with_backend(self.backend.clone()),
        )
    }

    /// Propagate the whole expansion through the potential, in place, in
    /// sub-batches sized to the available memory: the full basis can exceed
    /// memory even though the aggregate computation is one multislice pass.
    pub fn multislice(
        &mut self,
        potential: &dyn Potential,
        max_batch: Option<usize>,
        reporter: &ProgressReporter,
    ) -> Result<(), EngineError> {
        self.require_periodic("multislice")?;
        self.grid.match_with(&potential.grid())?;
        self.accelerator.check_is_defined()?;

        let max_batch = max_batch.unwrap_or_else(|| self.max_batch_expansion());
        let mut propagator = super::propagator::FresnelPropagator::new();

        reporter.report(Progress::PhaseStart {
            name: "Plane waves",
        });
        for (start, end) in BatchRanges::new(self.len(), max_batch) {
            let mut waves = self.partial_waves(start, end)?;
            super::multislice::run(&mut waves, potential, &mut propagator, 1, reporter)?;
            let propagated = waves
                .array()
                .view()
                .into_dimensionality::<Ix3>()
                .map_err(|_| EngineError::Internal("plane wave batch must be 3D".to_string()))?;
            self.array.slice_mut(s![start..end, .., ..]).assign(&propagated);
        }
        reporter.report(Progress::PhaseFinish);

        self.antialiasing_aperture = AntialiasFilter::CUTOFF;
        Ok(())
    }

    fn ctf_coefficients(&self) -> Result<Array1<Complex64>, EngineError> {
        let wavelength = self.accelerator.wavelength()?;
        let alpha =
            Array1::from_iter(self.k.iter().map(|k| k.x.hypot(k.y) * wavelength)).into_dyn();
        let phi = Array1::from_iter(self.k.iter().map(|k| k.x.atan2(k.y))).into_dyn();
        self.ctf
            .evaluate(&alpha, &phi)
            .into_dimensionality::<Ix1>()
            .map_err(|_| EngineError::Internal("CTF evaluation must be 1D".to_string()))
    }

    // Per-position linear-combination coefficients: the transfer function of
    // each plane wave times its translation phase.
    fn coefficients(&self, positions: &[Vector2<f64>]) -> Result<Array2<Complex64>, EngineError> {
        let ctf = self.ctf_coefficients()?;
        Ok(Array2::from_shape_fn(
            (positions.len(), self.k.len()),
            |(p, i)| {
                let k = self.k[i];
                ctf[i]
                    * complex_exponential(
                        2.0 * PI * (k.x * positions[p].x + k.y * positions[p].y),
                    )
            },
        ))
    }

    // Minimal bounding box covering all requested positions' probe windows,
    // with the per-position window corners.
    fn requisite_crop(
        &self,
        positions: &[Vector2<f64>],
    ) -> Result<([isize; 2], [usize; 2], Vec<[isize; 2]>), EngineError> {
        let sampling = self.grid.defined_sampling()?;
        let half = [
            (self.cropped_shape[0] / 2) as f64,
            (self.cropped_shape[1] / 2) as f64,
        ];
        let corners: Vec<[isize; 2]> = positions
            .iter()
            .map(|p| {
                [
                    (p.x / sampling[0] - half[0]).round() as isize,
                    (p.y / sampling[1] - half[1]).round() as isize,
                ]
            })
            .collect();
        let corner = [
            corners.iter().map(|c| c[0]).min().unwrap_or(0),
            corners.iter().map(|c| c[1]).min().unwrap_or(0),
        ];
        let size = [
            (corners.iter().map(|c| c[0]).max().unwrap_or(0) + self.cropped_shape[0] as isize
                - corner[0]) as usize,
            (corners.iter().map(|c| c[1]).max().unwrap_or(0) + self.cropped_shape[1] as isize
                - corner[1]) as usize,
        ];
        Ok((corner, size, corners))
    }

    /// Collapse the expansion into probe wave functions at the given
    /// positions (grid center when none are given).
    ///
    /// With interpolation in effect the stored array is first cropped to the
    /// minimal box covering all probe windows, the contraction runs on the
    /// crop, and each position's window is extracted by its offset; without
    /// interpolation the contraction is chunked over the expansion when the
    /// coefficient tensor would not fit memory.
    pub fn collapse(
        &self,
        positions: Option<&[Vector2<f64>]>,
        max_batch_expansion: Option<usize>,
    ) -> Result<Waves, EngineError> {
        self.grid.check_is_defined()?;
        self.accelerator.check_is_defined()?;
        let gpts = self.grid.defined_gpts()?;
        let sampling = self.grid.defined_sampling()?;
        let extent = self.grid.defined_extent()?;

        let center = [Vector2::new(extent[0] / 2.0, extent[1] / 2.0)];
        let positions: &[Vector2<f64>] = positions.unwrap_or(&center);
        let max_batch = max_batch_expansion.unwrap_or_else(|| self.max_batch_expansion());

        let coefficients = self.coefficients(positions)?;
        let n_positions = positions.len();

        let window = if self.cropped_shape != gpts {
            let (mut corner, size, mut corners) = self.requisite_crop(positions)?;
            for c in &mut corners {
                c[0] -= self.offset[0];
                c[1] -= self.offset[1];
            }
            corner[0] -= self.offset[0];
            corner[1] -= self.offset[1];

            let cropped = periodic_crop(&self.array, corner, size);
            let flat = cropped
                .into_shape_with_order((self.len(), size[0] * size[1]))
                .map_err(|_| EngineError::Internal("crop reshape failed".to_string()))?;
            let contracted = coefficients
                .dot(&flat)
                .into_shape_with_order((n_positions, size[0], size[1]))
                .map_err(|_| EngineError::Internal("contraction reshape failed".to_string()))?;

            let relative: Vec<[usize; 2]> = corners
                .iter()
                .map(|c| [(c[0] - corner[0]) as usize, (c[1] - corner[1]) as usize])
                .collect();
            self.backend
                .batch_crop(&contracted, &relative, self.cropped_shape)
        } else if max_batch < self.len() {
            let mut window = Array3::<Complex64>::zeros((n_positions, gpts[0], gpts[1]));
            for (start, end) in BatchRanges::new(self.len(), max_batch) {
                let flat = self
                    .array
                    .slice(s![start..end, .., ..])
                    .into_shape_with_order((end - start, gpts[0] * gpts[1]))
                    .map_err(|_| EngineError::Internal("batch reshape failed".to_string()))?;
                let contribution = coefficients
                    .slice(s![.., start..end])
                    .dot(&flat)
                    .into_shape_with_order((n_positions, gpts[0], gpts[1]))
                    .map_err(|_| {
                        EngineError::Internal("contribution reshape failed".to_string())
                    })?;
                window += &contribution;
            }
            window
        } else {
            let flat = self
                .array
                .view()
                .into_shape_with_order((self.len(), gpts[0] * gpts[1]))
                .map_err(|_| EngineError::Internal("expansion reshape failed".to_string()))?;
            coefficients
                .dot(&flat)
                .into_shape_with_order((n_positions, gpts[0], gpts[1]))
                .map_err(|_| EngineError::Internal("collapse reshape failed".to_string()))?
        };

        Ok(
            Waves::new(window.into_dyn(), None, Some(sampling), self.accelerator.energy())?
                .with_tilt(self.tilt)
                .with_antialiasing_aperture(self.antialiasing_aperture)
                .with_backend(self.backend.clone()),
        )
    }

    /// Band-limit the expansion, batch by batch, and reassemble.
    pub fn downsample(&self, limit: DownsampleLimit) -> Result<SMatrixArray, EngineError> {
        self.require_periodic("downsample")?;
        let gpts = self.grid.defined_gpts()?;
        let extent = self.grid.defined_extent()?;

        let probe = self.partial_waves(0, 1)?.downsample(limit, false)?;
        let new_gpts = probe.grid().defined_gpts()?;
        let aperture = probe.antialiasing_aperture();

        let mut new_array = Array3::<Complex64>::zeros((self.len(), new_gpts[0], new_gpts[1]));
        for (start, end) in BatchRanges::new(self.len(), self.max_batch_expansion()) {
            let downsampled = self.partial_waves(start, end)?.downsample(limit, false)?;
            let view = downsampled
                .array()
                .view()
                .into_dimensionality::<Ix3>()
                .map_err(|_| EngineError::Internal("downsampled batch must be 3D".to_string()))?;
            new_array.slice_mut(s![start..end, .., ..]).assign(&view);
        }

        let cropped_shape = if self.cropped_shape == gpts {
            new_gpts
        } else {
            [
                new_gpts[0] / (gpts[0] / self.cropped_shape[0]),
                new_gpts[1] / (gpts[1] / self.cropped_shape[1]),
            ]
        };

        Ok(SMatrixArray {
            array: new_array,
            k: self.k.clone(),
            expansion_cutoff: self.expansion_cutoff,
            ctf: self.ctf.clone(),
            grid: Grid::new(Some(extent), Some(new_gpts), None)?.lock_gpts(),
            accelerator: self.accelerator.clone(),
            tilt: self.tilt,
            antialiasing_aperture: aperture,
            cropped_shape,
            offset: self.offset,
            periodic: self.periodic,
            memory: self.memory.clone(),
            backend: self.backend.clone(),
        })
    }

    /// Restrict the stored array to the bounding box of a rectangular scan.
    ///
    /// The result is non-periodic and records the crop origin as `offset`;
    /// collapse subtracts that offset before indexing.
    pub fn crop_to_scan(&self, scan: &dyn Scan) -> Result<SMatrixArray, EngineError> {
        let (start, end) = scan
            .rect_bounds()
            .ok_or(EngineError::UnsupportedScan {
                operation: "crop_to_scan",
            })?;
        let sampling = self.grid.defined_sampling()?;

        let bounds = [
            Vector2::new(start[0], start[1]),
            Vector2::new(end[0], end[1]),
        ];
        let (corner, size, _) = self.requisite_crop(&bounds)?;
        let array = periodic_crop(&self.array, corner, size);

        Ok(SMatrixArray {
            array,
            k: self.k.clone(),
            expansion_cutoff: self.expansion_cutoff,
            ctf: self.ctf.clone(),
            grid: Grid::new(None, Some(size), Some(sampling))?.lock_gpts(),
            accelerator: self.accelerator.clone(),
            tilt: self.tilt,
            antialiasing_aperture: self.antialiasing_aperture,
            cropped_shape: self.cropped_shape,
            offset: corner,
            periodic: false,
            memory: self.memory.clone(),
            backend: self.backend.clone(),
        })
    }

    /// Raster-scan using probes collapsed from this (already propagated)
    /// expansion.
    #[instrument(skip_all, name = "smatrix_array_scan")]
    pub fn scan(
        &self,
        scan: &dyn Scan,
        detectors: &[&dyn Detector],
        measurements: Option<Vec<Measurement>>,
        max_batch_probes: Option<usize>,
        max_batch_expansion: Option<usize>,
        reporter: &ProgressReporter,
    ) -> Result<Vec<Measurement>, EngineError> {
        self.grid.check_is_defined()?;
        let mut measurements = validate_measurements(measurements, detectors.len())?;
        self.scan_into(
            scan,
            detectors,
            &mut measurements,
            max_batch_probes,
            max_batch_expansion,
            1.0,
            reporter,
        )?;
        finalize_measurements(measurements)
    }

    #[allow(clippy::too_many_arguments)]
    fn scan_into(
        &self,
        scan: &dyn Scan,
        detectors: &[&dyn Detector],
        measurements: &mut [Option<Measurement>],
        max_batch_probes: Option<usize>,
        max_batch_expansion: Option<usize>,
        factor: f64,
        reporter: &ProgressReporter,
    ) -> Result<(), EngineError> {
        let max_batch_probes = max_batch_probes.unwrap_or_else(|| self.max_batch_probes());
        reporter.report(Progress::TaskStart {
            total_steps: scan.len() as u64,
        });
        for batch in scan.generate_positions(max_batch_probes) {
            let exit_probes = self.collapse(Some(&batch.positions), max_batch_expansion)?;
            record_detections(
                scan,
                detectors,
                &exit_probes,
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
