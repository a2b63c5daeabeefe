//! Batched 2D complex wave functions and the operations defined on them:
//! intensity, band-limited downsampling, far-field transforms, diffraction
//! patterns, aberration transfer and multislice propagation.

use super::error::EngineError;
use super::interfaces::{Ctf, Detector, Potential};
use super::multislice;
use super::progress::{Progress, ProgressReporter};
use super::propagator::FresnelPropagator;
use crate::core::accelerator::Accelerator;
use crate::core::backend::{CpuBackend, SpectralBackend};
use crate::core::filters::AntialiasFilter;
use crate::core::fourier::{fftshift2, fourier_crop, polar_coordinates, spatial_frequencies};
use crate::core::grid::Grid;
use crate::core::io::WavefunctionFile;
use crate::core::measurement::{
    Calibration, Measurement, block_zeroth_order_spot, calibrations_from_grid,
};
use ndarray::{Array2, ArrayD, Axis, IxDyn};
use num_complex::Complex64;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

/// Band-limit policy for [`WavesLike::downsampled_gpts`] and the downsample
/// family of operations.
///
/// `Limit` keeps the full antialiased band, rounding the cutoff up per axis
/// so the retained band is at least as large as requested. `Valid` keeps the
/// tighter rectangle inscribed in the aperture rolloff, so no aliased energy
/// enters. An explicit angle is a literal cutoff in mrad.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DownsampleLimit {
    Angle(f64),
    Limit,
    Valid,
}

impl FromStr for DownsampleLimit {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, EngineError> {
        match s {
            "limit" => Ok(Self::Limit),
            "valid" => Ok(Self::Valid),
            other => other
                .parse::<f64>()
                .map(Self::Angle)
                .map_err(|_| EngineError::InvalidDownsampleLimit(other.to_string())),
        }
    }
}

/// Capabilities shared by every wave-like object: plain wave batches, probe
/// and plane-wave builders, and scattering matrices.
pub trait WavesLike {
    fn grid(&self) -> &Grid;

    fn accelerator(&self) -> &Accelerator;

    /// Beam tilt [mrad].
    fn tilt(&self) -> Option<[f64; 2]>;

    /// Assumed band limit as a fraction of the real-space Nyquist frequency.
    fn antialiasing_aperture(&self) -> f64;

    /// Reciprocal-space sampling expressed as scattering angles [mrad].
    fn angular_sampling(&self) -> Result<[f64; 2], EngineError> {
        let extent = self.grid().defined_extent()?;
        let wavelength = self.accelerator().wavelength()?;
        Ok([
            1.0 / extent[0] * wavelength * 1e3,
            1.0 / extent[1] * wavelength * 1e3,
        ])
    }

    /// Largest scattering angles [mrad] inside the antialiased band, rounded
    /// up to the reciprocal lattice per axis.
    fn cutoff_scattering_angles(&self) -> Result<[f64; 2], EngineError> {
        let extent = self.grid().defined_extent()?;
        let sampling = self.grid().defined_sampling()?;
        let wavelength = self.accelerator().wavelength()?;
        let kcut =
            1.0 / sampling[0].max(sampling[1]) / 2.0 * self.antialiasing_aperture().min(1.0);
        Ok(std::array::from_fn(|i| {
            (2.0 * extent[i] * kcut).ceil() / (2.0 * extent[i]) * wavelength * 1e3
        }))
    }

    /// Scattering angles [mrad] of the largest rectangle inscribed in the
    /// aperture rolloff, rounded down per axis.
    fn rectangle_cutoff_scattering_angles(&self) -> Result<[f64; 2], EngineError> {
        let extent = self.grid().defined_extent()?;
        let sampling = self.grid().defined_sampling()?;
        let wavelength = self.accelerator().wavelength()?;
        let kcut = ((1.0 / sampling[0].max(sampling[1]) / 2.0 * self.antialiasing_aperture()
            - AntialiasFilter::ROLLOFF)
            / std::f64::consts::SQRT_2)
            .max(0.0);
        Ok(std::array::from_fn(|i| {
            (2.0 * extent[i] * kcut).floor() / (2.0 * extent[i]) * wavelength * 1e3
        }))
    }

    /// Grid shape retaining scattering angles up to the given limit.
    fn downsampled_gpts(&self, limit: DownsampleLimit) -> Result<[usize; 2], EngineError> {
        let gpts = self.grid().defined_gpts()?;
        let angular_sampling = self.angular_sampling()?;
        let target: [usize; 2] = match limit {
            DownsampleLimit::Angle(angle) => std::array::from_fn(|i| {
                (2.0 * (angle / angular_sampling[i]).floor()) as usize + 1
            }),
            DownsampleLimit::Limit => {
                let cutoff = self.cutoff_scattering_angles()?;
                std::array::from_fn(|i| (cutoff[i] / angular_sampling[i] * 2.0).round() as usize)
            }
            DownsampleLimit::Valid => {
                let cutoff = self.rectangle_cutoff_scattering_angles()?;
                std::array::from_fn(|i| (cutoff[i] / angular_sampling[i] * 2.0).round() as usize)
            }
        };
        Ok([
            target[0].clamp(1, gpts[0]),
            target[1].clamp(1, gpts[1]),
        ])
    }
}

/// A batch of 2D complex wave functions.
///
/// The trailing two axes are always the spatial `(ny, nx)` axes; any leading
/// axes form the batch. The grid locks its gpts to the array shape.
#[derive(Debug, Clone)]
pub struct Waves {
    array: ArrayD<Complex64>,
    grid: Grid,
    accelerator: Accelerator,
    tilt: Option<[f64; 2]>,
    antialiasing_aperture: f64,
    backend: Arc<dyn SpectralBackend>,
}

impl WavesLike for Waves {
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

impl Waves {
    pub fn new(
        array: ArrayD<Complex64>,
        extent: Option<[f64; 2]>,
        sampling: Option<[f64; 2]>,
        energy: Option<f64>,
    ) -> Result<Self, EngineError> {
        if array.ndim() < 2 {
            return Err(EngineError::InvalidWaveRank { rank: array.ndim() });
        }
        let ndim = array.ndim();
        let gpts = [array.shape()[ndim - 2], array.shape()[ndim - 1]];
        // gpts is fixed by the array shape; sampling must not re-derive it.
        let mut grid = Grid::new(extent, Some(gpts), None)?.lock_gpts();
        if let Some(sampling) = sampling {
            grid.set_sampling(sampling)?;
        }
        Ok(Self {
            array,
            grid,
            accelerator: Accelerator::new(energy),
            tilt: None,
            antialiasing_aperture: AntialiasFilter::CUTOFF,
            backend: CpuBackend::shared(),
        })
    }

    pub fn with_tilt(mut self, tilt: Option<[f64; 2]>) -> Self {
        self.tilt = tilt;
        self
    }

    pub fn with_antialiasing_aperture(mut self, aperture: f64) -> Self {
        self.antialiasing_aperture = aperture;
        self
    }

    pub fn with_backend(mut self, backend: Arc<dyn SpectralBackend>) -> Self {
        self.backend = backend;
        self
    }

    pub fn array(&self) -> &ArrayD<Complex64> {
        &self.array
    }

    pub fn array_mut(&mut self) -> &mut ArrayD<Complex64> {
        &mut self.array
    }

    pub fn backend(&self) -> &Arc<dyn SpectralBackend> {
        &self.backend
    }

    /// Length of the leading batch axis.
    pub fn len(&self) -> usize {
        self.array.shape()[0]
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn energy(&self) -> Option<f64> {
        self.accelerator.energy()
    }

    pub(crate) fn set_antialiasing_aperture(&mut self, aperture: f64) {
        self.antialiasing_aperture = aperture;
    }

    pub(crate) fn match_grid(&mut self, other: &Grid) -> Result<(), EngineError> {
        self.grid.match_with(other)?;
        Ok(())
    }

    pub(crate) fn convolve(&mut self, kernel: &Array2<Complex64>) {
        self.backend
            .fft2_convolve(&mut self.array.view_mut(), kernel);
    }

    /// Intensity at the image plane, calibrated on the real-space grid.
    pub fn intensity(&self) -> Result<Measurement, EngineError> {
        let gpts = self.grid.defined_gpts()?;
        let sampling = self.grid.defined_sampling()?;
        let values = self.backend.abs2(&self.array.view());
        let calibrations = batch_calibrations(
            values.ndim(),
            calibrations_from_grid(gpts, sampling, ["x", "y"], "Å", 1.0, false),
        );
        Ok(Measurement::new(values, calibrations)?)
    }

    /// Band-limit the wave functions to the given angular limit.
    ///
    /// Transforms to Fourier space, crops to the retained band and, unless
    /// `fourier_space` is set, transforms back. The antialiasing aperture is
    /// rescaled by the grid-size ratio of the limiting axis.
    pub fn downsample(
        &self,
        limit: DownsampleLimit,
        fourier_space: bool,
    ) -> Result<Waves, EngineError> {
        let gpts = self.grid.defined_gpts()?;
        let extent = self.grid.defined_extent()?;
        let new_gpts = self.downsampled_gpts(limit)?;

        let mut array = self.array.clone();
        self.backend.fft2(&mut array.view_mut());
        let mut array = if new_gpts != gpts {
            fourier_crop(&array, new_gpts)
        } else {
            array
        };

        let aperture = self.antialiasing_aperture
            * (gpts[0] as f64 / new_gpts[0] as f64).min(gpts[1] as f64 / new_gpts[1] as f64);

        if !fourier_space {
            self.backend.ifft2(&mut array.view_mut());
        }

        Ok(Waves::new(array, Some(extent), None, self.energy())?
            .with_antialiasing_aperture(aperture)
            .with_backend(self.backend.clone()))
    }

    /// The Fourier-space wave functions within the angular limit.
    pub fn far_field(&self, limit: DownsampleLimit) -> Result<Waves, EngineError> {
        self.downsample(limit, true)
    }

    /// Intensity at the diffraction plane, fftshifted and calibrated in
    /// mrad; optionally blocks a central disk of the given radius [mrad] to
    /// suppress the unscattered beam.
    pub fn diffraction_pattern(
        &self,
        limit: DownsampleLimit,
        block_zeroth_order: Option<f64>,
    ) -> Result<Measurement, EngineError> {
        let wavelength = self.accelerator.wavelength()?;
        let far_field = self.far_field(limit)?;
        let gpts = far_field.grid.defined_gpts()?;
        let sampling = far_field.grid.defined_sampling()?;

        let pattern = fftshift2(&self.backend.abs2(&far_field.array.view()));
        let calibrations = batch_calibrations(
            pattern.ndim(),
            calibrations_from_grid(
                gpts,
                sampling,
                ["alpha_x", "alpha_y"],
                "mrad",
                wavelength * 1e3,
                true,
            ),
        );
        let mut measurement = Measurement::new(pattern, calibrations)?;
        if let Some(radius) = block_zeroth_order {
            block_zeroth_order_spot(&mut measurement, radius);
        }
        Ok(measurement)
    }

    /// Convolve the wave functions with the phasor of a contrast transfer
    /// function evaluated on this grid.
    ///
    /// An energy-less CTF adopts the wave functions' energy; a conflicting
    /// one is a configuration error.
    pub fn apply_ctf(&self, ctf: &mut dyn Ctf) -> Result<Waves, EngineError> {
        if ctf.energy().is_none() {
            if let Some(energy) = self.energy() {
                ctf.set_energy(energy);
            }
        }
        let energy = self.accelerator.defined_energy()?;
        if let Some(ctf_energy) = ctf.energy() {
            if ctf_energy != energy {
                return Err(EngineError::CtfEnergyMismatch {
                    waves_ev: energy,
                    ctf_ev: ctf_energy,
                });
            }
        }
        self.grid.check_is_defined()?;

        let gpts = self.grid.defined_gpts()?;
        let sampling = self.grid.defined_sampling()?;
        let wavelength = self.accelerator.wavelength()?;
        let (kx, ky) = spatial_frequencies(gpts, sampling);
        let kx: Vec<f64> = kx.iter().map(|k| k * wavelength).collect();
        let ky: Vec<f64> = ky.iter().map(|k| k * wavelength).collect();
        let (alpha, phi) = polar_coordinates(&kx, &ky);

        let kernel = ctf
            .evaluate(&alpha.into_dyn(), &phi.into_dyn())
            .into_dimensionality::<ndarray::Ix2>()
            .map_err(|_| EngineError::Internal("CTF evaluation must be 2D".to_string()))?;

        let mut array = self.array.clone();
        self.backend.fft2_convolve(&mut array.view_mut(), &kernel);

        Ok(Waves::new(
            array,
            Some(self.grid.defined_extent()?),
            None,
            Some(energy),
        )?
        .with_tilt(self.tilt)
        .with_backend(self.backend.clone()))
    }

    /// Propagate through the potential and return the exit-plane waves.
    ///
    /// With several frozen-phonon configurations the propagation runs once
    /// per configuration on an independent copy of the input, and the
    /// squeezed exit waves are stacked along a new leading axis for later
    /// per-configuration inspection.
    pub fn multislice(
        &self,
        potential: &dyn Potential,
        max_batch_slices: usize,
        reporter: &ProgressReporter,
    ) -> Result<Waves, EngineError> {
        let n_configs = potential.frozen_phonon_configs();
        if n_configs <= 1 {
            let mut exit_waves = self.clone();
            let mut propagator = FresnelPropagator::new();
            multislice::run(
                &mut exit_waves,
                potential,
                &mut propagator,
                max_batch_slices,
                reporter,
            )?;
            return Ok(exit_waves);
        }

        let configs = potential.frozen_phonon_potentials();
        if configs.len() != n_configs {
            return Err(EngineError::Potential(format!(
                "potential reports {n_configs} frozen phonon configurations but yielded {}",
                configs.len()
            )));
        }

        let mut out_shape: Vec<usize> = vec![n_configs];
        if self.array.shape()[0] == 1 {
            out_shape.extend(&self.array.shape()[1..]);
        } else {
            out_shape.extend(self.array.shape());
        }
        let mut out = ArrayD::<Complex64>::zeros(IxDyn(&out_shape));

        reporter.report(Progress::PhaseStart {
            name: "Frozen phonons",
        });
        let mut propagator = FresnelPropagator::new();
        for (index, config) in configs.iter().enumerate() {
            let mut exit_waves = self.clone();
            multislice::run(
                &mut exit_waves,
                config.as_ref(),
                &mut propagator,
                max_batch_slices,
                reporter,
            )?;
            out.index_axis_mut(Axis(0), index)
                .assign(&squeeze(exit_waves.array));
        }
        reporter.report(Progress::PhaseFinish);

        Ok(Waves::new(
            out,
            Some(self.grid.defined_extent()?),
            None,
            self.energy(),
        )?
        .with_antialiasing_aperture(AntialiasFilter::CUTOFF)
        .with_backend(self.backend.clone()))
    }

    /// Propagate through the potential and reduce each configuration's exit
    /// wave with the detector.
    ///
    /// The frozen-phonon average runs over the detected signals, never over
    /// the wave functions: each detection is divided by the configuration
    /// count and accumulated.
    pub fn multislice_and_detect(
        &self,
        potential: &dyn Potential,
        detector: &dyn Detector,
        max_batch_slices: usize,
        reporter: &ProgressReporter,
    ) -> Result<Measurement, EngineError> {
        let batch_shape: Vec<usize> = self.array.shape()[..self.array.ndim() - 2].to_vec();
        let n_configs = potential.frozen_phonon_configs();

        if n_configs <= 1 {
            let mut exit_waves = self.clone();
            let mut propagator = FresnelPropagator::new();
            multislice::run(
                &mut exit_waves,
                potential,
                &mut propagator,
                max_batch_slices,
                reporter,
            )?;
            let mut measurement = detector.allocate_measurement(&exit_waves, &batch_shape)?;
            measurement.values = detector.detect(&exit_waves)?;
            return Ok(measurement);
        }

        let configs = potential.frozen_phonon_potentials();
        if configs.is_empty() {
            return Err(EngineError::Potential(
                "potential yielded no frozen phonon configurations".to_string(),
            ));
        }

        reporter.report(Progress::PhaseStart {
            name: "Frozen phonons",
        });
        let mut propagator = FresnelPropagator::new();
        let mut measurement: Option<Measurement> = None;
        for config in &configs {
            let mut exit_waves = self.clone();
            multislice::run(
                &mut exit_waves,
                config.as_ref(),
                &mut propagator,
                max_batch_slices,
                reporter,
            )?;
            let mut detection = detector.detect(&exit_waves)?;
            detection.mapv_inplace(|value| value / n_configs as f64);
            match &mut measurement {
                Some(measurement) => measurement.values += &detection,
                None => {
                    let mut allocated =
                        detector.allocate_measurement(&exit_waves, &batch_shape)?;
                    allocated.values += &detection;
                    measurement = Some(allocated);
                }
            }
        }
        reporter.report(Progress::PhaseFinish);

        measurement.ok_or_else(|| {
            EngineError::Potential("no frozen phonon configurations were processed".to_string())
        })
    }

    /// Select one wave function along the leading batch axis.
    pub fn select(&self, index: usize) -> Result<Waves, EngineError> {
        if self.array.ndim() <= 2 {
            return Err(EngineError::InvalidWaveRank {
                rank: self.array.ndim(),
            });
        }
        let array = self.array.index_axis(Axis(0), index).to_owned();
        Ok(Waves::new(
            array,
            self.grid.extent(),
            None,
            self.energy(),
        )?
        .with_tilt(self.tilt)
        .with_antialiasing_aperture(self.antialiasing_aperture)
        .with_backend(self.backend.clone()))
    }

    /// Persist array, energy and extent as a unit.
    pub fn write<P: AsRef<Path>>(&self, path: P) -> Result<(), EngineError> {
        let file = WavefunctionFile {
            array: self.array.clone(),
            energy: self.accelerator.defined_energy()?,
            extent: self.grid.defined_extent()?,
        };
        file.write_path(path)?;
        Ok(())
    }

    /// Read wave functions persisted with [`Waves::write`]; the sampling is
    /// re-derived from `extent / gpts`.
    pub fn read<P: AsRef<Path>>(path: P) -> Result<Waves, EngineError> {
        let file = WavefunctionFile::read_path(path)?;
        Waves::new(file.array, Some(file.extent), None, Some(file.energy))
    }
}

/// Builder for plane wave functions (HRTEM illumination).
#[derive(Debug, Clone)]
pub struct PlaneWave {
    grid: Grid,
    accelerator: Accelerator,
    tilt: Option<[f64; 2]>,
    backend: Arc<dyn SpectralBackend>,
}

impl WavesLike for PlaneWave {
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

impl PlaneWave {
    pub fn new(
        extent: Option<[f64; 2]>,
        gpts: Option<[usize; 2]>,
        sampling: Option<[f64; 2]>,
        energy: Option<f64>,
    ) -> Result<Self, EngineError> {
        Ok(Self {
            grid: Grid::new(extent, gpts, sampling)?,
            accelerator: Accelerator::new(energy),
            tilt: None,
            backend: CpuBackend::shared(),
        })
    }

    pub fn with_tilt(mut self, tilt: Option<[f64; 2]>) -> Self {
        self.tilt = tilt;
        self
    }

    pub fn with_backend(mut self, backend: Arc<dyn SpectralBackend>) -> Self {
        self.backend = backend;
        self
    }

    /// Build the unit-amplitude plane wave as a single-item batch.
    pub fn build(&self) -> Result<Waves, EngineError> {
        self.grid.check_is_defined()?;
        let gpts = self.grid.defined_gpts()?;
        let array = ArrayD::from_elem(IxDyn(&[1, gpts[0], gpts[1]]), Complex64::new(1.0, 0.0));
        Ok(Waves::new(
            array,
            Some(self.grid.defined_extent()?),
            None,
            self.accelerator.energy(),
        )?
        .with_tilt(self.tilt)
        .with_backend(self.backend.clone()))
    }

    /// Build the plane wave and propagate it through the potential.
    pub fn multislice(
        &mut self,
        potential: &dyn Potential,
        max_batch_slices: usize,
        reporter: &ProgressReporter,
    ) -> Result<Waves, EngineError> {
        self.grid.match_with(&potential.grid())?;
        self.build()?
            .multislice(potential, max_batch_slices, reporter)
    }
}

fn batch_calibrations(ndim: usize, spatial: [Calibration; 2]) -> Vec<Option<Calibration>> {
    let mut calibrations: Vec<Option<Calibration>> = vec![None; ndim - 2];
    let [row, col] = spatial;
    calibrations.push(Some(row));
    calibrations.push(Some(col));
    calibrations
}

// Drop all axes of length one (the exit waves of a single-probe batch
// collapse to their spatial axes when stacked per configuration).
fn squeeze(array: ArrayD<Complex64>) -> ArrayD<Complex64> {
    let shape: Vec<usize> = array
        .shape()
        .iter()
        .copied()
        .filter(|&extent| extent > 1)
        .collect();
    if shape.len() == array.ndim() {
        return array;
    }
    array
        .into_shape_with_order(IxDyn(&shape))
        .expect("removing unit axes preserves the element count")
}
