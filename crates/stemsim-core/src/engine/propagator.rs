use super::cache::{KernelCache, key_bits};
use super::error::EngineError;
use super::waves::{Waves, WavesLike};
use crate::core::backend::complex_exponential;
use crate::core::filters::AntialiasFilter;
use crate::core::fourier::spatial_frequencies;
use ndarray::Array2;
use num_complex::Complex64;
use std::f64::consts::PI;

#[derive(Debug, Clone, PartialEq)]
struct PropagatorKey {
    gpts: [usize; 2],
    sampling: [u64; 2],
    wavelength: u64,
    dz: u64,
    tilt: Option<[u64; 2]>,
}

impl PropagatorKey {
    fn new(
        gpts: [usize; 2],
        sampling: [f64; 2],
        wavelength: f64,
        dz: f64,
        tilt: Option<[f64; 2]>,
    ) -> Self {
        Self {
            gpts,
            sampling: [key_bits(sampling[0]), key_bits(sampling[1])],
            wavelength: key_bits(wavelength),
            dz: key_bits(dz),
            tilt: tilt.map(|t| [key_bits(t[0]), key_bits(t[1])]),
        }
    }
}

/// The band-limited near-field (Fresnel) diffraction kernel.
///
/// The kernel array is cached with capacity one, keyed on everything it
/// depends on; consecutive slices of one potential typically share a
/// thickness, so the cache almost always hits. A thickness change between
/// calls forces a recompute.
#[derive(Debug, Default)]
pub struct FresnelPropagator {
    cache: KernelCache<PropagatorKey, Array2<Complex64>>,
    filter: AntialiasFilter,
}

fn build_kernel(
    gpts: [usize; 2],
    sampling: [f64; 2],
    wavelength: f64,
    dz: f64,
    tilt: Option<[f64; 2]>,
    filter: &AntialiasFilter,
) -> Array2<Complex64> {
    let (kx, ky) = spatial_frequencies(gpts, sampling);
    let mask = filter.mask(gpts, sampling);
    let tilt_tangent = tilt.map(|t| [(t[0] / 1e3).tan(), (t[1] / 1e3).tan()]);

    Array2::from_shape_fn((gpts[0], gpts[1]), |(i, j)| {
        let mut phase = -PI * wavelength * dz * (kx[i] * kx[i] + ky[j] * ky[j]);
        if let Some([tx, ty]) = tilt_tangent {
            phase += -2.0 * PI * dz * (kx[i] * tx + ky[j] * ty);
        }
        complex_exponential(phase) * mask[[i, j]]
    })
}

impl FresnelPropagator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of kernel builds so far; a hook for observing cache reuse.
    pub fn kernel_builds(&self) -> usize {
        self.cache.builds()
    }

    /// Apply one Fresnel free-space step of thickness `dz` [Å], in place.
    ///
    /// The kernel band-limits the spectrum, so the antialiasing aperture of
    /// the propagated waves is reset to the filter cutoff.
    pub fn propagate(&mut self, waves: &mut Waves, dz: f64) -> Result<(), EngineError> {
        let gpts = waves.grid().defined_gpts()?;
        let sampling = waves.grid().defined_sampling()?;
        let wavelength = waves.accelerator().wavelength()?;
        let tilt = waves.tilt();

        let key = PropagatorKey::new(gpts, sampling, wavelength, dz, tilt);
        let filter = &self.filter;
        let kernel = self.cache.get_or_insert_with(key, || {
            build_kernel(gpts, sampling, wavelength, dz, tilt, filter)
        });

        waves.convolve(kernel);
        waves.set_antialiasing_aperture(self.filter.cutoff);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{ArrayD, IxDyn};

    fn plane_wave(gpts: [usize; 2]) -> Waves {
        let array = ArrayD::from_elem(IxDyn(&[1, gpts[0], gpts[1]]), Complex64::new(1.0, 0.0));
        Waves::new(array, Some([gpts[0] as f64 * 0.1, gpts[1] as f64 * 0.1]), None, Some(80e3))
            .unwrap()
    }

    #[test]
    fn repeated_propagation_reuses_the_cached_kernel() {
        let mut propagator = FresnelPropagator::new();
        let mut first = plane_wave([16, 16]);
        let mut second = plane_wave([16, 16]);

        propagator.propagate(&mut first, 1.0).unwrap();
        propagator.propagate(&mut second, 1.0).unwrap();

        assert_eq!(propagator.kernel_builds(), 1);
        for (a, b) in first.array().iter().zip(second.array().iter()) {
            assert_eq!(a, b);
        }
    }

    #[test]
    fn thickness_change_rebuilds_the_kernel() {
        let mut propagator = FresnelPropagator::new();
        let mut waves = plane_wave([16, 16]);
        propagator.propagate(&mut waves, 1.0).unwrap();
        propagator.propagate(&mut waves, 2.0).unwrap();
        propagator.propagate(&mut waves, 1.0).unwrap();
        assert_eq!(propagator.kernel_builds(), 3);
    }

    #[test]
    fn zero_thickness_leaves_a_band_limited_wave_unchanged() {
        let mut propagator = FresnelPropagator::new();
        let mut waves = plane_wave([32, 32]);
        let before = waves.array().clone();
        propagator.propagate(&mut waves, 0.0).unwrap();
        for (a, b) in waves.array().iter().zip(before.iter()) {
            assert!((a - b).norm() < 1e-12);
        }
    }

    #[test]
    fn propagation_sets_the_antialiasing_aperture() {
        let mut propagator = FresnelPropagator::new();
        let mut waves = plane_wave([16, 16]);
        propagator.propagate(&mut waves, 5.0).unwrap();
        assert!((waves.antialiasing_aperture() - 2.0 / 3.0).abs() < 1e-12);
    }

    #[test]
    fn tilt_enters_the_cache_key() {
        let mut propagator = FresnelPropagator::new();
        let mut straight = plane_wave([16, 16]);
        let mut tilted = plane_wave([16, 16]).with_tilt(Some([1.0, 0.0]));
        propagator.propagate(&mut straight, 1.0).unwrap();
        propagator.propagate(&mut tilted, 1.0).unwrap();
        assert_eq!(propagator.kernel_builds(), 2);
    }
}
