//! The multislice driver: alternate the real-space transmission step with
//! the Fresnel free-space step over an ordered sequence of potential slices.

use super::error::EngineError;
use super::interfaces::Potential;
use super::progress::{Progress, ProgressReporter};
use super::propagator::FresnelPropagator;
use super::waves::{Waves, WavesLike};

/// Propagate `waves` through one potential configuration, in place.
///
/// Slices are applied strictly in order: transmit, then propagate by the
/// slice thickness. `max_batch_slices` groups slice generation into chunks
/// for I/O efficiency; within a chunk, slices are still applied one at a
/// time. Progress is reported per slice.
pub fn run(
    waves: &mut Waves,
    potential: &dyn Potential,
    propagator: &mut FresnelPropagator,
    max_batch_slices: usize,
    reporter: &ProgressReporter,
) -> Result<(), EngineError> {
    waves.match_grid(&potential.grid())?;
    waves.grid().check_is_defined()?;
    waves.accelerator().check_is_defined()?;
    let energy = waves.accelerator().defined_energy()?;

    reporter.report(Progress::TaskStart {
        total_steps: potential.num_slices() as u64,
    });
    for chunk in potential.transmission_functions(energy, max_batch_slices.max(1))? {
        let chunk = chunk?;
        for slice in &chunk.slices {
            slice.transmit(waves)?;
            propagator.propagate(waves, slice.thickness)?;
            reporter.report(Progress::TaskAdvance { steps: 1 });
        }
    }
    reporter.report(Progress::TaskFinish);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::test_support::SlicedPotential;
    use ndarray::{ArrayD, IxDyn};
    use num_complex::Complex64;
    use std::sync::atomic::{AtomicU64, Ordering};

    fn plane_wave(gpts: [usize; 2], sampling: f64, energy: f64) -> Waves {
        let array = ArrayD::from_elem(IxDyn(&[1, gpts[0], gpts[1]]), Complex64::new(1.0, 0.0));
        Waves::new(
            array,
            Some([gpts[0] as f64 * sampling, gpts[1] as f64 * sampling]),
            None,
            Some(energy),
        )
        .unwrap()
    }

    #[test]
    fn unit_slices_conserve_energy() {
        let mut waves = plane_wave([32, 32], 0.1, 80e3);
        let norm: f64 = waves.array().iter().map(|v| v.norm_sqr()).sum::<f64>().sqrt();
        waves.array_mut().mapv_inplace(|v| v / norm);
        let before: f64 = waves.array().iter().map(|v| v.norm_sqr()).sum();

        let potential = SlicedPotential::uniform([32, 32], [0.1, 0.1], 8);
        let mut propagator = FresnelPropagator::new();
        run(
            &mut waves,
            &potential,
            &mut propagator,
            1,
            &ProgressReporter::new(),
        )
        .unwrap();

        let after: f64 = waves.array().iter().map(|v| v.norm_sqr()).sum();
        assert!((after - before).abs() < 1e-10, "{after} vs {before}");
    }

    #[test]
    fn flat_slice_is_the_identity_transform() {
        // 64x64, 0.1 Å sampling, 80 keV, one all-ones slice of zero thickness.
        let mut waves = plane_wave([64, 64], 0.1, 80e3);
        let before = waves.array().clone();

        let potential = SlicedPotential::uniform([64, 64], [0.1, 0.1], 1);
        let mut propagator = FresnelPropagator::new();
        run(
            &mut waves,
            &potential,
            &mut propagator,
            1,
            &ProgressReporter::new(),
        )
        .unwrap();

        for (a, b) in waves.array().iter().zip(before.iter()) {
            assert!((a - b).norm() < 1e-12);
        }
    }

    #[test]
    fn grid_mismatch_is_fatal() {
        let mut waves = plane_wave([32, 32], 0.1, 80e3);
        let potential = SlicedPotential::uniform([16, 16], [0.1, 0.1], 1);
        let mut propagator = FresnelPropagator::new();
        let result = run(
            &mut waves,
            &potential,
            &mut propagator,
            1,
            &ProgressReporter::new(),
        );
        assert!(result.is_err());
    }

    #[test]
    fn undefined_energy_is_fatal() {
        let array = ArrayD::from_elem(IxDyn(&[1, 16, 16]), Complex64::new(1.0, 0.0));
        let mut waves = Waves::new(array, Some([1.6, 1.6]), None, None).unwrap();
        let potential = SlicedPotential::uniform([16, 16], [0.1, 0.1], 1);
        let mut propagator = FresnelPropagator::new();
        let result = run(
            &mut waves,
            &potential,
            &mut propagator,
            1,
            &ProgressReporter::new(),
        );
        assert!(result.is_err());
    }

    #[test]
    fn progress_is_reported_per_slice() {
        let advanced = AtomicU64::new(0);
        let reporter = ProgressReporter::with_callback(Box::new(|event| {
            if let Progress::TaskAdvance { steps } = event {
                advanced.fetch_add(steps, Ordering::Relaxed);
            }
        }));

        let mut waves = plane_wave([16, 16], 0.1, 80e3);
        let potential = SlicedPotential::uniform([16, 16], [0.1, 0.1], 5);
        let mut propagator = FresnelPropagator::new();
        run(&mut waves, &potential, &mut propagator, 2, &reporter).unwrap();
        assert_eq!(advanced.load(Ordering::Relaxed), 5);
    }
}
