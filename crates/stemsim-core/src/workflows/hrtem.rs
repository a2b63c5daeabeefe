use super::ConfigError;
use crate::engine::error::EngineError;
use crate::engine::interfaces::Potential;
use crate::engine::progress::ProgressReporter;
use crate::engine::waves::{PlaneWave, Waves};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExitWaveConfig {
    pub energy: f64,
    #[serde(default)]
    pub extent: Option<[f64; 2]>,
    #[serde(default)]
    pub gpts: Option<[usize; 2]>,
    #[serde(default)]
    pub sampling: Option<[f64; 2]>,
    #[serde(default)]
    pub tilt: Option<[f64; 2]>,
    #[serde(default = "default_max_batch_slices")]
    pub max_batch_slices: usize,
}

fn default_max_batch_slices() -> usize {
    1
}

impl ExitWaveConfig {
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }
}

/// Propagate a plane wave through the potential and return the exit-plane
/// wave functions; with frozen phonons, one exit wave per configuration.
#[instrument(skip_all, name = "hrtem_workflow")]
pub fn run(
    config: &ExitWaveConfig,
    potential: &dyn Potential,
    reporter: &ProgressReporter,
) -> Result<Waves, EngineError> {
    info!(
        energy = config.energy,
        slices = potential.num_slices(),
        configurations = potential.frozen_phonon_configs(),
        "running plane wave exit wave simulation"
    );
    let mut plane_wave = PlaneWave::new(
        config.extent,
        config.gpts,
        config.sampling,
        Some(config.energy),
    )?
    .with_tilt(config.tilt);
    plane_wave.multislice(potential, config.max_batch_slices, reporter)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::test_support::{PhononPotential, SlicedPotential};
    use crate::engine::waves::WavesLike;

    #[test]
    fn exit_wave_adopts_the_potential_grid() {
        let config = ExitWaveConfig {
            energy: 80e3,
            extent: None,
            gpts: None,
            sampling: None,
            tilt: None,
            max_batch_slices: 2,
        };
        let potential = SlicedPotential::uniform([16, 16], [0.1, 0.1], 3);
        let exit = run(&config, &potential, &ProgressReporter::new()).unwrap();
        assert_eq!(exit.array().shape(), &[1, 16, 16]);
        assert_eq!(
            exit.grid().defined_sampling().unwrap(),
            [0.1, 0.1]
        );
    }

    #[test]
    fn frozen_phonons_stack_per_configuration_exit_waves() {
        let config = ExitWaveConfig {
            energy: 80e3,
            extent: None,
            gpts: None,
            sampling: None,
            tilt: None,
            max_batch_slices: 1,
        };
        let potential = PhononPotential::uniform([16, 16], [0.1, 0.1], 2, 1);
        let exit = run(&config, &potential, &ProgressReporter::new()).unwrap();
        assert_eq!(exit.array().shape(), &[2, 16, 16]);
    }
}
