use super::ConfigError;
use crate::core::measurement::Measurement;
use crate::engine::error::EngineError;
use crate::engine::interfaces::{Ctf, Detector, Potential, Scan};
use crate::engine::probe::Probe;
use crate::engine::progress::ProgressReporter;
use crate::engine::smatrix::SMatrix;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};

/// The simulation algorithm: direct multislice per probe batch, or the
/// PRISM plane-wave expansion propagated once and collapsed per position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Algorithm {
    Multislice,
    Prism {
        expansion_cutoff: f64,
        #[serde(default = "default_interpolation")]
        interpolation: usize,
    },
}

fn default_interpolation() -> usize {
    1
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StemConfig {
    pub energy: f64,
    pub algorithm: Algorithm,
    #[serde(default)]
    pub extent: Option<[f64; 2]>,
    #[serde(default)]
    pub gpts: Option<[usize; 2]>,
    #[serde(default)]
    pub sampling: Option<[f64; 2]>,
    #[serde(default)]
    pub tilt: Option<[f64; 2]>,
    #[serde(default)]
    pub max_batch_probes: Option<usize>,
    #[serde(default)]
    pub max_batch_expansion: Option<usize>,
}

impl StemConfig {
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }
}

#[derive(Default)]
pub struct StemConfigBuilder {
    energy: Option<f64>,
    algorithm: Option<Algorithm>,
    extent: Option<[f64; 2]>,
    gpts: Option<[usize; 2]>,
    sampling: Option<[f64; 2]>,
    tilt: Option<[f64; 2]>,
    max_batch_probes: Option<usize>,
    max_batch_expansion: Option<usize>,
}

impl StemConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn energy(mut self, energy: f64) -> Self {
        self.energy = Some(energy);
        self
    }
    pub fn algorithm(mut self, algorithm: Algorithm) -> Self {
        self.algorithm = Some(algorithm);
        self
    }
    pub fn extent(mut self, extent: [f64; 2]) -> Self {
        self.extent = Some(extent);
        self
    }
    pub fn gpts(mut self, gpts: [usize; 2]) -> Self {
        self.gpts = Some(gpts);
        self
    }
    pub fn sampling(mut self, sampling: [f64; 2]) -> Self {
        self.sampling = Some(sampling);
        self
    }
    pub fn tilt(mut self, tilt: [f64; 2]) -> Self {
        self.tilt = Some(tilt);
        self
    }
    pub fn max_batch_probes(mut self, batch: usize) -> Self {
        self.max_batch_probes = Some(batch);
        self
    }
    pub fn max_batch_expansion(mut self, batch: usize) -> Self {
        self.max_batch_expansion = Some(batch);
        self
    }

    pub fn build(self) -> Result<StemConfig, ConfigError> {
        Ok(StemConfig {
            energy: self.energy.ok_or(ConfigError::MissingParameter("energy"))?,
            algorithm: self
                .algorithm
                .ok_or(ConfigError::MissingParameter("algorithm"))?,
            extent: self.extent,
            gpts: self.gpts,
            sampling: self.sampling,
            tilt: self.tilt,
            max_batch_probes: self.max_batch_probes,
            max_batch_expansion: self.max_batch_expansion,
        })
    }
}

/// Run a complete STEM scan and record one measurement per detector.
///
/// Grid quantities left unset are adopted from the potential. The optional
/// transfer function defaults to an open (unit) one.
#[instrument(skip_all, name = "stem_workflow")]
pub fn run(
    config: &StemConfig,
    ctf: Option<Box<dyn Ctf>>,
    potential: &dyn Potential,
    scan: &dyn Scan,
    detectors: &[&dyn Detector],
    reporter: &ProgressReporter,
) -> Result<Vec<Measurement>, EngineError> {
    match &config.algorithm {
        Algorithm::Multislice => {
            info!(energy = config.energy, "running multislice STEM scan");
            let mut probe = match ctf {
                Some(ctf) => Probe::new(
                    config.extent,
                    config.gpts,
                    config.sampling,
                    Some(config.energy),
                    ctf,
                )?,
                None => Probe::new(
                    config.extent,
                    config.gpts,
                    config.sampling,
                    Some(config.energy),
                    Box::new(crate::engine::interfaces::OpenCtf::new()),
                )?,
            }
            .with_tilt(config.tilt);
            probe.scan(
                scan,
                detectors,
                potential,
                None,
                config.max_batch_probes,
                reporter,
            )
        }
        Algorithm::Prism {
            expansion_cutoff,
            interpolation,
        } => {
            info!(
                energy = config.energy,
                expansion_cutoff, interpolation, "running PRISM STEM scan"
            );
            let mut s_matrix = SMatrix::new(
                *expansion_cutoff,
                config.energy,
                *interpolation,
                ctf,
                config.extent,
                config.gpts,
                config.sampling,
            )?
            .with_tilt(config.tilt);
            s_matrix.scan(
                scan,
                detectors,
                potential,
                None,
                config.max_batch_probes,
                config.max_batch_expansion,
                reporter,
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::test_support::{CenterIntensityDetector, ListScan, SlicedPotential};
    use nalgebra::Vector2;

    #[test]
    fn config_parses_from_toml() {
        let config = StemConfig::from_toml_str(
            r#"
            energy = 80000.0
            gpts = [32, 32]
            sampling = [0.1, 0.1]

            [algorithm]
            kind = "prism"
            expansion_cutoff = 30.0
            interpolation = 2
            "#,
        )
        .unwrap();
        assert_eq!(config.energy, 80e3);
        assert_eq!(
            config.algorithm,
            Algorithm::Prism {
                expansion_cutoff: 30.0,
                interpolation: 2
            }
        );
        assert_eq!(config.gpts, Some([32, 32]));
    }

    #[test]
    fn builder_requires_energy_and_algorithm() {
        let result = StemConfigBuilder::new().energy(80e3).build();
        assert!(matches!(
            result,
            Err(ConfigError::MissingParameter("algorithm"))
        ));
    }

    #[test]
    fn both_algorithms_scan_the_same_potential() {
        let potential = SlicedPotential::phase_grating([32, 32], [0.1, 0.1], 0.2, 2.0);
        let scan = ListScan::new(vec![Vector2::new(1.0, 1.0), Vector2::new(2.0, 2.0)]);
        let detector = CenterIntensityDetector;
        let reporter = ProgressReporter::new();

        let multislice_config = StemConfigBuilder::new()
            .energy(80e3)
            .algorithm(Algorithm::Multislice)
            .build()
            .unwrap();
        let multislice_result = run(
            &multislice_config,
            None,
            &potential,
            &scan,
            &[&detector],
            &reporter,
        )
        .unwrap();
        assert_eq!(multislice_result[0].values.shape(), &[2]);

        let prism_config = StemConfigBuilder::new()
            .energy(80e3)
            .algorithm(Algorithm::Prism {
                expansion_cutoff: 40.0,
                interpolation: 1,
            })
            .build()
            .unwrap();
        let prism_result = run(
            &prism_config,
            None,
            &potential,
            &scan,
            &[&detector],
            &reporter,
        )
        .unwrap();
        assert_eq!(prism_result[0].values.shape(), &[2]);
    }
}
