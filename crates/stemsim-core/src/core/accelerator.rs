use thiserror::Error;

const PLANCK_CONSTANT: f64 = 6.62607015e-34; // In J·s
const SPEED_OF_LIGHT: f64 = 2.99792458e8; // In m/s
const ELECTRON_MASS: f64 = 9.1093837015e-31; // In kg
const ELEMENTARY_CHARGE: f64 = 1.602176634e-19; // In C

#[derive(Debug, Error, Clone, PartialEq)]
pub enum AcceleratorError {
    #[error("Electron energy has not been set")]
    Undefined,

    #[error("Electron energy mismatch: {left} eV vs {right} eV")]
    Mismatch { left: f64, right: f64 },
}

/// Relativistic de Broglie wavelength [Å] for an electron accelerated
/// through `energy` volts.
pub fn energy_to_wavelength(energy: f64) -> f64 {
    let rest_energy = ELECTRON_MASS * SPEED_OF_LIGHT * SPEED_OF_LIGHT;
    let kinetic_energy = energy * ELEMENTARY_CHARGE;
    PLANCK_CONSTANT * SPEED_OF_LIGHT / (kinetic_energy * (2.0 * rest_energy + kinetic_energy)).sqrt()
        * 1e10
}

/// Carries the electron energy and derives the relativistic wavelength.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Accelerator {
    energy: Option<f64>,
}

impl Accelerator {
    pub fn new(energy: Option<f64>) -> Self {
        Self { energy }
    }

    /// Electron energy [eV], if defined.
    pub fn energy(&self) -> Option<f64> {
        self.energy
    }

    pub fn defined_energy(&self) -> Result<f64, AcceleratorError> {
        self.energy.ok_or(AcceleratorError::Undefined)
    }

    /// Relativistic electron wavelength [Å].
    pub fn wavelength(&self) -> Result<f64, AcceleratorError> {
        Ok(energy_to_wavelength(self.defined_energy()?))
    }

    pub fn check_is_defined(&self) -> Result<(), AcceleratorError> {
        self.defined_energy().map(|_| ())
    }

    /// Adopt the other accelerator's energy when undefined; fail on conflict.
    pub fn match_with(&mut self, other: &Accelerator) -> Result<(), AcceleratorError> {
        match (self.energy, other.energy) {
            (Some(left), Some(right)) if left != right => {
                Err(AcceleratorError::Mismatch { left, right })
            }
            (None, Some(energy)) => {
                self.energy = Some(energy);
                Ok(())
            }
            _ => Ok(()),
        }
    }
}
