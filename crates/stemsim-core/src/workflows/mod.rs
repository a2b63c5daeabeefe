//! # Workflows Module
//!
//! High-level, config-driven entry points tying the engine together into
//! complete simulations. Each workflow validates its configuration, selects
//! the algorithm, threads progress reporting and returns the recorded
//! measurements or exit waves.
//!
//! - **STEM scanning** ([`stem`]) - raster a probe over a potential with
//!   either direct multislice or the PRISM expansion, recording one
//!   measurement per detector.
//! - **HRTEM exit waves** ([`hrtem`]) - propagate a plane wave through a
//!   potential and return the exit-plane wave functions.

pub mod hrtem;
pub mod stem;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required parameter: {0}")]
    MissingParameter(&'static str),

    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),
}
