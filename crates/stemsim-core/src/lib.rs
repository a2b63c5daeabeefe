//! # stemsim Core Library
//!
//! A high-performance library for simulating scanning transmission electron
//! microscopy (STEM), implementing direct **multislice** propagation and the
//! **PRISM** plane-wave-expansion algorithm.
//!
//! ## Architectural Philosophy
//!
//! The library is designed with a strict three-layer architecture to ensure a
//! clear separation of concerns, making it modular, testable, and extensible.
//!
//! - **[`core`]: The Foundation.** Contains stateless grid and accelerator
//!   bookkeeping, the spectral backend abstraction over the batched FFT
//!   kernels, Fourier-space utilities, the antialiasing band limit, and the
//!   calibrated measurement and persistence containers.
//!
//! - **[`engine`]: The Logic Core.** This stateful layer orchestrates the
//!   simulation: the cached Fresnel propagator, the multislice driver, wave
//!   function batches, the probe and plane-wave builders, the PRISM
//!   scattering matrix with its memory-aware batching, and the collaborator
//!   interfaces (potential, detector, scan, transfer function, device
//!   memory).
//!
//! - **[`workflows`]: The Public API.** Config-driven entry points for
//!   complete simulations: STEM scans with either algorithm and plane-wave
//!   exit-wave calculations, with progress reporting and frozen-phonon
//!   averaging handled end to end.

pub mod core;
pub mod engine;
pub mod workflows;
