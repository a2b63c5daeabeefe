use ndarray::ArrayD;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum MeasurementError {
    #[error("Expected {expected} axis calibrations, got {actual}")]
    CalibrationCount { expected: usize, actual: usize },
}

/// Linear calibration of one measurement axis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Calibration {
    pub name: String,
    pub units: String,
    pub offset: f64,
    pub sampling: f64,
}

impl Calibration {
    pub fn new(name: &str, units: &str, offset: f64, sampling: f64) -> Self {
        Self {
            name: name.to_string(),
            units: units.to_string(),
            offset,
            sampling,
        }
    }

    /// Physical coordinate of pixel `index` along this axis.
    pub fn coordinate(&self, index: usize) -> f64 {
        self.offset + index as f64 * self.sampling
    }
}

/// A calibrated real-valued measurement.
///
/// Calibrations are per axis; batch axes that carry no physical coordinate
/// are calibrated `None`.
#[derive(Debug, Clone, PartialEq)]
pub struct Measurement {
    pub values: ArrayD<f64>,
    pub calibrations: Vec<Option<Calibration>>,
}

impl Measurement {
    pub fn new(
        values: ArrayD<f64>,
        calibrations: Vec<Option<Calibration>>,
    ) -> Result<Self, MeasurementError> {
        if calibrations.len() != values.ndim() {
            return Err(MeasurementError::CalibrationCount {
                expected: values.ndim(),
                actual: calibrations.len(),
            });
        }
        Ok(Self {
            values,
            calibrations,
        })
    }
}

/// Calibrations for the trailing two axes of a grid-shaped measurement.
///
/// In real space the calibration is the grid sampling; in Fourier space it is
/// the frequency step `1/(n·sampling)` scaled by `scale_factor` (for angular
/// calibration pass `wavelength·1000` to obtain mrad), offset so that the
/// zero frequency sits at the fftshifted center pixel.
pub fn calibrations_from_grid(
    gpts: [usize; 2],
    sampling: [f64; 2],
    names: [&str; 2],
    units: &str,
    scale_factor: f64,
    fourier_space: bool,
) -> [Calibration; 2] {
    std::array::from_fn(|i| {
        if fourier_space {
            let step = 1.0 / (gpts[i] as f64 * sampling[i]) * scale_factor;
            let offset = -((gpts[i] / 2) as f64) * step;
            Calibration::new(names[i], units, offset, step)
        } else {
            Calibration::new(names[i], units, 0.0, sampling[i] * scale_factor)
        }
    })
}

/// Zero out a central disk of the diffraction pattern to suppress the
/// unscattered beam. `radius` is in the units of the trailing calibrations.
pub fn block_zeroth_order_spot(measurement: &mut Measurement, radius: f64) {
    let ndim = measurement.values.ndim();
    let (row_cal, col_cal) = match (
        &measurement.calibrations[ndim - 2],
        &measurement.calibrations[ndim - 1],
    ) {
        (Some(row), Some(col)) => (row.clone(), col.clone()),
        _ => return,
    };
    measurement.values.indexed_iter_mut().for_each(|(idx, value)| {
        let row = row_cal.coordinate(idx[ndim - 2]);
        let col = col_cal.coordinate(idx[ndim - 1]);
        if row.hypot(col) <= radius {
            *value = 0.0;
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::IxDyn;

    #[test]
    fn real_space_calibrations_start_at_zero() {
        let [x, y] = calibrations_from_grid([64, 64], [0.1, 0.2], ["x", "y"], "Å", 1.0, false);
        assert_eq!(x.offset, 0.0);
        assert_eq!(x.sampling, 0.1);
        assert_eq!(y.sampling, 0.2);
        assert_eq!(x.coordinate(10), 1.0);
    }

    #[test]
    fn fourier_space_calibrations_center_zero_frequency() {
        let [alpha_x, _] =
            calibrations_from_grid([64, 64], [0.1, 0.1], ["alpha_x", "alpha_y"], "mrad", 41.7, true);
        // The fftshifted zero-frequency pixel sits at index n/2.
        assert!((alpha_x.coordinate(32)).abs() < 1e-12);
        assert!(alpha_x.offset < 0.0);
    }

    #[test]
    fn calibration_count_is_validated() {
        let values = ArrayD::zeros(IxDyn(&[4, 4]));
        let result = Measurement::new(values, vec![None]);
        assert!(matches!(
            result,
            Err(MeasurementError::CalibrationCount { expected: 2, actual: 1 })
        ));
    }

    #[test]
    fn blocking_zeroth_order_zeroes_the_center() {
        let values = ArrayD::from_elem(IxDyn(&[5, 5]), 1.0);
        let calibrations = calibrations_from_grid([5, 5], [0.1, 0.1], ["a", "b"], "mrad", 1.0, true)
            .map(Some)
            .to_vec();
        let mut measurement = Measurement::new(values, calibrations).unwrap();
        let step = measurement.calibrations[0].as_ref().unwrap().sampling;
        block_zeroth_order_spot(&mut measurement, step * 1.1);
        assert_eq!(measurement.values[&[2, 2][..]], 0.0);
        assert_eq!(measurement.values[&[2, 3][..]], 0.0);
        assert_eq!(measurement.values[&[0, 0][..]], 1.0);
        assert_eq!(measurement.values[&[2, 2 + 2][..]], 1.0);
    }
}
