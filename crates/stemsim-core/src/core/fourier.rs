use super::backend::complex_exponential;
use nalgebra::Vector2;
use ndarray::{Array2, Array3, ArrayD, IxDyn};
use num_complex::Complex64;
use std::f64::consts::PI;

/// Discrete Fourier transform sample frequencies for `n` points spaced `d`
/// apart, in standard (unshifted) order.
pub fn fftfreq(n: usize, d: f64) -> Vec<f64> {
    let step = 1.0 / (n as f64 * d);
    (0..n)
        .map(|i| {
            if i < n.div_ceil(2) {
                i as f64 * step
            } else {
                (i as f64 - n as f64) * step
            }
        })
        .collect()
}

/// Spatial frequency axes [1/Å] of a sampling grid.
pub fn spatial_frequencies(gpts: [usize; 2], sampling: [f64; 2]) -> (Vec<f64>, Vec<f64>) {
    (fftfreq(gpts[0], sampling[0]), fftfreq(gpts[1], sampling[1]))
}

/// Polar coordinates of the outer product of two scaled frequency axes.
///
/// Returns `(alpha, phi)` where `alpha[i, j] = hypot(x[i], y[j])` and
/// `phi[i, j] = atan2(x[i], y[j])`.
pub fn polar_coordinates(x: &[f64], y: &[f64]) -> (Array2<f64>, Array2<f64>) {
    let alpha = Array2::from_shape_fn((x.len(), y.len()), |(i, j)| x[i].hypot(y[j]));
    let phi = Array2::from_shape_fn((x.len(), y.len()), |(i, j)| x[i].atan2(y[j]));
    (alpha, phi)
}

// Indices kept by a Fourier-space crop: the first ceil(m/2) frequencies and
// the last floor(m/2), preserving the unshifted frequency layout.
fn crop_indices(n: usize, m: usize) -> Vec<usize> {
    let positive = m.div_ceil(2);
    let negative = m - positive;
    (0..positive).chain(n - negative..n).collect()
}

/// Crop an unshifted Fourier-space array to `new_gpts` over the trailing two
/// axes, keeping the lowest frequencies of each sign.
pub fn fourier_crop(array: &ArrayD<Complex64>, new_gpts: [usize; 2]) -> ArrayD<Complex64> {
    let ndim = array.ndim();
    let shape = array.shape();
    let rows = crop_indices(shape[ndim - 2], new_gpts[0]);
    let cols = crop_indices(shape[ndim - 1], new_gpts[1]);

    let mut out_shape = shape.to_vec();
    out_shape[ndim - 2] = new_gpts[0];
    out_shape[ndim - 1] = new_gpts[1];

    ArrayD::from_shape_fn(IxDyn(&out_shape), |idx| {
        let mut source: Vec<usize> = (0..ndim).map(|axis| idx[axis]).collect();
        source[ndim - 2] = rows[idx[ndim - 2]];
        source[ndim - 1] = cols[idx[ndim - 1]];
        array[&source[..]]
    })
}

/// Shift the zero-frequency component to the center of the trailing two axes.
pub fn fftshift2(array: &ArrayD<f64>) -> ArrayD<f64> {
    let ndim = array.ndim();
    let ny = array.shape()[ndim - 2];
    let nx = array.shape()[ndim - 1];
    ArrayD::from_shape_fn(array.raw_dim(), |idx| {
        let mut source: Vec<usize> = (0..ndim).map(|axis| idx[axis]).collect();
        source[ndim - 2] = (idx[ndim - 2] + ny - ny / 2) % ny;
        source[ndim - 1] = (idx[ndim - 1] + nx - nx / 2) % nx;
        array[&source[..]]
    })
}

/// Crop a window from every item of a batch, wrapping around the periodic
/// boundaries of the trailing two axes. The corner may be negative.
pub fn periodic_crop(
    array: &Array3<Complex64>,
    corner: [isize; 2],
    size: [usize; 2],
) -> Array3<Complex64> {
    let ny = array.shape()[1] as isize;
    let nx = array.shape()[2] as isize;
    Array3::from_shape_fn((array.shape()[0], size[0], size[1]), |(p, i, j)| {
        let row = (corner[0] + i as isize).rem_euclid(ny) as usize;
        let col = (corner[1] + j as isize).rem_euclid(nx) as usize;
        array[[p, row, col]]
    })
}

/// Fourier-space phase ramps realizing sub-pixel translations.
///
/// Positions are in pixel units; multiplying an unshifted 2D spectrum by
/// `out[p]` and inverse transforming shifts the field by `positions[p]`.
pub fn fourier_translation_operator(
    positions: &[Vector2<f64>],
    gpts: [usize; 2],
) -> Array3<Complex64> {
    let kx = fftfreq(gpts[0], 1.0);
    let ky = fftfreq(gpts[1], 1.0);
    Array3::from_shape_fn((positions.len(), gpts[0], gpts[1]), |(p, i, j)| {
        complex_exponential(-2.0 * PI * (kx[i] * positions[p].x + ky[j] * positions[p].y))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fftfreq_matches_standard_layout() {
        let even = fftfreq(4, 1.0);
        assert_eq!(even, vec![0.0, 0.25, -0.5, -0.25]);
        let odd = fftfreq(5, 0.5);
        assert_eq!(odd, vec![0.0, 0.4, 0.8, -0.8, -0.4]);
    }

    #[test]
    fn fourier_crop_keeps_low_frequencies() {
        let array = ArrayD::from_shape_fn(IxDyn(&[1, 6, 6]), |idx| {
            Complex64::new((idx[1] * 10 + idx[2]) as f64, 0.0)
        });
        let cropped = fourier_crop(&array, [4, 4]);
        assert_eq!(cropped.shape(), &[1, 4, 4]);
        // Rows kept: 0, 1, 4, 5; columns likewise.
        assert_eq!(cropped[&[0, 0, 0][..]].re, 0.0);
        assert_eq!(cropped[&[0, 1, 1][..]].re, 11.0);
        assert_eq!(cropped[&[0, 2, 2][..]].re, 44.0);
        assert_eq!(cropped[&[0, 3, 3][..]].re, 55.0);
        assert_eq!(cropped[&[0, 0, 3][..]].re, 5.0);
    }

    #[test]
    fn fftshift2_centers_zero_frequency() {
        let mut array = ArrayD::zeros(IxDyn(&[4, 4]));
        array[&[0, 0][..]] = 1.0;
        let shifted = fftshift2(&array);
        assert_eq!(shifted[&[2, 2][..]], 1.0);
        assert_eq!(shifted[&[0, 0][..]], 0.0);
    }

    #[test]
    fn periodic_crop_wraps_negative_corners() {
        let array = Array3::from_shape_fn((1, 4, 4), |(_, i, j)| {
            Complex64::new((i * 4 + j) as f64, 0.0)
        });
        let cropped = periodic_crop(&array, [-1, -1], [2, 2]);
        assert_eq!(cropped[[0, 0, 0]].re, 15.0);
        assert_eq!(cropped[[0, 0, 1]].re, 12.0);
        assert_eq!(cropped[[0, 1, 0]].re, 3.0);
        assert_eq!(cropped[[0, 1, 1]].re, 0.0);
    }

    #[test]
    fn translation_operator_is_pure_phase() {
        let positions = [Vector2::new(1.5, -0.5)];
        let operator = fourier_translation_operator(&positions, [4, 4]);
        for value in operator.iter() {
            assert!((value.norm() - 1.0).abs() < 1e-12);
        }
        // Zero frequency carries no phase.
        assert!((operator[[0, 0, 0]] - Complex64::new(1.0, 0.0)).norm() < 1e-12);
    }
}
