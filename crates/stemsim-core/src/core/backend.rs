use ndarray::{Array2, Array3, ArrayD, ArrayViewD, ArrayViewMutD, Axis, Zip, s};
use num_complex::Complex64;
use rustfft::{Fft, FftPlanner};
use std::fmt;
use std::sync::{Arc, Mutex, OnceLock};

/// Elementwise `exp(i·x)`.
#[inline]
pub fn complex_exponential(phase: f64) -> Complex64 {
    let (sin, cos) = phase.sin_cos();
    Complex64::new(cos, sin)
}

/// Numerical kernels over batched 2D complex arrays.
///
/// All operations act on the trailing two axes of rank ≥ 2 arrays, leaving
/// any leading batch axes untouched. An implementation is selected at
/// construction time and passed explicitly to the objects that need it,
/// keeping the engine independent of the array back end.
pub trait SpectralBackend: Send + Sync + fmt::Debug {
    /// Forward 2D FFT over the trailing two axes, in place, unnormalized.
    fn fft2(&self, array: &mut ArrayViewMutD<'_, Complex64>);

    /// Inverse 2D FFT over the trailing two axes, in place, scaled by
    /// `1/(ny·nx)` so that `ifft2(fft2(x)) == x`.
    fn ifft2(&self, array: &mut ArrayViewMutD<'_, Complex64>);

    /// Fourier-domain convolution: forward FFT, multiply by `kernel`
    /// (broadcast over the batch axes), inverse FFT. Fully in place.
    ///
    /// # Panics
    ///
    /// Panics if `kernel` does not match the trailing two axes.
    fn fft2_convolve(&self, array: &mut ArrayViewMutD<'_, Complex64>, kernel: &Array2<Complex64>);

    /// Elementwise squared modulus.
    fn abs2(&self, array: &ArrayViewD<'_, Complex64>) -> ArrayD<f64>;

    /// Elementwise `exp(i·phase)`.
    fn complex_exponential(&self, phase: &ArrayViewD<'_, f64>) -> ArrayD<Complex64> {
        phase.mapv(complex_exponential)
    }

    /// Extract a window of `shape` from every batch item, starting at the
    /// per-item `corners`. Corners must be in bounds.
    fn batch_crop(
        &self,
        array: &Array3<Complex64>,
        corners: &[[usize; 2]],
        shape: [usize; 2],
    ) -> Array3<Complex64>;
}

/// CPU implementation backed by rustfft with a shared plan cache.
pub struct CpuBackend {
    planner: Mutex<FftPlanner<f64>>,
}

impl fmt::Debug for CpuBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CpuBackend").finish()
    }
}

impl Default for CpuBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl CpuBackend {
    pub fn new() -> Self {
        Self {
            planner: Mutex::new(FftPlanner::new()),
        }
    }

    /// Process-wide shared instance; the planner cache is reused across all
    /// wave functions built without an explicit backend.
    pub fn shared() -> Arc<dyn SpectralBackend> {
        static SHARED: OnceLock<Arc<CpuBackend>> = OnceLock::new();
        SHARED.get_or_init(|| Arc::new(CpuBackend::new())).clone()
    }

    fn plan(&self, len: usize, forward: bool) -> Arc<dyn Fft<f64>> {
        let mut planner = self.planner.lock().expect("FFT planner lock poisoned");
        if forward {
            planner.plan_fft_forward(len)
        } else {
            planner.plan_fft_inverse(len)
        }
    }

    // One pass per trailing axis; lanes are staged through a scratch buffer
    // so non-contiguous layouts are handled uniformly.
    fn transform(&self, array: &mut ArrayViewMutD<'_, Complex64>, forward: bool) {
        let ndim = array.ndim();
        let ny = array.shape()[ndim - 2];
        let nx = array.shape()[ndim - 1];
        let row_fft = self.plan(nx, forward);
        let col_fft = self.plan(ny, forward);
        let mut scratch = vec![Complex64::new(0.0, 0.0); nx.max(ny)];

        for mut lane in array.lanes_mut(Axis(ndim - 1)) {
            for (slot, value) in scratch[..nx].iter_mut().zip(lane.iter()) {
                *slot = *value;
            }
            row_fft.process(&mut scratch[..nx]);
            for (value, slot) in lane.iter_mut().zip(scratch[..nx].iter()) {
                *value = *slot;
            }
        }
        for mut lane in array.lanes_mut(Axis(ndim - 2)) {
            for (slot, value) in scratch[..ny].iter_mut().zip(lane.iter()) {
                *slot = *value;
            }
            col_fft.process(&mut scratch[..ny]);
            for (value, slot) in lane.iter_mut().zip(scratch[..ny].iter()) {
                *value = *slot;
            }
        }
    }
}

impl SpectralBackend for CpuBackend {
    fn fft2(&self, array: &mut ArrayViewMutD<'_, Complex64>) {
        self.transform(array, true);
    }

    fn ifft2(&self, array: &mut ArrayViewMutD<'_, Complex64>) {
        self.transform(array, false);
        let ndim = array.ndim();
        let norm = 1.0 / (array.shape()[ndim - 2] * array.shape()[ndim - 1]) as f64;
        array.mapv_inplace(|value| value * norm);
    }

    fn fft2_convolve(&self, array: &mut ArrayViewMutD<'_, Complex64>, kernel: &Array2<Complex64>) {
        self.fft2(array);
        {
            let kernel = kernel
                .broadcast(array.raw_dim())
                .expect("kernel shape must match the trailing two axes");
            Zip::from(array.view_mut())
                .and(&kernel)
                .for_each(|value, &k| *value *= k);
        }
        self.ifft2(array);
    }

    fn abs2(&self, array: &ArrayViewD<'_, Complex64>) -> ArrayD<f64> {
        array.mapv(|value| value.norm_sqr())
    }

    fn batch_crop(
        &self,
        array: &Array3<Complex64>,
        corners: &[[usize; 2]],
        shape: [usize; 2],
    ) -> Array3<Complex64> {
        let mut out = Array3::zeros((array.shape()[0], shape[0], shape[1]));
        for (index, mut window) in out.axis_iter_mut(Axis(0)).enumerate() {
            let [row, col] = corners[index];
            window.assign(&array.slice(s![index, row..row + shape[0], col..col + shape[1]]));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{Array3, IxDyn};

    fn test_array() -> ArrayD<Complex64> {
        ArrayD::from_shape_fn(IxDyn(&[2, 4, 8]), |idx| {
            Complex64::new((idx[0] + 2 * idx[1]) as f64, idx[2] as f64 * 0.5 - 1.0)
        })
    }

    #[test]
    fn ifft2_inverts_fft2() {
        let backend = CpuBackend::new();
        let original = test_array();
        let mut array = original.clone();
        backend.fft2(&mut array.view_mut());
        backend.ifft2(&mut array.view_mut());
        for (a, b) in array.iter().zip(original.iter()) {
            assert!((a - b).norm() < 1e-12);
        }
    }

    #[test]
    fn fft2_satisfies_parseval() {
        let backend = CpuBackend::new();
        let original = test_array();
        let mut transformed = original.clone();
        backend.fft2(&mut transformed.view_mut());
        let n = (4 * 8) as f64;
        let real_power: f64 = original.iter().map(|value| value.norm_sqr()).sum();
        let fourier_power: f64 = transformed.iter().map(|value| value.norm_sqr()).sum();
        assert!((fourier_power / n - real_power).abs() < 1e-9 * real_power);
    }

    #[test]
    fn convolve_with_unit_kernel_is_identity() {
        let backend = CpuBackend::new();
        let original = test_array();
        let mut array = original.clone();
        let kernel = Array2::from_elem((4, 8), Complex64::new(1.0, 0.0));
        backend.fft2_convolve(&mut array.view_mut(), &kernel);
        for (a, b) in array.iter().zip(original.iter()) {
            assert!((a - b).norm() < 1e-12);
        }
    }

    #[test]
    fn abs2_is_squared_modulus() {
        let backend = CpuBackend::new();
        let array = test_array();
        let intensity = backend.abs2(&array.view());
        for (value, expected) in intensity.iter().zip(array.iter()) {
            assert!((value - expected.norm_sqr()).abs() < 1e-15);
        }
    }

    #[test]
    fn batch_crop_extracts_per_item_windows() {
        let backend = CpuBackend::new();
        let array = Array3::from_shape_fn((2, 4, 4), |(p, i, j)| {
            Complex64::new((p * 16 + i * 4 + j) as f64, 0.0)
        });
        let cropped = backend.batch_crop(&array, &[[0, 0], [1, 2]], [2, 2]);
        assert_eq!(cropped.shape(), &[2, 2, 2]);
        assert_eq!(cropped[[0, 0, 0]].re, 0.0);
        assert_eq!(cropped[[1, 0, 0]].re, (16 + 4 + 2) as f64);
        assert_eq!(cropped[[1, 1, 1]].re, (16 + 8 + 3) as f64);
    }
}
