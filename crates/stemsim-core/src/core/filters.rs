use super::fourier::spatial_frequencies;
use ndarray::Array2;
use std::f64::consts::PI;

/// Band limit applied after Fourier-space operations to prevent wraparound
/// (aliasing) artifacts.
///
/// The mask passes frequencies below `cutoff` times the Nyquist frequency of
/// the coarser axis, with a cosine rolloff of width `rolloff` [1/Å] just
/// below the cutoff.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AntialiasFilter {
    pub cutoff: f64,
    pub rolloff: f64,
}

impl AntialiasFilter {
    /// Default band limit as a fraction of the Nyquist frequency.
    pub const CUTOFF: f64 = 2.0 / 3.0;

    /// Default rolloff width [1/Å].
    pub const ROLLOFF: f64 = 0.1;
}

impl Default for AntialiasFilter {
    fn default() -> Self {
        Self {
            cutoff: Self::CUTOFF,
            rolloff: Self::ROLLOFF,
        }
    }
}

impl AntialiasFilter {
    /// Build the mask over the unshifted frequency layout of the grid.
    pub fn mask(&self, gpts: [usize; 2], sampling: [f64; 2]) -> Array2<f64> {
        let (kx, ky) = spatial_frequencies(gpts, sampling);
        let kcut = 1.0 / sampling[0].max(sampling[1]) / 2.0 * self.cutoff;
        let rolloff = self.rolloff;

        Array2::from_shape_fn((gpts[0], gpts[1]), |(i, j)| {
            let k = kx[i].hypot(ky[j]);
            if rolloff > 0.0 {
                if k > kcut {
                    0.0
                } else if k > kcut - rolloff {
                    0.5 * (1.0 + (PI * (k - kcut + rolloff) / rolloff).cos())
                } else {
                    1.0
                }
            } else if k < kcut {
                1.0
            } else {
                0.0
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mask_passes_zero_frequency() {
        let mask = AntialiasFilter::default().mask([32, 32], [0.1, 0.1]);
        assert_eq!(mask[[0, 0]], 1.0);
    }

    #[test]
    fn mask_blocks_frequencies_beyond_cutoff() {
        let filter = AntialiasFilter::default();
        let mask = filter.mask([32, 32], [0.1, 0.1]);
        // Nyquist frequency (5 1/Å) sits well above the 2/3 cutoff.
        assert_eq!(mask[[16, 0]], 0.0);
        assert_eq!(mask[[16, 16]], 0.0);
    }

    #[test]
    fn mask_tapers_monotonically_through_the_rolloff() {
        let filter = AntialiasFilter::default();
        let mask = filter.mask([64, 64], [0.1, 0.1]);
        let profile: Vec<f64> = (0..32).map(|i| mask[[i, 0]]).collect();
        for pair in profile.windows(2) {
            assert!(pair[1] <= pair[0] + 1e-12, "profile must not increase");
        }
    }

    #[test]
    fn sharp_filter_is_binary() {
        let filter = AntialiasFilter {
            cutoff: 2.0 / 3.0,
            rolloff: 0.0,
        };
        let mask = filter.mask([32, 32], [0.1, 0.1]);
        for value in mask.iter() {
            assert!(*value == 0.0 || *value == 1.0);
        }
    }
}
