use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum GridError {
    #[error("Grid is not fully defined: {missing} has not been set")]
    Undefined { missing: &'static str },

    #[error("Grid mismatch on {quantity}: {left} vs {right}")]
    Mismatch {
        quantity: &'static str,
        left: String,
        right: String,
    },

    #[error("Grid {quantity} must be positive, got {value}")]
    NonPositive { quantity: &'static str, value: f64 },

    #[error("Grid gpts is locked and cannot be changed from {current:?} to {requested:?}")]
    LockedGpts {
        current: [usize; 2],
        requested: [usize; 2],
    },
}

/// The real-space sampling grid shared by wave functions and potentials.
///
/// A grid is described by three coupled quantities: the number of grid points
/// `gpts`, the sampling `sampling` [Å] and the lateral extent `extent` [Å],
/// tied together by the invariant `extent = gpts * sampling` (element-wise).
/// Any two of the three determine the third; setters re-derive the dependent
/// quantities so the invariant holds exactly after every mutation.
///
/// Grids describing arrays (wave functions, scattering matrices) lock their
/// `gpts` to the array shape; matching such a grid against an incompatible
/// one fails instead of silently resampling.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Grid {
    gpts: Option<[usize; 2]>,
    sampling: Option<[f64; 2]>,
    extent: Option<[f64; 2]>,
    lock_gpts: bool,
}

fn approx_eq(a: f64, b: f64) -> bool {
    (a - b).abs() <= 1e-12 * a.abs().max(b.abs()).max(1.0)
}

impl Grid {
    /// Create a grid from any combination of extent, gpts and sampling.
    ///
    /// Quantities are applied in the order extent, gpts, sampling; dependent
    /// quantities are derived as soon as two of the three are known.
    pub fn new(
        extent: Option<[f64; 2]>,
        gpts: Option<[usize; 2]>,
        sampling: Option<[f64; 2]>,
    ) -> Result<Self, GridError> {
        let mut grid = Grid::default();
        if let Some(extent) = extent {
            grid.set_extent(extent)?;
        }
        if let Some(gpts) = gpts {
            grid.set_gpts(gpts)?;
        }
        if let Some(sampling) = sampling {
            grid.set_sampling(sampling)?;
        }
        Ok(grid)
    }

    /// Lock `gpts` against further changes (used by array-backed objects).
    pub fn lock_gpts(mut self) -> Self {
        self.lock_gpts = true;
        self
    }

    pub fn is_gpts_locked(&self) -> bool {
        self.lock_gpts
    }

    pub fn gpts(&self) -> Option<[usize; 2]> {
        self.gpts
    }

    pub fn sampling(&self) -> Option<[f64; 2]> {
        self.sampling
    }

    pub fn extent(&self) -> Option<[f64; 2]> {
        self.extent
    }

    pub fn defined_gpts(&self) -> Result<[usize; 2], GridError> {
        self.gpts.ok_or(GridError::Undefined { missing: "gpts" })
    }

    pub fn defined_sampling(&self) -> Result<[f64; 2], GridError> {
        self.sampling.ok_or(GridError::Undefined {
            missing: "sampling",
        })
    }

    pub fn defined_extent(&self) -> Result<[f64; 2], GridError> {
        self.extent.ok_or(GridError::Undefined { missing: "extent" })
    }

    /// Fail unless gpts, sampling and extent are all defined.
    pub fn check_is_defined(&self) -> Result<(), GridError> {
        self.defined_gpts()?;
        self.defined_sampling()?;
        self.defined_extent()?;
        Ok(())
    }

    pub fn set_extent(&mut self, extent: [f64; 2]) -> Result<(), GridError> {
        for value in extent {
            if !(value > 0.0) {
                return Err(GridError::NonPositive {
                    quantity: "extent",
                    value,
                });
            }
        }
        self.extent = Some(extent);
        if self.sampling.is_some() && !self.lock_gpts {
            self.adjust_gpts();
        }
        self.adjust_sampling();
        Ok(())
    }

    pub fn set_gpts(&mut self, gpts: [usize; 2]) -> Result<(), GridError> {
        if gpts[0] == 0 || gpts[1] == 0 {
            return Err(GridError::NonPositive {
                quantity: "gpts",
                value: 0.0,
            });
        }
        if self.lock_gpts {
            if let Some(current) = self.gpts {
                if current != gpts {
                    return Err(GridError::LockedGpts {
                        current,
                        requested: gpts,
                    });
                }
            }
        }
        self.gpts = Some(gpts);
        if self.extent.is_some() {
            self.adjust_sampling();
        } else if self.sampling.is_some() {
            self.adjust_extent();
        }
        Ok(())
    }

    pub fn set_sampling(&mut self, sampling: [f64; 2]) -> Result<(), GridError> {
        for value in sampling {
            if !(value > 0.0) {
                return Err(GridError::NonPositive {
                    quantity: "sampling",
                    value,
                });
            }
        }
        self.sampling = Some(sampling);
        if self.extent.is_some() && !self.lock_gpts {
            self.adjust_gpts();
        }
        if self.gpts.is_some() && self.extent.is_some() {
            self.adjust_sampling();
        } else {
            self.adjust_extent();
        }
        Ok(())
    }

    // extent and sampling known: derive gpts by rounding.
    fn adjust_gpts(&mut self) {
        if let (Some(extent), Some(sampling)) = (self.extent, self.sampling) {
            self.gpts = Some([
                ((extent[0] / sampling[0]).round() as usize).max(1),
                ((extent[1] / sampling[1]).round() as usize).max(1),
            ]);
        }
    }

    // extent and gpts known: recompute sampling so the invariant is exact.
    fn adjust_sampling(&mut self) {
        if let (Some(extent), Some(gpts)) = (self.extent, self.gpts) {
            self.sampling = Some([extent[0] / gpts[0] as f64, extent[1] / gpts[1] as f64]);
        }
    }

    // gpts and sampling known: recompute extent so the invariant is exact.
    fn adjust_extent(&mut self) {
        if let (Some(gpts), Some(sampling)) = (self.gpts, self.sampling) {
            self.extent = Some([gpts[0] as f64 * sampling[0], gpts[1] as f64 * sampling[1]]);
        }
    }

    /// True when both grids define gpts and sampling and they agree.
    pub fn is_compatible(&self, other: &Grid) -> bool {
        matches!((self.gpts, other.gpts), (Some(a), Some(b)) if a == b)
            && matches!(
                (self.sampling, other.sampling),
                (Some(a), Some(b)) if approx_eq(a[0], b[0]) && approx_eq(a[1], b[1])
            )
    }

    /// Adopt defined quantities from `other`, failing on conflicts.
    ///
    /// Only `self` is mutated; a conflict on a quantity both grids define is
    /// a [`GridError::Mismatch`], and adopting gpts into a locked grid with a
    /// different value is a [`GridError::LockedGpts`].
    pub fn match_with(&mut self, other: &Grid) -> Result<(), GridError> {
        if let (Some(a), Some(b)) = (self.extent, other.extent) {
            if !(approx_eq(a[0], b[0]) && approx_eq(a[1], b[1])) {
                return Err(GridError::Mismatch {
                    quantity: "extent",
                    left: format!("{a:?}"),
                    right: format!("{b:?}"),
                });
            }
        } else if let (None, Some(extent)) = (self.extent, other.extent) {
            self.set_extent(extent)?;
        }

        if let (Some(a), Some(b)) = (self.gpts, other.gpts) {
            if a != b {
                return Err(GridError::Mismatch {
                    quantity: "gpts",
                    left: format!("{a:?}"),
                    right: format!("{b:?}"),
                });
            }
        } else if let (None, Some(gpts)) = (self.gpts, other.gpts) {
            self.set_gpts(gpts)?;
        }

        if let (Some(a), Some(b)) = (self.sampling, other.sampling) {
            if !(approx_eq(a[0], b[0]) && approx_eq(a[1], b[1])) {
                return Err(GridError::Mismatch {
                    quantity: "sampling",
                    left: format!("{a:?}"),
                    right: format!("{b:?}"),
                });
            }
        } else if let (None, Some(sampling)) = (self.sampling, other.sampling) {
            self.set_sampling(sampling)?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derives_sampling_from_extent_and_gpts() {
        let grid = Grid::new(Some([6.4, 6.4]), Some([64, 64]), None).unwrap();
        assert_eq!(grid.gpts(), Some([64, 64]));
        assert_eq!(grid.sampling(), Some([0.1, 0.1]));
        assert_eq!(grid.extent(), Some([6.4, 6.4]));
    }

    #[test]
    fn derives_gpts_from_extent_and_sampling() {
        let grid = Grid::new(Some([6.4, 3.2]), None, Some([0.1, 0.1])).unwrap();
        assert_eq!(grid.gpts(), Some([64, 32]));
    }

    #[test]
    fn derives_extent_from_gpts_and_sampling() {
        let grid = Grid::new(None, Some([128, 64]), Some([0.05, 0.1])).unwrap();
        let extent = grid.extent().unwrap();
        assert!((extent[0] - 6.4).abs() < 1e-12);
        assert!((extent[1] - 6.4).abs() < 1e-12);
    }

    #[test]
    fn invariant_holds_for_all_construction_orders() {
        let grids = [
            Grid::new(Some([6.4, 6.4]), Some([64, 64]), None).unwrap(),
            Grid::new(Some([6.4, 6.4]), None, Some([0.1, 0.1])).unwrap(),
            Grid::new(None, Some([64, 64]), Some([0.1, 0.1])).unwrap(),
        ];
        for grid in grids {
            let gpts = grid.gpts().unwrap();
            let sampling = grid.sampling().unwrap();
            let extent = grid.extent().unwrap();
            for i in 0..2 {
                assert!(
                    (extent[i] - gpts[i] as f64 * sampling[i]).abs() < 1e-12,
                    "extent invariant violated: {extent:?} vs {gpts:?} * {sampling:?}"
                );
            }
        }
    }

    #[test]
    fn rejects_non_positive_quantities() {
        assert!(matches!(
            Grid::new(Some([0.0, 1.0]), None, None),
            Err(GridError::NonPositive { .. })
        ));
        let mut grid = Grid::default();
        assert!(grid.set_sampling([-0.1, 0.1]).is_err());
        assert!(grid.set_gpts([0, 4]).is_err());
    }

    #[test]
    fn check_is_defined_reports_missing_quantity() {
        let grid = Grid::new(None, Some([64, 64]), None).unwrap();
        assert_eq!(
            grid.check_is_defined(),
            Err(GridError::Undefined {
                missing: "sampling"
            })
        );
    }

    #[test]
    fn locked_gpts_cannot_change() {
        let grid = Grid::new(Some([6.4, 6.4]), Some([64, 64]), None)
            .unwrap()
            .lock_gpts();
        let mut grid = grid;
        assert!(matches!(
            grid.set_gpts([32, 32]),
            Err(GridError::LockedGpts { .. })
        ));
        assert!(grid.set_gpts([64, 64]).is_ok());
    }

    #[test]
    fn match_adopts_undefined_quantities() {
        let mut waves_grid = Grid::new(None, Some([64, 64]), None).unwrap().lock_gpts();
        let potential_grid = Grid::new(Some([6.4, 6.4]), Some([64, 64]), None).unwrap();
        waves_grid.match_with(&potential_grid).unwrap();
        assert_eq!(waves_grid.sampling(), Some([0.1, 0.1]));
        assert_eq!(waves_grid.extent(), Some([6.4, 6.4]));
    }

    #[test]
    fn match_fails_on_conflicting_gpts() {
        let mut left = Grid::new(Some([6.4, 6.4]), Some([64, 64]), None).unwrap();
        let right = Grid::new(Some([6.4, 6.4]), Some([32, 32]), None).unwrap();
        assert!(matches!(
            left.match_with(&right),
            Err(GridError::Mismatch { quantity: "gpts", .. })
        ));
    }

    #[test]
    fn compatible_requires_gpts_and_sampling_agreement() {
        let a = Grid::new(Some([6.4, 6.4]), Some([64, 64]), None).unwrap();
        let b = Grid::new(None, Some([64, 64]), Some([0.1, 0.1])).unwrap();
        let c = Grid::new(Some([6.4, 6.4]), Some([32, 32]), None).unwrap();
        assert!(a.is_compatible(&b));
        assert!(!a.is_compatible(&c));
    }
}
