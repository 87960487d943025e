use core::fmt;

use faer_core::mat;
use faer_core::MatMut;

/// Returned by a callback to end the solve early.
///
/// The solver stops with [`SolveStatus::UserStop`](crate::SolveStatus::UserStop)
/// and leaves the last accepted iterate in `x`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Stop;

impl fmt::Display for Stop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("solve stopped by callback")
    }
}

impl std::error::Error for Stop {}

/// Residual vector `r(x)` of a nonlinear system or least-squares problem.
pub trait Residuals {
    /// Fill `fvec` with `r(x)`.
    fn residuals(&mut self, x: &[f64], fvec: &mut [f64]) -> Result<(), Stop>;
}

/// Residuals together with an analytic Jacobian.
pub trait Problem: Residuals {
    /// Fill the Jacobian of `r` at `x`.
    ///
    /// `fvec` holds `r(x)` as computed by the most recent call to
    /// [`Residuals::residuals`] at the same `x`; analytic implementations can
    /// ignore it.
    fn jacobian(
        &mut self,
        x: &[f64],
        fvec: &[f64],
        jacobian: &mut JacobianMut<'_>,
    ) -> Result<(), Stop>;

    /// Residual evaluations spent inside one call to [`Problem::jacobian`].
    ///
    /// Counted against the evaluation budget of the solve.
    fn residual_evals_per_jacobian(&self, _n: usize) -> usize {
        0
    }
}

/// Residuals with a Jacobian produced one row at a time.
///
/// Used by the row-streaming least-squares driver. A solver built with
/// [`LmSolver::for_rows`](crate::LmSolver::for_rows) never stores more than
/// an `n x n` triangle of the Jacobian.
pub trait RowProblem: Residuals {
    /// Fill `fjrow` with row `row` of the Jacobian at `x`.
    fn jacobian_row(&mut self, x: &[f64], row: usize, fjrow: &mut [f64]) -> Result<(), Stop>;
}

impl<R: Residuals + ?Sized> Residuals for &mut R {
    fn residuals(&mut self, x: &[f64], fvec: &mut [f64]) -> Result<(), Stop> {
        (**self).residuals(x, fvec)
    }
}

impl<P: Problem + ?Sized> Problem for &mut P {
    fn jacobian(
        &mut self,
        x: &[f64],
        fvec: &[f64],
        jacobian: &mut JacobianMut<'_>,
    ) -> Result<(), Stop> {
        (**self).jacobian(x, fvec, jacobian)
    }

    fn residual_evals_per_jacobian(&self, n: usize) -> usize {
        (**self).residual_evals_per_jacobian(n)
    }
}

impl<P: RowProblem + ?Sized> RowProblem for &mut P {
    fn jacobian_row(&mut self, x: &[f64], row: usize, fjrow: &mut [f64]) -> Result<(), Stop> {
        (**self).jacobian_row(x, row, fjrow)
    }
}

/// Mutable column-major view of an `m x n` Jacobian.
pub struct JacobianMut<'a> {
    values: &'a mut [f64],
    nrows: usize,
    ncols: usize,
}

impl<'a> JacobianMut<'a> {
    pub(crate) fn new(values: &'a mut [f64], nrows: usize, ncols: usize) -> Self {
        debug_assert_eq!(values.len(), nrows * ncols);
        Self {
            values,
            nrows,
            ncols,
        }
    }

    /// Number of residuals (rows in J).
    pub fn nrows(&self) -> usize {
        self.nrows
    }

    /// Number of parameters (columns in J).
    pub fn ncols(&self) -> usize {
        self.ncols
    }

    /// Mutable values of column `col`, one per residual.
    pub fn col_mut(&mut self, col: usize) -> &mut [f64] {
        let start = col * self.nrows;
        &mut self.values[start..start + self.nrows]
    }

    /// Set entry `(row, col)`.
    pub fn set(&mut self, row: usize, col: usize, value: f64) {
        self.values[row + col * self.nrows] = value;
    }

    /// Set every entry to zero.
    pub fn fill_zero(&mut self) {
        self.values.fill(0.0);
    }

    /// The same storage as a faer matrix view.
    pub fn as_mat_mut(&mut self) -> MatMut<'_, f64> {
        mat::from_column_major_slice_mut::<f64>(&mut *self.values, self.nrows, self.ncols)
    }
}

/// Jacobian band structure: `lower` sub-diagonals and `upper` super-diagonals.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Band {
    pub lower: usize,
    pub upper: usize,
}

impl Band {
    /// Number of grouped evaluations that cover all `n` columns.
    pub fn groups(&self, n: usize) -> usize {
        (self.lower + self.upper + 1).min(n)
    }
}

/// Forward-difference Jacobian built from the residual function alone.
///
/// Column `j` is approximated as `(r(x + h e_j) - r(x)) / h` with
/// `h = sqrt(max(epsfcn, EPSILON)) * max(|x_j|, typical_j)`, or the bare
/// relative step when that product is zero. When an upper bound is given and
/// `x_j + h` would exceed it, the step is taken in the other direction.
///
/// With a [`Band`], columns whose rows do not overlap are perturbed together
/// and the Jacobian costs `band.groups(n)` evaluations instead of `n`.
pub struct ForwardDifference<R> {
    residuals: R,
    epsfcn: f64,
    band: Option<Band>,
    typical: Option<Vec<f64>>,
    upper: Option<Vec<f64>>,
    x_work: Vec<f64>,
    fvec_work: Vec<f64>,
}

impl<R: Residuals> ForwardDifference<R> {
    /// Wrap `residuals` with relative step `sqrt(EPSILON)`.
    pub fn new(residuals: R) -> Self {
        Self {
            residuals,
            epsfcn: 0.0,
            band: None,
            typical: None,
            upper: None,
            x_work: Vec::new(),
            fvec_work: Vec::new(),
        }
    }

    /// Relative error expected in the residuals; the step is `sqrt(epsfcn)`.
    pub fn with_epsfcn(mut self, epsfcn: f64) -> Self {
        self.epsfcn = epsfcn;
        self
    }

    /// Restrict the approximation to a banded Jacobian.
    pub fn with_band(mut self, band: Band) -> Self {
        self.band = Some(band);
        self
    }

    /// Typical magnitude of each variable, used as a floor for the step.
    pub fn with_typical(mut self, typical: Vec<f64>) -> Self {
        self.typical = Some(typical);
        self
    }

    /// Upper bounds the perturbed point must respect.
    pub fn with_upper_bounds(mut self, upper: Vec<f64>) -> Self {
        self.upper = Some(upper);
        self
    }

    /// Borrow the wrapped residual function.
    pub fn inner(&self) -> &R {
        &self.residuals
    }

    /// Unwrap the residual function.
    pub fn into_inner(self) -> R {
        self.residuals
    }

    fn step(&self, j: usize, xj: f64) -> f64 {
        let eps = self.epsfcn.max(f64::EPSILON).sqrt();
        let magnitude = match &self.typical {
            Some(typical) => xj.abs().max(typical[j].abs()),
            None => xj.abs(),
        };
        let mut h = eps * magnitude;
        if h == 0.0 {
            h = eps;
        }
        if let Some(upper) = &self.upper {
            if xj + h > upper[j] {
                h = -h;
            }
        }
        h
    }

    fn dense(
        &mut self,
        x: &[f64],
        fvec: &[f64],
        jacobian: &mut JacobianMut<'_>,
    ) -> Result<(), Stop> {
        let m = fvec.len();
        for j in 0..x.len() {
            let h = self.step(j, x[j]);
            self.x_work[j] = x[j] + h;
            let result = self.residuals.residuals(&self.x_work, &mut self.fvec_work);
            self.x_work[j] = x[j];
            result?;
            let col = jacobian.col_mut(j);
            for i in 0..m {
                col[i] = (self.fvec_work[i] - fvec[i]) / h;
            }
        }
        Ok(())
    }

    fn banded(
        &mut self,
        band: Band,
        x: &[f64],
        fvec: &[f64],
        jacobian: &mut JacobianMut<'_>,
    ) -> Result<(), Stop> {
        let n = x.len();
        let m = fvec.len();
        let stride = band.groups(n);
        for k in 0..stride {
            for j in (k..n).step_by(stride) {
                let h = self.step(j, x[j]);
                self.x_work[j] = x[j] + h;
            }
            let result = self.residuals.residuals(&self.x_work, &mut self.fvec_work);
            for j in (k..n).step_by(stride) {
                self.x_work[j] = x[j];
            }
            result?;
            for j in (k..n).step_by(stride) {
                let h = self.step(j, x[j]);
                let lo = j.saturating_sub(band.upper);
                let hi = (j + band.lower).min(m.saturating_sub(1));
                let col = jacobian.col_mut(j);
                for (i, value) in col.iter_mut().enumerate() {
                    *value = if i >= lo && i <= hi {
                        (self.fvec_work[i] - fvec[i]) / h
                    } else {
                        0.0
                    };
                }
            }
        }
        Ok(())
    }
}

impl<R: Residuals> Residuals for ForwardDifference<R> {
    fn residuals(&mut self, x: &[f64], fvec: &mut [f64]) -> Result<(), Stop> {
        self.residuals.residuals(x, fvec)
    }
}

impl<R: Residuals> Problem for ForwardDifference<R> {
    fn jacobian(
        &mut self,
        x: &[f64],
        fvec: &[f64],
        jacobian: &mut JacobianMut<'_>,
    ) -> Result<(), Stop> {
        self.x_work.clear();
        self.x_work.extend_from_slice(x);
        self.fvec_work.resize(fvec.len(), 0.0);
        match self.band {
            Some(band) if band.groups(x.len()) < x.len() => self.banded(band, x, fvec, jacobian),
            _ => self.dense(x, fvec, jacobian),
        }
    }

    fn residual_evals_per_jacobian(&self, n: usize) -> usize {
        match self.band {
            Some(band) => band.groups(n),
            None => n,
        }
    }
}
