//! Levenberg-Marquardt drivers for nonlinear least squares.
//!
//! All three drivers minimize `||r(x)||^2` over `x` in `R^n` for `m >= n`
//! residuals and differ only in how the Jacobian reaches the QR factor:
//! - [`LmSolver::solve`] (`lmder`): analytic `m x n` Jacobian.
//! - [`LmSolver::solve_numeric`] (`lmdif`): forward differences.
//! - [`LmSolver::solve_rows`] (`lmstr`): one row at a time, folded into an
//!   `n x n` triangle with Givens rotations.

use std::time::Instant;

use faer_core::{mat, Mat, MatRef};

use crate::linalg::{check_rank, covar, enorm, qrfac, rwupdt, SingularJacobian};
use crate::problem::{ForwardDifference, JacobianMut, Problem, Residuals, RowProblem, Stop};
use crate::report::{IterationReport, Reporter, SolveStatus, SolverStats, Tolerance};
use crate::solver::{
    check_len, default_max_fev, finish_stats, init_scale, settle, update_scale, LmOptions,
    ReporterSlot, SolverError,
};
use crate::step::lmpar;

const P1: f64 = 0.1;
const P5: f64 = 0.5;
const P25: f64 = 0.25;
const P75: f64 = 0.75;
const P0001: f64 = 1e-4;

/// Source of the factored Jacobian for one driver.
trait Factorize {
    fn residuals(&mut self, x: &[f64], fvec: &mut [f64]) -> Result<(), Stop>;

    /// Leaves R in the upper triangle of `ws.fjac`, `Q^T f` in `ws.qtf`, the
    /// permutation in `ws.ipvt` and the Jacobian column norms in
    /// `ws.acnorm`. Returns the residual evaluations it spent.
    fn factorize(&mut self, x: &[f64], ws: &mut LmSolver) -> Result<usize, Stop>;

    fn finite_differences(&self, n: usize) -> bool;

    /// Leading dimension of the Jacobian storage for `m` residuals.
    fn leading_dim(&self, m: usize, n: usize) -> usize;
}

struct Dense<'p, P>(&'p mut P);

struct Rows<'p, P>(&'p mut P);

/// Applies the Householder vectors below the diagonal of `a` to `b` and
/// restores the diagonal of R from `rdiag`.
fn apply_qt(rows: usize, n: usize, a: &mut [f64], lda: usize, rdiag: &[f64], b: &mut [f64]) {
    for j in 0..n {
        let jj = j + j * lda;
        if a[jj] != 0.0 {
            let mut sum = 0.0;
            for i in j..rows {
                sum += a[i + j * lda] * b[i];
            }
            let temp = -sum / a[jj];
            for i in j..rows {
                b[i] += a[i + j * lda] * temp;
            }
        }
        a[jj] = rdiag[j];
    }
}

impl<P: Problem> Factorize for Dense<'_, P> {
    fn residuals(&mut self, x: &[f64], fvec: &mut [f64]) -> Result<(), Stop> {
        self.0.residuals(x, fvec)
    }

    fn factorize(&mut self, x: &[f64], ws: &mut LmSolver) -> Result<usize, Stop> {
        let (m, n) = (ws.m, ws.n);
        {
            let mut jac = JacobianMut::new(&mut ws.fjac, m, n);
            self.0.jacobian(x, &ws.fvec, &mut jac)?;
        }
        qrfac(
            m,
            n,
            &mut ws.fjac,
            m,
            true,
            &mut ws.ipvt,
            &mut ws.rdiag,
            &mut ws.acnorm,
            &mut ws.wa1,
        );
        ws.fvec_trial.copy_from_slice(&ws.fvec);
        apply_qt(m, n, &mut ws.fjac, m, &ws.rdiag, &mut ws.fvec_trial);
        ws.qtf.copy_from_slice(&ws.fvec_trial[..n]);
        Ok(self.0.residual_evals_per_jacobian(n))
    }

    fn finite_differences(&self, n: usize) -> bool {
        self.0.residual_evals_per_jacobian(n) > 0
    }

    fn leading_dim(&self, m: usize, _n: usize) -> usize {
        m
    }
}

impl<P: RowProblem> Factorize for Rows<'_, P> {
    fn residuals(&mut self, x: &[f64], fvec: &mut [f64]) -> Result<(), Stop> {
        self.0.residuals(x, fvec)
    }

    fn factorize(&mut self, x: &[f64], ws: &mut LmSolver) -> Result<usize, Stop> {
        let (m, n, ld) = (ws.m, ws.n, ws.ld);
        ws.fjac.fill(0.0);
        ws.qtf.fill(0.0);
        for i in 0..m {
            self.0.jacobian_row(x, i, &mut ws.fjrow)?;
            let mut alpha = ws.fvec[i];
            rwupdt(
                n,
                &mut ws.fjac,
                ld,
                &ws.fjrow,
                &mut ws.qtf,
                &mut alpha,
                &mut ws.wa1,
                &mut ws.wa2,
            );
        }

        let mut sing = false;
        for j in 0..n {
            if ws.fjac[j + j * ld] == 0.0 {
                sing = true;
            }
            ws.ipvt[j] = j;
            ws.acnorm[j] = enorm(&ws.fjac[j * ld..j * ld + j + 1]);
        }
        // A zero pivot needs the pivoted factorization of R itself.
        if sing {
            qrfac(
                n,
                n,
                &mut ws.fjac,
                ld,
                true,
                &mut ws.ipvt,
                &mut ws.rdiag,
                &mut ws.acnorm,
                &mut ws.wa1,
            );
            apply_qt(n, n, &mut ws.fjac, ld, &ws.rdiag, &mut ws.qtf);
        }
        Ok(0)
    }

    fn finite_differences(&self, _n: usize) -> bool {
        false
    }

    fn leading_dim(&self, _m: usize, n: usize) -> usize {
        n
    }
}

struct Progress {
    nfev: usize,
    njev: usize,
    iterations: usize,
    fnorm: f64,
}

/// Dense Levenberg-Marquardt solver for `min ||r(x)||^2` with `m` residuals
/// and `n` variables.
///
/// Buffers are sized at construction and reused across solves. After a
/// solve, the accessors expose the final residuals and Jacobian factor.
///
/// The dense drivers keep the whole `m x n` Jacobian; the row driver only
/// needs its `n x n` triangle. A solver built with [`LmSolver::for_rows`]
/// allocates the triangle alone and grows on the first dense solve.
pub struct LmSolver {
    m: usize,
    n: usize,
    /// Leading dimension of `fjac`: `m` for dense solves, `n` for rows.
    ld: usize,
    fvec: Vec<f64>,
    fjac: Vec<f64>,
    diag: Vec<f64>,
    qtf: Vec<f64>,
    ipvt: Vec<usize>,
    rdiag: Vec<f64>,
    acnorm: Vec<f64>,
    step: Vec<f64>,
    sdiag: Vec<f64>,
    x_trial: Vec<f64>,
    fvec_trial: Vec<f64>,
    fjrow: Vec<f64>,
    wa1: Vec<f64>,
    wa2: Vec<f64>,
}

impl LmSolver {
    /// Create a solver for `m` residuals in `n` variables.
    pub fn new(m: usize, n: usize) -> Result<Self, SolverError> {
        Self::with_leading_dim(m, n, m)
    }

    /// Create a solver for [`LmSolver::solve_rows`] that stores only the
    /// `n x n` triangle of the Jacobian.
    pub fn for_rows(m: usize, n: usize) -> Result<Self, SolverError> {
        Self::with_leading_dim(m, n, n)
    }

    fn with_leading_dim(m: usize, n: usize, ld: usize) -> Result<Self, SolverError> {
        if n == 0 || m < n {
            return Err(SolverError::InvalidDimensions { m, n });
        }
        Ok(Self {
            m,
            n,
            ld,
            fvec: vec![0.0; m],
            fjac: vec![0.0; ld * n],
            diag: vec![0.0; n],
            qtf: vec![0.0; n],
            ipvt: (0..n).collect(),
            rdiag: vec![0.0; n],
            acnorm: vec![0.0; n],
            step: vec![0.0; n],
            sdiag: vec![0.0; n],
            x_trial: vec![0.0; n],
            fvec_trial: vec![0.0; m],
            fjrow: vec![0.0; n],
            wa1: vec![0.0; n],
            wa2: vec![0.0; n],
        })
    }

    /// Number of residuals.
    pub fn nrows(&self) -> usize {
        self.m
    }

    /// Number of variables.
    pub fn ncols(&self) -> usize {
        self.n
    }

    /// Minimize with an analytic Jacobian.
    pub fn solve<P: Problem>(
        &mut self,
        problem: &mut P,
        x: &mut [f64],
        options: &LmOptions,
        reporter: Option<&mut dyn Reporter>,
    ) -> Result<SolverStats, SolverError> {
        self.drive("lmder", &mut Dense(problem), x, options, reporter)
    }

    /// Minimize with a forward-difference Jacobian using `options.epsfcn`.
    ///
    /// For typical variable magnitudes or upper bounds on the difference
    /// step, configure a [`ForwardDifference`] around the residuals and pass
    /// it to [`LmSolver::solve`] instead.
    pub fn solve_numeric<R: Residuals>(
        &mut self,
        residuals: &mut R,
        x: &mut [f64],
        options: &LmOptions,
        reporter: Option<&mut dyn Reporter>,
    ) -> Result<SolverStats, SolverError> {
        let mut fd = ForwardDifference::new(residuals).with_epsfcn(options.epsfcn);
        self.drive("lmdif", &mut Dense(&mut fd), x, options, reporter)
    }

    /// Minimize with a Jacobian supplied one row at a time.
    pub fn solve_rows<P: RowProblem>(
        &mut self,
        problem: &mut P,
        x: &mut [f64],
        options: &LmOptions,
        reporter: Option<&mut dyn Reporter>,
    ) -> Result<SolverStats, SolverError> {
        self.drive("lmstr", &mut Rows(problem), x, options, reporter)
    }

    /// Residuals at the returned iterate.
    pub fn residuals(&self) -> &[f64] {
        &self.fvec
    }

    /// The Jacobian storage after the last factorization: `m x n` after a
    /// dense solve, `n x n` after a row solve.
    ///
    /// The upper triangle of the leading `n x n` block is R in
    /// `J P = Q R`, with P given by [`LmSolver::permutation`].
    pub fn factor(&self) -> MatRef<'_, f64> {
        mat::from_column_major_slice::<f64>(&self.fjac, self.ld, self.n)
    }

    /// `permutation()[j]` is the original column in position `j` of R.
    pub fn permutation(&self) -> &[usize] {
        &self.ipvt
    }

    /// First `n` entries of `Q^T r` from the last factorization.
    pub fn qtf(&self) -> &[f64] {
        &self.qtf
    }

    /// Scale factors in effect at the end of the solve.
    pub fn scale(&self) -> &[f64] {
        &self.diag
    }

    /// Numerical rank test on the diagonal of R from the last factorization.
    pub fn rank(&self) -> Result<(), SingularJacobian> {
        let ld = self.ld;
        let rdiag: Vec<f64> = (0..self.n).map(|j| self.fjac[j + j * ld]).collect();
        check_rank(&rdiag)
    }

    /// `(J^T J)^-1` from the last factorization, in the original variable
    /// order.
    ///
    /// Pivots at most `tol * |r_00|` are treated as zero; the corresponding
    /// rows and columns are zero. Multiply by `||r||^2 / (m - n)` for the
    /// usual parameter covariance estimate.
    pub fn covariance(&self, tol: f64) -> Mat<f64> {
        let (ld, n) = (self.ld, self.n);
        let mut r = self.fjac.clone();
        let mut wa = vec![0.0; n];
        covar(n, &mut r, ld, &self.ipvt, tol, &mut wa);
        let mut cov = Mat::<f64>::zeros(n, n);
        for j in 0..n {
            for i in 0..n {
                cov.write(i, j, r[i + j * ld]);
            }
        }
        cov
    }

    fn drive<F: Factorize>(
        &mut self,
        driver: &'static str,
        model: &mut F,
        x: &mut [f64],
        options: &LmOptions,
        reporter: Option<&mut dyn Reporter>,
    ) -> Result<SolverStats, SolverError> {
        check_len("x", self.n, x.len())?;
        options.validate(self.n)?;
        self.set_leading_dim(model.leading_dim(self.m, self.n));
        let max_fev = default_max_fev(options.max_fev, self.n, model.finite_differences(self.n));
        let start_time = options.verbose.then(Instant::now);
        let mut reporter = ReporterSlot::new(reporter, options.verbose);
        log::debug!("{driver}: m={} n={} max_fev={max_fev}", self.m, self.n);

        let mut progress = Progress {
            nfev: 0,
            njev: 0,
            iterations: 0,
            fnorm: f64::NAN,
        };
        let status = self.iterate(driver, model, x, options, max_fev, &mut progress, &mut reporter);
        let stats = SolverStats {
            status,
            iterations: progress.iterations,
            residual_evals: progress.nfev,
            jacobian_evals: progress.njev,
            fnorm: progress.fnorm,
        };
        Ok(finish_stats(driver, stats, start_time, &mut reporter))
    }

    fn set_leading_dim(&mut self, ld: usize) {
        if self.ld != ld {
            self.ld = ld;
            self.fjac.clear();
            self.fjac.resize(ld * self.n, 0.0);
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn iterate<F: Factorize>(
        &mut self,
        driver: &'static str,
        model: &mut F,
        x: &mut [f64],
        options: &LmOptions,
        max_fev: usize,
        progress: &mut Progress,
        reporter: &mut ReporterSlot<'_>,
    ) -> SolveStatus {
        let (ld, n) = (self.ld, self.n);
        let epsmch = f64::EPSILON;

        progress.nfev = 1;
        if model.residuals(x, &mut self.fvec).is_err() {
            return SolveStatus::UserStop;
        }
        let mut fnorm = enorm(&self.fvec);
        progress.fnorm = fnorm;
        if !fnorm.is_finite() {
            return SolveStatus::NumericalFailure;
        }
        if progress.nfev >= max_fev {
            return SolveStatus::MaxEvaluations;
        }

        let mut par = 0.0;
        let mut delta = 0.0;
        let mut xnorm = 0.0;
        let mut first = true;
        let mut always_singular = true;

        loop {
            match model.factorize(x, self) {
                Ok(evals) => progress.nfev += evals,
                Err(Stop) => return SolveStatus::UserStop,
            }
            progress.njev += 1;
            if !(all_finite(&self.acnorm) && all_finite(&self.qtf)) {
                return SolveStatus::NumericalFailure;
            }

            for j in 0..n {
                self.rdiag[j] = self.fjac[j + j * ld];
            }
            match check_rank(&self.rdiag) {
                Ok(()) => always_singular = false,
                Err(err) => log::trace!("{driver}: {err}"),
            }

            if first {
                init_scale(&options.scaling, &mut self.diag, &self.acnorm);
                for j in 0..n {
                    self.wa1[j] = self.diag[j] * x[j];
                }
                xnorm = enorm(&self.wa1);
                delta = options.factor * xnorm;
                if delta == 0.0 {
                    delta = options.factor;
                }
            }

            // Largest cosine between the residual and a Jacobian column.
            let mut gnorm = 0.0_f64;
            if fnorm != 0.0 {
                for j in 0..n {
                    let l = self.ipvt[j];
                    if self.acnorm[l] != 0.0 {
                        let mut sum = 0.0;
                        for i in 0..=j {
                            sum += self.fjac[i + j * ld] * (self.qtf[i] / fnorm);
                        }
                        let cosine = (sum / self.acnorm[l]).abs();
                        gnorm = if cosine.is_nan() { cosine } else { gnorm.max(cosine) };
                    }
                }
            }
            if gnorm.is_nan() {
                return SolveStatus::NumericalFailure;
            }
            if gnorm <= options.gtol {
                return SolveStatus::ConvergedGradient;
            }

            update_scale(&options.scaling, &mut self.diag, &self.acnorm);

            loop {
                par = lmpar(
                    n,
                    &mut self.fjac,
                    ld,
                    &self.ipvt,
                    &self.diag,
                    &self.qtf,
                    delta,
                    par,
                    &mut self.step,
                    &mut self.sdiag,
                    &mut self.wa1,
                    &mut self.wa2,
                );

                for j in 0..n {
                    self.step[j] = -self.step[j];
                    self.x_trial[j] = x[j] + self.step[j];
                    self.wa1[j] = self.diag[j] * self.step[j];
                }
                let pnorm = enorm(&self.wa1);
                if first {
                    delta = delta.min(pnorm);
                }

                progress.nfev += 1;
                if model.residuals(&self.x_trial, &mut self.fvec_trial).is_err() {
                    return SolveStatus::UserStop;
                }
                let fnorm1 = enorm(&self.fvec_trial);

                let mut actred = -1.0;
                if P1 * fnorm1 < fnorm {
                    let q = fnorm1 / fnorm;
                    actred = 1.0 - q * q;
                }

                // Predicted reduction and directional derivative from R p.
                for j in 0..n {
                    self.wa1[j] = 0.0;
                    let temp = self.step[self.ipvt[j]];
                    for i in 0..=j {
                        self.wa1[i] += self.fjac[i + j * ld] * temp;
                    }
                }
                let temp1 = enorm(&self.wa1) / fnorm;
                let temp2 = (par.sqrt() * pnorm) / fnorm;
                let prered = temp1 * temp1 + temp2 * temp2 / P5;
                let dirder = -(temp1 * temp1 + temp2 * temp2);
                let ratio = if prered != 0.0 { actred / prered } else { 0.0 };

                if ratio <= P25 {
                    let mut temp = if actred >= 0.0 {
                        P5
                    } else {
                        P5 * dirder / (dirder + P5 * actred)
                    };
                    if P1 * fnorm1 >= fnorm || temp < P1 {
                        temp = P1;
                    }
                    delta = temp * delta.min(pnorm / P1);
                    par /= temp;
                } else if par == 0.0 || ratio >= P75 {
                    delta = pnorm / P5;
                    par *= P5;
                }

                let accepted = ratio >= P0001 && fnorm1.is_finite();
                log::trace!(
                    "{driver}: fnorm={fnorm:.6e} trial={fnorm1:.6e} ratio={ratio:.4} delta={delta:.3e} par={par:.3e}"
                );
                if let Some(reporter) = reporter.as_mut() {
                    reporter.on_iteration(&IterationReport {
                        iteration: progress.iterations,
                        fnorm,
                        trial_fnorm: fnorm1,
                        ratio,
                        delta,
                        par,
                        step_norm: pnorm,
                        gnorm: Some(gnorm),
                        accepted,
                    });
                }

                if accepted {
                    x.copy_from_slice(&self.x_trial);
                    self.fvec.copy_from_slice(&self.fvec_trial);
                    for j in 0..n {
                        self.wa2[j] = self.diag[j] * x[j];
                    }
                    xnorm = enorm(&self.wa2);
                    fnorm = fnorm1;
                    progress.fnorm = fnorm;
                    progress.iterations += 1;
                    first = false;
                }

                let ftol_met =
                    actred.abs() <= options.ftol && prered <= options.ftol && P5 * ratio <= 1.0;
                let xtol_met = delta <= options.xtol * xnorm;
                match (ftol_met, xtol_met) {
                    (true, true) => return SolveStatus::ConvergedResidualAndStep,
                    (true, false) => return SolveStatus::ConvergedResidual,
                    (false, true) => return SolveStatus::ConvergedStep,
                    (false, false) => {}
                }

                let failure = if gnorm <= epsmch {
                    Some(SolveStatus::ToleranceTooSmall(Tolerance::Gradient))
                } else if delta <= epsmch * xnorm {
                    Some(SolveStatus::ToleranceTooSmall(Tolerance::Step))
                } else if actred.abs() <= epsmch && prered <= epsmch && P5 * ratio <= 1.0 {
                    Some(SolveStatus::ToleranceTooSmall(Tolerance::Residual))
                } else if progress.nfev >= max_fev {
                    Some(SolveStatus::MaxEvaluations)
                } else {
                    None
                };
                if let Some(status) = failure {
                    return settle(status, always_singular);
                }

                if accepted {
                    break;
                }
            }
        }
    }
}

fn all_finite(values: &[f64]) -> bool {
    values.iter().all(|v| v.is_finite())
}

/// Result of a single-call least-squares driver.
pub struct LmSolution {
    pub stats: SolverStats,
    solver: LmSolver,
}

impl LmSolution {
    /// Residuals at the returned iterate.
    pub fn residuals(&self) -> &[f64] {
        self.solver.residuals()
    }

    /// See [`LmSolver::factor`].
    pub fn factor(&self) -> MatRef<'_, f64> {
        self.solver.factor()
    }

    /// See [`LmSolver::permutation`].
    pub fn permutation(&self) -> &[usize] {
        self.solver.permutation()
    }

    /// See [`LmSolver::qtf`].
    pub fn qtf(&self) -> &[f64] {
        self.solver.qtf()
    }

    /// See [`LmSolver::scale`].
    pub fn scale(&self) -> &[f64] {
        self.solver.scale()
    }

    /// See [`LmSolver::rank`].
    pub fn rank(&self) -> Result<(), SingularJacobian> {
        self.solver.rank()
    }

    /// See [`LmSolver::covariance`].
    pub fn covariance(&self, tol: f64) -> Mat<f64> {
        self.solver.covariance(tol)
    }

    /// Recover the solver and its buffers for another solve.
    pub fn into_solver(self) -> LmSolver {
        self.solver
    }
}

/// Least squares with an analytic Jacobian and full control over options.
pub fn lmder<P: Problem>(
    problem: &mut P,
    m: usize,
    x: &mut [f64],
    options: &LmOptions,
) -> Result<LmSolution, SolverError> {
    let mut solver = LmSolver::new(m, x.len())?;
    let stats = solver.solve(problem, x, options, None)?;
    Ok(LmSolution { stats, solver })
}

/// [`lmder`] with `ftol = xtol = tol` and default everything else.
pub fn lmder1<P: Problem>(
    problem: &mut P,
    m: usize,
    x: &mut [f64],
    tol: f64,
) -> Result<LmSolution, SolverError> {
    lmder(problem, m, x, &LmOptions::with_tolerance(tol))
}

/// Least squares with a forward-difference Jacobian.
pub fn lmdif<R: Residuals>(
    residuals: &mut R,
    m: usize,
    x: &mut [f64],
    options: &LmOptions,
) -> Result<LmSolution, SolverError> {
    let mut solver = LmSolver::new(m, x.len())?;
    let stats = solver.solve_numeric(residuals, x, options, None)?;
    Ok(LmSolution { stats, solver })
}

/// [`lmdif`] with `ftol = xtol = tol` and default everything else.
pub fn lmdif1<R: Residuals>(
    residuals: &mut R,
    m: usize,
    x: &mut [f64],
    tol: f64,
) -> Result<LmSolution, SolverError> {
    lmdif(residuals, m, x, &LmOptions::with_tolerance(tol))
}

/// Least squares with Jacobian rows computed one at a time.
pub fn lmstr<P: RowProblem>(
    problem: &mut P,
    m: usize,
    x: &mut [f64],
    options: &LmOptions,
) -> Result<LmSolution, SolverError> {
    let mut solver = LmSolver::for_rows(m, x.len())?;
    let stats = solver.solve_rows(problem, x, options, None)?;
    Ok(LmSolution { stats, solver })
}

/// [`lmstr`] with `ftol = xtol = tol` and default everything else.
pub fn lmstr1<P: RowProblem>(
    problem: &mut P,
    m: usize,
    x: &mut [f64],
    tol: f64,
) -> Result<LmSolution, SolverError> {
    lmstr(problem, m, x, &LmOptions::with_tolerance(tol))
}
