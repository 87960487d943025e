//! Powell hybrid (dogleg) drivers for square nonlinear systems `r(x) = 0`.

use std::time::Instant;

use faer_core::{mat, Mat, MatRef};

use crate::linalg::{
    check_rank, enorm, packed_diag, qform, qrfac, r1mpyq, r1updt, SingularJacobian,
};
use crate::problem::{ForwardDifference, JacobianMut, Problem, Residuals};
use crate::report::{IterationReport, Reporter, SolveStatus, SolverStats, Stall, Tolerance};
use crate::solver::{
    check_len, default_max_fev, finish_stats, init_scale, settle, update_scale, HybridOptions,
    ReporterSlot, SolverError,
};
use crate::step::dogleg;

const P1: f64 = 0.1;
const P5: f64 = 0.5;
const P001: f64 = 0.001;
const P0001: f64 = 1e-4;

struct Progress {
    nfev: usize,
    njev: usize,
    iterations: usize,
    fnorm: f64,
}

/// Solver for `n` equations in `n` unknowns.
///
/// The Jacobian is factored as `J = Q R` once per evaluation and then kept
/// current with Broyden rank-one updates of Q and R until two consecutive
/// steps fail, at which point it is evaluated again.
pub struct HybridSolver {
    n: usize,
    fvec: Vec<f64>,
    fjac: Vec<f64>,
    r: Vec<f64>,
    qtf: Vec<f64>,
    diag: Vec<f64>,
    ipvt: Vec<usize>,
    rdiag: Vec<f64>,
    acnorm: Vec<f64>,
    step: Vec<f64>,
    x_trial: Vec<f64>,
    fvec_trial: Vec<f64>,
    wa1: Vec<f64>,
    wa2: Vec<f64>,
    wa3: Vec<f64>,
}

impl HybridSolver {
    /// Create a solver for a system of `n` equations.
    pub fn new(n: usize) -> Result<Self, SolverError> {
        if n == 0 {
            return Err(SolverError::InvalidDimensions { m: n, n });
        }
        Ok(Self {
            n,
            fvec: vec![0.0; n],
            fjac: vec![0.0; n * n],
            r: vec![0.0; n * (n + 1) / 2],
            qtf: vec![0.0; n],
            diag: vec![0.0; n],
            ipvt: (0..n).collect(),
            rdiag: vec![0.0; n],
            acnorm: vec![0.0; n],
            step: vec![0.0; n],
            x_trial: vec![0.0; n],
            fvec_trial: vec![0.0; n],
            wa1: vec![0.0; n],
            wa2: vec![0.0; n],
            wa3: vec![0.0; n],
        })
    }

    /// Number of equations and unknowns.
    pub fn dim(&self) -> usize {
        self.n
    }

    /// Solve with an analytic Jacobian.
    pub fn solve<P: Problem>(
        &mut self,
        problem: &mut P,
        x: &mut [f64],
        options: &HybridOptions,
        reporter: Option<&mut dyn Reporter>,
    ) -> Result<SolverStats, SolverError> {
        self.drive("hybrj", problem, x, options, reporter)
    }

    /// Solve with a forward-difference Jacobian, banded when `options.band`
    /// is set.
    ///
    /// For typical variable magnitudes or upper bounds on the difference
    /// step, configure a [`ForwardDifference`] around the residuals and pass
    /// it to [`HybridSolver::solve`] instead.
    pub fn solve_numeric<R: Residuals>(
        &mut self,
        residuals: &mut R,
        x: &mut [f64],
        options: &HybridOptions,
        reporter: Option<&mut dyn Reporter>,
    ) -> Result<SolverStats, SolverError> {
        let mut fd = ForwardDifference::new(residuals).with_epsfcn(options.epsfcn);
        if let Some(band) = options.band {
            fd = fd.with_band(band);
        }
        self.drive("hybrd", &mut fd, x, options, reporter)
    }

    /// Residuals at the returned iterate.
    pub fn residuals(&self) -> &[f64] {
        &self.fvec
    }

    /// Orthogonal factor Q of the final (possibly updated) Jacobian.
    pub fn q(&self) -> MatRef<'_, f64> {
        mat::from_column_major_slice::<f64>(&self.fjac, self.n, self.n)
    }

    /// Upper triangle of R packed by rows.
    pub fn r_packed(&self) -> &[f64] {
        &self.r
    }

    /// R as a dense upper triangular matrix.
    pub fn r(&self) -> Mat<f64> {
        let n = self.n;
        let mut r = Mat::<f64>::zeros(n, n);
        for i in 0..n {
            let row = packed_diag(n, i);
            for j in i..n {
                r.write(i, j, self.r[row + j - i]);
            }
        }
        r
    }

    /// `Q^T r` as kept by the last factorization or Broyden update.
    pub fn qtf(&self) -> &[f64] {
        &self.qtf
    }

    /// Scale factors in effect at the end of the solve.
    pub fn scale(&self) -> &[f64] {
        &self.diag
    }

    /// Numerical rank test on the diagonal of the final R.
    pub fn rank(&self) -> Result<(), SingularJacobian> {
        let n = self.n;
        let rdiag: Vec<f64> = (0..n).map(|j| self.r[packed_diag(n, j)]).collect();
        check_rank(&rdiag)
    }

    fn drive<P: Problem>(
        &mut self,
        driver: &'static str,
        problem: &mut P,
        x: &mut [f64],
        options: &HybridOptions,
        reporter: Option<&mut dyn Reporter>,
    ) -> Result<SolverStats, SolverError> {
        check_len("x", self.n, x.len())?;
        options.validate(self.n)?;
        let finite_differences = problem.residual_evals_per_jacobian(self.n) > 0;
        let max_fev = default_max_fev(options.max_fev, self.n, finite_differences);
        let start_time = options.verbose.then(Instant::now);
        let mut reporter = ReporterSlot::new(reporter, options.verbose);
        log::debug!("{driver}: n={} max_fev={max_fev}", self.n);

        let mut progress = Progress {
            nfev: 0,
            njev: 0,
            iterations: 0,
            fnorm: f64::NAN,
        };
        let status = self.iterate(driver, problem, x, options, max_fev, &mut progress, &mut reporter);
        let stats = SolverStats {
            status,
            iterations: progress.iterations,
            residual_evals: progress.nfev,
            jacobian_evals: progress.njev,
            fnorm: progress.fnorm,
        };
        Ok(finish_stats(driver, stats, start_time, &mut reporter))
    }

    #[allow(clippy::too_many_arguments)]
    fn iterate<P: Problem>(
        &mut self,
        driver: &'static str,
        problem: &mut P,
        x: &mut [f64],
        options: &HybridOptions,
        max_fev: usize,
        progress: &mut Progress,
        reporter: &mut ReporterSlot<'_>,
    ) -> SolveStatus {
        let n = self.n;
        let epsmch = f64::EPSILON;

        progress.nfev = 1;
        if problem.residuals(x, &mut self.fvec).is_err() {
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

        let mut delta = 0.0;
        let mut xnorm = 0.0;
        let mut first = true;
        let mut always_singular = true;
        let mut ncsuc = 0;
        let mut ncfail = 0;
        let mut nslow1 = 0;
        let mut nslow2 = 0;

        loop {
            let mut jeval = true;

            {
                let mut jac = JacobianMut::new(&mut self.fjac, n, n);
                if problem.jacobian(x, &self.fvec, &mut jac).is_err() {
                    return SolveStatus::UserStop;
                }
            }
            progress.nfev += problem.residual_evals_per_jacobian(n);
            progress.njev += 1;
            if self.fjac.iter().any(|v| !v.is_finite()) {
                return SolveStatus::NumericalFailure;
            }

            qrfac(
                n,
                n,
                &mut self.fjac,
                n,
                false,
                &mut self.ipvt,
                &mut self.rdiag,
                &mut self.acnorm,
                &mut self.wa3,
            );
            match check_rank(&self.rdiag) {
                Ok(()) => always_singular = false,
                Err(err) => log::trace!("{driver}: {err}"),
            }

            if first {
                init_scale(&options.scaling, &mut self.diag, &self.acnorm);
                for j in 0..n {
                    self.wa3[j] = self.diag[j] * x[j];
                }
                xnorm = enorm(&self.wa3);
                delta = options.factor * xnorm;
                if delta == 0.0 {
                    delta = options.factor;
                }
            }

            self.qtf.copy_from_slice(&self.fvec);
            for j in 0..n {
                let jj = j + j * n;
                if self.fjac[jj] != 0.0 {
                    let mut sum = 0.0;
                    for i in j..n {
                        sum += self.fjac[i + j * n] * self.qtf[i];
                    }
                    let temp = -sum / self.fjac[jj];
                    for i in j..n {
                        self.qtf[i] += self.fjac[i + j * n] * temp;
                    }
                }
            }

            for j in 0..n {
                for i in 0..j {
                    self.r[packed_diag(n, i) + j - i] = self.fjac[i + j * n];
                }
                self.r[packed_diag(n, j)] = self.rdiag[j];
            }
            qform(n, n, &mut self.fjac, n, &mut self.wa3);

            update_scale(&options.scaling, &mut self.diag, &self.acnorm);

            loop {
                dogleg(
                    n,
                    &self.r,
                    &self.diag,
                    &self.qtf,
                    delta,
                    &mut self.step,
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
                if problem.residuals(&self.x_trial, &mut self.fvec_trial).is_err() {
                    return SolveStatus::UserStop;
                }
                let fnorm1 = enorm(&self.fvec_trial);

                let mut actred = -1.0;
                if fnorm1 < fnorm {
                    let q = fnorm1 / fnorm;
                    actred = 1.0 - q * q;
                }

                // Residual of the linear model, Q^T f + R p.
                let mut l = 0;
                for i in 0..n {
                    let mut sum = 0.0;
                    for j in i..n {
                        sum += self.r[l] * self.step[j];
                        l += 1;
                    }
                    self.wa3[i] = self.qtf[i] + sum;
                }
                let model_norm = enorm(&self.wa3);
                let mut prered = 0.0;
                if model_norm < fnorm {
                    let q = model_norm / fnorm;
                    prered = 1.0 - q * q;
                }
                let ratio = if prered > 0.0 { actred / prered } else { 0.0 };

                if ratio < P1 {
                    ncsuc = 0;
                    ncfail += 1;
                    delta *= P5;
                } else {
                    ncfail = 0;
                    ncsuc += 1;
                    if ratio >= P5 || ncsuc > 1 {
                        delta = delta.max(pnorm / P5);
                    }
                    if (ratio - 1.0).abs() <= P1 {
                        delta = pnorm / P5;
                    }
                }

                let accepted = ratio >= P0001 && fnorm1.is_finite();
                log::trace!(
                    "{driver}: fnorm={fnorm:.6e} trial={fnorm1:.6e} ratio={ratio:.4} delta={delta:.3e} jeval={jeval}"
                );
                if let Some(reporter) = reporter.as_mut() {
                    reporter.on_iteration(&IterationReport {
                        iteration: progress.iterations,
                        fnorm,
                        trial_fnorm: fnorm1,
                        ratio,
                        delta,
                        par: 0.0,
                        step_norm: pnorm,
                        gnorm: None,
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

                nslow1 += 1;
                if actred >= P001 {
                    nslow1 = 0;
                }
                if jeval {
                    nslow2 += 1;
                }
                if actred >= P1 {
                    nslow2 = 0;
                }

                if delta <= options.xtol * xnorm || fnorm == 0.0 {
                    return SolveStatus::ConvergedStep;
                }
                let failure = if nslow1 == 10 {
                    Some(SolveStatus::NoProgress(Stall::Iterations))
                } else if nslow2 == 5 {
                    Some(SolveStatus::NoProgress(Stall::Jacobian))
                } else if P1 * (P1 * delta).max(pnorm) <= epsmch * xnorm {
                    Some(SolveStatus::ToleranceTooSmall(Tolerance::Step))
                } else if progress.nfev >= max_fev {
                    Some(SolveStatus::MaxEvaluations)
                } else {
                    None
                };
                if let Some(status) = failure {
                    return settle(status, always_singular);
                }

                if ncfail == 2 {
                    break;
                }
                // A non-finite trial carries no secant information.
                if !fnorm1.is_finite() {
                    jeval = false;
                    continue;
                }

                // Broyden rank-one update of Q R and Q^T f.
                for j in 0..n {
                    let mut sum = 0.0;
                    for i in 0..n {
                        sum += self.fjac[i + j * n] * self.fvec_trial[i];
                    }
                    self.wa2[j] = (sum - self.wa3[j]) / pnorm;
                    self.wa1[j] = self.diag[j] * ((self.diag[j] * self.step[j]) / pnorm);
                    if accepted {
                        self.qtf[j] = sum;
                    }
                }
                if r1updt(n, n, &mut self.r, &self.wa1, &mut self.wa2, &mut self.wa3) {
                    log::trace!("{driver}: updated factor is singular");
                }
                r1mpyq(n, n, &mut self.fjac, n, &self.wa2, &self.wa3);
                r1mpyq(1, n, &mut self.qtf, 1, &self.wa2, &self.wa3);

                jeval = false;
            }
        }
    }
}

/// Result of a single-call hybrid driver.
pub struct HybridSolution {
    pub stats: SolverStats,
    solver: HybridSolver,
}

impl HybridSolution {
    /// Residuals at the returned iterate.
    pub fn residuals(&self) -> &[f64] {
        self.solver.residuals()
    }

    /// See [`HybridSolver::q`].
    pub fn q(&self) -> MatRef<'_, f64> {
        self.solver.q()
    }

    /// See [`HybridSolver::r_packed`].
    pub fn r_packed(&self) -> &[f64] {
        self.solver.r_packed()
    }

    /// See [`HybridSolver::r`].
    pub fn r(&self) -> Mat<f64> {
        self.solver.r()
    }

    /// See [`HybridSolver::qtf`].
    pub fn qtf(&self) -> &[f64] {
        self.solver.qtf()
    }

    /// See [`HybridSolver::scale`].
    pub fn scale(&self) -> &[f64] {
        self.solver.scale()
    }

    /// See [`HybridSolver::rank`].
    pub fn rank(&self) -> Result<(), SingularJacobian> {
        self.solver.rank()
    }

    /// Recover the solver and its buffers for another solve.
    pub fn into_solver(self) -> HybridSolver {
        self.solver
    }
}

/// Root of `n` equations with a forward-difference Jacobian.
pub fn hybrd<R: Residuals>(
    residuals: &mut R,
    x: &mut [f64],
    options: &HybridOptions,
) -> Result<HybridSolution, SolverError> {
    let mut solver = HybridSolver::new(x.len())?;
    let stats = solver.solve_numeric(residuals, x, options, None)?;
    Ok(HybridSolution { stats, solver })
}

/// [`hybrd`] with `xtol = tol`, a dense Jacobian and unit scaling.
pub fn hybrd1<R: Residuals>(
    residuals: &mut R,
    x: &mut [f64],
    tol: f64,
) -> Result<HybridSolution, SolverError> {
    let options = HybridOptions::with_tolerance(tol, x.len());
    hybrd(residuals, x, &options)
}

/// Root of `n` equations with an analytic Jacobian.
pub fn hybrj<P: Problem>(
    problem: &mut P,
    x: &mut [f64],
    options: &HybridOptions,
) -> Result<HybridSolution, SolverError> {
    let mut solver = HybridSolver::new(x.len())?;
    let stats = solver.solve(problem, x, options, None)?;
    Ok(HybridSolution { stats, solver })
}

/// [`hybrj`] with `xtol = tol` and unit scaling.
pub fn hybrj1<P: Problem>(
    problem: &mut P,
    x: &mut [f64],
    tol: f64,
) -> Result<HybridSolution, SolverError> {
    let options = HybridOptions::with_tolerance(tol, x.len());
    hybrj(problem, x, &options)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::problem::Stop;
    use approx::assert_relative_eq;

    // x^2 + y^2 = 4, x = y.
    struct Circle;

    impl Residuals for Circle {
        fn residuals(&mut self, x: &[f64], fvec: &mut [f64]) -> Result<(), Stop> {
            fvec[0] = x[0] * x[0] + x[1] * x[1] - 4.0;
            fvec[1] = x[0] - x[1];
            Ok(())
        }
    }

    impl Problem for Circle {
        fn jacobian(
            &mut self,
            x: &[f64],
            _fvec: &[f64],
            jacobian: &mut JacobianMut<'_>,
        ) -> Result<(), Stop> {
            jacobian.set(0, 0, 2.0 * x[0]);
            jacobian.set(0, 1, 2.0 * x[1]);
            jacobian.set(1, 0, 1.0);
            jacobian.set(1, 1, -1.0);
            Ok(())
        }
    }

    #[test]
    fn finds_root_and_keeps_factor_consistent() {
        let mut solver = HybridSolver::new(2).unwrap();
        let mut x = [1.0, 0.5];
        let stats = solver
            .solve(&mut Circle, &mut x, &HybridOptions::default(), None)
            .unwrap();
        assert_eq!(stats.status, SolveStatus::ConvergedStep);
        let root = 2.0_f64.sqrt();
        assert_relative_eq!(x[0], root, max_relative = 1e-8);
        assert_relative_eq!(x[1], root, max_relative = 1e-8);

        // Q stays orthogonal through the Broyden updates.
        let q = solver.q();
        for a in 0..2 {
            for b in 0..2 {
                let dot: f64 = (0..2).map(|i| q.read(i, a) * q.read(i, b)).sum();
                let expected = if a == b { 1.0 } else { 0.0 };
                assert!((dot - expected).abs() < 1e-10);
            }
        }
        assert_eq!(solver.r().read(1, 0), 0.0);
    }

    #[test]
    fn rejects_empty_system() {
        assert!(HybridSolver::new(0).is_err());
    }

    #[test]
    fn budget_of_one_stops_after_first_evaluation() {
        let mut x = [1.0, 0.5];
        let options = HybridOptions {
            max_fev: Some(1),
            ..HybridOptions::default()
        };
        let solution = hybrj(&mut Circle, &mut x, &options).unwrap();
        assert_eq!(solution.stats.status, SolveStatus::MaxEvaluations);
        assert_eq!(solution.stats.residual_evals, 1);
        assert_eq!(solution.stats.jacobian_evals, 0);
        assert_eq!(x, [1.0, 0.5]);
    }
}
