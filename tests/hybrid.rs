use approx::assert_relative_eq;
use minpack_rs::{
    enorm, hybrd, hybrd1, hybrj, hybrj1, Band, HybridOptions, HybridSolver, IterationReport,
    JacobianMut, Problem, Reporter, Residuals, SolveStatus, Stall, Stop,
};

struct FnProblem<R, J> {
    res: R,
    jac: J,
}

impl<R, J> Residuals for FnProblem<R, J>
where
    R: FnMut(&[f64], &mut [f64]),
{
    fn residuals(&mut self, x: &[f64], fvec: &mut [f64]) -> Result<(), Stop> {
        (self.res)(x, fvec);
        Ok(())
    }
}

impl<R, J> Problem for FnProblem<R, J>
where
    R: FnMut(&[f64], &mut [f64]),
    J: FnMut(&[f64], &mut JacobianMut<'_>),
{
    fn jacobian(
        &mut self,
        x: &[f64],
        _fvec: &[f64],
        jacobian: &mut JacobianMut<'_>,
    ) -> Result<(), Stop> {
        (self.jac)(x, jacobian);
        Ok(())
    }
}

struct FnResiduals<R>(R);

impl<R> Residuals for FnResiduals<R>
where
    R: FnMut(&[f64], &mut [f64]),
{
    fn residuals(&mut self, x: &[f64], fvec: &mut [f64]) -> Result<(), Stop> {
        (self.0)(x, fvec);
        Ok(())
    }
}

fn polynomial(x: &[f64], out: &mut [f64]) {
    out[0] = x[0] * x[0] - 4.0;
    out[1] = x[0] * x[1] - 6.0;
    out[2] = x[2] * x[2] * x[2] - 8.0;
}

fn polynomial_jacobian(x: &[f64], jac: &mut JacobianMut<'_>) {
    jac.fill_zero();
    jac.set(0, 0, 2.0 * x[0]);
    jac.set(1, 0, x[1]);
    jac.set(1, 1, x[0]);
    jac.set(2, 2, 3.0 * x[2] * x[2]);
}

fn broyden_tridiagonal(x: &[f64], out: &mut [f64]) {
    let n = x.len();
    for i in 0..n {
        let left = if i > 0 { x[i - 1] } else { 0.0 };
        let right = if i + 1 < n { x[i + 1] } else { 0.0 };
        out[i] = (3.0 - 2.0 * x[i]) * x[i] - left - 2.0 * right + 1.0;
    }
}

fn assert_root(x: &[f64], expected: &[f64]) {
    for (xi, ei) in x.iter().zip(expected) {
        assert_relative_eq!(*xi, *ei, max_relative = 1e-8);
    }
}

#[test]
fn polynomial_root_with_analytic_jacobian() {
    let mut problem = FnProblem {
        res: polynomial,
        jac: polynomial_jacobian,
    };
    let mut x = vec![1.0, 1.0, 1.0];
    let solution = hybrj1(&mut problem, &mut x, 1e-10).unwrap();
    assert_eq!(solution.stats.status, SolveStatus::ConvergedStep);
    assert_root(&x, &[2.0, 3.0, 2.0]);
    assert!(enorm(solution.residuals()) <= 1e-8);
    assert_eq!(solution.scale(), &[1.0, 1.0, 1.0]);
}

#[test]
fn polynomial_root_with_finite_differences() {
    let mut x = vec![1.0, 1.0, 1.0];
    let solution = hybrd1(&mut FnResiduals(polynomial), &mut x, 1e-10).unwrap();
    assert_eq!(solution.stats.status, SolveStatus::ConvergedStep);
    assert_root(&x, &[2.0, 3.0, 2.0]);
    assert!(solution.stats.fnorm <= 1e-8);
    // Each Jacobian costs n residual evaluations.
    assert!(solution.stats.residual_evals >= 1 + 3 * solution.stats.jacobian_evals);
}

#[derive(Default)]
struct Recorder {
    reports: Vec<IterationReport>,
}

impl Reporter for Recorder {
    fn on_iteration(&mut self, report: &IterationReport) {
        self.reports.push(report.clone());
    }
}

#[test]
fn linear_system_converges_in_at_most_n_plus_one_iterations() {
    let n = 4;
    let a = [
        [4.0, 1.0, 0.5, 0.0],
        [1.0, 5.0, -1.0, 0.5],
        [0.0, -1.0, 6.0, 1.0],
        [0.5, 0.0, 1.0, 3.0],
    ];
    let x_expected = [1.0, -2.0, 0.5, 3.0];
    let mut b = [0.0; 4];
    for i in 0..n {
        b[i] = (0..n).map(|j| a[i][j] * x_expected[j]).sum();
    }

    let mut problem = FnProblem {
        res: |x: &[f64], out: &mut [f64]| {
            for i in 0..n {
                out[i] = (0..n).map(|j| a[i][j] * x[j]).sum::<f64>() - b[i];
            }
        },
        jac: |_x: &[f64], jac: &mut JacobianMut<'_>| {
            for i in 0..n {
                for j in 0..n {
                    jac.set(i, j, a[i][j]);
                }
            }
        },
    };

    let mut solver = HybridSolver::new(n).unwrap();
    let mut recorder = Recorder::default();
    let mut x = vec![0.0; n];
    let options = HybridOptions::with_tolerance(1e-10, n);
    let stats = solver
        .solve(&mut problem, &mut x, &options, Some(&mut recorder))
        .unwrap();

    assert!(
        !matches!(stats.status, SolveStatus::MaxEvaluations | SolveStatus::UserStop),
        "unexpected status: {:?}",
        stats.status
    );
    assert_root(&x, &x_expected);

    let tol = 1e-10 * enorm(&b);
    let mut accepted = 0;
    let mut reached = None;
    for report in &recorder.reports {
        if report.accepted {
            accepted += 1;
            if report.trial_fnorm <= tol {
                reached = Some(accepted);
                break;
            }
        }
    }
    let reached = reached.expect("residual never dropped below tolerance");
    assert!(reached <= n + 1, "took {reached} iterations");
}

#[test]
fn banded_and_dense_differences_agree() {
    let n = 10;
    let dense_options = HybridOptions::with_tolerance(1e-10, n);
    let banded_options = HybridOptions {
        band: Some(Band { lower: 1, upper: 1 }),
        ..HybridOptions::with_tolerance(1e-10, n)
    };

    let mut x_dense = vec![-1.0; n];
    let dense = hybrd(&mut FnResiduals(broyden_tridiagonal), &mut x_dense, &dense_options).unwrap();
    let mut x_banded = vec![-1.0; n];
    let banded =
        hybrd(&mut FnResiduals(broyden_tridiagonal), &mut x_banded, &banded_options).unwrap();

    assert_eq!(dense.stats.status, SolveStatus::ConvergedStep);
    assert_eq!(banded.stats.status, SolveStatus::ConvergedStep);
    for j in 0..n {
        assert_relative_eq!(x_dense[j], x_banded[j], epsilon = 1e-8);
    }
    assert!(enorm(banded.residuals()) <= 1e-8);
    assert!(banded.stats.residual_evals < dense.stats.residual_evals);
}

#[test]
fn factors_stay_orthogonal_and_triangular() {
    let mut problem = FnProblem {
        res: polynomial,
        jac: polynomial_jacobian,
    };
    let mut x = vec![1.0, 1.0, 1.0];
    let solution = hybrj(&mut problem, &mut x, &HybridOptions::default()).unwrap();
    assert_eq!(solution.stats.status, SolveStatus::ConvergedStep);
    assert!(solution.rank().is_ok());
    assert_eq!(solution.r_packed().len(), 6);

    let q = solution.q();
    for a in 0..3 {
        for b in 0..3 {
            let dot: f64 = (0..3).map(|i| q.read(i, a) * q.read(i, b)).sum();
            let expected = if a == b { 1.0 } else { 0.0 };
            assert!((dot - expected).abs() <= 1e-10);
        }
    }

    let r = solution.r();
    for i in 0..3 {
        for j in 0..i {
            assert_eq!(r.read(i, j), 0.0);
        }
    }
    assert_eq!(r.read(0, 0), solution.r_packed()[0]);
    assert_eq!(r.read(1, 2), solution.r_packed()[4]);

    let solver = solution.into_solver();
    assert_eq!(solver.dim(), 3);
    assert_eq!(solver.residuals().len(), 3);
}

struct StopInJacobian;

impl Residuals for StopInJacobian {
    fn residuals(&mut self, x: &[f64], fvec: &mut [f64]) -> Result<(), Stop> {
        polynomial(x, fvec);
        Ok(())
    }
}

impl Problem for StopInJacobian {
    fn jacobian(
        &mut self,
        _x: &[f64],
        _fvec: &[f64],
        _jacobian: &mut JacobianMut<'_>,
    ) -> Result<(), Stop> {
        Err(Stop)
    }
}

#[test]
fn jacobian_callback_can_stop_the_solve() {
    let mut x = vec![1.0, 1.0, 1.0];
    let solution = hybrj1(&mut StopInJacobian, &mut x, 1e-10).unwrap();
    assert_eq!(solution.stats.status, SolveStatus::UserStop);
    assert_eq!(solution.stats.residual_evals, 1);
    assert_eq!(x, vec![1.0, 1.0, 1.0]);
}

// Both equations see only x0 + x1; consistent when rhs = 4.
fn rank_one(
    rhs: f64,
) -> FnProblem<impl FnMut(&[f64], &mut [f64]), impl FnMut(&[f64], &mut JacobianMut<'_>)> {
    FnProblem {
        res: move |x: &[f64], out: &mut [f64]| {
            out[0] = x[0] + x[1] - 2.0;
            out[1] = 2.0 * (x[0] + x[1]) - rhs;
        },
        jac: |_x: &[f64], jac: &mut JacobianMut<'_>| {
            jac.set(0, 0, 1.0);
            jac.set(0, 1, 1.0);
            jac.set(1, 0, 2.0);
            jac.set(1, 1, 2.0);
        },
    }
}

#[test]
fn consistent_singular_system_reaches_a_root() {
    let mut problem = rank_one(4.0);
    let mut x = vec![0.0, 0.0];
    let solution = hybrj(&mut problem, &mut x, &HybridOptions::default()).unwrap();
    let status = solution.stats.status;
    assert!(
        matches!(status, SolveStatus::ConvergedStep | SolveStatus::Singular),
        "unexpected status: {status:?}"
    );
    assert!(solution.stats.fnorm <= 1e-8);
    assert!((x[0] + x[1] - 2.0).abs() <= 1e-8);
}

#[test]
fn inconsistent_singular_system_is_reported() {
    let mut problem = rank_one(3.0);
    let mut x = vec![0.0, 0.0];
    let solution = hybrj(&mut problem, &mut x, &HybridOptions::default()).unwrap();
    assert_eq!(solution.stats.status, SolveStatus::Singular);
    assert!(!solution.stats.status.is_converged());
    assert!(solution.stats.fnorm > 0.0);
    assert!(x.iter().all(|v| v.is_finite()));
}

#[test]
fn stalled_iteration_is_detected() {
    // x^2 + 1 has no real root; |f| is smallest at x = 0.
    let mut problem = FnProblem {
        res: |x: &[f64], out: &mut [f64]| {
            out[0] = x[0] * x[0] + 1.0;
        },
        jac: |x: &[f64], jac: &mut JacobianMut<'_>| {
            jac.set(0, 0, 2.0 * x[0]);
        },
    };
    let mut x = vec![3.0];
    let solution = hybrj(&mut problem, &mut x, &HybridOptions::default()).unwrap();
    let status = solution.stats.status;
    assert!(
        matches!(status, SolveStatus::NoProgress(Stall::Jacobian | Stall::Iterations)),
        "unexpected status: {status:?}"
    );
    assert!(solution.stats.fnorm >= 1.0);
    assert!(x[0].abs() < 3.0);
}

#[test]
fn non_finite_start_is_a_failure() {
    let residuals = |x: &[f64], out: &mut [f64]| {
        out[0] = (x[0] - 1.0).sqrt();
        out[1] = x[1];
    };
    let mut x = vec![0.0, 0.0];
    let solution = hybrd1(&mut FnResiduals(residuals), &mut x, 1e-10).unwrap();
    assert_eq!(solution.stats.status, SolveStatus::NumericalFailure);
    assert!(solution.stats.fnorm.is_nan());
    assert_eq!(solution.stats.residual_evals, 1);
    assert_eq!(solution.stats.jacobian_evals, 0);
    assert_eq!(x, vec![0.0, 0.0]);
}

#[test]
fn non_finite_jacobian_is_a_failure() {
    let mut problem = FnProblem {
        res: polynomial,
        jac: |_x: &[f64], jac: &mut JacobianMut<'_>| {
            jac.fill_zero();
            jac.set(0, 0, f64::NAN);
        },
    };
    let mut x = vec![1.0, 1.0, 1.0];
    let solution = hybrj1(&mut problem, &mut x, 1e-10).unwrap();
    assert_eq!(solution.stats.status, SolveStatus::NumericalFailure);
    assert_eq!(solution.stats.jacobian_evals, 1);
    assert_eq!(x, vec![1.0, 1.0, 1.0]);
}
