//! Nonlinear equations and nonlinear least squares with trust-region methods.
//!
//! Two solver families share one dense linear-algebra kernel:
//! - Levenberg-Marquardt for `min ||r(x)||^2` with `m >= n` residuals
//!   ([`lmder`], [`lmdif`], [`lmstr`] and their `*1` shorthands).
//! - Powell's hybrid dogleg method for square systems `r(x) = 0`
//!   ([`hybrj`], [`hybrd`], [`hybrj1`], [`hybrd1`]).
//!
//! How it works (high level):
//! - Factor the Jacobian with Householder QR (column pivoting for least
//!   squares) without ever forming `J^T J`.
//! - Pick a step inside a scaled trust region: the Levenberg-Marquardt
//!   parameter for least squares, the dogleg path for square systems.
//! - Compare actual and predicted reduction to accept the step and resize
//!   the region; the hybrid method refreshes its factorization with
//!   Broyden rank-one updates between Jacobian evaluations.
//!
//! Calling it:
//! - Implement [`Residuals`] (and [`Problem`] or [`RowProblem`] when an
//!   analytic Jacobian is available).
//! - Call a driver function, or reuse an [`LmSolver`] / [`HybridSolver`]
//!   across solves, and inspect [`SolverStats::status`].
//! - A callback returns `Err(Stop)` to end the solve early.
//!
//! Example:
//! ```rust
//! use minpack_rs::{lmder1, JacobianMut, Problem, Residuals, Stop};
//!
//! struct Rosenbrock;
//!
//! impl Residuals for Rosenbrock {
//!     fn residuals(&mut self, x: &[f64], fvec: &mut [f64]) -> Result<(), Stop> {
//!         fvec[0] = 1.0 - x[0];
//!         fvec[1] = 10.0 * (x[1] - x[0] * x[0]);
//!         Ok(())
//!     }
//! }
//!
//! impl Problem for Rosenbrock {
//!     fn jacobian(
//!         &mut self,
//!         x: &[f64],
//!         _fvec: &[f64],
//!         jac: &mut JacobianMut<'_>,
//!     ) -> Result<(), Stop> {
//!         jac.set(0, 0, -1.0);
//!         jac.set(0, 1, 0.0);
//!         jac.set(1, 0, -20.0 * x[0]);
//!         jac.set(1, 1, 10.0);
//!         Ok(())
//!     }
//! }
//!
//! let mut x = vec![-1.2, 1.0];
//! let solution = lmder1(&mut Rosenbrock, 2, &mut x, 1e-10).unwrap();
//! assert!(solution.stats.status.is_converged());
//! assert!((x[0] - 1.0).abs() < 1e-6);
//! ```

mod check;
mod hybrid;
mod linalg;
mod lm;
mod problem;
mod report;
mod solver;
mod step;

pub use check::{check_gradients, CheckError};
pub use hybrid::{hybrd, hybrd1, hybrj, hybrj1, HybridSolution, HybridSolver};
pub use linalg::{enorm, SingularJacobian};
pub use lm::{lmder, lmder1, lmdif, lmdif1, lmstr, lmstr1, LmSolution, LmSolver};
pub use problem::{Band, ForwardDifference, JacobianMut, Problem, Residuals, RowProblem, Stop};
pub use report::{
    IterationReport, Reporter, SolveStatus, SolverStats, Stall, StdoutReporter, Tolerance,
};
pub use solver::{HybridOptions, LmOptions, Scaling, SolverError};
