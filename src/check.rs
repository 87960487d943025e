use core::fmt;

use crate::problem::{JacobianMut, Problem, Stop};
use crate::solver::SolverError;

/// Failure of [`check_gradients`].
#[derive(Debug, Clone, PartialEq)]
pub enum CheckError {
    Invalid(SolverError),
    Stopped(Stop),
}

impl fmt::Display for CheckError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Invalid(err) => write!(f, "gradient check rejected input: {err}"),
            Self::Stopped(stop) => write!(f, "gradient check interrupted: {stop}"),
        }
    }
}

impl std::error::Error for CheckError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Invalid(err) => Some(err),
            Self::Stopped(stop) => Some(stop),
        }
    }
}

impl From<SolverError> for CheckError {
    fn from(err: SolverError) -> Self {
        Self::Invalid(err)
    }
}

impl From<Stop> for CheckError {
    fn from(stop: Stop) -> Self {
        Self::Stopped(stop)
    }
}

/// Compares the analytic Jacobian of `problem` at `x` with a forward
/// difference along a single perturbed point.
///
/// Returns one score per residual: `1.0` when the gradient agrees to
/// roughly the precision the difference can resolve, `0.0` when it is
/// clearly wrong, and values in between measure the number of digits that
/// agree. A residual that is zero at `x` or at the perturbed point scores
/// `1.0`, since the comparison carries no information there.
pub fn check_gradients<P: Problem>(
    problem: &mut P,
    x: &[f64],
    m: usize,
) -> Result<Vec<f64>, CheckError> {
    let n = x.len();
    if n == 0 || m == 0 {
        return Err(SolverError::InvalidDimensions { m, n }.into());
    }

    let epsmch = f64::EPSILON;
    let eps = epsmch.sqrt();
    let epsf = 100.0 * epsmch;
    let epslog = eps.log10();

    let xp: Vec<f64> = x
        .iter()
        .map(|&xj| {
            let h = eps * xj.abs();
            xj + if h == 0.0 { eps } else { h }
        })
        .collect();

    let mut fvec = vec![0.0; m];
    let mut fvecp = vec![0.0; m];
    let mut values = vec![0.0; m * n];
    problem.residuals(x, &mut fvec)?;
    {
        let mut jac = JacobianMut::new(&mut values, m, n);
        problem.jacobian(x, &fvec, &mut jac)?;
    }
    problem.residuals(&xp, &mut fvecp)?;

    // Predicted change of each residual over the perturbation, divided by eps.
    let mut err = vec![0.0; m];
    for (j, &xj) in x.iter().enumerate() {
        let scale = if xj == 0.0 { 1.0 } else { xj.abs() };
        for i in 0..m {
            err[i] += scale * values[i + j * m];
        }
    }

    for i in 0..m {
        let mut temp = 1.0;
        if fvec[i] != 0.0
            && fvecp[i] != 0.0
            && (fvecp[i] - fvec[i]).abs() >= epsf * fvec[i].abs()
        {
            temp = eps * ((fvecp[i] - fvec[i]) / eps - err[i]).abs()
                / (fvec[i].abs() + fvecp[i].abs());
        }
        err[i] = if temp >= eps {
            0.0
        } else if temp > epsmch {
            (temp.log10() - epslog) / epslog
        } else {
            1.0
        };
    }
    log::debug!("check_gradients: m={m} n={n} min score {:.3}", err.iter().cloned().fold(1.0, f64::min));
    Ok(err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::problem::Residuals;

    struct Rosenbrock {
        wrong_row: bool,
    }

    impl Residuals for Rosenbrock {
        fn residuals(&mut self, x: &[f64], fvec: &mut [f64]) -> Result<(), Stop> {
            fvec[0] = 10.0 * (x[1] - x[0] * x[0]);
            fvec[1] = 1.0 - x[0];
            Ok(())
        }
    }

    impl Problem for Rosenbrock {
        fn jacobian(
            &mut self,
            x: &[f64],
            _fvec: &[f64],
            jacobian: &mut JacobianMut<'_>,
        ) -> Result<(), Stop> {
            let d = if self.wrong_row { -10.0 } else { -20.0 };
            jacobian.set(0, 0, d * x[0]);
            jacobian.set(0, 1, 10.0);
            jacobian.set(1, 0, -1.0);
            jacobian.set(1, 1, 0.0);
            Ok(())
        }
    }

    #[test]
    fn correct_jacobian_scores_high() {
        let scores = check_gradients(&mut Rosenbrock { wrong_row: false }, &[-1.2, 1.0], 2).unwrap();
        assert!(scores.iter().all(|&s| s > 0.5), "{scores:?}");
    }

    #[test]
    fn wrong_row_is_flagged() {
        let scores = check_gradients(&mut Rosenbrock { wrong_row: true }, &[-1.2, 1.0], 2).unwrap();
        assert!(scores[0] < 0.1, "{scores:?}");
        assert!(scores[1] > 0.5, "{scores:?}");
    }

    #[test]
    fn empty_input_is_rejected() {
        let err = check_gradients(&mut Rosenbrock { wrong_row: false }, &[], 2).unwrap_err();
        assert_eq!(err, CheckError::Invalid(SolverError::InvalidDimensions { m: 2, n: 0 }));
    }
}
