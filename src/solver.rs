use core::fmt;

use std::time::{Duration, Instant};

use crate::problem::Band;
use crate::report::{emit_line, Reporter, SolveStatus, SolverStats, StdoutReporter};

/// Errors detected before the first residual evaluation.
#[derive(Debug, Clone, PartialEq)]
pub enum SolverError {
    /// No variables, or fewer residuals than variables.
    InvalidDimensions { m: usize, n: usize },
    /// A slice passed to the solver has the wrong length.
    DimensionMismatch {
        what: &'static str,
        expected: usize,
        actual: usize,
    },
    /// An option is negative, zero where it must be positive, or not finite.
    InvalidOption { name: &'static str, value: f64 },
    /// A user-supplied scale factor is not positive.
    InvalidScale { index: usize, value: f64 },
}

impl fmt::Display for SolverError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidDimensions { m, n } => {
                write!(f, "invalid dimensions: m={m}, n={n} (need n >= 1 and m >= n)")
            }
            Self::DimensionMismatch {
                what,
                expected,
                actual,
            } => {
                write!(f, "{what} length {actual} does not match expected {expected}")
            }
            Self::InvalidOption { name, value } => write!(f, "invalid {name}: {value}"),
            Self::InvalidScale { index, value } => {
                write!(f, "scale factor {index} must be positive (got {value})")
            }
        }
    }
}

impl std::error::Error for SolverError {}

/// Per-variable scaling of the trust region.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Scaling {
    /// Use the Jacobian column norms, never letting a factor decrease.
    #[default]
    Auto,
    /// Fixed positive factors, one per variable.
    Manual(Vec<f64>),
}

/// Options for the Levenberg-Marquardt drivers.
#[derive(Debug, Clone)]
pub struct LmOptions {
    /// Converge when actual and predicted relative reductions in the sum of
    /// squares are at most `ftol`.
    pub ftol: f64,
    /// Converge when the relative error between two iterates is at most `xtol`.
    pub xtol: f64,
    /// Converge when the cosine between the residual and every Jacobian
    /// column is at most `gtol`.
    pub gtol: f64,
    /// Residual evaluation budget. `None` uses `100 * (n + 1)` with an
    /// analytic Jacobian and `200 * (n + 1)` with finite differences.
    pub max_fev: Option<usize>,
    /// Relative error of the residuals, used for the finite-difference step.
    pub epsfcn: f64,
    /// Initial trust region radius relative to `||D x0||`.
    pub factor: f64,
    pub scaling: Scaling,
    /// Print the iteration table and elapsed time when no reporter is given.
    pub verbose: bool,
}

impl Default for LmOptions {
    fn default() -> Self {
        Self {
            ftol: f64::EPSILON.sqrt(),
            xtol: f64::EPSILON.sqrt(),
            gtol: 0.0,
            max_fev: None,
            epsfcn: 0.0,
            factor: 100.0,
            scaling: Scaling::Auto,
            verbose: false,
        }
    }
}

impl LmOptions {
    /// Options used by the single-call drivers: `ftol = xtol = tol`.
    pub fn with_tolerance(tol: f64) -> Self {
        Self {
            ftol: tol,
            xtol: tol,
            ..Self::default()
        }
    }

    /// Checks every option for a problem with `n` variables.
    pub fn validate(&self, n: usize) -> Result<(), SolverError> {
        non_negative("ftol", self.ftol)?;
        non_negative("xtol", self.xtol)?;
        non_negative("gtol", self.gtol)?;
        non_negative("epsfcn", self.epsfcn)?;
        positive("factor", self.factor)?;
        if self.max_fev == Some(0) {
            return Err(SolverError::InvalidOption {
                name: "max_fev",
                value: 0.0,
            });
        }
        validate_scaling(&self.scaling, n)
    }
}

/// Options for the hybrid (Powell dogleg) drivers.
#[derive(Debug, Clone)]
pub struct HybridOptions {
    /// Converge when the relative error between two iterates is at most `xtol`.
    pub xtol: f64,
    /// Residual evaluation budget. `None` uses `100 * (n + 1)` with an
    /// analytic Jacobian and `200 * (n + 1)` with finite differences.
    pub max_fev: Option<usize>,
    /// Band structure of the Jacobian for finite differences; `None` is dense.
    pub band: Option<Band>,
    /// Relative error of the residuals, used for the finite-difference step.
    pub epsfcn: f64,
    /// Initial trust region radius relative to `||D x0||`.
    pub factor: f64,
    pub scaling: Scaling,
    /// Print the iteration table and elapsed time when no reporter is given.
    pub verbose: bool,
}

impl Default for HybridOptions {
    fn default() -> Self {
        Self {
            xtol: f64::EPSILON.sqrt(),
            max_fev: None,
            band: None,
            epsfcn: 0.0,
            factor: 100.0,
            scaling: Scaling::Auto,
            verbose: false,
        }
    }
}

impl HybridOptions {
    /// Options used by the single-call drivers: `xtol = tol`, unit scaling.
    pub fn with_tolerance(tol: f64, n: usize) -> Self {
        Self {
            xtol: tol,
            scaling: Scaling::Manual(vec![1.0; n]),
            ..Self::default()
        }
    }

    /// Checks every option for a problem with `n` variables.
    pub fn validate(&self, n: usize) -> Result<(), SolverError> {
        non_negative("xtol", self.xtol)?;
        non_negative("epsfcn", self.epsfcn)?;
        positive("factor", self.factor)?;
        if self.max_fev == Some(0) {
            return Err(SolverError::InvalidOption {
                name: "max_fev",
                value: 0.0,
            });
        }
        validate_scaling(&self.scaling, n)
    }
}

fn non_negative(name: &'static str, value: f64) -> Result<(), SolverError> {
    if value.is_finite() && value >= 0.0 {
        Ok(())
    } else {
        Err(SolverError::InvalidOption { name, value })
    }
}

fn positive(name: &'static str, value: f64) -> Result<(), SolverError> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(SolverError::InvalidOption { name, value })
    }
}

fn validate_scaling(scaling: &Scaling, n: usize) -> Result<(), SolverError> {
    if let Scaling::Manual(diag) = scaling {
        if diag.len() != n {
            return Err(SolverError::DimensionMismatch {
                what: "scale",
                expected: n,
                actual: diag.len(),
            });
        }
        for (index, &value) in diag.iter().enumerate() {
            if !(value.is_finite() && value > 0.0) {
                return Err(SolverError::InvalidScale { index, value });
            }
        }
    }
    Ok(())
}

pub(crate) fn check_len(
    what: &'static str,
    expected: usize,
    actual: usize,
) -> Result<(), SolverError> {
    if expected == actual {
        Ok(())
    } else {
        Err(SolverError::DimensionMismatch {
            what,
            expected,
            actual,
        })
    }
}

pub(crate) fn default_max_fev(max_fev: Option<usize>, n: usize, finite_differences: bool) -> usize {
    max_fev.unwrap_or(if finite_differences { 200 * (n + 1) } else { 100 * (n + 1) })
}

/// Sets the scale on the first iteration.
pub(crate) fn init_scale(scaling: &Scaling, diag: &mut [f64], acnorm: &[f64]) {
    match scaling {
        Scaling::Auto => {
            for (d, &norm) in diag.iter_mut().zip(acnorm) {
                *d = if norm == 0.0 { 1.0 } else { norm };
            }
        }
        Scaling::Manual(values) => diag.copy_from_slice(values),
    }
}

/// Grows automatic scale factors to the current column norms.
pub(crate) fn update_scale(scaling: &Scaling, diag: &mut [f64], acnorm: &[f64]) {
    if let Scaling::Auto = scaling {
        for (d, &norm) in diag.iter_mut().zip(acnorm) {
            *d = d.max(norm);
        }
    }
}

/// Reports `Singular` instead of a non-converged stop when the Jacobian
/// never had full rank.
pub(crate) fn settle(status: SolveStatus, always_singular: bool) -> SolveStatus {
    match status {
        SolveStatus::ToleranceTooSmall(_) | SolveStatus::NoProgress(_) if always_singular => {
            SolveStatus::Singular
        }
        other => other,
    }
}

pub(crate) enum ReporterSlot<'a> {
    External(&'a mut dyn Reporter),
    Local(StdoutReporter),
    None,
}

impl<'a> ReporterSlot<'a> {
    pub(crate) fn new(reporter: Option<&'a mut dyn Reporter>, verbose: bool) -> Self {
        match reporter {
            Some(r) => Self::External(r),
            None if verbose => Self::Local(StdoutReporter::new()),
            None => Self::None,
        }
    }

    pub(crate) fn as_mut(&mut self) -> Option<&mut dyn Reporter> {
        match self {
            Self::External(r) => Some(*r),
            Self::Local(r) => Some(r),
            Self::None => None,
        }
    }
}

fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs_f64();
    if secs >= 1.0 {
        format!("{:.3} s", secs)
    } else if secs >= 1e-3 {
        format!("{:.3} ms", secs * 1e3)
    } else if secs >= 1e-6 {
        format!("{:.3} us", secs * 1e6)
    } else {
        format!("{:.0} ns", secs * 1e9)
    }
}

pub(crate) fn finish_stats(
    driver: &str,
    stats: SolverStats,
    start_time: Option<Instant>,
    reporter: &mut ReporterSlot<'_>,
) -> SolverStats {
    log::debug!(
        "{driver}: {} after {} iterations ({} residual evals, {} jacobian evals), fnorm={:.6e}",
        stats.status,
        stats.iterations,
        stats.residual_evals,
        stats.jacobian_evals,
        stats.fnorm
    );
    if let Some(reporter) = reporter.as_mut() {
        reporter.on_finish(&stats);
    }
    if let Some(start) = start_time {
        let elapsed = format_duration(start.elapsed());
        emit_line(&format!("time: {elapsed}"));
    }
    stats
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::Tolerance;

    #[test]
    fn rejects_bad_options() {
        let n = 2;
        assert!(LmOptions::default().validate(n).is_ok());
        let bad = LmOptions {
            ftol: -1.0,
            ..LmOptions::default()
        };
        assert_eq!(
            bad.validate(n),
            Err(SolverError::InvalidOption {
                name: "ftol",
                value: -1.0
            })
        );
        let bad = LmOptions {
            max_fev: Some(0),
            ..LmOptions::default()
        };
        assert!(bad.validate(n).is_err());
        let bad = HybridOptions {
            scaling: Scaling::Manual(vec![1.0, 0.0]),
            ..HybridOptions::default()
        };
        assert_eq!(
            bad.validate(n),
            Err(SolverError::InvalidScale {
                index: 1,
                value: 0.0
            })
        );
        let bad = HybridOptions {
            scaling: Scaling::Manual(vec![1.0]),
            ..HybridOptions::default()
        };
        assert!(matches!(
            bad.validate(n),
            Err(SolverError::DimensionMismatch { what: "scale", .. })
        ));
        let bad = HybridOptions {
            factor: 0.0,
            ..HybridOptions::default()
        };
        assert!(bad.validate(n).is_err());
    }

    #[test]
    fn automatic_scale_only_grows() {
        let mut diag = vec![0.0; 3];
        init_scale(&Scaling::Auto, &mut diag, &[2.0, 0.0, 5.0]);
        assert_eq!(diag, vec![2.0, 1.0, 5.0]);
        update_scale(&Scaling::Auto, &mut diag, &[1.0, 3.0, 5.5]);
        assert_eq!(diag, vec![2.0, 3.0, 5.5]);

        let manual = Scaling::Manual(vec![4.0, 4.0, 4.0]);
        init_scale(&manual, &mut diag, &[1.0, 1.0, 1.0]);
        update_scale(&manual, &mut diag, &[9.0, 9.0, 9.0]);
        assert_eq!(diag, vec![4.0, 4.0, 4.0]);
    }

    #[test]
    fn singular_only_replaces_failures() {
        let too_small = SolveStatus::ToleranceTooSmall(Tolerance::Step);
        assert_eq!(settle(too_small, true), SolveStatus::Singular);
        assert_eq!(settle(too_small, false), too_small);
        assert_eq!(
            settle(SolveStatus::ConvergedResidual, true),
            SolveStatus::ConvergedResidual
        );
        assert_eq!(settle(SolveStatus::UserStop, true), SolveStatus::UserStop);
    }

    #[test]
    fn durations_pick_a_readable_unit() {
        assert_eq!(format_duration(Duration::from_millis(1500)), "1.500 s");
        assert_eq!(format_duration(Duration::from_micros(2500)), "2.500 ms");
        assert_eq!(format_duration(Duration::from_nanos(12)), "12 ns");
    }
}
