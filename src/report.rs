use core::fmt;

use comfy_table::{Cell, CellAlignment, ContentArrangement, Table, presets};

/// Tolerance that was set below what the arithmetic can resolve.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tolerance {
    Residual,
    Step,
    Gradient,
}

/// Reason the hybrid driver gave up on making progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stall {
    /// Five consecutive Jacobian evaluations without a 10% reduction.
    Jacobian,
    /// Ten consecutive iterations without a 0.1% reduction.
    Iterations,
}

/// How a solve terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SolveStatus {
    /// Actual and predicted relative reductions in the sum of squares are at
    /// most `ftol`.
    ConvergedResidual,
    /// Relative error between consecutive iterates is at most `xtol`.
    ConvergedStep,
    /// Both `ConvergedResidual` and `ConvergedStep` hold.
    ConvergedResidualAndStep,
    /// The residual is orthogonal to the Jacobian columns to within `gtol`.
    ConvergedGradient,
    /// The residual evaluation budget is used up.
    MaxEvaluations,
    /// No further improvement is possible at the requested tolerance.
    ToleranceTooSmall(Tolerance),
    /// Iteration is not making progress.
    NoProgress(Stall),
    /// The Jacobian was rank deficient on every iteration and the solve
    /// stopped without converging.
    Singular,
    /// The residuals or the Jacobian are not finite.
    NumericalFailure,
    /// A callback returned [`Stop`](crate::Stop).
    UserStop,
}

impl SolveStatus {
    /// Whether the status is one of the convergence tests.
    pub fn is_converged(&self) -> bool {
        matches!(
            self,
            Self::ConvergedResidual
                | Self::ConvergedStep
                | Self::ConvergedResidualAndStep
                | Self::ConvergedGradient
        )
    }
}

impl fmt::Display for SolveStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConvergedResidual => f.write_str("relative reduction in the sum of squares is at most ftol"),
            Self::ConvergedStep => f.write_str("relative error between two iterates is at most xtol"),
            Self::ConvergedResidualAndStep => {
                f.write_str("sum of squares and iterate both converged")
            }
            Self::ConvergedGradient => {
                f.write_str("residual is orthogonal to the jacobian columns to gtol")
            }
            Self::MaxEvaluations => f.write_str("residual evaluation budget exhausted"),
            Self::ToleranceTooSmall(Tolerance::Residual) => {
                f.write_str("ftol is too small, no further reduction in the sum of squares is possible")
            }
            Self::ToleranceTooSmall(Tolerance::Step) => {
                f.write_str("xtol is too small, no further improvement in the iterate is possible")
            }
            Self::ToleranceTooSmall(Tolerance::Gradient) => {
                f.write_str("gtol is too small, the residual is orthogonal to machine precision")
            }
            Self::NoProgress(Stall::Jacobian) => {
                f.write_str("no progress over the last five jacobian evaluations")
            }
            Self::NoProgress(Stall::Iterations) => {
                f.write_str("no progress over the last ten iterations")
            }
            Self::Singular => f.write_str("jacobian is singular"),
            Self::NumericalFailure => f.write_str("residuals or jacobian are not finite"),
            Self::UserStop => f.write_str("stopped by callback"),
        }
    }
}

/// Summary of a finished solve.
#[derive(Debug, Clone)]
pub struct SolverStats {
    pub status: SolveStatus,
    /// Accepted steps.
    pub iterations: usize,
    /// Residual evaluations, including those spent on finite differences.
    pub residual_evals: usize,
    /// Jacobian evaluations (full matrices, or full sweeps over the rows).
    pub jacobian_evals: usize,
    /// Euclidean norm of the residual at the returned iterate.
    pub fnorm: f64,
}

/// One trial step.
#[derive(Debug, Clone)]
pub struct IterationReport {
    pub iteration: usize,
    pub fnorm: f64,
    pub trial_fnorm: f64,
    /// Actual over predicted reduction.
    pub ratio: f64,
    /// Trust region radius after the update.
    pub delta: f64,
    /// Levenberg-Marquardt parameter; zero for dogleg steps.
    pub par: f64,
    /// Scaled step length `||D p||`.
    pub step_norm: f64,
    /// Orthogonality measure, when the driver computes one.
    pub gnorm: Option<f64>,
    pub accepted: bool,
}

pub(crate) fn emit_line(line: &str) {
    if log::log_enabled!(log::Level::Info) {
        log::info!("{line}");
    } else {
        println!("{line}");
    }
}

/// Receives progress from a running solve.
pub trait Reporter {
    fn on_iteration(&mut self, report: &IterationReport);
    fn on_finish(&mut self, _stats: &SolverStats) {}
}

/// Collects iterations and prints them as a table when the solve ends.
pub struct StdoutReporter {
    rows: Vec<IterationReport>,
}

impl StdoutReporter {
    pub fn new() -> Self {
        Self { rows: Vec::new() }
    }
}

impl Default for StdoutReporter {
    fn default() -> Self {
        Self::new()
    }
}

impl Reporter for StdoutReporter {
    fn on_iteration(&mut self, report: &IterationReport) {
        self.rows.push(report.clone());
    }

    fn on_finish(&mut self, stats: &SolverStats) {
        if !self.rows.is_empty() {
            if !log::log_enabled!(log::Level::Info) {
                println!();
            }
            let mut table = Table::new();
            table.load_preset(presets::UTF8_FULL);
            table.set_content_arrangement(ContentArrangement::Dynamic);
            table.set_header(vec![
                Cell::new("iter").set_alignment(CellAlignment::Right),
                Cell::new("fnorm").set_alignment(CellAlignment::Right),
                Cell::new("trial").set_alignment(CellAlignment::Right),
                Cell::new("ratio").set_alignment(CellAlignment::Right),
                Cell::new("delta").set_alignment(CellAlignment::Right),
                Cell::new("par").set_alignment(CellAlignment::Right),
                Cell::new("step").set_alignment(CellAlignment::Right),
                Cell::new("grad").set_alignment(CellAlignment::Right),
                Cell::new("accepted"),
            ]);
            for row in &self.rows {
                let gnorm = row
                    .gnorm
                    .map(|g| format!("{g:.1e}"))
                    .unwrap_or_else(|| "-".to_string());
                table.add_row(vec![
                    Cell::new(row.iteration).set_alignment(CellAlignment::Right),
                    Cell::new(format!("{:.4e}", row.fnorm)).set_alignment(CellAlignment::Right),
                    Cell::new(format!("{:.4e}", row.trial_fnorm))
                        .set_alignment(CellAlignment::Right),
                    Cell::new(format!("{:.3}", row.ratio)).set_alignment(CellAlignment::Right),
                    Cell::new(format!("{:.1e}", row.delta)).set_alignment(CellAlignment::Right),
                    Cell::new(format!("{:.1e}", row.par)).set_alignment(CellAlignment::Right),
                    Cell::new(format!("{:.1e}", row.step_norm))
                        .set_alignment(CellAlignment::Right),
                    Cell::new(gnorm).set_alignment(CellAlignment::Right),
                    Cell::new(if row.accepted { "yes" } else { "no" }),
                ]);
            }

            for line in table.to_string().lines() {
                emit_line(line);
            }
            self.rows.clear();
        }
        emit_line(&format!(
            "status: {} ({} iterations, {} residual evals, {} jacobian evals, fnorm {:.6e})",
            stats.status, stats.iterations, stats.residual_evals, stats.jacobian_evals, stats.fnorm
        ));
    }
}
