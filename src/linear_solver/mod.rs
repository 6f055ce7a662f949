//! The abstract linear solver contract. Only invoked when `iter = NEWTON`.

pub mod dense_lu;

use crate::matrix::Matrix;
use crate::op::Jacobian;

/// Why the current setup is being (re)requested, mirroring the three
/// `convfail` values CVODE passes into `lsetup`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConvFail {
    NoFailures,
    FailBadJ,
    FailOther,
}

/// Setup can fail recoverably (retry with a fresh Jacobian) or
/// unrecoverably (surface to the driver). Never folded into a bare `i32`
/// range — modeled as a tagged result instead of CVODE's `TRY_AGAIN`
/// sentinel value.
#[derive(Debug, Clone)]
pub enum SetupOutcome {
    Ok,
    Recoverable,
    Unrecoverable(String),
}

#[derive(Debug, Clone)]
pub enum SolveOutcome {
    Ok,
    Recoverable,
    Unrecoverable(String),
}

/// The linear-solver contract the Newton corrector is written against.
/// `C` is the (Jacobian-capable) right-hand side operator being linearised.
pub trait LinearSolver<C: Jacobian> {
    /// Called once before the first step.
    fn init(&mut self) -> Result<(), String>;

    /// Prepare/update the iteration matrix `M ~= I - gamma*J`. Must set
    /// `jcur` to whether the Jacobian used is freshly evaluated.
    #[allow(clippy::too_many_arguments)]
    fn setup(
        &mut self,
        rhs: &C,
        convfail: ConvFail,
        y_pred: &C::V,
        f_pred: &C::V,
        p: &C::V,
        t: C::T,
        gamma: C::T,
        jcur: &mut bool,
    ) -> SetupOutcome;

    /// Overwrite `b` with `M^-1 b`.
    fn solve(&mut self, b: &mut C::V, ewt: &C::V, y_cur: &C::V, f_cur: &C::V) -> SolveOutcome;

    fn free(&mut self) {}
}
