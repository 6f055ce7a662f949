//! Components F/G — the nonlinear corrector (`spec.md` §4.3) and its
//! sensitivity-coupling variants (`spec.md` §4.4). Generalized from the
//! teacher's `nonlinear_solver::newton` loop shape (outer retry-with-fresh-
//! Jacobian wrapping an inner fixed-point/Newton iteration), replacing its
//! `anyhow::Result`-per-call contract with the tagged [`CorrectorOutcome`]
//! the driver needs to distinguish "retry with new Jacobian", "shrink the
//! step and retry", and "give up" (`spec.md` §9's `TRY_AGAIN` guidance).

pub mod functional;
pub mod newton;
pub mod staggered;

use crate::linear_solver::{ConvFail, SetupOutcome};
use crate::op::NonLinearOp;
use crate::scalar::Scalar;
use crate::vector::VectorOfVectors;

/// Steps since the last linear-solver setup at which the driver forces a
/// fresh one even absent any failure (`spec.md` §4.3 `MSBP`).
pub const MSBP: u64 = 20;
/// `|gamrat - 1|` threshold past which the driver forces a fresh setup
/// (`spec.md` §4.3 `DGMAX`).
pub const DGMAX: f64 = 0.3;

/// `spec.md` §4.3: the ratio by which the correction must shrink between
/// iterations for the iteration to be judged converging.
pub const CRDOWN: f64 = 0.3;
/// Divergence threshold on the same ratio.
pub const RDIV: f64 = 2.0;
/// Default cap on corrector iterations absent an explicit `maxcor` option.
pub const DEFAULT_MAXCOR: usize = 3;

/// Outcome of one call to [`Corrector::correct`]. Never collapsed to a
/// numeric sentinel (`spec.md` §9): the driver branches on the variant to
/// decide whether to re-setup the linear solver, shrink `h`, or fail the
/// step outright.
#[derive(Debug, Clone)]
pub enum CorrectorOutcome {
    Converged { niter: usize },
    /// The iteration diverged or exceeded its iteration cap without ever
    /// using a freshly evaluated Jacobian/iteration-matrix — the caller
    /// should force a setup and retry once before counting this as a
    /// genuine nonlinear convergence failure.
    RetryWithNewJacobian,
    /// Diverged or exceeded the iteration cap even with a fresh Jacobian —
    /// a genuine convergence failure (`spec.md` §4.7 feeds `ncf`).
    ConvergenceFailure,
    LinearSolverUnrecoverable(String),
}

/// Running estimate of the correction's convergence rate (`spec.md` §4.3):
/// tracks the norm of the previous correction so each iteration can form
/// the ratio that drives the `CRDOWN`/`RDIV` tests.
pub struct ConvergenceTest<T: Scalar> {
    prev_del_norm: Option<T>,
    crate_est: T,
}

impl<T: Scalar> Default for ConvergenceTest<T> {
    fn default() -> Self {
        Self {
            prev_del_norm: None,
            crate_est: T::one(),
        }
    }
}

impl<T: Scalar> ConvergenceTest<T> {
    pub fn reset(&mut self) {
        self.prev_del_norm = None;
        self.crate_est = T::one();
    }

    /// Returns `Some(del_norm * min(1, crate))`, `crate` being the running
    /// convergence-rate estimate (`spec.md` §4.3: `dcon = del * min(1,
    /// crate) / tq[4]`, the `min` applied here and the `/ tq[4]` left to the
    /// caller). `None` if this ratio already indicates divergence
    /// (`delnorm/prev > RDIV`, `spec.md` §4.3).
    pub fn step(&mut self, del_norm: T) -> Option<T> {
        if let Some(prev) = self.prev_del_norm {
            let ratio = del_norm / prev;
            if ratio > T::from_f64(RDIV) {
                return None;
            }
            self.crate_est = num_traits::Float::max(
                T::from_f64(CRDOWN) * self.crate_est,
                ratio,
            );
        }
        self.prev_del_norm = Some(del_norm);
        Some(num_traits::Float::min(T::one(), self.crate_est) * del_norm)
    }
}

/// Shared contract between [`functional::FunctionalCorrector`] and
/// [`newton::NewtonCorrector`]: drive `y_cur` from the predicted value
/// `y_pred` (`zn[0]` after `Nordsieck::predict`) to a solution of the
/// implicit corrector equation (`spec.md` §4.3), accumulating the
/// correction into `acor` (assumed zeroed by the caller before the first
/// call of a step attempt) and reporting how it went. `zn1` is `zn[1]`
/// after prediction, needed by both iterations' residual formula.
pub trait Corrector<C: NonLinearOp> {
    #[allow(clippy::too_many_arguments)]
    fn correct(
        &mut self,
        rhs: &C,
        t: C::T,
        p: &C::V,
        h: C::T,
        y_pred: &C::V,
        zn1: &C::V,
        rl1: C::T,
        gamma: C::T,
        ewt: &C::V,
        tq4: C::T,
        y_cur: &mut C::V,
        acor: &mut C::V,
    ) -> CorrectorOutcome;

    fn niter(&self) -> usize;

    /// Whether this corrector is backed by a linear solver at all
    /// (`false` for functional iteration). The driver's setup-staleness
    /// decision (`spec.md` §4.3) and its `nsetups` counter are skipped
    /// entirely when this is `false` — functional iteration never calls a
    /// linear solver, so it must never report a setup.
    fn uses_linear_solver(&self) -> bool {
        false
    }

    /// Forwards to [`crate::linear_solver::LinearSolver::init`], called
    /// once by the driver before the first step (`spec.md` §6.2). No-op
    /// for correctors with no linear solver.
    fn init_linear_solver(&mut self) -> Result<(), String> {
        Ok(())
    }

    /// Whether this corrector's iteration matrix (if it has one) is
    /// currently built from a freshly evaluated Jacobian. Functional
    /// iteration has no Jacobian at all, so it is trivially "current" —
    /// the driver's setup-staleness decision (`spec.md` §4.3) never
    /// applies to it.
    fn jcur(&self) -> bool {
        true
    }

    /// (Re)build the backing linear solver's iteration matrix, called by
    /// the driver per the setup-decision rule of `spec.md` §4.3 (first
    /// step, `MSBP` steps since the last setup, `gamrat` drift beyond
    /// `DGMAX`, or a forced retry after a convergence/error-test failure).
    /// No-op for correctors with no linear solver (functional iteration).
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
    ) -> SetupOutcome {
        let _ = (rhs, convfail, y_pred, f_pred, p, t, gamma);
        SetupOutcome::Ok
    }

    /// Sensitivity-coupling phase run once the state corrector above has
    /// converged and passed its own local error test (`spec.md` §4.4
    /// STAGGERED/STAGGERED1). Correctors with no associated linear solver
    /// (functional iteration) cannot drive a staggered Newton solve over
    /// the sensitivity vectors, so the default is a no-op success; see
    /// `DESIGN.md` for why sensitivity coupling is Newton-only here.
    fn correct_sens(&mut self, phase: &mut SensPhase<'_, C>) -> CorrectorOutcome {
        let _ = phase;
        CorrectorOutcome::Converged { niter: 0 }
    }
}

/// Everything [`Corrector::correct_sens`] needs, assembled by the driver
/// from its quad/sens channels once the state step has passed its error
/// test. Borrowing these as a bundle (rather than threading a dozen
/// parameters through the trait method) keeps the trait signature stable
/// as sensitivity bookkeeping grows.
pub struct SensPhase<'a, C: NonLinearOp> {
    pub staggered: &'a mut staggered::StaggeredCorrector<C::T>,
    pub fs: &'a mut dyn FnMut(usize, C::T, &C::V, &C::V, &C::V) -> C::V,
    pub t: C::T,
    pub y: &'a C::V,
    pub p: &'a C::V,
    pub rl1: C::T,
    pub gamma: C::T,
    pub ys_pred: &'a VectorOfVectors<C::V>,
    pub zn1_s: &'a VectorOfVectors<C::V>,
    pub ewt_s: &'a [C::V],
    pub tq4_s: C::T,
    pub ys_cur: &'a mut VectorOfVectors<C::V>,
    pub acor_s: &'a mut VectorOfVectors<C::V>,
}
