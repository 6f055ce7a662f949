//! Component K — the top-level driver (`spec.md` §4.10), tying the
//! coefficient engine, Nordsieck history, corrector, error test and
//! controller into the `CVode`-style step loop. Quadrature and
//! sensitivity channels are advanced alongside the state channel but (per
//! `spec.md` §6.3 components L/M) never drive the corrector's iteration
//! count themselves unless their `errcon`/`errcon_q` is `Full`.

use thiserror::Error;

use crate::coefficients::{self, Coefficients, Lmm};
use crate::controller::{self, OrderChoice};
use crate::corrector::newton::NewtonCorrector;
use crate::corrector::staggered::{StaggeredCorrector, StaggeredCoupling};
use crate::corrector::{Corrector, CorrectorOutcome, SensPhase, DGMAX, MSBP};
use crate::error::{IntegratorError, IntegratorResult};
use crate::error_test::{self, ErrFailAction, ErrorTestOutcome};
use crate::ewt::Tolerances;
use crate::initial_step::{self, InitialStepOutcome};
use crate::linear_solver::{ConvFail, LinearSolver, SetupOutcome};
use crate::logging;
use crate::nonlinear_fail::ConvFailAction;
use crate::op::sens_rhs::SensDq;
use crate::op::{CallStats, Jacobian, Op};
use crate::options::{ErrorControl, Options};
use crate::scalar::Scalar;
use crate::stability::StabilityVerdict;
use crate::state::IntegratorState;
use crate::vector::{Vector, VectorOfVectors};

/// How far the caller wants `solve` to advance and whether dense output at
/// an exact time is requested (`spec.md` §4.10).
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Mode<T> {
    Normal,
    OneStep,
    NormalTstop(T),
    OneStepTstop(T),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepStatus {
    ReachedTout,
    TookOneStep,
    ReachedTstop,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum DkyError {
    #[error("requested derivative order {k} exceeds the current method order {q}")]
    DerivativeOrderTooHigh { k: usize, q: u32 },

    #[error("requested time {t} lies outside the last-step interpolation window [{lo}, {hi}]")]
    TimeOutOfInterpolationWindow { t: f64, lo: f64, hi: f64 },

    #[error("no sensitivity channel is attached")]
    SensitivitiesNotAttached,
}

/// User quadrature integrand plus the tolerance used for its own error
/// weights (`spec.md` §6.3 component L). Boxed so the driver's generic
/// parameters don't have to carry a quadrature-callback type.
struct QuadSource<C: Jacobian> {
    f: Box<dyn Fn(C::T, &C::V, &C::V) -> C::V>,
    tol: Tolerances<C::V>,
}

/// Which sensitivity right-hand side the driver evaluates per parameter
/// (`spec.md` §4.4/§6.4): a user-supplied analytic callback, or the
/// built-in difference-quotient default.
enum SensRhsKind<C: Jacobian> {
    Analytic(Box<dyn Fn(usize, C::T, &C::V, &C::V, &C::V) -> C::V>),
    Dq(SensDq<C::T>),
}

/// Forward-sensitivity coupling state: the RHS source, its tolerance, and
/// the persistent per-parameter convergence trackers
/// ([`StaggeredCorrector`] carries `CRDOWN`/`RDIV` state across steps).
struct SensSource<C: Jacobian> {
    kind: SensRhsKind<C>,
    tol: Tolerances<C::V>,
    staggered: StaggeredCorrector<C::T>,
}

pub struct Driver<C: Jacobian, CR: Corrector<C>> {
    rhs: C,
    corrector: CR,
    st: IntegratorState<C::V>,
    tol: Tolerances<C::V>,
    opts: Options,
    p: C::V,
    initialized: bool,
    quad: Option<QuadSource<C>>,
    sens: Option<SensSource<C>>,
}

impl<C: Jacobian, CR: Corrector<C>> Driver<C, CR> {
    pub fn new(rhs: C, corrector: CR, opts: Options, tol: Tolerances<C::V>, p: C::V) -> Self {
        let n = rhs.nstates();
        Self {
            st: IntegratorState::new(opts.lmm, n, opts.maxnef, opts.maxncf),
            rhs,
            corrector,
            tol,
            opts,
            p,
            initialized: false,
            quad: None,
            sens: None,
        }
    }

    pub fn stats(&self) -> &crate::state::IntegratorStats {
        &self.st.stats
    }

    /// `spec.md` §4.10 step 1: recompute `ewt` (and `ewtQ`/`ewtS` when
    /// enabled) from the current Nordsieck value before every internal
    /// step, surfacing the first non-positive component as a precondition
    /// failure rather than silently dividing by it later.
    fn recompute_ewt(&mut self) -> IntegratorResult<()> {
        self.tol.compute(&self.st.state.zn.zn[0], &mut self.st.state.ewt)?;
        if let (Some(quad), Some(chan)) = (&self.quad, self.st.quad.as_mut()) {
            quad.tol.compute(&chan.zn.zn[0], &mut chan.ewt)?;
        }
        if let (Some(sens), Some(chan)) = (&self.sens, self.st.sens.as_mut()) {
            for i in 0..chan.ns {
                sens.tol.compute(&chan.zn.zn[0].members[i], &mut chan.ewt[i])?;
            }
        }
        Ok(())
    }

    /// `spec.md` §4.10 steps 3-4: before each internal step, bail out if the
    /// requested tolerance is unreachable at machine precision, and issue a
    /// rate-limited warning if `h` has dropped to the point that `tn + h`
    /// rounds back to `tn` (`mxhnil`, `nhnil`).
    fn check_numerical_limits(&mut self) -> IntegratorResult<()> {
        self.recompute_ewt()?;
        let mut nrm = self.st.state.zn.zn[0].wrms_norm(&self.st.state.ewt);
        if let Some(chan) = &self.st.quad {
            if self.opts.errcon_q == ErrorControl::Full {
                let nrm_q = chan.zn.zn[0].wrms_norm(&chan.ewt);
                if nrm_q > nrm {
                    nrm = nrm_q;
                }
            }
        }
        if let Some(sens) = &self.st.sens {
            if self.opts.errcon == ErrorControl::Full {
                let nrm_s = sens.zn.zn[0].wrms_norm_max(&sens.ewt);
                if nrm_s > nrm {
                    nrm = nrm_s;
                }
            }
        }
        let tolsf = C::T::uround() * nrm;
        if tolsf > C::T::one() {
            return Err(IntegratorError::TooMuchAccuracy {
                t: num_traits::NumCast::from(self.st.tn).unwrap_or(0.0),
                tolsf: num_traits::NumCast::from(tolsf * C::T::from_f64(2.0)).unwrap_or(0.0),
            });
        }

        if self.st.tn + self.st.hprime == self.st.tn {
            self.st.stats.nhnil += 1;
            if self.st.stats.nhnil <= self.opts.mxhnil {
                logging::warn_hnil(
                    num_traits::NumCast::from(self.st.tn).unwrap_or(0.0),
                    num_traits::NumCast::from(self.st.hprime).unwrap_or(0.0),
                );
            }
            if self.st.stats.nhnil == self.opts.mxhnil {
                logging::warn_hnil_suppressed();
            }
        }
        Ok(())
    }

    /// Attach a quadrature channel (`spec.md` §6.3 component L): `fQ(t, y)`
    /// is evaluated once per accepted step, never iterated by the
    /// corrector. Must be called before [`Self::init`].
    pub fn attach_quadrature<F>(&mut self, nq: usize, tol: Tolerances<C::V>, f: F)
    where
        F: Fn(C::T, &C::V, &C::V) -> C::V + 'static,
    {
        self.st.attach_quad(nq);
        self.quad = Some(QuadSource { f: Box::new(f), tol });
    }

    /// First-call setup (`spec.md` §4.10 step 1): error weights, initial
    /// step selection, and the order-1 Nordsieck seed.
    pub fn init(&mut self, t0: C::T, y0: &C::V, tout: C::T) -> IntegratorResult<()> {
        let ns = self.st.sens.as_ref().map(|s| s.ns).unwrap_or(0);
        self.opts.validate(y0.len(), ns)?;
        self.corrector
            .init_linear_solver()
            .map_err(|msg| IntegratorError::AllocationFailed(msg))?;
        self.st.tn = t0;
        self.tol.compute(y0, &mut self.st.state.ewt)?;
        self.st.state.zn.zn[0].copy_from(y0);

        let f0 = self.rhs.call(t0, y0, &self.p);

        let fq0 = if let Some(quad) = &self.quad {
            let chan = self.st.quad.as_mut().expect("attach_quadrature sets st.quad");
            quad.tol.compute(&chan.zn.zn[0], &mut chan.ewt)?;
            Some((quad.f)(t0, y0, &self.p))
        } else {
            None
        };

        let ys0: Vec<C::V> = if self.st.sens.is_some() {
            let sens_n = y0.len();
            let chan = self.st.sens.as_mut().expect("attach_sensitivities sets st.sens");
            for i in 0..chan.ns {
                let sens = self.sens.as_ref().expect("st.sens implies self.sens");
                sens.tol.compute(&chan.zn.zn[0].members[i], &mut chan.ewt[i])?;
            }
            (0..chan.ns).map(|_| C::V::zeros(sens_n)).collect()
        } else {
            Vec::new()
        };

        let h0 = if self.opts.hin != 0.0 {
            C::T::from_f64(self.opts.hin)
        } else {
            let mut extra: Vec<(C::V, C::V, C::V)> = Vec::new();
            if self.opts.errcon_q == ErrorControl::Full {
                if let (Some(quad), Some(fq0)) = (&self.st.quad, &fq0) {
                    let y0q = quad.zn.zn[0].clone();
                    extra.push((y0q.clone(), fq0.clone(), y0q.abs().add_scalar(C::T::from_f64(1e-300))));
                }
            }
            if self.opts.errcon == ErrorControl::Full {
                if let Some(sens) = &self.sens {
                    let ysdot0 = self.eval_sens_rhs_all(t0, y0, &f0, &ys0, sens);
                    for (ys0_i, ysdot0_i) in ys0.iter().zip(ysdot0.iter()) {
                        extra.push((
                            ys0_i.clone(),
                            ysdot0_i.clone(),
                            ys0_i.abs().add_scalar(C::T::from_f64(1e-300)),
                        ));
                    }
                }
            }
            let hub = initial_step::upper_bound_h0(
                y0,
                &f0,
                &y0.abs().add_scalar(C::T::from_f64(1e-300)),
                num_traits::Float::abs(tout - t0),
                &extra,
            );
            let uround = C::T::uround();
            let y0c = y0.clone();
            let f0c = f0.clone();
            let ewt = self.st.state.ewt.clone();
            let rhs = &self.rhs;
            let p = self.p.clone();
            let outcome = initial_step::initial_step(t0, tout, uround, hub, |hg| {
                initial_step::ydd_norm(t0, &y0c, &f0c, &ewt, hg, |t, y| rhs.call(t, y, &p))
            });
            match outcome {
                Some(o) => o.value(),
                None => return Err(IntegratorError::TooCloseToInitialTime),
            }
        };

        self.st.h = h0;
        self.st.hprime = h0;
        self.st.hscale = h0;
        self.st.state.zn.zn[1].copy_from(&f0);
        self.st.state.zn.zn[1].scale(h0);
        self.st.q = 1;
        self.st.qprime = 1;
        self.st.qwait = 1;
        self.st.coeffs = coefficients::adams_coefficients(1, h0, &self.st.state.tau, 1, C::T::from_f64(self.opts.nlscoef));
        if self.opts.lmm == Lmm::Bdf {
            self.st.coeffs = coefficients::bdf_coefficients(1, h0, &self.st.state.tau, 1, C::T::from_f64(self.opts.nlscoef));
        }

        if let Some(fq0) = &fq0 {
            let chan = self.st.quad.as_mut().expect("attach_quadrature sets st.quad");
            chan.zn.zn[1].copy_from(fq0);
            chan.zn.zn[1].scale(h0);
        }

        if self.st.sens.is_some() {
            let sens = self.sens.as_ref().expect("st.sens implies self.sens");
            let ysdot0 = self.eval_sens_rhs_all(t0, y0, &f0, &ys0, sens);
            let chan = self.st.sens.as_mut().expect("attach_sensitivities sets st.sens");
            for i in 0..chan.ns {
                chan.zn.zn[1].members[i].copy_from(&ysdot0[i]);
                chan.zn.zn[1].members[i].scale(h0);
            }
        }

        self.initialized = true;
        Ok(())
    }

    /// Evaluate the sensitivity RHS for every parameter at once, dispatching
    /// to the user's analytic callback or the [`SensDq`] default
    /// (`spec.md` §6.4). Shared between `init` (seeding `znS[1]`) and the
    /// step loop's sensitivity-phase closure.
    fn eval_sens_rhs_all(
        &self,
        t: C::T,
        y: &C::V,
        ydot: &C::V,
        ys: &[C::V],
        sens: &SensSource<C>,
    ) -> Vec<C::V> {
        match &sens.kind {
            SensRhsKind::Analytic(f) => ys.iter().enumerate().map(|(i, ys_i)| f(i, t, y, &self.p, ys_i)).collect(),
            SensRhsKind::Dq(dq) => {
                let rhs = &self.rhs;
                let p = &self.p;
                ys.iter()
                    .enumerate()
                    .map(|(i, ys_i)| {
                        dq.eval_one(i, t, y, p, ydot, ys_i, &self.st.state.ewt, self.tol.rtol, |tt, yy, pp| {
                            rhs.call(tt, yy, pp)
                        })
                    })
                    .collect()
            }
        }
    }

    fn recompute_coeffs(&self, q: u32, h: C::T, qwait: u32) -> Coefficients<C::T> {
        match self.opts.lmm {
            Lmm::Adams => coefficients::adams_coefficients(q, h, &self.st.state.tau, qwait, C::T::from_f64(self.opts.nlscoef)),
            Lmm::Bdf => coefficients::bdf_coefficients(q, h, &self.st.state.tau, qwait, C::T::from_f64(self.opts.nlscoef)),
        }
    }

    /// `η = max(ETAMIN, hmin/|h|)`, the floor the order-reduction and
    /// restart error-test branches rescale by (`spec.md` §4.5 steps 4-5).
    fn error_test_eta_floor(&self) -> C::T {
        let mut eta = C::T::from_f64(controller::ETAMIN);
        if self.opts.hmin > 0.0 {
            let h_abs = num_traits::Float::abs(self.st.h);
            eta = num_traits::Float::max(eta, C::T::from_f64(self.opts.hmin) / h_abs);
        }
        eta
    }

    /// `spec.md` §4.5 step 2: `|h| <= hmin*(1+eps)` forces `REP_ERR_FAIL`
    /// regardless of `nef`.
    fn h_below_hmin(&self) -> bool {
        if self.opts.hmin <= 0.0 {
            return false;
        }
        let h_abs = num_traits::Float::abs(self.st.h);
        h_abs <= C::T::from_f64(self.opts.hmin) * (C::T::one() + C::T::uround())
    }

    /// Re-seeds the state (and quadrature, if attached) Nordsieck array from
    /// scratch at order 1 (`spec.md` §4.5 step 5 restart): `zn[0]` is left
    /// untouched (it already holds `y_n`, restored by the caller), `zn[1]`
    /// is `h*f(tn, zn[0])`, and every higher column is zeroed.
    fn restart_state_and_quad(&mut self) {
        let y0 = self.st.state.zn.zn[0].clone();
        let f0 = self.rhs.call(self.st.tn, &y0, &self.p);
        self.st.state.zn.zn[1].copy_from(&f0);
        self.st.state.zn.zn[1].scale(self.st.h);
        let qmax = self.st.state.zn.qmax();
        for j in 2..=qmax {
            self.st.state.zn.zn[j].fill(C::T::zero());
        }
        if let Some(quad_src) = &self.quad {
            let fq0 = (quad_src.f)(self.st.tn, &y0, &self.p);
            let chan = self.st.quad.as_mut().expect("self.quad implies st.quad");
            chan.zn.zn[1].copy_from(&fq0);
            chan.zn.zn[1].scale(self.st.h);
            let qmax_q = chan.zn.qmax();
            for j in 2..=qmax_q {
                chan.zn.zn[j].fill(C::T::zero());
            }
        }
    }

    /// The linear-solver setup decision (`spec.md` §4.3): called once per
    /// step attempt, before the corrector iterates, since a functional
    /// corrector's [`Corrector::setup`] is a no-op this runs unconditionally
    /// and only a Newton-backed one ever actually rebuilds anything.
    /// `Ok(())` means the attempt may proceed; `Err` carries the outcome the
    /// caller should fold into its own convergence-failure handling.
    fn maybe_setup(&mut self, t: C::T, y_pred: &C::V, gamma: C::T) -> Result<(), CorrectorOutcome> {
        if !self.corrector.uses_linear_solver() {
            return Ok(());
        }
        let gamrat = if self.st.gamma_p != C::T::zero() {
            gamma / self.st.gamma_p
        } else {
            C::T::one()
        };
        self.st.gamrat = gamrat;
        let stale_ratio = num_traits::Float::abs(gamrat - C::T::one()) > C::T::from_f64(DGMAX);
        let periodic = self.st.stats.nst >= self.st.nstlp + MSBP;
        let need_setup = self.st.stats.nst == 0 || self.st.force_setup || periodic || stale_ratio;
        if !need_setup {
            return Ok(());
        }
        let convfail = if self.st.force_setup {
            self.st.pending_convfail
        } else {
            ConvFail::NoFailures
        };
        let f_pred = self.rhs.call(t, y_pred, &self.p);
        let outcome = self.corrector.setup(&self.rhs, convfail, y_pred, &f_pred, &self.p, t, gamma);
        self.st.stats.nsetups += 1;
        match outcome {
            SetupOutcome::Ok => {}
            SetupOutcome::Recoverable => return Err(CorrectorOutcome::RetryWithNewJacobian),
            SetupOutcome::Unrecoverable(msg) => return Err(CorrectorOutcome::LinearSolverUnrecoverable(msg)),
        }
        self.st.gamma_p = gamma;
        self.st.gamrat = C::T::one();
        self.st.nstlp = self.st.stats.nst;
        self.st.force_setup = false;
        Ok(())
    }

    /// One internal step (`spec.md` §4.10 steps 2-6): predict, correct
    /// (retrying with a fresh Jacobian/shrunk `h` on nonlinear failure),
    /// error-test (retrying with a shrunk `h`/order on failure), then
    /// advance the order/step controller for the next attempt.
    pub fn step(&mut self) -> IntegratorResult<()> {
        if !self.initialized {
            return Err(IntegratorError::NotAllocated);
        }

        loop {
            let q = self.st.q;
            let (rl1, gamma) = coefficients::finalize(self.st.h, &self.st.coeffs.ell);

            self.st.state.zn.predict(q as usize);
            if let Some(chan) = self.st.quad.as_mut() {
                chan.zn.predict(q as usize);
            }
            let y_pred = self.st.state.zn.zn[0].clone();
            let zn1 = self.st.state.zn.zn[1].clone();
            self.st.state.acor.fill(C::T::zero());
            let mut y_cur = y_pred.clone();

            let t_new = self.st.tn + self.st.h;
            if let Err(setup_outcome) = self.maybe_setup(t_new, &y_pred, gamma) {
                match setup_outcome {
                    CorrectorOutcome::RetryWithNewJacobian => {
                        self.st.state.zn.restore(q as usize);
                        if let Some(chan) = self.st.quad.as_mut() {
                            chan.zn.restore(q as usize);
                        }
                        self.st.force_setup = true;
                        self.st.pending_convfail = ConvFail::FailOther;
                        match self.st.conv_fail.record_failure() {
                            ConvFailAction::Retry => {
                                self.st.h = self.st.h * C::T::from_f64(crate::nonlinear_fail::ETACF);
                                self.st.coeffs = self.recompute_coeffs(q, self.st.h, self.st.qwait);
                                continue;
                            }
                            ConvFailAction::GiveUp => {
                                return Err(IntegratorError::ConvFailure {
                                    t: num_traits::NumCast::from(self.st.tn).unwrap_or(0.0),
                                    h: num_traits::NumCast::from(self.st.h).unwrap_or(0.0),
                                })
                            }
                        }
                    }
                    CorrectorOutcome::LinearSolverUnrecoverable(msg) => {
                        self.st.state.zn.restore(q as usize);
                        if let Some(chan) = self.st.quad.as_mut() {
                            chan.zn.restore(q as usize);
                        }
                        return Err(IntegratorError::SetupFailure {
                            t: num_traits::NumCast::from(self.st.tn).unwrap_or(0.0),
                            source: msg,
                        });
                    }
                    _ => unreachable!("maybe_setup only returns RetryWithNewJacobian or LinearSolverUnrecoverable"),
                }
            }

            let tq4 = self.st.coeffs.tq[4];
            let outcome = self.corrector.correct(
                &self.rhs,
                t_new,
                &self.p,
                self.st.h,
                &y_pred,
                &zn1,
                rl1,
                gamma,
                &self.st.state.ewt,
                tq4,
                &mut y_cur,
                &mut self.st.state.acor,
            );
            self.st.stats.nni += self.corrector.niter() as u64;

            match outcome {
                CorrectorOutcome::Converged { .. } => {}
                CorrectorOutcome::RetryWithNewJacobian => {
                    self.st.state.zn.restore(q as usize);
                    if let Some(chan) = self.st.quad.as_mut() {
                        chan.zn.restore(q as usize);
                    }
                    self.st.force_setup = true;
                    self.st.pending_convfail = ConvFail::FailBadJ;
                    match self.st.conv_fail.record_failure() {
                        ConvFailAction::Retry => {
                            self.st.h = self.st.h * C::T::from_f64(crate::nonlinear_fail::ETACF);
                            self.st.coeffs = self.recompute_coeffs(q, self.st.h, self.st.qwait);
                            continue;
                        }
                        ConvFailAction::GiveUp => {
                            return Err(IntegratorError::ConvFailure {
                                t: num_traits::NumCast::from(self.st.tn).unwrap_or(0.0),
                                h: num_traits::NumCast::from(self.st.h).unwrap_or(0.0),
                            })
                        }
                    }
                }
                CorrectorOutcome::ConvergenceFailure => {
                    self.st.state.zn.restore(q as usize);
                    if let Some(chan) = self.st.quad.as_mut() {
                        chan.zn.restore(q as usize);
                    }
                    self.st.force_setup = true;
                    self.st.pending_convfail = ConvFail::FailOther;
                    match self.st.conv_fail.record_failure() {
                        ConvFailAction::Retry => {
                            self.st.h = self.st.h * C::T::from_f64(crate::nonlinear_fail::ETACF);
                            self.st.coeffs = self.recompute_coeffs(q, self.st.h, self.st.qwait);
                            continue;
                        }
                        ConvFailAction::GiveUp => {
                            return Err(IntegratorError::ConvFailure {
                                t: num_traits::NumCast::from(self.st.tn).unwrap_or(0.0),
                                h: num_traits::NumCast::from(self.st.h).unwrap_or(0.0),
                            })
                        }
                    }
                }
                CorrectorOutcome::LinearSolverUnrecoverable(msg) => {
                    return Err(IntegratorError::SolveFailure {
                        t: num_traits::NumCast::from(self.st.tn).unwrap_or(0.0),
                        source: msg,
                    })
                }
            }
            self.st.conv_fail.record_success();

            // Quadrature is evaluated once per accepted state correction,
            // non-iteratively (`spec.md` §6.3 component L).
            let acor_wrms = self.st.state.acor.wrms_norm(&self.st.state.ewt);
            let (mut dsm, _) = error_test::local_error_test(acor_wrms, self.st.coeffs.tq[2]);
            if let Some(quad) = &self.quad {
                let fq = (quad.f)(self.st.tn + self.st.h, &y_cur, &self.p);
                self.st.stats.nfqe += 1;
                let chan = self.st.quad.as_mut().expect("self.quad implies st.quad");
                let mut corr = chan.zn.zn[1].clone();
                corr.scale(-C::T::one());
                corr.axpy(self.st.h, &fq);
                corr.scale(rl1);
                chan.acor.copy_from(&corr);
                if self.opts.errcon_q == ErrorControl::Full {
                    let dsm_q = chan.acor.wrms_norm(&chan.ewt) / self.st.coeffs.tq[2];
                    if dsm_q > dsm {
                        dsm = dsm_q;
                    }
                }
            }
            let test = if dsm <= C::T::one() {
                ErrorTestOutcome::Passed
            } else {
                ErrorTestOutcome::Failed
            };

            match test {
                ErrorTestOutcome::Failed => {
                    self.st.state.zn.restore(q as usize);
                    if let Some(chan) = self.st.quad.as_mut() {
                        chan.zn.restore(q as usize);
                    }
                    self.st.stats.netf += 1;
                    self.st.force_setup = true;
                    self.st.pending_convfail = ConvFail::FailOther;
                    let action = self.st.err_test.record_failure(q);
                    let action = if self.h_below_hmin() { ErrFailAction::GiveUp } else { action };
                    match action {
                        ErrFailAction::ShrinkStep { cap_etamxf } => {
                            let mut eta = C::T::one()
                                / (C::T::from_f64(controller::BIAS2)
                                    * num_traits::Float::powf(dsm, C::T::one() / C::T::from_f64((q + 1) as f64))
                                    + C::T::from_f64(controller::ADDON));
                            if cap_etamxf {
                                eta = num_traits::Float::min(eta, C::T::from_f64(error_test::ETAMXF));
                            }
                            eta = num_traits::Float::max(eta, self.error_test_eta_floor());
                            let eta = controller::clamp_eta(eta, C::T::one());
                            self.st.h = self.st.h * eta;
                            self.st.state.zn.rescale(q as usize, eta);
                            self.st.coeffs = self.recompute_coeffs(q, self.st.h, self.st.qwait);
                            logging::debug_step_rejected(
                                num_traits::NumCast::from(self.st.tn).unwrap_or(0.0),
                                num_traits::NumCast::from(self.st.h).unwrap_or(0.0),
                                "local error test",
                            );
                            continue;
                        }
                        ErrFailAction::ReduceOrder => {
                            self.apply_order_change(q, q - 1);
                            self.st.q = q - 1;
                            self.st.qprime = self.st.q;
                            self.st.qwait = self.st.q + 1;
                            let eta = self.error_test_eta_floor();
                            self.st.h = self.st.h * eta;
                            self.st.hscale = self.st.h;
                            self.st.state.zn.rescale(self.st.q as usize, eta);
                            if let Some(chan) = self.st.quad.as_mut() {
                                chan.zn.rescale(self.st.q as usize, eta);
                            }
                            self.st.coeffs = self.recompute_coeffs(self.st.q, self.st.h, self.st.qwait);
                            continue;
                        }
                        ErrFailAction::Restart => {
                            let eta = self.error_test_eta_floor();
                            self.st.h = self.st.h * eta;
                            self.st.hscale = self.st.h;
                            self.st.qwait = 10;
                            self.st.q = 1;
                            self.st.qprime = 1;
                            self.st.sldet.reset();
                            self.restart_state_and_quad();
                            self.st.coeffs = self.recompute_coeffs(1, self.st.h, self.st.qwait);
                            continue;
                        }
                        ErrFailAction::GiveUp => {
                            return Err(IntegratorError::ErrFailure {
                                t: num_traits::NumCast::from(self.st.tn).unwrap_or(0.0),
                                h: num_traits::NumCast::from(self.st.h).unwrap_or(0.0),
                            })
                        }
                    }
                }
                ErrorTestOutcome::Passed => break,
            }
        }

        self.accept_step();
        Ok(())
    }

    /// Commits the converged state (and quadrature, if attached) correction
    /// into their Nordsieck histories and advances the order/step
    /// controller. Returns the `ell` vector and `eta` it used so
    /// [`Self::commit_sens`] can apply the same bookkeeping to a
    /// sensitivity channel the generic driver doesn't know about.
    fn accept_step(&mut self) -> (Vec<C::T>, C::T) {
        let q = self.st.q;
        let ell = self.st.coeffs.ell.clone();

        // `spec.md` §4.6: "update tau by right-shifting" before folding
        // this step's correction in. `tau[1]` is always the most recent
        // accepted step size.
        for i in (2..=q as usize).rev() {
            self.st.state.tau[i] = self.st.state.tau[i - 1];
        }
        if q == 1 && self.st.stats.nst > 0 {
            self.st.state.tau[2] = self.st.state.tau[1];
        }
        self.st.state.tau[1] = self.st.h;

        self.st.state.zn.apply_correction(q as usize, &ell, &self.st.state.acor.clone());
        if let Some(chan) = self.st.quad.as_mut() {
            chan.zn.apply_correction(q as usize, &ell, &chan.acor.clone());
        }
        self.st.tn += self.st.h;
        self.st.hu = self.st.h;
        self.st.err_test.record_success();
        self.st.stats.nst += 1;
        self.st.stats.nfe = self.rhs.num_calls() as u64;
        self.st.stats.qu = q;
        self.st.stats.hu = num_traits::NumCast::from(self.st.h).unwrap_or(0.0);
        self.st.stats.tcur = num_traits::NumCast::from(self.st.tn).unwrap_or(0.0);

        // `spec.md` §4.9: evaluated here (not folded into `qprime` yet —
        // the qwait==0 branch below recomputes `qprime` from scratch and
        // would otherwise clobber this) so its cap can override whatever
        // the normal order/eta choice picks for this step.
        let mut sldet_cap: Option<u32> = None;
        if self.opts.sldeton && self.opts.lmm == Lmm::Bdf && q >= 3 {
            // `spec.md` §4.9 `ssdat` row: `sq = (q-1)! * q * (q+1) * acnrm / tq[5]`,
            // `sqm1 = (q-1)! * q * WRMS(zn[q], ewt)`, `sqm2 = (q-1)! * WRMS(zn[q-1], ewt)`,
            // each squared before entering the window (mirrors `CVBDFStab`).
            let mut factorial = C::T::one();
            for i in 1..q {
                factorial *= C::T::from_f64(i as f64);
            }
            let acnrm = self.st.state.acor.wrms_norm(&self.st.state.ewt);
            let sq = factorial * C::T::from_f64(q as f64) * C::T::from_f64((q + 1) as f64) * acnrm
                / self.st.coeffs.tq[5];
            let sqm1 = factorial * C::T::from_f64(q as f64) * self.st.state.zn.zn[q as usize].wrms_norm(&self.st.state.ewt);
            let sqm2 = factorial * self.st.state.zn.zn[q as usize - 1].wrms_norm(&self.st.state.ewt);
            self.st.sldet.push([sqm2 * sqm2, sqm1 * sqm1, sq * sq]);
            if let StabilityVerdict::Unstable { recommended_qmax } = self.st.sldet.detect(q, self.opts.maxord) {
                logging::warn_stability_limit(
                    num_traits::NumCast::from(self.st.tn).unwrap_or(0.0),
                    q,
                    recommended_qmax,
                );
                self.st.stats.nor += 1;
                sldet_cap = Some(recommended_qmax.min(q.saturating_sub(1)).max(1));
            }
        }

        let etaq = C::T::one()
            / (C::T::from_f64(controller::BIAS2)
                * num_traits::Float::powf(
                    self.st.state.acor.wrms_norm(&self.st.state.ewt) / self.st.coeffs.tq[2],
                    C::T::one() / C::T::from_f64((q + 1) as f64),
                )
                + C::T::from_f64(controller::ADDON));

        if self.st.qwait > 0 {
            self.st.qwait -= 1;
        }

        // `spec.md` §4.6: once `qwait` counts down to 1 (one step before
        // the next 3-way order comparison), stash this step's correction
        // as the order-increase candidate so that comparison has real
        // data to read instead of a stale scratch column.
        if self.st.qwait == 1 && self.st.q != self.opts.maxord {
            let scratch = self.st.state.zn.qmax();
            self.st.state.zn.zn[scratch] = self.st.state.acor.clone();
            self.st.coeffs.saved_tq5 = self.st.coeffs.tq[5];
        }

        if self.st.qwait == 0 && self.st.q < self.opts.maxord {
            let qmax_reached = self.st.q >= self.opts.maxord;
            // `spec.md` §4.6: `ddn = WRMS(zn[q], ewt) / tq[1]`.
            let dsm_qm1 = if self.st.q > 1 {
                Some(self.st.state.zn.zn[self.st.q as usize].wrms_norm(&self.st.state.ewt) / self.st.coeffs.tq[1])
            } else {
                None
            };
            // `spec.md` §4.6: `dup = WRMS(acor - cquot*zn[qmax], ewt) / tq[3]`,
            // `cquot = (tq[5]/saved_tq5) * (h/tau[2])^L`.
            let dsm_qp1 = if !qmax_reached {
                let scratch = self.st.state.zn.qmax();
                let l = (self.st.q + 1) as i32;
                let cquot = if self.st.coeffs.saved_tq5 != C::T::zero() && self.st.state.tau[2] != C::T::zero() {
                    (self.st.coeffs.tq[5] / self.st.coeffs.saved_tq5)
                        * num_traits::Float::powi(self.st.h / self.st.state.tau[2], l)
                } else {
                    C::T::zero()
                };
                let mut diff = self.st.state.acor.clone();
                diff.axpy(-cquot, &self.st.state.zn.zn[scratch]);
                Some(diff.wrms_norm(&self.st.state.ewt) / self.st.coeffs.tq[3])
            } else {
                None
            };
            let candidate = controller::choose_order_and_eta(self.st.q, self.opts.maxord, etaq, dsm_qm1, dsm_qp1);
            match candidate.order {
                OrderChoice::Decrease => self.st.qprime = self.st.q - 1,
                OrderChoice::Same => self.st.qprime = self.st.q,
                OrderChoice::Increase => self.st.qprime = self.st.q + 1,
            }
            self.st.eta = candidate.eta;
            self.st.qwait = self.st.q + 1;
        } else {
            self.st.eta = controller::clamp_eta(etaq, C::T::from_f64(controller::etamax_for_step_count(self.st.stats.nst)));
        }

        // `spec.md` §4.9: a stability-limit violation overrides whatever
        // order/eta the normal controller picked above.
        if let Some(cap) = sldet_cap {
            if cap < self.st.qprime {
                self.st.qprime = cap;
                self.st.eta = controller::clamp_eta(etaq, C::T::one());
                self.st.qwait = self.st.q + 1;
            }
        }

        if self.st.qprime != self.st.q {
            logging::info_order_change(
                num_traits::NumCast::from(self.st.tn).unwrap_or(0.0),
                self.st.q,
                self.st.qprime,
            );
            self.apply_order_change(q, self.st.qprime);
            self.st.q = self.st.qprime;
        }

        let mut eta = controller::clamp_eta(self.st.eta, C::T::from_f64(controller::etamax_for_step_count(self.st.stats.nst)));
        // `spec.md` §4.6: "clamp eta <= etamax and eta <= 1/(|h|*hmax_inv)"
        // so the rescaled step never exceeds the user's `hmax_inv` bound.
        if self.opts.hmax_inv > 0.0 {
            let hmax_inv = C::T::from_f64(self.opts.hmax_inv);
            let h_abs = num_traits::Float::abs(self.st.h);
            let eta_cap = C::T::one() / (h_abs * hmax_inv);
            if eta > eta_cap {
                eta = num_traits::Float::max(eta_cap, C::T::from_f64(controller::ETAMIN));
            }
        }
        self.st.h *= eta;
        self.st.hprime = self.st.h;
        self.st.state.zn.rescale(self.st.q as usize, eta);
        if let Some(chan) = self.st.quad.as_mut() {
            chan.zn.rescale(self.st.q as usize, eta);
        }
        self.st.coeffs = self.recompute_coeffs(self.st.q, self.st.h, self.st.qwait);

        logging::debug_step_accepted(
            num_traits::NumCast::from(self.st.tn).unwrap_or(0.0),
            num_traits::NumCast::from(self.st.h).unwrap_or(0.0),
            self.st.q,
            0.0,
        );

        (ell, eta)
    }

    /// Reshapes the Nordsieck history's top column(s) for an order change
    /// decided by the controller (`spec.md` §4.2 IncreaseBDF/DecreaseBDF,
    /// "Adams variants are analogous"). `q_old` is the order the step was
    /// just taken at; `q_new` is `q_old +/- 1`. Applied to the state and
    /// (if attached) quadrature channels identically — sensitivities are
    /// handled by the `step_with_sensitivities` specialization since the
    /// generic driver doesn't know whether a sensitivity channel exists.
    fn apply_order_change(&mut self, q_old: u32, q_new: u32) {
        if q_new == q_old + 1 {
            match self.opts.lmm {
                Lmm::Bdf => {
                    let (ell, a1) = coefficients::bdf_increase_coeffs(q_old, self.st.h, &self.st.state.tau);
                    self.st.state.zn.increase_bdf(q_old as usize, &ell, a1);
                    if let Some(chan) = self.st.quad.as_mut() {
                        chan.zn.increase_bdf(q_old as usize, &ell, a1);
                    }
                }
                Lmm::Adams => {
                    let l = (q_old + 1) as usize;
                    self.st.state.zn.zero_column(l);
                    if let Some(chan) = self.st.quad.as_mut() {
                        chan.zn.zero_column(l);
                    }
                }
            }
        } else if q_new + 1 == q_old {
            let ell = match self.opts.lmm {
                Lmm::Bdf => coefficients::bdf_decrease_coeffs(q_old, self.st.h, &self.st.state.tau),
                Lmm::Adams => coefficients::adams_decrease_coeffs(q_old, self.st.h, &self.st.state.tau),
            };
            self.st.state.zn.decrease_bdf(q_old as usize, &ell);
            if let Some(chan) = self.st.quad.as_mut() {
                chan.zn.decrease_bdf(q_old as usize, &ell);
            }
        }
    }

    /// Sensitivity-channel counterpart of the commit half of
    /// [`Self::accept_step`], applied with the same `ell`/`eta` the state
    /// and quadrature channels already used. `q_committed` is the order the
    /// step was taken at (`self.st.q` by the time this runs already holds
    /// next step's order, set by `accept_step`).
    fn commit_sens(&mut self, q_committed: u32, ell: &[C::T], eta: C::T) {
        let q_new = self.st.q;
        let h = self.st.h;
        let tau = self.st.state.tau.clone();
        let lmm = self.opts.lmm;
        if let Some(sens_chan) = self.st.sens.as_mut() {
            let ns = sens_chan.ns;
            sens_chan.zn.apply_correction(q_committed as usize, ns, ell, &sens_chan.acor.clone());
            // Order-change bookkeeping mirrors `apply_order_change`, with
            // one simplification: the sensitivity history has no
            // per-channel scratch-save-on-qwait==1 step (only the state
            // channel's `acor` primes `zn[qmax]`), so an order increase
            // starts the new sensitivity column at zero rather than from
            // a saved correction. Documented in `DESIGN.md`.
            if q_new == q_committed + 1 {
                match lmm {
                    Lmm::Bdf => {
                        let (ell_inc, a1) = coefficients::bdf_increase_coeffs(q_committed, h, &tau);
                        sens_chan.zn.increase_bdf(q_committed as usize, ns, &ell_inc, a1);
                    }
                    Lmm::Adams => {
                        sens_chan.zn.zero_column((q_committed + 1) as usize, ns);
                    }
                }
            } else if q_new + 1 == q_committed {
                let ell_dec = match lmm {
                    Lmm::Bdf => coefficients::bdf_decrease_coeffs(q_committed, h, &tau),
                    Lmm::Adams => coefficients::adams_decrease_coeffs(q_committed, h, &tau),
                };
                sens_chan.zn.decrease_bdf(q_committed as usize, ns, &ell_dec);
            }
            sens_chan.zn.rescale(self.st.q as usize, ns, eta);
        }
    }

    /// Sensitivity-channel counterpart of [`Driver::apply_order_change`]'s
    /// order-decrease branch, used by the error test's `ReduceOrder` action
    /// (`spec.md` §4.5 step 4), which runs on the restored (pre-predict)
    /// Nordsieck array outside the normal `accept_step`/`commit_sens` path.
    fn commit_sens_order_reduce(&mut self, q_old: u32, ns: usize) {
        let h = self.st.h;
        let tau = self.st.state.tau.clone();
        let lmm = self.opts.lmm;
        if let Some(sens_chan) = self.st.sens.as_mut() {
            let ell = match lmm {
                Lmm::Bdf => coefficients::bdf_decrease_coeffs(q_old, h, &tau),
                Lmm::Adams => coefficients::adams_decrease_coeffs(q_old, h, &tau),
            };
            sens_chan.zn.decrease_bdf(q_old as usize, ns, &ell);
        }
    }

    /// Sensitivity-channel counterpart of [`Driver::restart_state_and_quad`]
    /// (`spec.md` §4.5 step 5): re-seeds `znS[1]` from the sensitivity RHS at
    /// the restored `(tn, zn[0], znS[0])` and zeroes every higher column.
    fn restart_sens(&mut self) {
        if self.sens.is_none() {
            return;
        }
        let y0 = self.st.state.zn.zn[0].clone();
        let f0 = self.rhs.call(self.st.tn, &y0, &self.p);
        let ns = self.st.sens.as_ref().expect("sens attached").ns;
        let ys0 = self.st.sens.as_ref().expect("sens attached").zn.zn[0].members.clone();
        let sens_src = self.sens.as_ref().expect("sens attached");
        let ysdot0 = self.eval_sens_rhs_all(self.st.tn, &y0, &f0, &ys0, sens_src);
        let chan = self.st.sens.as_mut().expect("sens attached");
        for i in 0..ns {
            chan.zn.zn[1].members[i].copy_from(&ysdot0[i]);
            chan.zn.zn[1].members[i].scale(self.st.h);
        }
        let qmax = chan.zn.qmax();
        for j in 2..=qmax {
            for i in 0..ns {
                chan.zn.zn[j].members[i].fill(C::T::zero());
            }
        }
    }

    /// Advance until `tout` is reached (`Normal`) or after exactly one
    /// internal step (`OneStep`), honoring `tstop` if the mode carries one
    /// (`spec.md` §4.10 step 7).
    pub fn solve(&mut self, tout: C::T, mode: Mode<C::T>) -> IntegratorResult<(C::T, StepStatus)> {
        let tstop = match mode {
            Mode::NormalTstop(t) | Mode::OneStepTstop(t) => {
                if (tout - self.st.tn) * (t - self.st.tn) < C::T::zero() && self.st.tn != t {
                    // tstop already behind us relative to the direction of travel
                    return Err(IntegratorError::StopBeforeCurrentTime {
                        tstop: num_traits::NumCast::from(t).unwrap_or(0.0),
                        tn: num_traits::NumCast::from(self.st.tn).unwrap_or(0.0),
                    });
                }
                Some(t)
            }
            _ => None,
        };

        let mut nsteps = 0u32;
        loop {
            if let Some(t) = tstop {
                if num_traits::Float::abs(self.st.tn - t) <= C::T::uround() * num_traits::Float::abs(t) {
                    return Ok((self.st.tn, StepStatus::ReachedTstop));
                }
                let dist_to_tstop = t - self.st.tn;
                if num_traits::Float::abs(self.st.h) > num_traits::Float::abs(dist_to_tstop) {
                    self.st.h = dist_to_tstop;
                }
            }

            self.check_numerical_limits()?;
            self.step()?;
            nsteps += 1;

            match mode {
                Mode::OneStep | Mode::OneStepTstop(_) => return Ok((self.st.tn, StepStatus::TookOneStep)),
                _ => {}
            }

            let reached = if tout >= self.st.tn {
                self.st.tn >= tout
            } else {
                self.st.tn <= tout
            };
            if reached {
                return Ok((self.st.tn, StepStatus::ReachedTout));
            }

            if nsteps >= self.opts.mxstep {
                return Err(IntegratorError::TooMuchWork {
                    t: num_traits::NumCast::from(self.st.tn).unwrap_or(0.0),
                    tout: num_traits::NumCast::from(tout).unwrap_or(0.0),
                    mxstep: self.opts.mxstep,
                });
            }
        }
    }

    /// Dense output from the Nordsieck interpolant (`spec.md` §4.10
    /// GetDky): `k`-th derivative at `t`, valid within `FUZZ_FACTOR * hu`
    /// of the last accepted step.
    pub fn get_dky(&self, t: C::T, k: usize) -> Result<C::V, DkyError> {
        const FUZZ_FACTOR: f64 = 100.0;
        if k as u32 > self.st.q {
            return Err(DkyError::DerivativeOrderTooHigh { k, q: self.st.q });
        }
        let tfuzz = C::T::uround() * C::T::from_f64(FUZZ_FACTOR) * (num_traits::Float::abs(self.st.tn) + num_traits::Float::abs(self.st.h));
        let tfuzz = if self.st.h < C::T::zero() { -tfuzz } else { tfuzz };
        let tp = self.st.tn - self.st.hu - tfuzz;
        let t1 = self.st.tn + tfuzz;
        let (lo, hi) = if self.st.h >= C::T::zero() { (tp, t1) } else { (t1, tp) };
        if (t - lo) * (t - hi) > C::T::zero() {
            return Err(DkyError::TimeOutOfInterpolationWindow {
                t: num_traits::NumCast::from(t).unwrap_or(0.0),
                lo: num_traits::NumCast::from(lo).unwrap_or(0.0),
                hi: num_traits::NumCast::from(hi).unwrap_or(0.0),
            });
        }
        Ok(self.st.state.zn.dky(t, k, self.st.tn, self.st.h, self.st.q as usize))
    }
}

/// Forward-sensitivity attach points and the sensitivity-coupled step loop
/// (`spec.md` §4.4 STAGGERED/STAGGERED1). Confined to a `NewtonCorrector`
/// backend: staggered correction reuses the state step's factorized
/// iteration matrix, which only a Newton-based corrector has. SIMULTANEOUS
/// coupling needs no code here — per `corrector::staggered`'s own doc
/// comment, it is obtained by running a plain [`Driver::step`] with a
/// `NewtonCorrector` built against an operator augmented with the
/// sensitivity equations (see `DESIGN.md`).
impl<C: Jacobian, LS: LinearSolver<C>> Driver<C, NewtonCorrector<C, LS>> {
    /// Attach `ns` sensitivity channels driven by a user-supplied analytic
    /// `fS` callback (`spec.md` §6.3 component M). Must be called before
    /// [`Driver::init`].
    pub fn attach_sensitivities_analytic<F>(
        &mut self,
        ns: usize,
        tol: Tolerances<C::V>,
        coupling: StaggeredCoupling,
        f: F,
    ) -> IntegratorResult<()>
    where
        F: Fn(usize, C::T, &C::V, &C::V, &C::V) -> C::V + 'static,
    {
        let n = self.rhs.nstates();
        self.opts.validate(n, ns)?;
        self.st.attach_sens(ns, n);
        self.sens = Some(SensSource {
            kind: SensRhsKind::Analytic(Box::new(f)),
            tol,
            staggered: StaggeredCorrector::new(coupling, ns, self.opts.maxcor_s),
        });
        Ok(())
    }

    /// Attach `ns` sensitivity channels driven by the built-in
    /// difference-quotient default (`spec.md` §6.4).
    pub fn attach_sensitivities_dq(
        &mut self,
        ns: usize,
        tol: Tolerances<C::V>,
        coupling: StaggeredCoupling,
        dq: SensDq<C::T>,
    ) -> IntegratorResult<()> {
        let n = self.rhs.nstates();
        self.opts.validate(n, ns)?;
        self.st.attach_sens(ns, n);
        self.sens = Some(SensSource {
            kind: SensRhsKind::Dq(dq),
            tol,
            staggered: StaggeredCorrector::new(coupling, ns, self.opts.maxcor_s),
        });
        Ok(())
    }

    /// Sensitivity-aware counterpart of [`Driver::step`]: after the state
    /// (and quadrature) correction passes its own convergence/error test,
    /// runs the staggered sensitivity correction and folds its `dsmS` into
    /// the same accept/reject decision (`spec.md` §4.4/§4.5), restarting
    /// the whole attempt — state, quadrature and sensitivities together —
    /// on any failure. Falls back to [`Driver::step`] when no sensitivity
    /// channel is attached.
    pub fn step_with_sensitivities(&mut self) -> IntegratorResult<()> {
        if !self.initialized {
            return Err(IntegratorError::NotAllocated);
        }
        if self.sens.is_none() {
            return self.step();
        }

        let mut q_committed = self.st.q;

        loop {
            let q = self.st.q;
            q_committed = q;
            let (rl1, gamma) = coefficients::finalize(self.st.h, &self.st.coeffs.ell);
            let ns = self.st.sens.as_ref().expect("sens attached").ns;

            self.st.state.zn.predict(q as usize);
            if let Some(chan) = self.st.quad.as_mut() {
                chan.zn.predict(q as usize);
            }
            self.st.sens.as_mut().expect("sens attached").zn.predict(q as usize, ns);

            let y_pred = self.st.state.zn.zn[0].clone();
            let zn1 = self.st.state.zn.zn[1].clone();
            self.st.state.acor.fill(C::T::zero());
            let n = y_pred.len();
            self.st.sens.as_mut().expect("sens attached").acor = VectorOfVectors::zeros(ns, n);
            let mut y_cur = y_pred.clone();

            let t_new = self.st.tn + self.st.h;
            if let Err(setup_outcome) = self.maybe_setup(t_new, &y_pred, gamma) {
                match setup_outcome {
                    CorrectorOutcome::RetryWithNewJacobian => {
                        self.st.state.zn.restore(q as usize);
                        if let Some(chan) = self.st.quad.as_mut() {
                            chan.zn.restore(q as usize);
                        }
                        self.st.sens.as_mut().expect("sens attached").zn.restore(q as usize, ns);
                        self.st.force_setup = true;
                        self.st.pending_convfail = ConvFail::FailOther;
                        match self.st.conv_fail.record_failure() {
                            ConvFailAction::Retry => {
                                self.st.h = self.st.h * C::T::from_f64(crate::nonlinear_fail::ETACF);
                                self.st.coeffs = self.recompute_coeffs(q, self.st.h, self.st.qwait);
                                continue;
                            }
                            ConvFailAction::GiveUp => {
                                return Err(IntegratorError::ConvFailure {
                                    t: num_traits::NumCast::from(self.st.tn).unwrap_or(0.0),
                                    h: num_traits::NumCast::from(self.st.h).unwrap_or(0.0),
                                })
                            }
                        }
                    }
                    CorrectorOutcome::LinearSolverUnrecoverable(msg) => {
                        self.st.state.zn.restore(q as usize);
                        if let Some(chan) = self.st.quad.as_mut() {
                            chan.zn.restore(q as usize);
                        }
                        self.st.sens.as_mut().expect("sens attached").zn.restore(q as usize, ns);
                        return Err(IntegratorError::SetupFailure {
                            t: num_traits::NumCast::from(self.st.tn).unwrap_or(0.0),
                            source: msg,
                        });
                    }
                    _ => unreachable!("maybe_setup only returns RetryWithNewJacobian or LinearSolverUnrecoverable"),
                }
            }

            let tq4 = self.st.coeffs.tq[4];
            let outcome = self.corrector.correct(
                &self.rhs,
                t_new,
                &self.p,
                self.st.h,
                &y_pred,
                &zn1,
                rl1,
                gamma,
                &self.st.state.ewt,
                tq4,
                &mut y_cur,
                &mut self.st.state.acor,
            );
            self.st.stats.nni += self.corrector.niter() as u64;

            match outcome {
                CorrectorOutcome::Converged { .. } => {}
                CorrectorOutcome::RetryWithNewJacobian | CorrectorOutcome::ConvergenceFailure => {
                    self.st.state.zn.restore(q as usize);
                    if let Some(chan) = self.st.quad.as_mut() {
                        chan.zn.restore(q as usize);
                    }
                    self.st.sens.as_mut().expect("sens attached").zn.restore(q as usize, ns);
                    self.st.force_setup = true;
                    self.st.pending_convfail = if matches!(outcome, CorrectorOutcome::RetryWithNewJacobian) {
                        ConvFail::FailBadJ
                    } else {
                        ConvFail::FailOther
                    };
                    match self.st.conv_fail.record_failure() {
                        ConvFailAction::Retry => {
                            self.st.h = self.st.h * C::T::from_f64(crate::nonlinear_fail::ETACF);
                            self.st.coeffs = self.recompute_coeffs(q, self.st.h, self.st.qwait);
                            continue;
                        }
                        ConvFailAction::GiveUp => {
                            return Err(IntegratorError::ConvFailure {
                                t: num_traits::NumCast::from(self.st.tn).unwrap_or(0.0),
                                h: num_traits::NumCast::from(self.st.h).unwrap_or(0.0),
                            })
                        }
                    }
                }
                CorrectorOutcome::LinearSolverUnrecoverable(msg) => {
                    return Err(IntegratorError::SolveFailure {
                        t: num_traits::NumCast::from(self.st.tn).unwrap_or(0.0),
                        source: msg,
                    })
                }
            }
            self.st.conv_fail.record_success();

            let acor_wrms = self.st.state.acor.wrms_norm(&self.st.state.ewt);
            let (mut dsm, _) = error_test::local_error_test(acor_wrms, self.st.coeffs.tq[2]);

            if let Some(quad) = &self.quad {
                let fq = (quad.f)(self.st.tn + self.st.h, &y_cur, &self.p);
                self.st.stats.nfqe += 1;
                let chan = self.st.quad.as_mut().expect("self.quad implies st.quad");
                let mut corr = chan.zn.zn[1].clone();
                corr.scale(-C::T::one());
                corr.axpy(self.st.h, &fq);
                corr.scale(rl1);
                chan.acor.copy_from(&corr);
                if self.opts.errcon_q == ErrorControl::Full {
                    let dsm_q = chan.acor.wrms_norm(&chan.ewt) / self.st.coeffs.tq[2];
                    if dsm_q > dsm {
                        dsm = dsm_q;
                    }
                }
            }

            let t_now = self.st.tn + self.st.h;
            let ydot_cur = self.rhs.call(t_now, &y_cur, &self.p);
            let ewt_state = self.st.state.ewt.clone();
            let rtol = self.tol.rtol;

            let sens_result = {
                let rhs_ref = &self.rhs;
                let p_ref = &self.p;
                let sens = self.sens.as_mut().expect("checked sens.is_some() above");
                let kind = &sens.kind;
                let mut fs_closure = |i: usize, tt: C::T, yy: &C::V, pp: &C::V, ys_i: &C::V| -> C::V {
                    match kind {
                        SensRhsKind::Analytic(f) => f(i, tt, yy, pp, ys_i),
                        SensRhsKind::Dq(dq) => dq.eval_one(i, tt, yy, pp, &ydot_cur, ys_i, &ewt_state, rtol, |t2, y2, p2| {
                            rhs_ref.call(t2, y2, p2)
                        }),
                    }
                };
                let staggered = &mut sens.staggered;

                let sens_chan = self.st.sens.as_mut().expect("attach_sensitivities sets st.sens");
                let ys_pred = sens_chan.zn.zn[0].clone();
                let zn1_s = sens_chan.zn.zn[1].clone();
                let mut ys_cur = ys_pred.clone();

                let mut phase = SensPhase {
                    staggered,
                    fs: &mut fs_closure,
                    t: t_now,
                    y: &y_cur,
                    p: p_ref,
                    rl1,
                    gamma,
                    ys_pred: &ys_pred,
                    zn1_s: &zn1_s,
                    ewt_s: &sens_chan.ewt,
                    tq4_s: tq4,
                    ys_cur: &mut ys_cur,
                    acor_s: &mut sens_chan.acor,
                };

                self.corrector.correct_sens(&mut phase)
            };

            match sens_result {
                CorrectorOutcome::Converged { niter } => {
                    self.st.stats.nni_s += niter as u64;
                    if let Some(SensSource { kind: SensRhsKind::Dq(dq), .. }) = &self.sens {
                        self.st.stats.nfse = dq.nfe_s.get() as u64;
                    }
                }
                CorrectorOutcome::RetryWithNewJacobian | CorrectorOutcome::ConvergenceFailure => {
                    self.st.state.zn.restore(q as usize);
                    if let Some(chan) = self.st.quad.as_mut() {
                        chan.zn.restore(q as usize);
                    }
                    self.st.sens.as_mut().expect("sens attached").zn.restore(q as usize, ns);
                    self.st.stats.ncfn_s += 1;
                    self.st.force_setup = true;
                    self.st.pending_convfail = if matches!(sens_result, CorrectorOutcome::RetryWithNewJacobian) {
                        ConvFail::FailBadJ
                    } else {
                        ConvFail::FailOther
                    };
                    match self.st.conv_fail.record_failure() {
                        ConvFailAction::Retry => {
                            self.st.h = self.st.h * C::T::from_f64(crate::nonlinear_fail::ETACF);
                            self.st.coeffs = self.recompute_coeffs(q, self.st.h, self.st.qwait);
                            continue;
                        }
                        ConvFailAction::GiveUp => {
                            return Err(IntegratorError::ConvFailure {
                                t: num_traits::NumCast::from(self.st.tn).unwrap_or(0.0),
                                h: num_traits::NumCast::from(self.st.h).unwrap_or(0.0),
                            })
                        }
                    }
                }
                CorrectorOutcome::LinearSolverUnrecoverable(msg) => {
                    return Err(IntegratorError::SolveFailure {
                        t: num_traits::NumCast::from(self.st.tn).unwrap_or(0.0),
                        source: msg,
                    })
                }
            }

            if self.opts.errcon == ErrorControl::Full {
                let sens_chan = self.st.sens.as_ref().expect("sens attached");
                let dsm_s = sens_chan.acor.wrms_norm_max(&sens_chan.ewt) / self.st.coeffs.tq[2];
                if dsm_s > dsm {
                    dsm = dsm_s;
                }
            }

            let test = if dsm <= C::T::one() {
                ErrorTestOutcome::Passed
            } else {
                ErrorTestOutcome::Failed
            };

            match test {
                ErrorTestOutcome::Failed => {
                    self.st.state.zn.restore(q as usize);
                    if let Some(chan) = self.st.quad.as_mut() {
                        chan.zn.restore(q as usize);
                    }
                    self.st.sens.as_mut().expect("sens attached").zn.restore(q as usize, ns);
                    self.st.stats.netf += 1;
                    self.st.stats.netf_s += 1;
                    self.st.force_setup = true;
                    self.st.pending_convfail = ConvFail::FailOther;
                    let action = self.st.err_test.record_failure(q);
                    let action = if self.h_below_hmin() { ErrFailAction::GiveUp } else { action };
                    match action {
                        ErrFailAction::ShrinkStep { cap_etamxf } => {
                            let mut eta = C::T::one()
                                / (C::T::from_f64(controller::BIAS2)
                                    * num_traits::Float::powf(dsm, C::T::one() / C::T::from_f64((q + 1) as f64))
                                    + C::T::from_f64(controller::ADDON));
                            if cap_etamxf {
                                eta = num_traits::Float::min(eta, C::T::from_f64(error_test::ETAMXF));
                            }
                            eta = num_traits::Float::max(eta, self.error_test_eta_floor());
                            let eta = controller::clamp_eta(eta, C::T::one());
                            self.st.h = self.st.h * eta;
                            self.st.state.zn.rescale(q as usize, eta);
                            if let Some(chan) = self.st.quad.as_mut() {
                                chan.zn.rescale(q as usize, eta);
                            }
                            self.st.sens.as_mut().expect("sens attached").zn.rescale(q as usize, ns, eta);
                            self.st.coeffs = self.recompute_coeffs(q, self.st.h, self.st.qwait);
                            logging::debug_step_rejected(
                                num_traits::NumCast::from(self.st.tn).unwrap_or(0.0),
                                num_traits::NumCast::from(self.st.h).unwrap_or(0.0),
                                "local error test (sensitivity-coupled)",
                            );
                            continue;
                        }
                        ErrFailAction::ReduceOrder => {
                            self.apply_order_change(q, q - 1);
                            self.commit_sens_order_reduce(q, ns);
                            self.st.q = q - 1;
                            self.st.qprime = self.st.q;
                            self.st.qwait = self.st.q + 1;
                            let eta = self.error_test_eta_floor();
                            self.st.h = self.st.h * eta;
                            self.st.hscale = self.st.h;
                            self.st.state.zn.rescale(self.st.q as usize, eta);
                            if let Some(chan) = self.st.quad.as_mut() {
                                chan.zn.rescale(self.st.q as usize, eta);
                            }
                            self.st.sens.as_mut().expect("sens attached").zn.rescale(self.st.q as usize, ns, eta);
                            self.st.coeffs = self.recompute_coeffs(self.st.q, self.st.h, self.st.qwait);
                            continue;
                        }
                        ErrFailAction::Restart => {
                            let eta = self.error_test_eta_floor();
                            self.st.h = self.st.h * eta;
                            self.st.hscale = self.st.h;
                            self.st.qwait = 10;
                            self.st.q = 1;
                            self.st.qprime = 1;
                            self.st.sldet.reset();
                            self.restart_state_and_quad();
                            self.restart_sens();
                            self.st.coeffs = self.recompute_coeffs(1, self.st.h, self.st.qwait);
                            continue;
                        }
                        ErrFailAction::GiveUp => {
                            return Err(IntegratorError::ErrFailure {
                                t: num_traits::NumCast::from(self.st.tn).unwrap_or(0.0),
                                h: num_traits::NumCast::from(self.st.h).unwrap_or(0.0),
                            })
                        }
                    }
                }
                ErrorTestOutcome::Passed => break,
            }
        }

        let (ell, eta) = self.accept_step();
        self.commit_sens(q_committed, &ell, eta);
        Ok(())
    }

    /// Sensitivity-aware counterpart of [`Driver::solve`]: identical
    /// tstop/mode handling, but drives [`Self::step_with_sensitivities`]
    /// instead of [`Driver::step`] so an attached sensitivity channel is
    /// actually advanced. [`Driver::solve`] cannot do this itself — it is
    /// generic over any [`Corrector`], and the staggered sensitivity step
    /// loop only exists for a Newton-backed one (`spec.md` §4.4).
    pub fn solve_with_sensitivities(&mut self, tout: C::T, mode: Mode<C::T>) -> IntegratorResult<(C::T, StepStatus)> {
        let tstop = match mode {
            Mode::NormalTstop(t) | Mode::OneStepTstop(t) => {
                if (tout - self.st.tn) * (t - self.st.tn) < C::T::zero() && self.st.tn != t {
                    return Err(IntegratorError::StopBeforeCurrentTime {
                        tstop: num_traits::NumCast::from(t).unwrap_or(0.0),
                        tn: num_traits::NumCast::from(self.st.tn).unwrap_or(0.0),
                    });
                }
                Some(t)
            }
            _ => None,
        };

        let mut nsteps = 0u32;
        loop {
            if let Some(t) = tstop {
                if num_traits::Float::abs(self.st.tn - t) <= C::T::uround() * num_traits::Float::abs(t) {
                    return Ok((self.st.tn, StepStatus::ReachedTstop));
                }
                let dist_to_tstop = t - self.st.tn;
                if num_traits::Float::abs(self.st.h) > num_traits::Float::abs(dist_to_tstop) {
                    self.st.h = dist_to_tstop;
                }
            }

            self.check_numerical_limits()?;
            self.step_with_sensitivities()?;
            nsteps += 1;

            match mode {
                Mode::OneStep | Mode::OneStepTstop(_) => return Ok((self.st.tn, StepStatus::TookOneStep)),
                _ => {}
            }

            let reached = if tout >= self.st.tn {
                self.st.tn >= tout
            } else {
                self.st.tn <= tout
            };
            if reached {
                return Ok((self.st.tn, StepStatus::ReachedTout));
            }

            if nsteps >= self.opts.mxstep {
                return Err(IntegratorError::TooMuchWork {
                    t: num_traits::NumCast::from(self.st.tn).unwrap_or(0.0),
                    tout: num_traits::NumCast::from(tout).unwrap_or(0.0),
                    mxstep: self.opts.mxstep,
                });
            }
        }
    }

    /// `spec.md` §9 resolution of `CVodeGetNumStgrSensNonlinSolvIters`: the
    /// per-parameter sensitivity iteration counts, meaningful only under
    /// STAGGERED1 coupling. `None` for any other coupling mode or when no
    /// sensitivity channel is attached, rather than aliasing stale data
    /// through an out-parameter.
    pub fn stagger1_nonlin_iters(&self) -> Option<&[usize]> {
        self.sens.as_ref().and_then(|s| {
            if s.staggered.coupling() == StaggeredCoupling::Staggered1 {
                Some(s.staggered.niters())
            } else {
                None
            }
        })
    }

    /// Sensitivity counterpart of [`Driver::get_dky`] (`spec.md` §4.10
    /// GetDky, generalized to `znS`): the `k`-th derivative of every
    /// attached sensitivity vector at `t`, same validity window as the
    /// state interpolant. `Err(DkyError::SensitivitiesNotAttached)` if no
    /// sensitivity channel was ever attached.
    pub fn get_sens_dky(&self, t: C::T, k: usize) -> Result<VectorOfVectors<C::V>, DkyError> {
        const FUZZ_FACTOR: f64 = 100.0;
        let sens_chan = self.st.sens.as_ref().ok_or(DkyError::SensitivitiesNotAttached)?;
        if k as u32 > self.st.q {
            return Err(DkyError::DerivativeOrderTooHigh { k, q: self.st.q });
        }
        let tfuzz = C::T::uround() * C::T::from_f64(FUZZ_FACTOR) * (num_traits::Float::abs(self.st.tn) + num_traits::Float::abs(self.st.h));
        let tfuzz = if self.st.h < C::T::zero() { -tfuzz } else { tfuzz };
        let tp = self.st.tn - self.st.hu - tfuzz;
        let t1 = self.st.tn + tfuzz;
        let (lo, hi) = if self.st.h >= C::T::zero() { (tp, t1) } else { (t1, tp) };
        if (t - lo) * (t - hi) > C::T::zero() {
            return Err(DkyError::TimeOutOfInterpolationWindow {
                t: num_traits::NumCast::from(t).unwrap_or(0.0),
                lo: num_traits::NumCast::from(lo).unwrap_or(0.0),
                hi: num_traits::NumCast::from(hi).unwrap_or(0.0),
            });
        }
        Ok(sens_chan.zn.dky(t, k, self.st.tn, self.st.h, self.st.q as usize, sens_chan.ns))
    }
}
