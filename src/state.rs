//! The integrator data model (`spec.md` §3): the Nordsieck histories,
//! step/order bookkeeping, running counters, and the optional quadrature
//! and sensitivity channels, gathered into one struct the driver threads
//! through a step attempt.

use serde::Serialize;

use crate::coefficients::{Coefficients, Lmm};
use crate::error_test::ErrorTestTracker;
use crate::nonlinear_fail::ConvFailTracker;
use crate::nordsieck::{Nordsieck, NordsieckFamily};
use crate::scalar::Scalar;
use crate::stability::SldetWindow;
use crate::vector::{Vector, VectorOfVectors};

/// Running counters exposed to callers and snapshot tests (`spec.md` §3
/// "diagnostic accessors"). Deliberately plain data — no derived
/// quantities are cached here that the state above doesn't already own.
#[derive(Debug, Clone, Default, Serialize)]
pub struct IntegratorStats {
    pub nst: u64,
    pub nfe: u64,
    pub nsetups: u64,
    pub netf: u64,
    pub ncfn: u64,
    pub nni: u64,
    pub nhnil: u32,
    pub qu: u32,
    pub qcur: u32,
    pub hu: f64,
    pub hcur: f64,
    pub tcur: f64,
    pub nfqe: u64,
    pub netf_q: u64,
    pub nfse: u64,
    pub netf_s: u64,
    pub ncfn_s: u64,
    pub nni_s: u64,
    /// Order reductions forced by the BDF stability-limit detector
    /// (`spec.md` §3 `nor`, §4.9).
    pub nor: u32,
}

/// Per-step quantities for the primary state channel (`spec.md` §3).
pub struct StateChannel<V: Vector> {
    pub zn: Nordsieck<V>,
    pub ewt: V,
    pub acor: V,
    pub tau: Vec<V::T>,
}

impl<V: Vector> StateChannel<V> {
    pub fn new(qmax: usize, n: usize) -> Self {
        Self {
            zn: Nordsieck::new(qmax, n),
            ewt: V::zeros(n),
            acor: V::zeros(n),
            tau: vec![V::T::zero(); qmax + 2],
        }
    }
}

/// Quadrature channel (`spec.md` §6.3 component L): a plain Nordsieck
/// history over the quadrature variables, no corrector of its own — it is
/// evaluated once per accepted step.
pub struct QuadChannel<V: Vector> {
    pub zn: Nordsieck<V>,
    pub ewt: V,
    pub acor: V,
}

impl<V: Vector> QuadChannel<V> {
    pub fn new(qmax: usize, nq: usize) -> Self {
        Self {
            zn: Nordsieck::new(qmax, nq),
            ewt: V::zeros(nq),
            acor: V::zeros(nq),
        }
    }
}

/// Forward sensitivity channel (`spec.md` §6.3 component M): `Ns` parallel
/// Nordsieck histories sharing the state channel's order and step size.
pub struct SensChannel<V: Vector> {
    pub zn: NordsieckFamily<V>,
    pub ewt: Vec<V>,
    pub acor: VectorOfVectors<V>,
    pub ns: usize,
}

impl<V: Vector> SensChannel<V> {
    pub fn new(qmax: usize, ns: usize, n: usize) -> Self {
        Self {
            zn: NordsieckFamily::new(qmax, ns, n),
            ewt: (0..ns).map(|_| V::zeros(n)).collect(),
            acor: VectorOfVectors::zeros(ns, n),
            ns,
        }
    }
}

/// Everything the step loop needs that is not the user's problem data
/// itself (`spec.md` §3).
pub struct IntegratorState<V: Vector> {
    pub lmm: Lmm,
    pub q: u32,
    pub qprime: u32,
    pub qwait: u32,
    pub h: V::T,
    pub hprime: V::T,
    pub hscale: V::T,
    pub eta: V::T,
    pub hu: V::T,
    pub tn: V::T,
    pub coeffs: Coefficients<V::T>,
    /// `gamma` at the last linear-solver setup, the step count at that
    /// setup, and their running ratio — the three quantities the Newton
    /// setup decision (`spec.md` §4.3) reads to decide whether the
    /// iteration matrix is stale. `force_setup` is set whenever a
    /// convergence or error-test retry requires a setup on the next
    /// attempt regardless of these.
    pub gamma_p: V::T,
    pub gamrat: V::T,
    pub nstlp: u64,
    pub force_setup: bool,
    pub pending_convfail: crate::linear_solver::ConvFail,
    pub state: StateChannel<V>,
    pub quad: Option<QuadChannel<V>>,
    pub sens: Option<SensChannel<V>>,
    pub err_test: ErrorTestTracker,
    pub conv_fail: ConvFailTracker,
    pub sldet: SldetWindow<V::T>,
    pub stats: IntegratorStats,
}

impl<V: Vector> IntegratorState<V> {
    pub fn new(lmm: Lmm, n: usize, maxnef: u32, maxncf: u32) -> Self {
        let qmax = lmm.qmax() as usize;
        Self {
            lmm,
            q: 1,
            qprime: 1,
            qwait: match lmm {
                Lmm::Bdf => 1,
                Lmm::Adams => 1,
            },
            h: V::T::zero(),
            hprime: V::T::zero(),
            hscale: V::T::zero(),
            eta: V::T::one(),
            hu: V::T::zero(),
            tn: V::T::zero(),
            coeffs: Coefficients {
                ell: vec![V::T::one(); 2],
                tq: [V::T::zero(); 6],
                saved_tq5: V::T::one(),
            },
            gamma_p: V::T::zero(),
            gamrat: V::T::one(),
            nstlp: 0,
            force_setup: false,
            pending_convfail: crate::linear_solver::ConvFail::NoFailures,
            state: StateChannel::new(qmax, n),
            quad: None,
            sens: None,
            err_test: ErrorTestTracker::new(maxnef),
            conv_fail: ConvFailTracker::new(maxncf),
            sldet: SldetWindow::new(),
            stats: IntegratorStats::default(),
        }
    }

    pub fn attach_quad(&mut self, nq: usize) {
        self.quad = Some(QuadChannel::new(self.lmm.qmax() as usize, nq));
    }

    pub fn attach_sens(&mut self, ns: usize, n: usize) {
        self.sens = Some(SensChannel::new(self.lmm.qmax() as usize, ns, n));
    }
}
