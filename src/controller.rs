//! The step/order controller.
//!
//! After a step is accepted, evaluates the local-error-based step-size
//! ratio at orders `q-1`, `q`, `q+1` and picks whichever yields the
//! largest `eta`, subject to the `etamax` ceiling that itself decays as
//! the run matures (grounded on CVODE's `cvSetEta`/`cvChooseEta`).

use crate::scalar::Scalar;

pub const THRESH: f64 = 1.5;
pub const ETAMX1: f64 = 10000.0;
pub const ETAMX2: f64 = 10.0;
pub const ETAMX3: f64 = 10.0;
pub const ETAMIN: f64 = 0.1;
pub const BIAS1: f64 = 6.0;
pub const BIAS2: f64 = 6.0;
pub const BIAS3: f64 = 10.0;
pub const ADDON: f64 = 1.0e-6;
pub const SMALL_NST: u32 = 10;
/// How many steps at the current order a step must accumulate before an
/// order change is even considered (CVODE's `qwait`).
pub const L_MAX_WAIT: u32 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderChoice {
    Decrease,
    Same,
    Increase,
}

/// `etamax` as a function of how many steps have been taken, mirroring
/// CVODE's staged ceiling (`ETAMX1` for the first step, `ETAMX2` while the
/// run is young, `ETAMX3` afterward).
pub fn etamax_for_step_count(nst: u64) -> f64 {
    if nst == 0 {
        ETAMX1
    } else if nst <= SMALL_NST as u64 {
        ETAMX2
    } else {
        ETAMX3
    }
}

/// `eta_q = 1 / (bias * dsm^(1/(q+1)) + addon)`, clamped so a change
/// smaller than `THRESH` is not worth taking.
fn eta_from_dsm<T: Scalar>(dsm: T, order_for_power: u32, bias: T) -> T {
    let inv_power = T::one() / T::from_f64((order_for_power + 1) as f64);
    let scaled = num_traits::Float::powf(dsm, inv_power);
    T::one() / (bias * scaled + T::from_f64(ADDON))
}

pub struct StepCandidate<T: Scalar> {
    pub order: OrderChoice,
    pub eta: T,
}

/// Evaluate the three candidate etas and pick the winner.
/// `dsm_qm1`/`dsm_qp1` are `None` when that order is not available (`q==1`
/// for decrease, `q==qmax` or insufficient history for increase).
pub fn choose_order_and_eta<T: Scalar>(
    q: u32,
    qmax: u32,
    etaq: T,
    dsm_qm1: Option<T>,
    dsm_qp1: Option<T>,
) -> StepCandidate<T> {
    let eta_qm1 = dsm_qm1.map(|dsm| eta_from_dsm(dsm, q - 1, T::from_f64(BIAS1)));
    let eta_qp1 = if q < qmax {
        dsm_qp1.map(|dsm| eta_from_dsm(dsm, q + 1, T::from_f64(BIAS3)))
    } else {
        None
    };
    let etaq_biased = etaq; // already bias-scaled by the caller via BIAS2 on tq[2]

    let mut best_eta = etaq_biased;
    let mut best_order = OrderChoice::Same;

    if let Some(e) = eta_qm1 {
        if e > best_eta {
            best_eta = e;
            best_order = OrderChoice::Decrease;
        }
    }
    if let Some(e) = eta_qp1 {
        if e > best_eta {
            best_eta = e;
            best_order = OrderChoice::Increase;
        }
    }

    if best_eta < T::from_f64(THRESH) {
        best_eta = T::one();
        best_order = OrderChoice::Same;
    }

    StepCandidate {
        order: best_order,
        eta: best_eta,
    }
}

/// Clamp `eta` to `[ETAMIN, etamax]` and to the `hmin`/`hmax` bounds
/// translated into an eta range by the caller.
pub fn clamp_eta<T: Scalar>(eta: T, etamax: T) -> T {
    let lo = T::from_f64(ETAMIN);
    let mut e = eta;
    if e < lo {
        e = lo;
    }
    if e > etamax {
        e = etamax;
    }
    e
}
