//! The option surface (`spec.md` §6.5) and its precondition validation,
//! grounded on CVODE's `CVodeSetXxx` family and the checks `CVodeInit`/
//! `CVodeSensInit` perform before accepting them. Serializable with
//! `serde` so a harness can snapshot the configuration alongside the
//! solver statistics (`spec.md` §3 ambient-stack note).

use serde::{Deserialize, Serialize};

use crate::coefficients::Lmm;
use crate::error::{IntegratorError, IntegratorResult};
use crate::op::sens_rhs::SensRhsAll;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IterationType {
    Functional,
    Newton,
}

/// `spec.md` §6.3 L: whether a channel contributes to the accumulated
/// local error test (`FULL`) or is integrated without feeding it back
/// (`PARTIAL`/off).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorControl {
    Full,
    Off,
}

/// `spec.md` §4.4: how forward sensitivities are coupled to the state
/// correction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SensitivityCoupling {
    Simultaneous,
    Staggered,
    Staggered1,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Options {
    pub lmm: Lmm,
    pub iter: IterationType,
    pub maxord: u32,
    pub mxstep: u32,
    pub mxhnil: u32,
    pub hin: f64,
    pub hmin: f64,
    pub hmax_inv: f64,
    pub tstop: Option<f64>,
    pub maxnef: u32,
    pub maxncf: u32,
    pub maxcor: usize,
    pub maxcor_s: usize,
    pub nlscoef: f64,
    pub sldeton: bool,
    pub rhomax: f64,
    pub pbar: Option<Vec<f64>>,
    pub plist: Option<Vec<i64>>,
    pub errcon: ErrorControl,
    pub errcon_q: ErrorControl,
    pub sens_coupling: Option<SensitivityCoupling>,
}

impl Options {
    pub fn new(lmm: Lmm, iter: IterationType) -> Self {
        Self {
            maxord: lmm.qmax(),
            lmm,
            iter,
            mxstep: 500,
            mxhnil: 10,
            hin: 0.0,
            hmin: 0.0,
            hmax_inv: 0.0,
            tstop: None,
            maxnef: 7,
            maxncf: 10,
            maxcor: 3,
            maxcor_s: 3,
            nlscoef: 0.1,
            sldeton: matches!(lmm, Lmm::Bdf),
            rhomax: 0.0,
            pbar: None,
            plist: None,
            errcon: ErrorControl::Full,
            errcon_q: ErrorControl::Off,
            sens_coupling: None,
        }
    }

    /// Preconditions `CVodeInit`/`CVodeSetMaxOrd`/etc. check eagerly, before
    /// any state mutation (`spec.md` §7 class 1).
    pub fn validate(&self, n: usize, ns: usize) -> IntegratorResult<()> {
        if self.maxord == 0 || self.maxord > self.lmm.qmax() {
            return Err(IntegratorError::MaxOrderExceedsQmax {
                requested: self.maxord,
                qmax: self.lmm.qmax(),
            });
        }
        if self.hmin > 0.0 && self.hmax_inv > 0.0 && self.hmin > 1.0 / self.hmax_inv {
            return Err(IntegratorError::InconsistentStepBounds {
                hmin: self.hmin,
                hmax: 1.0 / self.hmax_inv,
            });
        }
        if ns > 0 {
            let needs_pbar = self.rhomax != 0.0 || self.pbar.is_none();
            if needs_pbar {
                match &self.pbar {
                    Some(p) if p.len() == ns => {}
                    Some(p) => {
                        return Err(IntegratorError::IllegalInput(format!(
                            "pbar length {} does not match nparams {}",
                            p.len(),
                            ns
                        )))
                    }
                    None => return Err(IntegratorError::MissingPbar),
                }
            }
        }
        let _ = n;
        Ok(())
    }
}

/// Marker bound used by the driver to require an analytic `fS`/`fS1`
/// callback is present whenever `rhomax` signals "don't use DQ defaults" —
/// kept separate from [`Options`] itself since the callback, not a flag,
/// is what the driver actually needs (`spec.md` §6.3 component M).
pub trait SensitivityProblem<T: crate::scalar::Scalar, V: crate::vector::Vector<T = T>>:
    SensRhsAll<T, V>
{
}
impl<T: crate::scalar::Scalar, V: crate::vector::Vector<T = T>, X: SensRhsAll<T, V>>
    SensitivityProblem<T, V> for X
{
}
