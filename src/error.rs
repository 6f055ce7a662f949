//! Error taxonomy for the integrator (`spec.md` §7).
//!
//! Five classes are distinguished: precondition errors, resource errors,
//! algorithmic-recoverable failures, algorithmic-unrecoverable failures, and
//! numerical-limit conditions. Recoverable algorithmic failures are never
//! folded into this enum as a plain numeric code (see `spec.md` §9 on the
//! `TRY_AGAIN` sentinel) — they are represented separately by
//! [`crate::corrector::CorrectorOutcome`] and [`StepStatus`].

use thiserror::Error;

use crate::driver::DkyError;

/// Errors the driver can return from `CVode`-style calls (`spec.md` §6.6).
#[derive(Error, Debug, Clone, PartialEq)]
pub enum IntegratorError {
    // --- precondition errors: surfaced immediately, no state mutated ---
    #[error("tolerance must be strictly positive, got rtol={rtol}, atol={atol}")]
    IllegalTolerance { rtol: f64, atol: f64 },

    #[error("absolute tolerance vector length {got} does not match state length {expected}")]
    AbsoluteToleranceLengthMismatch { got: usize, expected: usize },

    #[error("hmin ({hmin}) is greater than hmax ({hmax})")]
    InconsistentStepBounds { hmin: f64, hmax: f64 },

    #[error("maxord ({requested}) exceeds the method's qmax ({qmax})")]
    MaxOrderExceedsQmax { requested: u32, qmax: u32 },

    #[error("tstop ({tstop}) has already been passed by tn ({tn}) in the direction of integration")]
    StopBeforeCurrentTime { tstop: f64, tn: f64 },

    #[error("pbar is required whenever a sensitivity parameter uses difference-quotient defaults or automatic tolerance derivation")]
    MissingPbar,

    #[error("illegal input: {0}")]
    IllegalInput(String),

    // --- resource errors ---
    #[error("allocation failed: {0}")]
    AllocationFailed(String),

    #[error("integrator has not been allocated a problem (call set_problem first)")]
    NotAllocated,

    // --- algorithmic recoverable, exhausted ---
    #[error("too many error test failures at t={t}, h={h}")]
    ErrFailure { t: f64, h: f64 },

    #[error("too many nonlinear convergence failures at t={t}, h={h}")]
    ConvFailure { t: f64, h: f64 },

    #[error("initial step selection failed: requested interval is indistinguishable from a point at the current precision")]
    TooCloseToInitialTime,

    // --- algorithmic unrecoverable, surfaced directly from the linear solver ---
    #[error("linear solver setup failed unrecoverably at t={t}: {source}")]
    SetupFailure { t: f64, source: String },

    #[error("linear solver solve failed unrecoverably at t={t}: {source}")]
    SolveFailure { t: f64, source: String },

    // --- numerical limits ---
    #[error("error weight component {index} is non-positive ({value})")]
    BadErrorWeight { index: usize, value: f64 },

    #[error("requested accuracy cannot be reached at t={t}: tolsf={tolsf} > 1")]
    TooMuchAccuracy { t: f64, tolsf: f64 },

    #[error("maximum number of internal steps ({mxstep}) exceeded at t={t} while trying to reach tout={tout}")]
    TooMuchWork { t: f64, tout: f64, mxstep: u32 },

    #[error("dense output error: {0}")]
    DenseOutput(#[from] DkyError),
}

pub type IntegratorResult<T> = Result<T, IntegratorError>;
