//! The initial-step heuristic, grounded on `CVHin`/`CVUpperBoundH0`/
//! `CVYddNorm` in `cvodes.c`.
//!
//! The upper-bound/lower-bound crossing that the source papers over with
//! an early geometric-mean short-circuit is made explicit here as
//! [`InitialStepOutcome::BoundsCrossed`].

use crate::scalar::Scalar;
use crate::vector::Vector;

const HLB_FACTOR: f64 = 100.0;
const HUB_FACTOR: f64 = 0.1;
const MAX_ITERS: u32 = 4;
const H_BIAS: f64 = 0.5;

pub enum InitialStepOutcome<T> {
    /// `hub < hlb`: the bounds crossed (can happen for near-constant
    /// trajectories). The geometric mean is returned
    /// directly without iterating, matching `CVHin`'s short-circuit.
    BoundsCrossed(T),
    Iterated(T),
}

impl<T: Scalar> InitialStepOutcome<T> {
    pub fn value(&self) -> T {
        match self {
            InitialStepOutcome::BoundsCrossed(h) | InitialStepOutcome::Iterated(h) => *h,
        }
    }
}

/// `hub_inv = max_i |zn1[i]| / (HUB_FACTOR*|zn0[i]| + atol[i])`, extended
/// across quadratures/sensitivities under `errcon == FULL` by the caller
/// passing additional `(y, ydot, atol)` triples via `extra_channels`.
pub fn upper_bound_h0<V: Vector>(
    y0: &V,
    ydot0: &V,
    atol: &V,
    tdist: V::T,
    extra_channels: &[(V, V, V)],
) -> V::T {
    let channel_hub_inv = |y: &V, ydot: &V, atol: &V| -> V::T {
        let mut denom = y.abs();
        denom.scale(V::T::from_f64(HUB_FACTOR));
        denom += atol;
        ydot.abs().component_div(&denom).max_norm()
    };

    let mut hub_inv = channel_hub_inv(y0, ydot0, atol);
    for (y, ydot, atol_i) in extra_channels {
        let hi = channel_hub_inv(y, ydot, atol_i);
        if hi > hub_inv {
            hub_inv = hi;
        }
    }

    let mut hub = V::T::from_f64(HUB_FACTOR) * tdist;
    if hub * hub_inv > V::T::one() {
        hub = V::T::one() / hub_inv;
    }
    hub
}

/// Run the bracket + second-derivative-probe iteration.
/// `ydd_norm` evaluates `||y''||` at `(t0 + sign*hg)` by a difference
/// quotient against `f` — supplied by the caller since it needs access to
/// the RHS callback and its own scratch state.
pub fn initial_step<T, F>(
    t0: T,
    tout: T,
    uround: T,
    hub: T,
    mut ydd_norm: F,
) -> Option<InitialStepOutcome<T>>
where
    T: Scalar,
    F: FnMut(T) -> T,
{
    let tdiff = tout - t0;
    if tdiff == T::zero() {
        return None;
    }
    let sign = if tdiff > T::zero() { T::one() } else { -T::one() };
    let tdist = num_traits::Float::abs(tdiff);
    let tround = uround * num_traits::Float::max(num_traits::Float::abs(t0), num_traits::Float::abs(tout));
    if tdist < T::from_f64(2.0) * tround {
        return None;
    }

    let hlb = T::from_f64(HLB_FACTOR) * tround;
    let mut hg = num_traits::Float::sqrt(hlb * hub);

    if hub < hlb {
        let hg_signed = if sign < T::zero() { -hg } else { hg };
        return Some(InitialStepOutcome::BoundsCrossed(hg_signed));
    }

    let mut hnew = hg;
    let mut count = 0u32;
    loop {
        let hgs = hg * sign;
        let yddnrm = ydd_norm(hgs);
        hnew = if yddnrm * hub * hub > T::from_f64(2.0) {
            num_traits::Float::sqrt(T::from_f64(2.0) / yddnrm)
        } else {
            num_traits::Float::sqrt(hg * hub)
        };
        count += 1;
        if count >= MAX_ITERS {
            break;
        }
        let hrat = hnew / hg;
        if hrat > T::from_f64(0.5) && hrat < T::from_f64(2.0) {
            break;
        }
        if count >= 2 && hrat > T::from_f64(2.0) {
            hnew = hg;
            break;
        }
        hg = hnew;
    }

    let mut h0 = T::from_f64(H_BIAS) * hnew;
    if h0 < hlb {
        h0 = hlb;
    }
    if h0 > hub {
        h0 = hub;
    }
    if sign < T::zero() {
        h0 = -h0;
    }
    Some(InitialStepOutcome::Iterated(h0))
}

/// `||y''||` estimated from a forward difference of `f` at `t0+hg` against
/// `f` at `t0` (the second-derivative probe).
pub fn ydd_norm<V, F>(t0: V::T, y0: &V, f0: &V, ewt: &V, hg: V::T, mut f: F) -> V::T
where
    V: Vector,
    F: FnMut(V::T, &V) -> V,
{
    let mut y1 = y0.clone();
    y1.axpy(hg, f0);
    let f1 = f(t0 + hg, &y1);
    let mut df = f1 - f0.clone();
    df.scale(V::T::one() / hg);
    df.wrms_norm(ewt)
}
