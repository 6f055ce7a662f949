//! The Adams and BDF coefficient engine.
//!
//! Computes the ℓ-polynomial that advances the Nordsieck array and the
//! test-quantity vector `tq` that drives the error test (`error_test.rs`),
//! the nonlinear convergence test (`corrector/`), and order selection
//! (`controller.rs`). Grounded on the teacher's `ode_solver::bdf` `_compute_R`
//! step-ratio machinery, generalized to both LMM families and to the full
//! `tq[1..5]` vector a complete order controller needs (the teacher draft
//! only tracked `error_const`, a single scalar per order).

use crate::scalar::Scalar;

/// Linear multistep family, immutable after creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lmm {
    Adams,
    Bdf,
}

impl Lmm {
    pub fn qmax(self) -> u32 {
        match self {
            Lmm::Adams => 12,
            Lmm::Bdf => 5,
        }
    }
}

/// The coefficient vector `ell[0..=L]` and test quantities `tq[1..=5]`
/// produced for a single step at order `q`.
#[derive(Debug, Clone)]
pub struct Coefficients<T: Scalar> {
    pub ell: Vec<T>,
    pub tq: [T; 6], // 1-indexed, tq[0] unused
    pub saved_tq5: T,
}

/// Alternating sum `sum_{i=0..=iend} (-1)^i * a[i] / (i+k)`; empty sum is
/// zero.
fn alt_sum<T: Scalar>(a: &[T], iend: usize, k: i64) -> T {
    let mut s = T::zero();
    let mut sign = T::one();
    for (i, &ai) in a.iter().enumerate().take(iend + 1) {
        let denom = T::from_f64((i as i64 + k) as f64);
        s += sign * ai / denom;
        sign = -sign;
    }
    s
}

/// Build `m(x) = prod_{j=1..q-1} (1 + x/xi_j)` in ascending powers of `x`,
/// where `xi_j = hsum_j / h` and `hsum_j` is the running sum of `h` plus
/// the last `j-1` entries of `tau` (mirrors CVODE's `CVAdamsStart`). Also
/// returns `tq[1]` when `qwait == 1` (computed mid-loop from the
/// second-to-last `m`, before the final multiplication is folded in — the
/// teacher's `m[]` doubling as `tq[1]` scratch, made an explicit return
/// here instead of an aliased local).
fn adams_start<T: Scalar>(q: u32, h: T, tau: &[T], qwait: u32) -> (Vec<T>, T, Option<T>) {
    let mut m = vec![T::zero(); q as usize + 1];
    m[0] = T::one();
    let mut hsum = h;
    let mut tq1 = None;
    for j in 1..q {
        if j == q - 1 && qwait == 1 {
            let sum = alt_sum(&m, (q - 2) as usize, 2);
            tq1 = Some(m[q as usize - 2] / (T::from_f64(q as f64) * sum));
        }
        let xi_inv = h / hsum;
        for i in (1..=j as usize).rev() {
            m[i] += m[i - 1] * xi_inv;
        }
        hsum += tau[j as usize];
    }
    (m, hsum, tq1)
}

/// Compute Adams-Moulton coefficients and test quantities at order `q`
/// (mirrors CVODE's `CVSetAdams`/`CVAdamsFinish`). `qwait` signals whether an
/// order-increase decision is pending (drives the `tq[1]`/`tq[3]` branch).
pub fn adams_coefficients<T: Scalar>(q: u32, h: T, tau: &[T], qwait: u32, nlscoef: T) -> Coefficients<T> {
    let mut tq = [T::zero(); 6];
    if q == 1 {
        let ell = vec![T::one(), T::one()];
        tq[1] = T::one();
        tq[2] = T::from_f64(2.0);
        tq[3] = T::from_f64(12.0);
        tq[4] = nlscoef * tq[2];
        tq[5] = T::one();
        return Coefficients {
            ell,
            tq,
            saved_tq5: tq[5],
        };
    }

    let (mut m, hsum, tq1) = adams_start(q, h, tau, qwait);
    let m0 = alt_sum(&m, (q - 1) as usize, 1);
    let m1 = alt_sum(&m, (q - 1) as usize, 2);

    let mut ell = vec![T::zero(); q as usize + 1];
    ell[0] = T::one();
    for i in 1..=q as usize {
        ell[i] = (m[i - 1] / T::from_f64(i as f64)) / m0;
    }

    let xi = hsum / h;
    let xi_inv = T::one() / xi;
    tq[2] = xi * m0 / m1;
    tq[5] = xi / ell[q as usize];

    if qwait == 1 {
        for i in (1..=q as usize).rev() {
            m[i] += m[i - 1] * xi_inv;
        }
        let m2 = alt_sum(&m, q as usize, 2);
        let l = T::from_f64((q + 1) as f64);
        tq[3] = l * m0 / m2;
        tq[1] = tq1.expect("tq1 computed in adams_start when qwait == 1");
    }
    tq[4] = nlscoef * tq[2];

    Coefficients {
        ell,
        tq,
        saved_tq5: tq[5],
    }
}

/// Compute BDF coefficients and test quantities at order `q` (mirrors
/// CVODE's `CVSetBDF`/`CVSetTqBDF` recurrence). `ell` is built incrementally as
/// `prod_{j=2..q-1} (1 + x/xi_j) * (1 + x/xi*_q)`, where `xi_j` walks the
/// `tau` window and `xi*_q` is the order-q step-ratio correction.
pub fn bdf_coefficients<T: Scalar>(q: u32, h: T, tau: &[T], qwait: u32, nlscoef: T) -> Coefficients<T> {
    let mut ell = vec![T::zero(); q as usize + 1];
    ell[0] = T::one();
    ell[1] = T::one();
    let mut xi_inv = T::one();
    let mut xistar_inv = T::one();
    let mut alpha0 = -T::one();
    let mut alpha0_hat = -T::one();
    let mut hsum = h;

    if q > 1 {
        for j in 2..q {
            hsum += tau[j as usize - 1];
            xi_inv = h / hsum;
            alpha0 -= T::one() / T::from_f64(j as f64);
            for i in (1..=j as usize).rev() {
                ell[i] += ell[i - 1] * xi_inv;
            }
        }

        alpha0 -= T::one() / T::from_f64(q as f64);
        xistar_inv = -ell[1] - alpha0;
        hsum += tau[q as usize - 1];
        xi_inv = h / hsum;
        alpha0_hat = -ell[1] - xi_inv;
        for i in (1..=q as usize).rev() {
            ell[i] += ell[i - 1] * xistar_inv;
        }
    }

    let a1 = T::one() - alpha0_hat + alpha0;
    let a2 = T::one() + T::from_f64(q as f64) * a1;

    let mut tq = [T::zero(); 6];
    tq[2] = num_traits::Float::abs(alpha0 * (a2 / a1));
    tq[5] = num_traits::Float::abs(a2 / (ell[q as usize] * xi_inv / xistar_inv));

    if qwait == 1 {
        let c = xistar_inv / ell[q as usize];
        let a3 = alpha0 + T::one() / T::from_f64(q as f64);
        let a4 = alpha0_hat + xi_inv;
        let cprime = a3 / (T::one() - a4 + a3);
        tq[1] = num_traits::Float::abs(cprime / c);

        let hsum2 = hsum + tau[q as usize];
        let xi_inv2 = h / hsum2;
        let a5 = alpha0 - T::one() / T::from_f64((q + 1) as f64);
        let a6 = alpha0_hat - xi_inv2;
        let cprime2 = a2 / (T::one() - a6 + a5);
        tq[3] = num_traits::Float::abs(cprime2 * xi_inv2 * T::from_f64((q + 2) as f64) * a5);
    }
    tq[4] = nlscoef * tq[2];

    Coefficients {
        ell,
        tq,
        saved_tq5: tq[5],
    }
}

/// Finalization common to both families: `rl1 = 1/ell[1]`, `gamma = h*rl1`.
pub fn finalize<T: Scalar>(h: T, ell: &[T]) -> (T, T) {
    let rl1 = T::one() / ell[1];
    let gamma = h * rl1;
    (rl1, gamma)
}

/// BDF order-increase coefficients (mirrors CVODE's `cvIncreaseBDF`): the
/// `ell[2..=q]` polynomial and `A1 = (-alpha0-alpha1)/prod(xi)` that the
/// caller uses to set `zn[L] = A1 * zn[qmax]` (the saved correction from
/// the step where `qwait` last hit 1) and fold it into `zn[2..=q]`.
pub fn bdf_increase_coeffs<T: Scalar>(q: u32, hscale: T, tau: &[T]) -> (Vec<T>, T) {
    let l_max = q as usize + 2;
    let mut ell = vec![T::zero(); l_max + 1];
    ell[2] = T::one();
    let mut alpha0 = -T::one();
    let mut alpha1 = T::one();
    let mut prod = T::one();
    let mut xiold = T::one();
    let mut hsum = hscale;
    if q > 1 {
        for j in 1..q {
            hsum += tau[j as usize + 1];
            let xi = hsum / hscale;
            prod *= xi;
            alpha0 -= T::one() / T::from_f64((j + 1) as f64);
            alpha1 += T::one() / xi;
            for i in (2..=(j as usize + 2)).rev() {
                ell[i] = ell[i] * xiold + ell[i - 1];
            }
            xiold = xi;
        }
    }
    let a1 = (-alpha0 - alpha1) / prod;
    (ell, a1)
}

/// BDF order-decrease coefficients (mirrors CVODE's `cvDecreaseBDF`): the
/// `ell[2..q]` polynomial used to fold `zn[q]` into `zn[2..q]` before the
/// caller drops column `q`.
pub fn bdf_decrease_coeffs<T: Scalar>(q: u32, hscale: T, tau: &[T]) -> Vec<T> {
    let mut ell = vec![T::zero(); q as usize + 1];
    ell[2] = T::one();
    let mut hsum = T::zero();
    if q > 2 {
        for j in 1..=(q as usize - 2) {
            hsum += tau[j];
            let xi = hsum / hscale;
            for i in (2..=(j + 2)).rev() {
                ell[i] = ell[i] * xi + ell[i - 1];
            }
        }
    }
    ell
}

/// Adams order-decrease coefficients: grounded on CVODE's `cvAdjustAdams`
/// `deltaq == -1` branch,
/// the same `ell[2..q]` recurrence as [`bdf_decrease_coeffs`] but rescaled
/// by `q/(j+1)` at each step, reflecting the Adams polynomial's
/// `integral` structure instead of BDF's direct product. Order increase
/// on Adams needs no coefficients at all: the new top column is simply
/// zeroed (`Nordsieck::zero_column`), matching `cvAdjustAdams`'s
/// `deltaq == 1` branch.
pub fn adams_decrease_coeffs<T: Scalar>(q: u32, hscale: T, tau: &[T]) -> Vec<T> {
    let mut ell = vec![T::zero(); q as usize + 1];
    if q <= 2 {
        return ell;
    }
    ell[1] = T::one();
    let mut hsum = T::zero();
    for j in 1..=(q as usize - 2) {
        hsum += tau[j];
        let xi = hsum / hscale;
        for i in (1..=(j + 1)).rev() {
            ell[i] = ell[i] * xi + ell[i - 1];
        }
    }
    for j in 1..=(q as usize - 2) {
        ell[j + 1] = T::from_f64(q as f64) * (ell[j] / T::from_f64((j + 1) as f64));
    }
    ell
}
