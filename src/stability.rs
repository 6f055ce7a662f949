//! Component J — BDF stability-limit detection (`spec.md` §4.9), a port of
//! CVODE's `cvSLdet`/`CVBDFStab`: the same windowed-quartic analysis at
//! every order `q >= 3`, not an approximation that only holds for `q == 3`.
//!
//! Each accepted step at `q >= 3` pushes a row of three scaled-derivative-
//! squared samples (columns `q-1`, `q`, `q+1`) into a 5-row window. Once
//! the window is full, `cv_sldet` first tries to treat the three columns
//! as a normal matrix (their successive-ratio variances all below
//! `vrrtol^2`); failing that, it eliminates the three quartics against
//! each other by Gaussian elimination to solve for the dominant root `r`
//! directly, refining with up to three Newton corrections, then verifies
//! `r` against an independently reconstructed `sigsq` before accepting it.

use crate::scalar::Scalar;

pub const RRCUT: f64 = 0.98;
pub const VRRTOL: f64 = 1.0e-4;
pub const VRRT2: f64 = 5.0e-4;
pub const SQTOL: f64 = 1.0e-3;
pub const RRTOL: f64 = 1.0e-2;
pub const TINY: f64 = 1.0e-10;
/// Minimum number of steps at a fixed order before the detector engages
/// (`nscon >= q + 5` in `spec.md` §4.9/invariant 5; this module only needs
/// the window itself to be full, the `q + 5` part of the gate is the
/// caller's `nscon` counter).
pub const MIN_WINDOW: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StabilityVerdict {
    Stable,
    /// `rr > RRCUT` (`kflag` in `{4,5,6}`); cap the order at the
    /// caller-supplied value (never exceeds `q - 1`).
    Unstable { recommended_qmax: u32 },
    /// Not enough history yet, or `cv_sldet` could not pin down `rr`
    /// (any negative `kflag`).
    Indeterminate,
}

/// One accepted step's row of `spec.md` §4.9 `ssdat[i][1..3]`: scaled
/// `||z_{q-1}||^2`, `||z_q||^2`, `||z_{q+1}||^2` (CVODE's `sqm2`, `sqm1`,
/// `sq`, squared), indexed `[0]=q-1, [1]=q, [2]=q+1`.
pub type SsdatRow<T> = [T; 3];

/// Rolling 5-row window of `ssdat`, one row appended per accepted BDF step
/// at `q >= 3` (`spec.md` §3 invariant 5).
#[derive(Debug, Clone)]
pub struct SldetWindow<T: Scalar> {
    /// `samples[0]` is the most recent step (CVODE's `i = 1`); the oldest
    /// retained row is at the back.
    samples: Vec<SsdatRow<T>>,
}

impl<T: Scalar> SldetWindow<T> {
    pub fn new() -> Self {
        Self { samples: Vec::with_capacity(MIN_WINDOW) }
    }

    pub fn reset(&mut self) {
        self.samples.clear();
    }

    /// Push this step's `ssdat` row, right-shifting the window exactly as
    /// CVODE's `CVBDFStab` does (`ssdat[i][k] = ssdat[i-1][k]` then
    /// overwrite row 1).
    pub fn push(&mut self, row: SsdatRow<T>) {
        self.samples.insert(0, row);
        if self.samples.len() > MIN_WINDOW {
            self.samples.truncate(MIN_WINDOW);
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Run `cvSLdet` against the current window, returning CVODE's
    /// numbered `kflag`, or `None` if the window is not yet full.
    pub fn detect_kflag(&self, q: u32) -> Option<i32> {
        if self.samples.len() < MIN_WINDOW {
            return None;
        }
        Some(cv_sldet(&self.samples, q))
    }

    pub fn detect(&self, q: u32, qmax: u32) -> StabilityVerdict {
        match self.detect_kflag(q) {
            Some(kflag) if kflag > 3 => StabilityVerdict::Unstable {
                recommended_qmax: qmax.min(q.saturating_sub(1)).max(1),
            },
            Some(kflag) if kflag > 0 => StabilityVerdict::Stable,
            _ => StabilityVerdict::Indeterminate,
        }
    }
}

impl<T: Scalar> Default for SldetWindow<T> {
    fn default() -> Self {
        Self::new()
    }
}

fn abs<T: Scalar>(x: T) -> T {
    num_traits::Float::abs(x)
}

/// Faithful port of `cvSLdet` (`cvodes.c`). `qc[i][k]`/`ssdat[i][k]` keep
/// CVODE's 1-based row index `i` (row 0 unused) against a 0-based column
/// `k` (`0 = q-1, 1 = q, 2 = q+1`); `samples[i-1]` is CVODE's `ssdat[i]`.
fn cv_sldet<T: Scalar>(samples: &[SsdatRow<T>], q: u32) -> i32 {
    let tiny = T::from_f64(TINY);
    let mut ssmax = [T::zero(); 3];
    let mut smax = [T::zero(); 3];
    let mut vrat = [T::zero(); 3];
    let mut rav = [T::zero(); 3];
    let mut qc = [[T::zero(); 3]; 6];

    for k in 0..3 {
        let mut smink = samples[0][k];
        let mut smaxk = T::zero();
        for row in samples.iter().take(5) {
            if row[k] < smink {
                smink = row[k];
            }
            if row[k] > smaxk {
                smaxk = row[k];
            }
        }
        if smink < tiny * smaxk {
            return -1;
        }
        smax[k] = smaxk;
        ssmax[k] = smaxk * smaxk;

        let mut sumrat = T::zero();
        let mut sumrsq = T::zero();
        for i in 0..4 {
            let r = samples[i][k] / samples[i + 1][k];
            sumrat += r;
            sumrsq += r * r;
        }
        rav[k] = T::from_f64(0.25) * sumrat;
        vrat[k] = abs(T::from_f64(0.25) * sumrsq - rav[k] * rav[k]);

        qc[5][k] = samples[0][k] * samples[2][k] - samples[1][k] * samples[1][k];
        qc[4][k] = samples[1][k] * samples[2][k] - samples[0][k] * samples[3][k];
        qc[3][k] = T::zero();
        qc[2][k] = samples[1][k] * samples[4][k] - samples[2][k] * samples[3][k];
        qc[1][k] = samples[3][k] * samples[3][k] - samples[2][k] * samples[4][k];
    }

    let vmin = if vrat[0] < vrat[1] { vrat[0] } else { vrat[1] };
    let vmin = if vrat[2] < vmin { vrat[2] } else { vmin };
    let vmax = if vrat[0] > vrat[1] { vrat[0] } else { vrat[1] };
    let vmax = if vrat[2] > vmax { vrat[2] } else { vmax };

    let mut rr;
    let mut kflag;

    if vmin < T::from_f64(VRRTOL * VRRTOL) {
        if vmax > T::from_f64(VRRT2 * VRRT2) {
            return -2;
        }
        rr = (rav[0] + rav[1] + rav[2]) / T::from_f64(3.0);
        // CVODE computes `drrmax` and would set kflag = -3 when it exceeds
        // vrrt2, but then unconditionally overwrites kflag to 1 right
        // after — the -3 branch is dead in the original source. Ported
        // as-is rather than "fixed", matching `cvSLdet` line for line.
        kflag = 1;
    } else {
        let mut qco = qc;
        if abs(qco[1][0]) < tiny * ssmax[0] {
            return -4;
        }
        let tem = qco[1][1] / qco[1][0];
        for i in 1..=5 {
            qco[i][1] = qco[i][1] - tem * qco[i][0];
        }
        qco[1][1] = T::zero();
        let tem = qco[1][2] / qco[1][0];
        for i in 1..=5 {
            qco[i][2] = qco[i][2] - tem * qco[i][0];
        }
        qco[1][2] = T::zero();

        if abs(qco[2][1]) < tiny * ssmax[1] {
            return -4;
        }
        let tem = qco[2][2] / qco[2][1];
        for i in 3..=5 {
            qco[i][2] = qco[i][2] - tem * qco[i][1];
        }

        if abs(qco[4][2]) < tiny * ssmax[2] {
            return -4;
        }
        rr = -qco[5][2] / qco[4][2];
        if rr < tiny || rr > T::from_f64(100.0) {
            return -5;
        }

        let mut qkr = [T::zero(); 3];
        for k in 0..3 {
            qkr[k] = qc[5][k] + rr * (qc[4][k] + rr * rr * (qc[2][k] + rr * qc[1][k]));
        }
        let mut sqmax = T::zero();
        for k in 0..3 {
            let saqk = abs(qkr[k]) / ssmax[k];
            if saqk > sqmax {
                sqmax = saqk;
            }
        }

        if sqmax < T::from_f64(SQTOL) {
            kflag = 2;
        } else {
            let mut sqmin = T::zero();
            let mut corrected = false;
            for _it in 0..3 {
                let mut drr = [T::zero(); 3];
                let mut rrc = [T::zero(); 3];
                for k in 0..3 {
                    let qp = qc[4][k] + rr * rr * (T::from_f64(3.0) * qc[2][k] + rr * T::from_f64(4.0) * qc[1][k]);
                    drr[k] = T::zero();
                    if abs(qp) > tiny * ssmax[k] {
                        drr[k] = -qkr[k] / qp;
                    }
                    rrc[k] = rr + drr[k];
                }
                let mut sqmx = [T::zero(); 3];
                let mut qjk = [[T::zero(); 3]; 3];
                for k in 0..3 {
                    let s = rrc[k];
                    let mut sqmaxk = T::zero();
                    for j in 0..3 {
                        qjk[j][k] = qc[5][j] + s * (qc[4][j] + s * s * (qc[2][j] + s * qc[1][j]));
                        let saqj = abs(qjk[j][k]) / ssmax[j];
                        if saqj > sqmaxk {
                            sqmaxk = saqj;
                        }
                    }
                    sqmx[k] = sqmaxk;
                }
                let mut kmin = 0usize;
                sqmin = sqmx[0];
                for k in 1..3 {
                    if sqmx[k] < sqmin {
                        kmin = k;
                        sqmin = sqmx[k];
                    }
                }
                rr = rrc[kmin];
                if sqmin < T::from_f64(SQTOL) {
                    corrected = true;
                    break;
                } else {
                    for j in 0..3 {
                        qkr[j] = qjk[j][kmin];
                    }
                }
            }
            if !corrected && sqmin > T::from_f64(SQTOL) {
                return -6;
            }
            kflag = 3;
        }
    }

    // Given rr, reconstruct sigsq[k] and verify rr against it
    // (`spec.md` §4.9 step 4).
    let mut sigsq = [T::zero(); 3];
    for k in 0..3 {
        let rsa = samples[0][k];
        let rsb = samples[1][k] * rr;
        let rsc = samples[2][k] * rr * rr;
        let rsd = samples[3][k] * rr * rr * rr;
        let rse = samples[4][k] * rr * rr * rr * rr;
        let rd1a = rsa - rsb;
        let rd1b = rsb - rsc;
        let rd1c = rsc - rsd;
        let rd1d = rsd - rse;
        let rd2a = rd1a - rd1b;
        let rd2b = rd1b - rd1c;
        let rd2c = rd1c - rd1d;
        let rd3a = rd2a - rd2b;
        let _rd3b = rd2b - rd2c;

        if abs(rd1b) < tiny * smax[k] {
            return -7;
        }
        let cest1 = -rd3a / rd1b;
        if cest1 < tiny || cest1 > T::from_f64(4.0) {
            return -7;
        }
        let corr1 = (rd2b / cest1) / (rr * rr);
        sigsq[k] = samples[2][k] + corr1;
    }

    if sigsq[1] < tiny {
        return -8;
    }

    let ratp = sigsq[2] / sigsq[1];
    let ratm = sigsq[0] / sigsq[1];
    let qf = T::from_f64(q as f64);
    let qfac1 = T::from_f64(0.25) * (qf * qf - T::one());
    let qfac2 = T::from_f64(2.0) / (qf - T::one());
    let bb = ratp * ratm - T::one() - qfac1 * ratp;
    let tem = T::one() - qfac2 * bb;
    if abs(tem) < tiny {
        return -8;
    }
    let rrb = T::one() / tem;
    if abs(rrb - rr) > T::from_f64(RRTOL) {
        return -9;
    }

    if rr > T::from_f64(RRCUT) {
        kflag = match kflag {
            1 => 4,
            2 => 5,
            3 => 6,
            other => other,
        };
    }

    kflag
}
