//! The Nordsieck history store.
//!
//! Modeled as three independent storages with uniform access patterns
//! (state, quadrature, per-parameter sensitivity) rather than a variant
//! struct, since the sensitivity history is ragged across parameters and
//! shares no layout invariant with the state/quadrature channels worth
//! unifying into one enum. Grounded on the teacher's `ode_solver::bdf`
//! `_predict`/`_update_step_size`
//! column-shift logic, generalized from the teacher's single dense-matrix
//! `diff: M` (columns = states, rows = orders) to a `Vec<V>` of per-order
//! vectors — the teacher's matrix-of-orders representation only works when
//! there is exactly one history; sensitivities need `Ns` of them sharing
//! the same order-indexed shift logic, which `Vec<V>` expresses directly.

use crate::scalar::Scalar;
use crate::vector::{Vector, VectorOfVectors};

/// `zn[0..=qmax]`: `zn[0]` is `y`, `zn[j]` holds `h^j * y^(j)/j!` for the
/// current `h`. `zn[qmax]` is scratch, holding the saved correction for a
/// pending order increase.
#[derive(Clone, Debug)]
pub struct Nordsieck<V: Vector> {
    pub zn: Vec<V>,
    qmax: usize,
}

impl<V: Vector> Nordsieck<V> {
    pub fn new(qmax: usize, n: usize) -> Self {
        Self {
            zn: (0..=qmax).map(|_| V::zeros(n)).collect(),
            qmax,
        }
    }

    pub fn qmax(&self) -> usize {
        self.qmax
    }

    /// Predict: `for k in 1..=q { for j in q..=k { zn[j-1] += zn[j] } }`.
    /// Advances `y` by a Taylor sum in place.
    pub fn predict(&mut self, q: usize) {
        for _k in 1..=q {
            for j in (1..=q).rev() {
                let zj = self.zn[j].clone();
                self.zn[j - 1] += &zj;
            }
        }
    }

    /// The exact inverse of `predict`.
    pub fn restore(&mut self, q: usize) {
        for _k in 1..=q {
            for j in (1..=q).rev() {
                let zj = self.zn[j].clone();
                self.zn[j - 1] -= &zj;
            }
        }
    }

    /// Rescale: `zn[j] *= eta^j` for `j in 1..=q`. The
    /// caller is responsible for the accompanying `h`/`hscale`/`nscon`
    /// bookkeeping (`IntegratorState::rescale_step`).
    pub fn rescale(&mut self, q: usize, eta: V::T) {
        let mut eta_pow = eta;
        for j in 1..=q {
            self.zn[j].scale(eta_pow);
            eta_pow *= eta;
        }
    }

    /// After a successful step: `zn[j] += ell[j] * acor` for `j in 0..=q`.
    pub fn apply_correction(&mut self, q: usize, ell: &[V::T], acor: &V) {
        for j in 0..=q {
            self.zn[j].axpy(ell[j], acor);
        }
    }

    /// BDF order increase (mirrors CVODE's `cvIncreaseBDF`): `zn[qmax]` holds
    /// the saved `Delta_n`. `a1` is the caller-computed
    /// `(-alpha0-alpha1)/prod(xi)` walking the `tau` window.
    pub fn increase_bdf(&mut self, q: usize, ell: &[V::T], a1: V::T) {
        let l = q + 1;
        let scratch = self.zn[self.qmax].clone() * a1;
        self.zn[l] = scratch;
        let zl = self.zn[l].clone();
        for j in 2..=q {
            self.zn[j].axpy(ell[j], &zl);
        }
    }

    /// BDF order decrease (mirrors CVODE's `cvDecreaseBDF`): `ell` here is
    /// the caller-supplied `x^2 * prod(x+xi_i)/h` polynomial, distinct from
    /// the step corrector's `ell`. Also used for the Adams decrease, an
    /// analogous variant with its own `ell` — the column-update shape is
    /// identical, only the polynomial differs.
    pub fn decrease_bdf(&mut self, q: usize, ell: &[V::T]) {
        let zq = self.zn[q].clone();
        for j in 2..q {
            self.zn[j].axpy(-ell[j], &zq);
        }
        self.zn[q] = V::zeros(self.zn[q].len());
    }

    /// Adams order increase: grounded on `cvAdjustAdams`'s `deltaq == 1` branch,
    /// which (unlike BDF) needs no coefficient computation at all — the
    /// new top column starts from zero.
    pub fn zero_column(&mut self, l: usize) {
        self.zn[l] = V::zeros(self.zn[l].len());
    }

    /// Dense-output interpolant (CVODE's `GetDky`): the k-th
    /// derivative at `t`, given the current `tn`, `h`, `hu` and order `q`:
    ///
    /// `dky = sum_{j=k..q} [j*(j-1)*...*(j-k+1)] * ((t-tn)/h)^(j-k) * zn[j] * h^-k`
    pub fn dky(&self, t: V::T, k: usize, tn: V::T, h: V::T, q: usize) -> V {
        let mut falling_factorial = |j: usize| -> V::T {
            let mut c = V::T::one();
            for m in 0..k {
                c *= V::T::from_f64((j - m) as f64);
            }
            c
        };

        let mut dky = self.zn[k].clone() * falling_factorial(k);
        let mut t_factor = V::T::one();
        for j in (k + 1)..=q {
            t_factor *= (t - tn) / h;
            dky.axpy(falling_factorial(j) * t_factor, &self.zn[j]);
        }

        let mut hk = V::T::one();
        for _ in 0..k {
            hk *= h;
        }
        dky.scale(V::T::one() / hk);
        dky
    }
}

/// A family of `Ns` parallel Nordsieck histories, one per sensitivity
/// parameter (CVODES's `znS`). All operations broadcast across the
/// family identically to the single-history case.
#[derive(Clone, Debug)]
pub struct NordsieckFamily<V: Vector> {
    pub zn: Vec<VectorOfVectors<V>>, // indexed by order, each holds Ns vectors
    qmax: usize,
}

impl<V: Vector> NordsieckFamily<V> {
    pub fn new(qmax: usize, ns: usize, n: usize) -> Self {
        Self {
            zn: (0..=qmax).map(|_| VectorOfVectors::zeros(ns, n)).collect(),
            qmax,
        }
    }

    pub fn predict(&mut self, q: usize, ns: usize) {
        for _k in 1..=q {
            for j in (1..=q).rev() {
                for i in 0..ns {
                    let zj = self.zn[j].members[i].clone();
                    self.zn[j - 1].members[i] += &zj;
                }
            }
        }
    }

    pub fn restore(&mut self, q: usize, ns: usize) {
        for _k in 1..=q {
            for j in (1..=q).rev() {
                for i in 0..ns {
                    let zj = self.zn[j].members[i].clone();
                    self.zn[j - 1].members[i] -= &zj;
                }
            }
        }
    }

    pub fn rescale(&mut self, q: usize, ns: usize, eta: V::T) {
        for i in 0..ns {
            let mut eta_pow = eta;
            for j in 1..=q {
                self.zn[j].members[i].scale(eta_pow);
                eta_pow *= eta;
            }
        }
    }

    pub fn apply_correction(&mut self, q: usize, ns: usize, ell: &[V::T], acor: &VectorOfVectors<V>) {
        for j in 0..=q {
            for i in 0..ns {
                self.zn[j].members[i].axpy(ell[j], &acor.members[i]);
            }
        }
    }

    pub fn qmax(&self) -> usize {
        self.qmax
    }

    /// Per-parameter counterpart of [`Nordsieck::increase_bdf`], broadcast
    /// across all `ns` sensitivity histories.
    pub fn increase_bdf(&mut self, q: usize, ns: usize, ell: &[V::T], a1: V::T) {
        let l = q + 1;
        for i in 0..ns {
            let scratch = self.zn[self.qmax].members[i].clone() * a1;
            self.zn[l].members[i] = scratch;
            let zl = self.zn[l].members[i].clone();
            for j in 2..=q {
                self.zn[j].members[i].axpy(ell[j], &zl);
            }
        }
    }

    /// Per-parameter counterpart of [`Nordsieck::decrease_bdf`].
    pub fn decrease_bdf(&mut self, q: usize, ns: usize, ell: &[V::T]) {
        for i in 0..ns {
            let zq = self.zn[q].members[i].clone();
            for j in 2..q {
                self.zn[j].members[i].axpy(-ell[j], &zq);
            }
            self.zn[q].members[i] = V::zeros(self.zn[q].members[i].len());
        }
    }

    /// Per-parameter counterpart of [`Nordsieck::zero_column`].
    pub fn zero_column(&mut self, l: usize, ns: usize) {
        for i in 0..ns {
            self.zn[l].members[i] = V::zeros(self.zn[l].members[i].len());
        }
    }

    /// Per-parameter counterpart of [`Nordsieck::dky`]: the same
    /// falling-factorial Taylor-sum interpolant, broadcast across all `ns`
    /// sensitivity histories, backing the driver's `get_sens_dky`.
    pub fn dky(&self, t: V::T, k: usize, tn: V::T, h: V::T, q: usize, ns: usize) -> VectorOfVectors<V> {
        let mut falling_factorial = |j: usize| -> V::T {
            let mut c = V::T::one();
            for m in 0..k {
                c *= V::T::from_f64((j - m) as f64);
            }
            c
        };

        let mut out = VectorOfVectors {
            members: (0..ns).map(|i| self.zn[k].members[i].clone() * falling_factorial(k)).collect(),
        };
        let mut t_factor = V::T::one();
        for j in (k + 1)..=q {
            t_factor *= (t - tn) / h;
            let coef = falling_factorial(j) * t_factor;
            for i in 0..ns {
                out.members[i].axpy(coef, &self.zn[j].members[i]);
            }
        }

        let mut hk = V::T::one();
        for _ in 0..k {
            hk *= h;
        }
        for i in 0..ns {
            out.members[i].scale(V::T::one() / hk);
        }
        out
    }
}
