//! Wraps the user's state right-hand side `f(t, y) -> ydot` (`spec.md` §6.3)
//! with a call counter (`nfe` in the data model, §3), and optionally an
//! analytic Jacobian callback. Mirrors the counting/staleness pattern of
//! the teacher's `callable::ode::BdfCallable`, minus the Nordsieck-specific
//! `psi`/`c` bookkeeping which now lives in `corrector::newton`.

use std::cell::Cell;

use super::{CallStats, Jacobian, NonLinearOp, Op};
use crate::matrix::Matrix;
use crate::scalar::Scalar;
use crate::vector::Vector;

/// `f(t, y, p) -> ydot`
pub trait StateRhs<T: Scalar, V: Vector<T = T>> {
    fn rhs(&self, t: T, y: &V, p: &V, ydot: &mut V);

    /// Analytic Jacobian `df/dy`, if the user supplied one.
    fn jacobian(&self, _t: T, _y: &V, _p: &V, _jac: &mut dyn FnMut(usize, usize, T)) -> bool {
        false
    }
}

pub struct OdeRhs<T: Scalar, M: Matrix<T = T>, F: StateRhs<T, M::V>> {
    f: F,
    nstates: usize,
    nparams: usize,
    pub nfe: Cell<usize>,
    pub njac: Cell<usize>,
    _m: std::marker::PhantomData<M>,
}

impl<T: Scalar, M: Matrix<T = T>, F: StateRhs<T, M::V>> OdeRhs<T, M, F> {
    pub fn new(f: F, nstates: usize, nparams: usize) -> Self {
        Self {
            f,
            nstates,
            nparams,
            nfe: Cell::new(0),
            njac: Cell::new(0),
            _m: std::marker::PhantomData,
        }
    }
}

impl<T: Scalar, M: Matrix<T = T>, F: StateRhs<T, M::V>> Op for OdeRhs<T, M, F> {
    type T = T;
    type V = M::V;
    type M = M;

    fn nstates(&self) -> usize {
        self.nstates
    }
    fn nparams(&self) -> usize {
        self.nparams
    }
}

impl<T: Scalar, M: Matrix<T = T>, F: StateRhs<T, M::V>> NonLinearOp for OdeRhs<T, M, F> {
    fn call_inplace(&self, t: T, x: &M::V, p: &M::V, y: &mut M::V) {
        self.nfe.set(self.nfe.get() + 1);
        self.f.rhs(t, x, p, y);
    }
}

impl<T: Scalar, M: Matrix<T = T>, F: StateRhs<T, M::V>> CallStats for OdeRhs<T, M, F> {
    fn num_calls(&self) -> usize {
        self.nfe.get()
    }

    fn num_jac_evals(&self) -> usize {
        self.njac.get()
    }
}

impl<T: Scalar, M: Matrix<T = T>, F: StateRhs<T, M::V>> Jacobian for OdeRhs<T, M, F> {
    fn jacobian(&self, t: T, x: &M::V, p: &M::V) -> M {
        self.njac.set(self.njac.get() + 1);
        let n = self.nstates;
        let mut jac = M::zeros(n, n);
        let analytic = self.f.jacobian(t, x, p, &mut |i, j, v| {
            jac[(i, j)] = v;
        });
        if analytic {
            return jac;
        }
        // Difference-quotient fallback (CVODE's dense-direct default, cvDlsDQJac).
        let mut y0 = M::V::zeros(n);
        self.call_inplace(t, x, p, &mut y0);
        let sqrt_uround = num_traits::Float::sqrt(T::uround());
        let mut xp = x.clone();
        for j in 0..n {
            let xj = xp[j];
            let dy = sqrt_uround * num_traits::Float::max(num_traits::Float::abs(xj), T::one());
            xp[j] = xj + dy;
            let mut yp = M::V::zeros(n);
            self.call_inplace(t, &xp, p, &mut yp);
            xp[j] = xj;
            let col = (yp - y0.clone()) / dy;
            for i in 0..n {
                jac[(i, j)] = col[i];
            }
        }
        jac
    }

    fn has_analytic_jacobian(&self) -> bool {
        false
    }
}
