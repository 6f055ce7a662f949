//! The corrector's iteration matrix `M ~= I - gamma*J` (`spec.md` §6.2),
//! generalized from the teacher's `callable::ode::BdfCallable` (which
//! fused this with the Nordsieck `psi`/`y0` bookkeeping). Here the two
//! concerns are split: [`LinearisedOp`] only knows how to produce the
//! iteration matrix and apply it as a Jacobian-vector product; the
//! corrector (`corrector::newton`) owns `psi`/`rl1`/`gamma`.

use super::{Jacobian, NonLinearOp, Op};
use crate::matrix::Matrix;

pub struct LinearisedOp<'a, C: Jacobian> {
    pub rhs: &'a C,
    pub gamma: C::T,
}

impl<'a, C: Jacobian> LinearisedOp<'a, C> {
    pub fn new(rhs: &'a C, gamma: C::T) -> Self {
        Self { rhs, gamma }
    }

    /// `M = I - gamma*J` evaluated at `(t, y, p)`.
    pub fn iteration_matrix(&self, t: C::T, y: &C::V, p: &C::V) -> C::M {
        let n = self.rhs.nstates();
        let jac = self.rhs.jacobian(t, y, p);
        let mut m = C::M::identity(n);
        m.axpy(-self.gamma, &jac);
        m
    }
}
