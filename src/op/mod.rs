//! User callback and linear-operator plumbing, generalized
//! from the teacher's `callable` module (`Callable`/`Jacobian` there,
//! `Op`/`NonLinearOp`/`Jacobian` here — renamed to match this crate's
//! vocabulary, same shape).

pub mod linearise;
pub mod ode_rhs;
pub mod sens_rhs;

use crate::matrix::Matrix;
use crate::scalar::Scalar;
use crate::vector::Vector;

/// Shape of an operator: how many state components it consumes/produces,
/// and how many parameters it is differentiated against.
pub trait Op {
    type T: Scalar;
    type V: Vector<T = Self::T>;
    type M: Matrix<T = Self::T, V = Self::V>;

    fn nstates(&self) -> usize;
    fn nparams(&self) -> usize {
        0
    }
    fn nout(&self) -> usize {
        self.nstates()
    }
}

/// `y = F(t, x, p)`, evaluated in place.
pub trait NonLinearOp: Op {
    fn call_inplace(&self, t: Self::T, x: &Self::V, p: &Self::V, y: &mut Self::V);

    fn call(&self, t: Self::T, x: &Self::V, p: &Self::V) -> Self::V {
        let mut y = Self::V::zeros(self.nout());
        self.call_inplace(t, x, p, &mut y);
        y
    }
}

/// Dense Jacobian of a [`NonLinearOp`], `dF/dx` at `(t, x, p)`.
pub trait Jacobian: NonLinearOp + CallStats {
    fn jacobian(&self, t: Self::T, x: &Self::V, p: &Self::V) -> Self::M;

    /// Whether this operator can provide an analytic Jacobian, as opposed
    /// to requiring the linear solver to approximate it by difference
    /// quotients. Both this trait's `jacobian` and the DQ fallback in
    /// `linear_solver::dense_lu` honor the same contract; this flag only
    /// decides which path a generic caller prefers.
    fn has_analytic_jacobian(&self) -> bool {
        true
    }
}

/// Number of evaluations performed, exposed for the diagnostic accessors
/// named (but not specified in detail) by `spec.md` §3 ("RHS evals").
pub trait CallStats {
    fn num_calls(&self) -> usize;
    fn num_jac_evals(&self) -> usize {
        0
    }
}
