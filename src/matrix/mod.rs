//! A minimal dense-matrix abstraction, trimmed from the teacher's
//! `matrix::Matrix` trait down to what the Newton corrector's iteration
//! matrix `M ~= I - gamma*J` actually needs: construction, indexing, and a
//! `gemv`. The teacher's fuller trait also supports matrix *views* for
//! zero-copy column slicing (needed by its variable-step BDF order-change
//! code working directly on Nordsieck columns); this crate's Nordsieck
//! store (`nordsieck.rs`) is built from a `Vec<V>` of state vectors
//! instead, so the view machinery has no remaining caller here and is not
//! carried over (noted in DESIGN.md).

pub mod dense_nalgebra;

use std::fmt::Debug;
use std::ops::{Index, IndexMut};

use crate::scalar::Scalar;
use crate::vector::Vector;

pub type IndexType = usize;

/// A dense matrix over `T`, used only as the iteration matrix for the
/// Newton corrector's linear solve.
pub trait Matrix: Clone + Debug + Index<(IndexType, IndexType), Output = Self::T> + IndexMut<(IndexType, IndexType)>
{
    type T: Scalar;
    type V: Vector<T = Self::T>;

    fn zeros(nrows: IndexType, ncols: IndexType) -> Self;

    fn identity(n: IndexType) -> Self;

    fn from_diagonal(v: &Self::V) -> Self;

    fn nrows(&self) -> IndexType;

    fn ncols(&self) -> IndexType;

    /// `y = alpha*self*x + beta*y`
    fn gemv(&self, alpha: Self::T, x: &Self::V, beta: Self::T, y: &mut Self::V);

    /// `self = self*scale + other*(1-scale)`-style combination used to
    /// build `M = I - gamma*J` from an identity and a Jacobian.
    fn axpy(&mut self, alpha: Self::T, other: &Self);
}
