//! The vector façade.
//!
//! The integrator core never touches a concrete storage type; every
//! elementary operation it needs is expressed against this trait. A single
//! dense `nalgebra`-backed implementation is provided in [`serial`] so the
//! crate is runnable and testable standalone — a consumer embedding this
//! integrator in, say, a distributed or GPU vector package swaps the impl
//! without touching anything above this module.

pub mod serial;

use std::fmt::Debug;
use std::ops::{Add, AddAssign, Div, DivAssign, Index, IndexMut, Mul, MulAssign, Sub, SubAssign};

use crate::scalar::Scalar;

/// Elementary operations on a vector of reals.
pub trait Vector:
    Clone
    + Debug
    + Index<usize, Output = <Self as Vector>::T>
    + IndexMut<usize>
    + Add<Output = Self>
    + Sub<Output = Self>
    + for<'a> Add<&'a Self, Output = Self>
    + for<'a> Sub<&'a Self, Output = Self>
    + AddAssign
    + SubAssign
    + for<'a> AddAssign<&'a Self>
    + for<'a> SubAssign<&'a Self>
    + Mul<<Self as Vector>::T, Output = Self>
    + Div<<Self as Vector>::T, Output = Self>
    + MulAssign<<Self as Vector>::T>
    + DivAssign<<Self as Vector>::T>
{
    type T: Scalar;

    /// Allocate a new zero vector of length `n`.
    fn zeros(n: usize) -> Self;

    /// Allocate a new vector of length `n`, every component set to `c`.
    fn from_element(n: usize, c: Self::T) -> Self;

    fn from_vec(v: Vec<Self::T>) -> Self;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn copy_from(&mut self, other: &Self);

    /// `z = a*x + b*y`
    fn linear_sum(a: Self::T, x: &Self, b: Self::T, y: &Self, z: &mut Self);

    /// `self = a*x + self` (in place axpy).
    fn axpy(&mut self, a: Self::T, x: &Self);

    fn scale(&mut self, a: Self::T);

    fn abs(&self) -> Self;

    fn add_scalar(&self, c: Self::T) -> Self;

    fn add_scalar_mut(&mut self, c: Self::T);

    /// Componentwise division `z[i] = self[i] / y[i]`.
    fn component_div(&self, y: &Self) -> Self;

    fn component_div_assign(&mut self, y: &Self);

    /// Componentwise product `z[i] = self[i] * y[i]`.
    fn component_mul(&self, y: &Self) -> Self;

    fn component_mul_assign(&mut self, y: &Self);

    fn component_inv(&self) -> Self;

    fn fill(&mut self, c: Self::T);

    /// Smallest component.
    fn min(&self) -> Self::T;

    /// Infinity ("max") norm: `max_i |x_i|`.
    fn max_norm(&self) -> Self::T;

    /// Weighted root-mean-square norm: `sqrt(sum((x_i*w_i)^2)/N)`.
    fn wrms_norm(&self, w: &Self) -> Self::T {
        use num_traits::Zero;
        if self.is_empty() {
            return Self::T::zero();
        }
        let n = Self::T::from_f64(self.len() as f64);
        let mut acc = Self::T::zero();
        for i in 0..self.len() {
            let wi = self[i] * w[i];
            acc += wi * wi;
        }
        num_traits::Float::sqrt(acc / n)
    }

    fn assert_eq_st(&self, other: &Self, tol: Self::T) {
        assert_eq!(self.len(), other.len());
        for i in 0..self.len() {
            let diff = num_traits::Float::abs(self[i] - other[i]);
            assert!(
                diff <= tol,
                "component {i}: {:?} != {:?} (tol {:?})",
                self[i],
                other[i],
                tol
            );
        }
    }
}

/// Marker allowing generic code to accept `&V` wherever elementwise
/// arithmetic is needed without forcing an owned clone, mirroring the
/// teacher's `VectorRef` marker trait in `matrix/mod.rs`.
pub trait VectorRef<V: Vector>:
    Add<V, Output = V> + Sub<V, Output = V> + Mul<V::T, Output = V>
{
}
impl<'a, V: Vector> VectorRef<V> for &'a V where
    &'a V: Add<V, Output = V> + Sub<V, Output = V> + Mul<V::T, Output = V>
{
}

/// A family of `Ns` parallel vectors, used for sensitivity histories
/// (CVODES's `znS`) and for per-parameter staggered corrections.
#[derive(Clone, Debug)]
pub struct VectorOfVectors<V: Vector> {
    pub members: Vec<V>,
}

impl<V: Vector> VectorOfVectors<V> {
    pub fn zeros(ns: usize, n: usize) -> Self {
        Self {
            members: (0..ns).map(|_| V::zeros(n)).collect(),
        }
    }

    pub fn ns(&self) -> usize {
        self.members.len()
    }

    pub fn wrms_norm_max(&self, weights: &[V]) -> V::T {
        self.members
            .iter()
            .zip(weights.iter())
            .map(|(m, w)| m.wrms_norm(w))
            .fold(V::T::zero(), |acc, x| if x > acc { x } else { acc })
    }
}
