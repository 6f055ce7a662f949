//! Dense, single-threaded [`Vector`] implementation backed by `nalgebra::DVector`.
//!
//! This is the default concrete vector type used by the integrator's own
//! test suite; consumers who need a different storage model (distributed,
//! GPU, sparse) implement [`Vector`] directly, the same way the teacher
//! crate's `nalgebra` backend coexists with its `faer`/`sundials` backends.

use nalgebra::DVector;
use num_traits::Zero;
use std::ops::{Add, AddAssign, Div, DivAssign, Index, IndexMut, Mul, MulAssign, Sub, SubAssign};

use super::Vector;
use crate::scalar::Scalar;

#[derive(Clone, Debug)]
pub struct SerialVector<T: Scalar>(pub DVector<T>);

impl<T: Scalar> Index<usize> for SerialVector<T> {
    type Output = T;
    fn index(&self, i: usize) -> &T {
        &self.0[i]
    }
}
impl<T: Scalar> IndexMut<usize> for SerialVector<T> {
    fn index_mut(&mut self, i: usize) -> &mut T {
        &mut self.0[i]
    }
}

impl<T: Scalar> Add for SerialVector<T> {
    type Output = Self;
    fn add(self, rhs: Self) -> Self {
        SerialVector(self.0 + rhs.0)
    }
}
impl<'a, T: Scalar> Add<&'a SerialVector<T>> for SerialVector<T> {
    type Output = Self;
    fn add(self, rhs: &'a SerialVector<T>) -> Self {
        SerialVector(self.0 + &rhs.0)
    }
}
impl<T: Scalar> Sub for SerialVector<T> {
    type Output = Self;
    fn sub(self, rhs: Self) -> Self {
        SerialVector(self.0 - rhs.0)
    }
}
impl<'a, T: Scalar> Sub<&'a SerialVector<T>> for SerialVector<T> {
    type Output = Self;
    fn sub(self, rhs: &'a SerialVector<T>) -> Self {
        SerialVector(self.0 - &rhs.0)
    }
}
impl<T: Scalar> AddAssign for SerialVector<T> {
    fn add_assign(&mut self, rhs: Self) {
        self.0 += rhs.0;
    }
}
impl<'a, T: Scalar> AddAssign<&'a SerialVector<T>> for SerialVector<T> {
    fn add_assign(&mut self, rhs: &'a SerialVector<T>) {
        self.0 += &rhs.0;
    }
}
impl<T: Scalar> SubAssign for SerialVector<T> {
    fn sub_assign(&mut self, rhs: Self) {
        self.0 -= rhs.0;
    }
}
impl<'a, T: Scalar> SubAssign<&'a SerialVector<T>> for SerialVector<T> {
    fn sub_assign(&mut self, rhs: &'a SerialVector<T>) {
        self.0 -= &rhs.0;
    }
}
impl<T: Scalar> Mul<T> for SerialVector<T> {
    type Output = Self;
    fn mul(self, rhs: T) -> Self {
        SerialVector(self.0 * rhs)
    }
}
impl<T: Scalar> Div<T> for SerialVector<T> {
    type Output = Self;
    fn div(self, rhs: T) -> Self {
        SerialVector(self.0 / rhs)
    }
}
impl<T: Scalar> MulAssign<T> for SerialVector<T> {
    fn mul_assign(&mut self, rhs: T) {
        self.0 *= rhs;
    }
}
impl<T: Scalar> DivAssign<T> for SerialVector<T> {
    fn div_assign(&mut self, rhs: T) {
        self.0 /= rhs;
    }
}

impl<T: Scalar> Vector for SerialVector<T> {
    type T = T;

    fn zeros(n: usize) -> Self {
        SerialVector(DVector::zeros(n))
    }

    fn from_element(n: usize, c: T) -> Self {
        SerialVector(DVector::from_element(n, c))
    }

    fn from_vec(v: Vec<T>) -> Self {
        SerialVector(DVector::from_vec(v))
    }

    fn len(&self) -> usize {
        self.0.len()
    }

    fn copy_from(&mut self, other: &Self) {
        self.0.copy_from(&other.0);
    }

    fn linear_sum(a: T, x: &Self, b: T, y: &Self, z: &mut Self) {
        z.0.copy_from(&x.0);
        z.0 *= a;
        z.0.axpy(b, &y.0, T::one());
    }

    fn axpy(&mut self, a: T, x: &Self) {
        self.0.axpy(a, &x.0, T::one());
    }

    fn scale(&mut self, a: T) {
        self.0 *= a;
    }

    fn abs(&self) -> Self {
        SerialVector(self.0.map(|v| num_traits::Float::abs(v)))
    }

    fn add_scalar(&self, c: T) -> Self {
        SerialVector(self.0.map(|v| v + c))
    }

    fn add_scalar_mut(&mut self, c: T) {
        self.0.apply(|v| *v += c);
    }

    fn component_div(&self, y: &Self) -> Self {
        SerialVector(self.0.component_div(&y.0))
    }

    fn component_div_assign(&mut self, y: &Self) {
        self.0.component_mul_assign(&y.0.map(|v| T::one() / v));
    }

    fn component_mul(&self, y: &Self) -> Self {
        SerialVector(self.0.component_mul(&y.0))
    }

    fn component_mul_assign(&mut self, y: &Self) {
        self.0.component_mul_assign(&y.0);
    }

    fn component_inv(&self) -> Self {
        SerialVector(self.0.map(|v| T::one() / v))
    }

    fn fill(&mut self, c: T) {
        self.0.fill(c);
    }

    fn min(&self) -> T {
        self.0.min()
    }

    fn max_norm(&self) -> T {
        self.0.iter().fold(T::zero(), |acc, &v| {
            let a = num_traits::Float::abs(v);
            if a > acc {
                a
            } else {
                acc
            }
        })
    }
}

impl<T: Scalar> SerialVector<T> {
    pub fn is_zero_len(&self) -> bool {
        self.0.len() == 0
    }
}
