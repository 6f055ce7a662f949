//! Error weights.
//!
//! `ewt[i] = 1 / (rtol*|y[i]| + atol[i])`. Supports both scalar-scalar and
//! scalar-vector tolerance configurations, independently for state,
//! quadrature and sensitivity channels.

use crate::error::{IntegratorError, IntegratorResult};
use crate::scalar::Scalar;
use crate::vector::Vector;

#[derive(Clone, Debug)]
pub enum AbsTol<V: Vector> {
    Scalar(V::T),
    Vector(V),
}

#[derive(Clone, Debug)]
pub struct Tolerances<V: Vector> {
    pub rtol: V::T,
    pub atol: AbsTol<V>,
}

impl<V: Vector> Tolerances<V> {
    pub fn new_scalar(rtol: V::T, atol: V::T) -> IntegratorResult<Self> {
        if rtol < V::T::zero() || atol < V::T::zero() {
            return Err(IntegratorError::IllegalTolerance {
                rtol: num_traits::NumCast::from(rtol).unwrap_or(0.0),
                atol: num_traits::NumCast::from(atol).unwrap_or(0.0),
            });
        }
        Ok(Self {
            rtol,
            atol: AbsTol::Scalar(atol),
        })
    }

    pub fn new_vector(rtol: V::T, atol: V, n: usize) -> IntegratorResult<Self> {
        if atol.len() != n {
            return Err(IntegratorError::AbsoluteToleranceLengthMismatch {
                got: atol.len(),
                expected: n,
            });
        }
        Ok(Self {
            rtol,
            atol: AbsTol::Vector(atol),
        })
    }

    /// `ewt[i] = 1 / (rtol*|y[i]| + atol[i])`.
    /// Returns an error naming the first non-positive component.
    pub fn compute(&self, y: &V, ewt: &mut V) -> IntegratorResult<()> {
        let n = y.len();
        for i in 0..n {
            let atol_i = match &self.atol {
                AbsTol::Scalar(a) => *a,
                AbsTol::Vector(v) => v[i],
            };
            let denom = self.rtol * num_traits::Float::abs(y[i]) + atol_i;
            if denom <= V::T::zero() {
                return Err(IntegratorError::BadErrorWeight {
                    index: i,
                    value: num_traits::NumCast::from(denom).unwrap_or(0.0),
                });
            }
            ewt[i] = V::T::one() / denom;
        }
        Ok(())
    }
}
