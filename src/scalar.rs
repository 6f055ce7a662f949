use std::fmt::{Debug, Display};
use std::iter::Sum;
use std::ops::{Add, AddAssign, Div, DivAssign, Mul, MulAssign, Neg, Sub, SubAssign};

use num_traits::{Float, FromPrimitive, One, Signed, Zero};

/// The floating-point scalar type used throughout the integrator.
///
/// Bound aggregates everything the coefficient engine, Nordsieck store and
/// controller need: ordinary arithmetic, conversion from small integer
/// literals (`T::from(0.3)`), and the handful of `Float` methods (`abs`,
/// `sqrt`, `powf`) the step/order formulas call for.
pub trait Scalar:
    nalgebra::RealField
    + Float
    + FromPrimitive
    + Signed
    + Copy
    + Clone
    + Debug
    + Display
    + Zero
    + One
    + Sum
    + Add<Output = Self>
    + Sub<Output = Self>
    + Mul<Output = Self>
    + Div<Output = Self>
    + Neg<Output = Self>
    + AddAssign
    + SubAssign
    + MulAssign
    + DivAssign
    + PartialOrd
    + 'static
{
    /// Machine epsilon (CVODE's "uround").
    fn uround() -> Self {
        Self::epsilon()
    }

    fn from_f64(v: f64) -> Self {
        <Self as FromPrimitive>::from_f64(v).unwrap()
    }
}

impl Scalar for f64 {}
impl Scalar for f32 {}
