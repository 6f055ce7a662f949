//! A variable-step, variable-order linear multistep integrator for
//! nonstiff (Adams-Moulton) and stiff (BDF) initial value problems, with
//! optional quadrature and forward sensitivity coupling.
//!
//! The core loop lives in [`driver::Driver`]; everything else in this
//! crate is a piece it is built from: [`coefficients`] computes the
//! method's advance polynomial and error-test quantities, [`nordsieck`]
//! holds the scaled-derivative history those coefficients act on,
//! [`corrector`] drives the nonlinear solve that turns a predicted step
//! into an accepted one, and [`controller`]/[`error_test`]/
//! [`nonlinear_fail`]/[`stability`] decide how the step size and order
//! evolve from there.
//!
//! State, parameters and matrices are expressed against the [`vector`] and
//! [`matrix`] traits rather than a concrete type, so the integrator itself
//! is agnostic to the backing linear algebra; [`vector::serial`] and
//! [`matrix::dense_nalgebra`] provide the `nalgebra`-backed implementation
//! used by this crate's own tests.

pub mod coefficients;
pub mod controller;
pub mod corrector;
pub mod driver;
pub mod error;
pub mod error_test;
pub mod ewt;
pub mod initial_step;
pub mod linear_solver;
pub mod logging;
pub mod matrix;
pub mod nonlinear_fail;
pub mod nordsieck;
pub mod op;
pub mod options;
pub mod scalar;
pub mod stability;
pub mod state;
pub mod vector;

pub use error::{IntegratorError, IntegratorResult};
pub use scalar::Scalar;
pub use vector::Vector;
