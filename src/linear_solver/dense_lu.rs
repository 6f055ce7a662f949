//! Default dense linear solver backend: an `nalgebra` LU factorisation of
//! the iteration matrix, grounded on the teacher's `linear_solver::lu::LU`
//! (same role, same backend — `DMatrix::lu()`), adapted to the
//! [`super::LinearSolver`] contract instead of the teacher's generic
//! `Solver`/`SolverProblem` pair.

use nalgebra::DMatrix;

use super::{ConvFail, LinearSolver, SetupOutcome, SolveOutcome};
use crate::matrix::dense_nalgebra::DenseMatrix;
use crate::op::linearise::LinearisedOp;
use crate::op::Jacobian;
use crate::scalar::Scalar;

pub struct DenseLu<T: Scalar> {
    lu: Option<nalgebra::LU<T, nalgebra::Dyn, nalgebra::Dyn>>,
}

impl<T: Scalar> Default for DenseLu<T> {
    fn default() -> Self {
        Self { lu: None }
    }
}

impl<C> LinearSolver<C> for DenseLu<C::T>
where
    C: Jacobian<M = DenseMatrix<<C as crate::op::Op>::T>>,
{
    fn init(&mut self) -> Result<(), String> {
        self.lu = None;
        Ok(())
    }

    fn setup(
        &mut self,
        rhs: &C,
        _convfail: ConvFail,
        y_pred: &C::V,
        _f_pred: &C::V,
        p: &C::V,
        t: C::T,
        gamma: C::T,
        jcur: &mut bool,
    ) -> SetupOutcome {
        let lin = LinearisedOp::new(rhs, gamma);
        let m = lin.iteration_matrix(t, y_pred, p);
        *jcur = true;
        self.lu = Some(m.0.lu());
        SetupOutcome::Ok
    }

    fn solve(&mut self, b: &mut C::V, _ewt: &C::V, _y_cur: &C::V, _f_cur: &C::V) -> SolveOutcome {
        match &self.lu {
            None => SolveOutcome::Unrecoverable("dense LU not initialized".into()),
            Some(lu) => {
                let mut rhs = DMatrix::from_column_slice(b.0.len(), 1, b.0.as_slice());
                if !lu.solve_mut(&mut rhs) {
                    return SolveOutcome::Recoverable;
                }
                b.0.copy_from(&rhs.column(0));
                SolveOutcome::Ok
            }
        }
    }
}
