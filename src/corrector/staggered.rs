//! Sensitivity coupling for forward sensitivity analysis (`spec.md` §4.4,
//! §6.3 component M): STAGGERED corrects all `Ns` sensitivity vectors
//! together after the state corrector has converged; STAGGERED1 corrects
//! each parameter's sensitivity vector in its own independent loop.
//! SIMULTANEOUS (state and sensitivities in one combined Newton iteration)
//! is not modeled here — it shares no code with the staggered modes and is
//! handled by the driver running [`super::newton::NewtonCorrector`] against
//! an augmented operator instead.
//!
//! Both staggered modes reuse the iteration matrix already factorized for
//! the state correction (`spec.md` §4.4: the sensitivity equations are
//! linear in `yS`, so `dF_S/dyS = dF/dy`, the same Jacobian) — this is the
//! whole efficiency point of staggering, grounded on `CVStgrNls`/
//! `CVStgr1Nls` in `cvodes.c` reusing `cv_mem->cv_lsolve` without a new
//! `cv_lsetup` call.

use crate::corrector::{CorrectorOutcome, ConvergenceTest};
use crate::linear_solver::{LinearSolver, SolveOutcome};
use crate::op::Jacobian;
use crate::scalar::Scalar;
use crate::vector::{Vector, VectorOfVectors};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StaggeredCoupling {
    Staggered,
    Staggered1,
}

pub struct StaggeredCorrector<T: Scalar> {
    coupling: StaggeredCoupling,
    maxcors: usize,
    tests: Vec<ConvergenceTest<T>>,
    niters: Vec<usize>,
}

impl<T: Scalar> StaggeredCorrector<T> {
    pub fn new(coupling: StaggeredCoupling, ns: usize, maxcors: usize) -> Self {
        Self {
            coupling,
            maxcors: maxcors.max(1),
            tests: (0..ns).map(|_| ConvergenceTest::default()).collect(),
            niters: vec![0; ns],
        }
    }

    /// Per-parameter iteration counts from the last call to
    /// [`Self::correct`]. Meaningful for STAGGERED1 (`spec.md` §9's
    /// resolution of the `CVodeGetNumStgrSensNonlinSolvIters` open
    /// question: returned as a slice the caller owns, never via an
    /// out-parameter pointer reassignment).
    pub fn niters(&self) -> &[usize] {
        &self.niters
    }

    pub fn coupling(&self) -> StaggeredCoupling {
        self.coupling
    }

    /// Correct all (STAGGERED) or each (STAGGERED1) sensitivity vector in
    /// `ys_cur` against the already-converged state solution. `fs` computes
    /// the sensitivity residual for parameter `i`: `ysdot_i = fs(i, t, y, p, ys_i)`.
    /// `ls` is the same (already-factorized) linear solver the state
    /// correction just used.
    #[allow(clippy::too_many_arguments)]
    pub fn correct<C, LS, F>(
        &mut self,
        ls: &mut LS,
        mut fs: F,
        t: C::T,
        y: &C::V,
        p: &C::V,
        rl1: C::T,
        gamma: C::T,
        ys_pred: &VectorOfVectors<C::V>,
        zn1_s: &VectorOfVectors<C::V>,
        ewt_s: &[C::V],
        tq4_s: C::T,
        ys_cur: &mut VectorOfVectors<C::V>,
        acor_s: &mut VectorOfVectors<C::V>,
    ) -> CorrectorOutcome
    where
        C: Jacobian,
        LS: LinearSolver<C>,
        F: FnMut(usize, C::T, &C::V, &C::V, &C::V) -> C::V,
    {
        let ns = ys_pred.ns();
        match self.coupling {
            StaggeredCoupling::Staggered => {
                for i in 0..ns {
                    self.tests[i].reset();
                }
                self.niters = vec![0; ns];
                loop {
                    let mut all_converged = true;
                    for i in 0..ns {
                        let ysdot_i = fs(i, t, y, p, &ys_cur.members[i]);
                        let mut b = zn1_s.members[i].clone() * rl1;
                        b += &acor_s.members[i];
                        let mut rhs_term = ysdot_i * gamma;
                        rhs_term -= &b;
                        b = rhs_term;

                        match ls.solve(&mut b, &ewt_s[i], &ys_cur.members[i], &ys_cur.members[i]) {
                            SolveOutcome::Ok => {}
                            SolveOutcome::Recoverable => return CorrectorOutcome::RetryWithNewJacobian,
                            SolveOutcome::Unrecoverable(msg) => {
                                return CorrectorOutcome::LinearSolverUnrecoverable(msg)
                            }
                        }

                        let del = b.wrms_norm(&ewt_s[i]);
                        acor_s.members[i] += &b;
                        ys_cur.members[i].copy_from(&ys_pred.members[i]);
                        ys_cur.members[i] += &acor_s.members[i];
                        self.niters[i] += 1;

                        let scaled_del = match self.tests[i].step(del) {
                            Some(d) => d,
                            None => return CorrectorOutcome::ConvergenceFailure,
                        };
                        if scaled_del > tq4_s {
                            all_converged = false;
                        }
                    }
                    if all_converged {
                        return CorrectorOutcome::Converged {
                            niter: *self.niters.iter().max().unwrap_or(&0),
                        };
                    }
                    if self.niters.iter().all(|&n| n >= self.maxcors) {
                        return CorrectorOutcome::ConvergenceFailure;
                    }
                }
            }
            StaggeredCoupling::Staggered1 => {
                for i in 0..ns {
                    self.tests[i].reset();
                    self.niters[i] = 0;
                    loop {
                        let ysdot_i = fs(i, t, y, p, &ys_cur.members[i]);
                        let mut b = zn1_s.members[i].clone() * rl1;
                        b += &acor_s.members[i];
                        let mut rhs_term = ysdot_i * gamma;
                        rhs_term -= &b;
                        b = rhs_term;

                        match ls.solve(&mut b, &ewt_s[i], &ys_cur.members[i], &ys_cur.members[i]) {
                            SolveOutcome::Ok => {}
                            SolveOutcome::Recoverable => return CorrectorOutcome::RetryWithNewJacobian,
                            SolveOutcome::Unrecoverable(msg) => {
                                return CorrectorOutcome::LinearSolverUnrecoverable(msg)
                            }
                        }

                        let del = b.wrms_norm(&ewt_s[i]);
                        acor_s.members[i] += &b;
                        ys_cur.members[i].copy_from(&ys_pred.members[i]);
                        ys_cur.members[i] += &acor_s.members[i];
                        self.niters[i] += 1;

                        let scaled_del = match self.tests[i].step(del) {
                            Some(d) => d,
                            None => return CorrectorOutcome::ConvergenceFailure,
                        };
                        if scaled_del <= tq4_s {
                            break;
                        }
                        if self.niters[i] >= self.maxcors {
                            return CorrectorOutcome::ConvergenceFailure;
                        }
                    }
                }
                CorrectorOutcome::Converged {
                    niter: *self.niters.iter().max().unwrap_or(&0),
                }
            }
        }
    }
}
