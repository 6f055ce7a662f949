//! Functional (fixed-point) iteration for `lmm = Adams, iter = FUNCTIONAL`
//! (`spec.md` §4.3). Grounded on CVODE's `cvNlsFunctional`: no linear
//! solver is involved, the correction is formed directly from the latest
//! RHS evaluation.

use super::{Corrector, CorrectorOutcome, ConvergenceTest, DEFAULT_MAXCOR};
use crate::op::NonLinearOp;
use crate::scalar::Scalar;
use crate::vector::Vector;

pub struct FunctionalCorrector<T: Scalar> {
    maxcor: usize,
    niter: usize,
    test: ConvergenceTest<T>,
}

impl<T: Scalar> FunctionalCorrector<T> {
    pub fn new(maxcor: usize) -> Self {
        Self {
            maxcor: maxcor.max(1),
            niter: 0,
            test: ConvergenceTest::default(),
        }
    }
}

impl<T: Scalar> Default for FunctionalCorrector<T> {
    fn default() -> Self {
        Self::new(DEFAULT_MAXCOR)
    }
}

impl<C: NonLinearOp> Corrector<C> for FunctionalCorrector<C::T> {
    fn correct(
        &mut self,
        rhs: &C,
        t: C::T,
        p: &C::V,
        h: C::T,
        y_pred: &C::V,
        zn1: &C::V,
        rl1: C::T,
        _gamma: C::T,
        ewt: &C::V,
        tq4: C::T,
        y_cur: &mut C::V,
        acor: &mut C::V,
    ) -> CorrectorOutcome {
        self.test.reset();
        self.niter = 0;
        let mut ftemp = C::V::zeros(rhs.nout());

        loop {
            self.niter += 1;
            rhs.call_inplace(t, y_cur, p, &mut ftemp);

            // correction = rl1 * (h*f(t, y_cur) - zn1) + acor
            let mut correction = zn1.clone();
            correction.scale(-C::T::one());
            correction.axpy(h, &ftemp);
            correction.scale(rl1);
            correction += &*acor;

            let del = correction.wrms_norm(ewt);
            acor.copy_from(&correction);
            y_cur.copy_from(y_pred);
            *y_cur += &*acor;

            let scaled_del = match self.test.step(del) {
                Some(d) => d,
                None => return CorrectorOutcome::RetryWithNewJacobian,
            };

            if scaled_del <= tq4 {
                return CorrectorOutcome::Converged { niter: self.niter };
            }
            if self.niter >= self.maxcor {
                return CorrectorOutcome::RetryWithNewJacobian;
            }
        }
    }

    fn niter(&self) -> usize {
        self.niter
    }
}
