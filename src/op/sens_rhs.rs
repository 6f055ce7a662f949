//! Sensitivity right-hand side dispatch and the default finite-difference
//! approximation (`spec.md` §6.3 L, §6.4).

use std::cell::Cell;

use crate::scalar::Scalar;
use crate::vector::{Vector, VectorOfVectors};

/// User-supplied "all parameters at once" sensitivity RHS.
pub trait SensRhsAll<T: Scalar, V: Vector<T = T>> {
    fn sens_rhs(&self, t: T, y: &V, ydot: &V, ys: &VectorOfVectors<V>, ysdot: &mut VectorOfVectors<V>);
}

/// User-supplied "one parameter at a time" sensitivity RHS
/// (`fS1` in `spec.md` §6.3). Incompatible with an all-at-once callback —
/// see `StaggeredCoupling::Staggered1` in `corrector::staggered`.
pub trait SensRhsOne<T: Scalar, V: Vector<T = T>> {
    fn sens_rhs_one(&self, t: T, y: &V, ydot: &V, i: usize, ys_i: &V, ysdot_i: &mut V);
}

/// Which centered/forward difference-quotient scheme (`spec.md` §6.4) to
/// use, selected per call from the ratio of the y- and p-perturbation
/// scales and the sign of `rhomax`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DqScheme {
    Centered1,
    Centered2,
    Forward1,
    Forward2,
}

/// Default difference-quotient sensitivity RHS, used whenever the problem
/// does not supply an analytic `fS`/`fS1` (`spec.md` §6.4).
///
/// `pbar` is the per-parameter scale used to form the perturbation; it is
/// mandatory whenever DQ sensitivities are in use (`spec.md` §4/"Open
/// Questions": the duplicate `pbar == NULL` check in `CVodeSensReInit` is
/// collapsed here into a single precondition checked once at
/// construction, see `DESIGN.md`).
pub struct SensDq<T: Scalar> {
    pub pbar: Vec<T>,
    /// Sign encodes "skip forward perturbation" per `spec.md` §6.5 `plist`;
    /// magnitude selects which parameters participate.
    pub plist: Vec<i64>,
    /// rho_max from `spec.md` §6.4: selects centered (>=0) vs forward (<0)
    /// and the combined-vs-separate perturbation threshold.
    pub rhomax: T,
    pub nfe_s: Cell<usize>,
}

impl<T: Scalar> SensDq<T> {
    pub fn new(pbar: Vec<T>, plist: Vec<i64>, rhomax: T) -> Self {
        assert_eq!(pbar.len(), plist.len());
        Self {
            pbar,
            plist,
            rhomax,
            nfe_s: Cell::new(0),
        }
    }

    fn scheme(&self, ratio: T) -> DqScheme {
        let inv = T::one() / ratio;
        let spread = if ratio > inv { ratio } else { inv };
        let rho = num_traits::Float::abs(self.rhomax);
        let combine = self.rhomax.is_zero() || spread <= rho;
        match (combine, self.rhomax >= T::zero()) {
            (true, true) => DqScheme::Centered1,
            (true, false) => DqScheme::Forward1,
            (false, true) => DqScheme::Centered2,
            (false, false) => DqScheme::Forward2,
        }
    }

    /// Evaluate the sensitivity RHS for parameter `i` by differencing the
    /// state RHS, following `spec.md` §6.4:
    ///
    /// `dp = pbar_i * delta`, `dy = pbar_i^-1 / max(wrms(yS,ewt)*pbar_i, 1/delta)`,
    /// combined when `max(ratio,1/ratio) <= |rhomax|`.
    #[allow(clippy::too_many_arguments)]
    pub fn eval_one<V, F>(
        &self,
        i: usize,
        t: T,
        y: &V,
        p: &V,
        ydot: &V,
        ys_i: &V,
        ewt: &V,
        reltol: T,
        mut rhs: F,
    ) -> V
    where
        V: Vector<T = T>,
        F: FnMut(T, &V, &V) -> V,
    {
        let delta = num_traits::Float::sqrt(num_traits::Float::max(reltol, T::uround()));
        let pbar_i = self.pbar[i];
        let norm_ys = ys_i.wrms_norm(ewt);
        let inv_delta = T::one() / delta;
        let dy = T::one() / num_traits::Float::max(norm_ys * pbar_i, inv_delta) / pbar_i;
        let dp = pbar_i * delta;
        let ratio = dy / dp;
        let scheme = self.scheme(ratio);
        let d = if dy < dp { dy } else { dp };

        let mut p_pert = p.clone();
        let skip_forward = self.plist[i] < 0;
        let base_p = p[i];

        let eval_at = |p_pert: &V, y_pert: &V| -> V {
            self.nfe_s.set(self.nfe_s.get() + 1);
            rhs(t, y_pert, p_pert)
        };

        match scheme {
            DqScheme::Centered1 => {
                let mut yp = y.clone();
                yp.axpy(d, ys_i);
                p_pert[i] = base_p + d * pbar_i / dy.max(T::uround());
                let f_plus = eval_at(&p_pert, &yp);
                let mut ym = y.clone();
                ym.axpy(-d, ys_i);
                p_pert[i] = base_p - d * pbar_i / dy.max(T::uround());
                let f_minus = eval_at(&p_pert, &ym);
                (f_plus - f_minus) / (d + d)
            }
            DqScheme::Forward1 => {
                let mut yp = y.clone();
                yp.axpy(d, ys_i);
                p_pert[i] = base_p + d * pbar_i / dy.max(T::uround());
                let f_plus = eval_at(&p_pert, &yp);
                (f_plus - ydot.clone()) / d
            }
            DqScheme::Centered2 => {
                let mut yp = y.clone();
                yp.axpy(dy, ys_i);
                let f_y_plus = eval_at(p, &yp);
                let mut ym = y.clone();
                ym.axpy(-dy, ys_i);
                let f_y_minus = eval_at(p, &ym);
                let mut dfdy = (f_y_plus - f_y_minus) / (dy + dy);

                if !skip_forward {
                    p_pert[i] = base_p + dp;
                    let f_p_plus = eval_at(&p_pert, y);
                    p_pert[i] = base_p - dp;
                    let f_p_minus = eval_at(&p_pert, y);
                    p_pert[i] = base_p;
                    let dfdp = (f_p_plus - f_p_minus) / (dp + dp);
                    dfdy.axpy(T::one(), &dfdp);
                }
                dfdy
            }
            DqScheme::Forward2 => {
                let mut yp = y.clone();
                yp.axpy(dy, ys_i);
                let f_y_plus = eval_at(p, &yp);
                let mut dfdy = (f_y_plus - ydot.clone()) / dy;

                if !skip_forward {
                    p_pert[i] = base_p + dp;
                    let f_p_plus = eval_at(&p_pert, y);
                    p_pert[i] = base_p;
                    let dfdp = (f_p_plus - ydot.clone()) / dp;
                    dfdy.axpy(T::one(), &dfdp);
                }
                dfdy
            }
        }
    }
}
