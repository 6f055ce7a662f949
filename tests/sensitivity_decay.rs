//! Forward sensitivity of `y' = -(p0+p1)*y` (`spec.md` §8 scenario 6):
//! with `p0 = p1 = 0.5` the combined rate is 1, so the analytic
//! sensitivities both equal `s(t) = -t*exp(-t)`, checked under
//! STAGGERED1 coupling with the built-in difference-quotient default.

use approx::assert_abs_diff_le;

use vsvo_multistep::coefficients::Lmm;
use vsvo_multistep::corrector::newton::NewtonCorrector;
use vsvo_multistep::corrector::staggered::StaggeredCoupling;
use vsvo_multistep::driver::{Driver, Mode};
use vsvo_multistep::ewt::Tolerances;
use vsvo_multistep::linear_solver::dense_lu::DenseLu;
use vsvo_multistep::matrix::dense_nalgebra::DenseMatrix;
use vsvo_multistep::op::ode_rhs::{OdeRhs, StateRhs};
use vsvo_multistep::op::sens_rhs::SensDq;
use vsvo_multistep::options::{IterationType, Options};
use vsvo_multistep::vector::serial::SerialVector;

type V = SerialVector<f64>;
type M = DenseMatrix<f64>;

struct ParamDecay;

impl StateRhs<f64, V> for ParamDecay {
    fn rhs(&self, _t: f64, y: &V, p: &V, ydot: &mut V) {
        ydot[0] = -(p[0] + p[1]) * y[0];
    }

    fn jacobian(&self, _t: f64, _y: &V, p: &V, jac: &mut dyn FnMut(usize, usize, f64)) -> bool {
        jac(0, 0, -(p[0] + p[1]));
        true
    }
}

#[test]
fn staggered1_sensitivities_track_analytic_solution() {
    let rhs = OdeRhs::<f64, M, _>::new(ParamDecay, 1, 2);
    let corrector = NewtonCorrector::new(DenseLu::default(), 3);
    let mut opts = Options::new(Lmm::Bdf, IterationType::Newton);
    opts.pbar = Some(vec![1.0, 1.0]);
    let tol = Tolerances::new_scalar(1e-8, 1e-10).unwrap();
    let p = V::from_vec(vec![0.5, 0.5]);

    let mut driver = Driver::new(rhs, corrector, opts, tol, p);
    let y0 = V::from_vec(vec![1.0]);
    driver.init(0.0, &y0, 10.0).unwrap();

    let sens_tol = Tolerances::new_scalar(1e-8, 1e-10).unwrap();
    let dq = SensDq::new(vec![1.0, 1.0], vec![1, 1], 0.0);
    driver
        .attach_sensitivities_dq(2, sens_tol, StaggeredCoupling::Staggered1, dq)
        .unwrap();

    driver.solve_with_sensitivities(10.0, Mode::Normal).unwrap();

    let ys = driver.get_sens_dky(10.0, 0).unwrap();
    let analytic = -10.0 * (-10.0f64).exp();
    assert_abs_diff_le!(ys.members[0][0], analytic, epsilon = 1e-5);
    assert_abs_diff_le!(ys.members[1][0], analytic, epsilon = 1e-5);

    let iters = driver.stagger1_nonlin_iters().expect("staggered1 coupling");
    assert_eq!(iters.len(), 2);
}
