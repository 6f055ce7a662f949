//! `y' = -y`, the simplest nonstiff-but-exact sanity check (`spec.md` §8):
//! BDF + Newton should track the analytic solution well inside `rtol`,
//! climbing order as the trajectory smooths out.

use approx::assert_abs_diff_le;

use vsvo_multistep::coefficients::Lmm;
use vsvo_multistep::corrector::newton::NewtonCorrector;
use vsvo_multistep::driver::{Driver, Mode};
use vsvo_multistep::ewt::Tolerances;
use vsvo_multistep::linear_solver::dense_lu::DenseLu;
use vsvo_multistep::matrix::dense_nalgebra::DenseMatrix;
use vsvo_multistep::op::ode_rhs::{OdeRhs, StateRhs};
use vsvo_multistep::options::{IterationType, Options};
use vsvo_multistep::vector::serial::SerialVector;

type V = SerialVector<f64>;
type M = DenseMatrix<f64>;

struct ExpDecay;

impl StateRhs<f64, V> for ExpDecay {
    fn rhs(&self, _t: f64, y: &V, _p: &V, ydot: &mut V) {
        ydot[0] = -y[0];
    }

    fn jacobian(&self, _t: f64, _y: &V, _p: &V, jac: &mut dyn FnMut(usize, usize, f64)) -> bool {
        jac(0, 0, -1.0);
        true
    }
}

#[test]
fn tracks_analytic_solution_to_t10() {
    let rhs = OdeRhs::<f64, M, _>::new(ExpDecay, 1, 0);
    let corrector = NewtonCorrector::new(DenseLu::default(), 3);
    let mut opts = Options::new(Lmm::Bdf, IterationType::Newton);
    opts.mxstep = 2000;
    let tol = Tolerances::new_scalar(1e-8, 1e-10).unwrap();
    let p = V::zeros(0);

    let mut driver = Driver::new(rhs, corrector, opts, tol, p);
    let y0 = V::from_vec(vec![1.0]);
    driver.init(0.0, &y0, 10.0).unwrap();
    driver.solve(10.0, Mode::Normal).unwrap();

    let y_final = driver.get_dky(10.0, 0).unwrap();
    assert_abs_diff_le!(y_final[0], (-10.0f64).exp(), epsilon = 1e-6);

    let stats = driver.stats();
    assert!(stats.nst < 200, "nst = {}", stats.nst);
    assert!((2..=5).contains(&stats.qu), "final order qu = {}", stats.qu);
}
