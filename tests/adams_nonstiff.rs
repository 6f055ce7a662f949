//! `y' = -0.1*y` under Adams/functional iteration (`spec.md` §8): a smooth,
//! well-behaved trajectory should let the order controller climb toward
//! the high end of the Adams family, and functional iteration must never
//! touch a linear solver at all.

use approx::assert_abs_diff_le;

use vsvo_multistep::coefficients::Lmm;
use vsvo_multistep::corrector::functional::FunctionalCorrector;
use vsvo_multistep::driver::{Driver, Mode};
use vsvo_multistep::ewt::Tolerances;
use vsvo_multistep::matrix::dense_nalgebra::DenseMatrix;
use vsvo_multistep::op::ode_rhs::{OdeRhs, StateRhs};
use vsvo_multistep::options::{IterationType, Options};
use vsvo_multistep::vector::serial::SerialVector;

type V = SerialVector<f64>;
type M = DenseMatrix<f64>;

struct SlowDecay;

impl StateRhs<f64, V> for SlowDecay {
    fn rhs(&self, _t: f64, y: &V, _p: &V, ydot: &mut V) {
        ydot[0] = -0.1 * y[0];
    }
}

#[test]
fn order_climbs_and_never_calls_a_linear_solver() {
    let rhs = OdeRhs::<f64, M, _>::new(SlowDecay, 1, 0);
    let corrector = FunctionalCorrector::new(3);
    let mut opts = Options::new(Lmm::Adams, IterationType::Functional);
    opts.mxstep = 2000;
    let tol = Tolerances::new_scalar(1e-10, 1e-12).unwrap();
    let p = V::zeros(0);

    let mut driver = Driver::new(rhs, corrector, opts, tol, p);
    let y0 = V::from_vec(vec![1.0]);
    driver.init(0.0, &y0, 100.0).unwrap();
    driver.solve(100.0, Mode::Normal).unwrap();

    let y_final = driver.get_dky(100.0, 0).unwrap();
    assert_abs_diff_le!(y_final[0], (-0.1f64 * 100.0).exp(), epsilon = 1e-6);

    let stats = driver.stats();
    assert_eq!(stats.nsetups, 0, "functional iteration must never set up a linear solver");
    assert!(stats.qu >= 5, "final order qu = {}", stats.qu);
}
