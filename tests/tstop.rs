//! `spec.md` §8 scenario 4: a `tstop` set strictly before the requested
//! `tout` must halt exactly there and report `TSTOP_RETURN`.

use approx::assert_abs_diff_le;

use vsvo_multistep::coefficients::Lmm;
use vsvo_multistep::corrector::newton::NewtonCorrector;
use vsvo_multistep::driver::{Driver, Mode, StepStatus};
use vsvo_multistep::ewt::Tolerances;
use vsvo_multistep::linear_solver::dense_lu::DenseLu;
use vsvo_multistep::matrix::dense_nalgebra::DenseMatrix;
use vsvo_multistep::op::ode_rhs::{OdeRhs, StateRhs};
use vsvo_multistep::options::{IterationType, Options};
use vsvo_multistep::vector::serial::SerialVector;

type V = SerialVector<f64>;
type M = DenseMatrix<f64>;

struct Decay;

impl StateRhs<f64, V> for Decay {
    fn rhs(&self, _t: f64, y: &V, _p: &V, ydot: &mut V) {
        ydot[0] = -y[0];
    }

    fn jacobian(&self, _t: f64, _y: &V, _p: &V, jac: &mut dyn FnMut(usize, usize, f64)) -> bool {
        jac(0, 0, -1.0);
        true
    }
}

#[test]
fn stops_exactly_at_tstop_before_tout() {
    let rhs = OdeRhs::<f64, M, _>::new(Decay, 1, 0);
    let corrector = NewtonCorrector::new(DenseLu::default(), 3);
    let opts = Options::new(Lmm::Bdf, IterationType::Newton);
    let tol = Tolerances::new_scalar(1e-8, 1e-10).unwrap();
    let p = V::zeros(0);

    let mut driver = Driver::new(rhs, corrector, opts, tol, p);
    let y0 = V::from_vec(vec![1.0]);
    driver.init(0.0, &y0, 10.0).unwrap();

    let (t, status) = driver.solve(10.0, Mode::NormalTstop(5.0)).unwrap();

    assert_eq!(status, StepStatus::ReachedTstop);
    assert_abs_diff_le!(t, 5.0, epsilon = 1e-12);
}
