//! The stiff Van der Pol oscillator (`mu = 1000`), the classic BDF/Newton
//! stress test (`spec.md` §8): failures should stay a small fraction of
//! accepted steps even through the relaxation-oscillation transitions.

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

const MU: f64 = 1000.0;

struct VanDerPol;

impl StateRhs<f64, V> for VanDerPol {
    fn rhs(&self, _t: f64, y: &V, _p: &V, ydot: &mut V) {
        ydot[0] = y[1];
        ydot[1] = MU * (1.0 - y[0] * y[0]) * y[1] - y[0];
    }

    fn jacobian(&self, _t: f64, y: &V, _p: &V, jac: &mut dyn FnMut(usize, usize, f64)) -> bool {
        jac(0, 0, 0.0);
        jac(0, 1, 1.0);
        jac(1, 0, -2.0 * MU * y[0] * y[1] - 1.0);
        jac(1, 1, MU * (1.0 - y[0] * y[0]));
        true
    }
}

#[test]
fn reaches_tout_with_few_failures() {
    let rhs = OdeRhs::<f64, M, _>::new(VanDerPol, 2, 0);
    let corrector = NewtonCorrector::new(DenseLu::default(), 3);
    let mut opts = Options::new(Lmm::Bdf, IterationType::Newton);
    opts.mxstep = 20_000;
    let tol = Tolerances::new_scalar(1e-6, 1e-8).unwrap();
    let p = V::zeros(0);

    let mut driver = Driver::new(rhs, corrector, opts, tol, p);
    let y0 = V::from_vec(vec![2.0, 0.0]);
    driver.init(0.0, &y0, 3000.0).unwrap();
    let (t_final, _) = driver.solve(3000.0, Mode::Normal).unwrap();
    assert!(t_final >= 3000.0);

    let stats = driver.stats();
    assert!(stats.nst > 0);
    let failures = stats.netf + stats.ncfn;
    assert!(
        (failures as f64) < 0.2 * (stats.nst as f64),
        "netf+ncfn = {failures}, nst = {}",
        stats.nst
    );
}
