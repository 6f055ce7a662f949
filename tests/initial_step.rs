//! `spec.md` §8 scenario 5: the initial-step probe on a linear problem
//! must land inside `[hlb, hub]` with the sign of `tout - t0`.

use vsvo_multistep::initial_step::{initial_step, upper_bound_h0, InitialStepOutcome};
use vsvo_multistep::vector::serial::SerialVector;
use vsvo_multistep::vector::Vector;

type V = SerialVector<f64>;

#[test]
fn chosen_step_lies_within_bounds_and_matches_sign() {
    let uround = 2.2e-16_f64;
    let t0 = 0.0;
    let tout = 1.0;
    let tdist = tout - t0;

    let y0 = V::from_vec(vec![1.0]);
    let ydot0 = V::from_vec(vec![-1.0]);
    let atol = V::from_vec(vec![1e-10]);
    let hub = upper_bound_h0(&y0, &ydot0, &atol, tdist, &[]);
    let hlb = 100.0 * uround * f64::max(t0.abs(), tout.abs()).max(1.0);

    let outcome = initial_step(t0, tout, uround, hub, |hg| {
        let mut y1 = y0.clone();
        y1.axpy(hg, &ydot0);
        let f1 = V::from_vec(vec![-y1[0]]);
        let mut df = f1 - ydot0.clone();
        df.scale(1.0 / hg);
        df.wrms_norm(&V::from_vec(vec![1.0]))
    })
    .expect("tdist well above roundoff");

    let h = outcome.value();
    assert!(h > 0.0, "sign should match tout - t0 > 0, got h = {h}");
    match outcome {
        InitialStepOutcome::Iterated(h) => {
            assert!(h <= hub * 1.0 + 1e-15, "h = {h} exceeds hub = {hub}");
        }
        InitialStepOutcome::BoundsCrossed(h) => {
            assert!(h > 0.0 && h <= hub.max(hlb));
        }
    }
}
