//! Diagnostic output. The driver never
//! writes to stdout/stderr directly; it goes through the `log` crate so an
//! embedding application can route step-level diagnostics (HNIL warnings,
//! order/step changes, stability-limit detections) the same way it routes
//! its own logs. A binary or test enables a backend (e.g. `pretty_env_logger`)
//! to see them.

/// Too-many-warnings-about-`h`-below-roundoff (HNIL) diagnostic,
/// rate-limited by the caller via `mxhnil`/`nhnil`.
pub fn warn_hnil(t: f64, h: f64) {
    log::warn!("internal t = {t} and h = {h} are such that t + h = t on the next step");
}

pub fn warn_hnil_suppressed() {
    log::warn!("further internal t + h = t warnings will be suppressed");
}

pub fn info_order_change(t: f64, from: u32, to: u32) {
    log::info!("order change at t = {t}: {from} -> {to}");
}

pub fn debug_step_accepted(t: f64, h: f64, q: u32, dsm: f64) {
    log::debug!("step accepted: t = {t}, h = {h}, q = {q}, dsm = {dsm}");
}

pub fn debug_step_rejected(t: f64, h: f64, reason: &str) {
    log::debug!("step rejected at t = {t}, h = {h}: {reason}");
}

pub fn warn_stability_limit(t: f64, q_from: u32, q_to: u32) {
    log::warn!("BDF stability limit detected at t = {t}: capping order {q_from} -> {q_to}");
}
