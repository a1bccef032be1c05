//! Fourier-space reconstruction primitives: backprojection, projection and FSC.

pub mod backprojector;
pub mod fsc;
pub mod projector;

pub use backprojector::Backprojector;
pub use fsc::{FSC_THRESHOLD, FscCurve, fsc_weight};
pub use projector::project;

use crate::core::ctf::{CtfCorrection, CtfModel};
use crate::core::fourier::ResolutionShells;
use ndarray::Array2;
use num_complex::Complex64;

/// CTF-weights a particle spectrum for backprojection and returns the matching weights.
///
/// The spectrum is multiplied by the corrected CTF value and the known beam-tilt phase is
/// removed; each pixel's weight is the square of the corrected CTF value.
pub fn weight_for_backprojection(
    spectrum: &mut Array2<Complex64>,
    ctf: &CtfModel,
    correction: &CtfCorrection,
    shells: &ResolutionShells,
) -> Array2<f64> {
    let n = shells.box_size();
    let mut weights = Array2::zeros((n, n));
    for px in shells.pixels_2d() {
        let c = ctf.corrected_value(px.sx, px.sy, correction);
        let tilt = ctf.beam_tilt_phase(px.sx, px.sy);
        spectrum[[px.row, px.col]] *= Complex64::from_polar(c, -tilt);
        weights[[px.row, px.col]] = c * c;
    }
    weights
}
