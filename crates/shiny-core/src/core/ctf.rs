use super::fourier::ResolutionShells;
use super::models::particle::CtfParams;
use nalgebra::Vector2;
use ndarray::Array2;
use num_complex::Complex64;
use std::f64::consts::{FRAC_PI_2, PI};

/// Microscope-wide optical constants.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OpticsSettings {
    pub voltage_kv: f64,
    pub spherical_aberration_mm: f64,
    pub amplitude_contrast: f64,
}

impl Default for OpticsSettings {
    fn default() -> Self {
        Self {
            voltage_kv: 300.0,
            spherical_aberration_mm: 2.7,
            amplitude_contrast: 0.1,
        }
    }
}

impl OpticsSettings {
    /// Relativistic electron wavelength in Å.
    pub fn wavelength(&self) -> f64 {
        let volts = self.voltage_kv * 1e3;
        12.2643247 / (volts * (1.0 + volts * 0.978466e-6)).sqrt()
    }
}

/// How CTF effects are treated when images are combined into reconstructions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CtfCorrection {
    pub do_ctf: bool,
    pub ctf_phase_flipped: bool,     // Input images are already phase flipped
    pub only_flip_phases: bool,      // Correct the sign only, never the amplitude
    pub intact_ctf_first_peak: bool, // Leave frequencies before the first peak untouched
}

impl Default for CtfCorrection {
    fn default() -> Self {
        Self {
            do_ctf: true,
            ctf_phase_flipped: false,
            only_flip_phases: false,
            intact_ctf_first_peak: false,
        }
    }
}

fn sign(value: f64) -> f64 {
    if value < 0.0 { -1.0 } else { 1.0 }
}

/// The CTF of one particle, evaluated at spatial frequencies in 1/Å.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CtfModel {
    lambda: f64,
    cs: f64, // Å
    k3: f64,
    defocus_u: f64,
    defocus_v: f64,
    azimuth: f64, // radians
    phase_shift: f64,
    beam_tilt: Vector2<f64>, // mrad
}

impl CtfModel {
    pub fn new(params: &CtfParams, optics: &OpticsSettings) -> Self {
        let q0 = optics.amplitude_contrast.clamp(0.0, 0.999_999);
        Self {
            lambda: optics.wavelength(),
            cs: optics.spherical_aberration_mm * 1e7,
            k3: (q0 / (1.0 - q0 * q0).sqrt()).atan(),
            defocus_u: params.defocus_u,
            defocus_v: params.defocus_v,
            azimuth: params.defocus_angle.to_radians(),
            phase_shift: params.phase_shift.to_radians(),
            beam_tilt: params.beam_tilt,
        }
    }

    pub fn with_defocus_shift(&self, shift: f64) -> Self {
        Self {
            defocus_u: self.defocus_u + shift,
            defocus_v: self.defocus_v + shift,
            ..*self
        }
    }

    pub fn with_beam_tilt(&self, beam_tilt: Vector2<f64>) -> Self {
        Self { beam_tilt, ..*self }
    }

    pub fn beam_tilt(&self) -> Vector2<f64> {
        self.beam_tilt
    }

    /// Astigmatic defocus along the direction of `(sx, sy)`.
    pub fn defocus_at(&self, sx: f64, sy: f64) -> f64 {
        let angle = sy.atan2(sx);
        0.5 * (self.defocus_u + self.defocus_v)
            + 0.5 * (self.defocus_u - self.defocus_v) * (2.0 * (angle - self.azimuth)).cos()
    }

    /// Phase aberration χ(s), including the amplitude contrast and phase plate terms.
    pub fn chi(&self, sx: f64, sy: f64) -> f64 {
        let s2 = sx * sx + sy * sy;
        PI * self.lambda * self.defocus_at(sx, sy) * s2
            - FRAC_PI_2 * self.cs * self.lambda.powi(3) * s2 * s2
            + self.phase_shift
            + self.k3
    }

    pub fn value(&self, sx: f64, sy: f64) -> f64 {
        self.chi(sx, sy).sin()
    }

    pub fn before_first_peak(&self, sx: f64, sy: f64) -> bool {
        self.chi(sx, sy).abs() < FRAC_PI_2
    }

    /// Factor `g` such that the beam-tilt phase is `g · (sx·τx + sy·τy)` for a tilt τ in mrad.
    pub fn beam_tilt_factor(&self, sx: f64, sy: f64) -> f64 {
        2.0 * PI * 1e-3 * self.cs * self.lambda * self.lambda * (sx * sx + sy * sy)
    }

    /// Antisymmetric phase error caused by this model's beam tilt, in radians.
    pub fn beam_tilt_phase(&self, sx: f64, sy: f64) -> f64 {
        self.beam_tilt_factor(sx, sy) * (sx * self.beam_tilt.x + sy * self.beam_tilt.y)
    }

    /// CTF value used when an image enters a reconstruction; the matching weight is its square.
    pub fn corrected_value(&self, sx: f64, sy: f64, correction: &CtfCorrection) -> f64 {
        if !correction.do_ctf {
            return 1.0;
        }
        if correction.intact_ctf_first_peak && self.before_first_peak(sx, sy) {
            return 1.0;
        }
        let c = self.value(sx, sy);
        if correction.only_flip_phases {
            sign(c)
        } else if correction.ctf_phase_flipped {
            c.abs()
        } else {
            c
        }
    }

    /// Sign applied when phase flipping an image.
    pub fn phase_flip_sign(&self, sx: f64, sy: f64, intact_first_peak: bool) -> f64 {
        if intact_first_peak && self.before_first_peak(sx, sy) {
            1.0
        } else {
            sign(self.value(sx, sy))
        }
    }

    /// CTF as present in an image that may have been phase flipped.
    pub fn observed_value(&self, sx: f64, sy: f64, flipped: bool, intact_first_peak: bool) -> f64 {
        let c = self.value(sx, sy);
        if flipped {
            c * self.phase_flip_sign(sx, sy, intact_first_peak)
        } else {
            c
        }
    }

    /// Full complex transfer function (CTF times beam-tilt phase) on a square grid.
    pub fn transfer_function(&self, shells: &ResolutionShells) -> Array2<Complex64> {
        let n = shells.box_size();
        let mut out = Array2::zeros((n, n));
        for px in shells.pixels_2d() {
            out[[px.row, px.col]] =
                Complex64::from_polar(self.value(px.sx, px.sy), self.beam_tilt_phase(px.sx, px.sy));
        }
        out
    }
}
