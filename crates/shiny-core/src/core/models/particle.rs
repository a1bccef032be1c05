use super::ids::{HalfSet, MicrographId, ParticleId};
use nalgebra::{Point2, Rotation3, Vector2, Vector3};

/// One per-frame position estimate (or fitted position) of a particle, in pixels.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrajectorySample {
    pub frame: usize,
    pub offset: Vector2<f64>,
}

impl TrajectorySample {
    pub fn new(frame: usize, dx: f64, dy: f64) -> Self {
        Self {
            frame,
            offset: Vector2::new(dx, dy),
        }
    }
}

/// Euler angles in degrees, ZYZ convention (rot, tilt, psi).
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Orientation {
    pub rot: f64,
    pub tilt: f64,
    pub psi: f64,
}

impl Orientation {
    pub fn new(rot: f64, tilt: f64, psi: f64) -> Self {
        Self { rot, tilt, psi }
    }

    /// Rotation taking reference coordinates into the particle frame,
    /// `R = Rz(psi) * Ry(tilt) * Rz(rot)`.
    pub fn rotation(&self) -> Rotation3<f64> {
        Rotation3::from_axis_angle(&Vector3::z_axis(), self.psi.to_radians())
            * Rotation3::from_axis_angle(&Vector3::y_axis(), self.tilt.to_radians())
            * Rotation3::from_axis_angle(&Vector3::z_axis(), self.rot.to_radians())
    }
}

/// Per-particle contrast transfer parameters.
///
/// Defoci are in Ångström, the astigmatism angle and the phase shift in degrees, and the
/// beam tilt in milliradians.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CtfParams {
    pub defocus_u: f64,
    pub defocus_v: f64,
    pub defocus_angle: f64,
    pub phase_shift: f64,
    pub beam_tilt: Vector2<f64>,
}

impl Default for CtfParams {
    fn default() -> Self {
        Self {
            defocus_u: 20_000.0,
            defocus_v: 20_000.0,
            defocus_angle: 0.0,
            phase_shift: 0.0,
            beam_tilt: Vector2::zeros(),
        }
    }
}

impl CtfParams {
    /// Copy of these parameters with both defoci moved by `shift` Ångström.
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
}

#[derive(Debug, Clone, PartialEq)]
pub struct Particle {
    pub id: ParticleId,
    pub name: String,
    pub micrograph: MicrographId,
    pub coordinates: Point2<f64>,  // Position on the micrograph, pixels
    pub origin: Vector2<f64>,      // Refined origin offset, pixels
    pub orientation: Orientation,
    pub ctf: CtfParams,
    pub half: HalfSet,
    pub(crate) offsets: Vec<TrajectorySample>, // Noisy per-frame estimates, sorted by frame
    pub(crate) fitted: Vec<TrajectorySample>,  // Smoothed trajectory, same frames as `offsets`
}

impl Particle {
    pub(crate) fn new(id: ParticleId, name: &str, micrograph: MicrographId, half: HalfSet) -> Self {
        Self {
            id,
            name: name.to_string(),
            micrograph,
            coordinates: Point2::origin(),
            origin: Vector2::zeros(),
            orientation: Orientation::default(),
            ctf: CtfParams::default(),
            half,
            offsets: Vec::new(),
            fitted: Vec::new(),
        }
    }

    pub fn offsets(&self) -> &[TrajectorySample] {
        &self.offsets
    }

    pub fn fitted_trajectory(&self) -> &[TrajectorySample] {
        &self.fitted
    }

    /// Replaces the per-frame estimates. Samples are kept sorted by frame and the fitted
    /// trajectory is reset to the raw estimates until a fit is committed.
    pub fn set_offsets(&mut self, mut samples: Vec<TrajectorySample>) {
        samples.sort_by_key(|s| s.frame);
        samples.dedup_by_key(|s| s.frame);
        self.fitted = samples.clone();
        self.offsets = samples;
    }

    pub fn fitted_offset(&self, frame: usize) -> Option<Vector2<f64>> {
        self.fitted
            .binary_search_by_key(&frame, |s| s.frame)
            .ok()
            .map(|i| self.fitted[i].offset)
    }

    /// Index one past the last frame this particle has an estimate for.
    pub fn frame_span(&self) -> usize {
        self.offsets.last().map_or(0, |s| s.frame + 1)
    }
}
