use crate::core::ctf::{CtfCorrection, OpticsSettings};
use crate::core::image::NormalisationSettings;
use nalgebra::Vector2;
use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::path::PathBuf;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Clone)]
pub enum ConfigError {
    #[error("Missing required parameter: {0}")]
    MissingParameter(&'static str),

    #[error("Pixel size must be positive and finite, got {0}")]
    InvalidPixelSize(f64),

    #[error("Unknown trajectory fit mode '{0}' (expected linear, log, sqrt or none)")]
    UnknownFitMode(String),

    #[error("Mask file not found: {}", .0.display())]
    MissingMask(PathBuf),

    #[error("Mask has shape {found:?} but reconstructions are {expected}^3")]
    MaskSizeMismatch { expected: usize, found: (usize, usize, usize) },

    #[error("Reference volume unavailable: {0}")]
    MissingReference(String),

    #[error("Invalid frame range: {0}")]
    InvalidFrameRange(String),

    #[error("Invalid value for '{name}': {reason}")]
    InvalidParameter { name: &'static str, reason: String },
}

fn invalid(name: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::InvalidParameter {
        name,
        reason: reason.into(),
    }
}

/// Time model used to smooth per-frame position estimates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum FitMode {
    #[default]
    Linear,
    Logarithmic,
    Sqrt,
    NoFit,
}

impl FromStr for FitMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "linear" => Ok(FitMode::Linear),
            "log" | "logarithmic" => Ok(FitMode::Logarithmic),
            "sqrt" => Ok(FitMode::Sqrt),
            "none" | "no-fit" | "nofit" => Ok(FitMode::NoFit),
            _ => Err(ConfigError::UnknownFitMode(s.to_string())),
        }
    }
}

impl fmt::Display for FitMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FitMode::Linear => "linear",
            FitMode::Logarithmic => "log",
            FitMode::Sqrt => "sqrt",
            FitMode::NoFit => "none",
        };
        f.write_str(name)
    }
}

/// Frames `first..=last` taken every `step`; `last` of `None` means the final movie frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FrameWindow {
    pub first: usize,
    pub last: Option<usize>,
    pub step: usize,
}

impl Default for FrameWindow {
    fn default() -> Self {
        Self {
            first: 0,
            last: None,
            step: 1,
        }
    }
}

impl FrameWindow {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.step == 0 {
            return Err(ConfigError::InvalidFrameRange("step must be at least 1".to_string()));
        }
        if let Some(last) = self.last {
            if last < self.first {
                return Err(ConfigError::InvalidFrameRange(format!(
                    "last frame {last} precedes first frame {}",
                    self.first
                )));
            }
        }
        Ok(())
    }

    /// Frames of a movie with `movie_frames` frames that fall in this window.
    pub fn frames(&self, movie_frames: usize) -> Vec<usize> {
        let Some(final_frame) = movie_frames.checked_sub(1) else {
            return Vec::new();
        };
        let last = self.last.map_or(final_frame, |l| l.min(final_frame));
        if self.first > last {
            return Vec::new();
        }
        (self.first..=last).step_by(self.step.max(1)).collect()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MovementConfig {
    pub fit_mode: FitMode,
    pub running_average_width: usize,
    pub sigma_neighbour_distance: f64, // pixels; 0 disables neighbour weighting
}

impl Default for MovementConfig {
    fn default() -> Self {
        Self {
            fit_mode: FitMode::Linear,
            running_average_width: 5,
            sigma_neighbour_distance: 100.0,
        }
    }
}

impl MovementConfig {
    /// Leading and trailing samples left out of the regression.
    pub fn excluded_edge_frames(&self) -> usize {
        self.running_average_width / 2
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BfactorConfig {
    pub do_weighting: bool,
    pub fit_minres: f64,         // Å, lowest resolution used in Guinier fits
    pub perframe_highres: f64,   // Å, resolution limit of single-frame reconstructions
    pub frame_running_average: usize,
    pub mask: Option<PathBuf>,   // applied to the FSC of the averaged reconstructions
}

impl Default for BfactorConfig {
    fn default() -> Self {
        Self {
            do_weighting: true,
            fit_minres: 20.0,
            perframe_highres: 6.0,
            frame_running_average: 1,
            mask: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NormalisationConfig {
    pub do_normalise: bool,
    pub do_ramp: bool,
    pub bg_radius: Option<f64>,
    pub white_dust_stddev: f64,
    pub black_dust_stddev: f64,
}

impl Default for NormalisationConfig {
    fn default() -> Self {
        Self {
            do_normalise: true,
            do_ramp: true,
            bg_radius: None,
            white_dust_stddev: -1.0,
            black_dust_stddev: -1.0,
        }
    }
}

impl NormalisationConfig {
    /// Settings for a given box; the background radius defaults to 3/8 of the box.
    pub fn settings(&self, box_size: usize) -> NormalisationSettings {
        NormalisationSettings {
            bg_radius: self.bg_radius.unwrap_or(0.375 * box_size as f64),
            do_ramp: self.do_ramp,
            white_dust_stddev: self.white_dust_stddev,
            black_dust_stddev: self.black_dust_stddev,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OptimisationConfig {
    pub beamtilt_max: f64,        // mrad; 0 disables the beam-tilt search
    pub beamtilt_step: f64,       // mrad
    pub defocus_shift_max: f64,   // Å; 0 disables the defocus search
    pub defocus_shift_step: f64,  // Å
    pub minres_beamtilt: f64,     // Å
    pub maxres_model: Option<f64>, // Å; defaults to the achieved shiny resolution
    pub min_group_particles: usize,
}

impl Default for OptimisationConfig {
    fn default() -> Self {
        Self {
            beamtilt_max: 0.0,
            beamtilt_step: 0.2,
            defocus_shift_max: 0.0,
            defocus_shift_step: 100.0,
            minres_beamtilt: 6.0,
            maxres_model: None,
            min_group_particles: 10,
        }
    }
}

/// Grid of `2·floor(max/step) + 1` multiples of `step` centred on exactly 0, or just `[0]`.
fn symmetric_grid(max: f64, step: f64) -> Vec<f64> {
    if max <= 0.0 || step <= 0.0 {
        return vec![0.0];
    }
    let half = (max / step).floor() as i64;
    (-half..=half).map(|i| i as f64 * step).collect()
}

impl OptimisationConfig {
    pub fn beam_tilt_enabled(&self) -> bool {
        self.beamtilt_max > 0.0 && self.beamtilt_step > 0.0
    }

    pub fn defocus_enabled(&self) -> bool {
        self.defocus_shift_max > 0.0 && self.defocus_shift_step > 0.0
    }

    pub fn enabled(&self) -> bool {
        self.beam_tilt_enabled() || self.defocus_enabled()
    }

    pub fn nr_sampled_beam_tilts(&self) -> usize {
        symmetric_grid(self.beamtilt_max, self.beamtilt_step).len()
    }

    /// Candidate beam tilts (mrad), x major.
    pub fn beam_tilt_grid(&self) -> Vec<Vector2<f64>> {
        let axis = symmetric_grid(self.beamtilt_max, self.beamtilt_step);
        axis.iter()
            .flat_map(|&x| axis.iter().map(move |&y| Vector2::new(x, y)))
            .collect()
    }

    pub fn defocus_grid(&self) -> Vec<f64> {
        symmetric_grid(self.defocus_shift_max, self.defocus_shift_step)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PolishConfig {
    pub angpix: f64,
    pub optics: OpticsSettings,
    pub ctf: CtfCorrection,
    pub frames: FrameWindow,
    pub movement: MovementConfig,
    pub bfactor: BfactorConfig,
    pub normalisation: NormalisationConfig,
    pub optimisation: OptimisationConfig,
    pub phase_flip_shiny: bool,
    pub do_second_pass: bool,
    pub do_start_all_over: bool,
}

impl PolishConfig {
    /// Checks everything that can be checked before any data is touched.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.angpix.is_finite() && self.angpix > 0.0) {
            return Err(ConfigError::InvalidPixelSize(self.angpix));
        }
        if !(self.optics.voltage_kv > 0.0) {
            return Err(invalid("voltage", "must be positive"));
        }
        if !(self.optics.spherical_aberration_mm >= 0.0) {
            return Err(invalid("spherical-aberration", "must be non-negative"));
        }
        if !(0.0..1.0).contains(&self.optics.amplitude_contrast) {
            return Err(invalid("amplitude-contrast", "must lie in [0, 1)"));
        }
        self.frames.validate()?;

        if !(self.movement.sigma_neighbour_distance >= 0.0) {
            return Err(invalid("sigma-neighbour-distance", "must be non-negative"));
        }

        let b = &self.bfactor;
        if !(b.fit_minres > 0.0) || !(b.perframe_highres > 0.0) {
            return Err(invalid("fit-minres", "resolutions must be positive"));
        }
        if b.fit_minres <= b.perframe_highres {
            return Err(invalid(
                "fit-minres",
                format!(
                    "{} Å must be a lower resolution than perframe-highres ({} Å)",
                    b.fit_minres, b.perframe_highres
                ),
            ));
        }
        if b.frame_running_average == 0 {
            return Err(invalid("frame-running-average", "must be at least 1"));
        }
        if let Some(mask) = &b.mask {
            if !mask.exists() {
                return Err(ConfigError::MissingMask(mask.clone()));
            }
        }

        if let Some(radius) = self.normalisation.bg_radius {
            if !(radius > 0.0) {
                return Err(invalid("bg-radius", "must be positive"));
            }
        }

        let o = &self.optimisation;
        if !(o.minres_beamtilt > 0.0) {
            return Err(invalid("minres-beamtilt", "must be positive"));
        }
        if let Some(maxres) = o.maxres_model {
            if !(maxres > 0.0) {
                return Err(invalid("maxres-model", "must be positive"));
            }
        }
        if o.beamtilt_max > 0.0 && !(o.beamtilt_step > 0.0) {
            return Err(invalid("beamtilt-step", "must be positive when the beam-tilt search is on"));
        }
        if o.defocus_shift_max > 0.0 && !(o.defocus_shift_step > 0.0) {
            return Err(invalid("defocus-shift-step", "must be positive when the defocus search is on"));
        }
        Ok(())
    }

    /// Checks that depend on the particle box size.
    pub fn validate_for_box(&self, box_size: usize) -> Result<(), ConfigError> {
        if box_size < 4 {
            return Err(invalid("box-size", format!("{box_size} px is too small")));
        }
        if self.normalisation.do_normalise {
            let radius = self.normalisation.settings(box_size).bg_radius;
            if radius >= box_size as f64 / 2.0 {
                return Err(invalid(
                    "bg-radius",
                    format!("{radius} px leaves no background in a {box_size} px box"),
                ));
            }
        }
        Ok(())
    }

    /// Hash of every setting that changes single-frame reconstructions.
    pub fn reconstruction_fingerprint(&self, box_size: usize) -> u64 {
        let mut hasher = DefaultHasher::new();
        box_size.hash(&mut hasher);
        for value in [
            self.angpix,
            self.optics.voltage_kv,
            self.optics.spherical_aberration_mm,
            self.optics.amplitude_contrast,
            self.bfactor.perframe_highres,
        ] {
            value.to_bits().hash(&mut hasher);
        }
        self.ctf.hash(&mut hasher);
        self.bfactor.frame_running_average.hash(&mut hasher);
        self.movement.fit_mode.hash(&mut hasher);
        hasher.finish()
    }
}

#[derive(Default)]
pub struct PolishConfigBuilder {
    angpix: Option<f64>,
    optics: Option<OpticsSettings>,
    ctf: Option<CtfCorrection>,
    frames: Option<FrameWindow>,
    movement: Option<MovementConfig>,
    bfactor: Option<BfactorConfig>,
    normalisation: Option<NormalisationConfig>,
    optimisation: Option<OptimisationConfig>,
    phase_flip_shiny: Option<bool>,
    do_second_pass: Option<bool>,
    do_start_all_over: Option<bool>,
}

impl PolishConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn angpix(mut self, angpix: f64) -> Self {
        self.angpix = Some(angpix);
        self
    }
    pub fn optics(mut self, optics: OpticsSettings) -> Self {
        self.optics = Some(optics);
        self
    }
    pub fn ctf_correction(mut self, ctf: CtfCorrection) -> Self {
        self.ctf = Some(ctf);
        self
    }
    pub fn frames(mut self, frames: FrameWindow) -> Self {
        self.frames = Some(frames);
        self
    }
    pub fn movement(mut self, movement: MovementConfig) -> Self {
        self.movement = Some(movement);
        self
    }
    pub fn bfactor(mut self, bfactor: BfactorConfig) -> Self {
        self.bfactor = Some(bfactor);
        self
    }
    pub fn normalisation(mut self, normalisation: NormalisationConfig) -> Self {
        self.normalisation = Some(normalisation);
        self
    }
    pub fn optimisation(mut self, optimisation: OptimisationConfig) -> Self {
        self.optimisation = Some(optimisation);
        self
    }
    pub fn phase_flip_shiny(mut self, flip: bool) -> Self {
        self.phase_flip_shiny = Some(flip);
        self
    }
    pub fn second_pass(mut self, second_pass: bool) -> Self {
        self.do_second_pass = Some(second_pass);
        self
    }
    pub fn start_all_over(mut self, start_all_over: bool) -> Self {
        self.do_start_all_over = Some(start_all_over);
        self
    }

    pub fn build(self) -> Result<PolishConfig, ConfigError> {
        let config = PolishConfig {
            angpix: self.angpix.ok_or(ConfigError::MissingParameter("angpix"))?,
            optics: self.optics.unwrap_or_default(),
            ctf: self.ctf.unwrap_or_default(),
            frames: self.frames.unwrap_or_default(),
            movement: self.movement.unwrap_or_default(),
            bfactor: self.bfactor.unwrap_or_default(),
            normalisation: self.normalisation.unwrap_or_default(),
            optimisation: self.optimisation.unwrap_or_default(),
            phase_flip_shiny: self.phase_flip_shiny.unwrap_or(false),
            do_second_pass: self.do_second_pass.unwrap_or(false),
            do_start_all_over: self.do_start_all_over.unwrap_or(false),
        };
        config.validate()?;
        Ok(config)
    }
}
