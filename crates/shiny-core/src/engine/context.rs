use super::config::PolishConfig;
use super::progress::ProgressReporter;
use crate::core::ctf::{CtfCorrection, CtfModel};
use crate::core::fourier::{FourierTransformer, ResolutionShells};
use crate::core::io::frames::{FrameSource, ImageError};
use crate::core::models::experiment::Experiment;
use crate::core::models::particle::Particle;
use ndarray::Array2;
use num_complex::Complex64;

/// Read-only state shared by every task of a polishing run.
#[derive(Clone, Copy)]
pub struct PolishContext<'a> {
    pub experiment: &'a Experiment,
    pub frames: &'a dyn FrameSource,
    pub config: &'a PolishConfig,
    pub fft: &'a dyn FourierTransformer,
    pub shells: ResolutionShells,
    pub reporter: &'a ProgressReporter<'a>,
}

impl<'a> PolishContext<'a> {
    pub fn new(
        experiment: &'a Experiment,
        frames: &'a dyn FrameSource,
        config: &'a PolishConfig,
        fft: &'a dyn FourierTransformer,
        reporter: &'a ProgressReporter<'a>,
    ) -> Self {
        Self {
            experiment,
            frames,
            config,
            fft,
            shells: ResolutionShells::new(fft.box_size(), config.angpix),
            reporter,
        }
    }

    pub fn box_size(&self) -> usize {
        self.shells.box_size()
    }

    /// Frames of the analysis window present in this experiment's movies.
    pub fn movie_frames(&self) -> Vec<usize> {
        self.config.frames.frames(self.experiment.movie_frame_count())
    }

    pub fn ctf_model(&self, particle: &Particle) -> CtfModel {
        CtfModel::new(&particle.ctf, &self.config.optics)
    }

    /// CTF treatment for images that went through the polisher.
    pub fn shiny_ctf_correction(&self) -> CtfCorrection {
        CtfCorrection {
            ctf_phase_flipped: self.config.ctf.ctf_phase_flipped || self.config.phase_flip_shiny,
            ..self.config.ctf
        }
    }

    /// Reads one frame and checks it fits the box. `None` if the particle lacks the frame.
    ///
    /// Errors concern this particle and frame only; callers skip the frame and carry on.
    pub fn read_frame(&self, particle: &Particle, frame: usize) -> Result<Option<Array2<f64>>, ImageError> {
        let Some(image) = self.frames.read_frame(particle, frame)? else {
            return Ok(None);
        };
        let n = self.box_size();
        if image.dim() != (n, n) {
            return Err(ImageError::BoxSize {
                particle: particle.name.clone(),
                frame,
                expected: n,
                found: image.dim(),
            });
        }
        if image.iter().any(|v| !v.is_finite()) {
            return Err(ImageError::NonFinite {
                particle: particle.name.clone(),
                frame,
            });
        }
        Ok(Some(image))
    }

    pub fn frame_spectrum(&self, particle: &Particle, frame: usize) -> Result<Option<Array2<Complex64>>, ImageError> {
        Ok(self.read_frame(particle, frame)?.map(|image| self.fft.forward_2d(&image)))
    }
}
