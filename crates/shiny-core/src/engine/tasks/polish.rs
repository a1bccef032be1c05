//! Combination of aligned, weighted movie frames into one polished particle image, and the
//! two-half reconstruction of the polished set.

use crate::core::fitting::RelativeWeights;
use crate::core::fourier::shift_spectrum;
use crate::core::image::normalise;
use crate::core::models::ids::{HalfSet, MicrographId, ParticleId};
use crate::core::models::particle::Particle;
use crate::core::reconstruction::{Backprojector, FSC_THRESHOLD, FscCurve, weight_for_backprojection};
use crate::engine::context::PolishContext;
use crate::engine::error::{EngineError, IssueLog, PolishIssue};
use crate::engine::progress::Progress;
use ndarray::{Array2, Array3};
use num_complex::Complex64;
use std::fmt;
use tracing::{debug, info, instrument};

#[cfg(feature = "parallel")]
use rayon::prelude::*;

/// Particles per backprojection chunk when reconstructing the polished set.
const RECONSTRUCTION_CHUNK: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PolishPass {
    /// Frames combined with the per-frame relative weights only.
    Pass0,
    /// Additionally filtered by the FSC weight of the first-pass reconstruction.
    Pass1,
}

impl fmt::Display for PolishPass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PolishPass::Pass0 => f.write_str("pass 0"),
            PolishPass::Pass1 => f.write_str("pass 1"),
        }
    }
}

/// A polished particle image together with the frames that went into it.
#[derive(Debug, Clone, PartialEq)]
pub struct ShinyParticle {
    pub particle: ParticleId,
    pub image: Array2<f64>,
    pub frames_used: Vec<usize>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PolishOutcome {
    Shiny(ShinyParticle),
    Dropped(PolishIssue),
}

/// Outcome of one particle together with the frames that had to be skipped for it.
#[derive(Debug, Clone, PartialEq)]
pub struct ParticleReport {
    pub outcome: PolishOutcome,
    pub skipped: Vec<PolishIssue>,
}

pub struct ParticlePolisher<'a> {
    ctx: PolishContext<'a>,
    weights: &'a RelativeWeights,
    fsc_weights: Option<Vec<f64>>,
    frames: Vec<usize>,
}

impl<'a> ParticlePolisher<'a> {
    pub fn new(ctx: PolishContext<'a>, weights: &'a RelativeWeights) -> Self {
        Self {
            ctx,
            weights,
            fsc_weights: None,
            frames: ctx.movie_frames(),
        }
    }

    /// Polisher for the second pass, filtering by the FSC of the first.
    pub fn second_pass(ctx: PolishContext<'a>, weights: &'a RelativeWeights, fsc: &FscCurve) -> Self {
        Self {
            fsc_weights: Some(fsc.weights()),
            ..Self::new(ctx, weights)
        }
    }

    pub fn pass(&self) -> PolishPass {
        if self.fsc_weights.is_some() {
            PolishPass::Pass1
        } else {
            PolishPass::Pass0
        }
    }

    fn frame_weight(&self, frame: usize, shell: usize) -> f64 {
        if self.ctx.config.bfactor.do_weighting {
            self.weights.weight(frame, shell).unwrap_or(0.0)
        } else {
            1.0
        }
    }

    /// Combines the particle's frames of the analysis window.
    ///
    /// Frames that cannot be read or fail validation are left out and listed in
    /// [`ParticleReport::skipped`]; a particle left without any frame is dropped.
    pub fn polish(&self, particle: &Particle) -> Result<ParticleReport, EngineError> {
        let config = self.ctx.config;
        let shells = &self.ctx.shells;
        let n = self.ctx.box_size();
        let flip = config.phase_flip_shiny && !config.ctf.ctf_phase_flipped;
        let ctf = self.ctx.ctf_model(particle);

        let mut sum = Array2::<Complex64>::zeros((n, n));
        let mut weight_sum = vec![0.0; shells.count()];
        let mut frames_used = Vec::new();
        let mut skipped = Vec::new();

        for &frame in &self.frames {
            let Some(offset) = particle.fitted_offset(frame) else {
                continue;
            };
            let mut spectrum = match self.ctx.frame_spectrum(particle, frame) {
                Ok(Some(spectrum)) => spectrum,
                Ok(None) => continue,
                Err(e) => {
                    debug!(particle = %particle.name, frame, "Frame skipped: {e}");
                    skipped.push(PolishIssue::UnreadableFrame {
                        particle: particle.id,
                        frame,
                        reason: e.to_string(),
                    });
                    continue;
                }
            };
            shift_spectrum(&mut spectrum, -offset);

            for (shell, total) in weight_sum.iter_mut().enumerate() {
                *total += self.frame_weight(frame, shell);
            }
            for px in shells.pixels_2d() {
                let mut w = self.frame_weight(frame, shells.clamped_shell(px.radius));
                if flip {
                    w *= ctf.phase_flip_sign(px.sx, px.sy, config.ctf.intact_ctf_first_peak);
                }
                sum[[px.row, px.col]] += spectrum[[px.row, px.col]] * w;
            }
            frames_used.push(frame);
        }

        if frames_used.is_empty() {
            let reason = match skipped.last() {
                Some(PolishIssue::UnreadableFrame { reason, .. }) => reason.clone(),
                _ => "no frame of the window has both an image and a fitted offset".to_string(),
            };
            return Ok(ParticleReport {
                outcome: PolishOutcome::Dropped(PolishIssue::NoUsableFrames {
                    particle: particle.id,
                    reason,
                }),
                skipped,
            });
        }

        for px in shells.pixels_2d() {
            let shell = shells.clamped_shell(px.radius);
            let total = weight_sum[shell];
            let mut value = if total > 0.0 {
                sum[[px.row, px.col]] / total
            } else {
                Complex64::default()
            };
            if let Some(fsc) = &self.fsc_weights {
                value *= fsc.get(shell).copied().unwrap_or(0.0);
            }
            sum[[px.row, px.col]] = value;
        }

        let mut image = self.ctx.fft.inverse_2d(&sum);
        if config.normalisation.do_normalise {
            normalise(&mut image, &config.normalisation.settings(n))?;
        }
        Ok(ParticleReport {
            outcome: PolishOutcome::Shiny(ShinyParticle {
                particle: particle.id,
                image,
                frames_used,
            }),
            skipped,
        })
    }

    fn polish_micrograph(&self, micrograph: MicrographId) -> Result<Vec<ParticleReport>, EngineError> {
        self.ctx
            .experiment
            .particles_in(micrograph)
            .map(|particle| self.polish(particle))
            .collect()
    }

    /// Polishes every micrograph in parallel; outcomes keep the experiment's particle order.
    pub fn polish_all(&self) -> Result<Vec<ParticleReport>, EngineError> {
        let micrographs: Vec<MicrographId> = self.ctx.experiment.micrographs().iter().map(|m| m.id).collect();
        self.ctx.reporter.report(Progress::TaskStart {
            total_steps: micrographs.len() as u64,
        });

        #[cfg(not(feature = "parallel"))]
        let iterator = micrographs.iter();

        #[cfg(feature = "parallel")]
        let iterator = micrographs.par_iter();

        let results: Vec<Result<Vec<ParticleReport>, EngineError>> = iterator
            .map(|&mic| {
                let outcomes = self.polish_micrograph(mic);
                self.ctx.reporter.report(Progress::TaskIncrement);
                outcomes
            })
            .collect();
        self.ctx.reporter.report(Progress::TaskFinish);

        let mut all = Vec::with_capacity(self.ctx.experiment.particle_count());
        for result in results {
            all.extend(result?);
        }
        Ok(all)
    }
}

/// Polished particles of one pass plus the ones that had to be dropped.
#[derive(Debug, Clone)]
pub struct PolishedSet {
    pub pass: PolishPass,
    pub shiny: Vec<ShinyParticle>,
    pub dropped: Vec<ParticleId>,
    pub issues: IssueLog,
}

#[instrument(skip_all, name = "polish_task")]
pub fn run(polisher: &ParticlePolisher<'_>) -> Result<PolishedSet, EngineError> {
    let pass = polisher.pass();
    info!(%pass, "Polishing particles.");
    let mut set = PolishedSet {
        pass,
        shiny: Vec::new(),
        dropped: Vec::new(),
        issues: IssueLog::new(),
    };
    for report in polisher.polish_all()? {
        for issue in report.skipped {
            set.issues.record(issue);
        }
        match report.outcome {
            PolishOutcome::Shiny(shiny) => set.shiny.push(shiny),
            PolishOutcome::Dropped(issue) => {
                if let PolishIssue::NoUsableFrames { particle, .. } = &issue {
                    set.dropped.push(*particle);
                }
                set.issues.record(issue);
            }
        }
    }
    info!(%pass, shiny = set.shiny.len(), dropped = set.dropped.len(), "Polishing finished.");
    Ok(set)
}

/// Two-half reconstruction of a polished set.
#[derive(Debug, Clone)]
pub struct ShinyReconstruction {
    pub pass: PolishPass,
    pub halves: [Array3<Complex64>; 2],
    pub fsc: FscCurve,
    /// `sqrt(2·FSC / (1 + FSC))` per shell.
    pub weights: Vec<f64>,
    /// Å, at the 0.143 crossing.
    pub achieved_resolution: f64,
}

fn backproject_chunk(ctx: &PolishContext<'_>, chunk: &[(&Particle, &ShinyParticle)]) -> Backprojector {
    let n = ctx.box_size();
    let correction = ctx.shiny_ctf_correction();
    let mut backprojector = Backprojector::new(n, (n / 2) as f64);
    for (particle, shiny) in chunk {
        let mut spectrum = ctx.fft.forward_2d(&shiny.image);
        shift_spectrum(&mut spectrum, -particle.origin);
        let weights = weight_for_backprojection(&mut spectrum, &ctx.ctf_model(particle), &correction, &ctx.shells);
        backprojector.accumulate(&spectrum, &weights, &particle.orientation.rotation());
    }
    backprojector
}

fn reconstruct_half(
    ctx: &PolishContext<'_>,
    shiny: &[ShinyParticle],
    half: HalfSet,
) -> Result<Array3<Complex64>, EngineError> {
    let members = shiny
        .iter()
        .filter_map(|s| ctx.experiment.particle(s.particle).map(|p| (p, s)))
        .filter(|(p, _)| p.half == half)
        .collect::<Vec<_>>();
    let chunks: Vec<&[(&Particle, &ShinyParticle)]> = members.chunks(RECONSTRUCTION_CHUNK).collect();

    #[cfg(not(feature = "parallel"))]
    let iterator = chunks.iter();

    #[cfg(feature = "parallel")]
    let iterator = chunks.par_iter();

    let partials: Vec<Backprojector> = iterator.map(|chunk| backproject_chunk(ctx, chunk)).collect();

    let n = ctx.box_size();
    let mut total = Backprojector::new(n, (n / 2) as f64);
    for partial in &partials {
        total.merge(partial);
    }
    debug!(half = %half, images = total.image_count(), chunks = partials.len(), "Polished half reconstructed.");
    Ok(total.finalize())
}

/// Reconstructs both halves of the polished set and derives the FSC weighting curve.
#[instrument(skip_all, name = "shiny_reconstruction_task")]
pub fn reconstruct_shiny_particles_and_fsc_weight(
    ctx: PolishContext<'_>,
    shiny: &[ShinyParticle],
    pass: PolishPass,
) -> Result<ShinyReconstruction, EngineError> {
    let halves = [
        reconstruct_half(&ctx, shiny, HalfSet::One)?,
        reconstruct_half(&ctx, shiny, HalfSet::Two)?,
    ];
    let fsc = FscCurve::between(&halves[0], &halves[1]);
    let achieved_resolution = fsc.resolution(&ctx.shells, FSC_THRESHOLD);
    info!(%pass, resolution = achieved_resolution, "Polished set reconstructed.");
    Ok(ShinyReconstruction {
        pass,
        weights: fsc.weights(),
        halves,
        fsc,
        achieved_resolution,
    })
}
