use crate::core::fitting::{BFactorFit, RelativeWeights};
use crate::core::fourier::RustFftTransformer;
use crate::core::io::frames::FrameSource;
use crate::core::models::experiment::Experiment;
use crate::core::models::ids::{HalfSet, ParticleId};
use crate::core::reconstruction::FscCurve;
use crate::engine::cache::{ReconstructionCache, ReconstructionStore};
use crate::engine::config::{ConfigError, PolishConfig};
use crate::engine::context::PolishContext;
use crate::engine::error::{EngineError, IssueCounts, IssueLog, PolishIssue};
use crate::engine::grouping::{GroupAssignment, MicrographGrouping};
use crate::engine::progress::{Progress, ProgressReporter};
use crate::engine::tasks::beamtilt::{BeamTiltDefocusOptimizer, OptimisationReport, ReferenceHalves};
use crate::engine::tasks::frame_reconstruction::{self, FrameWeighting};
use crate::engine::tasks::polish::{
    self, ParticlePolisher, PolishPass, PolishedSet, ShinyParticle, ShinyReconstruction,
    reconstruct_shiny_particles_and_fsc_weight,
};
use crate::engine::tasks::movement;
use ndarray::Array3;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use tracing::{debug, info, instrument, warn};

#[derive(Debug, Clone, PartialEq)]
pub struct ExcludedParticle {
    pub particle: ParticleId,
    pub reason: String,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RunSummary {
    pub particles_in: usize,
    pub shiny_out: usize,
    pub excluded: usize,
    pub reconstructions_computed: usize,
    pub reconstructions_cached: usize,
    pub counts: IssueCounts,
    pub final_pass: PolishPass,
}

/// Per-frame weighting of a dataset, without polishing.
#[derive(Debug, Clone)]
pub struct FrameWeightsResult {
    pub box_size: usize,
    pub frame_bfactors: Vec<(usize, BFactorFit)>,
    pub relative_weights: RelativeWeights,
    pub average_fsc: Option<FscCurve>,
    /// Real-space weighted averages of the single-frame reconstructions, half 1 then half 2.
    pub average_half_maps: Option<[Array3<f64>; 2]>,
    pub issues: IssueLog,
    pub reconstructions_computed: usize,
    pub reconstructions_cached: usize,
}

#[derive(Debug, Clone)]
pub struct PolishResult {
    pub box_size: usize,
    pub shiny: Vec<ShinyParticle>,
    pub excluded: Vec<ExcludedParticle>,
    pub frame_bfactors: Vec<(usize, BFactorFit)>,
    pub relative_weights: RelativeWeights,
    pub average_fsc: Option<FscCurve>,
    pub average_half_maps: Option<[Array3<f64>; 2]>,
    pub shiny_reconstruction: ShinyReconstruction,
    pub optimisation: Option<OptimisationReport>,
    pub issues: IssueLog,
    pub summary: RunSummary,
}

/// Box size of the first readable frame in the dataset.
fn detect_box_size(experiment: &Experiment, frames: &dyn FrameSource) -> Result<usize, EngineError> {
    for particle in experiment.particles() {
        for frame in 0..particle.frame_span() {
            let image = match frames.read_frame(particle, frame) {
                Ok(image) => image,
                Err(e) => {
                    debug!(particle = %particle.name, frame, "Not usable for the box size: {e}");
                    continue;
                }
            };
            if let Some(image) = image {
                let (rows, cols) = image.dim();
                if rows != cols {
                    return Err(ConfigError::InvalidParameter {
                        name: "box-size",
                        reason: format!("particle images must be square, found {rows}x{cols}"),
                    }
                    .into());
                }
                return Ok(rows);
            }
        }
    }
    Err(EngineError::PhaseFailed {
        phase: "Preparation",
        reason: "no particle has a readable movie frame".to_string(),
    })
}

/// Hash of the configuration and of every particle property single-frame reconstructions
/// depend on. Cached reconstructions with another fingerprint are recomputed.
fn reconstruction_fingerprint(experiment: &Experiment, config: &PolishConfig, box_size: usize) -> u64 {
    let mut hasher = DefaultHasher::new();
    config.reconstruction_fingerprint(box_size).hash(&mut hasher);
    for particle in experiment.particles() {
        particle.name.hash(&mut hasher);
        particle.half.hash(&mut hasher);
        let o = &particle.orientation;
        let c = &particle.ctf;
        for value in [
            particle.origin.x,
            particle.origin.y,
            o.rot,
            o.tilt,
            o.psi,
            c.defocus_u,
            c.defocus_v,
            c.defocus_angle,
            c.phase_shift,
            c.beam_tilt.x,
            c.beam_tilt.y,
        ] {
            value.to_bits().hash(&mut hasher);
        }
        for sample in particle.fitted_trajectory() {
            sample.frame.hash(&mut hasher);
            sample.offset.x.to_bits().hash(&mut hasher);
            sample.offset.y.to_bits().hash(&mut hasher);
        }
    }
    hasher.finish()
}

/// Validates the run against the data and fits particle movements.
fn prepare(
    experiment: &mut Experiment,
    frames: &dyn FrameSource,
    config: &PolishConfig,
    reporter: &ProgressReporter,
) -> Result<(usize, IssueLog), EngineError> {
    config.validate()?;
    let box_size = reporter.phase("Preparation", || detect_box_size(experiment, frames))?;
    config.validate_for_box(box_size)?;
    info!(
        particles = experiment.particle_count(),
        micrographs = experiment.micrograph_count(),
        movie_frames = experiment.movie_frame_count(),
        box_size,
        "Dataset loaded."
    );
    let issues = reporter.phase("Fitting Movements", || {
        movement::run(experiment, &config.movement, reporter).inspect(|issues| surface_issues(issues, reporter))
    })?;
    Ok((box_size, issues))
}

fn frame_weighting(
    ctx: PolishContext<'_>,
    cache: &ReconstructionCache<'_>,
) -> Result<(FrameWeighting, Option<[Array3<f64>; 2]>), EngineError> {
    let weighting = ctx
        .reporter
        .phase("Frame Reconstructions", || {
            frame_reconstruction::run(ctx, cache).inspect(|w| surface_issues(&w.issues, ctx.reporter))
        })?;
    let maps = weighting
        .average
        .as_ref()
        .map(|avg| [ctx.fft.inverse_3d(&avg.halves[0]), ctx.fft.inverse_3d(&avg.halves[1])]);
    Ok((weighting, maps))
}

fn surface_issues(issues: &IssueLog, reporter: &ProgressReporter) {
    for issue in issues.iter() {
        reporter.report(Progress::Issue(issue.clone()));
    }
}

/// Estimates per-frame B-factors and relative weights only.
#[instrument(skip_all, name = "frame_weights_workflow")]
pub fn estimate_frame_weights(
    experiment: &mut Experiment,
    frames: &dyn FrameSource,
    config: &PolishConfig,
    store: &dyn ReconstructionStore,
    reporter: &ProgressReporter,
) -> Result<FrameWeightsResult, EngineError> {
    let (box_size, mut issues) = prepare(experiment, frames, config, reporter)?;
    let fft = RustFftTransformer::new(box_size);
    let cache = ReconstructionCache::new(store, reconstruction_fingerprint(experiment, config, box_size));
    if config.do_start_all_over {
        cache.invalidate_all()?;
    }

    let ctx = PolishContext::new(experiment, frames, config, &fft, reporter);
    let (weighting, average_half_maps) = frame_weighting(ctx, &cache)?;
    issues.extend(weighting.issues);
    Ok(FrameWeightsResult {
        box_size,
        frame_bfactors: weighting.fits,
        relative_weights: weighting.weights,
        average_fsc: weighting.average.map(|a| a.fsc),
        average_half_maps,
        issues,
        reconstructions_computed: cache.computed(),
        reconstructions_cached: cache.hits(),
    })
}

fn polish_pass(ctx: PolishContext<'_>, polisher: &ParticlePolisher<'_>) -> Result<(PolishedSet, ShinyReconstruction), EngineError> {
    let (polishing, reconstructing) = match polisher.pass() {
        PolishPass::Pass0 => ("Polishing (pass 0)", "Reconstructing Shiny Set (pass 0)"),
        PolishPass::Pass1 => ("Polishing (pass 1)", "Reconstructing Shiny Set (pass 1)"),
    };
    let set = ctx.reporter.phase(polishing, || {
        polish::run(polisher).inspect(|set| surface_issues(&set.issues, ctx.reporter))
    })?;
    let reconstruction = ctx.reporter.phase(reconstructing, || {
        reconstruct_shiny_particles_and_fsc_weight(ctx, &set.shiny, set.pass)
    })?;
    Ok((set, reconstruction))
}

fn optimise(
    ctx: PolishContext<'_>,
    grouping: &dyn MicrographGrouping,
    shiny: &[ShinyParticle],
    reconstruction: &ShinyReconstruction,
) -> Result<OptimisationReport, EngineError> {
    for half in HalfSet::BOTH {
        let present = shiny
            .iter()
            .filter_map(|s| ctx.experiment.particle(s.particle))
            .any(|p| p.half == half);
        if !present {
            return Err(ConfigError::MissingReference(format!("{half} has no polished particles")).into());
        }
    }
    let references = ReferenceHalves::from_shiny(reconstruction, &ctx.shells);
    let groups = GroupAssignment::build(ctx.experiment, grouping);
    let maxres = ctx
        .config
        .optimisation
        .maxres_model
        .unwrap_or(reconstruction.achieved_resolution);
    let mut optimizer = BeamTiltDefocusOptimizer::new(ctx, &references, &groups, shiny, maxres);
    Ok(ctx.reporter.phase("Optimising Beam Tilt and Defocus", || {
        let report = optimizer.optimise();
        surface_issues(&report.issues, ctx.reporter);
        report
    }))
}

/// Runs the complete polishing pipeline on `experiment`.
///
/// Fitted trajectories and optimised optics are written back into the experiment; every
/// other product is returned in the [`PolishResult`].
#[instrument(skip_all, name = "polish_workflow")]
pub fn run(
    experiment: &mut Experiment,
    frames: &dyn FrameSource,
    config: &PolishConfig,
    store: &dyn ReconstructionStore,
    grouping: &dyn MicrographGrouping,
    reporter: &ProgressReporter,
) -> Result<PolishResult, EngineError> {
    // === Phase 0: Validation and movement fitting ===
    let (box_size, mut issues) = prepare(experiment, frames, config, reporter)?;
    let fft = RustFftTransformer::new(box_size);
    let cache = ReconstructionCache::new(store, reconstruction_fingerprint(experiment, config, box_size));
    if config.do_start_all_over {
        info!("Discarding cached frame reconstructions.");
        cache.invalidate_all()?;
    }

    // === Phases 1-3: Frame weighting, first polishing pass, optimisation ===
    let (weighting, average_half_maps, pass0, reconstruction0, optimisation) = {
        let ctx = PolishContext::new(experiment, frames, config, &fft, reporter);
        let (weighting, maps) = frame_weighting(ctx, &cache)?;
        let polisher = ParticlePolisher::new(ctx, &weighting.weights);
        let (pass0, reconstruction0) = polish_pass(ctx, &polisher)?;
        let optimisation = if config.optimisation.enabled() {
            Some(optimise(ctx, grouping, &pass0.shiny, &reconstruction0)?)
        } else {
            None
        };
        (weighting, maps, pass0, reconstruction0, optimisation)
    };
    issues.extend(weighting.issues.clone());
    issues.extend(pass0.issues.clone());

    if let Some(report) = &optimisation {
        report.apply_optimised_beam_tilts_and_defocus(experiment)?;
        issues.extend(report.issues.clone());
    }

    // === Phase 4: Optional second pass with the first-pass FSC weight ===
    let (final_set, final_reconstruction) = if config.do_second_pass {
        let ctx = PolishContext::new(experiment, frames, config, &fft, reporter);
        let polisher = ParticlePolisher::second_pass(ctx, &weighting.weights, &reconstruction0.fsc);
        polish_pass(ctx, &polisher)?
    } else {
        (pass0, reconstruction0)
    };

    let excluded: Vec<ExcludedParticle> = issues
        .iter()
        .filter_map(|issue| match issue {
            PolishIssue::NoUsableFrames { particle, .. } => Some(ExcludedParticle {
                particle: *particle,
                reason: issue.to_string(),
            }),
            _ => None,
        })
        .collect();

    let summary = RunSummary {
        particles_in: experiment.particle_count(),
        shiny_out: final_set.shiny.len(),
        excluded: excluded.len(),
        reconstructions_computed: cache.computed(),
        reconstructions_cached: cache.hits(),
        counts: issues.counts(),
        final_pass: final_set.pass,
    };
    if summary.counts.total() > 0 {
        warn!(issues = summary.counts.total(), "Run finished with recoverable issues.");
    }
    info!(
        shiny = summary.shiny_out,
        excluded = summary.excluded,
        resolution = final_reconstruction.achieved_resolution,
        "Polishing workflow complete."
    );

    Ok(PolishResult {
        box_size,
        shiny: final_set.shiny,
        excluded,
        frame_bfactors: weighting.fits,
        relative_weights: weighting.weights,
        average_fsc: weighting.average.map(|a| a.fsc),
        average_half_maps,
        shiny_reconstruction: final_reconstruction,
        optimisation,
        issues,
        summary,
    })
}
