//! Single-frame reconstructions, their FSC and the Guinier B-factor of every frame.

use crate::core::fitting::{BFactorFit, FitStatus, RelativeWeights, fit_guinier};
use crate::core::fourier::shift_spectrum;
use crate::core::io::mrc;
use crate::core::models::ids::HalfSet;
use crate::core::models::particle::Particle;
use crate::core::reconstruction::{Backprojector, FSC_THRESHOLD, FscCurve, weight_for_backprojection};
use crate::engine::cache::{FrameHalfKey, ReconstructionCache};
use crate::engine::config::{BfactorConfig, ConfigError};
use crate::engine::context::PolishContext;
use crate::engine::error::{EngineError, IssueLog, PolishIssue};
use crate::engine::progress::Progress;
use ndarray::{Array2, Array3};
use num_complex::Complex64;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Mutex;
use tracing::{debug, info, instrument};

#[cfg(feature = "parallel")]
use rayon::prelude::*;

/// Both half reconstructions of one frame and their FSC.
#[derive(Debug, Clone)]
pub struct FrameReconstruction {
    pub frame: usize,
    pub halves: [Array3<Complex64>; 2],
    pub fsc: FscCurve,
}

/// Weighted average of all single-frame reconstructions per half.
#[derive(Debug, Clone)]
pub struct AverageReconstruction {
    pub halves: [Array3<Complex64>; 2],
    pub fsc: FscCurve,
}

/// Everything the frame-weighting stage hands to the polisher.
#[derive(Debug, Clone)]
pub struct FrameWeighting {
    pub fits: Vec<(usize, BFactorFit)>,
    pub weights: RelativeWeights,
    pub average: Option<AverageReconstruction>,
    pub issues: IssueLog,
}

pub struct FrameReconstructionEstimator<'a> {
    ctx: PolishContext<'a>,
    cache: &'a ReconstructionCache<'a>,
    max_radius: f64,
    /// Particle frames left out of a reconstruction because they could not be read.
    skipped: Mutex<IssueLog>,
}

impl<'a> FrameReconstructionEstimator<'a> {
    pub fn new(ctx: PolishContext<'a>, cache: &'a ReconstructionCache<'a>) -> Self {
        let nyquist = (ctx.box_size() / 2).saturating_sub(1) as f64;
        let max_radius = ctx
            .shells
            .radius_for_resolution(ctx.config.bfactor.perframe_highres)
            .min(nyquist);
        Self {
            ctx,
            cache,
            max_radius,
            skipped: Mutex::new(IssueLog::new()),
        }
    }

    /// Fourier radius (pixels) of the single-frame reconstructions.
    pub fn max_radius(&self) -> f64 {
        self.max_radius
    }

    pub fn highres_shell(&self) -> usize {
        self.max_radius.floor() as usize
    }

    /// Spectrum of `frame`, averaged over the running-average window, with every
    /// contributing frame moved back by the particle's origin and fitted offset.
    ///
    /// Unreadable frames are left out of the average and recorded as skipped.
    pub fn aligned_spectrum(&self, particle: &Particle, frame: usize) -> Option<Array2<Complex64>> {
        let half_width = self.ctx.config.bfactor.frame_running_average / 2;
        let mut sum: Option<Array2<Complex64>> = None;
        let mut count = 0usize;
        for f in frame.saturating_sub(half_width)..=frame + half_width {
            let Some(offset) = particle.fitted_offset(f) else {
                continue;
            };
            let mut spectrum = match self.ctx.frame_spectrum(particle, f) {
                Ok(Some(spectrum)) => spectrum,
                Ok(None) => continue,
                Err(e) => {
                    self.skip(PolishIssue::UnreadableFrame {
                        particle: particle.id,
                        frame: f,
                        reason: e.to_string(),
                    });
                    continue;
                }
            };
            shift_spectrum(&mut spectrum, -(particle.origin + offset));
            match sum.as_mut() {
                Some(total) => *total += &spectrum,
                None => sum = Some(spectrum),
            }
            count += 1;
        }
        sum.map(|total| total.mapv(|v| v / count as f64))
    }

    fn skip(&self, issue: PolishIssue) {
        if let Ok(mut skipped) = self.skipped.lock() {
            skipped.record(issue);
        }
    }

    /// Takes the frames skipped so far.
    pub fn take_skipped(&self) -> IssueLog {
        self.skipped.lock().map(|mut s| std::mem::take(&mut *s)).unwrap_or_default()
    }

    fn compute(&self, frame: usize, half: HalfSet) -> Result<Array3<Complex64>, EngineError> {
        let mut backprojector = Backprojector::new(self.ctx.box_size(), self.max_radius);
        for particle in self.ctx.experiment.particles().iter().filter(|p| p.half == half) {
            let Some(mut spectrum) = self.aligned_spectrum(particle, frame) else {
                continue;
            };
            let weights = weight_for_backprojection(
                &mut spectrum,
                &self.ctx.ctf_model(particle),
                &self.ctx.config.ctf,
                &self.ctx.shells,
            );
            backprojector.accumulate(&spectrum, &weights, &particle.orientation.rotation());
        }
        debug!(frame, half = %half, images = backprojector.image_count(), "Frame reconstruction computed.");
        Ok(backprojector.finalize())
    }

    /// Reconstruction of one frame from one half set, served from the cache when possible.
    pub fn reconstruct(&self, frame: usize, half: HalfSet) -> Result<Array3<Complex64>, EngineError> {
        self.cache
            .get_or_compute(FrameHalfKey::new(frame, half), || self.compute(frame, half))
    }

    fn reconstruct_halves(
        &self,
        frame: usize,
    ) -> (Result<Array3<Complex64>, EngineError>, Result<Array3<Complex64>, EngineError>) {
        #[cfg(feature = "parallel")]
        {
            rayon::join(|| self.reconstruct(frame, HalfSet::One), || self.reconstruct(frame, HalfSet::Two))
        }
        #[cfg(not(feature = "parallel"))]
        {
            (self.reconstruct(frame, HalfSet::One), self.reconstruct(frame, HalfSet::Two))
        }
    }

    pub fn reconstruct_frame(&self, frame: usize) -> Result<FrameReconstruction, EngineError> {
        let (one, two) = self.reconstruct_halves(frame);
        let halves = [one?, two?];
        let fsc = FscCurve::between(&halves[0], &halves[1]);
        Ok(FrameReconstruction { frame, halves, fsc })
    }

    pub fn estimate_bfactor(&self, frame: usize, fsc: &FscCurve) -> Result<BFactorFit, PolishIssue> {
        let bfactor = &self.ctx.config.bfactor;
        fit_guinier(fsc, &self.ctx.shells, bfactor.fit_minres, self.highres_shell())
            .map_err(|_| PolishIssue::LowResolutionReconstruction { frame })
    }

    /// Reconstructs and fits every frame in parallel. Frames without a usable fit get
    /// the fallback of [`with_fallbacks`].
    pub fn calculate_all(&self, frames: &[usize]) -> Result<(Vec<(usize, BFactorFit)>, IssueLog), EngineError> {
        self.ctx.reporter.report(Progress::TaskStart {
            total_steps: frames.len() as u64,
        });

        #[cfg(not(feature = "parallel"))]
        let iterator = frames.iter();

        #[cfg(feature = "parallel")]
        let iterator = frames.par_iter();

        let results: Vec<Result<(usize, Result<BFactorFit, PolishIssue>), EngineError>> = iterator
            .map(|&frame| {
                let reconstruction = self.reconstruct_frame(frame)?;
                let fit = self.estimate_bfactor(frame, &reconstruction.fsc);
                self.ctx.reporter.report(Progress::TaskIncrement);
                Ok((frame, fit))
            })
            .collect();
        self.ctx.reporter.report(Progress::TaskFinish);

        let mut issues = self.take_skipped();
        let mut outcomes = Vec::with_capacity(results.len());
        for result in results {
            let (frame, fit) = result?;
            match fit {
                Ok(fit) => {
                    debug!(frame, bfactor = fit.bfactor, offset = fit.offset, "Frame B-factor fitted.");
                    outcomes.push((frame, Some(fit)));
                }
                Err(issue) => {
                    issues.record(issue);
                    outcomes.push((frame, None));
                }
            }
        }
        Ok((with_fallbacks(outcomes), issues))
    }

    /// Per-shell weighted average of the single-frame reconstructions of one half.
    pub fn calculate_average_all_single_frame_reconstructions(
        &self,
        half: HalfSet,
        weights: &RelativeWeights,
    ) -> Result<Array3<Complex64>, EngineError> {
        let n = self.ctx.box_size();
        let shell_of = self.ctx.shells.voxel_shells();
        let mut sum = Array3::<Complex64>::zeros((n, n, n));
        let mut weight_sum = vec![0.0; self.ctx.shells.count()];

        for &frame in weights.frames() {
            let volume = self.reconstruct(frame, half)?;
            let Some(row) = weights.row(frame) else {
                continue;
            };
            let last = row.len().saturating_sub(1);
            for (shell, total) in weight_sum.iter_mut().enumerate() {
                *total += row[shell.min(last)];
            }
            for ((index, value), &shell) in volume.indexed_iter().zip(shell_of.iter()) {
                sum[index] += *value * row[shell.min(last)];
            }
        }

        for (value, &shell) in sum.iter_mut().zip(shell_of.iter()) {
            let total = weight_sum[shell];
            *value = if total > 0.0 { *value / total } else { Complex64::default() };
        }
        Ok(sum)
    }

    /// FSC between the two averaged halves, masked in real space when a mask is configured.
    pub fn average_fsc(&self, one: &Array3<Complex64>, two: &Array3<Complex64>) -> Result<FscCurve, EngineError> {
        let Some(path) = &self.ctx.config.bfactor.mask else {
            return Ok(FscCurve::between(one, two));
        };
        if !path.exists() {
            return Err(ConfigError::MissingMask(path.clone()).into());
        }
        let mask = mrc::read_volume(path)?;
        let n = self.ctx.box_size();
        if mask.dim() != (n, n, n) {
            return Err(ConfigError::MaskSizeMismatch {
                expected: n,
                found: mask.dim(),
            }
            .into());
        }
        let fft = self.ctx.fft;
        let masked = |volume: &Array3<Complex64>| fft.forward_3d(&(fft.inverse_3d(volume) * &mask));
        Ok(FscCurve::between(&masked(one), &masked(two)))
    }
}

/// Replaces missing fits with the minimum B-factor and minimum offset among the fitted
/// frames (both zero when no frame could be fitted).
pub fn with_fallbacks(outcomes: Vec<(usize, Option<BFactorFit>)>) -> Vec<(usize, BFactorFit)> {
    let fitted = || outcomes.iter().filter_map(|(_, fit)| fit.filter(|f| f.status == FitStatus::Fitted));
    let min_bfactor = fitted().map(|f| f.bfactor).reduce(f64::min).unwrap_or(0.0);
    let min_offset = fitted().map(|f| f.offset).reduce(f64::min).unwrap_or(0.0);
    outcomes
        .iter()
        .map(|&(frame, fit)| (frame, fit.unwrap_or_else(|| BFactorFit::fallback(min_bfactor, min_offset))))
        .collect()
}

/// Key of the B-factor fits of `frames` on top of the reconstructions' own fingerprint.
pub fn bfactor_fingerprint(reconstruction_fingerprint: u64, frames: &[usize], bfactor: &BfactorConfig) -> u64 {
    let mut hasher = DefaultHasher::new();
    reconstruction_fingerprint.hash(&mut hasher);
    frames.hash(&mut hasher);
    bfactor.fit_minres.to_bits().hash(&mut hasher);
    hasher.finish()
}

/// Fits stored by an earlier run, if they cover exactly `frames`.
fn stored_fits(
    cache: &ReconstructionCache<'_>,
    key: u64,
    frames: &[usize],
) -> Result<Option<Vec<(usize, BFactorFit)>>, EngineError> {
    let stored = cache.load_bfactors(key)?;
    Ok(stored.filter(|fits| fits.iter().map(|(f, _)| *f).eq(frames.iter().copied())))
}

/// Per-frame B-factors, relative weights and averaged reconstructions.
///
/// With weighting disabled every frame of the window weighs the same and no frame is
/// reconstructed. Fits saved by an earlier run with the same settings are reused unless
/// the run starts all over.
#[instrument(skip_all, name = "frame_reconstruction_task")]
pub fn run(ctx: PolishContext<'_>, cache: &ReconstructionCache<'_>) -> Result<FrameWeighting, EngineError> {
    let frames = ctx.movie_frames();
    if !ctx.config.bfactor.do_weighting {
        info!(frames = frames.len(), "Frame weighting disabled, using uniform weights.");
        return Ok(FrameWeighting {
            fits: Vec::new(),
            weights: RelativeWeights::uniform(frames, ctx.shells.count()),
            average: None,
            issues: IssueLog::new(),
        });
    }

    let estimator = FrameReconstructionEstimator::new(ctx, cache);
    info!(
        frames = frames.len(),
        max_radius = estimator.max_radius(),
        "Reconstructing single frames."
    );
    let key = bfactor_fingerprint(cache.fingerprint(), &frames, &ctx.config.bfactor);
    let reused = if ctx.config.do_start_all_over {
        None
    } else {
        stored_fits(cache, key, &frames)?
    };
    let (fits, mut issues) = match reused {
        Some(fits) => {
            info!(frames = fits.len(), "Reusing stored frame B-factors.");
            let mut issues = IssueLog::new();
            for (frame, fit) in &fits {
                if fit.status == FitStatus::Fallback {
                    issues.record(PolishIssue::LowResolutionReconstruction { frame: *frame });
                }
            }
            (fits, issues)
        }
        None => {
            let (fits, issues) = estimator.calculate_all(&frames)?;
            cache.save_bfactors(key, &fits)?;
            (fits, issues)
        }
    };
    let weights = RelativeWeights::from_bfactors(&fits, &ctx.shells);

    let halves = [
        estimator.calculate_average_all_single_frame_reconstructions(HalfSet::One, &weights)?,
        estimator.calculate_average_all_single_frame_reconstructions(HalfSet::Two, &weights)?,
    ];
    let fsc = estimator.average_fsc(&halves[0], &halves[1])?;
    issues.extend(estimator.take_skipped());
    info!(
        resolution = fsc.resolution(&ctx.shells, FSC_THRESHOLD),
        "Averaged frame reconstructions."
    );

    Ok(FrameWeighting {
        fits,
        weights,
        average: Some(AverageReconstruction { halves, fsc }),
        issues,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ctf::CtfCorrection;
    use crate::core::fourier::RustFftTransformer;
    use crate::core::io::frames::InMemoryFrames;
    use crate::core::models::experiment::Experiment;
    use crate::core::models::particle::TrajectorySample;
    use crate::engine::cache::{MemoryStore, ReconstructionStore};
    use crate::engine::config::{BfactorConfig, PolishConfig, PolishConfigBuilder};
    use crate::engine::progress::ProgressReporter;

    const N: usize = 16;

    fn config(running_average: usize) -> PolishConfig {
        PolishConfigBuilder::new()
            .angpix(2.0)
            .ctf_correction(CtfCorrection {
                do_ctf: false,
                ..CtfCorrection::default()
            })
            .bfactor(BfactorConfig {
                frame_running_average: running_average,
                ..BfactorConfig::default()
            })
            .build()
            .unwrap()
    }

    fn experiment() -> (Experiment, InMemoryFrames) {
        let mut exp = Experiment::new();
        let mic = exp.add_micrograph("mic");
        let id = exp.add_particle(mic, "p", HalfSet::Two);
        exp.particle_mut(id)
            .unwrap()
            .set_offsets((0..3).map(|f| TrajectorySample::new(f, 0.0, 0.0)).collect());
        let mut frames = InMemoryFrames::new();
        frames.insert(id, (0..3).map(|k| Array2::from_elem((N, N), k as f64)).collect());
        (exp, frames)
    }

    #[test]
    fn running_average_covers_existing_neighbours_only() {
        let (exp, frames) = experiment();
        let config = config(3);
        let fft = RustFftTransformer::new(N);
        let reporter = ProgressReporter::new();
        let ctx = PolishContext::new(&exp, &frames, &config, &fft, &reporter);
        let store = MemoryStore::new();
        let cache = ReconstructionCache::new(&store, 1);
        let estimator = FrameReconstructionEstimator::new(ctx, &cache);

        let particle = &exp.particles()[0];
        let first = estimator.aligned_spectrum(particle, 0).unwrap();
        assert!((first[[0, 0]].re - 0.5 * (N * N) as f64).abs() < 1e-9);
        let middle = estimator.aligned_spectrum(particle, 1).unwrap();
        assert!((middle[[0, 0]].re - (N * N) as f64).abs() < 1e-9);
        assert!(estimator.aligned_spectrum(particle, 9).is_none());
        assert!(estimator.take_skipped().is_empty());
    }

    #[test]
    fn unreadable_frames_are_left_out_of_the_running_average() {
        let (exp, mut frames) = experiment();
        let id = exp.particles()[0].id;
        frames.frame_mut(id, 0).unwrap()[[1, 1]] = f64::NAN;
        let config = config(3);
        let fft = RustFftTransformer::new(N);
        let reporter = ProgressReporter::new();
        let ctx = PolishContext::new(&exp, &frames, &config, &fft, &reporter);
        let store = MemoryStore::new();
        let cache = ReconstructionCache::new(&store, 1);
        let estimator = FrameReconstructionEstimator::new(ctx, &cache);

        let particle = &exp.particles()[0];
        // Frames 1 and 2 remain, holding 1 and 2 everywhere.
        let middle = estimator.aligned_spectrum(particle, 1).unwrap();
        assert!((middle[[0, 0]].re - 1.5 * (N * N) as f64).abs() < 1e-9);
        assert!(estimator.aligned_spectrum(particle, 0).is_some());

        let recon = estimator.reconstruct_frame(0).unwrap();
        assert!(recon.halves[1][[0, 0, 0]].norm() > 0.0);
        let skipped = estimator.take_skipped();
        assert_eq!(skipped.len(), 1);
        assert!(matches!(
            skipped.iter().next(),
            Some(PolishIssue::UnreadableFrame { frame: 0, .. })
        ));
    }

    #[test]
    fn stored_fits_replace_the_frame_fits_on_restart() {
        let (exp, frames) = experiment();
        let config = config(1);
        let fft = RustFftTransformer::new(N);
        let reporter = ProgressReporter::new();
        let ctx = PolishContext::new(&exp, &frames, &config, &fft, &reporter);
        let store = MemoryStore::new();
        let cache = ReconstructionCache::new(&store, 5);
        let window = ctx.movie_frames();
        let stored: Vec<_> = window
            .iter()
            .map(|&f| {
                let fit = BFactorFit {
                    bfactor: -10.0 * f as f64,
                    offset: 0.0,
                    corr_coeff: 1.0,
                    status: FitStatus::Fitted,
                };
                (f, fit)
            })
            .collect();
        store
            .save_bfactors(bfactor_fingerprint(5, &window, &config.bfactor), &stored)
            .unwrap();

        let weighting = run(ctx, &cache).unwrap();
        assert_eq!(weighting.fits, stored);
        assert!(weighting.issues.is_empty());
        // Only the averages need reconstructions.
        assert_eq!(cache.computed(), 2 * window.len());
    }

    #[test]
    fn fits_for_another_window_are_recomputed_and_saved() {
        let (exp, frames) = experiment();
        let config = config(1);
        let fft = RustFftTransformer::new(N);
        let reporter = ProgressReporter::new();
        let ctx = PolishContext::new(&exp, &frames, &config, &fft, &reporter);
        let store = MemoryStore::new();
        let cache = ReconstructionCache::new(&store, 5);
        let window = ctx.movie_frames();
        let partial = vec![(0, BFactorFit::fallback(-1.0, 0.0))];
        store
            .save_bfactors(bfactor_fingerprint(5, &window, &config.bfactor), &partial)
            .unwrap();

        let weighting = run(ctx, &cache).unwrap();
        assert_eq!(weighting.fits.len(), window.len());
        let key = bfactor_fingerprint(5, &window, &config.bfactor);
        assert_eq!(store.load_bfactors(key).unwrap(), Some(weighting.fits.clone()));
    }

    #[test]
    fn halves_are_reconstructed_separately_and_cached() {
        let (exp, frames) = experiment();
        let config = config(1);
        let fft = RustFftTransformer::new(N);
        let reporter = ProgressReporter::new();
        let ctx = PolishContext::new(&exp, &frames, &config, &fft, &reporter);
        let store = MemoryStore::new();
        let cache = ReconstructionCache::new(&store, 7);
        let estimator = FrameReconstructionEstimator::new(ctx, &cache);

        let recon = estimator.reconstruct_frame(2).unwrap();
        assert!(recon.halves[0].iter().all(|v| v.norm() == 0.0));
        assert!(recon.halves[1][[0, 0, 0]].norm() > 0.0);
        assert_eq!(cache.computed(), 2);

        estimator.reconstruct(2, HalfSet::Two).unwrap();
        assert_eq!(cache.computed(), 2);
        assert_eq!(cache.hits(), 1);
    }

    #[test]
    fn uniform_weights_average_frames_equally() {
        let (exp, frames) = experiment();
        let config = config(1);
        let fft = RustFftTransformer::new(N);
        let reporter = ProgressReporter::new();
        let ctx = PolishContext::new(&exp, &frames, &config, &fft, &reporter);
        let store = MemoryStore::new();
        let cache = ReconstructionCache::new(&store, 3);
        for (frame, value) in [(0, 1.0), (1, 3.0)] {
            cache
                .get_or_compute(FrameHalfKey::new(frame, HalfSet::One), || {
                    Ok(Array3::from_elem((N, N, N), Complex64::new(value, -value)))
                })
                .unwrap();
        }
        let estimator = FrameReconstructionEstimator::new(ctx, &cache);
        let weights = RelativeWeights::uniform(vec![0, 1], ctx.shells.count());
        let average = estimator
            .calculate_average_all_single_frame_reconstructions(HalfSet::One, &weights)
            .unwrap();
        assert!(average.iter().all(|v| (v - Complex64::new(2.0, -2.0)).norm() < 1e-12));
        assert_eq!(cache.computed(), 2);
    }

    #[test]
    fn flat_fsc_fits_and_empty_fsc_is_low_resolution() {
        let (exp, frames) = experiment();
        let config = config(1);
        let fft = RustFftTransformer::new(N);
        let reporter = ProgressReporter::new();
        let ctx = PolishContext::new(&exp, &frames, &config, &fft, &reporter);
        let store = MemoryStore::new();
        let cache = ReconstructionCache::new(&store, 0);
        let estimator = FrameReconstructionEstimator::new(ctx, &cache);

        let flat = FscCurve::new(vec![1.0; ctx.shells.count()]);
        let fit = estimator.estimate_bfactor(0, &flat).unwrap();
        assert!(fit.bfactor.abs() < 1e-9);
        assert_eq!(fit.status, FitStatus::Fitted);

        let empty = FscCurve::new(vec![0.0; ctx.shells.count()]);
        assert_eq!(
            estimator.estimate_bfactor(4, &empty),
            Err(PolishIssue::LowResolutionReconstruction { frame: 4 })
        );
    }

    #[test]
    fn fallback_takes_minimum_bfactor_and_offset() {
        let fit = |b, o| BFactorFit {
            bfactor: b,
            offset: o,
            corr_coeff: 0.9,
            status: FitStatus::Fitted,
        };
        let out = with_fallbacks(vec![(0, Some(fit(-50.0, 0.2))), (1, None), (2, Some(fit(-20.0, -0.4)))]);
        assert_eq!(out[1].1, BFactorFit::fallback(-50.0, -0.4));
        assert_eq!(out[0].1, fit(-50.0, 0.2));

        let none = with_fallbacks(vec![(0, None)]);
        assert_eq!(none[0].1, BFactorFit::fallback(0.0, 0.0));
    }
}
