//! Smoothing of noisy per-frame particle positions into physically plausible trajectories.

use crate::core::fitting::{FitPoint, fit_straight_line};
use crate::core::models::experiment::Experiment;
use crate::core::models::ids::{MicrographId, ParticleId};
use crate::core::models::particle::TrajectorySample;
use crate::engine::config::{FitMode, MovementConfig};
use crate::engine::error::{EngineError, IssueLog, PolishIssue};
use crate::engine::progress::{Progress, ProgressReporter};
use thiserror::Error;
use tracing::{debug, info, instrument};

#[cfg(feature = "parallel")]
use rayon::prelude::*;

/// Neighbours weighing less than this are left out of a particle's regression.
const MIN_NEIGHBOUR_WEIGHT: f64 = 1e-4;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum FitError {
    #[error("{usable} usable motion samples, at least 2 are required")]
    InsufficientData { usable: usize },
}

/// Fitted trajectories and issues of one micrograph.
#[derive(Debug, Clone, Default)]
pub struct MicrographFit {
    pub fitted: Vec<(ParticleId, Vec<TrajectorySample>)>,
    pub issues: Vec<PolishIssue>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MovementFitter {
    mode: FitMode,
    excluded_edge_frames: usize,
    sigma_neighbour_distance: f64,
}

impl MovementFitter {
    pub fn new(config: &MovementConfig) -> Self {
        Self {
            mode: config.fit_mode,
            excluded_edge_frames: config.excluded_edge_frames(),
            sigma_neighbour_distance: config.sigma_neighbour_distance,
        }
    }

    pub fn mode(&self) -> FitMode {
        self.mode
    }

    fn abscissa(&self, frame: usize) -> f64 {
        let t = frame as f64 + 1.0;
        match self.mode {
            FitMode::Logarithmic => t.ln(),
            FitMode::Sqrt => t.sqrt(),
            FitMode::Linear | FitMode::NoFit => t,
        }
    }

    /// Samples that take part in the regression, edges excluded.
    fn regression_window<'s>(&self, samples: &'s [TrajectorySample]) -> &'s [TrajectorySample] {
        let k = self.excluded_edge_frames;
        if samples.len() <= 2 * k {
            &[]
        } else {
            &samples[k..samples.len() - k]
        }
    }

    fn push_points(&self, samples: &[TrajectorySample], weight: f64, xs: &mut Vec<FitPoint>, ys: &mut Vec<FitPoint>) {
        for s in self.regression_window(samples) {
            let t = self.abscissa(s.frame);
            xs.push(FitPoint::weighted(t, s.offset.x, weight));
            ys.push(FitPoint::weighted(t, s.offset.y, weight));
        }
    }

    /// Fits one particle's samples (sorted by frame).
    ///
    /// Every input sample receives a fitted value, including the excluded edge samples,
    /// whose values are extrapolated from the fitted line.
    pub fn fit(&self, samples: &[TrajectorySample]) -> Result<Vec<TrajectorySample>, FitError> {
        self.fit_weighted(samples, &[])
    }

    /// Like [`fit`](Self::fit), with neighbouring trajectories contributing to the
    /// regression at the given weights (own samples weigh 1).
    pub fn fit_weighted(
        &self,
        samples: &[TrajectorySample],
        neighbours: &[(&[TrajectorySample], f64)],
    ) -> Result<Vec<TrajectorySample>, FitError> {
        if self.mode == FitMode::NoFit {
            return Ok(samples.to_vec());
        }
        let usable = self.regression_window(samples).len();
        if usable < 2 {
            return Err(FitError::InsufficientData { usable });
        }

        let (mut xs, mut ys) = (Vec::new(), Vec::new());
        self.push_points(samples, 1.0, &mut xs, &mut ys);
        for (other, weight) in neighbours {
            self.push_points(other, *weight, &mut xs, &mut ys);
        }

        let fit_x = fit_straight_line(&xs).map_err(|_| FitError::InsufficientData { usable })?;
        let fit_y = fit_straight_line(&ys).map_err(|_| FitError::InsufficientData { usable })?;
        Ok(samples
            .iter()
            .map(|s| {
                let t = self.abscissa(s.frame);
                TrajectorySample::new(s.frame, fit_x.at(t), fit_y.at(t))
            })
            .collect())
    }

    /// Fits every particle of one micrograph. Particles that cannot be fitted keep their
    /// raw estimates and an `InsufficientData` issue is recorded.
    pub fn fit_micrograph(&self, experiment: &Experiment, micrograph: MicrographId) -> MicrographFit {
        let particles: Vec<_> = experiment.particles_in(micrograph).collect();
        let two_sigma_sq = 2.0 * self.sigma_neighbour_distance * self.sigma_neighbour_distance;
        let mut result = MicrographFit::default();

        for particle in &particles {
            let neighbours: Vec<(&[TrajectorySample], f64)> = if two_sigma_sq > 0.0 {
                particles
                    .iter()
                    .filter(|other| other.id != particle.id)
                    .map(|other| {
                        let d2 = (other.coordinates - particle.coordinates).norm_squared();
                        (other.offsets(), (-d2 / two_sigma_sq).exp())
                    })
                    .filter(|(_, w)| *w >= MIN_NEIGHBOUR_WEIGHT)
                    .collect()
            } else {
                Vec::new()
            };

            match self.fit_weighted(particle.offsets(), &neighbours) {
                Ok(fitted) => result.fitted.push((particle.id, fitted)),
                Err(FitError::InsufficientData { usable }) => {
                    debug!(particle = %particle.name, usable, "Too few samples, keeping raw trajectory.");
                    result.fitted.push((particle.id, particle.offsets().to_vec()));
                    result.issues.push(PolishIssue::InsufficientData {
                        particle: particle.id,
                        usable,
                    });
                }
            }
        }
        result
    }
}

/// Fits all micrographs in parallel and commits the trajectories to the experiment.
#[instrument(skip_all, name = "movement_task")]
pub fn run(
    experiment: &mut Experiment,
    config: &MovementConfig,
    reporter: &ProgressReporter,
) -> Result<IssueLog, EngineError> {
    let fitter = MovementFitter::new(config);
    info!(mode = %fitter.mode(), micrographs = experiment.micrograph_count(), "Fitting particle movements.");

    let micrographs: Vec<MicrographId> = experiment.micrographs().iter().map(|m| m.id).collect();
    reporter.report(Progress::TaskStart {
        total_steps: micrographs.len() as u64,
    });

    let shared: &Experiment = experiment;

    #[cfg(not(feature = "parallel"))]
    let iterator = micrographs.iter();

    #[cfg(feature = "parallel")]
    let iterator = micrographs.par_iter();

    let results: Vec<MicrographFit> = iterator
        .map(|&mic| {
            let fit = fitter.fit_micrograph(shared, mic);
            reporter.report(Progress::TaskIncrement);
            fit
        })
        .collect();
    reporter.report(Progress::TaskFinish);

    let mut issues = IssueLog::new();
    for fit in results {
        for (particle, trajectory) in fit.fitted {
            if !experiment.set_fitted_trajectory(particle, trajectory) {
                return Err(EngineError::Internal(format!(
                    "fitted trajectory of particle {particle} does not match its frames"
                )));
            }
        }
        for issue in fit.issues {
            issues.record(issue);
        }
    }

    info!(unfitted = issues.len(), "Movement fitting finished.");
    Ok(issues)
}
