//! Grid search for per-group beam tilt and per-particle defocus shifts against reference
//! projections of the polished reconstruction.

use super::polish::{ShinyParticle, ShinyReconstruction};
use crate::core::ctf::CtfModel;
use crate::core::fourier::{ResolutionShells, shift_spectrum};
use crate::core::models::experiment::Experiment;
use crate::core::models::ids::{HalfSet, MicrographId, ParticleId};
use crate::core::models::particle::Particle;
use crate::core::reconstruction::project;
use crate::engine::context::PolishContext;
use crate::engine::error::{EngineError, IssueLog, PolishIssue};
use crate::engine::grouping::GroupAssignment;
use crate::engine::progress::Progress;
use nalgebra::Vector2;
use ndarray::Array3;
use num_complex::Complex64;
use std::collections::HashMap;
use std::f64::consts::{PI, TAU};
use tracing::{debug, info, instrument};

#[cfg(feature = "parallel")]
use rayon::prelude::*;

/// FSC-weighted half reconstructions that observed particles are compared against.
#[derive(Debug, Clone)]
pub struct ReferenceHalves {
    halves: [Array3<Complex64>; 2],
}

impl ReferenceHalves {
    pub fn new(one: Array3<Complex64>, two: Array3<Complex64>) -> Self {
        Self { halves: [one, two] }
    }

    /// Polished halves multiplied per shell by their FSC weight.
    pub fn from_shiny(reconstruction: &ShinyReconstruction, shells: &ResolutionShells) -> Self {
        let lookup = shells.voxel_shells();
        let weigh = |volume: &Array3<Complex64>| {
            let mut weighted = volume.clone();
            for (value, &shell) in weighted.iter_mut().zip(&lookup) {
                *value *= reconstruction.weights.get(shell).copied().unwrap_or(0.0);
            }
            weighted
        };
        Self::new(weigh(&reconstruction.halves[0]), weigh(&reconstruction.halves[1]))
    }

    pub fn get(&self, half: HalfSet) -> &Array3<Complex64> {
        &self.halves[half.index()]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupPhase {
    Init,
    GridSearch,
    Commit,
    Done,
}

/// Wraps a phase into `[-π, π)`.
fn wrap_phase(phase: f64) -> f64 {
    (phase + PI).rem_euclid(TAU) - PI
}

/// A Fourier pixel inside the scoring band.
#[derive(Debug, Clone, Copy)]
struct BandPixel {
    /// Observed value times the conjugate of the reference projection.
    cross: Complex64,
    sx: f64,
    sy: f64,
    tilt_gain: f64,
}

struct ParticleBand {
    particle: ParticleId,
    ctf: CtfModel,
    pixels: Vec<BandPixel>,
}

/// Per-micrograph slot filled by the two parallel maps.
#[derive(Debug, Clone)]
pub struct MicrographSearch {
    pub micrograph: MicrographId,
    pub group: usize,
    pub particles: usize,
    pub pixels: usize,
    /// Summed residual of every beam-tilt candidate, in grid order.
    pub tilt_scores: Vec<f64>,
    pub defocus_shifts: Vec<(ParticleId, f64)>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GroupOutcome {
    pub name: String,
    pub phase: GroupPhase,
    pub particles: usize,
    /// `None` when the beam-tilt search is off and particles keep their own tilt.
    pub beam_tilt: Option<Vector2<f64>>,
    pub score: f64,
    pub degenerate: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ParticleCommit {
    pub particle: ParticleId,
    pub beam_tilt: Option<Vector2<f64>>,
    pub defocus_shift: f64,
}

/// Result of an optimisation run, independent of the data it was computed from.
#[derive(Debug, Clone)]
pub struct OptimisationReport {
    pub groups: Vec<GroupOutcome>,
    pub commits: Vec<ParticleCommit>,
    pub issues: IssueLog,
}

impl OptimisationReport {
    /// Writes the chosen beam tilts and defocus shifts into the experiment. This is the
    /// only place optimisation results reach particle metadata.
    pub fn apply_optimised_beam_tilts_and_defocus(&self, experiment: &mut Experiment) -> Result<usize, EngineError> {
        for commit in &self.commits {
            if !experiment.commit_optics(commit.particle, commit.beam_tilt, commit.defocus_shift) {
                return Err(EngineError::Internal(format!(
                    "optimised particle {} is not part of the experiment",
                    commit.particle
                )));
            }
        }
        info!(particles = self.commits.len(), "Optimised optics committed.");
        Ok(self.commits.len())
    }

    pub fn group(&self, name: &str) -> Option<&GroupOutcome> {
        self.groups.iter().find(|g| g.name == name)
    }
}

/// Candidate order used to break ties toward the smallest magnitude.
fn by_magnitude<T>(candidates: &[T], magnitude: impl Fn(&T) -> f64) -> Vec<usize> {
    let mut order: Vec<usize> = (0..candidates.len()).collect();
    order.sort_by(|&a, &b| magnitude(&candidates[a]).total_cmp(&magnitude(&candidates[b])));
    order
}

/// Index of the lowest score, visiting candidates in `order` and keeping the first minimum.
fn best_candidate(scores: &[f64], order: &[usize]) -> usize {
    let mut best = order[0];
    for &i in &order[1..] {
        if scores[i] < scores[best] {
            best = i;
        }
    }
    best
}

pub struct BeamTiltDefocusOptimizer<'a> {
    ctx: PolishContext<'a>,
    references: &'a ReferenceHalves,
    groups: &'a GroupAssignment,
    shiny: HashMap<ParticleId, &'a ShinyParticle>,
    min_radius: f64,
    max_radius: f64,
    tilt_grid: Vec<Vector2<f64>>,
    tilt_order: Vec<usize>,
    defocus_grid: Vec<f64>,
    defocus_order: Vec<usize>,
    phases: Vec<GroupPhase>,
}

impl<'a> BeamTiltDefocusOptimizer<'a> {
    /// `maxres_model` (Å) bounds the scoring band at high resolution.
    pub fn new(
        ctx: PolishContext<'a>,
        references: &'a ReferenceHalves,
        groups: &'a GroupAssignment,
        shiny: &'a [ShinyParticle],
        maxres_model: f64,
    ) -> Self {
        let config = ctx.config;
        let options = &config.optimisation;
        let projection_limit = (ctx.box_size() / 2).saturating_sub(1) as f64;
        let tilt_grid = options.beam_tilt_grid();
        let defocus_grid = options.defocus_grid();
        Self {
            ctx,
            references,
            groups,
            shiny: shiny.iter().map(|s| (s.particle, s)).collect(),
            min_radius: ctx.shells.radius_for_resolution(options.minres_beamtilt),
            max_radius: ctx.shells.radius_for_resolution(maxres_model).min(projection_limit),
            tilt_order: by_magnitude(&tilt_grid, |t| t.norm()),
            tilt_grid,
            defocus_order: by_magnitude(&defocus_grid, |d| d.abs()),
            defocus_grid,
            phases: vec![GroupPhase::Init; groups.group_count()],
        }
    }

    pub fn phase(&self, group: usize) -> GroupPhase {
        self.phases[group]
    }

    fn observed_ctf(&self, ctf: &CtfModel, sx: f64, sy: f64) -> f64 {
        let correction = &self.ctx.config.ctf;
        if !correction.do_ctf {
            return 1.0;
        }
        let flipped = correction.ctf_phase_flipped || self.ctx.config.phase_flip_shiny;
        ctf.observed_value(sx, sy, flipped, correction.intact_ctf_first_peak)
    }

    fn particle_band(&self, particle: &Particle, shiny: &ShinyParticle) -> ParticleBand {
        let mut observed = self.ctx.fft.forward_2d(&shiny.image);
        shift_spectrum(&mut observed, -particle.origin);
        let reference = project(
            self.references.get(particle.half),
            &particle.orientation.rotation(),
            self.max_radius,
        );
        let ctf = self.ctx.ctf_model(particle);
        let pixels = self
            .ctx
            .shells
            .pixels_2d()
            .filter(|px| px.radius >= self.min_radius && px.radius <= self.max_radius)
            .filter_map(|px| {
                let cross = observed[[px.row, px.col]] * reference[[px.row, px.col]].conj();
                (cross.norm() > 0.0).then(|| BandPixel {
                    cross,
                    sx: px.sx,
                    sy: px.sy,
                    tilt_gain: ctf.beam_tilt_factor(px.sx, px.sy),
                })
            })
            .collect();
        ParticleBand {
            particle: particle.id,
            ctf,
            pixels,
        }
    }

    fn micrograph_bands(&self, micrograph: MicrographId) -> Vec<ParticleBand> {
        self.ctx
            .experiment
            .particles_in(micrograph)
            .filter_map(|p| self.shiny.get(&p.id).map(|s| self.particle_band(p, s)))
            .collect()
    }

    /// `Σ |Fobs|·|Fref| · Δφ²` of one particle for a defocus shift and beam tilt.
    fn residual(&self, band: &ParticleBand, defocus_shift: f64, beam_tilt: Vector2<f64>) -> f64 {
        let ctf = band.ctf.with_defocus_shift(defocus_shift);
        band.pixels
            .iter()
            .map(|px| {
                let z = px.cross * self.observed_ctf(&ctf, px.sx, px.sy);
                let tilt = px.tilt_gain * (px.sx * beam_tilt.x + px.sy * beam_tilt.y);
                let delta = wrap_phase(z.arg() - tilt);
                z.norm() * delta * delta
            })
            .sum()
    }

    /// Beam-tilt scores of every particle of one micrograph at zero defocus shift.
    fn search_tilts(&self, slot: &mut MicrographSearch) {
        let bands = self.micrograph_bands(slot.micrograph);
        slot.particles = bands.len();
        slot.pixels = bands.iter().map(|b| b.pixels.len()).sum();
        slot.tilt_scores = vec![0.0; self.tilt_grid.len()];
        for band in &bands {
            // Phase and weight at zero shift do not depend on the tilt candidate.
            let terms: Vec<(f64, f64, f64, f64)> = band
                .pixels
                .iter()
                .map(|px| {
                    let z = px.cross * self.observed_ctf(&band.ctf, px.sx, px.sy);
                    (z.norm(), z.arg(), px.tilt_gain * px.sx, px.tilt_gain * px.sy)
                })
                .collect();
            for (score, tilt) in slot.tilt_scores.iter_mut().zip(&self.tilt_grid) {
                *score += terms
                    .iter()
                    .map(|&(w, theta, a, b)| {
                        let delta = wrap_phase(theta - a * tilt.x - b * tilt.y);
                        w * delta * delta
                    })
                    .sum::<f64>();
            }
        }
    }

    /// Best defocus shift of every particle of one micrograph under its group's tilt.
    fn search_defocus(&self, slot: &mut MicrographSearch, beam_tilt: Option<Vector2<f64>>) {
        slot.defocus_shifts = self
            .micrograph_bands(slot.micrograph)
            .iter()
            .map(|band| {
                let tilt = beam_tilt.unwrap_or_else(|| band.ctf.beam_tilt());
                let scores: Vec<f64> = self
                    .defocus_grid
                    .iter()
                    .map(|&shift| self.residual(band, shift, tilt))
                    .collect();
                let best = best_candidate(&scores, &self.defocus_order);
                (band.particle, self.defocus_grid[best])
            })
            .collect();
    }

    fn map_micrographs<F>(&self, slots: &mut [MicrographSearch], work: F)
    where
        F: Fn(&mut MicrographSearch) + Send + Sync,
    {
        self.ctx.reporter.report(Progress::TaskStart {
            total_steps: slots.len() as u64,
        });

        #[cfg(not(feature = "parallel"))]
        let iterator = slots.iter_mut();

        #[cfg(feature = "parallel")]
        let iterator = slots.par_iter_mut();

        iterator.for_each(|slot| {
            work(slot);
            self.ctx.reporter.report(Progress::TaskIncrement);
        });
        self.ctx.reporter.report(Progress::TaskFinish);
    }

    /// Runs both grid searches and returns what should be committed.
    #[instrument(skip_all, name = "beamtilt_task")]
    pub fn optimise(&mut self) -> OptimisationReport {
        let config = self.ctx.config;
        let options = &config.optimisation;
        let tilt_enabled = options.beam_tilt_enabled();
        let defocus_enabled = options.defocus_enabled();
        info!(
            groups = self.groups.group_count(),
            tilts = self.tilt_grid.len(),
            defocus_shifts = self.defocus_grid.len(),
            min_radius = self.min_radius,
            max_radius = self.max_radius,
            "Optimising beam tilt and defocus."
        );

        let mut slots: Vec<MicrographSearch> = self
            .ctx
            .experiment
            .micrographs()
            .iter()
            .map(|m| MicrographSearch {
                micrograph: m.id,
                group: self.groups.group_of(m.id),
                particles: 0,
                pixels: 0,
                tilt_scores: Vec::new(),
                defocus_shifts: Vec::new(),
            })
            .collect();

        self.phases.iter_mut().for_each(|p| *p = GroupPhase::GridSearch);
        self.map_micrographs(&mut slots, |slot| self.search_tilts(slot));

        let mut issues = IssueLog::new();
        let mut groups = Vec::with_capacity(self.groups.group_count());
        for group in 0..self.groups.group_count() {
            let mut scores = vec![0.0; self.tilt_grid.len()];
            let (mut particles, mut pixels) = (0, 0);
            for slot in slots.iter().filter(|s| s.group == group) {
                particles += slot.particles;
                pixels += slot.pixels;
                for (total, score) in scores.iter_mut().zip(&slot.tilt_scores) {
                    *total += score;
                }
            }

            let name = self.groups.name(group).to_string();
            let degenerate = if particles < options.min_group_particles {
                Some(format!(
                    "{particles} particles, at least {} required",
                    options.min_group_particles
                ))
            } else if pixels == 0 {
                Some("no Fourier pixels in the scoring resolution range".to_string())
            } else {
                None
            };

            let (beam_tilt, score) = match &degenerate {
                Some(reason) => {
                    issues.record(PolishIssue::OptimizationDegenerate {
                        group: name.clone(),
                        reason: reason.clone(),
                    });
                    (tilt_enabled.then(Vector2::<f64>::zeros), f64::NAN)
                }
                None => {
                    let best = best_candidate(&scores, &self.tilt_order);
                    debug!(group = %name, tilt_x = self.tilt_grid[best].x, tilt_y = self.tilt_grid[best].y, score = scores[best], "Beam tilt chosen.");
                    (tilt_enabled.then_some(self.tilt_grid[best]), scores[best])
                }
            };
            self.phases[group] = GroupPhase::Commit;
            groups.push(GroupOutcome {
                name,
                phase: GroupPhase::Commit,
                particles,
                beam_tilt,
                score,
                degenerate,
            });
        }

        if defocus_enabled {
            let searched: Vec<bool> = groups.iter().map(|g| g.degenerate.is_none()).collect();
            let tilts: Vec<Option<Vector2<f64>>> = groups.iter().map(|g| g.beam_tilt).collect();
            self.map_micrographs(&mut slots, |slot| {
                if searched[slot.group] {
                    self.search_defocus(slot, tilts[slot.group]);
                }
            });
        }

        let mut commits = Vec::new();
        for slot in &slots {
            let outcome = &groups[slot.group];
            let shifts: HashMap<ParticleId, f64> = slot.defocus_shifts.iter().copied().collect();
            for particle in self.ctx.experiment.particles_in(slot.micrograph) {
                if !self.shiny.contains_key(&particle.id) {
                    continue;
                }
                commits.push(ParticleCommit {
                    particle: particle.id,
                    beam_tilt: outcome.beam_tilt,
                    defocus_shift: shifts.get(&particle.id).copied().unwrap_or(0.0),
                });
            }
        }

        for (phase, outcome) in self.phases.iter_mut().zip(groups.iter_mut()) {
            *phase = GroupPhase::Done;
            outcome.phase = GroupPhase::Done;
        }
        OptimisationReport {
            groups,
            commits,
            issues,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::fourier::{FourierTransformer, RustFftTransformer};
    use crate::core::io::frames::InMemoryFrames;
    use crate::core::models::particle::{CtfParams, Orientation};
    use crate::engine::config::{OptimisationConfig, PolishConfig, PolishConfigBuilder};
    use crate::engine::grouping::SingleGroup;
    use crate::engine::progress::ProgressReporter;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    const N: usize = 32;

    fn config(optimisation: OptimisationConfig) -> PolishConfig {
        PolishConfigBuilder::new().angpix(1.2).optimisation(optimisation).build().unwrap()
    }

    fn search(beamtilt_max: f64, defocus_shift_max: f64, min_group_particles: usize) -> OptimisationConfig {
        OptimisationConfig {
            beamtilt_max,
            beamtilt_step: 0.2,
            defocus_shift_max,
            defocus_shift_step: 100.0,
            minres_beamtilt: 8.0,
            maxres_model: None,
            min_group_particles,
        }
    }

    fn reference(seed: u64) -> Array3<Complex64> {
        let mut rng = StdRng::seed_from_u64(seed);
        let density = Array3::from_shape_fn((N, N, N), |_| rng.gen_range(-1.0..1.0));
        RustFftTransformer::new(N).forward_3d(&density)
    }

    /// Particles whose polished images are exact projections seen through a CTF with the
    /// given true defocus shift and beam tilt.
    fn synthetic(
        config: &PolishConfig,
        volume: &Array3<Complex64>,
        count: usize,
        defocus_shift: f64,
        beam_tilt: Vector2<f64>,
    ) -> (Experiment, Vec<ShinyParticle>) {
        let fft = RustFftTransformer::new(N);
        let shells = ResolutionShells::new(N, config.angpix);
        let mut rng = StdRng::seed_from_u64(99);
        let mut exp = Experiment::new();
        let mic = exp.add_micrograph("mic");
        let mut shiny = Vec::new();
        for i in 0..count {
            let half = if i % 2 == 0 { HalfSet::One } else { HalfSet::Two };
            let id = exp.add_particle(mic, &format!("p{i}"), half);
            let particle = exp.particle_mut(id).unwrap();
            particle.orientation = Orientation::new(
                rng.gen_range(-180.0..180.0),
                rng.gen_range(0.0..180.0),
                rng.gen_range(-180.0..180.0),
            );
            particle.ctf = CtfParams {
                defocus_u: 15000.0 + 500.0 * i as f64,
                defocus_v: 14800.0 + 500.0 * i as f64,
                defocus_angle: 30.0,
                ..CtfParams::default()
            };
            let truth = CtfModel::new(&particle.ctf, &config.optics)
                .with_defocus_shift(defocus_shift)
                .with_beam_tilt(beam_tilt);
            let mut spectrum = project(volume, &particle.orientation.rotation(), 14.0);
            for px in shells.pixels_2d() {
                spectrum[[px.row, px.col]] *=
                    Complex64::from_polar(truth.value(px.sx, px.sy), truth.beam_tilt_phase(px.sx, px.sy));
            }
            shiny.push(ShinyParticle {
                particle: id,
                image: fft.inverse_2d(&spectrum),
                frames_used: vec![0],
            });
        }
        (exp, shiny)
    }

    fn optimise(
        config: &PolishConfig,
        exp: &Experiment,
        shiny: &[ShinyParticle],
        volume: &Array3<Complex64>,
    ) -> OptimisationReport {
        let frames = InMemoryFrames::new();
        let fft = RustFftTransformer::new(N);
        let reporter = ProgressReporter::new();
        let ctx = PolishContext::new(exp, &frames, config, &fft, &reporter);
        let references = ReferenceHalves::new(volume.clone(), volume.clone());
        let groups = GroupAssignment::build(exp, &SingleGroup);
        let mut optimizer = BeamTiltDefocusOptimizer::new(ctx, &references, &groups, shiny, 3.0);
        assert_eq!(optimizer.phase(0), GroupPhase::Init);
        let report = optimizer.optimise();
        assert_eq!(optimizer.phase(0), GroupPhase::Done);
        report
    }

    #[test]
    fn zero_tilt_is_recovered() {
        let config = config(search(0.6, 0.0, 1));
        let volume = reference(1);
        let (exp, shiny) = synthetic(&config, &volume, 6, 0.0, Vector2::zeros());
        let report = optimise(&config, &exp, &shiny, &volume);
        let group = &report.groups[0];
        assert_eq!(group.phase, GroupPhase::Done);
        assert!(group.beam_tilt.unwrap().norm() < 1e-9);
        assert!(report.issues.is_empty());
    }

    #[test]
    fn non_zero_tilt_is_recovered_and_committed() {
        let config = config(search(0.6, 0.0, 1));
        let volume = reference(2);
        let truth = Vector2::new(0.4, -0.2);
        let (mut exp, shiny) = synthetic(&config, &volume, 6, 0.0, truth);
        let report = optimise(&config, &exp, &shiny, &volume);
        let chosen = report.groups[0].beam_tilt.unwrap();
        assert!((chosen - truth).norm() < 1e-9, "chose {chosen:?}");

        assert_eq!(report.apply_optimised_beam_tilts_and_defocus(&mut exp).unwrap(), 6);
        for particle in exp.particles() {
            assert!((particle.ctf.beam_tilt - truth).norm() < 1e-9);
        }
    }

    #[test]
    fn defocus_shift_is_recovered_per_particle() {
        let config = config(search(0.0, 400.0, 1));
        let volume = reference(3);
        let (mut exp, shiny) = synthetic(&config, &volume, 4, 200.0, Vector2::zeros());
        let before: Vec<f64> = exp.particles().iter().map(|p| p.ctf.defocus_u).collect();
        let report = optimise(&config, &exp, &shiny, &volume);
        assert_eq!(report.groups[0].beam_tilt, None);
        for commit in &report.commits {
            assert!((commit.defocus_shift - 200.0).abs() < 1e-9);
            assert_eq!(commit.beam_tilt, None);
        }

        report.apply_optimised_beam_tilts_and_defocus(&mut exp).unwrap();
        for (particle, old) in exp.particles().iter().zip(before) {
            assert!((particle.ctf.defocus_u - old - 200.0).abs() < 1e-9);
            assert_eq!(particle.ctf.beam_tilt, Vector2::zeros());
        }
    }

    #[test]
    fn small_groups_are_degenerate() {
        let config = config(search(0.6, 400.0, 10));
        let volume = reference(4);
        let (exp, shiny) = synthetic(&config, &volume, 3, 0.0, Vector2::new(0.2, 0.2));
        let report = optimise(&config, &exp, &shiny, &volume);
        let group = report.group(SingleGroup::NAME).unwrap();
        assert_eq!(group.beam_tilt, Some(Vector2::zeros()));
        assert!(group.degenerate.is_some());
        assert!(report.commits.iter().all(|c| c.defocus_shift == 0.0));
        assert_eq!(report.issues.counts().degenerate_groups, 1);
    }

    #[test]
    fn ties_go_to_the_smallest_magnitude() {
        let grid: [f64; 5] = [-0.2, -0.1, 0.0, 0.1, 0.2];
        let order = by_magnitude(&grid, |v| v.abs());
        assert_eq!(order[0], 2);
        assert_eq!(grid[best_candidate(&[1.0, 0.5, 0.5, 0.5, 2.0], &order)], 0.0);
        assert_eq!(grid[best_candidate(&[1.0, 0.5, 0.7, 0.5, 2.0], &order)], -0.1);
    }

    #[test]
    fn phases_wrap_into_the_principal_range() {
        assert!((wrap_phase(3.0 * PI / 2.0) + PI / 2.0).abs() < 1e-12);
        assert!((wrap_phase(-0.25) + 0.25).abs() < 1e-12);
    }
}
