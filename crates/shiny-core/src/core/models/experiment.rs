use super::ids::{HalfSet, MicrographId, ParticleId};
use super::micrograph::Micrograph;
use super::particle::{Particle, TrajectorySample};
use nalgebra::Vector2;
use std::collections::HashMap;

/// The complete set of micrographs and particles being polished.
///
/// The experiment is the single source of truth for particle metadata. Every other
/// record in the pipeline (reconstructions, B-factor fits, weight tables, shiny images)
/// is derived from it and may be recomputed at will. Fitted trajectories, committed
/// beam tilts and defocus shifts are written back here, and only here.
#[derive(Debug, Clone, Default)]
pub struct Experiment {
    micrographs: Vec<Micrograph>,
    particles: Vec<Particle>,
    micrograph_index: HashMap<String, MicrographId>,
}

impl Experiment {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the id of the micrograph called `name`, creating it on first use.
    pub fn add_micrograph(&mut self, name: &str) -> MicrographId {
        if let Some(&id) = self.micrograph_index.get(name) {
            return id;
        }
        let id = MicrographId(self.micrographs.len());
        self.micrographs.push(Micrograph::new(id, name));
        self.micrograph_index.insert(name.to_string(), id);
        id
    }

    /// Adds a particle to `micrograph` and returns its id.
    ///
    /// # Panics
    ///
    /// Panics if `micrograph` was not created by this experiment.
    pub fn add_particle(&mut self, micrograph: MicrographId, name: &str, half: HalfSet) -> ParticleId {
        let id = ParticleId(self.particles.len());
        self.particles.push(Particle::new(id, name, micrograph, half));
        self.micrographs[micrograph.0].particles.push(id);
        id
    }

    pub fn particle(&self, id: ParticleId) -> Option<&Particle> {
        self.particles.get(id.0)
    }

    pub fn particle_mut(&mut self, id: ParticleId) -> Option<&mut Particle> {
        self.particles.get_mut(id.0)
    }

    pub fn particles(&self) -> &[Particle] {
        &self.particles
    }

    pub fn micrograph(&self, id: MicrographId) -> Option<&Micrograph> {
        self.micrographs.get(id.0)
    }

    pub fn micrographs(&self) -> &[Micrograph] {
        &self.micrographs
    }

    pub fn find_micrograph(&self, name: &str) -> Option<MicrographId> {
        self.micrograph_index.get(name).copied()
    }

    /// Iterates over the particles of one micrograph in insertion order.
    pub fn particles_in(&self, micrograph: MicrographId) -> impl Iterator<Item = &Particle> {
        self.micrographs
            .get(micrograph.0)
            .map(|m| m.particles.as_slice())
            .unwrap_or_default()
            .iter()
            .map(|id| &self.particles[id.0])
    }

    pub fn particle_count(&self) -> usize {
        self.particles.len()
    }

    pub fn micrograph_count(&self) -> usize {
        self.micrographs.len()
    }

    pub fn half_count(&self, half: HalfSet) -> usize {
        self.particles.iter().filter(|p| p.half == half).count()
    }

    /// Number of movie frames spanned by the per-frame estimates of any particle.
    pub fn movie_frame_count(&self) -> usize {
        self.particles.iter().map(Particle::frame_span).max().unwrap_or(0)
    }

    /// Commits a fitted trajectory. Returns `false` when the particle does not exist or the
    /// trajectory does not cover exactly the frames of the particle's estimates.
    pub fn set_fitted_trajectory(&mut self, id: ParticleId, fitted: Vec<TrajectorySample>) -> bool {
        let Some(particle) = self.particles.get_mut(id.0) else {
            return false;
        };
        let same_frames = fitted.len() == particle.offsets.len()
            && fitted.iter().zip(&particle.offsets).all(|(a, b)| a.frame == b.frame);
        if same_frames {
            particle.fitted = fitted;
        }
        same_frames
    }

    /// Commits optimised optics for one particle. `beam_tilt` of `None` leaves the
    /// particle's current tilt in place.
    pub fn commit_optics(&mut self, id: ParticleId, beam_tilt: Option<Vector2<f64>>, defocus_shift: f64) -> bool {
        let Some(particle) = self.particles.get_mut(id.0) else {
            return false;
        };
        if let Some(tilt) = beam_tilt {
            particle.ctf.beam_tilt = tilt;
        }
        particle.ctf = particle.ctf.with_defocus_shift(defocus_shift);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_micrograph_is_idempotent_by_name() {
        let mut exp = Experiment::new();
        let a = exp.add_micrograph("mics/a.mrc");
        let b = exp.add_micrograph("mics/b.mrc");
        assert_ne!(a, b);
        assert_eq!(exp.add_micrograph("mics/a.mrc"), a);
        assert_eq!(exp.micrograph_count(), 2);
        assert_eq!(exp.find_micrograph("mics/b.mrc"), Some(b));
    }

    #[test]
    fn particles_are_listed_per_micrograph() {
        let mut exp = Experiment::new();
        let a = exp.add_micrograph("a");
        let b = exp.add_micrograph("b");
        let p0 = exp.add_particle(a, "p0", HalfSet::One);
        let _p1 = exp.add_particle(b, "p1", HalfSet::Two);
        let p2 = exp.add_particle(a, "p2", HalfSet::Two);

        let ids: Vec<_> = exp.particles_in(a).map(|p| p.id).collect();
        assert_eq!(ids, vec![p0, p2]);
        assert_eq!(exp.half_count(HalfSet::Two), 2);
        assert_eq!(exp.particles_in(MicrographId(9)).count(), 0);
    }

    #[test]
    fn fitted_trajectory_must_cover_the_same_frames() {
        let mut exp = Experiment::new();
        let mic = exp.add_micrograph("m");
        let id = exp.add_particle(mic, "p", HalfSet::One);
        exp.particle_mut(id)
            .unwrap()
            .set_offsets(vec![TrajectorySample::new(0, 0.0, 0.0), TrajectorySample::new(1, 1.0, 1.0)]);

        assert!(!exp.set_fitted_trajectory(id, vec![TrajectorySample::new(0, 0.5, 0.5)]));
        assert!(exp.set_fitted_trajectory(
            id,
            vec![TrajectorySample::new(0, 0.5, 0.5), TrajectorySample::new(1, 0.5, 0.5)]
        ));
        assert_eq!(exp.particle(id).unwrap().fitted_offset(1), Some(Vector2::new(0.5, 0.5)));
        assert_eq!(exp.movie_frame_count(), 2);
    }

    #[test]
    fn commit_optics_shifts_defocus_and_optionally_sets_tilt() {
        let mut exp = Experiment::new();
        let mic = exp.add_micrograph("m");
        let id = exp.add_particle(mic, "p", HalfSet::One);
        let before = exp.particle(id).unwrap().ctf;

        assert!(exp.commit_optics(id, None, 100.0));
        let after = exp.particle(id).unwrap().ctf;
        assert_eq!(after.defocus_u, before.defocus_u + 100.0);
        assert_eq!(after.beam_tilt, before.beam_tilt);

        assert!(exp.commit_optics(id, Some(Vector2::new(0.4, -0.2)), 0.0));
        assert_eq!(exp.particle(id).unwrap().ctf.beam_tilt, Vector2::new(0.4, -0.2));
        assert!(!exp.commit_optics(ParticleId(5), None, 0.0));
    }
}
