use super::ids::{MicrographId, ParticleId};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Micrograph {
    pub id: MicrographId,
    pub name: String,                    // Source micrograph name, also drives beam-tilt grouping
    pub(crate) particles: Vec<ParticleId>, // Particles in insertion order
}

impl Micrograph {
    pub(crate) fn new(id: MicrographId, name: &str) -> Self {
        Self {
            id,
            name: name.to_string(),
            particles: Vec::new(),
        }
    }

    pub fn particles(&self) -> &[ParticleId] {
        &self.particles
    }

    pub fn is_empty(&self) -> bool {
        self.particles.is_empty()
    }
}
