use serde::{Deserialize, Serialize};
use std::fmt;

/// Stable index of a particle inside an [`Experiment`](super::experiment::Experiment).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ParticleId(pub usize);

/// Stable index of a micrograph inside an [`Experiment`](super::experiment::Experiment).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MicrographId(pub usize);

impl fmt::Display for ParticleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

impl fmt::Display for MicrographId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "mic#{}", self.0)
    }
}

/// Random subset used for gold-standard half-set separation.
///
/// The two halves never share reconstruction state; every FSC in the pipeline compares
/// a half-1 volume against a half-2 volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum HalfSet {
    One,
    Two,
}

impl HalfSet {
    pub const BOTH: [HalfSet; 2] = [HalfSet::One, HalfSet::Two];

    /// Zero-based index, handy for `[T; 2]` storage.
    pub fn index(self) -> usize {
        match self {
            HalfSet::One => 0,
            HalfSet::Two => 1,
        }
    }

    /// The subset number as written in particle tables (1 or 2).
    pub fn number(self) -> u8 {
        match self {
            HalfSet::One => 1,
            HalfSet::Two => 2,
        }
    }

    pub fn from_number(number: u8) -> Option<Self> {
        match number {
            1 => Some(HalfSet::One),
            2 => Some(HalfSet::Two),
            _ => None,
        }
    }
}

impl fmt::Display for HalfSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "half{}", self.number())
    }
}
