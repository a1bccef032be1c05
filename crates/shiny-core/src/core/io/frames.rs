use super::mrc::{MrcError, MrcHeader, read_slice_from};
use crate::core::models::ids::ParticleId;
use crate::core::models::particle::Particle;
use ndarray::Array2;
use std::collections::HashMap;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ImageError {
    #[error("failed to read {}: {source}", .path.display())]
    Mrc {
        path: PathBuf,
        #[source]
        source: MrcError,
    },
    #[error("particle '{particle}' frame {frame}: image is {found:?}, expected a {expected}x{expected} box")]
    BoxSize {
        particle: String,
        frame: usize,
        expected: usize,
        found: (usize, usize),
    },
    #[error("particle '{particle}' frame {frame}: image contains non-finite values")]
    NonFinite { particle: String, frame: usize },
}

/// Supplies the per-frame images of particles.
///
/// Implementations must be shareable across worker threads; frames are requested
/// concurrently for different particles.
pub trait FrameSource: Sync {
    /// Returns the image of `frame` for `particle`, or `None` if the movie has no such frame.
    fn read_frame(&self, particle: &Particle, frame: usize) -> Result<Option<Array2<f64>>, ImageError>;
}

/// Where a particle's movie frames live: consecutive sections of one MRC stack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackLocation {
    pub path: PathBuf,
    pub first_slice: usize,
}

/// Frames read lazily from per-particle MRC stacks.
///
/// Each stack's header is parsed on first access and reused for every later frame.
#[derive(Debug, Default)]
pub struct MrcStackFrames {
    stacks: HashMap<ParticleId, StackLocation>,
    headers: RwLock<HashMap<PathBuf, MrcHeader>>,
}

impl MrcStackFrames {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, particle: ParticleId, location: StackLocation) {
        self.stacks.insert(particle, location);
    }

    pub fn location(&self, particle: ParticleId) -> Option<&StackLocation> {
        self.stacks.get(&particle)
    }

    pub fn len(&self) -> usize {
        self.stacks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stacks.is_empty()
    }

    /// Number of stacks whose header has been parsed so far.
    pub fn cached_headers(&self) -> usize {
        self.headers.read().map(|h| h.len()).unwrap_or(0)
    }

    fn header(&self, path: &Path, reader: &mut BufReader<File>) -> Result<MrcHeader, ImageError> {
        if let Some(header) = self.headers.read().ok().and_then(|h| h.get(path).copied()) {
            return Ok(header);
        }
        let header = MrcHeader::read_from(reader).map_err(|e| mrc_error(path, e))?;
        if let Ok(mut headers) = self.headers.write() {
            headers.insert(path.to_path_buf(), header);
        }
        Ok(header)
    }
}

fn mrc_error(path: &Path, source: impl Into<MrcError>) -> ImageError {
    ImageError::Mrc {
        path: path.to_path_buf(),
        source: source.into(),
    }
}

impl FrameSource for MrcStackFrames {
    fn read_frame(&self, particle: &Particle, frame: usize) -> Result<Option<Array2<f64>>, ImageError> {
        let Some(location) = self.stacks.get(&particle.id) else {
            return Ok(None);
        };
        let path = location.path.as_path();
        let mut reader = BufReader::new(File::open(path).map_err(|e| mrc_error(path, e))?);
        let header = self.header(path, &mut reader)?;
        let index = location.first_slice + frame;
        if index >= header.nz {
            return Ok(None);
        }
        read_slice_from(&mut reader, &header, index)
            .map(Some)
            .map_err(|e| mrc_error(path, e))
    }
}

/// Frames held in memory, mainly for synthetic data and tests.
#[derive(Debug, Clone, Default)]
pub struct InMemoryFrames {
    frames: HashMap<ParticleId, Vec<Array2<f64>>>,
}

impl InMemoryFrames {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, particle: ParticleId, frames: Vec<Array2<f64>>) {
        self.frames.insert(particle, frames);
    }

    pub fn frame_mut(&mut self, particle: ParticleId, frame: usize) -> Option<&mut Array2<f64>> {
        self.frames.get_mut(&particle).and_then(|f| f.get_mut(frame))
    }
}

impl FrameSource for InMemoryFrames {
    fn read_frame(&self, particle: &Particle, frame: usize) -> Result<Option<Array2<f64>>, ImageError> {
        Ok(self.frames.get(&particle.id).and_then(|f| f.get(frame)).cloned())
    }
}
