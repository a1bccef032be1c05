use std::collections::HashSet;
use thiserror::Error;
use tracing::warn;

use super::cache::CacheError;
use super::config::ConfigError;
use crate::core::image::NormaliseError;
use crate::core::io::frames::ImageError;
use crate::core::io::mrc::MrcError;
use crate::core::io::tables::TableError;
use crate::core::models::ids::ParticleId;

/// Fatal failures: the run cannot produce trustworthy output.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Image I/O failed: {0}")]
    Image(#[from] ImageError),

    #[error("Volume I/O failed: {0}")]
    Volume(#[from] MrcError),

    #[error("Table I/O failed: {0}")]
    Table(#[from] TableError),

    #[error("Reconstruction cache failure: {0}")]
    Cache(#[from] CacheError),

    #[error("Normalisation failed: {0}")]
    Normalise(#[from] NormaliseError),

    #[error("Optimization phase '{phase}' failed: {reason}")]
    PhaseFailed { phase: &'static str, reason: String },

    #[error("Internal logic error: {0}")]
    Internal(String),
}

/// Recoverable per-unit failures. The affected unit falls back to a documented default
/// and the run continues.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Error)]
pub enum PolishIssue {
    #[error("particle {particle}: {usable} usable motion samples, trajectory left unfitted")]
    InsufficientData { particle: ParticleId, usable: usize },

    #[error("frame {frame}: reconstruction too poor for a Guinier fit, fallback B-factor used")]
    LowResolutionReconstruction { frame: usize },

    #[error("particle {particle} frame {frame} skipped: {reason}")]
    UnreadableFrame {
        particle: ParticleId,
        frame: usize,
        reason: String,
    },

    #[error("particle {particle}: no usable frames ({reason}), dropped from the shiny set")]
    NoUsableFrames { particle: ParticleId, reason: String },

    #[error("beam-tilt group '{group}': {reason}; zero tilt and defocus shift kept")]
    OptimizationDegenerate { group: String, reason: String },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IssueCounts {
    pub insufficient_data: usize,
    pub low_resolution_frames: usize,
    pub unreadable_frames: usize,
    pub no_usable_frames: usize,
    pub degenerate_groups: usize,
}

impl IssueCounts {
    pub fn add(&mut self, issue: &PolishIssue) {
        match issue {
            PolishIssue::InsufficientData { .. } => self.insufficient_data += 1,
            PolishIssue::LowResolutionReconstruction { .. } => self.low_resolution_frames += 1,
            PolishIssue::UnreadableFrame { .. } => self.unreadable_frames += 1,
            PolishIssue::NoUsableFrames { .. } => self.no_usable_frames += 1,
            PolishIssue::OptimizationDegenerate { .. } => self.degenerate_groups += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.insufficient_data
            + self.low_resolution_frames
            + self.unreadable_frames
            + self.no_usable_frames
            + self.degenerate_groups
    }
}

/// Ordered record of every recoverable issue met during a run.
///
/// An issue is kept once, however many stages run into it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IssueLog {
    issues: Vec<PolishIssue>,
    seen: HashSet<PolishIssue>,
}

impl IssueLog {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&mut self, issue: PolishIssue) -> bool {
        if self.seen.contains(&issue) {
            return false;
        }
        self.seen.insert(issue.clone());
        self.issues.push(issue);
        true
    }

    pub fn record(&mut self, issue: PolishIssue) {
        let message = issue.to_string();
        if self.push(issue) {
            warn!("{message}");
        }
    }

    pub fn extend(&mut self, other: IssueLog) {
        for issue in other.issues {
            self.push(issue);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.issues.is_empty()
    }

    pub fn len(&self) -> usize {
        self.issues.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PolishIssue> {
        self.issues.iter()
    }

    pub fn counts(&self) -> IssueCounts {
        let mut counts = IssueCounts::default();
        for issue in &self.issues {
            counts.add(issue);
        }
        counts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_are_tallied_per_kind() {
        let mut log = IssueLog::new();
        log.record(PolishIssue::InsufficientData { particle: ParticleId(1), usable: 1 });
        log.record(PolishIssue::InsufficientData { particle: ParticleId(2), usable: 0 });
        log.record(PolishIssue::LowResolutionReconstruction { frame: 3 });
        let mut other = IssueLog::new();
        other.record(PolishIssue::NoUsableFrames {
            particle: ParticleId(4),
            reason: "no frames".to_string(),
        });
        log.extend(other);

        let counts = log.counts();
        assert_eq!(counts.insufficient_data, 2);
        assert_eq!(counts.low_resolution_frames, 1);
        assert_eq!(counts.no_usable_frames, 1);
        assert_eq!(counts.degenerate_groups, 0);
        assert_eq!(counts.total(), 4);
        assert_eq!(log.len(), 4);
    }

    #[test]
    fn the_same_frame_failure_is_kept_once() {
        let unreadable = || PolishIssue::UnreadableFrame {
            particle: ParticleId(0),
            frame: 2,
            reason: "image contains non-finite values".to_string(),
        };
        let mut weighting = IssueLog::new();
        weighting.record(unreadable());
        let mut polishing = IssueLog::new();
        polishing.record(unreadable());
        polishing.record(PolishIssue::UnreadableFrame {
            particle: ParticleId(0),
            frame: 3,
            reason: "image contains non-finite values".to_string(),
        });

        weighting.extend(polishing);
        assert_eq!(weighting.len(), 2);
        assert_eq!(weighting.counts().unreadable_frames, 2);
        assert_eq!(weighting.iter().next(), Some(&unreadable()));
    }

    #[test]
    fn issues_render_readable_messages() {
        let issue = PolishIssue::OptimizationDegenerate {
            group: "grid7".to_string(),
            reason: "only 3 particles".to_string(),
        };
        assert_eq!(
            issue.to_string(),
            "beam-tilt group 'grid7': only 3 particles; zero tilt and defocus shift kept"
        );
    }
}
