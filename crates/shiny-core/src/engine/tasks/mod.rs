//! Computational stages of a polishing run.
//!
//! Each task owns one numerical concern and is driven by the polishing workflow through a
//! shared [`PolishContext`](super::context::PolishContext). Work is split into independent
//! units (micrographs, frames, particle chunks) that run in parallel when the `parallel`
//! feature is enabled; results are merged serially in a deterministic order.

pub mod beamtilt;
pub mod frame_reconstruction;
pub mod movement;
pub mod polish;
