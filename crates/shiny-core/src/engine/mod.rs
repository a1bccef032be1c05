//! # Engine Module
//!
//! This module implements the polishing engine: the stateful layer that turns an
//! [`Experiment`](crate::core::models::experiment::Experiment) and its movie frames into
//! fitted trajectories, frame weights, polished particles and refined optics.
//!
//! ## Architecture
//!
//! - **Configuration** ([`config`]) - Run parameters, validation and the configuration builder
//! - **Context** ([`context`]) - Read-only state shared by all tasks of a run
//! - **Caching** ([`cache`]) - Persistent memoisation of single-frame reconstructions
//! - **Grouping** ([`grouping`]) - Assignment of micrographs to beam-tilt groups
//! - **Progress Monitoring** ([`progress`]) - Progress reporting through a callback
//! - **Error Handling** ([`error`]) - Fatal errors and recoverable per-unit issues
//! - **Tasks** ([`tasks`]) - Movement fitting, frame reconstructions, polishing and
//!   beam-tilt/defocus optimisation
//!
//! ## Key Capabilities
//!
//! - **Parallel computation** over micrographs, frames and particle chunks
//! - **Reconstruction caching** with configuration fingerprints, so interrupted runs resume
//! - **Recoverable failures** recorded per unit while the run continues

pub mod cache;
pub mod config;
pub mod context;
pub mod error;
pub mod grouping;
pub mod progress;
pub mod tasks;
