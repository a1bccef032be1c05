//! # Workflows Module
//!
//! High-level entry points that run complete polishing procedures on an
//! [`Experiment`](crate::core::models::experiment::Experiment).
//!
//! - **Polishing Workflow** ([`polish`]) - Movement fitting, per-frame B-factor weighting,
//!   particle polishing, beam-tilt/defocus optimisation and the optional second pass.
//!   [`polish::estimate_frame_weights`] stops after the frame weighting stage.
//!
//! Workflows validate their configuration before touching any data, report progress
//! through a [`ProgressReporter`](crate::engine::progress::ProgressReporter) and return
//! every product of the run; writing files is left to the caller.

pub mod polish;
