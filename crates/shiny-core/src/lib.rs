//! # shiny
//!
//! Movie-particle polishing for cryo-EM: per-particle trajectory fitting, per-frame
//! B-factor weighting, Fourier-domain frame combination into "shiny" particles, and
//! refinement of beam tilt and defocus against the polished reconstruction.
//!
//! ## Architectural Philosophy
//!
//! The library is split into three layers, separating data, computation and orchestration:
//!
//! - **[`core`]: The Foundation.** Stateless data models (`Experiment`, `Particle`),
//!   Fourier transforms and resolution shells, the CTF model, reconstruction primitives,
//!   regression and Guinier fits, and MRC/CSV I/O.
//!
//! - **[`engine`]: The Logic Core.** Configuration, errors, progress reporting, the
//!   reconstruction cache, beam-tilt grouping and the parallel tasks that implement
//!   movement fitting, frame reconstruction, polishing and optics optimisation.
//!
//! - **[`workflows`]: The Public API.** End-to-end procedures that tie the engine together,
//!   with [`workflows::polish::run`] as the main entry point.

pub mod core;
pub mod engine;
pub mod workflows;
