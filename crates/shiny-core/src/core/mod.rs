//! # Core Module
//!
//! Stateless building blocks of the polishing pipeline: the particle metadata model,
//! Fourier-space numerics, the CTF, reconstruction primitives, curve fitting and file I/O.
//!
//! ## Architecture
//!
//! - **Metadata** ([`models`]) - Particles, micrographs and the [`Experiment`](models::experiment::Experiment) that owns them
//! - **Fourier space** ([`fourier`]) - Transforms, sub-pixel shifts and resolution shells
//! - **Optics** ([`ctf`]) - Contrast transfer function, beam-tilt phase and correction modes
//! - **Reconstruction** ([`reconstruction`]) - Backprojection, projection and FSC
//! - **Fitting** ([`fitting`]) - Weighted line fits, Guinier B-factors and relative frame weights
//! - **Images** ([`image`]) - Background normalisation of polished particles
//! - **File I/O** ([`io`]) - MRC stacks and volumes, frame sources and CSV tables
//!
//! Nothing in this module holds global state or spawns work; parallelism and caching are
//! the business of the [`engine`](crate::engine).

pub mod ctf;
pub mod fitting;
pub mod fourier;
pub mod image;
pub mod io;
pub mod models;
pub mod reconstruction;
