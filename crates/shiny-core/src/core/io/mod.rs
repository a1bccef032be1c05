//! File input and output: MRC images, frame sources and CSV metadata tables.

pub mod frames;
pub mod mrc;
pub mod tables;
