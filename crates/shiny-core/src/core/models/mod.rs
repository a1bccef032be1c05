pub mod experiment;
pub mod ids;
pub mod micrograph;
pub mod particle;
