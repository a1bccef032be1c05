pub mod outputs;
pub mod polish;
pub mod weights;
