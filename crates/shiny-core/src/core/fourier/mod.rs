//! Fourier-space utilities: transforms, sub-pixel shifts and resolution shells.

pub mod shells;
pub mod transform;

pub use shells::{FourierPixel, ResolutionShells, signed_frequency, wrap_index};
pub use transform::{FourierTransformer, RustFftTransformer, shift_spectrum};
