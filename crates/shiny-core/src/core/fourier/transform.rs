use super::shells::signed_frequency;
use nalgebra::Vector2;
use ndarray::{Array, Array2, Array3, Axis, Dimension};
use num_complex::Complex64;
use rustfft::{Fft, FftPlanner, Length};
use std::f64::consts::PI;
use std::fmt;
use std::sync::Arc;

/// Discrete Fourier transforms of square images and cubic volumes.
///
/// Forward transforms are unnormalised; inverse transforms divide by the number of
/// samples, so `inverse(forward(x)) == x`. Spectra use the standard FFT index layout
/// (see [`signed_frequency`](super::shells::signed_frequency)).
pub trait FourierTransformer: Send + Sync {
    fn box_size(&self) -> usize;
    fn forward_2d(&self, image: &Array2<f64>) -> Array2<Complex64>;
    fn inverse_2d(&self, spectrum: &Array2<Complex64>) -> Array2<f64>;
    fn forward_3d(&self, volume: &Array3<f64>) -> Array3<Complex64>;
    fn inverse_3d(&self, spectrum: &Array3<Complex64>) -> Array3<f64>;
}

/// [`FourierTransformer`] backed by `rustfft` plans for one box size.
#[derive(Clone)]
pub struct RustFftTransformer {
    size: usize,
    forward: Arc<dyn Fft<f64>>,
    inverse: Arc<dyn Fft<f64>>,
}

impl fmt::Debug for RustFftTransformer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RustFftTransformer").field("size", &self.size).finish()
    }
}

impl RustFftTransformer {
    pub fn new(size: usize) -> Self {
        let mut planner = FftPlanner::new();
        Self {
            size,
            forward: planner.plan_fft_forward(size),
            inverse: planner.plan_fft_inverse(size),
        }
    }
}

fn transform_lanes<D: Dimension>(data: &mut Array<Complex64, D>, fft: &dyn Fft<f64>) {
    let mut buffer = Vec::with_capacity(fft.len());
    let mut scratch = vec![Complex64::default(); fft.get_inplace_scratch_len()];
    for axis in 0..data.ndim() {
        for mut lane in data.lanes_mut(Axis(axis)) {
            debug_assert_eq!(lane.len(), fft.len());
            buffer.clear();
            buffer.extend(lane.iter().copied());
            fft.process_with_scratch(&mut buffer, &mut scratch);
            for (dst, src) in lane.iter_mut().zip(&buffer) {
                *dst = *src;
            }
        }
    }
}

impl FourierTransformer for RustFftTransformer {
    fn box_size(&self) -> usize {
        self.size
    }

    fn forward_2d(&self, image: &Array2<f64>) -> Array2<Complex64> {
        let mut data = image.mapv(|v| Complex64::new(v, 0.0));
        transform_lanes(&mut data, self.forward.as_ref());
        data
    }

    fn inverse_2d(&self, spectrum: &Array2<Complex64>) -> Array2<f64> {
        let mut data = spectrum.clone();
        transform_lanes(&mut data, self.inverse.as_ref());
        let norm = data.len() as f64;
        data.mapv(|v| v.re / norm)
    }

    fn forward_3d(&self, volume: &Array3<f64>) -> Array3<Complex64> {
        let mut data = volume.mapv(|v| Complex64::new(v, 0.0));
        transform_lanes(&mut data, self.forward.as_ref());
        data
    }

    fn inverse_3d(&self, spectrum: &Array3<Complex64>) -> Array3<f64> {
        let mut data = spectrum.clone();
        transform_lanes(&mut data, self.inverse.as_ref());
        let norm = data.len() as f64;
        data.mapv(|v| v.re / norm)
    }
}

/// Shifts the real-space content of a square spectrum by `shift` pixels (x along
/// columns, y along rows) by multiplying with the corresponding phase ramp.
pub fn shift_spectrum(spectrum: &mut Array2<Complex64>, shift: Vector2<f64>) {
    if shift.x == 0.0 && shift.y == 0.0 {
        return;
    }
    let n = spectrum.nrows();
    let scale = -2.0 * PI / n as f64;
    for ((row, col), value) in spectrum.indexed_iter_mut() {
        let kx = signed_frequency(col, n) as f64;
        let ky = signed_frequency(row, n) as f64;
        *value *= Complex64::from_polar(1.0, scale * (kx * shift.x + ky * shift.y));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn random_image(n: usize, seed: u64) -> Array2<f64> {
        let mut rng = StdRng::seed_from_u64(seed);
        Array2::from_shape_fn((n, n), |_| rng.gen_range(-1.0..1.0))
    }

    #[test]
    fn forward_then_inverse_restores_image() {
        let fft = RustFftTransformer::new(12);
        let image = random_image(12, 1);
        let back = fft.inverse_2d(&fft.forward_2d(&image));
        let err = (&back - &image).iter().fold(0.0f64, |m, v| m.max(v.abs()));
        assert!(err < 1e-12, "max error {err}");
    }

    #[test]
    fn forward_then_inverse_restores_volume() {
        let fft = RustFftTransformer::new(6);
        let mut rng = StdRng::seed_from_u64(2);
        let volume = Array3::from_shape_fn((6, 6, 6), |_| rng.gen_range(-1.0..1.0));
        let back = fft.inverse_3d(&fft.forward_3d(&volume));
        let err = (&back - &volume).iter().fold(0.0f64, |m, v| m.max(v.abs()));
        assert!(err < 1e-12, "max error {err}");
    }

    #[test]
    fn dc_term_is_the_sum_of_pixels() {
        let fft = RustFftTransformer::new(8);
        let image = random_image(8, 3);
        let spectrum = fft.forward_2d(&image);
        assert!((spectrum[[0, 0]].re - image.sum()).abs() < 1e-10);
        assert!(spectrum[[0, 0]].im.abs() < 1e-10);
    }

    #[test]
    fn integer_shift_matches_circular_roll() {
        let n = 10;
        let fft = RustFftTransformer::new(n);
        let image = random_image(n, 4);
        let mut spectrum = fft.forward_2d(&image);
        shift_spectrum(&mut spectrum, Vector2::new(3.0, -2.0));
        let shifted = fft.inverse_2d(&spectrum);
        for row in 0..n {
            for col in 0..n {
                let src_row = (row + 2) % n;
                let src_col = (col + n - 3) % n;
                assert!((shifted[[row, col]] - image[[src_row, src_col]]).abs() < 1e-10);
            }
        }
    }

    #[test]
    fn opposite_shifts_cancel() {
        let fft = RustFftTransformer::new(8);
        let image = random_image(8, 5);
        let mut spectrum = fft.forward_2d(&image);
        shift_spectrum(&mut spectrum, Vector2::new(0.37, 1.25));
        shift_spectrum(&mut spectrum, Vector2::new(-0.37, -1.25));
        let back = fft.inverse_2d(&spectrum);
        let err = (&back - &image).iter().fold(0.0f64, |m, v| m.max(v.abs()));
        assert!(err < 1e-10);
    }
}
