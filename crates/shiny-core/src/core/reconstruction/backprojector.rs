use crate::core::fourier::{signed_frequency, wrap_index};
use nalgebra::{Rotation3, Vector3};
use ndarray::{Array2, Array3, Zip};
use num_complex::Complex64;

/// Relative weight below which a Fourier voxel counts as unsampled.
const MIN_RELATIVE_WEIGHT: f64 = 1e-3;

/// Accumulates oriented 2-D spectra into a 3-D Fourier volume.
///
/// Each image pixel within `max_radius` is rotated into the volume and added, together
/// with its weight, to the nearest voxel. [`finalize`](Self::finalize) divides data by
/// weight. Accumulators built on disjoint subsets can be combined with
/// [`merge`](Self::merge) before finalising.
#[derive(Debug, Clone)]
pub struct Backprojector {
    box_size: usize,
    max_radius: f64,
    data: Array3<Complex64>,
    weight: Array3<f64>,
    images: usize,
}

impl Backprojector {
    /// Creates an empty accumulator. The radius is capped just below Nyquist.
    pub fn new(box_size: usize, max_radius: f64) -> Self {
        let cap = (box_size / 2).saturating_sub(1) as f64;
        Self {
            box_size,
            max_radius: max_radius.clamp(0.0, cap),
            data: Array3::zeros((box_size, box_size, box_size)),
            weight: Array3::zeros((box_size, box_size, box_size)),
            images: 0,
        }
    }

    pub fn box_size(&self) -> usize {
        self.box_size
    }

    pub fn max_radius(&self) -> f64 {
        self.max_radius
    }

    /// Number of images accumulated so far (merged accumulators included).
    pub fn image_count(&self) -> usize {
        self.images
    }

    /// Inserts one spectrum (already CTF-weighted) with per-pixel weights.
    pub fn accumulate(&mut self, spectrum: &Array2<Complex64>, weights: &Array2<f64>, rotation: &Rotation3<f64>) {
        let n = self.box_size;
        let to_volume = rotation.inverse();
        for ((row, col), value) in spectrum.indexed_iter() {
            let kx = signed_frequency(col, n) as f64;
            let ky = signed_frequency(row, n) as f64;
            if kx.hypot(ky) > self.max_radius {
                continue;
            }
            let p = to_volume * Vector3::new(kx, ky, 0.0);
            let index = [
                wrap_index(p.z.round() as i64, n),
                wrap_index(p.y.round() as i64, n),
                wrap_index(p.x.round() as i64, n),
            ];
            self.data[index] += *value;
            self.weight[index] += weights[[row, col]];
        }
        self.images += 1;
    }

    pub fn merge(&mut self, other: &Backprojector) {
        self.data += &other.data;
        self.weight += &other.weight;
        self.images += other.images;
    }

    /// Divides accumulated data by accumulated weight. Voxels whose weight falls below a
    /// small fraction of the maximum weight are set to zero.
    pub fn finalize(self) -> Array3<Complex64> {
        let Backprojector { mut data, weight, .. } = self;
        let max_weight = weight.iter().copied().fold(0.0, f64::max);
        let floor = max_weight * MIN_RELATIVE_WEIGHT;
        Zip::from(&mut data).and(&weight).for_each(|d, &w| {
            if max_weight > 0.0 && w > floor {
                *d /= w;
            } else {
                *d = Complex64::default();
            }
        });
        data
    }
}
