use crate::core::fourier::{signed_frequency, wrap_index};
use nalgebra::{Rotation3, Vector3};
use ndarray::{Array2, Array3};
use num_complex::Complex64;

/// Central slice of a Fourier volume in the orientation `rotation`, limited to
/// `max_radius` Fourier pixels and sampled by trilinear interpolation.
pub fn project(volume: &Array3<Complex64>, rotation: &Rotation3<f64>, max_radius: f64) -> Array2<Complex64> {
    let n = volume.dim().0;
    let to_volume = rotation.inverse();
    Array2::from_shape_fn((n, n), |(row, col)| {
        let kx = signed_frequency(col, n) as f64;
        let ky = signed_frequency(row, n) as f64;
        if kx.hypot(ky) > max_radius {
            return Complex64::default();
        }
        trilinear(volume, to_volume * Vector3::new(kx, ky, 0.0))
    })
}

fn trilinear(volume: &Array3<Complex64>, p: Vector3<f64>) -> Complex64 {
    let n = volume.dim().0;
    let (x0, y0, z0) = (p.x.floor(), p.y.floor(), p.z.floor());
    let (fx, fy, fz) = (p.x - x0, p.y - y0, p.z - z0);
    let (x0, y0, z0) = (x0 as i64, y0 as i64, z0 as i64);

    let mut sum = Complex64::default();
    for (dz, wz) in [(0, 1.0 - fz), (1, fz)] {
        for (dy, wy) in [(0, 1.0 - fy), (1, fy)] {
            for (dx, wx) in [(0, 1.0 - fx), (1, fx)] {
                let w = wx * wy * wz;
                if w == 0.0 {
                    continue;
                }
                let index = [wrap_index(z0 + dz, n), wrap_index(y0 + dy, n), wrap_index(x0 + dx, n)];
                sum += volume[index] * w;
            }
        }
    }
    sum
}
