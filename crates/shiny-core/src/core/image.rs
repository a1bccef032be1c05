//! Real-space image post-processing for polished particles.

use nalgebra::{Matrix3, Vector3};
use ndarray::Array2;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NormalisationSettings {
    pub bg_radius: f64, // pixels; background lies strictly outside this radius
    pub do_ramp: bool,
    pub white_dust_stddev: f64,
    pub black_dust_stddev: f64,
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum NormaliseError {
    #[error("background radius {radius} leaves fewer than {min} background pixels in a {box_size}px box")]
    TooFewBackgroundPixels { radius: f64, box_size: usize, min: usize },
}

const MIN_BACKGROUND_PIXELS: usize = 3;

fn centred(row: usize, col: usize, n: usize) -> (f64, f64) {
    let half = (n / 2) as f64;
    (col as f64 - half, row as f64 - half)
}

fn background_pixels(image: &Array2<f64>, radius: f64) -> Vec<(f64, f64, f64)> {
    let n = image.nrows();
    image
        .indexed_iter()
        .filter_map(|((row, col), &value)| {
            let (x, y) = centred(row, col, n);
            (x * x + y * y > radius * radius).then_some((x, y, value))
        })
        .collect()
}

/// Least-squares plane `a·x + b·y + c` through the background pixels.
fn fit_ramp(background: &[(f64, f64, f64)]) -> Option<Vector3<f64>> {
    let mut normal = Matrix3::zeros();
    let mut rhs = Vector3::zeros();
    for &(x, y, v) in background {
        let basis = Vector3::new(x, y, 1.0);
        normal += basis * basis.transpose();
        rhs += basis * v;
    }
    normal.lu().solve(&rhs)
}

/// Normalises an image in place against its background.
///
/// Optionally subtracts a fitted ramp, then maps the background to zero mean and unit
/// standard deviation and clips outliers ("dust") above `white_dust_stddev` or below
/// `-black_dust_stddev`. Non-positive dust thresholds disable clipping.
pub fn normalise(image: &mut Array2<f64>, settings: &NormalisationSettings) -> Result<(), NormaliseError> {
    let n = image.nrows();
    let mut background = background_pixels(image, settings.bg_radius);
    if background.len() < MIN_BACKGROUND_PIXELS {
        return Err(NormaliseError::TooFewBackgroundPixels {
            radius: settings.bg_radius,
            box_size: n,
            min: MIN_BACKGROUND_PIXELS,
        });
    }

    if settings.do_ramp {
        if let Some(plane) = fit_ramp(&background) {
            for ((row, col), value) in image.indexed_iter_mut() {
                let (x, y) = centred(row, col, n);
                *value -= plane.x * x + plane.y * y + plane.z;
            }
            background = background_pixels(image, settings.bg_radius);
        }
    }

    let count = background.len() as f64;
    let mean = background.iter().map(|p| p.2).sum::<f64>() / count;
    let variance = background.iter().map(|p| (p.2 - mean).powi(2)).sum::<f64>() / count;
    let stddev = variance.sqrt();
    let scale = if stddev > 0.0 { 1.0 / stddev } else { 1.0 };
    image.mapv_inplace(|v| (v - mean) * scale);

    clip_dust(image, settings.white_dust_stddev, settings.black_dust_stddev);
    Ok(())
}

pub fn clip_dust(image: &mut Array2<f64>, white: f64, black: f64) {
    if white > 0.0 {
        image.mapv_inplace(|v| v.min(white));
    }
    if black > 0.0 {
        image.mapv_inplace(|v| v.max(-black));
    }
}
