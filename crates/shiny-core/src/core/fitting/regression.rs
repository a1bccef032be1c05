//! Weighted straight-line least squares.
//!
//! Both consumers in this crate fit `y = slope · x + intercept`: trajectory smoothing
//! (offset against a time abscissa) and Guinier plots (`ln C` against `s²`). The closed
//! form on centred sums is used throughout.

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FitPoint {
    pub x: f64,
    pub y: f64,
    pub w: f64,
}

impl FitPoint {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y, w: 1.0 }
    }

    pub fn weighted(x: f64, y: f64, w: f64) -> Self {
        Self { x, y, w }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LineFit {
    pub slope: f64,
    pub intercept: f64,
    /// Weighted coefficient of determination R². A perfectly fitted flat line counts as 1.
    pub corr_coeff: f64,
}

impl LineFit {
    pub fn at(&self, x: f64) -> f64 {
        self.slope * x + self.intercept
    }
}

#[derive(Debug, Error, Clone, Copy, PartialEq)]
pub enum RegressionError {
    #[error("at least two weighted points are required, got {0}")]
    TooFewPoints(usize),
    #[error("all abscissa values coincide")]
    DegenerateAbscissa,
}

/// Fits a straight line through the points with positive finite weight.
pub fn fit_straight_line(points: &[FitPoint]) -> Result<LineFit, RegressionError> {
    let usable: Vec<&FitPoint> = points
        .iter()
        .filter(|p| p.w > 0.0 && p.w.is_finite() && p.x.is_finite() && p.y.is_finite())
        .collect();
    if usable.len() < 2 {
        return Err(RegressionError::TooFewPoints(usable.len()));
    }

    let sw: f64 = usable.iter().map(|p| p.w).sum();
    let mx = usable.iter().map(|p| p.w * p.x).sum::<f64>() / sw;
    let my = usable.iter().map(|p| p.w * p.y).sum::<f64>() / sw;

    let (mut sxx, mut sxy, mut syy, mut xx, mut yy) = (0.0, 0.0, 0.0, 0.0, 0.0);
    for p in &usable {
        let (dx, dy) = (p.x - mx, p.y - my);
        sxx += p.w * dx * dx;
        sxy += p.w * dx * dy;
        syy += p.w * dy * dy;
        xx += p.w * p.x * p.x;
        yy += p.w * p.y * p.y;
    }

    if sxx <= f64::EPSILON * xx {
        return Err(RegressionError::DegenerateAbscissa);
    }

    let slope = sxy / sxx;
    let intercept = my - slope * mx;
    let corr_coeff = if syy <= f64::EPSILON * yy.max(f64::MIN_POSITIVE) {
        1.0
    } else {
        (sxy * sxy / (sxx * syy)).clamp(0.0, 1.0)
    };

    Ok(LineFit {
        slope,
        intercept,
        corr_coeff,
    })
}
