//! Curve fitting: straight-line regression, Guinier B-factors and frame weights.

pub mod guinier;
pub mod regression;
pub mod weights;

pub use guinier::{BFactorFit, FitStatus, fit_guinier, guinier_points};
pub use regression::{FitPoint, LineFit, RegressionError, fit_straight_line};
pub use weights::RelativeWeights;
