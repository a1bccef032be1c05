use super::regression::{FitPoint, RegressionError, fit_straight_line};
use crate::core::fourier::ResolutionShells;
use crate::core::reconstruction::{FSC_THRESHOLD, FscCurve, fsc_weight};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FitStatus {
    Fitted,
    Fallback,
}

/// Guinier-plot fit of one frame: `ln C(s) ≈ offset + bfactor · s² / 4`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BFactorFit {
    pub bfactor: f64,
    pub offset: f64,
    pub corr_coeff: f64,
    pub status: FitStatus,
}

impl BFactorFit {
    pub fn fallback(bfactor: f64, offset: f64) -> Self {
        Self {
            bfactor,
            offset,
            corr_coeff: 0.0,
            status: FitStatus::Fallback,
        }
    }

    /// Natural log of the (unnormalised) frame weight at spatial frequency `s` (1/Å).
    pub fn log_weight(&self, s: f64) -> f64 {
        self.offset + self.bfactor * s * s / 4.0
    }
}

/// Guinier points `(s², ln C)` with `C = sqrt(2·FSC / (1 + FSC))`.
///
/// Only shells with `s ≥ 1/fit_minres`, up to both the FSC threshold crossing and
/// `highres_shell`, and with positive FSC take part.
pub fn guinier_points(fsc: &FscCurve, shells: &ResolutionShells, fit_minres: f64, highres_shell: usize) -> Vec<FitPoint> {
    let last = fsc.achieved_shell(FSC_THRESHOLD).min(highres_shell);
    let min_frequency = 1.0 / fit_minres;
    (1..=last)
        .filter_map(|shell| {
            let s = shells.spatial_frequency(shell);
            let value = fsc.get(shell);
            (s >= min_frequency && value > 0.0).then(|| FitPoint::new(s * s, fsc_weight(value).ln()))
        })
        .collect()
}

pub fn fit_guinier(
    fsc: &FscCurve,
    shells: &ResolutionShells,
    fit_minres: f64,
    highres_shell: usize,
) -> Result<BFactorFit, RegressionError> {
    let line = fit_straight_line(&guinier_points(fsc, shells, fit_minres, highres_shell))?;
    Ok(BFactorFit {
        bfactor: 4.0 * line.slope,
        offset: line.intercept,
        corr_coeff: line.corr_coeff,
        status: FitStatus::Fitted,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn perfect_fsc_gives_flat_fit() {
        let shells = ResolutionShells::new(64, 1.0);
        let fsc = FscCurve::new(vec![1.0; 33]);
        let fit = fit_guinier(&fsc, &shells, 20.0, 32).unwrap();
        assert!(fit.bfactor.abs() < 1e-9);
        assert!(fit.offset.abs() < 1e-12);
        assert_eq!(fit.corr_coeff, 1.0);
        assert_eq!(fit.status, FitStatus::Fitted);
    }

    #[test]
    fn synthetic_decay_recovers_bfactor() {
        let shells = ResolutionShells::new(64, 1.0);
        let bfactor = -80.0;
        let values: Vec<f64> = (0..33)
            .map(|i| {
                let s = shells.spatial_frequency(i);
                let c = (bfactor * s * s / 4.0).exp();
                // invert C = sqrt(2F/(1+F))
                c * c / (2.0 - c * c)
            })
            .collect();
        let fit = fit_guinier(&FscCurve::new(values), &shells, 20.0, 32).unwrap();
        assert!((fit.bfactor - bfactor).abs() < 1e-6, "B = {}", fit.bfactor);
        assert!((fit.corr_coeff - 1.0).abs() < 1e-9);
    }

    #[test]
    fn low_resolution_curve_has_too_few_points() {
        let shells = ResolutionShells::new(32, 2.0);
        let mut values = vec![0.0; 17];
        values[0] = 1.0;
        values[1] = 0.9;
        let result = fit_guinier(&FscCurve::new(values), &shells, 20.0, 16);
        assert!(matches!(result, Err(RegressionError::TooFewPoints(_))));
    }

    #[test]
    fn points_respect_low_resolution_limit() {
        let shells = ResolutionShells::new(40, 1.0);
        let fsc = FscCurve::new(vec![1.0; 21]);
        let points = guinier_points(&fsc, &shells, 10.0, 20);
        assert_eq!(points.len(), 17);
        assert!((points[0].x - 0.01).abs() < 1e-12);
    }
}
