use crate::core::fourier::{ResolutionShells, signed_frequency};
use ndarray::Array3;
use num_complex::Complex64;

/// Gold-standard FSC threshold.
pub const FSC_THRESHOLD: f64 = 0.143;

/// Fourier shell correlation between two half-set volumes, one value per shell.
#[derive(Debug, Clone, PartialEq)]
pub struct FscCurve {
    values: Vec<f64>,
}

impl FscCurve {
    pub fn new(values: Vec<f64>) -> Self {
        Self { values }
    }

    /// Computes the FSC between two Fourier volumes of identical cubic shape.
    ///
    /// Shell 0 is defined as 1; shells without power in either volume are 0.
    pub fn between(a: &Array3<Complex64>, b: &Array3<Complex64>) -> Self {
        let n = a.dim().0;
        let shells = n / 2 + 1;
        let mut num = vec![0.0; shells];
        let mut power_a = vec![0.0; shells];
        let mut power_b = vec![0.0; shells];

        for ((z, y, x), va) in a.indexed_iter() {
            let kz = signed_frequency(z, n) as f64;
            let ky = signed_frequency(y, n) as f64;
            let kx = signed_frequency(x, n) as f64;
            let shell = (kx * kx + ky * ky + kz * kz).sqrt().round() as usize;
            if shell >= shells {
                continue;
            }
            let vb = b[[z, y, x]];
            num[shell] += (va * vb.conj()).re;
            power_a[shell] += va.norm_sqr();
            power_b[shell] += vb.norm_sqr();
        }

        let mut values: Vec<f64> = (0..shells)
            .map(|i| {
                let denom = (power_a[i] * power_b[i]).sqrt();
                if denom > 0.0 { num[i] / denom } else { 0.0 }
            })
            .collect();
        if let Some(first) = values.first_mut() {
            *first = 1.0;
        }
        Self { values }
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn get(&self, shell: usize) -> f64 {
        self.values.get(shell).copied().unwrap_or(0.0)
    }

    /// Last shell before the curve first drops below `threshold`.
    pub fn achieved_shell(&self, threshold: f64) -> usize {
        self.values
            .iter()
            .skip(1)
            .position(|&v| v < threshold)
            .unwrap_or(self.values.len().saturating_sub(1))
    }

    /// Resolution in Å at the threshold crossing.
    pub fn resolution(&self, shells: &ResolutionShells, threshold: f64) -> f64 {
        shells.resolution(self.achieved_shell(threshold))
    }

    /// Per-shell weight `sqrt(2·FSC / (1 + FSC))`; non-positive FSC gives 0.
    pub fn weights(&self) -> Vec<f64> {
        self.values.iter().map(|&fsc| fsc_weight(fsc)).collect()
    }
}

pub fn fsc_weight(fsc: f64) -> f64 {
    if fsc <= 0.0 {
        0.0
    } else {
        let fsc = fsc.min(1.0);
        (2.0 * fsc / (1.0 + fsc)).sqrt()
    }
}
