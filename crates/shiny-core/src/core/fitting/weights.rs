use super::guinier::BFactorFit;
use crate::core::fourier::ResolutionShells;
use ndarray::{Array2, ArrayView1};

/// Per-frame, per-shell relative weights.
///
/// One row per frame, one column per resolution shell. Every column sums to one across
/// frames, so a weighted combination of frames keeps the overall signal level.
#[derive(Debug, Clone, PartialEq)]
pub struct RelativeWeights {
    frames: Vec<usize>,
    table: Array2<f64>,
}

impl RelativeWeights {
    /// Equal weights for every frame at every shell.
    pub fn uniform(frames: Vec<usize>, shell_count: usize) -> Self {
        let value = if frames.is_empty() { 0.0 } else { 1.0 / frames.len() as f64 };
        let table = Array2::from_elem((frames.len(), shell_count), value);
        Self { frames, table }
    }

    /// Weights `exp(offset_f + B_f · s² / 4)` normalised per shell across frames.
    pub fn from_bfactors(fits: &[(usize, BFactorFit)], shells: &ResolutionShells) -> Self {
        let frames: Vec<usize> = fits.iter().map(|(frame, _)| *frame).collect();
        let mut table = Array2::zeros((frames.len(), shells.count()));
        for shell in 0..shells.count() {
            let s = shells.spatial_frequency(shell);
            let logs: Vec<f64> = fits.iter().map(|(_, fit)| fit.log_weight(s)).collect();
            let max = logs.iter().copied().fold(f64::NEG_INFINITY, f64::max);
            let raw: Vec<f64> = logs.iter().map(|l| (l - max).exp()).collect();
            let total: f64 = raw.iter().sum();
            for (row, value) in raw.iter().enumerate() {
                table[[row, shell]] = if total > 0.0 { value / total } else { 0.0 };
            }
        }
        Self { frames, table }
    }

    /// Rebuilds weights from a stored table (rows in `frames` order).
    pub fn from_table(frames: Vec<usize>, table: Array2<f64>) -> Option<Self> {
        (table.nrows() == frames.len()).then_some(Self { frames, table })
    }

    pub fn frames(&self) -> &[usize] {
        &self.frames
    }

    pub fn table(&self) -> &Array2<f64> {
        &self.table
    }

    pub fn shell_count(&self) -> usize {
        self.table.ncols()
    }

    pub fn row(&self, frame: usize) -> Option<ArrayView1<'_, f64>> {
        self.frames.iter().position(|&f| f == frame).map(|i| self.table.row(i))
    }

    /// Weight of `frame` at `shell`; shells past the table are clamped to the last column.
    pub fn weight(&self, frame: usize, shell: usize) -> Option<f64> {
        let last = self.shell_count().checked_sub(1)?;
        self.row(frame).map(|row| row[shell.min(last)])
    }
}
