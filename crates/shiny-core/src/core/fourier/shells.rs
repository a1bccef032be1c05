/// Signed frequency of FFT index `index` in a transform of length `n`.
///
/// Indices up to `n / 2` are non-negative frequencies, the rest wrap to negative ones.
pub fn signed_frequency(index: usize, n: usize) -> i64 {
    if index <= n / 2 {
        index as i64
    } else {
        index as i64 - n as i64
    }
}

/// Inverse of [`signed_frequency`]: the array index holding frequency `k`.
pub fn wrap_index(k: i64, n: usize) -> usize {
    k.rem_euclid(n as i64) as usize
}

/// Resolution shells of a square box of `box_size` pixels at `angpix` Å/pixel.
///
/// Shell `i` collects the Fourier pixels whose radius rounds to `i`. Shells run from 0 (the
/// DC term) to `box_size / 2` (Nyquist); corner pixels beyond Nyquist are clamped into the
/// last shell where a shell is always required, and skipped where it is optional.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResolutionShells {
    box_size: usize,
    angpix: f64,
}

impl ResolutionShells {
    pub fn new(box_size: usize, angpix: f64) -> Self {
        Self { box_size, angpix }
    }

    pub fn box_size(&self) -> usize {
        self.box_size
    }

    pub fn angpix(&self) -> f64 {
        self.angpix
    }

    pub fn count(&self) -> usize {
        self.box_size / 2 + 1
    }

    pub fn max_shell(&self) -> usize {
        self.box_size / 2
    }

    /// Shell of a Fourier radius (in pixels), `None` beyond Nyquist.
    pub fn shell_of(&self, radius: f64) -> Option<usize> {
        let shell = radius.round() as usize;
        (shell <= self.max_shell()).then_some(shell)
    }

    pub fn clamped_shell(&self, radius: f64) -> usize {
        (radius.round() as usize).min(self.max_shell())
    }

    /// Spatial frequency of a shell in 1/Å.
    pub fn spatial_frequency(&self, shell: usize) -> f64 {
        shell as f64 / (self.box_size as f64 * self.angpix)
    }

    /// Spatial frequency per Fourier pixel step, in 1/Å.
    pub fn frequency_step(&self) -> f64 {
        1.0 / (self.box_size as f64 * self.angpix)
    }

    /// Resolution of a shell in Å (infinite for the DC shell).
    pub fn resolution(&self, shell: usize) -> f64 {
        if shell == 0 {
            f64::INFINITY
        } else {
            self.box_size as f64 * self.angpix / shell as f64
        }
    }

    /// Fourier radius in pixels that corresponds to a resolution in Å.
    pub fn radius_for_resolution(&self, angstrom: f64) -> f64 {
        self.box_size as f64 * self.angpix / angstrom
    }

    /// Shell of every voxel of a `box_size`³ Fourier volume, in `[z, y, x]` row-major order.
    pub fn voxel_shells(&self) -> Vec<usize> {
        let n = self.box_size;
        let mut shells = Vec::with_capacity(n * n * n);
        for z in 0..n {
            let kz = signed_frequency(z, n) as f64;
            for y in 0..n {
                let ky = signed_frequency(y, n) as f64;
                for x in 0..n {
                    let kx = signed_frequency(x, n) as f64;
                    shells.push(self.clamped_shell((kx * kx + ky * ky + kz * kz).sqrt()));
                }
            }
        }
        shells
    }

    /// Iterates over every pixel of a `box_size`² spectrum in row-major order.
    pub fn pixels_2d(&self) -> FourierPixels2D {
        FourierPixels2D {
            n: self.box_size,
            next: 0,
            step: self.frequency_step(),
        }
    }
}

/// A pixel of a 2-D spectrum with its signed frequencies.
///
/// `kx` runs along columns and `ky` along rows, both in Fourier pixels; `sx` and `sy` are
/// the same frequencies in 1/Å.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FourierPixel {
    pub row: usize,
    pub col: usize,
    pub kx: f64,
    pub ky: f64,
    pub radius: f64,
    pub sx: f64,
    pub sy: f64,
}

#[derive(Debug, Clone)]
pub struct FourierPixels2D {
    n: usize,
    next: usize,
    step: f64,
}

impl Iterator for FourierPixels2D {
    type Item = FourierPixel;

    fn next(&mut self) -> Option<FourierPixel> {
        if self.next >= self.n * self.n {
            return None;
        }
        let (row, col) = (self.next / self.n, self.next % self.n);
        self.next += 1;
        let kx = signed_frequency(col, self.n) as f64;
        let ky = signed_frequency(row, self.n) as f64;
        Some(FourierPixel {
            row,
            col,
            kx,
            ky,
            radius: kx.hypot(ky),
            sx: kx * self.step,
            sy: ky * self.step,
        })
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.n * self.n - self.next.min(self.n * self.n);
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for FourierPixels2D {}
