#![allow(dead_code)]

use ndarray::{Array2, Array3};
use num_complex::Complex64;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use shiny::core::ctf::CtfCorrection;
use shiny::core::fourier::{FourierTransformer, RustFftTransformer};
use shiny::core::io::frames::InMemoryFrames;
use shiny::core::models::experiment::Experiment;
use shiny::core::models::ids::{HalfSet, ParticleId};
use shiny::core::models::particle::{Orientation, TrajectorySample};
use shiny::core::reconstruction::project;
use shiny::engine::config::{FitMode, MovementConfig, PolishConfigBuilder};

pub const BOX: usize = 16;
pub const FRAMES: usize = 5;
pub const ANGPIX: f64 = 2.0;

pub struct Dataset {
    pub experiment: Experiment,
    pub frames: InMemoryFrames,
}

impl Dataset {
    /// Adds a particle with motion estimates but no frame images.
    pub fn add_particle_without_frames(&mut self, name: &str) -> ParticleId {
        let mic = self.experiment.add_micrograph("mics/empty.mrc");
        let id = self.experiment.add_particle(mic, name, HalfSet::One);
        self.experiment
            .particle_mut(id)
            .unwrap()
            .set_offsets((0..FRAMES).map(|f| TrajectorySample::new(f, 0.0, 0.0)).collect());
        id
    }
}

fn random_density(seed: u64) -> Array3<f64> {
    let mut rng = StdRng::seed_from_u64(seed);
    Array3::from_shape_fn((BOX, BOX, BOX), |_| rng.gen_range(-1.0..1.0))
}

fn rolled(image: &Array2<f64>, dx: i64, dy: i64) -> Array2<f64> {
    let n = BOX as i64;
    Array2::from_shape_fn((BOX, BOX), |(row, col)| {
        let r = (row as i64 - dy).rem_euclid(n) as usize;
        let c = (col as i64 - dx).rem_euclid(n) as usize;
        image[[r, c]]
    })
}

/// Noise-free projections of one random volume, drifting linearly by whole pixels.
///
/// Particles alternate between half sets and are spread over two micrographs; every
/// particle has `FRAMES` frames and matching motion estimates.
pub fn dataset(particles: usize, all_in_half_one: bool) -> Dataset {
    let fft = RustFftTransformer::new(BOX);
    let volume: Array3<Complex64> = fft.forward_3d(&random_density(7));
    let mut rng = StdRng::seed_from_u64(21);
    let mut experiment = Experiment::new();
    let mut frames = InMemoryFrames::new();

    for i in 0..particles {
        let mic = experiment.add_micrograph(if i % 2 == 0 { "mics/a.mrc" } else { "mics/b.mrc" });
        let half = if all_in_half_one || i % 2 == 0 { HalfSet::One } else { HalfSet::Two };
        let id = experiment.add_particle(mic, &format!("particle{i:03}"), half);
        let orientation = Orientation::new(
            rng.gen_range(-180.0..180.0),
            rng.gen_range(0.0..180.0),
            rng.gen_range(-180.0..180.0),
        );
        let image = fft.inverse_2d(&project(&volume, &orientation.rotation(), (BOX / 2 - 1) as f64));
        let drift = (i % 3) as i64 - 1;

        let particle = experiment.particle_mut(id).unwrap();
        particle.orientation = orientation;
        particle.set_offsets(
            (0..FRAMES)
                .map(|f| TrajectorySample::new(f, (drift * f as i64) as f64, -(f as f64)))
                .collect(),
        );
        frames.insert(
            id,
            (0..FRAMES as i64).map(|f| rolled(&image, drift * f, -f)).collect(),
        );
    }
    Dataset { experiment, frames }
}

/// Settings matching the synthetic data: no CTF, exact linear drift.
pub fn builder() -> PolishConfigBuilder {
    PolishConfigBuilder::new()
        .angpix(ANGPIX)
        .ctf_correction(CtfCorrection {
            do_ctf: false,
            ..CtfCorrection::default()
        })
        .movement(MovementConfig {
            fit_mode: FitMode::Linear,
            running_average_width: 1,
            sigma_neighbour_distance: 0.0,
        })
}
