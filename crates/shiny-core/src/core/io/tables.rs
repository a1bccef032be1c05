//! CSV metadata tables: particle and per-frame offset inputs, and every tabular output.

use super::frames::{MrcStackFrames, StackLocation};
use crate::core::fitting::{BFactorFit, FitStatus, RelativeWeights};
use crate::core::models::experiment::Experiment;
use crate::core::models::ids::{HalfSet, ParticleId};
use crate::core::models::particle::{CtfParams, Orientation, Particle, TrajectorySample};
use itertools::Itertools;
use nalgebra::{Point2, Vector2};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TableError {
    #[error("File I/O error for '{path}': {source}")]
    Io { path: String, source: std::io::Error },
    #[error("CSV error for '{path}': {source}")]
    Csv { path: String, source: csv::Error },
    #[error("'{path}': unknown particle '{particle}'")]
    UnknownParticle { path: String, particle: String },
    #[error("'{path}': particle '{particle}' appears more than once")]
    DuplicateParticle { path: String, particle: String },
    #[error("'{path}': particle '{particle}' has random subset {subset}, expected 1 or 2")]
    InvalidSubset { path: String, particle: String, subset: u8 },
}

fn csv_error(path: &Path, source: csv::Error) -> TableError {
    TableError::Csv {
        path: path.to_string_lossy().to_string(),
        source,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParticleRecord {
    pub particle: String,
    pub micrograph: String,
    pub image_stack: PathBuf,
    #[serde(default)]
    pub first_slice: usize,
    pub coord_x: f64,
    pub coord_y: f64,
    #[serde(default)]
    pub origin_x: f64,
    #[serde(default)]
    pub origin_y: f64,
    pub angle_rot: f64,
    pub angle_tilt: f64,
    pub angle_psi: f64,
    pub defocus_u: f64,
    pub defocus_v: f64,
    #[serde(default)]
    pub defocus_angle: f64,
    #[serde(default)]
    pub phase_shift: f64,
    #[serde(default)]
    pub beam_tilt_x: f64,
    #[serde(default)]
    pub beam_tilt_y: f64,
    pub random_subset: u8,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameOffsetRecord {
    pub particle: String,
    pub frame: usize,
    pub dx: f64,
    pub dy: f64,
}

/// One polished particle: its updated metadata and where its shiny image was written.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ShinyRecord {
    pub particle: String,
    pub micrograph: String,
    pub image: String,
    pub coord_x: f64,
    pub coord_y: f64,
    pub origin_x: f64,
    pub origin_y: f64,
    pub angle_rot: f64,
    pub angle_tilt: f64,
    pub angle_psi: f64,
    pub defocus_u: f64,
    pub defocus_v: f64,
    pub defocus_angle: f64,
    pub phase_shift: f64,
    pub beam_tilt_x: f64,
    pub beam_tilt_y: f64,
    pub random_subset: u8,
    pub frames_used: String,
}

impl ShinyRecord {
    pub fn new(particle: &Particle, micrograph: &str, image: String, frames_used: &[usize]) -> Self {
        let frames_used = frames_used.iter().join(";");
        Self {
            particle: particle.name.clone(),
            micrograph: micrograph.to_string(),
            image,
            coord_x: particle.coordinates.x,
            coord_y: particle.coordinates.y,
            origin_x: particle.origin.x,
            origin_y: particle.origin.y,
            angle_rot: particle.orientation.rot,
            angle_tilt: particle.orientation.tilt,
            angle_psi: particle.orientation.psi,
            defocus_u: particle.ctf.defocus_u,
            defocus_v: particle.ctf.defocus_v,
            defocus_angle: particle.ctf.defocus_angle,
            phase_shift: particle.ctf.phase_shift,
            beam_tilt_x: particle.ctf.beam_tilt.x,
            beam_tilt_y: particle.ctf.beam_tilt.y,
            random_subset: particle.half.number(),
            frames_used,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BfactorRecord {
    pub frame: usize,
    pub bfactor: f64,
    pub offset: f64,
    pub corr_coeff: f64,
    pub status: FitStatus,
}

impl BfactorRecord {
    pub fn new(frame: usize, fit: &BFactorFit) -> Self {
        Self {
            frame,
            bfactor: fit.bfactor,
            offset: fit.offset,
            corr_coeff: fit.corr_coeff,
            status: fit.status,
        }
    }

    pub fn fit(&self) -> BFactorFit {
        BFactorFit {
            bfactor: self.bfactor,
            offset: self.offset,
            corr_coeff: self.corr_coeff,
            status: self.status,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct FscRecord {
    pub shell: usize,
    pub resolution: f64,
    pub fsc: f64,
    pub weight: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExcludedRecord {
    pub particle: String,
    pub micrograph: String,
    pub reason: String,
}

fn read_records<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<Vec<T>, TableError> {
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_path(path)
        .map_err(|e| csv_error(path, e))?;
    reader
        .deserialize()
        .map(|record| record.map_err(|e| csv_error(path, e)))
        .collect()
}

pub fn write_records<T: Serialize>(path: &Path, records: &[T]) -> Result<(), TableError> {
    let mut writer = csv::Writer::from_path(path).map_err(|e| csv_error(path, e))?;
    for record in records {
        writer.serialize(record).map_err(|e| csv_error(path, e))?;
    }
    writer.flush().map_err(|e| TableError::Io {
        path: path.to_string_lossy().to_string(),
        source: e,
    })
}

pub fn read_bfactors(path: &Path) -> Result<Vec<BfactorRecord>, TableError> {
    read_records(path)
}

/// Writes the weight table with one row per frame and one `shell_<i>` column per shell.
pub fn write_relative_weights(path: &Path, weights: &RelativeWeights) -> Result<(), TableError> {
    let mut writer = csv::Writer::from_path(path).map_err(|e| csv_error(path, e))?;
    let mut header = vec!["frame".to_string()];
    header.extend((0..weights.shell_count()).map(|i| format!("shell_{i}")));
    writer.write_record(&header).map_err(|e| csv_error(path, e))?;
    for (frame, row) in weights.frames().iter().zip(weights.table().rows()) {
        let mut record = vec![frame.to_string()];
        record.extend(row.iter().map(|w| format!("{w:.6e}")));
        writer.write_record(&record).map_err(|e| csv_error(path, e))?;
    }
    writer.flush().map_err(|e| TableError::Io {
        path: path.to_string_lossy().to_string(),
        source: e,
    })
}

/// Loads particles and their per-frame offsets into a new experiment.
///
/// Relative `image_stack` paths are resolved against the directory of the particle table.
pub fn load_experiment(particles_path: &Path, frames_path: &Path) -> Result<(Experiment, MrcStackFrames), TableError> {
    let display = |p: &Path| p.to_string_lossy().to_string();
    let base = particles_path.parent().unwrap_or(Path::new("")).to_path_buf();

    let mut experiment = Experiment::new();
    let mut stacks = MrcStackFrames::new();
    let mut by_name: HashMap<String, ParticleId> = HashMap::new();

    for record in read_records::<ParticleRecord>(particles_path)? {
        let half = HalfSet::from_number(record.random_subset).ok_or_else(|| TableError::InvalidSubset {
            path: display(particles_path),
            particle: record.particle.clone(),
            subset: record.random_subset,
        })?;
        if by_name.contains_key(&record.particle) {
            return Err(TableError::DuplicateParticle {
                path: display(particles_path),
                particle: record.particle,
            });
        }
        let mic = experiment.add_micrograph(&record.micrograph);
        let id = experiment.add_particle(mic, &record.particle, half);
        if let Some(particle) = experiment.particle_mut(id) {
            particle.coordinates = Point2::new(record.coord_x, record.coord_y);
            particle.origin = Vector2::new(record.origin_x, record.origin_y);
            particle.orientation = Orientation::new(record.angle_rot, record.angle_tilt, record.angle_psi);
            particle.ctf = CtfParams {
                defocus_u: record.defocus_u,
                defocus_v: record.defocus_v,
                defocus_angle: record.defocus_angle,
                phase_shift: record.phase_shift,
                beam_tilt: Vector2::new(record.beam_tilt_x, record.beam_tilt_y),
            };
        }
        let path = if record.image_stack.is_absolute() {
            record.image_stack
        } else {
            base.join(record.image_stack)
        };
        stacks.insert(id, StackLocation { path, first_slice: record.first_slice });
        by_name.insert(record.particle, id);
    }

    let mut samples: HashMap<ParticleId, Vec<TrajectorySample>> = HashMap::new();
    for record in read_records::<FrameOffsetRecord>(frames_path)? {
        let id = *by_name.get(&record.particle).ok_or_else(|| TableError::UnknownParticle {
            path: display(frames_path),
            particle: record.particle.clone(),
        })?;
        samples
            .entry(id)
            .or_default()
            .push(TrajectorySample::new(record.frame, record.dx, record.dy));
    }
    for (id, offsets) in samples {
        if let Some(particle) = experiment.particle_mut(id) {
            particle.set_offsets(offsets);
        }
    }

    Ok((experiment, stacks))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    const PARTICLES: &str = "\
particle,micrograph,image_stack,coord_x,coord_y,angle_rot,angle_tilt,angle_psi,defocus_u,defocus_v,random_subset
p1,mics/a.mrc,stacks/p1.mrcs,10,20,0,90,0,15000,14000,1
p2,mics/a.mrc,/abs/p2.mrcs,30,40,10,20,30,16000,16000,2
p3,mics/b.mrc,stacks/p3.mrcs,50,60,0,0,0,15000,15000,1
";

    const FRAMES: &str = "\
particle,frame,dx,dy
p1,1,0.1,0.2
p1,0,0.0,0.0
p2,0,1.0,-1.0
";

    #[test]
    fn experiment_is_loaded_with_offsets_and_stacks() {
        let dir = tempdir().unwrap();
        let particles = dir.path().join("particles.csv");
        let frames = dir.path().join("frames.csv");
        fs::write(&particles, PARTICLES).unwrap();
        fs::write(&frames, FRAMES).unwrap();

        let (exp, stacks) = load_experiment(&particles, &frames).unwrap();
        assert_eq!(exp.particle_count(), 3);
        assert_eq!(exp.micrograph_count(), 2);

        let p1 = exp.particle(ParticleId(0)).unwrap();
        assert_eq!(p1.half, HalfSet::One);
        assert_eq!(p1.orientation.tilt, 90.0);
        assert_eq!(p1.ctf.defocus_v, 14000.0);
        assert_eq!(p1.offsets().len(), 2);
        assert_eq!(p1.offsets()[0].frame, 0);
        assert_eq!(stacks.location(ParticleId(0)).unwrap().path, dir.path().join("stacks/p1.mrcs"));
        assert_eq!(stacks.location(ParticleId(1)).unwrap().path, PathBuf::from("/abs/p2.mrcs"));
        assert!(exp.particle(ParticleId(2)).unwrap().offsets().is_empty());
    }

    #[test]
    fn unknown_particles_in_frame_table_are_rejected() {
        let dir = tempdir().unwrap();
        let particles = dir.path().join("particles.csv");
        let frames = dir.path().join("frames.csv");
        fs::write(&particles, PARTICLES).unwrap();
        fs::write(&frames, "particle,frame,dx,dy\nghost,0,0,0\n").unwrap();
        let result = load_experiment(&particles, &frames);
        assert!(matches!(result, Err(TableError::UnknownParticle { .. })));
    }

    #[test]
    fn invalid_subset_is_rejected() {
        let dir = tempdir().unwrap();
        let particles = dir.path().join("particles.csv");
        let frames = dir.path().join("frames.csv");
        fs::write(
            &particles,
            "particle,micrograph,image_stack,coord_x,coord_y,angle_rot,angle_tilt,angle_psi,defocus_u,defocus_v,random_subset\np,m,s.mrcs,0,0,0,0,0,1,1,3\n",
        )
        .unwrap();
        fs::write(&frames, "particle,frame,dx,dy\n").unwrap();
        assert!(matches!(load_experiment(&particles, &frames), Err(TableError::InvalidSubset { subset: 3, .. })));
    }

    #[test]
    fn missing_table_is_a_csv_error() {
        let dir = tempdir().unwrap();
        let result = load_experiment(&dir.path().join("none.csv"), &dir.path().join("none2.csv"));
        assert!(matches!(result, Err(TableError::Csv { .. })));
    }

    #[test]
    fn bfactor_table_round_trips() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bfactors.csv");
        let fit = BFactorFit { bfactor: -42.5, offset: 0.25, corr_coeff: 0.9, status: FitStatus::Fitted };
        let records = vec![BfactorRecord::new(0, &fit), BfactorRecord::new(1, &BFactorFit::fallback(-50.0, 0.0))];
        write_records(&path, &records).unwrap();
        let back = read_bfactors(&path).unwrap();
        assert_eq!(back, records);
        assert!(fs::read_to_string(&path).unwrap().contains("fallback"));
    }

    #[test]
    fn relative_weights_table_has_one_column_per_shell() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("weights.csv");
        write_relative_weights(&path, &RelativeWeights::uniform(vec![0, 1], 3)).unwrap();
        let text = fs::read_to_string(&path).unwrap();
        let mut lines = text.lines();
        assert_eq!(lines.next(), Some("frame,shell_0,shell_1,shell_2"));
        assert!(lines.next().unwrap().starts_with("0,5.000000e-1"));
    }
}
