use crate::error::{CliError, Result};
use ndarray::Array3;
use shiny::core::fitting::{BFactorFit, RelativeWeights};
use shiny::core::fourier::ResolutionShells;
use shiny::core::io::mrc::{write_stack, write_volume};
use shiny::core::io::tables::{
    BfactorRecord, ExcludedRecord, FscRecord, ShinyRecord, write_records, write_relative_weights,
};
use shiny::core::models::experiment::Experiment;
use shiny::core::models::ids::{HalfSet, ParticleId};
use shiny::core::reconstruction::{FscCurve, fsc_weight};
use shiny::engine::tasks::polish::ShinyParticle;
use shiny::workflows::polish::ExcludedParticle;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// File names derived from one output root, e.g. `run1` gives `run1_shiny.csv`.
#[derive(Debug, Clone)]
pub struct OutputPaths {
    root: PathBuf,
}

impl OutputPaths {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
        }
    }

    fn with_suffix(&self, suffix: &str) -> PathBuf {
        PathBuf::from(format!("{}{}", self.root.display(), suffix))
    }

    pub fn shiny_table(&self) -> PathBuf {
        self.with_suffix("_shiny.csv")
    }

    pub fn shiny_dir(&self) -> PathBuf {
        self.with_suffix("_shiny")
    }

    pub fn bfactors(&self) -> PathBuf {
        self.with_suffix("_bfactors.csv")
    }

    pub fn relative_weights(&self) -> PathBuf {
        self.with_suffix("_relweights.csv")
    }

    pub fn shiny_fsc(&self) -> PathBuf {
        self.with_suffix("_shiny_fsc.csv")
    }

    pub fn average_fsc(&self) -> PathBuf {
        self.with_suffix("_avgframe_fsc.csv")
    }

    pub fn average_half_map(&self, half: HalfSet) -> PathBuf {
        self.with_suffix(&format!("_avgframe_half{}.mrc", half.number()))
    }

    pub fn excluded(&self) -> PathBuf {
        self.with_suffix("_excluded.csv")
    }

    /// Creates the directory the root lives in.
    pub fn prepare(&self) -> Result<()> {
        if let Some(parent) = self.root.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        Ok(())
    }
}

/// Stack file name for a micrograph: directory separators flattened, extension replaced.
fn stack_name(micrograph: &str) -> String {
    let stem = match micrograph.rsplit_once('.') {
        Some((stem, ext)) if !ext.contains(['/', '\\']) && !stem.is_empty() => stem,
        _ => micrograph,
    };
    format!("{}.mrcs", stem.replace(['/', '\\'], "_"))
}

fn writing_error(path: &Path, source: impl Into<anyhow::Error>) -> CliError {
    CliError::FileWriting {
        path: path.to_path_buf(),
        source: source.into(),
    }
}

/// Writes one MRC stack of polished images per micrograph plus the shiny particle table.
/// Image references are `<index>@<stack>` with 1-based indices.
pub fn write_shiny(paths: &OutputPaths, experiment: &Experiment, shiny: &[ShinyParticle], angpix: f64) -> Result<usize> {
    let by_particle: HashMap<ParticleId, &ShinyParticle> = shiny.iter().map(|s| (s.particle, s)).collect();
    let dir = paths.shiny_dir();
    std::fs::create_dir_all(&dir)?;

    let mut records = Vec::with_capacity(shiny.len());
    for micrograph in experiment.micrographs() {
        let members: Vec<_> = experiment
            .particles_in(micrograph.id)
            .filter_map(|p| by_particle.get(&p.id).map(|s| (p, *s)))
            .collect();
        if members.is_empty() {
            continue;
        }
        let stack_path = dir.join(stack_name(&micrograph.name));
        let images: Vec<_> = members.iter().map(|(_, s)| s.image.clone()).collect();
        write_stack(&stack_path, &images, angpix).map_err(|e| writing_error(&stack_path, e))?;
        debug!(micrograph = %micrograph.name, particles = members.len(), path = %stack_path.display(), "Shiny stack written.");

        for (index, (particle, shiny)) in members.iter().enumerate() {
            let image = format!("{}@{}", index + 1, stack_path.display());
            records.push(ShinyRecord::new(particle, &micrograph.name, image, &shiny.frames_used));
        }
    }

    let table = paths.shiny_table();
    write_records(&table, &records)?;
    info!(particles = records.len(), path = %table.display(), "Shiny particle table written.");
    Ok(records.len())
}

pub fn write_frame_weights(
    paths: &OutputPaths,
    frame_bfactors: &[(usize, BFactorFit)],
    weights: &RelativeWeights,
) -> Result<()> {
    let records: Vec<BfactorRecord> = frame_bfactors
        .iter()
        .map(|(frame, fit)| BfactorRecord::new(*frame, fit))
        .collect();
    write_records(&paths.bfactors(), &records)?;
    write_relative_weights(&paths.relative_weights(), weights)?;
    Ok(())
}

pub fn write_fsc(path: &Path, fsc: &FscCurve, shells: &ResolutionShells) -> Result<()> {
    let records: Vec<FscRecord> = fsc
        .values()
        .iter()
        .enumerate()
        .map(|(shell, &value)| FscRecord {
            shell,
            resolution: shells.resolution(shell),
            fsc: value,
            weight: fsc_weight(value),
        })
        .collect();
    write_records(path, &records)?;
    Ok(())
}

pub fn write_average_maps(paths: &OutputPaths, maps: &[Array3<f64>; 2], angpix: f64) -> Result<()> {
    for (half, map) in HalfSet::BOTH.into_iter().zip(maps) {
        let path = paths.average_half_map(half);
        write_volume(&path, map, angpix).map_err(|e| writing_error(&path, e))?;
    }
    Ok(())
}

pub fn write_excluded(paths: &OutputPaths, experiment: &Experiment, excluded: &[ExcludedParticle]) -> Result<()> {
    let records: Vec<ExcludedRecord> = excluded
        .iter()
        .filter_map(|e| {
            let particle = experiment.particle(e.particle)?;
            let micrograph = experiment.micrograph(particle.micrograph)?;
            Some(ExcludedRecord {
                particle: particle.name.clone(),
                micrograph: micrograph.name.clone(),
                reason: e.reason.clone(),
            })
        })
        .collect();
    write_records(&paths.excluded(), &records)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;
    use shiny::core::io::mrc::read_header;
    use tempfile::tempdir;

    #[test]
    fn output_names_share_the_root() {
        let paths = OutputPaths::new(Path::new("out/run1"));
        assert_eq!(paths.shiny_table(), PathBuf::from("out/run1_shiny.csv"));
        assert_eq!(paths.shiny_dir(), PathBuf::from("out/run1_shiny"));
        assert_eq!(paths.average_half_map(HalfSet::Two), PathBuf::from("out/run1_avgframe_half2.mrc"));
        assert_eq!(paths.excluded(), PathBuf::from("out/run1_excluded.csv"));
    }

    #[test]
    fn stack_names_flatten_directories() {
        assert_eq!(stack_name("mics/session1/mic_001.mrc"), "mics_session1_mic_001.mrcs");
        assert_eq!(stack_name("mic_002"), "mic_002.mrcs");
        assert_eq!(stack_name("run.1/mic"), "run.1_mic.mrcs");
    }

    #[test]
    fn shiny_particles_are_stacked_per_micrograph() {
        let dir = tempdir().unwrap();
        let paths = OutputPaths::new(&dir.path().join("run1"));

        let mut experiment = Experiment::new();
        let a = experiment.add_micrograph("mics/a.mrc");
        let b = experiment.add_micrograph("mics/b.mrc");
        let p0 = experiment.add_particle(a, "p0", HalfSet::One);
        let p1 = experiment.add_particle(b, "p1", HalfSet::Two);
        let p2 = experiment.add_particle(a, "p2", HalfSet::Two);
        let shiny: Vec<ShinyParticle> = [p0, p1, p2]
            .into_iter()
            .map(|particle| ShinyParticle {
                particle,
                image: Array2::from_elem((8, 8), particle.0 as f64),
                frames_used: vec![0, 1],
            })
            .collect();

        let written = write_shiny(&paths, &experiment, &shiny, 1.5).unwrap();
        assert_eq!(written, 3);

        let stack_a = paths.shiny_dir().join("mics_a.mrcs");
        assert_eq!(read_header(&stack_a).unwrap().nz, 2);
        assert_eq!(read_header(&paths.shiny_dir().join("mics_b.mrcs")).unwrap().nz, 1);

        let table = std::fs::read_to_string(paths.shiny_table()).unwrap();
        assert!(table.contains(&format!("2@{}", stack_a.display())));
        assert!(table.contains("0;1"));
    }
}
