use super::outputs::{self, OutputPaths};
use crate::cli::PolishArgs;
use crate::config::PartialPolishConfig;
use crate::error::{Completion, Result};
use crate::utils::progress::CliProgressHandler;
use shiny::{
    core::{fourier::ResolutionShells, io::tables::load_experiment},
    engine::{cache::DirectoryStore, progress::ProgressReporter},
    workflows,
};
use tracing::{info, warn};

pub fn run(args: PolishArgs) -> Result<Completion> {
    let partial_config = PartialPolishConfig::load(args.run.config.as_deref())?;
    info!("Merging configuration from file and CLI arguments...");
    let resolved = partial_config.merge_with_polish_args(&args)?;
    let config = &resolved.config;

    info!(
        "Loading particles from {:?} and frame offsets from {:?}",
        &args.run.particles, &args.run.motion
    );
    let (mut experiment, frames) = load_experiment(&args.run.particles, &args.run.motion)?;
    let store = DirectoryStore::new(&resolved.cache_dir);

    let progress_handler = CliProgressHandler::new();
    let reporter = ProgressReporter::with_callback(progress_handler.get_callback());

    println!(
        "Polishing {} particle(s) from {} micrograph(s)...",
        experiment.particle_count(),
        experiment.micrograph_count()
    );
    info!("Invoking the core polishing workflow...");
    let result = workflows::polish::run(
        &mut experiment,
        &frames,
        config,
        &store,
        resolved.grouping.as_grouping(),
        &reporter,
    )?;

    let paths = OutputPaths::new(&args.run.output);
    paths.prepare()?;
    let shells = ResolutionShells::new(result.box_size, config.angpix);

    let written = outputs::write_shiny(&paths, &experiment, &result.shiny, config.angpix)?;
    outputs::write_frame_weights(&paths, &result.frame_bfactors, &result.relative_weights)?;
    outputs::write_fsc(&paths.shiny_fsc(), &result.shiny_reconstruction.fsc, &shells)?;
    if let Some(fsc) = &result.average_fsc {
        outputs::write_fsc(&paths.average_fsc(), fsc, &shells)?;
    }
    if let Some(maps) = &result.average_half_maps {
        outputs::write_average_maps(&paths, maps, config.angpix)?;
    }
    outputs::write_excluded(&paths, &experiment, &result.excluded)?;

    let summary = &result.summary;
    if let Some(report) = &result.optimisation {
        for group in &report.groups {
            match group.beam_tilt {
                Some(tilt) => println!(
                    "  Beam-tilt group '{}': tilt ({:.2}, {:.2}) mrad over {} particle(s)",
                    group.name, tilt.x, tilt.y, group.particles
                ),
                None => println!("  Beam-tilt group '{}': {} particle(s), defocus only", group.name, group.particles),
            }
        }
    }
    println!(
        "✓ {} shiny particle(s) written to {} ({} excluded, resolution {:.2} Å, {})",
        written,
        paths.shiny_table().display(),
        summary.excluded,
        result.shiny_reconstruction.achieved_resolution,
        summary.final_pass
    );
    println!(
        "  Frame reconstructions: {} computed, {} reused from {}",
        summary.reconstructions_computed,
        summary.reconstructions_cached,
        resolved.cache_dir.display()
    );

    let completion = Completion::from_issue_count(summary.counts.total());
    if let Completion::WithIssues(count) = completion {
        warn!(
            insufficient_data = summary.counts.insufficient_data,
            low_resolution_frames = summary.counts.low_resolution_frames,
            unreadable_frames = summary.counts.unreadable_frames,
            no_usable_frames = summary.counts.no_usable_frames,
            degenerate_groups = summary.counts.degenerate_groups,
            "Polishing finished with {} recoverable issue(s).",
            count
        );
        println!("Warning: {} recoverable issue(s) were recorded; see the log for details.", count);
    }
    Ok(completion)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::{Cli, Commands};
    use crate::error::CliError;
    use clap::Parser;
    use ndarray::Array2;
    use shiny::core::io::mrc::write_stack;
    use std::fs;
    use std::path::Path;
    use tempfile::tempdir;

    const BOX: usize = 16;
    const FRAMES: usize = 3;

    fn frame_image(particle: usize, frame: usize) -> Array2<f64> {
        Array2::from_shape_fn((BOX, BOX), |(r, c)| {
            ((r * 7 + c * 13 + particle * 5 + frame * 3) % 11) as f64 - 5.0
        })
    }

    /// Writes four particles on two micrographs with one movie stack each.
    fn write_dataset(dir: &Path) {
        let mut particles = String::from(
            "particle,micrograph,image_stack,coord_x,coord_y,angle_rot,angle_tilt,angle_psi,defocus_u,defocus_v,random_subset\n",
        );
        let mut motion = String::from("particle,frame,dx,dy\n");
        fs::create_dir_all(dir.join("stacks")).unwrap();
        for p in 0..4 {
            let images: Vec<_> = (0..FRAMES).map(|f| frame_image(p, f)).collect();
            write_stack(&dir.join(format!("stacks/p{p}.mrcs")), &images, 2.0).unwrap();
            particles.push_str(&format!(
                "p{p},mics/m{}.mrc,stacks/p{p}.mrcs,{},{},{},{},0,15000,15000,{}\n",
                p % 2,
                100 + 40 * p,
                200,
                30 * p,
                20 + 30 * p,
                p % 2 + 1
            ));
            for f in 0..FRAMES {
                motion.push_str(&format!("p{p},{f},{},0\n", 0.5 * f as f64));
            }
        }
        fs::write(dir.join("particles.csv"), particles).unwrap();
        fs::write(dir.join("motion.csv"), motion).unwrap();
        fs::write(
            dir.join("polish.toml"),
            "[optics]\nangpix = 2.0\n\n[ctf]\ndo-ctf = false\n\n[movement]\nrunning-average-width = 1\n",
        )
        .unwrap();
    }

    fn polish_args(dir: &Path, extra: &[&str]) -> PolishArgs {
        let mut args: Vec<String> = vec![
            "shiny".into(),
            "polish".into(),
            "-p".into(),
            dir.join("particles.csv").display().to_string(),
            "-m".into(),
            dir.join("motion.csv").display().to_string(),
            "-o".into(),
            dir.join("out/run1").display().to_string(),
        ];
        args.extend(extra.iter().map(|s| s.to_string()));
        match Cli::parse_from(args).command {
            Commands::Polish(args) => args,
            _ => panic!("Expected 'polish' subcommand"),
        }
    }

    #[test]
    fn polish_writes_every_output() {
        let dir = tempdir().unwrap();
        write_dataset(dir.path());
        let config = dir.path().join("polish.toml").display().to_string();

        let completion = run(polish_args(dir.path(), &["-c", &config])).unwrap();
        assert!(completion.exit_code() == 0 || completion.exit_code() == 2);

        let paths = OutputPaths::new(&dir.path().join("out/run1"));
        for path in [
            paths.shiny_table(),
            paths.bfactors(),
            paths.relative_weights(),
            paths.shiny_fsc(),
            paths.average_fsc(),
            paths.excluded(),
        ] {
            assert!(path.exists(), "missing {}", path.display());
        }
        assert!(paths.shiny_dir().join("mics_m0.mrcs").exists());
        assert!(paths.shiny_dir().join("mics_m1.mrcs").exists());
        assert!(dir.path().join("out/run1_cache").is_dir());

        let table = fs::read_to_string(paths.shiny_table()).unwrap();
        assert_eq!(table.lines().count(), 5);
        let bfactors = fs::read_to_string(paths.bfactors()).unwrap();
        assert_eq!(bfactors.lines().count(), FRAMES + 1);
    }

    #[test]
    fn missing_pixel_size_is_fatal() {
        let dir = tempdir().unwrap();
        write_dataset(dir.path());
        fs::write(dir.path().join("bare.toml"), "[ctf]\ndo-ctf = false\n").unwrap();
        let config = dir.path().join("bare.toml").display().to_string();

        let result = run(polish_args(dir.path(), &["-c", &config]));
        assert!(matches!(result, Err(CliError::Config(_))));
    }
}
