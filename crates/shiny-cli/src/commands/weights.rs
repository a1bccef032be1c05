use super::outputs::{self, OutputPaths};
use crate::cli::WeightsArgs;
use crate::config::PartialPolishConfig;
use crate::error::{Completion, Result};
use crate::utils::progress::CliProgressHandler;
use shiny::{
    core::{fourier::ResolutionShells, io::tables::load_experiment},
    engine::{cache::DirectoryStore, progress::ProgressReporter},
    workflows,
};
use tracing::{info, warn};

pub fn run(args: WeightsArgs) -> Result<Completion> {
    let resolved = PartialPolishConfig::load(args.run.config.as_deref())?.merge_with_weights_args(&args)?;
    let config = &resolved.config;

    let (mut experiment, frames) = load_experiment(&args.run.particles, &args.run.motion)?;
    let store = DirectoryStore::new(&resolved.cache_dir);

    let progress_handler = CliProgressHandler::new();
    let reporter = ProgressReporter::with_callback(progress_handler.get_callback());

    println!("Estimating frame weights for {} particle(s)...", experiment.particle_count());
    info!("Invoking the frame-weighting workflow...");
    let result = workflows::polish::estimate_frame_weights(&mut experiment, &frames, config, &store, &reporter)?;

    let paths = OutputPaths::new(&args.run.output);
    paths.prepare()?;
    outputs::write_frame_weights(&paths, &result.frame_bfactors, &result.relative_weights)?;
    if let Some(fsc) = &result.average_fsc {
        let shells = ResolutionShells::new(result.box_size, config.angpix);
        outputs::write_fsc(&paths.average_fsc(), fsc, &shells)?;
    }
    if let Some(maps) = &result.average_half_maps {
        outputs::write_average_maps(&paths, maps, config.angpix)?;
    }

    for (frame, fit) in &result.frame_bfactors {
        info!(frame, bfactor = fit.bfactor, offset = fit.offset, status = ?fit.status, "Frame B-factor.");
    }
    println!(
        "✓ B-factors for {} frame(s) written to {} ({} computed, {} reused)",
        result.frame_bfactors.len(),
        paths.bfactors().display(),
        result.reconstructions_computed,
        result.reconstructions_cached
    );

    let completion = Completion::from_issue_count(result.issues.len());
    if let Completion::WithIssues(count) = completion {
        warn!("Frame weighting finished with {} recoverable issue(s).", count);
    }
    Ok(completion)
}
