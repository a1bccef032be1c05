use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

const HELP_TEMPLATE: &str = "\
{before-help}{name} {version}
{author-with-newline}{about-with-newline}
{usage-heading} {usage}

{all-args}{after-help}
";

#[derive(Parser, Debug)]
#[command(
    author = "The shiny developers",
    version,
    about = "shiny - Per-particle motion correction, radiation-damage weighting and optics refinement for cryo-EM movie particles.",
    help_template = HELP_TEMPLATE,
)]
#[command(propagate_version = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Increase verbosity level (-v for INFO, -vv for DEBUG, -vvv for TRACE)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress all log output except for errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    /// Write logs to a specified file in addition to the console output
    #[arg(long, global = true, value_name = "PATH")]
    pub log_file: Option<PathBuf>,

    /// Set the number of threads for parallel computation.
    /// Defaults to the number of available logical cores.
    #[arg(short = 'j', long, global = true, value_name = "NUM")]
    pub threads: Option<usize>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Polish movie particles: fit tracks, weight frames and write shiny particles.
    Polish(PolishArgs),
    /// Estimate per-frame B-factors and relative weights without polishing.
    Weights(WeightsArgs),
}

/// Inputs, outputs and overrides shared by every subcommand.
#[derive(Args, Debug)]
pub struct RunArgs {
    // --- Core Arguments ---
    /// Particle table (CSV, one row per particle).
    #[arg(short, long, required = true, value_name = "PATH")]
    pub particles: PathBuf,

    /// Per-frame offset table (CSV, one row per particle and frame).
    #[arg(short, long, required = true, value_name = "PATH")]
    pub motion: PathBuf,

    /// Root of every output file name (e.g. 'run1' gives 'run1_shiny.csv').
    #[arg(short, long, required = true, value_name = "ROOT")]
    pub output: PathBuf,

    /// Path to a configuration file in TOML format.
    #[arg(short, long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    // --- Overrides ---
    /// Override the pixel size in Ångström.
    #[arg(long, value_name = "FLOAT")]
    pub angpix: Option<f64>,

    /// Frames to use, as FIRST:LAST:STEP (LAST may be empty for the final frame).
    #[arg(long, value_name = "RANGE")]
    pub frames: Option<String>,

    /// Override the trajectory fit mode (linear, log, sqrt or none).
    #[arg(long, value_name = "MODE")]
    pub fit_mode: Option<String>,

    /// Directory for cached single-frame reconstructions. Defaults to '<ROOT>_cache'.
    #[arg(long, value_name = "PATH")]
    pub cache_dir: Option<PathBuf>,

    /// Ignore cached reconstructions and recompute everything.
    #[arg(long)]
    pub start_all_over: bool,

    /// Set a specific configuration value, overriding the config file.
    /// Can be used multiple times. Example: -S bfactor.fit-minres=25
    #[arg(short = 'S', long = "set", value_name = "KEY=VALUE", num_args(0..))]
    pub set_values: Vec<String>,
}

/// Arguments for the `polish` subcommand.
#[derive(Args, Debug)]
pub struct PolishArgs {
    #[command(flatten)]
    pub run: RunArgs,

    /// Use uniform frame weights instead of B-factor weighting.
    #[arg(long)]
    pub no_weighting: bool,

    /// Polish a second time with the FSC weight of the first pass.
    #[arg(long)]
    pub second_pass: bool,

    // --- Optics Refinement ---
    /// Largest beam tilt searched, in mrad (0 disables the search).
    #[arg(long, value_name = "FLOAT")]
    pub beamtilt_max: Option<f64>,

    /// Largest defocus shift searched, in Å (0 disables the search).
    #[arg(long, value_name = "FLOAT")]
    pub defocus_shift_max: Option<f64>,

    /// Dataset name for a separate beam-tilt group; micrographs whose name contains it
    /// join the group. Can be used multiple times.
    #[arg(long = "beamtilt-group", value_name = "NAME")]
    pub beamtilt_groups: Vec<String>,
}

/// Arguments for the `weights` subcommand.
#[derive(Args, Debug)]
pub struct WeightsArgs {
    #[command(flatten)]
    pub run: RunArgs,
}
