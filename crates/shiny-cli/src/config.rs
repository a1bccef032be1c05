use crate::cli::{PolishArgs, RunArgs, WeightsArgs};
use crate::error::{CliError, Result};
use crate::utils::parser;
use serde::Deserialize;
use shiny::core::ctf::{CtfCorrection, OpticsSettings};
use shiny::engine::config::{
    self as core_config, BfactorConfig, FitMode, FrameWindow, MovementConfig, NormalisationConfig,
    OptimisationConfig,
};
use shiny::engine::grouping::{DirectoryGrouping, MicrographGrouping, PrefixGrouping, SingleGroup};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::debug;

#[derive(Deserialize, Debug, Default)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
struct PartialOpticsConfig {
    angpix: Option<f64>,
    voltage: Option<f64>,
    spherical_aberration: Option<f64>,
    amplitude_contrast: Option<f64>,
}

#[derive(Deserialize, Debug, Default)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
struct PartialCtfConfig {
    do_ctf: Option<bool>,
    ctf_phase_flipped: Option<bool>,
    only_flip_phases: Option<bool>,
    intact_ctf_first_peak: Option<bool>,
    phase_flip_shiny: Option<bool>,
}

#[derive(Deserialize, Debug, Default)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
struct PartialFramesConfig {
    first: Option<usize>,
    last: Option<usize>,
    step: Option<usize>,
}

#[derive(Deserialize, Debug, Default)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
struct PartialMovementConfig {
    fit_mode: Option<String>,
    running_average_width: Option<usize>,
    sigma_neighbour_distance: Option<f64>,
}

#[derive(Deserialize, Debug, Default)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
struct PartialBfactorConfig {
    do_weighting: Option<bool>,
    fit_minres: Option<f64>,
    perframe_highres: Option<f64>,
    frame_running_average: Option<usize>,
    mask: Option<PathBuf>,
}

#[derive(Deserialize, Debug, Default)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
struct PartialNormalisationConfig {
    do_normalise: Option<bool>,
    do_ramp: Option<bool>,
    bg_radius: Option<f64>,
    white_dust: Option<f64>,
    black_dust: Option<f64>,
}

#[derive(Deserialize, Debug, Default)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
struct PartialOptimisationConfig {
    beamtilt_max: Option<f64>,
    beamtilt_step: Option<f64>,
    defocus_shift_max: Option<f64>,
    defocus_shift_step: Option<f64>,
    minres_beamtilt: Option<f64>,
    maxres_model: Option<f64>,
    min_group_particles: Option<usize>,
    group_by: Option<String>,
    beamtilt_groups: Option<Vec<String>>,
}

#[derive(Deserialize, Debug, Default)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
struct PartialRunConfig {
    second_pass: Option<bool>,
    start_all_over: Option<bool>,
    cache_dir: Option<PathBuf>,
}

#[derive(Deserialize, Debug, Default)]
#[serde(deny_unknown_fields)]
pub struct PartialPolishConfig {
    optics: Option<PartialOpticsConfig>,
    ctf: Option<PartialCtfConfig>,
    frames: Option<PartialFramesConfig>,
    movement: Option<PartialMovementConfig>,
    bfactor: Option<PartialBfactorConfig>,
    normalisation: Option<PartialNormalisationConfig>,
    optimisation: Option<PartialOptimisationConfig>,
    run: Option<PartialRunConfig>,
}

/// How micrographs are split into beam-tilt groups.
#[derive(Debug, Clone)]
pub enum BeamTiltGrouping {
    Single(SingleGroup),
    Directory(DirectoryGrouping),
    Prefix(PrefixGrouping),
}

impl BeamTiltGrouping {
    pub fn as_grouping(&self) -> &dyn MicrographGrouping {
        match self {
            Self::Single(g) => g,
            Self::Directory(g) => g,
            Self::Prefix(g) => g,
        }
    }

    fn resolve(group_by: Option<&str>, names: Vec<String>) -> Result<Self> {
        match group_by.map(|s| s.trim().to_ascii_lowercase()).as_deref() {
            None if names.is_empty() => Ok(Self::Single(SingleGroup)),
            None | Some("prefix") => {
                if names.is_empty() {
                    return Err(CliError::Config(
                        "`optimisation.group-by = \"prefix\"` requires `beamtilt-groups`.".to_string(),
                    ));
                }
                Ok(Self::Prefix(PrefixGrouping::new(names)))
            }
            Some("single") => Ok(Self::Single(SingleGroup)),
            Some("directory") => Ok(Self::Directory(DirectoryGrouping)),
            Some(other) => Err(CliError::Config(format!(
                "Unknown beam-tilt grouping '{}' (expected single, directory or prefix).",
                other
            ))),
        }
    }
}

/// Everything a command needs to start the engine.
#[derive(Debug)]
pub struct ResolvedRun {
    pub config: core_config::PolishConfig,
    pub grouping: BeamTiltGrouping,
    pub cache_dir: PathBuf,
}

fn default_cache_dir(output_root: &Path) -> PathBuf {
    PathBuf::from(format!("{}_cache", output_root.display()))
}

fn parse_value<T: FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| CliError::Config(format!("Invalid value for {}: {}", key, value)))
}

impl PartialPolishConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        debug!("Loading configuration from file: {:?}", path);
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| CliError::FileParsing {
            path: path.to_path_buf(),
            source: e.into(),
        })
    }

    /// Reads `path` if given, otherwise starts from built-in defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        path.map_or_else(|| Ok(Self::default()), Self::from_file)
    }

    pub fn merge_with_polish_args(self, args: &PolishArgs) -> Result<ResolvedRun> {
        self.merge(&args.run, Some(args))
    }

    pub fn merge_with_weights_args(self, args: &WeightsArgs) -> Result<ResolvedRun> {
        self.merge(&args.run, None)
    }

    /// Precedence, lowest first: built-in defaults, the config file, `-S` values,
    /// dedicated command-line flags.
    fn merge(mut self, args: &RunArgs, polish: Option<&PolishArgs>) -> Result<ResolvedRun> {
        self.apply_set_values(&args.set_values)?;

        let optics = self.optics.take().unwrap_or_default();
        let ctf = self.ctf.take().unwrap_or_default();
        let frames = self.frames.take().unwrap_or_default();
        let movement = self.movement.take().unwrap_or_default();
        let bfactor = self.bfactor.take().unwrap_or_default();
        let normalisation = self.normalisation.take().unwrap_or_default();
        let optimisation = self.optimisation.take().unwrap_or_default();
        let run = self.run.take().unwrap_or_default();

        let angpix = args.angpix.or(optics.angpix).ok_or_else(|| {
            CliError::Config(
                "A value for `optics.angpix` is required either in the config file or via --angpix.".to_string(),
            )
        })?;

        let optics_defaults = OpticsSettings::default();
        let optics_settings = OpticsSettings {
            voltage_kv: optics.voltage.unwrap_or(optics_defaults.voltage_kv),
            spherical_aberration_mm: optics
                .spherical_aberration
                .unwrap_or(optics_defaults.spherical_aberration_mm),
            amplitude_contrast: optics
                .amplitude_contrast
                .unwrap_or(optics_defaults.amplitude_contrast),
        };

        let ctf_defaults = CtfCorrection::default();
        let correction = CtfCorrection {
            do_ctf: ctf.do_ctf.unwrap_or(ctf_defaults.do_ctf),
            ctf_phase_flipped: ctf.ctf_phase_flipped.unwrap_or(ctf_defaults.ctf_phase_flipped),
            only_flip_phases: ctf.only_flip_phases.unwrap_or(ctf_defaults.only_flip_phases),
            intact_ctf_first_peak: ctf
                .intact_ctf_first_peak
                .unwrap_or(ctf_defaults.intact_ctf_first_peak),
        };

        let window = match &args.frames {
            Some(range) => parser::parse_frame_range(range).map_err(|e| CliError::Argument(e.to_string()))?,
            None => FrameWindow {
                first: frames.first.unwrap_or(0),
                last: frames.last,
                step: frames.step.unwrap_or(1),
            },
        };

        let movement_defaults = MovementConfig::default();
        let fit_mode = args
            .fit_mode
            .as_ref()
            .or(movement.fit_mode.as_ref())
            .map(|mode| mode.parse::<FitMode>())
            .transpose()
            .map_err(|e| CliError::Config(e.to_string()))?
            .unwrap_or(movement_defaults.fit_mode);
        let movement_config = MovementConfig {
            fit_mode,
            running_average_width: movement
                .running_average_width
                .unwrap_or(movement_defaults.running_average_width),
            sigma_neighbour_distance: movement
                .sigma_neighbour_distance
                .unwrap_or(movement_defaults.sigma_neighbour_distance),
        };

        let bfactor_defaults = BfactorConfig::default();
        let no_weighting = polish.is_some_and(|p| p.no_weighting);
        let bfactor_config = BfactorConfig {
            do_weighting: !no_weighting && bfactor.do_weighting.unwrap_or(bfactor_defaults.do_weighting),
            fit_minres: bfactor.fit_minres.unwrap_or(bfactor_defaults.fit_minres),
            perframe_highres: bfactor.perframe_highres.unwrap_or(bfactor_defaults.perframe_highres),
            frame_running_average: bfactor
                .frame_running_average
                .unwrap_or(bfactor_defaults.frame_running_average),
            mask: bfactor.mask,
        };

        let normalisation_defaults = NormalisationConfig::default();
        let normalisation_config = NormalisationConfig {
            do_normalise: normalisation.do_normalise.unwrap_or(normalisation_defaults.do_normalise),
            do_ramp: normalisation.do_ramp.unwrap_or(normalisation_defaults.do_ramp),
            bg_radius: normalisation.bg_radius,
            white_dust_stddev: normalisation
                .white_dust
                .unwrap_or(normalisation_defaults.white_dust_stddev),
            black_dust_stddev: normalisation
                .black_dust
                .unwrap_or(normalisation_defaults.black_dust_stddev),
        };

        let optimisation_defaults = OptimisationConfig::default();
        let optimisation_config = OptimisationConfig {
            beamtilt_max: polish
                .and_then(|p| p.beamtilt_max)
                .or(optimisation.beamtilt_max)
                .unwrap_or(optimisation_defaults.beamtilt_max),
            beamtilt_step: optimisation.beamtilt_step.unwrap_or(optimisation_defaults.beamtilt_step),
            defocus_shift_max: polish
                .and_then(|p| p.defocus_shift_max)
                .or(optimisation.defocus_shift_max)
                .unwrap_or(optimisation_defaults.defocus_shift_max),
            defocus_shift_step: optimisation
                .defocus_shift_step
                .unwrap_or(optimisation_defaults.defocus_shift_step),
            minres_beamtilt: optimisation
                .minres_beamtilt
                .unwrap_or(optimisation_defaults.minres_beamtilt),
            maxres_model: optimisation.maxres_model,
            min_group_particles: optimisation
                .min_group_particles
                .unwrap_or(optimisation_defaults.min_group_particles),
        };

        let group_names = match polish.map(|p| &p.beamtilt_groups) {
            Some(names) if !names.is_empty() => names.clone(),
            _ => optimisation.beamtilt_groups.unwrap_or_default(),
        };
        let grouping = BeamTiltGrouping::resolve(optimisation.group_by.as_deref(), group_names)?;

        let config = core_config::PolishConfigBuilder::new()
            .angpix(angpix)
            .optics(optics_settings)
            .ctf_correction(correction)
            .frames(window)
            .movement(movement_config)
            .bfactor(bfactor_config)
            .normalisation(normalisation_config)
            .optimisation(optimisation_config)
            .phase_flip_shiny(ctf.phase_flip_shiny.unwrap_or(false))
            .second_pass(polish.is_some_and(|p| p.second_pass) || run.second_pass.unwrap_or(false))
            .start_all_over(args.start_all_over || run.start_all_over.unwrap_or(false))
            .build()
            .map_err(|e| CliError::Config(e.to_string()))?;

        let cache_dir = args
            .cache_dir
            .clone()
            .or(run.cache_dir)
            .unwrap_or_else(|| default_cache_dir(&args.output));

        Ok(ResolvedRun {
            config,
            grouping,
            cache_dir,
        })
    }

    fn apply_set_values(&mut self, set_values: &[String]) -> Result<()> {
        for kv_pair in set_values {
            let Some((key, value)) = kv_pair.split_once('=') else {
                return Err(CliError::Config(format!(
                    "Invalid --set format: '{}'. Expected KEY=VALUE.",
                    kv_pair
                )));
            };
            let key = key.trim();

            match key {
                "optics.angpix" => self.optics.get_or_insert_with(Default::default).angpix = Some(parse_value(key, value)?),
                "optics.voltage" => self.optics.get_or_insert_with(Default::default).voltage = Some(parse_value(key, value)?),
                "optics.spherical-aberration" => {
                    self.optics.get_or_insert_with(Default::default).spherical_aberration = Some(parse_value(key, value)?)
                }
                "optics.amplitude-contrast" => {
                    self.optics.get_or_insert_with(Default::default).amplitude_contrast = Some(parse_value(key, value)?)
                }
                "ctf.do-ctf" => self.ctf.get_or_insert_with(Default::default).do_ctf = Some(parse_value(key, value)?),
                "ctf.phase-flip-shiny" => {
                    self.ctf.get_or_insert_with(Default::default).phase_flip_shiny = Some(parse_value(key, value)?)
                }
                "frames.first" => self.frames.get_or_insert_with(Default::default).first = Some(parse_value(key, value)?),
                "frames.last" => self.frames.get_or_insert_with(Default::default).last = Some(parse_value(key, value)?),
                "frames.step" => self.frames.get_or_insert_with(Default::default).step = Some(parse_value(key, value)?),
                "movement.fit-mode" => {
                    self.movement.get_or_insert_with(Default::default).fit_mode = Some(value.trim().to_string())
                }
                "movement.running-average-width" => {
                    self.movement.get_or_insert_with(Default::default).running_average_width =
                        Some(parse_value(key, value)?)
                }
                "movement.sigma-neighbour-distance" => {
                    self.movement.get_or_insert_with(Default::default).sigma_neighbour_distance =
                        Some(parse_value(key, value)?)
                }
                "bfactor.do-weighting" => {
                    self.bfactor.get_or_insert_with(Default::default).do_weighting = Some(parse_value(key, value)?)
                }
                "bfactor.fit-minres" => {
                    self.bfactor.get_or_insert_with(Default::default).fit_minres = Some(parse_value(key, value)?)
                }
                "bfactor.perframe-highres" => {
                    self.bfactor.get_or_insert_with(Default::default).perframe_highres = Some(parse_value(key, value)?)
                }
                "bfactor.frame-running-average" => {
                    self.bfactor.get_or_insert_with(Default::default).frame_running_average =
                        Some(parse_value(key, value)?)
                }
                "bfactor.mask" => self.bfactor.get_or_insert_with(Default::default).mask = Some(PathBuf::from(value.trim())),
                "normalisation.bg-radius" => {
                    self.normalisation.get_or_insert_with(Default::default).bg_radius = Some(parse_value(key, value)?)
                }
                "optimisation.beamtilt-max" => {
                    self.optimisation.get_or_insert_with(Default::default).beamtilt_max = Some(parse_value(key, value)?)
                }
                "optimisation.beamtilt-step" => {
                    self.optimisation.get_or_insert_with(Default::default).beamtilt_step = Some(parse_value(key, value)?)
                }
                "optimisation.defocus-shift-max" => {
                    self.optimisation.get_or_insert_with(Default::default).defocus_shift_max =
                        Some(parse_value(key, value)?)
                }
                "optimisation.defocus-shift-step" => {
                    self.optimisation.get_or_insert_with(Default::default).defocus_shift_step =
                        Some(parse_value(key, value)?)
                }
                "optimisation.minres-beamtilt" => {
                    self.optimisation.get_or_insert_with(Default::default).minres_beamtilt =
                        Some(parse_value(key, value)?)
                }
                "optimisation.maxres-model" => {
                    self.optimisation.get_or_insert_with(Default::default).maxres_model = Some(parse_value(key, value)?)
                }
                "optimisation.min-group-particles" => {
                    self.optimisation.get_or_insert_with(Default::default).min_group_particles =
                        Some(parse_value(key, value)?)
                }
                "optimisation.group-by" => {
                    self.optimisation.get_or_insert_with(Default::default).group_by = Some(value.trim().to_string())
                }
                "run.second-pass" => self.run.get_or_insert_with(Default::default).second_pass = Some(parse_value(key, value)?),
                "run.start-all-over" => {
                    self.run.get_or_insert_with(Default::default).start_all_over = Some(parse_value(key, value)?)
                }
                _ => {
                    return Err(CliError::Config(format!(
                        "Unsupported configuration key for --set: '{}'",
                        key
                    )));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::{Cli, Commands};
    use clap::Parser;
    use std::fs;
    use tempfile::{TempDir, tempdir};

    fn write_config_file(dir: &TempDir, content: &str) -> PathBuf {
        let file_path = dir.path().join("polish.toml");
        fs::write(&file_path, content).unwrap();
        file_path
    }

    fn polish_args(config_path: &Path, extra: &[&str]) -> PolishArgs {
        let mut args = vec![
            "shiny".to_string(),
            "polish".to_string(),
            "-p".to_string(),
            "particles.csv".to_string(),
            "-m".to_string(),
            "motion.csv".to_string(),
            "-o".to_string(),
            "out/run1".to_string(),
            "-c".to_string(),
            config_path.to_str().unwrap().to_string(),
        ];
        args.extend(extra.iter().map(|s| s.to_string()));
        match Cli::parse_from(args).command {
            Commands::Polish(polish) => polish,
            _ => panic!("Expected 'polish' subcommand"),
        }
    }

    fn resolve(content: &str, extra: &[&str]) -> Result<ResolvedRun> {
        let dir = tempdir().unwrap();
        let config_path = write_config_file(&dir, content);
        let args = polish_args(&config_path, extra);
        PartialPolishConfig::from_file(&config_path)?.merge_with_polish_args(&args)
    }

    #[test]
    fn file_values_are_merged_with_defaults() {
        let resolved = resolve(
            r#"
        [optics]
        angpix = 1.06
        voltage = 200.0

        [bfactor]
        fit-minres = 25.0
        "#,
            &[],
        )
        .unwrap();

        let config = &resolved.config;
        assert_eq!(config.angpix, 1.06);
        assert_eq!(config.optics.voltage_kv, 200.0);
        assert_eq!(config.optics.spherical_aberration_mm, 2.7);
        assert_eq!(config.bfactor.fit_minres, 25.0);
        assert_eq!(config.bfactor.perframe_highres, 6.0);
        assert!(config.bfactor.do_weighting);
        assert_eq!(config.movement.fit_mode, FitMode::Linear);
        assert_eq!(config.movement.running_average_width, 5);
        assert_eq!(config.frames, FrameWindow::default());
        assert!(!config.do_second_pass);
        assert!(matches!(resolved.grouping, BeamTiltGrouping::Single(_)));
        assert_eq!(resolved.cache_dir, PathBuf::from("out/run1_cache"));
    }

    #[test]
    fn cli_args_override_file_values() {
        let resolved = resolve(
            r#"
        [optics]
        angpix = 1.0 # Will be overridden

        [movement]
        fit-mode = "log" # Will be overridden

        [optimisation]
        beamtilt-max = 0.4 # Will be overridden
        "#,
            &[
                "--angpix",
                "1.5",
                "--frames",
                "2:10:2",
                "--fit-mode",
                "sqrt",
                "--no-weighting",
                "--second-pass",
                "--beamtilt-max",
                "1.0",
                "--cache-dir",
                "scratch",
            ],
        )
        .unwrap();

        let config = &resolved.config;
        assert_eq!(config.angpix, 1.5);
        assert_eq!(config.frames, FrameWindow { first: 2, last: Some(10), step: 2 });
        assert_eq!(config.movement.fit_mode, FitMode::Sqrt);
        assert!(!config.bfactor.do_weighting);
        assert!(config.do_second_pass);
        assert_eq!(config.optimisation.beamtilt_max, 1.0);
        assert_eq!(resolved.cache_dir, PathBuf::from("scratch"));
    }

    #[test]
    fn set_values_override_the_file_but_not_flags() {
        let resolved = resolve(
            r#"
        [optics]
        angpix = 1.0

        [bfactor]
        fit-minres = 20.0 # Will be overridden by --set
        "#,
            &[
                "-S",
                "bfactor.fit-minres=30",
                "-S",
                "movement.fit-mode=none",
                "-S",
                "optics.angpix=2.0",
                "--angpix",
                "3.0",
            ],
        )
        .unwrap();

        let config = &resolved.config;
        assert_eq!(config.bfactor.fit_minres, 30.0);
        assert_eq!(config.movement.fit_mode, FitMode::NoFit);
        assert_eq!(config.angpix, 3.0);
    }

    #[test]
    fn missing_pixel_size_returns_error() {
        let result = resolve("[bfactor]\nfit-minres = 20.0\n", &[]);
        assert!(matches!(result, Err(CliError::Config(ref msg)) if msg.contains("angpix")));
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let result = resolve("[optics]\nangpix = 1.0\npixel-size = 1.0\n", &[]);
        assert!(matches!(result, Err(CliError::FileParsing { .. })));

        let result = resolve("[optics]\nangpix = 1.0\n", &["-S", "optics.colour=blue"]);
        assert!(matches!(result, Err(CliError::Config(ref msg)) if msg.contains("optics.colour")));
    }

    #[test]
    fn engine_validation_errors_surface_as_config_errors() {
        let result = resolve(
            r#"
        [optics]
        angpix = 1.0

        [bfactor]
        fit-minres = 5.0
        perframe-highres = 6.0
        "#,
            &[],
        );
        assert!(matches!(result, Err(CliError::Config(ref msg)) if msg.contains("fit-minres")));
    }

    #[test]
    fn beamtilt_groups_select_prefix_grouping() {
        let resolved = resolve(
            r#"
        [optics]
        angpix = 1.0

        [optimisation]
        beamtilt-groups = ["session1", "session2"]
        "#,
            &[],
        )
        .unwrap();
        assert_eq!(resolved.grouping.as_grouping().group_of("data/session2/mic_004.mrc"), "session2");

        let resolved = resolve("[optics]\nangpix = 1.0\n", &["-S", "optimisation.group-by=directory"]).unwrap();
        assert_eq!(resolved.grouping.as_grouping().group_of("data/session2/mic_004.mrc"), "data/session2");

        let result = resolve("[optics]\nangpix = 1.0\n", &["-S", "optimisation.group-by=optics"]);
        assert!(matches!(result, Err(CliError::Config(_))));
    }

    #[test]
    fn weights_command_ignores_polish_only_flags() {
        let dir = tempdir().unwrap();
        let config_path = write_config_file(&dir, "[optics]\nangpix = 1.2\n[run]\nsecond-pass = false\n");
        let cli = Cli::parse_from([
            "shiny",
            "weights",
            "-p",
            "particles.csv",
            "-m",
            "motion.csv",
            "-o",
            "run2",
            "-c",
            config_path.to_str().unwrap(),
            "--start-all-over",
        ]);
        let Commands::Weights(args) = cli.command else {
            panic!("Expected 'weights' subcommand");
        };
        let resolved = PartialPolishConfig::load(args.run.config.as_deref())
            .unwrap()
            .merge_with_weights_args(&args)
            .unwrap();
        assert_eq!(resolved.config.angpix, 1.2);
        assert!(resolved.config.do_start_all_over);
        assert!(resolved.config.bfactor.do_weighting);
    }
}
