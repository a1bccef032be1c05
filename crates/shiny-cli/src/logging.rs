use crate::error::{CliError, Result};
use std::fs::File;
use std::path::PathBuf;
use tracing_subscriber::{
    EnvFilter, Layer, Registry,
    fmt::{self, format::FmtSpan},
    prelude::*,
};

/// Events below this level never reach the log file, whatever the console shows.
/// Skipped frames and per-half reconstruction details are logged at debug.
const FILE_DIRECTIVE: &str = "warn,shiny=debug";

/// Console verbosity for the polishing crates; everything else stays at `warn`.
fn console_directive(verbosity: u8, quiet: bool) -> String {
    if quiet {
        return "error".to_string();
    }
    let level = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    format!("warn,shiny={level}")
}

/// Writes events to `file` with the enclosing workflow and task spans, and closes every
/// span with its busy time, so a run's log shows how long each phase took.
fn file_layer(file: File) -> impl Layer<Registry> {
    fmt::layer()
        .with_writer(file)
        .with_ansi(false)
        .with_thread_ids(true)
        .with_target(true)
        .with_span_events(FmtSpan::CLOSE)
        .with_filter(EnvFilter::new(FILE_DIRECTIVE))
}

/// `RUST_LOG`, when set, replaces the console filter; the file filter is fixed.
pub fn setup_logging(verbosity: u8, quiet: bool, log_file: Option<PathBuf>) -> Result<()> {
    let console_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(console_directive(verbosity, quiet)));

    let stderr_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_ansi(true)
        .with_target(false)
        .compact()
        .with_filter(console_filter);

    let file_output = log_file
        .map(|path| File::create(&path).map_err(CliError::Io).map(file_layer))
        .transpose()?;

    tracing_subscriber::registry()
        .with(file_output)
        .with(stderr_layer)
        .init();

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::sync::Once;
    use tracing::{debug, error, info, info_span, trace, warn};

    static INIT: Once = Once::new();

    fn ensure_global_logger_is_set() {
        INIT.call_once(|| {
            setup_logging(3, false, None).expect("Failed to set up global logger for tests");
        });
    }

    fn read_log_after(run: impl FnOnce()) -> String {
        let temp_dir = tempfile::tempdir().unwrap();
        let log_path = temp_dir.path().join("polish.log");
        let file = File::create(&log_path).unwrap();
        let subscriber = tracing_subscriber::registry().with(file_layer(file));
        tracing::subscriber::with_default(subscriber, run);
        std::fs::read_to_string(log_path).unwrap()
    }

    #[test]
    fn console_verbosity_only_raises_the_polishing_crates() {
        assert_eq!(console_directive(0, false), "warn,shiny=warn");
        assert_eq!(console_directive(2, false), "warn,shiny=debug");
        assert_eq!(console_directive(7, false), "warn,shiny=trace");
        assert_eq!(console_directive(3, true), "error");
    }

    #[test]
    #[serial]
    fn initialization_and_macros_work() {
        ensure_global_logger_is_set();

        error!("This is an error");
        warn!("This is a warning");
        info!("This is info");
        debug!("This is debug");
        trace!("This is trace");
    }

    #[test]
    #[serial]
    fn skipped_frames_reach_the_file_with_their_workflow_span() {
        let content = read_log_after(|| {
            let _workflow = info_span!(target: "shiny::workflows::polish", "polish_workflow").entered();
            debug!(
                target: "shiny::engine::tasks::polish",
                particle = "mic_001.mrcs@3",
                frame = 4,
                "Frame skipped: image contains non-finite values"
            );
        });

        assert!(content.contains("Frame skipped: image contains non-finite values"));
        assert!(content.contains("frame=4"));
        assert!(content.contains("polish_workflow"));
        assert!(content.contains("DEBUG"));
        assert!(content.contains("ThreadId"));
        assert!(content.contains("close"), "span close with timing is written: {content}");
    }

    #[test]
    #[serial]
    fn file_drops_chatter_from_other_crates() {
        let content = read_log_after(|| {
            debug!(target: "rustfft::planner", "Plan chosen.");
            warn!(target: "rustfft::planner", "Planner fell back.");
            trace!(target: "shiny::core::fourier", "Trace detail.");
        });

        assert!(!content.contains("Plan chosen."));
        assert!(content.contains("Planner fell back."));
        assert!(!content.contains("Trace detail."));
    }

    #[test]
    #[serial]
    fn invalid_log_file_path_propagates_error() {
        let invalid_path = PathBuf::from("/");

        if cfg!(unix) && invalid_path.is_dir() {
            let result = setup_logging(0, false, Some(invalid_path));
            assert!(matches!(result, Err(CliError::Io(_))));
        }
    }
}
