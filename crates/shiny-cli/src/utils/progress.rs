use indicatif::{ProgressBar, ProgressDrawTarget, ProgressState, ProgressStyle};
use shiny::engine::error::{IssueCounts, PolishIssue};
use shiny::engine::progress::{Progress, ProgressCallback};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::warn;

const SPINNER_TICK_MS: u64 = 80;
/// Issues printed one by one per phase; later ones only show up in the phase summary.
const LISTED_ISSUES_PER_PHASE: usize = 5;

/// "2 unreadable frames, 1 particle dropped", or `None` for a clean phase.
pub fn issue_summary(counts: &IssueCounts) -> Option<String> {
    let kinds = [
        (counts.insufficient_data, "trajectory left unfitted", "trajectories left unfitted"),
        (counts.low_resolution_frames, "frame with fallback B-factor", "frames with fallback B-factors"),
        (counts.unreadable_frames, "unreadable frame", "unreadable frames"),
        (counts.no_usable_frames, "particle dropped", "particles dropped"),
        (counts.degenerate_groups, "degenerate beam-tilt group", "degenerate beam-tilt groups"),
    ];
    let parts: Vec<String> = kinds
        .into_iter()
        .filter(|(count, ..)| *count > 0)
        .map(|(count, one, many)| format!("{count} {}", if count == 1 { one } else { many }))
        .collect();
    (!parts.is_empty()).then(|| parts.join(", "))
}

struct PhaseDisplay {
    bar: ProgressBar,
    phase: &'static str,
    issues: IssueCounts,
}

impl PhaseDisplay {
    fn start_phase(&mut self, name: &'static str) {
        self.phase = name;
        self.issues = IssueCounts::default();
        self.bar.reset();
        self.bar.set_length(0);
        self.bar.set_style(spinner_style());
        self.bar.enable_steady_tick(Duration::from_millis(SPINNER_TICK_MS));
        self.bar.set_message(name);
    }

    fn finish_phase(&mut self) {
        self.bar.disable_steady_tick();
        let message = match issue_summary(&self.issues) {
            Some(summary) => format!("⚠ {}: {summary}", self.phase),
            None => format!("✓ {}", self.phase),
        };
        self.bar.finish_with_message(message);
    }

    /// Task bars carry the phase name, so both polishing passes stay distinguishable.
    fn start_task(&mut self, total_steps: u64) {
        self.bar.disable_steady_tick();
        self.bar.reset();
        self.bar.set_length(total_steps);
        self.bar.set_position(0);
        self.bar.set_style(bar_style());
        self.bar.set_message(self.phase);
    }

    fn finish_task(&mut self) {
        let length = self.bar.length().unwrap_or(0);
        if self.bar.position() < length {
            self.bar.set_position(length);
        }
        self.bar.finish();
    }

    fn record_issue(&mut self, issue: &PolishIssue) {
        if self.issues.total() < LISTED_ISSUES_PER_PHASE {
            self.bar.println(format!("  ⚠ {issue}"));
        }
        self.issues.add(issue);
    }

    fn handle(&mut self, progress: Progress) {
        match progress {
            Progress::PhaseStart { name } => self.start_phase(name),
            Progress::PhaseFinish => self.finish_phase(),
            Progress::TaskStart { total_steps } => self.start_task(total_steps),
            Progress::TaskIncrement => self.bar.inc(1),
            Progress::TaskFinish => self.finish_task(),
            Progress::Message(msg) if self.bar.is_finished() => self.bar.set_message(msg),
            Progress::Message(msg) => self.bar.println(format!("  {msg}")),
            Progress::Issue(issue) => self.record_issue(&issue),
        }
    }
}

fn spinner_style() -> ProgressStyle {
    ProgressStyle::with_template("{spinner:.green} {msg}").unwrap_or_else(|_| ProgressStyle::default_spinner())
}

fn bar_style() -> ProgressStyle {
    ProgressStyle::with_template("{msg:<34} [{bar:40.cyan/blue}] {pos}/{len} ({eta})")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .with_key("eta", |state: &ProgressState, w: &mut dyn std::fmt::Write| {
            let _ = write!(w, "{:.1}s", state.eta().as_secs_f64());
        })
        .progress_chars("##-")
}

/// Renders polishing progress on stderr: a spinner per phase, a bar per task, and a
/// tally of the recoverable issues each phase ran into.
#[derive(Clone)]
pub struct CliProgressHandler {
    display: Arc<Mutex<PhaseDisplay>>,
}

impl CliProgressHandler {
    pub fn new() -> Self {
        let bar = ProgressBar::new(0).with_style(spinner_style());
        bar.set_draw_target(ProgressDrawTarget::stderr());
        bar.finish_and_clear();
        Self {
            display: Arc::new(Mutex::new(PhaseDisplay {
                bar,
                phase: "Starting",
                issues: IssueCounts::default(),
            })),
        }
    }

    pub fn get_callback(&self) -> ProgressCallback<'static> {
        let display = Arc::clone(&self.display);
        Box::new(move |progress: Progress| match display.lock() {
            Ok(mut display) => display.handle(progress),
            Err(_) => warn!("Progress display lock was poisoned; dropping update."),
        })
    }
}

impl Default for CliProgressHandler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shiny::core::models::ids::ParticleId;
    use std::thread;

    fn unreadable(frame: usize) -> PolishIssue {
        PolishIssue::UnreadableFrame {
            particle: ParticleId(3),
            frame,
            reason: "image contains non-finite values".to_string(),
        }
    }

    #[test]
    fn summary_lists_only_the_kinds_that_occurred() {
        assert_eq!(issue_summary(&IssueCounts::default()), None);
        let counts = IssueCounts {
            unreadable_frames: 2,
            no_usable_frames: 1,
            ..IssueCounts::default()
        };
        assert_eq!(
            issue_summary(&counts).as_deref(),
            Some("2 unreadable frames, 1 particle dropped")
        );
    }

    #[test]
    fn task_bar_is_labelled_with_the_polishing_pass() {
        let handler = CliProgressHandler::new();
        let callback = handler.get_callback();

        callback(Progress::PhaseStart { name: "Polishing (pass 1)" });
        callback(Progress::TaskStart { total_steps: 4 });
        callback(Progress::TaskIncrement);
        {
            let display = handler.display.lock().unwrap();
            assert_eq!(display.bar.message(), "Polishing (pass 1)");
            assert_eq!(display.bar.length(), Some(4));
            assert_eq!(display.bar.position(), 1);
        }

        callback(Progress::TaskFinish);
        callback(Progress::PhaseFinish);
        let display = handler.display.lock().unwrap();
        assert!(display.bar.is_finished());
        assert_eq!(display.bar.position(), 4);
        assert_eq!(display.bar.message(), "✓ Polishing (pass 1)");
    }

    #[test]
    fn phase_summary_counts_issues_per_kind() {
        let handler = CliProgressHandler::new();
        let callback = handler.get_callback();

        callback(Progress::PhaseStart { name: "Polishing (pass 0)" });
        for frame in 0..8 {
            callback(Progress::Issue(unreadable(frame)));
        }
        callback(Progress::Issue(PolishIssue::NoUsableFrames {
            particle: ParticleId(3),
            reason: "image contains non-finite values".to_string(),
        }));
        {
            let display = handler.display.lock().unwrap();
            assert_eq!(display.issues.unreadable_frames, 8);
            assert_eq!(display.bar.message(), "Polishing (pass 0)");
        }

        callback(Progress::PhaseFinish);
        let display = handler.display.lock().unwrap();
        assert_eq!(
            display.bar.message(),
            "⚠ Polishing (pass 0): 8 unreadable frames, 1 particle dropped"
        );
    }

    #[test]
    fn tallies_restart_with_each_phase() {
        let handler = CliProgressHandler::new();
        let callback = handler.get_callback();

        callback(Progress::PhaseStart { name: "Frame Reconstructions" });
        callback(Progress::Issue(PolishIssue::LowResolutionReconstruction { frame: 0 }));
        callback(Progress::PhaseFinish);
        callback(Progress::PhaseStart { name: "Polishing (pass 0)" });
        callback(Progress::PhaseFinish);

        let display = handler.display.lock().unwrap();
        assert_eq!(display.issues, IssueCounts::default());
        assert_eq!(display.bar.message(), "✓ Polishing (pass 0)");
    }

    #[test]
    fn callback_is_thread_safe() {
        let handler = CliProgressHandler::new();
        let callback = handler.get_callback();

        thread::spawn(move || {
            callback(Progress::PhaseStart { name: "Fitting Movements" });
            callback(Progress::Issue(PolishIssue::InsufficientData {
                particle: ParticleId(1),
                usable: 1,
            }));
            callback(Progress::PhaseFinish);
        })
        .join()
        .unwrap();

        let display = handler.display.lock().unwrap();
        assert!(display.bar.is_finished());
        assert_eq!(
            display.bar.message(),
            "⚠ Fitting Movements: 1 trajectory left unfitted"
        );
    }
}
