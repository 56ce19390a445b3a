//! Download progress display.

use indicatif::{ProgressBar, ProgressStyle};
use std::time::{Duration, Instant};

/// Spinner shown while waiting for a whole-file payload
///
/// The server sends each file as one message with no size announced up
/// front, so there is nothing to measure until it arrives.
pub struct FetchProgress {
    bar: ProgressBar,
    started: Instant,
}

impl FetchProgress {
    /// Start a spinner for `filename`
    #[must_use]
    pub fn new(filename: &str) -> Self {
        let bar = ProgressBar::new_spinner();

        bar.set_style(
            ProgressStyle::default_spinner()
                .template("{spinner:.green} [{elapsed_precise}] {msg}")
                .expect("Invalid progress bar template"),
        );
        bar.set_message(format!("Waiting for {filename}"));
        bar.enable_steady_tick(Duration::from_millis(100));

        Self {
            bar,
            started: Instant::now(),
        }
    }

    /// Finish with a size and duration summary
    pub fn finish(&self, filename: &str, bytes: u64) {
        self.bar.finish_with_message(format!(
            "Received {filename} ({} in {})",
            format_bytes(bytes),
            format_duration(self.started.elapsed())
        ));
    }

    /// Abandon the spinner with an explanation
    pub fn abandon(&self, msg: String) {
        self.bar.abandon_with_message(msg);
    }
}

/// Format bytes in human-readable format
#[must_use]
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_idx = 0;

    while size >= 1024.0 && unit_idx < UNITS.len() - 1 {
        size /= 1024.0;
        unit_idx += 1;
    }

    format!("{size:.2} {}", UNITS[unit_idx])
}

/// Format duration in human-readable format
#[must_use]
pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();

    if secs < 60 {
        format!("{secs}s")
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}h {}m", secs / 3600, (secs % 3600) / 60)
    }
}
