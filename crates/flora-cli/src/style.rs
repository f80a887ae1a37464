//! Progress indicators.

use std::time::Duration;

use indicatif::{ProgressBar, ProgressStyle};

const SPINNER_TICK_MS: u64 = 80;
const SPINNER_TICK_CHARS: &str = "⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏ ";
const PROGRESS_CHARS: &str = "█▓░";

fn spinner_style() -> ProgressStyle {
    ProgressStyle::default_spinner()
        .template("{spinner:.cyan} {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_spinner())
        .tick_chars(SPINNER_TICK_CHARS)
}

fn entries_style() -> ProgressStyle {
    ProgressStyle::default_bar()
        .template("{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars(PROGRESS_CHARS)
}

/// A ticking spinner with `message`.
pub fn spinner(message: impl Into<String>) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.set_style(spinner_style());
    pb.set_message(message.into());
    pb.enable_steady_tick(Duration::from_millis(SPINNER_TICK_MS));
    pb
}

/// A bar counting history entries. The length is set once the count is known.
pub fn history_progress_bar() -> ProgressBar {
    let pb = ProgressBar::new(0);
    pb.set_style(entries_style());
    pb.set_message("Reading entry count...");
    pb.enable_steady_tick(Duration::from_millis(SPINNER_TICK_MS));
    pb
}
