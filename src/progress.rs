use std::io::IsTerminal;

use crossterm::style::Stylize;
use indicatif::{ProgressBar, ProgressStyle};

/// A spinner for the scan. Stays silent when stderr is not a terminal or
/// when debug logs are going to stderr instead.
pub struct Spinner {
    bar: ProgressBar,
}

impl Spinner {
    pub fn new(message: impl Into<String>, debug: bool) -> Self {
        if debug || !std::io::stderr().is_terminal() {
            return Self {
                bar: ProgressBar::hidden(),
            };
        }

        let bar = ProgressBar::new_spinner();
        bar.set_style(
            ProgressStyle::default_spinner()
                .template("{spinner:.dim} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        bar.set_message(message.into());
        bar.enable_steady_tick(std::time::Duration::from_millis(80));
        Self { bar }
    }

    /// Clear the spinner and print a `✔ message` line to stderr.
    pub fn finish(self, message: impl Into<String>) {
        if self.bar.is_hidden() {
            return;
        }
        self.bar.finish_and_clear();
        eprintln!("{} {}", "✔".green(), message.into());
    }

    /// Clear the spinner and print a `✘ message` line to stderr.
    pub fn fail(self, message: impl Into<String>) {
        if self.bar.is_hidden() {
            return;
        }
        self.bar.finish_and_clear();
        eprintln!("{} {}", "✘".red(), message.into());
    }
}
