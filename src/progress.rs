//! Progress display for the broadcasting side.

use indicatif::{ProgressBar, ProgressStyle};

/// Tracks how much of the current file has been handed to the window.
pub struct TransferProgress {
    bar: Option<ProgressBar>,
}

impl TransferProgress {
    /// Create a tracker for a file of `total_bytes`, optionally rendering
    /// a bar on the terminal.
    pub fn new(name: &str, total_bytes: u64, show_bar: bool) -> Self {
        let bar = if show_bar {
            let pb = ProgressBar::new(total_bytes);
            let style = ProgressStyle::default_bar()
                .template("{msg:20.20} {bytes:>10}/{total_bytes:>10} {percent:>4}% {bytes_per_sec:>12}")
                .unwrap_or_else(|_| ProgressStyle::default_bar());
            pb.set_style(style);
            pb.set_message(name.to_string());
            Some(pb)
        } else {
            None
        };
        Self { bar }
    }

    /// Advance the display by `bytes`.
    pub fn update(&self, bytes: u64) {
        if let Some(ref bar) = self.bar {
            bar.inc(bytes);
        }
    }

    /// Finish the bar, leaving the file name visible.
    pub fn finish(&self) {
        if let Some(ref bar) = self.bar {
            bar.finish();
        }
    }
}
