//! Progress bar for CLI transfers

use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use netsession_types::ProgressSnapshot;

/// Terminal progress bar fed by a task's download progress
pub struct TransferProgress {
    bar: ProgressBar,
}

impl TransferProgress {
    pub fn new(label: &str) -> Self {
        let bar = ProgressBar::new(0);
        if let Ok(template) = ProgressStyle::default_bar().template(
            "{spinner:.green} {msg} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec}, {eta})",
        ) {
            bar.set_style(template.progress_chars("█▓▒░  "));
        }
        bar.set_message(label.to_string());
        Self { bar }
    }

    /// Observer to register on a task's progress
    pub fn observer(&self) -> impl Fn(ProgressSnapshot) + Send + Sync + 'static {
        let bar = self.bar.clone();
        move |snapshot| {
            if let Some(total) = snapshot.total {
                bar.set_length(total);
            }
            bar.set_position(snapshot.completed);
        }
    }

    pub fn finish(&self) {
        self.bar
            .finish_with_message(format!("{} Download complete", style("✓").green().bold()));
    }

    pub fn abandon(&self, reason: &str) {
        self.bar
            .abandon_with_message(format!("{} {}", style("✗").red().bold(), reason));
    }
}
