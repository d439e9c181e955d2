//! Progress bars for a running download

use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};
use modsync_sync::{format_bytes, format_speed, pluralize, ProgressEvent, ProgressSnapshot};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;

/// Per-file bars shown at once; further files only move the total bar
const MAX_FILE_BARS: usize = 8;

/// One total bar plus a bar per file in flight
pub struct TransferView {
    multi: MultiProgress,
    total: ProgressBar,
    files: HashMap<PathBuf, ProgressBar>,
    base: PathBuf,
}

impl TransferView {
    /// Create the view for a run of `total_files` files and `total_bytes` bytes
    pub fn new(base: &Path, total_files: usize, total_bytes: u64) -> Self {
        let multi = MultiProgress::with_draw_target(ProgressDrawTarget::stderr_with_hz(10));
        let total = multi.add(ProgressBar::new(total_bytes));
        total.set_style(bar_style(
            "{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {bytes}/{total_bytes} ({eta}) {msg}",
        ));
        total.set_message(format!("0/{}", pluralize(total_files, "file")));
        total.enable_steady_tick(Duration::from_millis(100));

        Self {
            multi,
            total,
            files: HashMap::new(),
            base: base.to_path_buf(),
        }
    }

    /// Draw events until the sender goes away
    pub async fn run(mut self, mut events: UnboundedReceiver<ProgressEvent>) {
        while let Some(event) = events.recv().await {
            self.apply(event);
        }
        self.finish();
    }

    fn apply(&mut self, event: ProgressEvent) {
        match event {
            ProgressEvent::FileStarted { path, total } => {
                if self.files.len() >= MAX_FILE_BARS {
                    return;
                }
                let bar = self.multi.add(ProgressBar::new(total));
                bar.set_style(bar_style(
                    "  {bytes:>10}/{total_bytes:<10} [{bar:30.green/white}] {bytes_per_sec:>12} {msg}",
                ));
                bar.set_message(self.display_name(&path));
                self.files.insert(path, bar);
            }
            ProgressEvent::FileUpdated(file) => {
                if let Some(bar) = self.files.get(&file.path) {
                    bar.set_position(file.downloaded);
                }
            }
            ProgressEvent::FileCompleted { path, .. } => {
                if let Some(bar) = self.files.remove(&path) {
                    bar.finish_and_clear();
                    self.multi.remove(&bar);
                }
            }
            ProgressEvent::Totals(snapshot) => self.update_total(&snapshot),
        }
    }

    fn update_total(&self, snapshot: &ProgressSnapshot) {
        self.total.set_length(snapshot.total_bytes);
        self.total.set_position(snapshot.downloaded_bytes);
        self.total.set_message(format!(
            "{}/{} at {}",
            snapshot.files_done,
            pluralize(snapshot.total_files, "file"),
            format_speed(snapshot.current_speed)
        ));
    }

    fn display_name(&self, path: &Path) -> String {
        path.strip_prefix(&self.base)
            .unwrap_or(path)
            .display()
            .to_string()
    }

    fn finish(self) {
        for bar in self.files.values() {
            bar.finish_and_clear();
        }
        let downloaded = self.total.position();
        self.total.finish_with_message(format!("{} transferred", format_bytes(downloaded)));
    }
}

/// Spinner shown while the scan runs
pub fn scan_spinner(quiet: bool) -> ProgressBar {
    if quiet {
        return ProgressBar::hidden();
    }
    let spinner = ProgressBar::new_spinner();
    spinner.set_style(bar_style("{spinner:.cyan} {msg} [{elapsed}]"));
    spinner.set_message("Scanning the repository");
    spinner.enable_steady_tick(Duration::from_millis(100));
    spinner
}

fn bar_style(template: &str) -> ProgressStyle {
    ProgressStyle::with_template(template)
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▉▊▋▌▍▎▏  ")
}
