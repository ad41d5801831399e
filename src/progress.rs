// ABOUTME: Completed-chunk counter shared by the workers of one table
// ABOUTME: Drives an optional terminal progress bar; never influences control flow

use indicatif::{ProgressBar, ProgressStyle};
use std::sync::atomic::{AtomicU64, Ordering};

pub struct ChunkProgress {
    table: String,
    total: u64,
    completed: AtomicU64,
    bar: ProgressBar,
}

impl ChunkProgress {
    pub fn new(table: &str, total: u64, visible: bool) -> Self {
        let bar = if visible {
            let bar = ProgressBar::new(total);
            bar.set_style(
                ProgressStyle::with_template("{prefix:>24} [{bar:40}] {pos}/{len} chunks ({elapsed})")
                    .unwrap_or_else(|_| ProgressStyle::default_bar())
                    .progress_chars("=> "),
            );
            bar.set_prefix(table.to_string());
            bar
        } else {
            ProgressBar::hidden()
        };

        Self {
            table: table.to_string(),
            total,
            completed: AtomicU64::new(0),
            bar,
        }
    }

    /// Record one finished chunk (successful or not) and return the new count.
    pub fn chunk_done(&self) -> u64 {
        let done = self.completed.fetch_add(1, Ordering::Relaxed) + 1;
        self.bar.inc(1);

        if self.bar.is_hidden() && (done % 10 == 0 || done == self.total) {
            tracing::info!("Progress: {} - {}/{} chunks", self.table, done, self.total);
        }
        done
    }

    pub fn finish(&self) {
        self.bar.finish_and_clear();
    }
}
