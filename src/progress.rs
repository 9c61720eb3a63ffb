//! Upload progress accumulation
//!
//! Workers start before the caller has a progress bar (the bar needs the
//! totals banner printed first), so bytes are accumulated locally until a
//! display is attached, then applied in one catch-up step. The attach
//! transition is the only synchronized point; the hot path is atomics.

use indicatif::{ProgressBar, ProgressStyle};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;

#[derive(Default)]
pub struct ProgressTracker {
    bar: OnceLock<ProgressBar>,
    /// Bytes recorded before the bar existed, drained exactly once
    unreported: AtomicU64,
    /// Lifetime byte total, independent of the display
    total: AtomicU64,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `bytes` of completed transfer.
    pub fn add(&self, bytes: u64) {
        self.total.fetch_add(bytes, Ordering::Relaxed);

        if let Some(bar) = self.bar.get() {
            // Fold in anything still parked from before the bar attached.
            let backlog = self.unreported.swap(0, Ordering::AcqRel);
            bar.inc(backlog + bytes);
        } else {
            self.unreported.fetch_add(bytes, Ordering::AcqRel);
            // The bar may have attached between the check and the add; the
            // swap guarantees the backlog is applied exactly once either way.
            if let Some(bar) = self.bar.get() {
                let backlog = self.unreported.swap(0, Ordering::AcqRel);
                if backlog > 0 {
                    bar.inc(backlog);
                }
            }
        }
    }

    /// One-time display attachment with catch-up of accumulated bytes.
    pub fn attach(&self, bar: ProgressBar) {
        if self.bar.set(bar).is_err() {
            return;
        }
        if let Some(bar) = self.bar.get() {
            let backlog = self.unreported.swap(0, Ordering::AcqRel);
            if backlog > 0 {
                bar.inc(backlog);
            }
        }
    }

    pub fn total_bytes(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    pub fn finish(&self) {
        if let Some(bar) = self.bar.get() {
            bar.finish_and_clear();
        }
    }
}

/// Byte-denominated bar used by the upload run
pub fn byte_bar(total_bytes: u64) -> ProgressBar {
    let bar = ProgressBar::new(total_bytes);
    bar.set_style(
        ProgressStyle::with_template(
            "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({eta})",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("=> "),
    );
    bar
}
