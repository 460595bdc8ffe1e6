//! Progress reporting for long statement batches.

use indicatif::{ProgressBar, ProgressStyle};

/// Shared by every worker; implementations must be cheap and
/// thread-safe.
pub trait ProgressReporter: Sync {
    fn increment(&self);
    fn finish(&self) {}
}

/// Reporter that does nothing; used by tests and quiet runs.
pub struct NoopProgress;

impl ProgressReporter for NoopProgress {
    fn increment(&self) {}
}

/// Terminal progress bar.
pub struct BarProgress {
    bar: ProgressBar,
}

impl BarProgress {
    /// A bar titled like `Tables restored: `, counting to `len`.
    pub fn new(len: u64, title: &str) -> Self {
        let bar = ProgressBar::new(len);
        bar.set_style(
            ProgressStyle::with_template("{prefix}{bar:40.cyan/blue} {pos}/{len} ({eta})")
                .unwrap_or_else(|_| ProgressStyle::default_bar()),
        );
        bar.set_prefix(format!("{title} restored: "));
        Self { bar }
    }
}

impl ProgressReporter for BarProgress {
    fn increment(&self) {
        self.bar.inc(1);
    }

    fn finish(&self) {
        self.bar.finish();
    }
}
