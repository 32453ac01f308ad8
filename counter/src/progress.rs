use indicatif::{ProgressBar, ProgressStyle};

/// Progress sink handed down by reference to every stage. Tests and library
/// callers run with the hidden variant; the CLI gets spinners and bars.
pub struct Progress {
    bar: Option<ProgressBar>,
}

impl Progress {
    pub fn spinner(label: &str) -> Self {
        let bar = ProgressBar::new_spinner();
        bar.set_message(label.to_string());
        Progress { bar: Some(bar) }
    }

    pub fn percent(label: &str, max: u64) -> Self {
        let bar = ProgressBar::new(max.max(1));
        bar.set_style(
            ProgressStyle::with_template("{msg} [{bar:40}] {percent}%")
                .unwrap_or_else(|_| ProgressStyle::default_bar()),
        );
        bar.set_message(label.to_string());
        Progress { bar: Some(bar) }
    }

    pub fn hidden() -> Self {
        Progress { bar: None }
    }

    pub fn tick(&self, message: String) {
        if let Some(bar) = &self.bar {
            bar.set_message(message);
            bar.tick();
        }
    }

    pub fn notify(&self, delta: u64) {
        if let Some(bar) = &self.bar {
            bar.inc(delta);
        }
    }

    pub fn finish(&self) {
        if let Some(bar) = &self.bar {
            bar.finish();
        }
    }
}
