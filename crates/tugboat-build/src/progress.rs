use crate::error::Step;
use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;

const TICK_INTERVAL: Duration = Duration::from_millis(120);

/// ストリーム読み取り中の最新レコードを 1 行で表示するスピナー
///
/// stderr が端末でない場合は何も描画されない。
pub struct BuildProgress {
    step: Step,
    bar: ProgressBar,
}

impl BuildProgress {
    pub fn new(step: Step, image_name: &str) -> Self {
        let bar = ProgressBar::new_spinner();
        bar.set_style(
            ProgressStyle::with_template(
                "{spinner:.green} [{elapsed_precise}] {prefix:.bold} {msg} ({pos} records)",
            )
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        bar.set_prefix(format!("{} {}", step, image_name));
        bar.enable_steady_tick(TICK_INTERVAL);

        Self { step, bar }
    }

    /// レコードを 1 件数え、要約があれば表示を差し替える
    pub fn record(&self, summary: Option<&str>) {
        self.bar.inc(1);
        if let Some(line) = summary {
            self.bar.set_message(line.to_string());
        }
    }

    pub fn finish_success(&self) {
        self.bar
            .finish_with_message(format!("{} completed ✓", self.step));
    }

    pub fn finish_error(&self, error: &str) {
        self.bar
            .finish_with_message(format!("{} failed: {}", self.step, error));
    }
}
