//! Optional topic-count progress bar.

use indicatif::{ProgressBar, ProgressStyle};

/// Count-style progress over topics; a no-op when disabled.
pub struct TopicProgress {
    pb: Option<ProgressBar>,
}

impl TopicProgress {
    pub fn new(enabled: bool, total: u64) -> Self {
        if !enabled {
            return Self { pb: None };
        }
        let pb = ProgressBar::new(total);
        if let Ok(style) = ProgressStyle::with_template(
            "{spinner:.green} {msg} {pos}/{len} [{bar:.cyan/blue}] {percent:>3}%  elapsed: {elapsed_precise}  eta: {eta_precise}",
        ) {
            pb.set_style(style.progress_chars("█▉▊▋▌▍▎▏  "));
        }
        pb.set_message("Restructuring topics");
        pb.enable_steady_tick(std::time::Duration::from_millis(100));
        Self { pb: Some(pb) }
    }

    pub fn topic_done(&self, topic: &str) {
        if let Some(pb) = &self.pb {
            pb.set_message(format!("done {topic}"));
            pb.inc(1);
        }
    }

    pub fn finish(&self) {
        if let Some(pb) = &self.pb {
            pb.finish_with_message("done");
        }
    }
}
