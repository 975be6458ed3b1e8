use indicatif::{ProgressBar, ProgressStyle};
use neural_style::{ProgressUpdate, StylizeProgress};

pub struct ProgressBarReporter {
    pb: ProgressBar,
    len: usize,
}

impl ProgressBarReporter {
    pub fn new() -> Self {
        let sty = ProgressStyle::default_bar()
            .template("[{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} {msg}")
            .progress_chars("##-");

        let pb = ProgressBar::new(0);
        pb.set_style(sty);

        Self { pb, len: 0 }
    }
}

impl Drop for ProgressBarReporter {
    fn drop(&mut self) {
        self.pb.finish();
    }
}

impl StylizeProgress for ProgressBarReporter {
    fn update(&mut self, update: ProgressUpdate) {
        if update.total != self.len {
            self.len = update.total;
            self.pb.set_length(self.len as u64);
        }

        self.pb.set_position(update.iteration as u64 + 1);
        self.pb.set_message(&format!("loss {:.4}", update.loss));
    }
}
