//! Optional terminal progress bar drawn on stderr next to the JSON event stream

use indicatif::{ProgressBar, ProgressStyle};

use pairtune_training::{ProgressEvent, ProgressSink};

pub struct BarSink<S: ProgressSink> {
    inner: S,
    bar: Option<ProgressBar>,
}

impl<S: ProgressSink> BarSink<S> {
    pub fn new(inner: S) -> Self {
        Self { inner, bar: None }
    }

    fn bar(&mut self, total_steps: usize) -> &ProgressBar {
        self.bar.get_or_insert_with(|| {
            let pb = ProgressBar::new(total_steps as u64);
            let style = ProgressStyle::default_bar()
                .template("  {bar:30.green/black} {pos}/{len} [{elapsed}<{eta}] {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar());
            pb.set_style(style);
            pb
        })
    }
}

impl<S: ProgressSink> ProgressSink for BarSink<S> {
    fn emit(&mut self, event: ProgressEvent) {
        match (&event, &self.bar) {
            (ProgressEvent::Metrics(m), Some(pb)) => {
                pb.set_message(format!("loss: {:.4} | lr: {:.2e}", m.loss, m.learning_rate));
            }
            (ProgressEvent::Complete { .. } | ProgressEvent::Error { .. }, Some(pb)) => pb.finish(),
            _ => {}
        }
        self.inner.emit(event);
    }

    fn on_step(&mut self, step: usize, total_steps: usize) {
        self.bar(total_steps).set_position(step as u64);
        self.inner.on_step(step, total_steps);
    }
}
