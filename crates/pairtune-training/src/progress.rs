//! Structured progress events, one JSON object per line

use serde::Serialize;
use std::io::Write;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ProgressEvent {
    Complete { message: String, saved_to: String },
    Message { message: String },
    Warning { warning: String },
    Error { error: String },
    Metrics(StepMetrics),
    ValLoss { val_loss: f64, step: usize },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepMetrics {
    pub loss: f64,
    pub grad_norm: f64,
    pub learning_rate: f64,
    /// Fractional epoch: global step over steps per epoch.
    pub epoch: f64,
    pub step: usize,
}

impl ProgressEvent {
    pub fn message(msg: impl Into<String>) -> Self {
        ProgressEvent::Message { message: msg.into() }
    }

    pub fn warning(msg: impl Into<String>) -> Self {
        ProgressEvent::Warning { warning: msg.into() }
    }

    pub fn error(msg: impl Into<String>) -> Self {
        ProgressEvent::Error { error: msg.into() }
    }

    pub fn complete(saved_to: &std::path::Path) -> Self {
        ProgressEvent::Complete {
            message: "Training complete".into(),
            saved_to: saved_to.display().to_string(),
        }
    }

    pub fn to_json(&self) -> String {
        // Only strings and numbers inside; serialization cannot fail.
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Consumer of progress events. Nothing ever reads back from it.
pub trait ProgressSink {
    fn emit(&mut self, event: ProgressEvent);

    /// Called after every optimizer step, logged or not.
    fn on_step(&mut self, _step: usize, _total_steps: usize) {}
}

/// Writes each event as one line and flushes, so readers see it at once.
pub struct JsonLinesSink<W: Write> {
    writer: W,
}

impl<W: Write> JsonLinesSink<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl JsonLinesSink<std::io::Stdout> {
    pub fn stdout() -> Self {
        Self::new(std::io::stdout())
    }
}

impl<W: Write> ProgressSink for JsonLinesSink<W> {
    fn emit(&mut self, event: ProgressEvent) {
        let line = event.to_json();
        if let Err(e) = writeln!(self.writer, "{line}").and_then(|_| self.writer.flush()) {
            tracing::warn!("dropping progress event: {}", e);
        }
    }
}

/// Keeps every event in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    pub events: Vec<ProgressEvent>,
    pub steps_seen: usize,
}

impl MemorySink {
    pub fn messages(&self) -> Vec<&str> {
        self.events
            .iter()
            .filter_map(|e| match e {
                ProgressEvent::Message { message } => Some(message.as_str()),
                _ => None,
            })
            .collect()
    }

    pub fn metrics(&self) -> Vec<&StepMetrics> {
        self.events
            .iter()
            .filter_map(|e| match e {
                ProgressEvent::Metrics(m) => Some(m),
                _ => None,
            })
            .collect()
    }
}

impl ProgressSink for MemorySink {
    fn emit(&mut self, event: ProgressEvent) {
        self.events.push(event);
    }

    fn on_step(&mut self, _step: usize, _total_steps: usize) {
        self.steps_seen += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_event_shapes() {
        let cases = [
            (ProgressEvent::message("Starting training loop"), json!({"message": "Starting training loop"})),
            (ProgressEvent::error("Dataset is empty"), json!({"error": "Dataset is empty"})),
            (ProgressEvent::warning("skipped 2"), json!({"warning": "skipped 2"})),
            (
                ProgressEvent::complete(std::path::Path::new("out/ft")),
                json!({"message": "Training complete", "saved_to": "out/ft"}),
            ),
            (
                ProgressEvent::ValLoss { val_loss: 1.5, step: 4 },
                json!({"val_loss": 1.5, "step": 4}),
            ),
            (
                ProgressEvent::Metrics(StepMetrics {
                    loss: 2.5,
                    grad_norm: 0.5,
                    learning_rate: 1e-4,
                    epoch: 0.5,
                    step: 2,
                }),
                json!({"loss": 2.5, "grad_norm": 0.5, "learning_rate": 1e-4, "epoch": 0.5, "step": 2}),
            ),
        ];
        for (event, expected) in cases {
            let parsed: serde_json::Value = serde_json::from_str(&event.to_json()).unwrap();
            assert_eq!(parsed, expected);
        }
    }

    #[test]
    fn test_json_lines_one_event_per_line() {
        let mut sink = JsonLinesSink::new(Vec::new());
        sink.emit(ProgressEvent::message("a"));
        sink.emit(ProgressEvent::message("b\nc"));

        let out = String::from_utf8(sink.into_inner()).unwrap();
        assert_eq!(out, "{\"message\":\"a\"}\n{\"message\":\"b\\nc\"}\n");
    }
}
