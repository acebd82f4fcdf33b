//! Progress reporter: consumes the event stream in its own task and renders
//! it. Losing the reporter never affects the run.

use crate::progress::{EventKind, ProgressEvent};
use std::collections::VecDeque;
use std::io::Write;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Rendering back-end.
pub trait ProgressSink: Send + 'static {
    fn render(&mut self, event: &ProgressEvent);

    /// Called once the stream ends.
    fn finish(&mut self) {}
}

/// Spawn the consumer task. Events with a sequence number not above the last
/// rendered one are dropped. Returns the sink when the stream closes.
pub fn spawn_reporter<S: ProgressSink>(
    mut receiver: mpsc::Receiver<ProgressEvent>,
    mut sink: S,
) -> JoinHandle<S> {
    tokio::spawn(async move {
        let mut last_seq = 0u64;
        while let Some(event) = receiver.recv().await {
            if event.seq <= last_seq {
                tracing::debug!(
                    "[ProgressReporter] Dropping late event #{} (last #{})",
                    event.seq,
                    last_seq
                );
                continue;
            }
            last_seq = event.seq;
            sink.render(&event);
        }
        sink.finish();
        sink
    })
}

fn subject(event: &ProgressEvent) -> String {
    match (&event.stage, &event.step) {
        (Some(stage), _) => stage.clone(),
        (None, Some(step)) => step.clone(),
        (None, None) => String::new(),
    }
}

/// Non-interactive back-end: one timestamped line per event.
pub struct LineSink<W: Write + Send + 'static> {
    out: W,
}

impl<W: Write + Send + 'static> LineSink<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

impl<W: Write + Send + 'static> ProgressSink for LineSink<W> {
    fn render(&mut self, event: &ProgressEvent) {
        let mut line = format!(
            "{} {:<22} {}",
            event.timestamp.format("%Y-%m-%dT%H:%M:%S%.3fZ"),
            event.kind.as_str(),
            subject(event)
        );
        if let Some(error) = &event.error {
            line.push_str(&format!(" error=\"{}\"", error));
        }
        let _ = writeln!(self.out, "{}", line.trim_end());
        let _ = self.out.flush();
    }
}

/// Interactive back-end: the last `history` finished items plus the one in
/// flight, redrawn in place.
pub struct InteractiveSink<W: Write + Send + 'static> {
    out: W,
    history: VecDeque<String>,
    capacity: usize,
    in_flight: Option<String>,
    drawn: usize,
}

impl<W: Write + Send + 'static> InteractiveSink<W> {
    pub fn new(out: W, capacity: usize) -> Self {
        Self {
            out,
            history: VecDeque::new(),
            capacity: capacity.max(1),
            in_flight: None,
            drawn: 0,
        }
    }

    fn push_history(&mut self, line: String) {
        if self.history.len() == self.capacity {
            self.history.pop_front();
        }
        self.history.push_back(line);
    }

    /// Lines currently on screen, oldest first.
    pub fn lines(&self) -> Vec<String> {
        let mut lines: Vec<String> = self.history.iter().cloned().collect();
        if let Some(current) = &self.in_flight {
            lines.push(format!("  ... {}", current));
        }
        lines
    }

    fn redraw(&mut self) {
        if self.drawn > 0 {
            // cursor up + clear to end of screen
            let _ = write!(self.out, "\x1b[{}A\x1b[J", self.drawn);
        }
        let lines = self.lines();
        for line in &lines {
            let _ = writeln!(self.out, "{}", line);
        }
        self.drawn = lines.len();
        let _ = self.out.flush();
    }
}

impl<W: Write + Send + 'static> ProgressSink for InteractiveSink<W> {
    fn render(&mut self, event: &ProgressEvent) {
        let name = subject(event);
        match event.kind {
            EventKind::StageStarting => self.in_flight = Some(name),
            EventKind::StepAdvanced => {
                if let Some(previous) = self.in_flight.replace(name) {
                    self.push_history(format!("  ok  {}", previous));
                }
            }
            EventKind::StageCompleted => {
                self.in_flight = None;
                self.push_history(format!("  ok  {}", name));
            }
            EventKind::StageSkipped => self.push_history(format!("  --  {} (done earlier)", name)),
            EventKind::StageFailed | EventKind::ProvisioningFailed => {
                self.in_flight = None;
                let error = event.error.clone().unwrap_or_default();
                self.push_history(format!("  !!  {} {}", name, error).trim_end().to_string());
            }
            EventKind::ProvisioningComplete => {
                if let Some(previous) = self.in_flight.take() {
                    self.push_history(format!("  ok  {}", previous));
                }
                self.push_history("  ok  cluster provisioned".to_string());
            }
            EventKind::ClusterUnreachable => {
                self.in_flight = None;
                self.push_history("  !!  cluster unreachable".to_string());
            }
            EventKind::Cancelled => {
                self.in_flight = None;
                self.push_history(format!("  !!  cancelled {}", name).trim_end().to_string());
            }
        }
        self.redraw();
    }
}
