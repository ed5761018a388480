//! Progress events and cooperative cancellation.
//!
//! Workers never touch shared counters. Each one holds a [`ProgressHandle`]
//! and sends discrete completion messages; a single [`ProgressAggregator`]
//! owns the counters and forwards [`ProgressEvent`]s to the caller's
//! [`ProgressSink`].

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
    mpsc::{self, Receiver, Sender},
};

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    AreaDetection,
    FrameExtraction,
    TextRecognition,
    Merge,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::AreaDetection => "area_detection",
            Stage::FrameExtraction => "frame_extraction",
            Stage::TextRecognition => "text_recognition",
            Stage::Merge => "merge",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ProgressEvent {
    StageStarted {
        stage: Stage,
        total: usize,
    },
    BatchCompleted {
        stage: Stage,
        completed: usize,
        total: usize,
    },
    /// Terminal event; nothing follows it.
    Finished {
        success: bool,
        message: String,
    },
}

/// Receives progress events on the aggregator thread.
pub trait ProgressSink: Send {
    fn on_event(&mut self, event: &ProgressEvent);
}

impl<F> ProgressSink for F
where
    F: FnMut(&ProgressEvent) + Send,
{
    fn on_event(&mut self, event: &ProgressEvent) {
        self(event)
    }
}

/// Discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl ProgressSink for NullSink {
    fn on_event(&mut self, _event: &ProgressEvent) {}
}

#[derive(Debug)]
enum ProgressMessage {
    Start { stage: Stage, total: usize },
    Completed { stage: Stage },
    Finish { success: bool, message: String },
}

/// Cheap, cloneable sender side of the progress channel.
#[derive(Debug, Clone)]
pub struct ProgressHandle {
    tx: Sender<ProgressMessage>,
}

impl ProgressHandle {
    pub fn start(&self, stage: Stage, total: usize) {
        let _ = self.tx.send(ProgressMessage::Start { stage, total });
    }

    pub fn batch_completed(&self, stage: Stage) {
        let _ = self.tx.send(ProgressMessage::Completed { stage });
    }

    pub fn finish(&self, success: bool, message: impl Into<String>) {
        let _ = self.tx.send(ProgressMessage::Finish {
            success,
            message: message.into(),
        });
    }
}

/// Final counters per stage: `(completed, total)`.
pub type ProgressTotals = BTreeMap<Stage, (usize, usize)>;

pub struct ProgressAggregator {
    rx: Receiver<ProgressMessage>,
}

/// Creates a connected handle/aggregator pair.
pub fn progress_channel() -> (ProgressHandle, ProgressAggregator) {
    let (tx, rx) = mpsc::channel();
    (ProgressHandle { tx }, ProgressAggregator { rx })
}

impl ProgressAggregator {
    /// Drains messages until every handle has been dropped.
    pub fn run(self, sink: &mut dyn ProgressSink) -> ProgressTotals {
        let mut counters = ProgressTotals::new();
        let mut finished = false;
        for message in self.rx {
            match message {
                ProgressMessage::Start { stage, total } => {
                    counters.insert(stage, (0, total));
                    sink.on_event(&ProgressEvent::StageStarted { stage, total });
                }
                ProgressMessage::Completed { stage } => {
                    let entry = counters.entry(stage).or_insert((0, 0));
                    entry.0 += 1;
                    // Totals may be unknown when a stage streams its input.
                    entry.1 = entry.1.max(entry.0);
                    let (completed, total) = *entry;
                    sink.on_event(&ProgressEvent::BatchCompleted {
                        stage,
                        completed,
                        total,
                    });
                }
                ProgressMessage::Finish { success, message } => {
                    if !finished {
                        finished = true;
                        sink.on_event(&ProgressEvent::Finished { success, message });
                    }
                }
            }
        }
        counters
    }
}

/// Cooperative cancellation flag shared by every worker of a run.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}
