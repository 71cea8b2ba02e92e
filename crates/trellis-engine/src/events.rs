//! Execution events for the observability sink.
//!
//! The scheduler emits events as a run progresses. Delivery is
//! fire-and-forget: the scheduler never blocks on or observes subscriber
//! behavior.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

/// Events emitted while a run is driven to quiescence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ExecutionEvent {
  /// A run has started.
  RunStarted { run_id: String },

  /// A step was dequeued and spawned.
  StepStarted { run_id: String, step: String },

  /// A step completed and its output was propagated.
  StepCompleted {
    run_id: String,
    step: String,
    output: Value,
  },

  /// A step's predicate withheld execution for this wave.
  StepSkipped { run_id: String, step: String },

  /// A step failed after its retries were exhausted.
  StepFailed {
    run_id: String,
    step: String,
    error: String,
  },

  /// The run reached quiescence with an end output.
  RunCompleted { run_id: String, output: Value },

  /// The run terminated with an error.
  RunFailed { run_id: String, error: String },
}

/// Sink for execution events.
///
/// The scheduler calls `notify` once per event; implementations decide what
/// to do with them (persist, stream, log, discard).
pub trait ExecutionNotifier: Send + Sync {
  fn notify(&self, event: ExecutionEvent);
}

/// Discards all events. The default sink.
#[derive(Debug, Clone, Default)]
pub struct NoopNotifier;

impl ExecutionNotifier for NoopNotifier {
  fn notify(&self, _event: ExecutionEvent) {}
}

/// Forwards events to an unbounded channel for asynchronous consumption.
///
/// Unbounded so a slow consumer can never stall the scheduler; the volume is
/// a handful of events per step, so growth stays small in practice.
#[derive(Debug, Clone)]
pub struct ChannelNotifier {
  sender: mpsc::UnboundedSender<ExecutionEvent>,
}

impl ChannelNotifier {
  pub fn new(sender: mpsc::UnboundedSender<ExecutionEvent>) -> Self {
    Self { sender }
  }
}

impl ExecutionNotifier for ChannelNotifier {
  fn notify(&self, event: ExecutionEvent) {
    // The receiver may already be gone; that is the subscriber's business.
    let _ = self.sender.send(event);
  }
}
