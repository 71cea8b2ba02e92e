//! Run errors.

use trellis_graph::BoxError;

/// Errors that can occur while driving a run to quiescence.
///
/// The scheduler retries nothing itself and recovers nothing locally; every
/// variant here is fatal to the run and produces no partial output.
#[derive(Debug, thiserror::Error)]
pub enum RunError {
  /// A step's retries were exhausted.
  #[error("step '{step}' failed after {attempts} attempts")]
  Step {
    step: String,
    attempts: u32,
    #[source]
    source: BoxError,
  },

  /// A single fork item's retries were exhausted (all-or-nothing mode).
  /// `attempts` counts function invocations across the whole fan-out.
  #[error("fork '{step}' item {item} failed after {attempts} attempts")]
  FanOut {
    step: String,
    item: usize,
    attempts: u32,
    #[source]
    source: BoxError,
  },

  /// A fork's dependency produced something other than an array of work items.
  #[error("fork '{step}' requires its dependency to produce an array of work items")]
  ForkInput { step: String },

  /// A loop step hit its iteration cap without satisfying its exit condition.
  #[error("step '{step}' exhausted {iterations} loop iterations without satisfying its exit condition")]
  LoopExhausted { step: String, iterations: u32 },

  /// The run reached quiescence without the end step ever producing output.
  #[error("end step never produced an output")]
  EndNeverRan,

  /// The run was cancelled.
  #[error("run cancelled")]
  Cancelled,

  /// A spawned step task failed to join.
  #[error("step task failed to join: {message}")]
  Task { message: String },
}
