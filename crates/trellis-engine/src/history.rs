//! Per-step execution history.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Final disposition of one logical step execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StepOutcome {
  Completed { output: Value },
  Failed { error: String },
  Skipped,
}

/// One append-only history entry: a single logical completion of a step.
///
/// Retries inside the entry are folded into `attempts`; a step that failed
/// twice and succeeded on the third try records one entry with
/// `attempts == 3`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRecord {
  pub step: String,
  pub started_at: DateTime<Utc>,
  pub finished_at: DateTime<Utc>,
  pub duration_ms: i64,
  /// Total function invocations including the successful one; 0 for a skip.
  pub attempts: u32,
  /// The positional inputs the step was invoked with.
  pub inputs: Vec<Value>,
  pub outcome: StepOutcome,
}

impl ExecutionRecord {
  pub fn succeeded(&self) -> bool {
    matches!(self.outcome, StepOutcome::Completed { .. })
  }

  /// The output, if this execution completed.
  pub fn output(&self) -> Option<&Value> {
    match &self.outcome {
      StepOutcome::Completed { output } => Some(output),
      _ => None,
    }
  }
}
