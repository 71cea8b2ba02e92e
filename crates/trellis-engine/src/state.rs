//! Per-run mutable execution state.
//!
//! The graph topology is immutable and shared; everything that changes during
//! a run lives here and is allocated fresh for every run. All mutation
//! happens on the scheduler loop between awaits, never inside spawned step
//! tasks.

use std::collections::{HashMap, HashSet};

use serde_json::Value;
use trellis_graph::{Gate, StepGraph, StepId};

use crate::history::ExecutionRecord;

pub(crate) struct RunState {
  /// Positional input buffer per step; length always equals the step's
  /// dependency count.
  buffers: Vec<Vec<Value>>,
  /// For AND-gated steps, the slots that have delivered since the last
  /// activation. Cleared when the step becomes ready, so it can become
  /// ready again on a later delivery wave.
  delivered: Vec<HashSet<usize>>,
  /// Append-only execution history per step.
  histories: Vec<Vec<ExecutionRecord>>,
  /// Most recent output of the end step, if it has run.
  pub(crate) end_output: Option<Value>,
}

impl RunState {
  pub(crate) fn new(graph: &StepGraph) -> Self {
    Self {
      buffers: graph
        .steps()
        .map(|step| vec![Value::Null; step.deps.len()])
        .collect(),
      delivered: vec![HashSet::new(); graph.len()],
      histories: vec![Vec::new(); graph.len()],
      end_output: None,
    }
  }

  /// Snapshot the inputs a step will be invoked with. The start step
  /// receives the run's top-level input as its single slot.
  pub(crate) fn inputs_for(&self, graph: &StepGraph, id: StepId, initial: &Value) -> Vec<Value> {
    if id == graph.start() {
      vec![initial.clone()]
    } else {
      self.buffers[id.index()].clone()
    }
  }

  pub(crate) fn record(&mut self, id: StepId, record: ExecutionRecord) {
    self.histories[id.index()].push(record);
  }

  /// Deliver a completed step's output to its dependents, writing into the
  /// slot fixed at edge-declaration time. Returns the dependents that became
  /// ready: OR-gated dependents on every delivery, AND-gated dependents
  /// exactly when their delivered set reaches the full dependency set
  /// (which then clears).
  pub(crate) fn propagate(
    &mut self,
    graph: &StepGraph,
    from: StepId,
    output: &Value,
  ) -> Vec<StepId> {
    let mut ready = Vec::new();
    for &(dependent, slot) in &graph.get(from).dependents {
      self.buffers[dependent.index()][slot] = output.clone();
      match graph.get(dependent).gate {
        Gate::Or => ready.push(dependent),
        Gate::And => {
          let delivered = &mut self.delivered[dependent.index()];
          delivered.insert(slot);
          if delivered.len() == graph.get(dependent).deps.len() {
            delivered.clear();
            ready.push(dependent);
          }
        }
      }
    }
    ready
  }

  pub(crate) fn into_history(self, graph: &StepGraph) -> HashMap<String, Vec<ExecutionRecord>> {
    graph
      .steps()
      .zip(self.histories)
      .map(|(step, records)| (step.name.clone(), records))
      .collect()
  }
}
