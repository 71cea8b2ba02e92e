use std::collections::HashMap;
use std::fmt;

use crate::step::{ForkFailureMode, Gate, LoopUntil, Predicate, StepFlags, StepFn};

/// Dense index of a step within a [`StepGraph`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StepId(pub(crate) usize);

impl StepId {
  pub fn index(self) -> usize {
    self.0
  }
}

/// A validated step plus its wiring inside the graph.
pub struct StepNode {
  pub name: String,
  pub func: StepFn,
  pub flags: StepFlags,
  pub gate: Gate,
  pub max_retries: Option<u32>,
  /// Ordered upstream steps. Position `i` here is positional slot `i` in
  /// this step's input buffer.
  pub deps: Vec<StepId>,
  /// Reverse edges: `(dependent, slot)` where `slot` is the fixed index in
  /// the dependent's input buffer assigned when the edge was declared.
  pub dependents: Vec<(StepId, usize)>,
  pub predicates: Vec<Predicate>,
  pub concurrency: Option<usize>,
  pub failure_mode: ForkFailureMode,
  /// For a join step, the id of its paired fork.
  pub join_of: Option<StepId>,
  pub loop_until: Option<LoopUntil>,
}

impl fmt::Debug for StepNode {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("StepNode")
      .field("name", &self.name)
      .field("flags", &self.flags)
      .field("gate", &self.gate)
      .field("deps", &self.deps)
      .field("dependents", &self.dependents)
      .finish_non_exhaustive()
  }
}

/// The immutable dependency graph, built once by
/// [`GraphBuilder`](crate::GraphBuilder) and safely shareable across runs.
#[derive(Debug)]
pub struct StepGraph {
  pub(crate) nodes: Vec<StepNode>,
  pub(crate) ids: HashMap<String, StepId>,
  pub(crate) start: StepId,
  pub(crate) end: StepId,
}

impl StepGraph {
  /// Number of steps in the graph.
  pub fn len(&self) -> usize {
    self.nodes.len()
  }

  pub fn is_empty(&self) -> bool {
    self.nodes.is_empty()
  }

  /// The single start step.
  pub fn start(&self) -> StepId {
    self.start
  }

  /// The single end step.
  pub fn end(&self) -> StepId {
    self.end
  }

  /// Look up a step id by name.
  pub fn id_of(&self, name: &str) -> Option<StepId> {
    self.ids.get(name).copied()
  }

  /// Get a step by id.
  ///
  /// # Panics
  /// Panics if the id did not come from this graph.
  pub fn get(&self, id: StepId) -> &StepNode {
    &self.nodes[id.0]
  }

  /// Get a step by name.
  pub fn get_by_name(&self, name: &str) -> Option<&StepNode> {
    self.id_of(name).map(|id| self.get(id))
  }

  /// Iterate all steps in insertion order.
  pub fn steps(&self) -> impl Iterator<Item = &StepNode> {
    self.nodes.iter()
  }

  /// Names of a step's upstream dependencies, in declared (slot) order.
  pub fn dependencies(&self, name: &str) -> Option<Vec<&str>> {
    let node = self.get_by_name(name)?;
    Some(
      node
        .deps
        .iter()
        .map(|id| self.get(*id).name.as_str())
        .collect(),
    )
  }

  /// Names of the steps that depend on the given step.
  pub fn dependents(&self, name: &str) -> Option<Vec<&str>> {
    let node = self.get_by_name(name)?;
    Some(
      node
        .dependents
        .iter()
        .map(|(id, _)| self.get(*id).name.as_str())
        .collect(),
    )
  }
}
