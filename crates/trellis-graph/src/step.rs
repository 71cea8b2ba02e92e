use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Error type produced by user step functions.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Boxed future returned by a step function.
pub type StepFuture = BoxFuture<'static, Result<Value, BoxError>>;

/// A step's async function. Receives its positional inputs (one slot per
/// declared dependency; the start step receives the run's top-level input
/// as its single slot).
pub type StepFn = Arc<dyn Fn(Vec<Value>) -> StepFuture + Send + Sync>;

/// A guard evaluated against the assembled inputs before a step runs.
/// Any predicate returning false skips the step for that wave.
pub type Predicate = Arc<dyn Fn(&[Value]) -> bool + Send + Sync>;

/// Exit condition for a bounded loop step, evaluated on each iteration's
/// output.
pub type ExitPredicate = Arc<dyn Fn(&Value) -> bool + Send + Sync>;

/// Activation gate: when does a step become ready relative to its upstreams.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Gate {
  /// Ready exactly when every declared dependency has delivered since the
  /// last activation.
  #[default]
  And,
  /// Ready on every single upstream delivery, independently. Duplicate
  /// executions are intentional any-of semantics.
  Or,
}

/// How a fork step treats a single work item's unrecovered failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ForkFailureMode {
  /// Any item failure fails the whole fork (all-or-nothing scatter/gather).
  #[default]
  Abort,
  /// Collect per-item outcomes into an ordered manifest of
  /// `{"ok": value}` / `{"err": message}` objects; the fork itself succeeds.
  Isolate,
}

/// Structural role flags for a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StepFlags {
  pub start: bool,
  pub end: bool,
  pub fork: bool,
  pub join: bool,
}

/// Bounded loop configuration: rerun the step's function until the exit
/// predicate accepts an output, up to `max_iterations`.
#[derive(Clone)]
pub struct LoopUntil {
  pub exit: ExitPredicate,
  pub max_iterations: u32,
}

impl fmt::Debug for LoopUntil {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("LoopUntil")
      .field("max_iterations", &self.max_iterations)
      .finish_non_exhaustive()
  }
}

/// A declared unit of work, fed to [`GraphBuilder`](crate::GraphBuilder).
///
/// Construct with [`Step::new`] and the fluent setters:
///
/// ```ignore
/// Step::new("fetch", |inputs| async move { .. })
///   .depends_on(["start"])
///   .max_retries(2)
/// ```
#[derive(Clone)]
pub struct Step {
  pub(crate) name: String,
  pub(crate) func: StepFn,
  pub(crate) flags: StepFlags,
  pub(crate) gate: Gate,
  pub(crate) max_retries: Option<u32>,
  pub(crate) depends_on: Vec<String>,
  pub(crate) predicates: Vec<Predicate>,
  pub(crate) concurrency: Option<usize>,
  pub(crate) failure_mode: ForkFailureMode,
  pub(crate) join_for: Option<String>,
  pub(crate) loop_until: Option<LoopUntil>,
}

impl Step {
  /// Declare a step wrapping the given async function.
  pub fn new<F, Fut>(name: impl Into<String>, func: F) -> Self
  where
    F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, BoxError>> + Send + 'static,
  {
    Self::from_fn(name, Arc::new(move |inputs| Box::pin(func(inputs)) as StepFuture))
  }

  /// Declare a step from an already-boxed function (used by the registry).
  pub fn from_fn(name: impl Into<String>, func: StepFn) -> Self {
    Self {
      name: name.into(),
      func,
      flags: StepFlags::default(),
      gate: Gate::default(),
      max_retries: None,
      depends_on: Vec::new(),
      predicates: Vec::new(),
      concurrency: None,
      failure_mode: ForkFailureMode::default(),
      join_for: None,
      loop_until: None,
    }
  }

  /// Flag this step as the run's entry point. Exactly one step must be.
  pub fn start(mut self) -> Self {
    self.flags.start = true;
    self
  }

  /// Flag this step as the run's terminal step. Exactly one step must be.
  pub fn end(mut self) -> Self {
    self.flags.end = true;
    self
  }

  /// Flag this step as a fork: its single dependency's output is treated as
  /// an array of work items and the function is invoked once per item.
  pub fn fork(mut self) -> Self {
    self.flags.fork = true;
    self
  }

  /// Flag this step as the join paired with the named fork. The fork must
  /// also appear in this step's dependencies; its slot carries the full
  /// ordered result array.
  pub fn join_for(mut self, fork: impl Into<String>) -> Self {
    self.flags.join = true;
    self.join_for = Some(fork.into());
    self
  }

  /// Set the activation gate (default [`Gate::And`]).
  pub fn gate(mut self, gate: Gate) -> Self {
    self.gate = gate;
    self
  }

  /// Declare ordered upstream dependencies. The declaration order fixes
  /// each upstream's positional slot in this step's input buffer.
  pub fn depends_on<I, S>(mut self, deps: I) -> Self
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    self.depends_on.extend(deps.into_iter().map(Into::into));
    self
  }

  /// Per-step retry budget, overriding the scheduler default.
  pub fn max_retries(mut self, max_retries: u32) -> Self {
    self.max_retries = Some(max_retries);
    self
  }

  /// Add a predicate guard. If any predicate returns false the step is
  /// skipped for that wave: no output, no delivery to dependents.
  pub fn predicate<P>(mut self, pred: P) -> Self
  where
    P: Fn(&[Value]) -> bool + Send + Sync + 'static,
  {
    self.predicates.push(Arc::new(pred));
    self
  }

  /// Bound a fork's fan-out concurrency (default: one permit per item).
  pub fn concurrency(mut self, limit: usize) -> Self {
    self.concurrency = Some(limit);
    self
  }

  /// Set the fork failure policy (default [`ForkFailureMode::Abort`]).
  pub fn failure_mode(mut self, mode: ForkFailureMode) -> Self {
    self.failure_mode = mode;
    self
  }

  /// Rerun this step until `exit` accepts its output, at most
  /// `max_iterations` times. Iteration 1 receives the step's assembled
  /// inputs; later iterations receive the previous output as their single
  /// input.
  pub fn loop_until<P>(mut self, exit: P, max_iterations: u32) -> Self
  where
    P: Fn(&Value) -> bool + Send + Sync + 'static,
  {
    self.loop_until = Some(LoopUntil {
      exit: Arc::new(exit),
      max_iterations,
    });
    self
  }

  pub fn name(&self) -> &str {
    &self.name
  }
}

impl fmt::Debug for Step {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Step")
      .field("name", &self.name)
      .field("flags", &self.flags)
      .field("gate", &self.gate)
      .field("depends_on", &self.depends_on)
      .field("max_retries", &self.max_retries)
      .finish_non_exhaustive()
  }
}
