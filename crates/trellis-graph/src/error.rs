use thiserror::Error;

/// Errors raised while assembling a step graph, before any run.
#[derive(Debug, Error)]
pub enum ConfigError {
  #[error("duplicate step name: {0}")]
  DuplicateStep(String),

  #[error("no step is flagged as start")]
  MissingStart,

  #[error("more than one step is flagged as start: '{first}' and '{second}'")]
  MultipleStart { first: String, second: String },

  #[error("no step is flagged as end")]
  MissingEnd,

  #[error("more than one step is flagged as end: '{first}' and '{second}'")]
  MultipleEnd { first: String, second: String },

  #[error("step '{step}' depends on unknown step '{dependency}'")]
  UnknownDependency { step: String, dependency: String },

  #[error("fork step '{step}' must have exactly one dependency, found {found}")]
  ForkArity { step: String, found: usize },

  #[error("join step '{step}' names '{fork}' which is not a fork step")]
  UnpairedJoin { step: String, fork: String },

  #[error("join step '{step}' must declare its fork '{fork}' as a dependency")]
  JoinNotDownstream { step: String, fork: String },

  #[error("dependency cycle detected: {path}")]
  CycleDetected { path: String },

  #[error("step '{0}' is unreachable from the start step")]
  Unreachable(String),

  #[error("no function registered for step '{0}'")]
  UnknownFunction(String),
}
