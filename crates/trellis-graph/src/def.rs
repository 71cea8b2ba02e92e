//! Serializable graph descriptions.
//!
//! A [`GraphDef`] carries everything about a graph except the step functions
//! themselves: names, flags, gating, dependency order, retry and fan-out
//! knobs. Pair it with a [`Registry`] of named functions to build a runnable
//! [`StepGraph`](crate::StepGraph).

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::builder::GraphBuilder;
use crate::error::ConfigError;
use crate::graph::StepGraph;
use crate::step::{BoxError, ForkFailureMode, Gate, Step, StepFn, StepFuture};

/// Declarative description of a whole graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphDef {
  pub steps: Vec<StepDef>,
}

/// Declarative description of one step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepDef {
  pub name: String,
  #[serde(default)]
  pub start: bool,
  #[serde(default)]
  pub end: bool,
  #[serde(default)]
  pub fork: bool,
  /// Name of the paired fork; marks this step as a join.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub join_for: Option<String>,
  #[serde(default)]
  pub gate: Gate,
  #[serde(default)]
  pub depends_on: Vec<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub max_retries: Option<u32>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub concurrency: Option<usize>,
  #[serde(default)]
  pub failure_mode: ForkFailureMode,
}

/// Named step functions to pair with a [`GraphDef`].
#[derive(Default)]
pub struct Registry {
  funcs: HashMap<String, StepFn>,
}

impl Registry {
  pub fn new() -> Self {
    Self::default()
  }

  /// Register a function under a step name.
  pub fn register<F, Fut>(mut self, name: impl Into<String>, func: F) -> Self
  where
    F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, BoxError>> + Send + 'static,
  {
    self.funcs.insert(
      name.into(),
      Arc::new(move |inputs| Box::pin(func(inputs)) as StepFuture),
    );
    self
  }

  pub fn get(&self, name: &str) -> Option<&StepFn> {
    self.funcs.get(name)
  }
}

impl GraphBuilder {
  /// Build a graph from a declarative description and a function registry.
  ///
  /// Every step in the description must have a registered function;
  /// validation is otherwise identical to the programmatic builder.
  pub fn from_def(def: &GraphDef, registry: &Registry) -> Result<StepGraph, ConfigError> {
    let mut builder = GraphBuilder::new();
    for spec in &def.steps {
      let func = registry
        .get(&spec.name)
        .cloned()
        .ok_or_else(|| ConfigError::UnknownFunction(spec.name.clone()))?;

      let mut step = Step::from_fn(&spec.name, func)
        .gate(spec.gate)
        .failure_mode(spec.failure_mode)
        .depends_on(spec.depends_on.iter().cloned());
      if spec.start {
        step = step.start();
      }
      if spec.end {
        step = step.end();
      }
      if spec.fork {
        step = step.fork();
      }
      if let Some(fork) = &spec.join_for {
        step = step.join_for(fork.clone());
      }
      if let Some(max_retries) = spec.max_retries {
        step = step.max_retries(max_retries);
      }
      if let Some(concurrency) = spec.concurrency {
        step = step.concurrency(concurrency);
      }
      builder = builder.add(step);
    }
    builder.build()
  }
}
