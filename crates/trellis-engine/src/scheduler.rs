//! The scheduler: drives a step graph to quiescence.
//!
//! A run keeps a FIFO ready queue and a set of in-flight step tasks. The
//! queue is seeded with the start step; each pass drains the queue, spawning
//! one task per ready step, then suspends until at least one in-flight task
//! completes. Completions propagate outputs into dependents' positional
//! buffers and may enqueue newly ready steps for the next pass. The run
//! terminates on quiescence: queue empty and nothing in flight.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde_json::{Value, json};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};
use trellis_graph::{BoxError, ForkFailureMode, LoopUntil, StepGraph, StepId, StepNode};

use crate::error::RunError;
use crate::events::{ExecutionEvent, ExecutionNotifier, NoopNotifier};
use crate::history::{ExecutionRecord, StepOutcome};
use crate::retry::{Retrier, RetryError};
use crate::state::RunState;

/// Retry and backoff defaults applied to steps without per-step overrides.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
  /// Default retry budget for steps that do not set their own.
  pub max_retries: u32,
  /// Multiplier applied to the backoff delay after each failed attempt.
  pub backoff_factor: f64,
  /// Delay after the first failed attempt.
  pub base_delay: Duration,
}

impl Default for SchedulerConfig {
  fn default() -> Self {
    Self {
      max_retries: 0,
      backoff_factor: 2.0,
      base_delay: Duration::from_millis(25),
    }
  }
}

/// Result of a completed run.
#[derive(Debug)]
pub struct RunResult {
  pub run_id: String,
  /// The end step's most recent output.
  pub output: Value,
  /// Append-only execution history per step, keyed by step name.
  pub history: HashMap<String, Vec<ExecutionRecord>>,
}

impl RunResult {
  /// The most recent history entry for a step, or none if it never ran.
  pub fn last_execution(&self, step: &str) -> Option<&ExecutionRecord> {
    self.history.get(step).and_then(|records| records.last())
  }

  /// All history entries for a step, oldest first.
  pub fn executions(&self, step: &str) -> &[ExecutionRecord] {
    self
      .history
      .get(step)
      .map(Vec::as_slice)
      .unwrap_or_default()
  }
}

/// A failed run together with the history recorded before the failure.
///
/// Steps that finished before the fatal one keep their records, and the
/// failed step's own record carries its attempt count and error.
#[derive(Debug)]
pub struct RunFailure {
  pub error: RunError,
  /// Execution history per step up to the point of failure.
  pub history: HashMap<String, Vec<ExecutionRecord>>,
}

impl RunFailure {
  /// The most recent history entry for a step, or none if it never ran.
  pub fn last_execution(&self, step: &str) -> Option<&ExecutionRecord> {
    self.history.get(step).and_then(|records| records.last())
  }

  /// All history entries for a step, oldest first.
  pub fn executions(&self, step: &str) -> &[ExecutionRecord] {
    self
      .history
      .get(step)
      .map(Vec::as_slice)
      .unwrap_or_default()
  }
}

impl std::fmt::Display for RunFailure {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    self.error.fmt(f)
  }
}

impl std::error::Error for RunFailure {
  fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
    Some(&self.error)
  }
}

/// The workflow scheduler.
///
/// Owns an immutable [`StepGraph`] and executes it to quiescence. All per-run
/// mutable state is allocated fresh inside each call, so one scheduler can
/// serve repeated or concurrent runs.
///
/// Generic over `N: ExecutionNotifier` for the observability sink. Use
/// [`Scheduler::new`] for a default scheduler that discards events, or
/// [`Scheduler::with_notifier`] to observe them.
pub struct Scheduler<N: ExecutionNotifier = NoopNotifier> {
  graph: Arc<StepGraph>,
  config: SchedulerConfig,
  notifier: N,
}

impl Scheduler<NoopNotifier> {
  /// Create a scheduler with default retry configuration and no event sink.
  pub fn new(graph: StepGraph) -> Self {
    Self::with_notifier(graph, SchedulerConfig::default(), NoopNotifier)
  }

  /// Create a scheduler with custom retry defaults and no event sink.
  pub fn with_config(graph: StepGraph, config: SchedulerConfig) -> Self {
    Self::with_notifier(graph, config, NoopNotifier)
  }
}

impl<N: ExecutionNotifier> Scheduler<N> {
  /// Create a scheduler with a custom event sink.
  pub fn with_notifier(graph: StepGraph, config: SchedulerConfig, notifier: N) -> Self {
    Self {
      graph: Arc::new(graph),
      config,
      notifier,
    }
  }

  /// The graph this scheduler executes.
  pub fn graph(&self) -> &StepGraph {
    &self.graph
  }

  /// Run the graph once with a fresh cancellation token, returning the end
  /// step's output.
  pub async fn run(&self, input: Value) -> Result<Value, RunError> {
    self
      .execute(input, CancellationToken::new())
      .await
      .map(|result| result.output)
      .map_err(|failure| failure.error)
  }

  /// Run the graph once, returning the end output together with the run's
  /// execution history. On failure the history recorded up to that point
  /// comes back in the [`RunFailure`].
  pub async fn execute(
    &self,
    input: Value,
    cancel: CancellationToken,
  ) -> Result<RunResult, RunFailure> {
    let run_id = uuid::Uuid::new_v4().to_string();
    self.notifier.notify(ExecutionEvent::RunStarted {
      run_id: run_id.clone(),
    });
    info!(run_id = %run_id, steps = self.graph.len(), "run started");

    let result = self.drive(&run_id, input, &cancel).await;

    match &result {
      Ok(run) => {
        self.notifier.notify(ExecutionEvent::RunCompleted {
          run_id: run_id.clone(),
          output: run.output.clone(),
        });
        info!(run_id = %run_id, "run completed");
      }
      Err(e) => {
        self.notifier.notify(ExecutionEvent::RunFailed {
          run_id: run_id.clone(),
          error: e.to_string(),
        });
        error!(run_id = %run_id, error = %e, "run failed");
      }
    }

    result
  }

  /// The scheduler loop.
  #[instrument(name = "run", skip_all, fields(run_id = %run_id))]
  async fn drive(
    &self,
    run_id: &str,
    initial: Value,
    cancel: &CancellationToken,
  ) -> Result<RunResult, RunFailure> {
    let graph = Arc::clone(&self.graph);
    let mut state = RunState::new(&graph);
    let mut ready: VecDeque<StepId> = VecDeque::from([graph.start()]);
    let mut in_flight: JoinSet<StepReport> = JoinSet::new();

    loop {
      if cancel.is_cancelled() {
        warn!(run_id = %run_id, "run cancelled");
        return Err(RunFailure {
          error: RunError::Cancelled,
          history: state.into_history(&graph),
        });
      }

      while let Some(id) = ready.pop_front() {
        let node = graph.get(id);
        let inputs = state.inputs_for(&graph, id, &initial);
        self.notifier.notify(ExecutionEvent::StepStarted {
          run_id: run_id.to_string(),
          step: node.name.clone(),
        });
        info!(run_id = %run_id, step = %node.name, "step started");
        let retrier = self.retrier_for(node);
        in_flight.spawn(run_step(Arc::clone(&graph), id, inputs, retrier, cancel.clone()));
      }

      // Suspend until at least one task completes, not all of them; any
      // dependents it makes ready are drained on the next pass.
      let joined = tokio::select! {
        joined = in_flight.join_next() => joined,
        _ = cancel.cancelled() => {
          warn!(run_id = %run_id, "run cancelled while steps were in flight");
          return Err(RunFailure {
            error: RunError::Cancelled,
            history: state.into_history(&graph),
          });
        }
      };
      let Some(joined) = joined else {
        break; // quiescence
      };
      let report = match joined {
        Ok(report) => report,
        Err(e) => {
          return Err(RunFailure {
            error: RunError::Task {
              message: e.to_string(),
            },
            history: state.into_history(&graph),
          });
        }
      };

      let step_name = graph.get(report.id).name.clone();
      state.record(report.id, report.record);

      if let Some(failure) = report.failure {
        self.notifier.notify(ExecutionEvent::StepFailed {
          run_id: run_id.to_string(),
          step: step_name.clone(),
          error: failure.to_string(),
        });
        error!(run_id = %run_id, step = %step_name, error = %failure, "step failed");
        return Err(RunFailure {
          error: failure,
          history: state.into_history(&graph),
        });
      }

      match report.output {
        Some(output) => {
          self.notifier.notify(ExecutionEvent::StepCompleted {
            run_id: run_id.to_string(),
            step: step_name.clone(),
            output: output.clone(),
          });
          info!(run_id = %run_id, step = %step_name, "step completed");
          if report.id == graph.end() {
            state.end_output = Some(output.clone());
          }
          ready.extend(state.propagate(&graph, report.id, &output));
        }
        None => {
          self.notifier.notify(ExecutionEvent::StepSkipped {
            run_id: run_id.to_string(),
            step: step_name.clone(),
          });
          info!(run_id = %run_id, step = %step_name, "step skipped");
        }
      }
    }

    let Some(output) = state.end_output.take() else {
      return Err(RunFailure {
        error: RunError::EndNeverRan,
        history: state.into_history(&graph),
      });
    };
    Ok(RunResult {
      run_id: run_id.to_string(),
      output,
      history: state.into_history(&graph),
    })
  }

  fn retrier_for(&self, node: &StepNode) -> Retrier {
    Retrier::new(
      node.max_retries.unwrap_or(self.config.max_retries),
      self.config.backoff_factor,
      self.config.base_delay,
    )
  }
}

/// What a spawned step task hands back to the scheduler loop.
struct StepReport {
  id: StepId,
  record: ExecutionRecord,
  /// The propagatable output; none for a skip or a failure.
  output: Option<Value>,
  failure: Option<RunError>,
}

/// Execute one step: predicates, input dispatch by step kind, retry, history.
async fn run_step(
  graph: Arc<StepGraph>,
  id: StepId,
  inputs: Vec<Value>,
  retrier: Retrier,
  cancel: CancellationToken,
) -> StepReport {
  let node = graph.get(id);
  let started_at = Utc::now();

  if node.predicates.iter().any(|pred| !pred(&inputs)) {
    return StepReport {
      id,
      record: close_record(node, started_at, inputs, 0, StepOutcome::Skipped),
      output: None,
      failure: None,
    };
  }

  let result = if node.flags.fork {
    run_fork(node, &inputs, &retrier, &cancel).await
  } else if let Some(loop_until) = &node.loop_until {
    run_loop(node, loop_until, inputs.clone(), &retrier, &cancel).await
  } else {
    let func = Arc::clone(&node.func);
    let call_inputs = inputs.clone();
    retrier
      .run(&cancel, move || func(call_inputs.clone()))
      .await
      .map_err(|e| step_failure(&node.name, e))
  };

  match result {
    Ok((output, attempts)) => StepReport {
      id,
      record: close_record(
        node,
        started_at,
        inputs,
        attempts,
        StepOutcome::Completed {
          output: output.clone(),
        },
      ),
      output: Some(output),
      failure: None,
    },
    Err(failure) => StepReport {
      id,
      record: close_record(
        node,
        started_at,
        inputs,
        failure_attempts(&failure),
        StepOutcome::Failed {
          error: failure.to_string(),
        },
      ),
      output: None,
      failure: Some(failure),
    },
  }
}

/// Fan a fork out over its work items with an order-preserving bounded
/// stream. Item order in the result array follows work-item order, never
/// completion order.
async fn run_fork(
  node: &StepNode,
  inputs: &[Value],
  retrier: &Retrier,
  cancel: &CancellationToken,
) -> Result<(Value, u32), RunError> {
  let items = inputs
    .first()
    .and_then(Value::as_array)
    .cloned()
    .ok_or_else(|| RunError::ForkInput {
      step: node.name.clone(),
    })?;
  if items.is_empty() {
    return Ok((Value::Array(Vec::new()), 0));
  }

  let limit = node.concurrency.unwrap_or(items.len()).max(1);
  let invocations = items.into_iter().map(|item| {
    let retrier = retrier.clone();
    let func = Arc::clone(&node.func);
    let cancel = cancel.clone();
    async move {
      retrier
        .run(&cancel, move || func(vec![item.clone()]))
        .await
    }
  });
  let results: Vec<Result<(Value, u32), RetryError>> =
    stream::iter(invocations).buffered(limit).collect().await;

  let mut outputs = Vec::with_capacity(results.len());
  let mut attempts = 0u32;
  // Attempts are summed across every item before an abort is reported, so
  // the failure carries the work the whole fan-out actually spent.
  let mut first_failed: Option<(usize, BoxError)> = None;
  for (ix, result) in results.into_iter().enumerate() {
    match (result, node.failure_mode) {
      (Ok((value, used)), ForkFailureMode::Abort) => {
        attempts += used;
        outputs.push(value);
      }
      (Ok((value, used)), ForkFailureMode::Isolate) => {
        attempts += used;
        outputs.push(json!({ "ok": value }));
      }
      (Err(RetryError::Cancelled), _) => return Err(RunError::Cancelled),
      (Err(RetryError::Exhausted { attempts: used, source }), ForkFailureMode::Abort) => {
        attempts += used;
        if first_failed.is_none() {
          first_failed = Some((ix, source));
        }
      }
      (Err(RetryError::Exhausted { attempts: used, source }), ForkFailureMode::Isolate) => {
        attempts += used;
        outputs.push(json!({ "err": source.to_string() }));
      }
    }
  }
  if let Some((item, source)) = first_failed {
    return Err(RunError::FanOut {
      step: node.name.clone(),
      item,
      attempts,
      source,
    });
  }
  Ok((Value::Array(outputs), attempts))
}

/// Rerun a loop step until its exit predicate accepts an output. Iteration 1
/// receives the assembled inputs; later iterations receive the previous
/// output as their single input.
async fn run_loop(
  node: &StepNode,
  loop_until: &LoopUntil,
  mut inputs: Vec<Value>,
  retrier: &Retrier,
  cancel: &CancellationToken,
) -> Result<(Value, u32), RunError> {
  let mut attempts = 0u32;
  for _ in 0..loop_until.max_iterations {
    let func = Arc::clone(&node.func);
    let call_inputs = inputs.clone();
    let (output, used) = retrier
      .run(cancel, move || func(call_inputs.clone()))
      .await
      .map_err(|e| step_failure(&node.name, e))?;
    attempts += used;
    if (loop_until.exit)(&output) {
      return Ok((output, attempts));
    }
    inputs = vec![output];
  }
  Err(RunError::LoopExhausted {
    step: node.name.clone(),
    iterations: loop_until.max_iterations,
  })
}

fn step_failure(step: &str, err: RetryError) -> RunError {
  match err {
    RetryError::Cancelled => RunError::Cancelled,
    RetryError::Exhausted { attempts, source } => RunError::Step {
      step: step.to_string(),
      attempts,
      source,
    },
  }
}

fn failure_attempts(err: &RunError) -> u32 {
  match err {
    RunError::Step { attempts, .. } | RunError::FanOut { attempts, .. } => *attempts,
    _ => 0,
  }
}

fn close_record(
  node: &StepNode,
  started_at: DateTime<Utc>,
  inputs: Vec<Value>,
  attempts: u32,
  outcome: StepOutcome,
) -> ExecutionRecord {
  let finished_at = Utc::now();
  ExecutionRecord {
    step: node.name.clone(),
    started_at,
    finished_at,
    duration_ms: (finished_at - started_at).num_milliseconds(),
    attempts,
    inputs,
    outcome,
  }
}
