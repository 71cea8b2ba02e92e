use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use trellis_engine::{
  ChannelNotifier, ExecutionEvent, RunError, Scheduler, SchedulerConfig, StepOutcome,
};
use trellis_graph::{BoxError, ForkFailureMode, Gate, GraphBuilder, Step};

fn passthrough(name: &str) -> Step {
  Step::new(name, |inputs| async move {
    Ok::<_, BoxError>(inputs.into_iter().next().unwrap_or(Value::Null))
  })
}

fn emit(name: &str, value: Value) -> Step {
  Step::new(name, move |_inputs| {
    let value = value.clone();
    async move { Ok::<_, BoxError>(value) }
  })
}

/// Emit a value after a delay, to force a specific completion order.
fn emit_after(name: &str, value: Value, delay: Duration) -> Step {
  Step::new(name, move |_inputs| {
    let value = value.clone();
    async move {
      tokio::time::sleep(delay).await;
      Ok::<_, BoxError>(value)
    }
  })
}

fn counting(name: &str, counter: Arc<AtomicUsize>) -> Step {
  Step::new(name, move |inputs| {
    counter.fetch_add(1, Ordering::SeqCst);
    async move {
      Ok::<_, BoxError>(inputs.into_iter().next().unwrap_or(Value::Null))
    }
  })
}

fn fast_retries() -> SchedulerConfig {
  SchedulerConfig {
    base_delay: Duration::from_millis(1),
    ..SchedulerConfig::default()
  }
}

#[tokio::test]
async fn and_gated_inputs_arrive_in_declared_order() {
  // The first-declared dependency completes last; its output must still land
  // in slot 0 of the dependent's buffer.
  let graph = GraphBuilder::new()
    .add(passthrough("start").start())
    .add(emit_after("slow", json!("slow"), Duration::from_millis(40)).depends_on(["start"]))
    .add(emit("fast", json!("fast")).depends_on(["start"]))
    .add(
      Step::new("merge", |inputs| async move {
        Ok::<_, BoxError>(Value::Array(inputs))
      })
      .depends_on(["slow", "fast"])
      .end(),
    )
    .build()
    .unwrap();

  let output = Scheduler::new(graph).run(json!("x")).await.unwrap();
  assert_eq!(output, json!(["slow", "fast"]));
}

#[tokio::test]
async fn three_branches_join_in_fixed_declaration_order() {
  fn branch(name: &'static str, delay_ms: u64) -> Step {
    Step::new(name, move |inputs| async move {
      tokio::time::sleep(Duration::from_millis(delay_ms)).await;
      let seed = inputs[0].as_str().unwrap_or_default().to_string();
      Ok::<_, BoxError>(json!(format!("{name}:{seed}")))
    })
  }

  let graph = GraphBuilder::new()
    .add(passthrough("start").start())
    .add(branch("a", 30).depends_on(["start"]))
    .add(branch("b", 0).depends_on(["start"]))
    .add(branch("c", 15).depends_on(["start"]))
    .add(
      Step::new("merge", |inputs| async move {
        Ok::<_, BoxError>(Value::Array(inputs))
      })
      .depends_on(["a", "b", "c"])
      .end(),
    )
    .build()
    .unwrap();

  let output = Scheduler::new(graph).run(json!("x")).await.unwrap();
  assert_eq!(output, json!(["a:x", "b:x", "c:x"]));
}

#[tokio::test]
async fn fork_results_arrive_in_item_order_and_join_sees_all_of_them() {
  let joined = Arc::new(Mutex::new(Value::Null));
  let captured = joined.clone();

  let graph = GraphBuilder::new()
    .add(passthrough("start").start())
    .add(
      // Earlier items sleep longer, so completion order is reversed.
      Step::new("scale", |inputs| async move {
        let item = inputs[0].as_i64().unwrap();
        tokio::time::sleep(Duration::from_millis((3 - item as u64) * 20)).await;
        Ok::<_, BoxError>(json!(item * 2))
      })
      .fork()
      .depends_on(["start"]),
    )
    .add(
      Step::new("gather", move |inputs| {
        let captured = captured.clone();
        async move {
          *captured.lock().unwrap() = inputs[0].clone();
          Ok::<_, BoxError>(inputs[0].clone())
        }
      })
      .join_for("scale")
      .depends_on(["scale"]),
    )
    .add(
      Step::new("total", |inputs| async move {
        let sum: i64 = inputs[0]
          .as_array()
          .unwrap()
          .iter()
          .filter_map(Value::as_i64)
          .sum();
        Ok::<_, BoxError>(json!(sum))
      })
      .depends_on(["gather"])
      .end(),
    )
    .build()
    .unwrap();

  let output = Scheduler::new(graph).run(json!([1, 2, 3])).await.unwrap();
  assert_eq!(output, json!(12));
  assert_eq!(*joined.lock().unwrap(), json!([2, 4, 6]));
}

#[tokio::test]
async fn bounded_fork_concurrency_still_preserves_item_order() {
  let graph = GraphBuilder::new()
    .add(passthrough("start").start())
    .add(
      Step::new("scale", |inputs| async move {
        let item = inputs[0].as_i64().unwrap();
        tokio::time::sleep(Duration::from_millis((4 - item as u64) * 10)).await;
        Ok::<_, BoxError>(json!(item * 10))
      })
      .fork()
      .concurrency(2)
      .depends_on(["start"]),
    )
    .add(
      passthrough("gather")
        .join_for("scale")
        .depends_on(["scale"])
        .end(),
    )
    .build()
    .unwrap();

  let output = Scheduler::new(graph).run(json!([1, 2, 3])).await.unwrap();
  assert_eq!(output, json!([10, 20, 30]));
}

#[tokio::test]
async fn or_gated_step_executes_once_per_upstream_delivery() {
  let count = Arc::new(AtomicUsize::new(0));

  let graph = GraphBuilder::new()
    .add(passthrough("start").start())
    .add(emit("a", json!("a")).depends_on(["start"]))
    .add(emit("b", json!("b")).depends_on(["start"]))
    .add(
      counting("any", count.clone())
        .gate(Gate::Or)
        .depends_on(["a", "b"]),
    )
    .add(passthrough("end").depends_on(["any"]).end())
    .build()
    .unwrap();

  Scheduler::new(graph).run(json!(null)).await.unwrap();
  assert_eq!(count.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn false_predicate_skips_the_step_and_withholds_propagation() {
  let gated_runs = Arc::new(AtomicUsize::new(0));

  let graph = GraphBuilder::new()
    .add(passthrough("start").start())
    .add(
      emit("vetoed", json!("never"))
        .predicate(|_inputs| false)
        .depends_on(["start"]),
    )
    .add(emit("allowed", json!("ok")).depends_on(["start"]))
    .add(
      counting("gated", gated_runs.clone()).depends_on(["vetoed", "allowed"]),
    )
    .add(passthrough("end").depends_on(["allowed"]).end())
    .build()
    .unwrap();

  let result = Scheduler::new(graph)
    .execute(json!(null), CancellationToken::new())
    .await
    .unwrap();

  // The AND-gated dependent of a skipped upstream never becomes ready.
  assert_eq!(gated_runs.load(Ordering::SeqCst), 0);
  assert!(result.executions("gated").is_empty());

  let vetoed = result.last_execution("vetoed").unwrap();
  assert_eq!(vetoed.outcome, StepOutcome::Skipped);
  assert_eq!(vetoed.attempts, 0);
}

#[tokio::test]
async fn retry_budget_allows_success_on_the_final_attempt() {
  let calls = Arc::new(AtomicUsize::new(0));
  let calls_in_step = calls.clone();

  let graph = GraphBuilder::new()
    .add(passthrough("start").start())
    .add(
      Step::new("flaky", move |_inputs| {
        let n = calls_in_step.fetch_add(1, Ordering::SeqCst) + 1;
        async move {
          if n < 3 {
            Err::<Value, BoxError>(format!("attempt {n} failed").into())
          } else {
            Ok(json!("recovered"))
          }
        }
      })
      .max_retries(2)
      .depends_on(["start"]),
    )
    .add(passthrough("end").depends_on(["flaky"]).end())
    .build()
    .unwrap();

  let result = Scheduler::with_config(graph, fast_retries())
    .execute(json!(null), CancellationToken::new())
    .await
    .unwrap();

  assert_eq!(result.output, json!("recovered"));
  assert_eq!(calls.load(Ordering::SeqCst), 3);

  // One logical completion in the history, carrying the attempt count.
  let records = result.executions("flaky");
  assert_eq!(records.len(), 1);
  assert_eq!(records[0].attempts, 3);
  assert!(records[0].succeeded());
}

#[tokio::test]
async fn exhausted_retries_are_fatal_and_the_end_step_never_runs() {
  let end_runs = Arc::new(AtomicUsize::new(0));

  let graph = GraphBuilder::new()
    .add(passthrough("start").start())
    .add(
      Step::new("boom", |_inputs| async move {
        Err::<Value, BoxError>("kaput".into())
      })
      .max_retries(0)
      .depends_on(["start"]),
    )
    .add(counting("end", end_runs.clone()).depends_on(["boom"]).end())
    .build()
    .unwrap();

  let err = Scheduler::new(graph).run(json!(null)).await.unwrap_err();
  assert!(
    matches!(&err, RunError::Step { step, attempts: 1, .. } if step == "boom"),
    "unexpected error: {err}"
  );
  assert_eq!(end_runs.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn failed_runs_keep_their_history_up_to_the_failure() {
  let graph = GraphBuilder::new()
    .add(emit("start", json!("seed")).start())
    .add(
      Step::new("boom", |_inputs| async move {
        Err::<Value, BoxError>("kaput".into())
      })
      .max_retries(2)
      .depends_on(["start"]),
    )
    .add(passthrough("end").depends_on(["boom"]).end())
    .build()
    .unwrap();

  let failure = Scheduler::with_config(graph, fast_retries())
    .execute(json!(null), CancellationToken::new())
    .await
    .unwrap_err();

  assert!(
    matches!(&failure.error, RunError::Step { step, attempts: 3, .. } if step == "boom"),
    "unexpected error: {failure}"
  );

  // Steps that finished before the failure keep their records.
  let start = failure.last_execution("start").unwrap();
  assert!(start.succeeded());

  // The failed step's own record carries its outcome and attempt count.
  let boom = failure.last_execution("boom").unwrap();
  assert_eq!(boom.attempts, 3);
  assert!(matches!(&boom.outcome, StepOutcome::Failed { error } if error.contains("boom")));
  assert!(failure.executions("end").is_empty());
}

#[tokio::test]
async fn one_failed_fork_item_fails_the_whole_fork() {
  let graph = GraphBuilder::new()
    .add(passthrough("start").start())
    .add(
      Step::new("scale", |inputs| async move {
        let item = inputs[0].as_i64().unwrap();
        if item == 2 {
          Err::<Value, BoxError>("bad item".into())
        } else {
          Ok(json!(item * 2))
        }
      })
      .fork()
      .depends_on(["start"]),
    )
    .add(
      passthrough("gather")
        .join_for("scale")
        .depends_on(["scale"])
        .end(),
    )
    .build()
    .unwrap();

  let err = Scheduler::new(graph).run(json!([1, 2, 3])).await.unwrap_err();
  assert!(
    matches!(&err, RunError::FanOut { step, item: 1, .. } if step == "scale"),
    "unexpected error: {err}"
  );
}

#[tokio::test]
async fn failed_fork_history_counts_every_item_invocation() {
  let graph = GraphBuilder::new()
    .add(passthrough("start").start())
    .add(
      Step::new("scale", |inputs| async move {
        let item = inputs[0].as_i64().unwrap();
        if item == 2 {
          Err::<Value, BoxError>("bad item".into())
        } else {
          Ok(json!(item * 2))
        }
      })
      .fork()
      .max_retries(1)
      .depends_on(["start"]),
    )
    .add(
      passthrough("gather")
        .join_for("scale")
        .depends_on(["scale"])
        .end(),
    )
    .build()
    .unwrap();

  let failure = Scheduler::with_config(graph, fast_retries())
    .execute(json!([1, 2, 3]), CancellationToken::new())
    .await
    .unwrap_err();

  // Items 1 and 3 succeed first try; item 2 burns its whole budget.
  assert!(
    matches!(&failure.error, RunError::FanOut { step, item: 1, attempts: 4, .. } if step == "scale"),
    "unexpected error: {failure}"
  );
  let record = failure.last_execution("scale").unwrap();
  assert_eq!(record.attempts, 4);
  assert!(matches!(record.outcome, StepOutcome::Failed { .. }));
}

#[tokio::test]
async fn isolate_mode_collects_per_item_outcomes_without_failing() {
  let graph = GraphBuilder::new()
    .add(passthrough("start").start())
    .add(
      Step::new("scale", |inputs| async move {
        let item = inputs[0].as_i64().unwrap();
        if item == 2 {
          Err::<Value, BoxError>("bad item".into())
        } else {
          Ok(json!(item * 2))
        }
      })
      .fork()
      .failure_mode(ForkFailureMode::Isolate)
      .depends_on(["start"]),
    )
    .add(
      passthrough("gather")
        .join_for("scale")
        .depends_on(["scale"])
        .end(),
    )
    .build()
    .unwrap();

  let output = Scheduler::new(graph).run(json!([1, 2, 3])).await.unwrap();
  let manifest = output.as_array().unwrap();
  assert_eq!(manifest.len(), 3);
  assert_eq!(manifest[0], json!({ "ok": 2 }));
  assert!(manifest[1].get("err").is_some());
  assert_eq!(manifest[2], json!({ "ok": 6 }));
}

#[tokio::test]
async fn fork_over_a_non_array_dependency_is_a_fatal_error() {
  let graph = GraphBuilder::new()
    .add(passthrough("start").start())
    .add(passthrough("scale").fork().depends_on(["start"]))
    .add(
      passthrough("gather")
        .join_for("scale")
        .depends_on(["scale"])
        .end(),
    )
    .build()
    .unwrap();

  let err = Scheduler::new(graph).run(json!("not a list")).await.unwrap_err();
  assert!(matches!(&err, RunError::ForkInput { step } if step == "scale"));
}

#[tokio::test]
async fn loop_step_reruns_until_its_exit_condition_holds() {
  let graph = GraphBuilder::new()
    .add(emit("start", json!(0)).start())
    .add(
      Step::new("grow", |inputs| async move {
        let n = inputs[0].as_i64().unwrap_or(0);
        Ok::<_, BoxError>(json!(n + 1))
      })
      .loop_until(|output| output.as_i64() == Some(3), 10)
      .depends_on(["start"]),
    )
    .add(passthrough("end").depends_on(["grow"]).end())
    .build()
    .unwrap();

  let result = Scheduler::new(graph)
    .execute(json!(null), CancellationToken::new())
    .await
    .unwrap();

  assert_eq!(result.output, json!(3));
  assert_eq!(result.last_execution("grow").unwrap().attempts, 3);
}

#[tokio::test]
async fn loop_step_hitting_its_cap_is_a_fatal_error() {
  let graph = GraphBuilder::new()
    .add(emit("start", json!(0)).start())
    .add(
      Step::new("grow", |inputs| async move {
        let n = inputs[0].as_i64().unwrap_or(0);
        Ok::<_, BoxError>(json!(n + 1))
      })
      .loop_until(|_output| false, 2)
      .depends_on(["start"]),
    )
    .add(passthrough("end").depends_on(["grow"]).end())
    .build()
    .unwrap();

  let err = Scheduler::new(graph).run(json!(null)).await.unwrap_err();
  assert!(
    matches!(&err, RunError::LoopExhausted { step, iterations: 2 } if step == "grow"),
    "unexpected error: {err}"
  );
}

#[tokio::test]
async fn cancellation_aborts_the_run() {
  let graph = GraphBuilder::new()
    .add(passthrough("start").start())
    .add(
      Step::new("stall", |_inputs| async move {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Ok::<_, BoxError>(Value::Null)
      })
      .depends_on(["start"]),
    )
    .add(passthrough("end").depends_on(["stall"]).end())
    .build()
    .unwrap();

  let cancel = CancellationToken::new();
  let trigger = cancel.clone();
  tokio::spawn(async move {
    tokio::time::sleep(Duration::from_millis(20)).await;
    trigger.cancel();
  });

  let err = Scheduler::new(graph)
    .execute(json!(null), cancel)
    .await
    .unwrap_err();
  assert!(matches!(err.error, RunError::Cancelled));
}

#[tokio::test]
async fn quiescence_without_an_end_output_is_an_error() {
  let graph = GraphBuilder::new()
    .add(passthrough("start").start())
    .add(
      passthrough("end")
        .predicate(|_inputs| false)
        .depends_on(["start"])
        .end(),
    )
    .build()
    .unwrap();

  let err = Scheduler::new(graph).run(json!(null)).await.unwrap_err();
  assert!(matches!(err, RunError::EndNeverRan));
}

#[tokio::test]
async fn repeated_runs_get_fresh_state() {
  let runs = Arc::new(AtomicUsize::new(0));

  let graph = GraphBuilder::new()
    .add(passthrough("start").start())
    .add(counting("work", runs.clone()).depends_on(["start"]).end())
    .build()
    .unwrap();

  let scheduler = Scheduler::new(graph);
  let first = scheduler
    .execute(json!("x"), CancellationToken::new())
    .await
    .unwrap();
  let second = scheduler
    .execute(json!("x"), CancellationToken::new())
    .await
    .unwrap();

  assert_eq!(runs.load(Ordering::SeqCst), 2);
  assert_eq!(first.output, second.output);
  // Histories do not leak between runs.
  assert_eq!(first.executions("work").len(), 1);
  assert_eq!(second.executions("work").len(), 1);
  assert_ne!(first.run_id, second.run_id);
}

#[tokio::test]
async fn events_trace_the_run_from_start_to_completion() {
  let graph = GraphBuilder::new()
    .add(passthrough("start").start())
    .add(emit("work", json!("done")).depends_on(["start"]).end())
    .build()
    .unwrap();

  let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
  let scheduler =
    Scheduler::with_notifier(graph, SchedulerConfig::default(), ChannelNotifier::new(tx));
  scheduler.run(json!(null)).await.unwrap();

  let mut events = Vec::new();
  while let Ok(event) = rx.try_recv() {
    events.push(event);
  }

  assert!(matches!(events.first(), Some(ExecutionEvent::RunStarted { .. })));
  assert!(matches!(events.last(), Some(ExecutionEvent::RunCompleted { .. })));
  assert!(events.iter().any(
    |e| matches!(e, ExecutionEvent::StepStarted { step, .. } if step == "start")
  ));
  assert!(events.iter().any(
    |e| matches!(e, ExecutionEvent::StepCompleted { step, .. } if step == "work")
  ));
}
