//! Trellis engine
//!
//! The workflow scheduler for Trellis. A [`Scheduler`] owns an immutable
//! [`trellis_graph::StepGraph`] and drives it to quiescence: a ready queue of
//! steps plus a set of in-flight tasks, with dynamic parallel fan-out/fan-in
//! (fork/join), AND/OR activation gating, per-step bounded retry, and a
//! fire-and-forget event sink.
//!
//! ```ignore
//! let graph = GraphBuilder::new()
//!   .add(Step::new("fetch", fetch).start())
//!   .add(Step::new("summarize", summarize).depends_on(["fetch"]).end())
//!   .build()?;
//! let output = Scheduler::new(graph).run(json!("topic")).await?;
//! ```

mod error;
mod events;
mod history;
mod retry;
mod scheduler;
mod state;

pub use error::RunError;
pub use events::{ChannelNotifier, ExecutionEvent, ExecutionNotifier, NoopNotifier};
pub use history::{ExecutionRecord, StepOutcome};
pub use retry::{Retrier, RetryError};
pub use scheduler::{RunFailure, RunResult, Scheduler, SchedulerConfig};
