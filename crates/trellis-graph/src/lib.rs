//! Trellis graph
//!
//! This crate provides the immutable graph representation for Trellis.
//! Steps are declared explicitly through [`GraphBuilder`] (or parsed from a
//! [`GraphDef`] plus a [`Registry`] of named functions) and validated once,
//! eagerly, into a [`StepGraph`] that is safely shareable across runs.
//!
//! Key properties of a built graph:
//! - exactly one start step and exactly one end step
//! - every dependency reference resolves; the topology is cycle-free
//! - each edge is assigned a fixed positional slot in the dependent's input
//!   buffer at declaration time, so out-of-order completion cannot corrupt
//!   input positions
//! - forks have exactly one upstream (the work-list producer) and every join
//!   declares its paired fork as a dependency

mod builder;
mod def;
mod error;
mod graph;
mod step;

pub use builder::GraphBuilder;
pub use def::{GraphDef, Registry, StepDef};
pub use error::ConfigError;
pub use graph::{StepGraph, StepId, StepNode};
pub use step::{
  BoxError, ExitPredicate, ForkFailureMode, Gate, LoopUntil, Predicate, Step, StepFlags, StepFn,
  StepFuture,
};
