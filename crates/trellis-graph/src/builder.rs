use std::collections::HashMap;

use crate::error::ConfigError;
use crate::graph::{StepGraph, StepId, StepNode};
use crate::step::Step;

/// Explicit, programmatic graph construction.
///
/// The builder validates eagerly at [`build`](GraphBuilder::build) time, so a
/// misconfigured graph fails before any run: exactly one start and one end
/// step, resolvable dependencies, fork/join pairing, and a cycle-free
/// topology (bounded loops use [`Step::loop_until`] instead of back-edges).
#[derive(Default)]
pub struct GraphBuilder {
  steps: Vec<Step>,
}

impl GraphBuilder {
  pub fn new() -> Self {
    Self::default()
  }

  /// Add a declared step.
  pub fn add(mut self, step: Step) -> Self {
    self.steps.push(step);
    self
  }

  /// Validate the declarations and produce the immutable graph.
  pub fn build(self) -> Result<StepGraph, ConfigError> {
    let mut ids: HashMap<String, StepId> = HashMap::new();
    for (ix, step) in self.steps.iter().enumerate() {
      if ids.insert(step.name.clone(), StepId(ix)).is_some() {
        return Err(ConfigError::DuplicateStep(step.name.clone()));
      }
    }

    let start = Self::single_flagged(&self.steps, |s| s.flags.start)
      .map_err(|(first, second)| match first {
        Some(first) => ConfigError::MultipleStart { first, second },
        None => ConfigError::MissingStart,
      })?;
    let end = Self::single_flagged(&self.steps, |s| s.flags.end)
      .map_err(|(first, second)| match first {
        Some(first) => ConfigError::MultipleEnd { first, second },
        None => ConfigError::MissingEnd,
      })?;

    // Resolve dependency references into ids; declaration order fixes the
    // positional slot each upstream writes into.
    let mut deps: Vec<Vec<StepId>> = Vec::with_capacity(self.steps.len());
    for step in &self.steps {
      let mut resolved = Vec::with_capacity(step.depends_on.len());
      for dep in &step.depends_on {
        let id = ids.get(dep).copied().ok_or_else(|| ConfigError::UnknownDependency {
          step: step.name.clone(),
          dependency: dep.clone(),
        })?;
        resolved.push(id);
      }
      deps.push(resolved);
    }

    for (ix, step) in self.steps.iter().enumerate() {
      if step.flags.fork && deps[ix].len() != 1 {
        return Err(ConfigError::ForkArity {
          step: step.name.clone(),
          found: deps[ix].len(),
        });
      }
    }

    // A join pairs with a fork it directly depends on; the fork's slot in
    // the join's buffer carries the ordered fan-out results.
    let mut join_of: Vec<Option<StepId>> = vec![None; self.steps.len()];
    for (ix, step) in self.steps.iter().enumerate() {
      let Some(fork_name) = &step.join_for else {
        continue;
      };
      let fork_id = ids
        .get(fork_name)
        .copied()
        .filter(|id| self.steps[id.0].flags.fork)
        .ok_or_else(|| ConfigError::UnpairedJoin {
          step: step.name.clone(),
          fork: fork_name.clone(),
        })?;
      if !deps[ix].contains(&fork_id) {
        return Err(ConfigError::JoinNotDownstream {
          step: step.name.clone(),
          fork: fork_name.clone(),
        });
      }
      join_of[ix] = Some(fork_id);
    }

    let mut dependents: Vec<Vec<(StepId, usize)>> = vec![Vec::new(); self.steps.len()];
    for (ix, resolved) in deps.iter().enumerate() {
      for (slot, dep) in resolved.iter().enumerate() {
        dependents[dep.0].push((StepId(ix), slot));
      }
    }

    Self::detect_cycles(&self.steps, &deps)?;
    Self::check_reachability(&self.steps, &dependents, start)?;

    let nodes = self
      .steps
      .into_iter()
      .enumerate()
      .map(|(ix, step)| StepNode {
        name: step.name,
        func: step.func,
        flags: step.flags,
        gate: step.gate,
        max_retries: step.max_retries,
        deps: deps[ix].clone(),
        dependents: std::mem::take(&mut dependents[ix]),
        predicates: step.predicates,
        concurrency: step.concurrency,
        failure_mode: step.failure_mode,
        join_of: join_of[ix],
        loop_until: step.loop_until,
      })
      .collect();

    Ok(StepGraph {
      nodes,
      ids,
      start,
      end,
    })
  }

  /// Find the single step matching the flag. `Err((None, _))` means no
  /// match, `Err((Some(first), second))` means more than one.
  fn single_flagged(
    steps: &[Step],
    flag: impl Fn(&Step) -> bool,
  ) -> Result<StepId, (Option<String>, String)> {
    let mut found: Option<StepId> = None;
    for (ix, step) in steps.iter().enumerate() {
      if !flag(step) {
        continue;
      }
      match found {
        None => found = Some(StepId(ix)),
        Some(first) => {
          return Err((Some(steps[first.0].name.clone()), step.name.clone()));
        }
      }
    }
    found.ok_or((None, String::new()))
  }

  /// Depth-first three-color search over dependency edges. Any back-edge is
  /// an accidental cycle; deliberate loops are expressed with
  /// [`Step::loop_until`].
  fn detect_cycles(steps: &[Step], deps: &[Vec<StepId>]) -> Result<(), ConfigError> {
    #[derive(Clone, Copy, PartialEq)]
    enum Color {
      White,
      Gray,
      Black,
    }

    fn visit(
      at: usize,
      steps: &[Step],
      deps: &[Vec<StepId>],
      colors: &mut [Color],
      trail: &mut Vec<usize>,
    ) -> Result<(), ConfigError> {
      colors[at] = Color::Gray;
      trail.push(at);
      for dep in &deps[at] {
        match colors[dep.0] {
          Color::Black => {}
          Color::White => visit(dep.0, steps, deps, colors, trail)?,
          Color::Gray => {
            let from = trail.iter().position(|&ix| ix == dep.0).unwrap_or(0);
            let mut path: Vec<&str> = trail[from..].iter().map(|&ix| steps[ix].name.as_str()).collect();
            path.push(steps[dep.0].name.as_str());
            return Err(ConfigError::CycleDetected {
              path: path.join(" -> "),
            });
          }
        }
      }
      trail.pop();
      colors[at] = Color::Black;
      Ok(())
    }

    let mut colors = vec![Color::White; steps.len()];
    let mut trail = Vec::new();
    for ix in 0..steps.len() {
      if colors[ix] == Color::White {
        visit(ix, steps, deps, &mut colors, &mut trail)?;
      }
    }
    Ok(())
  }

  /// Every step must be reachable from the start step, or it can never be
  /// enqueued.
  fn check_reachability(
    steps: &[Step],
    dependents: &[Vec<(StepId, usize)>],
    start: StepId,
  ) -> Result<(), ConfigError> {
    let mut seen = vec![false; steps.len()];
    let mut stack = vec![start.0];
    seen[start.0] = true;
    while let Some(at) = stack.pop() {
      for (dep, _) in &dependents[at] {
        if !seen[dep.0] {
          seen[dep.0] = true;
          stack.push(dep.0);
        }
      }
    }
    match seen.iter().position(|reached| !reached) {
      Some(ix) => Err(ConfigError::Unreachable(steps[ix].name.clone())),
      None => Ok(()),
    }
  }
}
