//! Scheduler: turns discovered items into an ordered execution plan.
//!
//! The plan is built upfront and is pure data; execution never reorders it.
//! Async items that can safely share a cooperative event loop are grouped
//! into contiguous batches here.

use std::collections::BTreeMap;

use crate::config::RunConfig;
use crate::model::{Outcome, Scope, TestItem};
use crate::resolver::SetupPlan;

/// One step of the plan: a single synchronous (or isolated async) item, or
/// a batch of async items gathered onto one shared loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlanStep {
    Test(usize),
    Batch(Vec<usize>),
}

#[derive(Debug, Default)]
pub struct TestPlan {
    pub steps: Vec<PlanStep>,
}

impl TestPlan {
    /// Number of items across all steps.
    pub fn item_count(&self) -> usize {
        self.steps
            .iter()
            .map(|step| match step {
                PlanStep::Test(_) => 1,
                PlanStep::Batch(members) => members.len(),
            })
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Item indices in plan order.
    pub fn item_indices(&self) -> Vec<usize> {
        let mut indices = Vec::new();
        for step in &self.steps {
            match step {
                PlanStep::Test(index) => indices.push(*index),
                PlanStep::Batch(members) => indices.extend(members.iter().copied()),
            }
        }
        indices
    }
}

/// The loop-scope key under which an item may join a batch, or `None` when
/// the item must run on the sequential path.
///
/// Eligibility mirrors the gather rules: an explicit `function` loop scope
/// isolates the test, `session`/`package` scopes (explicit or forced by an
/// async fixture) need a loop that outlives any batch, and everything else
/// shares a class- or module-scoped loop.
pub fn batch_key(item: &TestItem, setup: Option<&SetupPlan>) -> Option<(Scope, String)> {
    if !item.is_async || item.blocked.is_some() {
        return None;
    }
    let setup = setup?;
    if setup.has_broad_async_fixture() {
        return None;
    }

    let scope = match item.loop_scope {
        Some(Scope::Class) => Scope::Class,
        Some(Scope::Module) => Scope::Module,
        Some(_) => return None,
        None => match setup.widest_async_scope {
            Some(Scope::Session) | Some(Scope::Package) => return None,
            Some(Scope::Class) => Scope::Class,
            // Tests without async fixtures default to the module loop for
            // gathering purposes.
            _ => Scope::Module,
        },
    };
    Some((scope, item.scope_key(scope)))
}

/// Build the plan: pattern filter, last-failed selection or failed-first
/// reordering, then batch formation over the surviving order.
pub fn build_plan(
    items: &[TestItem],
    setups: &[Option<SetupPlan>],
    config: &RunConfig,
    previous: Option<&BTreeMap<String, Outcome>>,
) -> TestPlan {
    let mut indices: Vec<usize> = (0..items.len()).collect();

    if let Some(pattern) = &config.pattern {
        indices.retain(|&index| items[index].id.contains(pattern.as_str()));
    }

    if config.last_failed {
        if let Some(previous) = previous {
            indices.retain(|&index| {
                previous
                    .get(&items[index].id)
                    .map(Outcome::is_red)
                    .unwrap_or(false)
            });
        }
    } else if config.failed_first {
        if let Some(previous) = previous {
            let (red, rest): (Vec<usize>, Vec<usize>) = indices.into_iter().partition(|&index| {
                previous
                    .get(&items[index].id)
                    .map(Outcome::is_red)
                    .unwrap_or(false)
            });
            indices = red;
            indices.extend(rest);
        }
    }

    let mut plan = TestPlan::default();
    // Fail-fast suppresses batching entirely: a batch is atomic and would
    // keep running peers after the first failure.
    if config.fail_fast {
        plan.steps = indices.into_iter().map(PlanStep::Test).collect();
        return plan;
    }

    let mut pending: Vec<usize> = Vec::new();
    let mut pending_key: Option<(Scope, String)> = None;
    for index in indices {
        let key = batch_key(&items[index], setups.get(index).and_then(Option::as_ref));
        match key {
            Some(key) => {
                if pending_key.as_ref() == Some(&key) {
                    pending.push(index);
                } else {
                    flush(&mut plan, &mut pending);
                    pending_key = Some(key);
                    pending.push(index);
                }
            }
            None => {
                flush(&mut plan, &mut pending);
                pending_key = None;
                plan.steps.push(PlanStep::Test(index));
            }
        }
    }
    flush(&mut plan, &mut pending);
    plan
}

/// A single-member "batch" reverts to the sequential path.
fn flush(plan: &mut TestPlan, pending: &mut Vec<usize>) {
    match pending.len() {
        0 => {}
        1 => plan.steps.push(PlanStep::Test(pending[0])),
        _ => plan.steps.push(PlanStep::Batch(std::mem::take(pending))),
    }
    pending.clear();
}
