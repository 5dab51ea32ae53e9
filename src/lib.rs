//! presto core library: native test discovery, fixture resolution, and
//! execution for Python test suites.
//!
//! The crate is organised as a pipeline: [`discovery`] produces items and a
//! fixture registry, [`resolver`] computes per-item setup plans, [`plan`]
//! orders everything into sync steps and async batches, and [`executor`]
//! drives the plan while emitting the [`events`] stream a renderer consumes.

pub mod cache;
pub mod cli;
pub mod config;
pub mod diagnostics;
pub mod discovery;
pub mod events;
pub mod executor;
pub mod model;
pub mod plan;
pub mod python;
pub mod registry;
pub mod resolver;

use std::path::PathBuf;

use pyo3::prelude::*;

pub use config::RunConfig;
pub use events::{CollectingSink, EventSink, NullSink, RunEvent};
pub use model::{Outcome, RunReport, RunnerError};

/// Discover, plan, and execute: the full pipeline for one invocation.
/// Emits `RunStarted`/`RunEnded` around the per-item event stream and
/// rewrites the persisted outcome cache before returning.
pub fn run(
    paths: &[PathBuf],
    config: &RunConfig,
    sink: &mut dyn EventSink,
) -> Result<RunReport, RunnerError> {
    Python::with_gil(|py| {
        let discovered = discovery::discover(py, paths, config)?;

        let cache_dir = config.cache_dir_under(&discovered.root);
        let previous = cache::read_outcomes(&cache_dir);
        let plan = plan::build_plan(
            &discovered.items,
            &discovered.setups,
            config,
            previous.as_ref(),
        );

        sink.emit(&RunEvent::RunStarted {
            total_items: plan.item_count(),
            ascii_mode: config.ascii_mode,
        });

        let report = executor::execute(
            py,
            &discovered.items,
            &discovered.setups,
            &discovered.registry,
            &plan,
            config,
            sink,
        );

        // Merge over the previous record so items outside this plan keep
        // their last known outcome.
        cache::write_outcomes(&cache_dir, &report, previous.as_ref());

        sink.emit(&RunEvent::RunEnded {
            summary: report.summary,
        });
        Ok(report)
    })
}

/// Discovery and planning only: the ids that would run, in plan order.
pub fn collect(paths: &[PathBuf], config: &RunConfig) -> Result<Vec<String>, RunnerError> {
    Python::with_gil(|py| {
        let discovered = discovery::discover(py, paths, config)?;
        let cache_dir = config.cache_dir_under(&discovered.root);
        let previous = cache::read_outcomes(&cache_dir);
        let plan = plan::build_plan(
            &discovered.items,
            &discovered.setups,
            config,
            previous.as_ref(),
        );
        Ok(plan
            .item_indices()
            .into_iter()
            .map(|index| discovered.items[index].id.clone())
            .collect())
    })
}
