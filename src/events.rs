//! Structured event stream consumed by renderers outside the core.
//!
//! Emission order is a contract: events follow plan order even when tests
//! inside an async batch complete in a different order.

use serde::Serialize;

use crate::model::{Diagnostic, Outcome, Summary};

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RunEvent {
    RunStarted {
        total_items: usize,
        /// Renderer hint; the core attaches it and otherwise ignores it.
        ascii_mode: bool,
    },
    TestStarted {
        id: String,
        path: String,
    },
    TestEnded {
        id: String,
        outcome: Outcome,
        duration: f64,
        stdout: Option<String>,
        stderr: Option<String>,
        diagnostic: Option<Diagnostic>,
    },
    /// Non-fatal problems (finalizer failures, loop teardown errors). Never
    /// changes an item's outcome.
    Warning {
        id: Option<String>,
        message: String,
    },
    RunEnded {
        summary: Summary,
    },
}

pub trait EventSink {
    fn emit(&mut self, event: &RunEvent);
}

/// Sink that keeps every event, used by tests and by callers that want to
/// post-process a finished run.
#[derive(Debug, Default)]
pub struct CollectingSink {
    pub events: Vec<RunEvent>,
}

impl EventSink for CollectingSink {
    fn emit(&mut self, event: &RunEvent) {
        self.events.push(event.clone());
    }
}

/// Sink that drops everything.
#[derive(Debug, Default)]
pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&mut self, _event: &RunEvent) {}
}
