//! Execution engine: drives the plan, manages fixture lifecycles, and runs
//! async batches on shared cooperative event loops.
//!
//! The interpreter is single-threaded with respect to user code; concurrency
//! exists only inside async batches, where suspended tests interleave on one
//! loop. Everything else here is strictly sequential in plan order.

use std::time::Instant;

use indexmap::IndexMap;
use log::warn;
use pyo3::prelude::*;
use pyo3::types::{PyDict, PyTuple};

use crate::config::RunConfig;
use crate::diagnostics;
use crate::events::{EventSink, RunEvent};
use crate::model::{
    Diagnostic, FixtureKind, ItemReport, Outcome, RunReport, Scope, SkipCondition, TestItem,
};
use crate::plan::{PlanStep, TestPlan};
use crate::python;
use crate::registry::FixtureRegistry;
use crate::resolver::{SetupPlan, REQUEST_FIXTURE};

/// A registered teardown: a (possibly async) generator to resume once past
/// its yield point.
struct Finalizer {
    fixture: String,
    generator: Py<PyAny>,
    is_async: bool,
}

/// Cached values, pending finalizers, and the event loop of one scope level.
/// `key` names the scope instance currently inhabiting the level.
#[derive(Default)]
struct ScopeLevel {
    key: Option<String>,
    values: IndexMap<String, Py<PyAny>>,
    finalizers: Vec<Finalizer>,
    event_loop: Option<Py<PyAny>>,
}

/// Per-item state for function-scoped fixtures.
#[derive(Default)]
struct FunctionLevel {
    values: IndexMap<String, Py<PyAny>>,
    finalizers: Vec<Finalizer>,
    event_loop: Option<Py<PyAny>>,
}

/// Everything needed to invoke one fixture, copied out of the registry so
/// acquisition can borrow the executor mutably.
struct FixtureCall {
    name: String,
    scope: Scope,
    kind: FixtureKind,
    callable: Py<PyAny>,
    depends: Vec<String>,
    cache_key: String,
    param_value: Option<Py<PyAny>>,
}

/// Classified result of running (or refusing to run) one item.
struct Classified {
    outcome: Outcome,
    diagnostic: Option<Diagnostic>,
}

pub struct Executor<'a> {
    config: &'a RunConfig,
    registry: &'a FixtureRegistry,
    items: &'a [TestItem],
    setups: &'a [Option<SetupPlan>],
    session: ScopeLevel,
    package: ScopeLevel,
    module: ScopeLevel,
    class: ScopeLevel,
}

/// Run the plan, emitting per-item events into `sink` and returning the
/// aggregate report. Event order follows plan order even for batches.
pub fn execute(
    py: Python<'_>,
    items: &[TestItem],
    setups: &[Option<SetupPlan>],
    registry: &FixtureRegistry,
    plan: &TestPlan,
    config: &RunConfig,
    sink: &mut dyn EventSink,
) -> RunReport {
    let start = Instant::now();
    let mut executor = Executor {
        config,
        registry,
        items,
        setups,
        session: ScopeLevel::default(),
        package: ScopeLevel::default(),
        module: ScopeLevel::default(),
        class: ScopeLevel::default(),
    };

    let mut report = RunReport::default();
    let mut halted = false;

    for step in &plan.steps {
        if halted {
            break;
        }
        match step {
            PlanStep::Test(index) => {
                let result = executor.run_single(py, *index, sink);
                if config.fail_fast && result.outcome.is_red() {
                    halted = true;
                }
                report.summary.record(result.outcome);
                report.results.push(result);
            }
            PlanStep::Batch(members) => {
                // An in-flight batch always completes; fail-fast only stops
                // further step issuance.
                let results = executor.run_batch(py, members, sink);
                for result in results {
                    if config.fail_fast && result.outcome.is_red() {
                        halted = true;
                    }
                    report.summary.record(result.outcome);
                    report.results.push(result);
                }
            }
        }
    }

    executor.close_all(py, sink);
    report.summary.duration = start.elapsed().as_secs_f64();
    report
}

impl Executor<'_> {
    fn level_mut(&mut self, scope: Scope) -> &mut ScopeLevel {
        match scope {
            Scope::Class => &mut self.class,
            Scope::Module => &mut self.module,
            Scope::Package => &mut self.package,
            Scope::Session => &mut self.session,
            Scope::Function => unreachable!("function level is per-item"),
        }
    }

    /// Close shared scope instances whose key differs from the next item's,
    /// narrowest first.
    fn cross_boundaries(&mut self, py: Python<'_>, item: &TestItem, sink: &mut dyn EventSink) {
        for scope in Scope::SHARED {
            let next_key = item.scope_key(scope);
            let level = self.level_mut(scope);
            if level.key.as_deref() == Some(next_key.as_str()) {
                continue;
            }
            if level.key.is_some() {
                let mut finalizers = std::mem::take(&mut level.finalizers);
                level.values.clear();
                let event_loop = level.event_loop.take();
                run_finalizers(py, &mut finalizers, event_loop.as_ref(), sink);
                close_event_loop(py, event_loop, sink);
            }
            self.level_mut(scope).key = Some(next_key);
        }
    }

    /// Finalize every open scope instance at end of run, narrowest first.
    fn close_all(&mut self, py: Python<'_>, sink: &mut dyn EventSink) {
        for scope in Scope::SHARED {
            let level = self.level_mut(scope);
            let mut finalizers = std::mem::take(&mut level.finalizers);
            level.values.clear();
            level.key = None;
            let event_loop = level.event_loop.take();
            run_finalizers(py, &mut finalizers, event_loop.as_ref(), sink);
            close_event_loop(py, event_loop, sink);
        }
    }

    /// Cached value lookup across the function level and all shared levels.
    fn cached(&self, py: Python<'_>, function: &FunctionLevel, cache_key: &str) -> Option<Py<PyAny>> {
        function
            .values
            .get(cache_key)
            .or_else(|| self.class.values.get(cache_key))
            .or_else(|| self.module.values.get(cache_key))
            .or_else(|| self.package.values.get(cache_key))
            .or_else(|| self.session.values.get(cache_key))
            .map(|value| value.clone_ref(py))
    }

    /// The cache key a dependency resolves to for this item.
    fn dependency_key(&self, item: &TestItem, name: &str) -> String {
        match self.registry.lookup(name, &item.path) {
            Some(def) => def.cache_key(item.fixture_param_indices.get(name).copied()),
            None => name.to_string(),
        }
    }

    fn fixture_call(&self, py: Python<'_>, item: &TestItem, name: &str) -> Option<FixtureCall> {
        let def = self.registry.lookup(name, &item.path)?;
        let param_index = item.fixture_param_indices.get(name).copied();
        let param_value = match (&def.params, param_index) {
            (Some(params), Some(index)) => {
                params.get(index).map(|param| param.value.clone_ref(py))
            }
            _ => None,
        };
        Some(FixtureCall {
            name: def.name.clone(),
            scope: def.scope,
            kind: def.kind,
            callable: def.callable.clone_ref(py),
            depends: def.depends.clone(),
            cache_key: def.cache_key(param_index),
            param_value,
        })
    }

    /// Effective loop scope for an item: explicit mark, else the widest
    /// async fixture scope in its closure, else function.
    fn loop_scope_for(&self, index: usize) -> Scope {
        let item = &self.items[index];
        item.loop_scope
            .or_else(|| {
                self.setups[index]
                    .as_ref()
                    .and_then(|setup| setup.widest_async_scope)
            })
            .unwrap_or(Scope::Function)
    }

    /// An explicit loop scope narrower than an async fixture demands is a
    /// setup error; failing early beats an opaque "attached to a different
    /// loop" crash inside asyncio.
    fn loop_scope_conflict(&self, index: usize) -> Option<String> {
        let item = &self.items[index];
        let explicit = item.loop_scope?;
        let required = self.setups[index].as_ref()?.widest_async_scope?;
        if required > explicit {
            Some(format!(
                "loop scope mismatch: test '{}' pins loop_scope=\"{}\" but depends on a \
                 {}-scoped async fixture; widen the loop scope or narrow the fixture",
                item.id,
                explicit.as_str(),
                required.as_str()
            ))
        } else {
            None
        }
    }

    /// Get or create the event loop for `scope`, storing function-level
    /// loops in the per-item state.
    fn loop_for(
        &mut self,
        py: Python<'_>,
        scope: Scope,
        function: &mut FunctionLevel,
    ) -> PyResult<Py<PyAny>> {
        let slot = match scope {
            Scope::Function => &mut function.event_loop,
            shared => &mut self.level_mut(shared).event_loop,
        };
        if let Some(existing) = slot {
            let is_closed = existing
                .bind(py)
                .call_method0("is_closed")
                .and_then(|value| value.extract::<bool>())
                .unwrap_or(true);
            if !is_closed {
                return Ok(existing.clone_ref(py));
            }
        }
        let asyncio = py.import("asyncio")?;
        let new_loop = asyncio.call_method0("new_event_loop")?;
        asyncio.call_method1("set_event_loop", (&new_loop,))?;
        let unbound = new_loop.unbind();
        *slot = Some(unbound.clone_ref(py));
        Ok(unbound)
    }

    // ------------------------------------------------------------------
    // Sequential path

    fn run_single(&mut self, py: Python<'_>, index: usize, sink: &mut dyn EventSink) -> ItemReport {
        let item = &self.items[index];
        sink.emit(&RunEvent::TestStarted {
            id: item.id.clone(),
            path: item.path.display().to_string(),
        });

        let started = Instant::now();
        let mut function = FunctionLevel::default();
        let outcome = self.run_single_inner(py, index, &mut function, sink);
        let (stdout, stderr, classified) = outcome;

        run_finalizers(py, &mut function.finalizers, function.event_loop.as_ref(), sink);
        close_event_loop(py, function.event_loop.take(), sink);

        let item = &self.items[index];
        let report = ItemReport {
            id: item.id.clone(),
            path: item.path.display().to_string(),
            outcome: classified.outcome,
            duration: started.elapsed().as_secs_f64(),
            stdout,
            stderr,
            diagnostic: classified.diagnostic,
        };
        sink.emit(&RunEvent::TestEnded {
            id: report.id.clone(),
            outcome: report.outcome,
            duration: report.duration,
            stdout: report.stdout.clone(),
            stderr: report.stderr.clone(),
            diagnostic: report.diagnostic.clone(),
        });
        report
    }

    fn run_single_inner(
        &mut self,
        py: Python<'_>,
        index: usize,
        function: &mut FunctionLevel,
        sink: &mut dyn EventSink,
    ) -> (Option<String>, Option<String>, Classified) {
        let items = self.items;
        let item = &items[index];
        self.cross_boundaries(py, item, sink);

        if let Some(reason) = &item.blocked {
            return (
                None,
                None,
                Classified {
                    outcome: Outcome::Errored,
                    diagnostic: Some(diagnostics::synthetic("CollectionError", reason)),
                },
            );
        }

        match self.check_skip(py, item) {
            Ok(Some(reason)) => {
                return (
                    None,
                    None,
                    Classified {
                        outcome: Outcome::Skipped,
                        diagnostic: Some(diagnostics::synthetic("Skipped", &reason)),
                    },
                )
            }
            Ok(None) => {}
            Err(err) => {
                return (
                    None,
                    None,
                    Classified {
                        outcome: Outcome::Errored,
                        diagnostic: Some(diagnostics::from_pyerr(py, &err)),
                    },
                )
            }
        }

        if let Some(message) = self.loop_scope_conflict(index) {
            return (
                None,
                None,
                Classified {
                    outcome: Outcome::Errored,
                    diagnostic: Some(diagnostics::synthetic("SetupError", &message)),
                },
            );
        }

        let loop_scope = self.loop_scope_for(index);
        if let Err(err) = self.acquire_all(py, index, function, loop_scope) {
            return (None, None, self.classify_setup_failure(py, &err));
        }

        let call_args = match self.build_call_args(py, index, function) {
            Ok(args) => args,
            Err(err) => return (None, None, self.classify_setup_failure(py, &err)),
        };

        let callable = item.callable.clone_ref(py);
        let is_async = item.is_async;
        let capture = self.config.capture_output;

        let (result, stdout, stderr) = call_with_capture(py, capture, || {
            let args = PyTuple::new(py, &call_args)?;
            let value = callable.bind(py).call1(args)?;
            if is_async && python::is_coroutine(&value) {
                let event_loop = self.loop_for(py, loop_scope, function)?;
                Ok(event_loop
                    .bind(py)
                    .call_method1("run_until_complete", (&value,))?
                    .unbind())
            } else {
                Ok(value.unbind())
            }
        });

        let classified = match result {
            Ok(_) => self.classify_success(index),
            Err(err) => self.classify_failure(py, index, &err),
        };
        (stdout, stderr, classified)
    }

    /// Evaluate skip markers; `Some(reason)` means skip now.
    fn check_skip(&self, py: Python<'_>, item: &TestItem) -> PyResult<Option<String>> {
        for mark in &item.skip {
            let active = match &mark.condition {
                None => true,
                Some(SkipCondition::Value(value)) => *value,
                Some(SkipCondition::Expr(expr)) => {
                    python::eval_in_defining_module(py, expr, &item.callable)?
                }
            };
            if active {
                return Ok(Some(
                    mark.reason.clone().unwrap_or_else(|| "skipped".to_string()),
                ));
            }
        }
        Ok(None)
    }

    /// Acquire every fixture in the setup plan, dependencies first.
    fn acquire_all(
        &mut self,
        py: Python<'_>,
        index: usize,
        function: &mut FunctionLevel,
        loop_scope: Scope,
    ) -> PyResult<()> {
        let order = match &self.setups[index] {
            Some(setup) => setup.order.clone(),
            None => Vec::new(),
        };
        for name in order {
            self.acquire_fixture(py, index, &name, function, loop_scope)?;
        }
        Ok(())
    }

    fn acquire_fixture(
        &mut self,
        py: Python<'_>,
        index: usize,
        name: &str,
        function: &mut FunctionLevel,
        loop_scope: Scope,
    ) -> PyResult<()> {
        let items = self.items;
        let item = &items[index];
        let Some(call) = self.fixture_call(py, item, name) else {
            return Err(pyo3::exceptions::PyRuntimeError::new_err(format!(
                "fixture '{name}' disappeared from the registry"
            )));
        };

        if self.cached(py, function, &call.cache_key).is_some() {
            return Ok(());
        }

        let mut args: Vec<Py<PyAny>> = Vec::with_capacity(call.depends.len());
        for dep in &call.depends {
            if dep == REQUEST_FIXTURE {
                args.push(request_object(py, call.param_value.as_ref())?);
                continue;
            }
            let key = self.dependency_key(item, dep);
            let value = self.cached(py, function, &key).ok_or_else(|| {
                pyo3::exceptions::PyRuntimeError::new_err(format!(
                    "fixture '{}' requested '{dep}' before it was built",
                    call.name
                ))
            })?;
            args.push(value);
        }

        let args = PyTuple::new(py, &args)?;
        let produced = call.callable.bind(py).call1(args)?;

        let value: Py<PyAny> = match call.kind {
            FixtureKind::Value => produced.unbind(),
            FixtureKind::Generator => {
                let generator = produced.unbind();
                let yielded = generator.bind(py).call_method0("__next__")?.unbind();
                self.push_finalizer(
                    function,
                    call.scope,
                    Finalizer {
                        fixture: call.name.clone(),
                        generator,
                        is_async: false,
                    },
                );
                yielded
            }
            FixtureKind::AsyncValue => {
                let event_loop = self.loop_for(py, loop_scope, function)?;
                event_loop
                    .bind(py)
                    .call_method1("run_until_complete", (&produced,))?
                    .unbind()
            }
            FixtureKind::AsyncGenerator => {
                let generator = produced.unbind();
                let event_loop = self.loop_for(py, loop_scope, function)?;
                let anext = py.import("builtins")?.getattr("anext")?;
                let coro = anext.call1((generator.bind(py),))?;
                let yielded = event_loop
                    .bind(py)
                    .call_method1("run_until_complete", (coro,))?
                    .unbind();
                self.push_finalizer(
                    function,
                    call.scope,
                    Finalizer {
                        fixture: call.name.clone(),
                        generator,
                        is_async: true,
                    },
                );
                yielded
            }
        };

        match call.scope {
            Scope::Function => {
                function.values.insert(call.cache_key, value);
            }
            shared => {
                self.level_mut(shared).values.insert(call.cache_key, value);
            }
        }
        Ok(())
    }

    fn push_finalizer(&mut self, function: &mut FunctionLevel, scope: Scope, finalizer: Finalizer) {
        match scope {
            Scope::Function => function.finalizers.push(finalizer),
            shared => self.level_mut(shared).finalizers.push(finalizer),
        }
    }

    /// Argument values for the test callable itself: parametrize bindings
    /// win, then fixture values from the caches.
    fn build_call_args(
        &self,
        py: Python<'_>,
        index: usize,
        function: &FunctionLevel,
    ) -> PyResult<Vec<Py<PyAny>>> {
        let item = &self.items[index];
        let mut args = Vec::with_capacity(item.params.len());
        for name in &item.params {
            if let Some(value) = item.param_values.get(name) {
                args.push(value.clone_ref(py));
                continue;
            }
            if name == REQUEST_FIXTURE {
                args.push(request_object(py, None)?);
                continue;
            }
            let key = self.dependency_key(item, name);
            let value = self.cached(py, function, &key).ok_or_else(|| {
                pyo3::exceptions::PyRuntimeError::new_err(format!(
                    "no value available for parameter '{name}'"
                ))
            })?;
            args.push(value);
        }
        Ok(args)
    }

    fn classify_success(&self, index: usize) -> Classified {
        let item = &self.items[index];
        if let Some(xfail) = &item.xfail {
            let reason = xfail.reason.clone().unwrap_or_default();
            return Classified {
                outcome: Outcome::Xpassed,
                diagnostic: (!reason.is_empty())
                    .then(|| diagnostics::synthetic("XPassed", &reason)),
            };
        }
        Classified {
            outcome: Outcome::Passed,
            diagnostic: None,
        }
    }

    fn classify_failure(&self, py: Python<'_>, index: usize, err: &PyErr) -> Classified {
        let item = &self.items[index];

        if is_sentinel(py, err, "Skipped") {
            return Classified {
                outcome: Outcome::Skipped,
                diagnostic: Some(diagnostics::synthetic(
                    "Skipped",
                    &err.value(py).to_string(),
                )),
            };
        }
        if is_sentinel(py, err, "XFailed") {
            return Classified {
                outcome: Outcome::Xfailed,
                diagnostic: Some(diagnostics::synthetic(
                    "XFailed",
                    &err.value(py).to_string(),
                )),
            };
        }
        if let Some(xfail) = &item.xfail {
            let matches = match &xfail.raises {
                Some(expected) => err
                    .value(py)
                    .is_instance(expected.bind(py))
                    .unwrap_or(false),
                None => true,
            };
            if matches {
                return Classified {
                    outcome: Outcome::Xfailed,
                    diagnostic: Some(diagnostics::from_pyerr(py, err)),
                };
            }
        }
        Classified {
            outcome: Outcome::Failed,
            diagnostic: Some(diagnostics::from_pyerr(py, err)),
        }
    }

    /// Setup failures: a runtime `skip()` still skips; everything else is a
    /// setup error.
    fn classify_setup_failure(&self, py: Python<'_>, err: &PyErr) -> Classified {
        if is_sentinel(py, err, "Skipped") {
            return Classified {
                outcome: Outcome::Skipped,
                diagnostic: Some(diagnostics::synthetic(
                    "Skipped",
                    &err.value(py).to_string(),
                )),
            };
        }
        Classified {
            outcome: Outcome::Errored,
            diagnostic: Some(diagnostics::from_pyerr(py, err)),
        }
    }

    // ------------------------------------------------------------------
    // Async batch path

    fn run_batch(
        &mut self,
        py: Python<'_>,
        members: &[usize],
        sink: &mut dyn EventSink,
    ) -> Vec<ItemReport> {
        // Shared scopes transition on the first member; class-scope
        // instances crossed inside the batch are deferred to batch end so
        // their fixtures stay alive while member tests are in flight.
        let items = self.items;
        self.cross_boundaries(py, &items[members[0]], sink);

        for &index in members {
            let item = &items[index];
            sink.emit(&RunEvent::TestStarted {
                id: item.id.clone(),
                path: item.path.display().to_string(),
            });
        }

        let loop_scope = match self.loop_scope_for(members[0]) {
            Scope::Class => Scope::Class,
            _ => Scope::Module,
        };
        let mut deferred_class_finalizers: Vec<Finalizer> = Vec::new();
        let mut placeholder = FunctionLevel::default();
        let shared_loop = match self.loop_for(py, loop_scope, &mut placeholder) {
            Ok(event_loop) => event_loop,
            Err(err) => {
                // Batch framework error: every member is errored.
                let diagnostic = diagnostics::from_pyerr(py, &err);
                return self.finish_batch_errored(members, &diagnostic, sink);
            }
        };

        struct Prepared {
            index: usize,
            function: FunctionLevel,
            coroutine: Py<PyAny>,
            stdout_buffer: Option<Py<PyAny>>,
            stderr_buffer: Option<Py<PyAny>>,
        }

        let mut prepared: Vec<Prepared> = Vec::new();
        let mut settled: IndexMap<usize, Classified> = IndexMap::new();
        let batch_started = Instant::now();

        for &index in members {
            let item = &self.items[index];
            if let Some(reason) = &item.blocked {
                settled.insert(
                    index,
                    Classified {
                        outcome: Outcome::Errored,
                        diagnostic: Some(diagnostics::synthetic("CollectionError", reason)),
                    },
                );
                continue;
            }
            match self.check_skip(py, item) {
                Ok(Some(reason)) => {
                    settled.insert(
                        index,
                        Classified {
                            outcome: Outcome::Skipped,
                            diagnostic: Some(diagnostics::synthetic("Skipped", &reason)),
                        },
                    );
                    continue;
                }
                Ok(None) => {}
                Err(err) => {
                    settled.insert(
                        index,
                        Classified {
                            outcome: Outcome::Errored,
                            diagnostic: Some(diagnostics::from_pyerr(py, &err)),
                        },
                    );
                    continue;
                }
            }

            // Class transitions inside the batch: park the finalizers, keep
            // the values of the outgoing instance out of reach.
            let class_key = item.scope_key(Scope::Class);
            if self.class.key.as_deref() != Some(class_key.as_str()) {
                if self.class.key.is_some() {
                    deferred_class_finalizers.append(&mut self.class.finalizers);
                    self.class.values.clear();
                }
                self.class.key = Some(class_key);
            }

            let mut function = FunctionLevel::default();
            if let Err(err) = self.acquire_all(py, index, &mut function, loop_scope) {
                let classified = self.classify_setup_failure(py, &err);
                run_finalizers(py, &mut function.finalizers, Some(&shared_loop), sink);
                settled.insert(index, classified);
                continue;
            }

            let call_args = match self.build_call_args(py, index, &function) {
                Ok(args) => args,
                Err(err) => {
                    let classified = self.classify_setup_failure(py, &err);
                    run_finalizers(py, &mut function.finalizers, Some(&shared_loop), sink);
                    settled.insert(index, classified);
                    continue;
                }
            };

            let item = &self.items[index];
            let coroutine = match PyTuple::new(py, &call_args)
                .and_then(|args| item.callable.bind(py).call1(args))
            {
                Ok(value) => value,
                Err(err) => {
                    let classified = self.classify_failure(py, index, &err);
                    run_finalizers(py, &mut function.finalizers, Some(&shared_loop), sink);
                    settled.insert(index, classified);
                    continue;
                }
            };

            // Per-member capture buffers are attached before submission.
            let (coroutine, stdout_buffer, stderr_buffer) = if self.config.capture_output {
                match route_capture(py, &coroutine) {
                    Ok(routed) => routed,
                    Err(err) => {
                        let classified = self.classify_setup_failure(py, &err);
                        run_finalizers(py, &mut function.finalizers, Some(&shared_loop), sink);
                        settled.insert(index, classified);
                        continue;
                    }
                }
            } else {
                (coroutine.unbind(), None, None)
            };

            prepared.push(Prepared {
                index,
                function,
                coroutine,
                stdout_buffer,
                stderr_buffer,
            });
        }

        let mut reports: IndexMap<usize, ItemReport> = IndexMap::new();

        if !prepared.is_empty() {
            let gather_result = gather_on_loop(
                py,
                &shared_loop,
                prepared.iter().map(|p| p.coroutine.clone_ref(py)),
                self.config.capture_output,
            );

            match gather_result {
                Ok(results) => {
                    let elapsed = batch_started.elapsed().as_secs_f64();
                    let per_item = elapsed / prepared.len() as f64;
                    for (prepared_item, result) in prepared.into_iter().zip(results) {
                        let Prepared {
                            index,
                            mut function,
                            stdout_buffer,
                            stderr_buffer,
                            ..
                        } = prepared_item;
                        let bound = result.bind(py);
                        let classified = if bound
                            .is_instance(&py.get_type::<pyo3::exceptions::PyBaseException>())
                            .unwrap_or(false)
                        {
                            let err = PyErr::from_value(bound.clone());
                            self.classify_failure(py, index, &err)
                        } else {
                            self.classify_success(index)
                        };
                        run_finalizers(py, &mut function.finalizers, Some(&shared_loop), sink);
                        let item = &self.items[index];
                        reports.insert(
                            index,
                            ItemReport {
                                id: item.id.clone(),
                                path: item.path.display().to_string(),
                                outcome: classified.outcome,
                                duration: per_item,
                                stdout: buffer_contents(py, stdout_buffer.as_ref()),
                                stderr: buffer_contents(py, stderr_buffer.as_ref()),
                                diagnostic: classified.diagnostic,
                            },
                        );
                    }
                }
                Err(err) => {
                    // Join primitive failed: error every submitted member.
                    let diagnostic = diagnostics::from_pyerr(py, &err);
                    for prepared_item in prepared {
                        let Prepared {
                            index,
                            mut function,
                            ..
                        } = prepared_item;
                        run_finalizers(py, &mut function.finalizers, Some(&shared_loop), sink);
                        let item = &self.items[index];
                        reports.insert(
                            index,
                            ItemReport {
                                id: item.id.clone(),
                                path: item.path.display().to_string(),
                                outcome: Outcome::Errored,
                                duration: 0.0,
                                stdout: None,
                                stderr: None,
                                diagnostic: Some(diagnostic.clone()),
                            },
                        );
                    }
                }
            }
        }

        // Class instances that ended mid-batch finalize now that every
        // member has settled.
        run_finalizers(py, &mut deferred_class_finalizers, Some(&shared_loop), sink);

        // Flush end events in plan order, not completion order.
        let mut ordered = Vec::with_capacity(members.len());
        for &index in members {
            let item = &self.items[index];
            let report = if let Some(report) = reports.shift_remove(&index) {
                report
            } else {
                let classified = settled.shift_remove(&index).unwrap_or(Classified {
                    outcome: Outcome::Errored,
                    diagnostic: Some(diagnostics::synthetic(
                        "InternalError",
                        "batch member produced no result",
                    )),
                });
                ItemReport {
                    id: item.id.clone(),
                    path: item.path.display().to_string(),
                    outcome: classified.outcome,
                    duration: 0.0,
                    stdout: None,
                    stderr: None,
                    diagnostic: classified.diagnostic,
                }
            };
            sink.emit(&RunEvent::TestEnded {
                id: report.id.clone(),
                outcome: report.outcome,
                duration: report.duration,
                stdout: report.stdout.clone(),
                stderr: report.stderr.clone(),
                diagnostic: report.diagnostic.clone(),
            });
            ordered.push(report);
        }
        ordered
    }

    fn finish_batch_errored(
        &self,
        members: &[usize],
        diagnostic: &Diagnostic,
        sink: &mut dyn EventSink,
    ) -> Vec<ItemReport> {
        let mut reports = Vec::with_capacity(members.len());
        for &index in members {
            let item = &self.items[index];
            let report = ItemReport {
                id: item.id.clone(),
                path: item.path.display().to_string(),
                outcome: Outcome::Errored,
                duration: 0.0,
                stdout: None,
                stderr: None,
                diagnostic: Some(diagnostic.clone()),
            };
            sink.emit(&RunEvent::TestEnded {
                id: report.id.clone(),
                outcome: report.outcome,
                duration: report.duration,
                stdout: None,
                stderr: None,
                diagnostic: report.diagnostic.clone(),
            });
            reports.push(report);
        }
        reports
    }
}

/// Minimal `request` object exposing the active fixture parameter.
fn request_object(py: Python<'_>, param: Option<&Py<PyAny>>) -> PyResult<Py<PyAny>> {
    let namespace = py.import("types")?.getattr("SimpleNamespace")?;
    let kwargs = PyDict::new(py);
    match param {
        Some(value) => kwargs.set_item("param", value.clone_ref(py))?,
        None => kwargs.set_item("param", py.None())?,
    }
    Ok(namespace.call((), Some(&kwargs))?.unbind())
}

/// Wrap a member coroutine with contextvar-routed capture buffers.
fn route_capture<'py>(
    py: Python<'py>,
    coroutine: &Bound<'py, PyAny>,
) -> PyResult<(Py<PyAny>, Option<Py<PyAny>>, Option<Py<PyAny>>)> {
    let io = py.import("io")?;
    let stdout_buffer = io.getattr("StringIO")?.call0()?;
    let stderr_buffer = io.getattr("StringIO")?.call0()?;
    let api = py.import(python::API_MODULE)?;
    let routed = api.call_method1("_route_capture", (coroutine, &stdout_buffer, &stderr_buffer))?;
    Ok((
        routed.unbind(),
        Some(stdout_buffer.unbind()),
        Some(stderr_buffer.unbind()),
    ))
}

fn buffer_contents(py: Python<'_>, buffer: Option<&Py<PyAny>>) -> Option<String> {
    let buffer = buffer?;
    let text: String = buffer
        .bind(py)
        .call_method0("getvalue")
        .and_then(|value| value.extract())
        .ok()?;
    (!text.is_empty()).then_some(text)
}

/// Submit all member coroutines at once and await their joint completion.
/// The join helper runs `asyncio.gather(..., return_exceptions=True)` from
/// inside the loop, so one failure never cancels peers and the result vector
/// carries a value or an exception per member.
fn gather_on_loop(
    py: Python<'_>,
    event_loop: &Py<PyAny>,
    coroutines: impl Iterator<Item = Py<PyAny>>,
    capture: bool,
) -> PyResult<Vec<Py<PyAny>>> {
    let api = py.import(python::API_MODULE)?;
    let coroutines: Vec<Py<PyAny>> = coroutines.collect();
    let joint = api.call_method1("_gather", (coroutines,))?;

    if capture {
        api.call_method0("_install_dispatch")?;
    }
    let joined = event_loop
        .bind(py)
        .call_method1("run_until_complete", (joint,));
    if capture {
        api.call_method0("_restore_dispatch")?;
    }
    joined?.extract()
}

/// Execute a callable while optionally redirecting the interpreter's
/// stdout/stderr into in-memory buffers.
fn call_with_capture<F>(
    py: Python<'_>,
    capture_output: bool,
    f: F,
) -> (PyResult<Py<PyAny>>, Option<String>, Option<String>)
where
    F: FnOnce() -> PyResult<Py<PyAny>>,
{
    if !capture_output {
        return (f(), None, None);
    }

    let redirected = (|| {
        let contextlib = py.import("contextlib")?;
        let io = py.import("io")?;
        let stdout_buffer = io.getattr("StringIO")?.call0()?;
        let stderr_buffer = io.getattr("StringIO")?.call0()?;
        let redirect_stdout = contextlib
            .getattr("redirect_stdout")?
            .call1((&stdout_buffer,))?;
        let redirect_stderr = contextlib
            .getattr("redirect_stderr")?
            .call1((&stderr_buffer,))?;
        let stack = contextlib.getattr("ExitStack")?.call0()?;
        stack.call_method1("enter_context", (&redirect_stdout,))?;
        stack.call_method1("enter_context", (&redirect_stderr,))?;
        Ok::<_, PyErr>((stack, stdout_buffer, stderr_buffer))
    })();

    let (stack, stdout_buffer, stderr_buffer) = match redirected {
        Ok(parts) => parts,
        Err(_) => return (f(), None, None),
    };

    let result = f();
    let _ = stack.call_method0("close");

    let read = |buffer: &Bound<'_, PyAny>| -> Option<String> {
        let text: String = buffer
            .call_method0("getvalue")
            .and_then(|value| value.extract())
            .ok()?;
        (!text.is_empty()).then_some(text)
    };

    (result, read(&stdout_buffer), read(&stderr_buffer))
}

fn is_sentinel(py: Python<'_>, err: &PyErr, name: &str) -> bool {
    python::sentinel_type(py, name)
        .map(|sentinel| err.value(py).is_instance(&sentinel).unwrap_or(false))
        .unwrap_or(false)
}

/// Resume yield-style fixtures past their yield point, LIFO. Failures are
/// reported as warnings; they never change an item's outcome and never stop
/// the remaining finalizers.
fn run_finalizers(
    py: Python<'_>,
    finalizers: &mut Vec<Finalizer>,
    event_loop: Option<&Py<PyAny>>,
    sink: &mut dyn EventSink,
) {
    for finalizer in finalizers.drain(..).rev() {
        let generator = finalizer.generator.bind(py);
        let result = if finalizer.is_async {
            py.import("builtins")
                .and_then(|builtins| builtins.getattr("anext"))
                .and_then(|anext| anext.call1((generator,)))
                .and_then(|coro| match event_loop {
                    Some(event_loop) => event_loop
                        .bind(py)
                        .call_method1("run_until_complete", (coro,)),
                    None => py.import("asyncio")?.call_method1("run", (coro,)),
                })
                .map(|_| ())
        } else {
            generator.call_method0("__next__").map(|_| ())
        };

        if let Err(err) = result {
            let exhausted = err.is_instance_of::<pyo3::exceptions::PyStopIteration>(py)
                || err.is_instance_of::<pyo3::exceptions::PyStopAsyncIteration>(py);
            if !exhausted {
                let message = format!(
                    "error while finalizing fixture '{}': {err}",
                    finalizer.fixture
                );
                warn!("{message}");
                sink.emit(&RunEvent::Warning { id: None, message });
            }
        }
    }
}

/// Close a loop after cancelling whatever tasks still live on it.
fn close_event_loop(py: Python<'_>, event_loop: Option<Py<PyAny>>, sink: &mut dyn EventSink) {
    let Some(event_loop) = event_loop else {
        return;
    };
    let bound = event_loop.bind(py);
    let is_closed = bound
        .call_method0("is_closed")
        .and_then(|value| value.extract::<bool>())
        .unwrap_or(true);
    if is_closed {
        return;
    }

    let result = (|| -> PyResult<()> {
        let asyncio = py.import("asyncio")?;
        if let Ok(tasks) = asyncio.call_method1("all_tasks", (bound,)) {
            if let Ok(task_list) = tasks.extract::<Vec<Py<PyAny>>>() {
                for task in task_list {
                    let _ = task.bind(py).call_method0("cancel");
                }
            }
        }
        bound.call_method0("close")?;
        Ok(())
    })();

    if let Err(err) = result {
        let message = format!("error while closing event loop: {err}");
        warn!("{message}");
        sink.emit(&RunEvent::Warning { id: None, message });
    }
}
