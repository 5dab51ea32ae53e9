//! Test discovery pipeline.
//!
//! Walks the input paths, prunes ignored directories, loads shared
//! `conftest.py` files ancestor-first, loads each test file through the
//! interpreter, and harvests test callables, `Test*` classes, fixtures, and
//! markers. Parametrize markers and parametric fixtures are expanded here so
//! the rest of the runner only ever sees concrete [`TestItem`]s.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use globset::{Glob, GlobSet, GlobSetBuilder};
use indexmap::IndexMap;
use log::debug;
use pyo3::prelude::*;
use pyo3::types::PyDict;
use walkdir::WalkDir;

use crate::config::RunConfig;
use crate::model::{
    FixtureDef, FixtureKind, FixtureOrigin, FixtureParam, ParamBinding, RunnerError, Scope,
    SkipCondition, SkipMark, TestItem, XfailMark,
};
use crate::python;
use crate::registry::FixtureRegistry;
use crate::resolver::{self, SetupPlan};

/// A file that could not be loaded or harvested. Recorded without aborting
/// discovery; the run reports a synthetic `errored` item for it.
#[derive(Debug, Clone)]
pub struct CollectionError {
    pub path: PathBuf,
    pub message: String,
}

/// Everything discovery produces for one invocation.
pub struct Discovered {
    /// Project root: nearest ancestor without an `__init__.py` marker.
    pub root: PathBuf,
    /// Concrete items in deterministic (file, line, expansion) order.
    pub items: Vec<TestItem>,
    /// Setup plan per item, aligned with `items`. `None` for blocked items
    /// and synthetic collection-error entries. Resolved once, here; planning
    /// and execution reuse these instead of resolving again.
    pub setups: Vec<Option<SetupPlan>>,
    pub registry: FixtureRegistry,
    pub errors: Vec<CollectionError>,
}

/// Directory names pruned outright during the walk.
const IGNORED_DIR_NAMES: [&str; 7] = [
    "_darcs",
    "build",
    "CVS",
    "dist",
    "node_modules",
    "venv",
    "{arch}",
];

/// Discover test items and fixtures for the provided paths. An empty path
/// list means the current working directory.
pub fn discover(
    py: Python<'_>,
    input_paths: &[PathBuf],
    config: &RunConfig,
) -> Result<Discovered, RunnerError> {
    let cwd = std::env::current_dir()?;
    let mut paths: Vec<PathBuf> = if input_paths.is_empty() {
        vec![cwd.clone()]
    } else {
        input_paths
            .iter()
            .map(|p| if p.is_absolute() { p.clone() } else { cwd.join(p) })
            .collect()
    };
    for path in &paths {
        if !path.exists() {
            return Err(RunnerError::PathNotFound(path.clone()));
        }
    }
    paths.sort();
    paths.dedup();

    let root = project_root(&paths[0]);

    python::ensure_api_module(py)?;
    let mut sys_roots = vec![root.clone()];
    for extra in &config.pythonpath {
        sys_roots.push(if extra.is_absolute() {
            extra.clone()
        } else {
            root.join(extra)
        });
    }
    python::prepend_sys_path(py, &sys_roots)?;

    let file_glob = test_file_glob();
    let ignore_glob = ignore_glob();
    let files = collect_test_files(&paths, &file_glob, &ignore_glob);

    let mut harvester = Harvester {
        py,
        root: root.clone(),
        registry: FixtureRegistry::new(),
        errors: Vec::new(),
        items: Vec::new(),
        setups: Vec::new(),
        module_counter: 0,
        loaded_conftest_dirs: HashSet::new(),
        poisoned: Vec::new(),
    };

    for file in &files {
        harvester.load_conftest_chain(file);
        harvester.collect_file(file);
    }

    let mut paired: Vec<(TestItem, Option<SetupPlan>)> = harvester
        .items
        .into_iter()
        .zip(harvester.setups)
        .collect();
    paired.sort_by(|a, b| {
        (&a.0.path, a.0.line, &a.0.id).cmp(&(&b.0.path, b.0.line, &b.0.id))
    });
    let (items, setups): (Vec<_>, Vec<_>) = paired.into_iter().unzip();

    Ok(Discovered {
        root,
        items,
        setups,
        registry: harvester.registry,
        errors: harvester.errors,
    })
}

/// Nearest ancestor directory lacking an `__init__.py` marker.
pub fn project_root(path: &Path) -> PathBuf {
    let mut dir = if path.is_file() {
        path.parent().map(Path::to_path_buf).unwrap_or_default()
    } else {
        path.to_path_buf()
    };
    while dir.join("__init__.py").exists() {
        match dir.parent() {
            Some(parent) => dir = parent.to_path_buf(),
            None => break,
        }
    }
    dir
}

/// Glob set matching `test_*.py` and `*_test.py` basenames.
fn test_file_glob() -> GlobSet {
    let mut builder = GlobSetBuilder::new();
    for pattern in ["test_*.py", "*_test.py"] {
        // Patterns are literals; construction cannot fail.
        if let Ok(glob) = Glob::new(pattern) {
            builder.add(glob);
        }
    }
    builder.build().unwrap_or_else(|_| GlobSet::empty())
}

/// Glob set for ignored entry names (`*.egg`); fixed names and dot-entries
/// are handled separately.
fn ignore_glob() -> GlobSet {
    let mut builder = GlobSetBuilder::new();
    if let Ok(glob) = Glob::new("*.egg") {
        builder.add(glob);
    }
    builder.build().unwrap_or_else(|_| GlobSet::empty())
}

/// Whether a walked entry must be pruned.
fn is_ignored(name: &str, path: &Path, is_dir: bool, ignore: &GlobSet) -> bool {
    if name.starts_with('.') {
        return true;
    }
    if ignore.is_match(name) {
        return true;
    }
    if is_dir {
        if IGNORED_DIR_NAMES.contains(&name) {
            return true;
        }
        // Virtual environments under any name.
        if path.join("pyvenv.cfg").exists() || path.join("conda-meta").join("history").exists() {
            return true;
        }
    }
    false
}

fn collect_test_files(paths: &[PathBuf], file_glob: &GlobSet, ignore: &GlobSet) -> Vec<PathBuf> {
    let mut files = Vec::new();
    for path in paths {
        if path.is_file() {
            if matches_basename(path, file_glob) {
                files.push(path.clone());
            }
            continue;
        }
        let walker = WalkDir::new(path).into_iter().filter_entry(|entry| {
            let name = entry.file_name().to_string_lossy();
            entry.depth() == 0
                || !is_ignored(&name, entry.path(), entry.file_type().is_dir(), ignore)
        });
        for entry in walker.filter_map(Result::ok) {
            if entry.file_type().is_file() && matches_basename(entry.path(), file_glob) {
                files.push(entry.into_path());
            }
        }
    }
    files.sort();
    files.dedup();
    files
}

fn matches_basename(path: &Path, glob: &GlobSet) -> bool {
    path.file_name()
        .map(|name| glob.is_match(Path::new(name)))
        .unwrap_or(false)
}

/// One harvested-but-unexpanded test callable.
struct RawTest {
    name: String,
    class_name: Option<String>,
    callable: Py<PyAny>,
    params: Vec<String>,
    line: usize,
    marks: MarkSet,
    is_async: bool,
}

/// Parsed marker state for one callable (class marks merged in).
#[derive(Default)]
struct MarkSet {
    names: Vec<String>,
    /// One entry per parametrize decorator, outermost first.
    parametrize: Vec<Vec<ParamCase>>,
    skip: Vec<SkipMark>,
    xfail: Option<XfailMark>,
    usefixtures: Vec<String>,
    loop_scope: Option<Scope>,
}

struct ParamCase {
    id: String,
    values: Vec<(String, Py<PyAny>)>,
}

struct Harvester<'py> {
    py: Python<'py>,
    root: PathBuf,
    registry: FixtureRegistry,
    errors: Vec<CollectionError>,
    items: Vec<TestItem>,
    /// One entry per pushed item, kept in lockstep with `items`.
    setups: Vec<Option<SetupPlan>>,
    module_counter: usize,
    loaded_conftest_dirs: HashSet<PathBuf>,
    /// Directories whose conftest failed, with the failure message.
    poisoned: Vec<(PathBuf, String)>,
}

impl<'py> Harvester<'py> {
    fn rel(&self, path: &Path) -> PathBuf {
        path.strip_prefix(&self.root)
            .map(Path::to_path_buf)
            .unwrap_or_else(|_| path.to_path_buf())
    }

    fn next_module_id(&mut self) -> usize {
        self.module_counter += 1;
        self.module_counter
    }

    /// Load every not-yet-seen `conftest.py` between the project root and
    /// the test file's directory, shallowest first.
    fn load_conftest_chain(&mut self, file: &Path) {
        let mut chain: Vec<PathBuf> = Vec::new();
        let mut dir = file.parent();
        while let Some(current) = dir {
            if !current.starts_with(&self.root) {
                break;
            }
            chain.push(current.to_path_buf());
            if current == self.root {
                break;
            }
            dir = current.parent();
        }
        chain.reverse();

        for dir in chain {
            if !self.loaded_conftest_dirs.insert(dir.clone()) {
                continue;
            }
            let conftest = dir.join("conftest.py");
            if !conftest.exists() {
                continue;
            }
            let module_id = self.next_module_id();
            let (module_name, package) = python::module_name_for(&conftest, module_id);
            match python::load_module_from_path(
                self.py,
                &conftest,
                &module_name,
                package.as_deref(),
            ) {
                Ok(module) => {
                    let origin = FixtureOrigin::Dir(self.rel(&dir));
                    if let Err(err) = self.harvest_fixtures(&module, &conftest, origin) {
                        self.record_load_failure(&conftest, &dir, err);
                    }
                }
                Err(err) => self.record_load_failure(&conftest, &dir, err),
            }
        }
    }

    fn record_load_failure(&mut self, conftest: &Path, dir: &Path, err: PyErr) {
        let message = format!(
            "failed to load shared file {}: {}",
            self.rel(conftest).display(),
            err
        );
        self.errors.push(CollectionError {
            path: self.rel(conftest),
            message: message.clone(),
        });
        self.poisoned.push((dir.to_path_buf(), message));
    }

    fn blocked_reason_for(&self, file: &Path) -> Option<String> {
        self.poisoned
            .iter()
            .find(|(dir, _)| file.starts_with(dir))
            .map(|(_, message)| format!("ancestor configuration failed to load: {message}"))
    }

    /// Load one test file and expand its tests into items. Load failures
    /// become a collection error plus one synthetic errored item.
    fn collect_file(&mut self, file: &Path) {
        let rel = self.rel(file);
        let blocked = self.blocked_reason_for(file);
        let module_id = self.next_module_id();
        let (module_name, package) = python::module_name_for(file, module_id);

        let module = match python::load_module_from_path(
            self.py,
            file,
            &module_name,
            package.as_deref(),
        ) {
            Ok(module) => module,
            Err(err) => {
                let message = format!("{err}");
                self.errors.push(CollectionError {
                    path: rel.clone(),
                    message: message.clone(),
                });
                self.items.push(synthetic_error_item(self.py, &rel, message));
                self.setups.push(None);
                return;
            }
        };

        let mut raw_tests = Vec::new();
        if let Err(err) = self.harvest_module(&module, file, &mut raw_tests) {
            let message = format!("{err}");
            self.errors.push(CollectionError {
                path: rel.clone(),
                message: message.clone(),
            });
            self.items.push(synthetic_error_item(self.py, &rel, message));
            self.setups.push(None);
            return;
        }

        for raw in raw_tests {
            self.expand(raw, &rel, blocked.clone());
        }
    }

    /// Register fixtures defined at module top level.
    fn harvest_fixtures(
        &mut self,
        module: &Bound<'py, PyAny>,
        file: &Path,
        origin: FixtureOrigin,
    ) -> PyResult<()> {
        let dict = module.getattr("__dict__")?;
        let dict = dict.downcast::<PyDict>()?;
        let inspect = self.py.import("inspect")?;
        let isfunction = inspect.getattr("isfunction")?;

        for (key, value) in dict.iter() {
            if !isfunction.call1((&value,))?.is_truthy()? {
                continue;
            }
            let attr_name: String = key.extract()?;
            if let Ok(record) = value.getattr("__presto_fixture__") {
                match self.build_fixture(&attr_name, &value, &record, file, origin.clone()) {
                    Ok(def) => self.registry.add(def),
                    Err(message) => self.errors.push(CollectionError {
                        path: self.rel(file),
                        message,
                    }),
                }
            }
        }
        Ok(())
    }

    fn build_fixture(
        &self,
        attr_name: &str,
        callable: &Bound<'py, PyAny>,
        record: &Bound<'py, PyAny>,
        file: &Path,
        origin: FixtureOrigin,
    ) -> Result<FixtureDef, String> {
        let read = |field: &str| -> Option<Bound<'py, PyAny>> {
            record
                .get_item(field)
                .ok()
                .filter(|value| !value.is_none())
        };

        let scope_text: String = read("scope")
            .and_then(|value| value.extract().ok())
            .unwrap_or_else(|| "function".to_string());
        let scope = Scope::parse(&scope_text).ok_or_else(|| {
            format!("fixture '{attr_name}' declares unknown scope '{scope_text}'")
        })?;
        let autouse = read("autouse")
            .and_then(|value| value.extract().ok())
            .unwrap_or(false);
        let name: String = read("name")
            .and_then(|value| value.extract().ok())
            .unwrap_or_else(|| attr_name.to_string());

        let params = match read("params") {
            Some(list) => {
                let mut expanded = Vec::new();
                for entry in list
                    .try_iter()
                    .map_err(|err| format!("fixture '{attr_name}': {err}"))?
                {
                    let entry = entry.map_err(|err| format!("fixture '{attr_name}': {err}"))?;
                    let value = entry
                        .get_item("value")
                        .map_err(|err| format!("fixture '{attr_name}': {err}"))?;
                    let id: String = entry
                        .get_item("id")
                        .and_then(|id| id.extract())
                        .map_err(|err| format!("fixture '{attr_name}': {err}"))?;
                    expanded.push(FixtureParam {
                        value: value.unbind(),
                        id,
                    });
                }
                Some(expanded)
            }
            None => None,
        };

        let depends = python::signature_names(callable)
            .map_err(|err| format!("fixture '{attr_name}': {err}"))?;
        let kind = python::callable_kind(callable)
            .map_err(|err| format!("fixture '{attr_name}': {err}"))?;
        let line = definition_line(callable);

        Ok(FixtureDef {
            name,
            scope,
            autouse,
            kind,
            callable: callable.clone().unbind(),
            depends,
            params,
            origin,
            line,
        })
    }

    /// Harvest fixtures, free test functions, and `Test*` class methods.
    fn harvest_module(
        &mut self,
        module: &Bound<'py, PyAny>,
        file: &Path,
        raw_tests: &mut Vec<RawTest>,
    ) -> PyResult<()> {
        self.harvest_fixtures(module, file, FixtureOrigin::File(self.rel(file)))?;

        let dict = module.getattr("__dict__")?;
        let dict = dict.downcast::<PyDict>()?;
        let inspect = self.py.import("inspect")?;
        let isfunction = inspect.getattr("isfunction")?;
        let isclass = inspect.getattr("isclass")?;

        for (key, value) in dict.iter() {
            let name: String = key.extract()?;

            if isfunction.call1((&value,))?.is_truthy()? {
                if !name.starts_with("test_") || value.hasattr("__presto_fixture__")? {
                    continue;
                }
                let marks = self.read_mark_set(&value, None)?;
                raw_tests.push(RawTest {
                    name: name.clone(),
                    class_name: None,
                    params: python::signature_names(&value)?,
                    line: definition_line(&value),
                    is_async: python::is_coroutine_function(&value),
                    marks,
                    callable: value.unbind(),
                });
                continue;
            }

            if isclass.call1((&value,))?.is_truthy()? && name.starts_with("Test") {
                self.harvest_class(&value, &name, file, raw_tests)?;
            }
        }
        Ok(())
    }

    fn harvest_class(
        &mut self,
        class: &Bound<'py, PyAny>,
        class_name: &str,
        file: &Path,
        raw_tests: &mut Vec<RawTest>,
    ) -> PyResult<()> {
        let class_dict = class.getattr("__dict__")?;
        if class_dict.contains("__init__")? {
            debug!(
                "skipping class {class_name} in {}: it defines __init__",
                file.display()
            );
            return Ok(());
        }

        let instance = match class.call0() {
            Ok(instance) => instance,
            Err(err) => {
                self.errors.push(CollectionError {
                    path: self.rel(file),
                    message: format!("failed to instantiate {class_name}: {err}"),
                });
                return Ok(());
            }
        };

        let inspect = self.py.import("inspect")?;
        let isfunction = inspect.getattr("isfunction")?;

        for entry in class_dict.call_method0("items")?.try_iter()? {
            let entry = entry?;
            let method_name: String = entry.get_item(0)?.extract()?;
            let function = entry.get_item(1)?;
            if !method_name.starts_with("test_") || !isfunction.call1((&function,))?.is_truthy()? {
                continue;
            }
            let bound = instance.getattr(method_name.as_str())?;
            let marks = self.read_mark_set(&function, Some(class))?;
            raw_tests.push(RawTest {
                name: method_name,
                class_name: Some(class_name.to_string()),
                params: python::signature_names(&bound)?,
                line: definition_line(&function),
                is_async: python::is_coroutine_function(&bound),
                marks,
                callable: bound.unbind(),
            });
        }
        Ok(())
    }

    /// Parse `__presto_marks__` from a callable, merging class-level marks
    /// (applied first) for methods.
    fn read_mark_set(
        &self,
        function: &Bound<'py, PyAny>,
        class: Option<&Bound<'py, PyAny>>,
    ) -> PyResult<MarkSet> {
        let mut set = MarkSet::default();
        if let Some(class) = class {
            if let Ok(marks) = class.getattr("__presto_marks__") {
                self.apply_marks(&marks, &mut set)?;
            }
        }
        if let Ok(marks) = function.getattr("__presto_marks__") {
            self.apply_marks(&marks, &mut set)?;
        }
        Ok(set)
    }

    fn apply_marks(&self, marks: &Bound<'py, PyAny>, set: &mut MarkSet) -> PyResult<()> {
        for mark in marks.try_iter()? {
            let mark = mark?;
            let name: String = mark.get_item("name")?.extract()?;
            set.names.push(name.clone());
            match name.as_str() {
                "parametrize" => {
                    let mut cases = Vec::new();
                    for case in mark.get_item("cases")?.try_iter()? {
                        let case = case?;
                        let id: String = case.get_item("id")?.extract()?;
                        let values_obj = case.get_item("values")?;
                        let values_dict = values_obj.downcast::<PyDict>()?;
                        let mut values = Vec::new();
                        for (key, value) in values_dict.iter() {
                            values.push((key.extract::<String>()?, value.unbind()));
                        }
                        cases.push(ParamCase { id, values });
                    }
                    set.parametrize.push(cases);
                }
                "skip" => {
                    let reason = optional_string(&mark, "reason")?;
                    set.skip.push(SkipMark {
                        reason,
                        condition: None,
                    });
                }
                "skipif" => {
                    let reason = optional_string(&mark, "reason")?;
                    let condition_obj = mark.get_item("condition")?;
                    let condition = if let Ok(expr) = condition_obj.extract::<String>() {
                        SkipCondition::Expr(expr)
                    } else {
                        SkipCondition::Value(condition_obj.is_truthy()?)
                    };
                    set.skip.push(SkipMark {
                        reason,
                        condition: Some(condition),
                    });
                }
                "xfail" => {
                    let reason = optional_string(&mark, "reason")?;
                    let raises = mark
                        .get_item("raises")
                        .ok()
                        .filter(|value| !value.is_none())
                        .map(Bound::unbind);
                    set.xfail = Some(XfailMark { reason, raises });
                }
                "usefixtures" => {
                    for fixture in mark.get_item("fixtures")?.try_iter()? {
                        set.usefixtures.push(fixture?.extract()?);
                    }
                }
                "asyncio" => {
                    if let Some(scope_text) = optional_string(&mark, "loop_scope")? {
                        set.loop_scope = Scope::parse(&scope_text);
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Expand one raw test into concrete items: parametrize product times
    /// parametric-fixture product.
    fn expand(&mut self, raw: RawTest, rel_path: &Path, blocked: Option<String>) {
        let base_id = match &raw.class_name {
            Some(class) => format!("{}::{}::{}", rel_path.display(), class, raw.name),
            None => format!("{}::{}", rel_path.display(), raw.name),
        };
        let package = rel_path.parent().map(Path::to_path_buf).unwrap_or_default();

        // Parametrize product over stacked decorators.
        let mut combos: Vec<(Vec<String>, ParamBinding)> = vec![(Vec::new(), ParamBinding::new())];
        for cases in &raw.marks.parametrize {
            let mut next = Vec::new();
            for (id_parts, binding) in &combos {
                for case in cases {
                    let mut id_parts = id_parts.clone();
                    id_parts.push(case.id.clone());
                    let mut binding: ParamBinding = binding
                        .iter()
                        .map(|(k, v)| (k.clone(), v.clone_ref(self.py)))
                        .collect();
                    for (name, value) in &case.values {
                        binding.insert(name.clone(), value.clone_ref(self.py));
                    }
                    next.push((id_parts, binding));
                }
            }
            combos = next;
        }

        // Parametric fixtures in the dependency closure multiply further.
        // Resolution failure here marks the item errored instead of running.
        // The closure depends only on the test's location and requirement
        // names, which are identical across expansions, so the one plan
        // computed against the probe serves every expanded item.
        let mut fixture_products: Vec<(Vec<String>, IndexMap<String, usize>)> =
            vec![(Vec::new(), IndexMap::new())];
        let mut setup: Option<SetupPlan> = None;
        let mut resolve_failure: Option<String> = None;
        if blocked.is_none() {
            let probe = self.probe_item(&raw, rel_path, &package, &combos[0].1);
            match resolver::resolve_item(&probe, &self.registry) {
                Ok(plan) => {
                    for name in &plan.parametric {
                        let def = match self.registry.lookup(name, &probe.path) {
                            Some(def) => def,
                            None => continue,
                        };
                        let params = match &def.params {
                            Some(params) => params,
                            None => continue,
                        };
                        let mut next = Vec::new();
                        for (id_parts, indices) in &fixture_products {
                            for (index, param) in params.iter().enumerate() {
                                let mut id_parts = id_parts.clone();
                                id_parts.push(param.id.clone());
                                let mut indices = indices.clone();
                                indices.insert(name.clone(), index);
                                next.push((id_parts, indices));
                            }
                        }
                        fixture_products = next;
                    }
                    setup = Some(plan);
                }
                Err(err) => resolve_failure = Some(err.to_string()),
            }
        }

        let blocked = blocked.or(resolve_failure);

        for (case_parts, binding) in combos {
            for (fixture_parts, indices) in &fixture_products {
                let mut id_parts = case_parts.clone();
                id_parts.extend(fixture_parts.iter().cloned());
                let id = if id_parts.is_empty() {
                    base_id.clone()
                } else {
                    format!("{}[{}]", base_id, id_parts.join("-"))
                };
                self.items.push(TestItem {
                    id,
                    path: rel_path.to_path_buf(),
                    package: package.clone(),
                    class_name: raw.class_name.clone(),
                    name: raw.name.clone(),
                    callable: raw.callable.clone_ref(self.py),
                    params: raw.params.clone(),
                    param_values: binding
                        .iter()
                        .map(|(k, v)| (k.clone(), v.clone_ref(self.py)))
                        .collect(),
                    fixture_param_indices: indices.clone(),
                    marks: raw.marks.names.clone(),
                    usefixtures: raw.marks.usefixtures.clone(),
                    skip: raw
                        .marks
                        .skip
                        .iter()
                        .map(|mark| SkipMark {
                            reason: mark.reason.clone(),
                            condition: match &mark.condition {
                                Some(SkipCondition::Value(value)) => {
                                    Some(SkipCondition::Value(*value))
                                }
                                Some(SkipCondition::Expr(expr)) => {
                                    Some(SkipCondition::Expr(expr.clone()))
                                }
                                None => None,
                            },
                        })
                        .collect(),
                    xfail: raw.marks.xfail.as_ref().map(|mark| XfailMark {
                        reason: mark.reason.clone(),
                        raises: mark.raises.as_ref().map(|r| r.clone_ref(self.py)),
                    }),
                    is_async: raw.is_async,
                    loop_scope: raw.marks.loop_scope,
                    line: raw.line,
                    blocked: blocked.clone(),
                });
                // `setup` is None exactly when the item is blocked.
                self.setups.push(setup.clone());
            }
        }
    }

    /// A throwaway item used only to compute the fixture closure before
    /// expansion.
    fn probe_item(
        &self,
        raw: &RawTest,
        rel_path: &Path,
        package: &Path,
        binding: &ParamBinding,
    ) -> TestItem {
        TestItem {
            id: String::new(),
            path: rel_path.to_path_buf(),
            package: package.to_path_buf(),
            class_name: raw.class_name.clone(),
            name: raw.name.clone(),
            callable: raw.callable.clone_ref(self.py),
            params: raw.params.clone(),
            param_values: binding
                .iter()
                .map(|(k, v)| (k.clone(), v.clone_ref(self.py)))
                .collect(),
            fixture_param_indices: IndexMap::new(),
            marks: Vec::new(),
            usefixtures: raw.marks.usefixtures.clone(),
            skip: Vec::new(),
            xfail: None,
            is_async: raw.is_async,
            loop_scope: raw.marks.loop_scope,
            line: raw.line,
            blocked: None,
        }
    }
}

fn optional_string(mark: &Bound<'_, PyAny>, field: &str) -> PyResult<Option<String>> {
    match mark.get_item(field) {
        Ok(value) if !value.is_none() => Ok(Some(value.extract()?)),
        _ => Ok(None),
    }
}

fn definition_line(callable: &Bound<'_, PyAny>) -> usize {
    callable
        .getattr("__code__")
        .and_then(|code| code.getattr("co_firstlineno"))
        .and_then(|line| line.extract())
        .unwrap_or(0)
}

/// Item standing in for a file that failed to load; always reported
/// `errored` with the load diagnostic.
fn synthetic_error_item(py: Python<'_>, rel_path: &Path, message: String) -> TestItem {
    TestItem {
        id: rel_path.display().to_string(),
        path: rel_path.to_path_buf(),
        package: rel_path.parent().map(Path::to_path_buf).unwrap_or_default(),
        class_name: None,
        name: String::new(),
        callable: py.None(),
        params: Vec::new(),
        param_values: ParamBinding::new(),
        fixture_param_indices: IndexMap::new(),
        marks: Vec::new(),
        usefixtures: Vec::new(),
        skip: Vec::new(),
        xfail: None,
        is_async: false,
        loop_scope: None,
        line: 0,
        blocked: Some(message),
    }
}
