//! Interpreter plumbing: API-module bootstrap, module loading, and the
//! signature probe used by discovery.

use std::ffi::CString;
use std::path::{Path, PathBuf};

use pyo3::exceptions::PyRuntimeError;
use pyo3::prelude::*;
use pyo3::types::{PyDict, PyModule};

use crate::model::FixtureKind;

/// Name the tagging surface is published under inside the interpreter.
pub const API_MODULE: &str = "presto";

const API_SOURCE: &str = include_str!("api.py");

/// Install the embedded `presto` module into `sys.modules` so test files can
/// import it. Idempotent; called once before any module load.
pub fn ensure_api_module(py: Python<'_>) -> PyResult<()> {
    let modules = py.import("sys")?.getattr("modules")?;
    if modules.contains(API_MODULE)? {
        return Ok(());
    }
    let source = CString::new(API_SOURCE)
        .map_err(|_| PyRuntimeError::new_err("embedded api module contains a NUL byte"))?;
    let module = PyModule::from_code(py, source.as_c_str(), c"presto/__init__.py", c"presto")?;
    modules.set_item(API_MODULE, module)?;
    Ok(())
}

/// Fetch the `Skipped` / `XFailed` sentinel types from the API module.
pub fn sentinel_type<'py>(py: Python<'py>, name: &str) -> PyResult<Bound<'py, PyAny>> {
    ensure_api_module(py)?;
    py.import(API_MODULE)?.getattr(name)
}

/// Prepend extra source roots to `sys.path`, keeping their relative order.
pub fn prepend_sys_path(py: Python<'_>, roots: &[PathBuf]) -> PyResult<()> {
    if roots.is_empty() {
        return Ok(());
    }
    let path = py.import("sys")?.getattr("path")?;
    for root in roots.iter().rev() {
        path.call_method1("insert", (0, root.to_string_lossy().as_ref()))?;
    }
    Ok(())
}

/// Load a module from disk via `importlib`, registering it under
/// `module_name` so relative imports inside packages keep working.
pub fn load_module_from_path<'py>(
    py: Python<'py>,
    path: &Path,
    module_name: &str,
    package: Option<&str>,
) -> PyResult<Bound<'py, PyAny>> {
    let importlib = py.import("importlib.util")?;
    let path_str = path.to_string_lossy();
    let spec = importlib.call_method1("spec_from_file_location", (module_name, path_str.as_ref()))?;
    if spec.is_none() {
        return Err(PyRuntimeError::new_err(format!(
            "unable to build an import spec for {}",
            path.display()
        )));
    }
    let loader = spec.getattr("loader")?;
    if loader.is_none() {
        return Err(PyRuntimeError::new_err(format!(
            "no loader available for {}",
            path.display()
        )));
    }
    let module = importlib.call_method1("module_from_spec", (&spec,))?;
    if let Some(package_name) = package {
        module.setattr("__package__", package_name)?;
    }
    py.import("sys")?
        .getattr("modules")?
        .set_item(module_name, &module)?;
    loader.call_method1("exec_module", (&module,))?;
    Ok(module)
}

/// Compute a stable dotted module name for a test file by walking the
/// `__init__.py` chain upward. Files outside any package get a generated
/// name so repeated basenames cannot collide in `sys.modules`.
pub fn module_name_for(path: &Path, fallback_id: usize) -> (String, Option<String>) {
    let stem = path
        .file_stem()
        .and_then(|value| value.to_str())
        .unwrap_or("presto_module");

    let mut components = vec![stem.to_string()];
    let mut parent = path.parent();
    while let Some(dir) = parent {
        if !dir.join("__init__.py").exists() {
            break;
        }
        if let Some(name) = dir.file_name().and_then(|value| value.to_str()) {
            components.push(name.to_string());
        }
        parent = dir.parent();
    }

    if components.len() == 1 {
        return (format!("presto_module_{fallback_id}_{stem}"), None);
    }

    components.reverse();
    let package = components[..components.len() - 1].join(".");
    (components.join("."), Some(package))
}

/// Parameter names of a callable, probed once at discovery.
pub fn signature_names(callable: &Bound<'_, PyAny>) -> PyResult<Vec<String>> {
    let inspect = callable.py().import("inspect")?;
    let signature = inspect.call_method1("signature", (callable,))?;
    let parameters = signature.getattr("parameters")?;
    let mut names = Vec::new();
    for key in parameters.call_method0("keys")?.try_iter()? {
        names.push(key?.extract()?);
    }
    Ok(names)
}

/// Classify how a callable produces its value.
pub fn callable_kind(callable: &Bound<'_, PyAny>) -> PyResult<FixtureKind> {
    let inspect = callable.py().import("inspect")?;
    if inspect
        .call_method1("isasyncgenfunction", (callable,))?
        .is_truthy()?
    {
        return Ok(FixtureKind::AsyncGenerator);
    }
    if inspect
        .call_method1("iscoroutinefunction", (callable,))?
        .is_truthy()?
    {
        return Ok(FixtureKind::AsyncValue);
    }
    if inspect
        .call_method1("isgeneratorfunction", (callable,))?
        .is_truthy()?
    {
        return Ok(FixtureKind::Generator);
    }
    Ok(FixtureKind::Value)
}

/// Whether a value is a live coroutine object.
pub fn is_coroutine(value: &Bound<'_, PyAny>) -> bool {
    value
        .py()
        .import("inspect")
        .and_then(|inspect| inspect.call_method1("iscoroutine", (value,)))
        .and_then(|flag| flag.is_truthy())
        .unwrap_or(false)
}

/// Whether a callable is a coroutine function.
pub fn is_coroutine_function(callable: &Bound<'_, PyAny>) -> bool {
    callable
        .py()
        .import("inspect")
        .and_then(|inspect| inspect.call_method1("iscoroutinefunction", (callable,)))
        .and_then(|flag| flag.is_truthy())
        .unwrap_or(false)
}

/// Evaluate a deferred condition expression in the namespace of the module
/// that defined `callable` (used by `mark.skipif` string conditions).
pub fn eval_in_defining_module(py: Python<'_>, expr: &str, callable: &Py<PyAny>) -> PyResult<bool> {
    let bound = callable.bind(py);
    let globals = bound.getattr("__globals__")?;
    let globals = globals.downcast::<PyDict>().ok();
    let code = CString::new(expr)
        .map_err(|_| PyRuntimeError::new_err("condition expression contains a NUL byte"))?;
    py.eval(code.as_c_str(), globals, None)?.is_truthy()
}

/// Best-effort `repr()` for diagnostics.
pub fn py_repr(value: &Bound<'_, PyAny>) -> String {
    value
        .repr()
        .map(|repr| repr.to_string())
        .unwrap_or_else(|_| "<unrepresentable>".to_string())
}
