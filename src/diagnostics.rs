//! Error enrichment: raw interpreter exceptions become structured
//! diagnostic payloads. Formatting is left entirely to renderers.

use std::ffi::CString;

use pyo3::exceptions::PyAssertionError;
use pyo3::prelude::*;
use pyo3::types::PyDict;
use regex::Regex;

use crate::model::{Diagnostic, FrameInfo};
use crate::python::py_repr;

/// How many lines of source context surround the failing line.
const CONTEXT_LINES: usize = 3;

/// Build a diagnostic for an error that never touched the interpreter
/// (resolver failures, blocked items).
pub fn synthetic(exception: &str, message: &str) -> Diagnostic {
    Diagnostic {
        exception: exception.to_string(),
        message: message.to_string(),
        ..Diagnostic::default()
    }
}

/// Convert a Python exception into a diagnostic record: type, message,
/// frame chain, source context, and — for binary-comparison asserts — the
/// two compared values pulled from the deepest frame.
pub fn from_pyerr(py: Python<'_>, err: &PyErr) -> Diagnostic {
    let exception = err
        .get_type(py)
        .name()
        .map(|name| name.to_string())
        .unwrap_or_else(|_| "Exception".to_string());
    let message = err.value(py).to_string();

    let frames = err
        .traceback(py)
        .map(|tb| frames_from_traceback(py, tb.into_any()))
        .unwrap_or_default();

    let mut diagnostic = Diagnostic {
        exception,
        message,
        frames,
        expected: None,
        received: None,
        context: Vec::new(),
    };

    if let Some(deepest) = diagnostic.frames.last().cloned() {
        diagnostic.context = context_lines(py, &deepest.path, deepest.line);
        if err.is_instance_of::<PyAssertionError>(py) {
            if let Some(tb) = err.traceback(py) {
                if let Some((expected, received)) =
                    comparison_values(py, &tb.into_any(), &deepest.source)
                {
                    diagnostic.expected = Some(expected);
                    diagnostic.received = Some(received);
                }
            }
        }
    }

    diagnostic
}

fn frames_from_traceback(py: Python<'_>, tb: Bound<'_, PyAny>) -> Vec<FrameInfo> {
    let mut frames = Vec::new();
    let mut current = Some(tb);
    while let Some(tb) = current {
        if let Some(frame) = read_frame(py, &tb) {
            frames.push(frame);
        }
        current = tb
            .getattr("tb_next")
            .ok()
            .filter(|next| !next.is_none());
    }
    frames
}

fn read_frame(py: Python<'_>, tb: &Bound<'_, PyAny>) -> Option<FrameInfo> {
    let line: usize = tb.getattr("tb_lineno").ok()?.extract().ok()?;
    let frame = tb.getattr("tb_frame").ok()?;
    let code = frame.getattr("f_code").ok()?;
    let path: String = code.getattr("co_filename").ok()?.extract().ok()?;
    let function: String = code.getattr("co_name").ok()?.extract().ok()?;
    let source = source_line(py, &path, line).unwrap_or_default();
    Some(FrameInfo {
        path,
        line,
        function,
        source,
    })
}

/// One stripped source line via `linecache` (empty when unavailable).
fn source_line(py: Python<'_>, path: &str, line: usize) -> Option<String> {
    let linecache = py.import("linecache").ok()?;
    let text: String = linecache
        .call_method1("getline", (path, line))
        .ok()?
        .extract()
        .ok()?;
    let trimmed = text.trim_end().trim_start().to_string();
    (!trimmed.is_empty()).then_some(trimmed)
}

/// Source lines around the failing line, untrimmed on the left so the
/// renderer can keep indentation.
fn context_lines(py: Python<'_>, path: &str, line: usize) -> Vec<String> {
    let Ok(linecache) = py.import("linecache") else {
        return Vec::new();
    };
    let start = line.saturating_sub(CONTEXT_LINES / 2).max(1);
    let mut lines = Vec::new();
    for current in start..start + CONTEXT_LINES {
        let text: String = match linecache
            .call_method1("getline", (path, current))
            .and_then(|value| value.extract())
        {
            Ok(text) => text,
            Err(_) => continue,
        };
        let text = text.trim_end().to_string();
        if text.is_empty() && lines.is_empty() {
            continue;
        }
        lines.push(text);
    }
    while lines.last().is_some_and(String::is_empty) {
        lines.pop();
    }
    lines
}

/// For `assert a <op> b`, evaluate both sides in the deepest frame and
/// return `(expected, received)` reprs. Comparison convention: the
/// right-hand side of `==` and of ordering operators is the expectation.
fn comparison_values(
    py: Python<'_>,
    tb: &Bound<'_, PyAny>,
    source: &str,
) -> Option<(String, String)> {
    let re = Regex::new(r"^assert\s+(.+?)\s*(==|!=|>=|<=|>|<)\s*(.+?)\s*(?:,.+)?$").ok()?;
    let caps = re.captures(source.trim())?;
    let left_expr = caps.get(1)?.as_str();
    let operator = caps.get(2)?.as_str();
    let right_expr = caps.get(3)?.as_str();

    // Walk to the deepest frame, where the assertion ran.
    let mut deepest = tb.clone();
    while let Ok(next) = deepest.getattr("tb_next") {
        if next.is_none() {
            break;
        }
        deepest = next;
    }
    let frame = deepest.getattr("tb_frame").ok()?;
    let globals = frame.getattr("f_globals").ok()?;
    let globals = globals.downcast::<PyDict>().ok()?;
    // f_locals may be a mapping proxy rather than a dict; normalize.
    let locals_any = frame.getattr("f_locals").ok()?;
    let locals: Bound<'_, PyDict> = match locals_any.downcast_into::<PyDict>() {
        Ok(dict) => dict,
        Err(err) => py
            .import("builtins")
            .ok()?
            .getattr("dict")
            .ok()?
            .call1((err.into_inner(),))
            .ok()?
            .downcast_into::<PyDict>()
            .ok()?,
    };

    let eval_expr = |expr: &str| -> Option<String> {
        let code = CString::new(expr).ok()?;
        py.eval(code.as_c_str(), Some(globals), Some(&locals))
            .ok()
            .map(|value| py_repr(&value))
    };

    let left = eval_expr(left_expr)?;
    let right = eval_expr(right_expr)?;

    match operator {
        "!=" => Some((left, right)),
        _ => Some((right, left)),
    }
}
