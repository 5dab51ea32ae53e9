//! Core vocabulary shared by discovery, planning, and execution.

use std::fmt;
use std::path::PathBuf;

use indexmap::IndexMap;
use pyo3::prelude::*;
use serde::{Deserialize, Serialize};

/// Fixture lifetime scope, narrowest first.
///
/// The ordering is load-bearing: `a > b` means `a` outlives `b`, and a
/// fixture may only depend on fixtures of equal or broader scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Scope {
    Function,
    Class,
    Module,
    Package,
    Session,
}

impl Scope {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scope::Function => "function",
            Scope::Class => "class",
            Scope::Module => "module",
            Scope::Package => "package",
            Scope::Session => "session",
        }
    }

    pub fn parse(value: &str) -> Option<Scope> {
        match value {
            "function" => Some(Scope::Function),
            "class" => Some(Scope::Class),
            "module" => Some(Scope::Module),
            "package" => Some(Scope::Package),
            "session" => Some(Scope::Session),
            _ => None,
        }
    }

    /// All scopes broader than function, narrowest first. Used when closing
    /// scope instances: narrower scopes finalize before broader ones.
    pub const SHARED: [Scope; 4] = [Scope::Class, Scope::Module, Scope::Package, Scope::Session];
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Final classification of one executed (or refused) test item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Passed,
    Failed,
    Skipped,
    Xfailed,
    Xpassed,
    Errored,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Passed => "passed",
            Outcome::Failed => "failed",
            Outcome::Skipped => "skipped",
            Outcome::Xfailed => "xfailed",
            Outcome::Xpassed => "xpassed",
            Outcome::Errored => "errored",
        }
    }

    pub fn parse(value: &str) -> Option<Outcome> {
        match value {
            "passed" => Some(Outcome::Passed),
            "failed" => Some(Outcome::Failed),
            "skipped" => Some(Outcome::Skipped),
            "xfailed" => Some(Outcome::Xfailed),
            "xpassed" => Some(Outcome::Xpassed),
            "errored" => Some(Outcome::Errored),
            _ => None,
        }
    }

    /// True for the outcomes that make a run red.
    pub fn is_red(&self) -> bool {
        matches!(self, Outcome::Failed | Outcome::Errored)
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parameter binding produced by parametrize expansion: name -> value.
pub type ParamBinding = IndexMap<String, Py<PyAny>>;

/// Skip marker, either unconditional or gated on a condition that is
/// evaluated when the item runs.
#[derive(Debug)]
pub struct SkipMark {
    pub reason: Option<String>,
    pub condition: Option<SkipCondition>,
}

#[derive(Debug)]
pub enum SkipCondition {
    Value(bool),
    /// Expression source evaluated in the defining module's namespace.
    Expr(String),
}

/// Expected-failure marker.
pub struct XfailMark {
    pub reason: Option<String>,
    /// Exception type object; when set, only this exception counts as xfailed.
    pub raises: Option<Py<PyAny>>,
}

impl fmt::Debug for XfailMark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("XfailMark")
            .field("reason", &self.reason)
            .field("raises", &self.raises.is_some())
            .finish()
    }
}

/// One concrete execution unit, immutable after discovery.
pub struct TestItem {
    /// Stable identifier: `path::Class::name[param-id]`.
    pub id: String,
    /// Test file path, relative to the project root.
    pub path: PathBuf,
    /// Directory holding the test file; the package scope key.
    pub package: PathBuf,
    pub class_name: Option<String>,
    pub name: String,
    /// Opaque callable handle in the interpreter.
    pub callable: Py<PyAny>,
    /// Declared parameter names, probed once at discovery.
    pub params: Vec<String>,
    /// Values bound by `parametrize`, keyed by parameter name.
    pub param_values: ParamBinding,
    /// For each parametric fixture in the dependency closure, the index of
    /// the parameter this item was expanded for.
    pub fixture_param_indices: IndexMap<String, usize>,
    /// Mark names, for display and filtering.
    pub marks: Vec<String>,
    /// Fixtures injected via `usefixtures` (resolved but not passed).
    pub usefixtures: Vec<String>,
    /// Skip markers; the first one whose condition holds wins.
    pub skip: Vec<SkipMark>,
    pub xfail: Option<XfailMark>,
    pub is_async: bool,
    /// Explicit loop scope from `mark.asyncio(loop_scope=...)`.
    pub loop_scope: Option<Scope>,
    /// Definition line, for deterministic ordering.
    pub line: usize,
    /// Set when an ancestor conftest failed to load; the item is reported
    /// `errored` with this reason and never executed.
    pub blocked: Option<String>,
}

impl TestItem {
    /// The scope-instance key identifying which inhabitant of `scope` this
    /// item belongs to. Items sharing a key share cached fixture values.
    pub fn scope_key(&self, scope: Scope) -> String {
        match scope {
            Scope::Function => self.id.clone(),
            Scope::Class => match &self.class_name {
                Some(class) => format!("{}::{}", self.path.display(), class),
                // A classless item is its own class instance.
                None => self.id.clone(),
            },
            Scope::Module => self.path.display().to_string(),
            Scope::Package => self.package.display().to_string(),
            Scope::Session => String::new(),
        }
    }
}

impl fmt::Debug for TestItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TestItem")
            .field("id", &self.id)
            .field("is_async", &self.is_async)
            .field("marks", &self.marks)
            .finish()
    }
}

/// How a fixture produces its value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FixtureKind {
    /// Plain callable; the return value is the fixture value.
    Value,
    /// Generator: yields the value once, resumed past the yield to finalize.
    Generator,
    /// Coroutine function awaited on the scoped loop.
    AsyncValue,
    /// Async generator, the async analogue of `Generator`.
    AsyncGenerator,
}

impl FixtureKind {
    pub fn is_async(&self) -> bool {
        matches!(self, FixtureKind::AsyncValue | FixtureKind::AsyncGenerator)
    }

    pub fn is_yielding(&self) -> bool {
        matches!(self, FixtureKind::Generator | FixtureKind::AsyncGenerator)
    }
}

/// One declared parameter of a parametric fixture.
pub struct FixtureParam {
    pub value: Py<PyAny>,
    pub id: String,
}

/// Where a fixture was defined; drives innermost-wins lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FixtureOrigin {
    /// Defined in a test file; visible only to items of that file.
    File(PathBuf),
    /// Defined in a shared `conftest.py`; visible to everything beneath
    /// the directory.
    Dir(PathBuf),
}

/// A reusable value producer harvested at discovery.
pub struct FixtureDef {
    pub name: String,
    pub scope: Scope,
    pub autouse: bool,
    pub kind: FixtureKind,
    pub callable: Py<PyAny>,
    /// Dependency fixture names, from the signature probe.
    pub depends: Vec<String>,
    pub params: Option<Vec<FixtureParam>>,
    pub origin: FixtureOrigin,
    pub line: usize,
}

impl FixtureDef {
    /// Cache key for one scope instance; parametric fixtures get one slot
    /// per parameter index.
    pub fn cache_key(&self, param_index: Option<usize>) -> String {
        match param_index {
            Some(index) => format!("{}[{}]", self.name, index),
            None => self.name.clone(),
        }
    }
}

impl fmt::Debug for FixtureDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FixtureDef")
            .field("name", &self.name)
            .field("scope", &self.scope)
            .field("autouse", &self.autouse)
            .field("kind", &self.kind)
            .field("origin", &self.origin)
            .finish()
    }
}

/// Structured description of one stack frame in a diagnostic.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FrameInfo {
    pub path: String,
    pub line: usize,
    pub function: String,
    pub source: String,
}

/// Enriched failure payload; pure data, rendering happens outside the core.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Diagnostic {
    pub exception: String,
    pub message: String,
    pub frames: Vec<FrameInfo>,
    /// For binary-comparison asserts, the two compared values.
    pub expected: Option<String>,
    pub received: Option<String>,
    /// Source lines around the failing line in the deepest frame.
    pub context: Vec<String>,
}

/// Outcome record for a single item.
#[derive(Debug, Clone, Serialize)]
pub struct ItemReport {
    pub id: String,
    pub path: String,
    pub outcome: Outcome,
    pub duration: f64,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
    pub diagnostic: Option<Diagnostic>,
}

/// Aggregate counters for a finished run.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct Summary {
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub xfailed: usize,
    pub xpassed: usize,
    pub errored: usize,
    pub duration: f64,
}

impl Summary {
    pub fn record(&mut self, outcome: Outcome) {
        self.total += 1;
        match outcome {
            Outcome::Passed => self.passed += 1,
            Outcome::Failed => self.failed += 1,
            Outcome::Skipped => self.skipped += 1,
            Outcome::Xfailed => self.xfailed += 1,
            Outcome::Xpassed => self.xpassed += 1,
            Outcome::Errored => self.errored += 1,
        }
    }
}

/// Everything a caller needs after a run.
#[derive(Debug, Default)]
pub struct RunReport {
    pub results: Vec<ItemReport>,
    pub summary: Summary,
}

impl RunReport {
    /// Exit status for the thin CLI wrapper: 0 iff nothing failed or errored.
    pub fn exit_code(&self) -> i32 {
        if self.summary.failed > 0 || self.summary.errored > 0 {
            1
        } else {
            0
        }
    }
}

/// Fatal runner errors. Per-item failures never surface here; they become
/// outcomes in the report instead.
#[derive(Debug)]
pub enum RunnerError {
    PathNotFound(PathBuf),
    Interpreter(String),
    Io(std::io::Error),
}

impl fmt::Display for RunnerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunnerError::PathNotFound(path) => {
                write!(f, "file or directory not found: {}", path.display())
            }
            RunnerError::Interpreter(message) => write!(f, "interpreter error: {message}"),
            RunnerError::Io(err) => write!(f, "io error: {err}"),
        }
    }
}

impl std::error::Error for RunnerError {}

impl From<std::io::Error> for RunnerError {
    fn from(err: std::io::Error) -> Self {
        RunnerError::Io(err)
    }
}

impl From<PyErr> for RunnerError {
    fn from(err: PyErr) -> Self {
        RunnerError::Interpreter(err.to_string())
    }
}
