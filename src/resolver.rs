//! Per-item fixture dependency resolution.
//!
//! Depth-first traversal over the requirement set, emitting fixtures in
//! post-order so dependencies build before their dependents. Cycles and
//! missing names are hard errors detected before any user code runs.

use std::collections::HashSet;
use std::fmt;
use std::path::Path;

use crate::model::{Scope, TestItem};
use crate::registry::FixtureRegistry;

/// The builtin `request` name is satisfied by the executor, not the
/// registry, and never participates in cycle detection.
pub const REQUEST_FIXTURE: &str = "request";

/// The ordered setup recipe for one test item.
#[derive(Debug, Default, Clone)]
pub struct SetupPlan {
    /// Fixture names in build order, dependencies before dependents.
    pub order: Vec<String>,
    /// Widest scope of any async fixture in the closure.
    pub widest_async_scope: Option<Scope>,
    /// Parametric fixtures in the closure, in first-visit order.
    pub parametric: Vec<String>,
}

impl SetupPlan {
    /// True when the closure contains an async fixture at session or
    /// package scope, which disqualifies the item from batching.
    pub fn has_broad_async_fixture(&self) -> bool {
        matches!(
            self.widest_async_scope,
            Some(Scope::Session) | Some(Scope::Package)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolveError {
    Missing {
        name: String,
        suggestions: Vec<String>,
    },
    Cycle {
        chain: Vec<String>,
    },
    ScopeMismatch {
        fixture: String,
        fixture_scope: Scope,
        dependency: String,
        dependency_scope: Scope,
    },
}

impl fmt::Display for ResolveError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResolveError::Missing { name, suggestions } => {
                write!(f, "fixture '{name}' not found")?;
                if !suggestions.is_empty() {
                    let quoted: Vec<String> =
                        suggestions.iter().map(|s| format!("'{s}'")).collect();
                    write!(f, "; did you mean {}?", quoted.join(", "))?;
                }
                Ok(())
            }
            ResolveError::Cycle { chain } => {
                write!(f, "cyclic fixture dependency: {}", chain.join(" -> "))
            }
            ResolveError::ScopeMismatch {
                fixture,
                fixture_scope,
                dependency,
                dependency_scope,
            } => write!(
                f,
                "fixture '{fixture}' (scope {fixture_scope}) cannot depend on \
                 '{dependency}' (scope {dependency_scope}); a fixture may only depend \
                 on fixtures of equal or broader scope"
            ),
        }
    }
}

impl std::error::Error for ResolveError {}

/// The names a test item demands directly: applicable autouse fixtures
/// first, then `usefixtures` marks, then declared parameters that are not
/// bound by parametrize.
pub fn requirement_roots(item: &TestItem, registry: &FixtureRegistry) -> Vec<String> {
    let mut roots: Vec<String> = Vec::new();
    let mut seen: HashSet<&str> = HashSet::new();

    for def in registry.autouse_for(&item.path) {
        if seen.insert(&def.name) {
            roots.push(def.name.clone());
        }
    }
    for name in &item.usefixtures {
        if seen.insert(name) {
            roots.push(name.clone());
        }
    }
    for name in &item.params {
        if item.param_values.contains_key(name) || name == REQUEST_FIXTURE {
            continue;
        }
        if seen.insert(name) {
            roots.push(name.clone());
        }
    }
    roots
}

/// Resolve the full setup plan for a test item.
pub fn resolve_item(item: &TestItem, registry: &FixtureRegistry) -> Result<SetupPlan, ResolveError> {
    resolve(&item.path, &requirement_roots(item, registry), registry)
}

/// Resolve a requirement set for a test located at `item_path`.
pub fn resolve(
    item_path: &Path,
    roots: &[String],
    registry: &FixtureRegistry,
) -> Result<SetupPlan, ResolveError> {
    let mut state = Walk {
        registry,
        item_path,
        stack: Vec::new(),
        done: HashSet::new(),
        plan: SetupPlan::default(),
    };
    for root in roots {
        state.visit(root)?;
    }
    Ok(state.plan)
}

struct Walk<'a> {
    registry: &'a FixtureRegistry,
    item_path: &'a Path,
    /// Current DFS chain, for cycle reporting.
    stack: Vec<String>,
    done: HashSet<String>,
    plan: SetupPlan,
}

impl Walk<'_> {
    fn visit(&mut self, name: &str) -> Result<(), ResolveError> {
        if self.done.contains(name) {
            return Ok(());
        }
        if let Some(position) = self.stack.iter().position(|entry| entry == name) {
            let mut chain: Vec<String> = self.stack[position..].to_vec();
            chain.push(name.to_string());
            return Err(ResolveError::Cycle { chain });
        }

        let Some(def) = self.registry.lookup(name, self.item_path) else {
            return Err(ResolveError::Missing {
                name: name.to_string(),
                suggestions: suggest(name, self.registry),
            });
        };

        self.stack.push(name.to_string());
        for dep in def.depends.clone() {
            if dep == REQUEST_FIXTURE {
                continue;
            }
            if let Some(dep_def) = self.registry.lookup(&dep, self.item_path) {
                if dep_def.scope < def.scope {
                    return Err(ResolveError::ScopeMismatch {
                        fixture: def.name.clone(),
                        fixture_scope: def.scope,
                        dependency: dep_def.name.clone(),
                        dependency_scope: dep_def.scope,
                    });
                }
            }
            self.visit(&dep)?;
        }
        self.stack.pop();

        if def.kind.is_async() {
            let widest = self.plan.widest_async_scope.get_or_insert(def.scope);
            if def.scope > *widest {
                *widest = def.scope;
            }
        }
        if def.params.is_some() {
            self.plan.parametric.push(name.to_string());
        }
        self.done.insert(name.to_string());
        self.plan.order.push(name.to_string());
        Ok(())
    }
}

/// Closest registered names by edit distance, best first.
fn suggest(name: &str, registry: &FixtureRegistry) -> Vec<String> {
    let mut ranked: Vec<(usize, String)> = registry
        .names()
        .filter_map(|candidate| {
            let distance = levenshtein(name, candidate);
            let cutoff = (name.len().max(candidate.len()) / 2).max(2);
            (distance <= cutoff).then(|| (distance, candidate.to_string()))
        })
        .collect();
    ranked.sort();
    ranked.into_iter().take(3).map(|(_, name)| name).collect()
}

/// Classic dynamic-programming edit distance.
fn levenshtein(a: &str, b: &str) -> usize {
    let a_chars: Vec<char> = a.chars().collect();
    let b_chars: Vec<char> = b.chars().collect();
    let m = a_chars.len();
    let n = b_chars.len();
    if m == 0 {
        return n;
    }
    if n == 0 {
        return m;
    }

    let mut matrix = vec![vec![0usize; n + 1]; m + 1];
    for (i, row) in matrix.iter_mut().enumerate() {
        row[0] = i;
    }
    for j in 0..=n {
        matrix[0][j] = j;
    }
    for i in 1..=m {
        for j in 1..=n {
            let cost = usize::from(a_chars[i - 1] != b_chars[j - 1]);
            matrix[i][j] = (matrix[i - 1][j] + 1)
                .min(matrix[i][j - 1] + 1)
                .min(matrix[i - 1][j - 1] + cost);
        }
    }
    matrix[m][n]
}
