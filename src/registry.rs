//! Flat, scope-addressable index of fixture definitions.
//!
//! Lookup walks outward from a test's lexical location: fixtures defined in
//! the test's own file win over shared-file (`conftest.py`) fixtures, and
//! deeper shared files win over shallower ones.

use std::path::Path;

use indexmap::IndexMap;

use crate::model::{FixtureDef, FixtureOrigin};

#[derive(Default)]
pub struct FixtureRegistry {
    /// name -> candidates in registration order (ancestor conftests first,
    /// then test files, matching discovery order).
    fixtures: IndexMap<String, Vec<FixtureDef>>,
}

impl FixtureRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, def: FixtureDef) {
        self.fixtures.entry(def.name.clone()).or_default().push(def);
    }

    pub fn is_empty(&self) -> bool {
        self.fixtures.is_empty()
    }

    /// All registered fixture names, for suggestion ranking.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.fixtures.keys().map(String::as_str)
    }

    /// Resolve `name` for a test defined in `item_path`. Returns the
    /// innermost reachable candidate, or `None` when nothing is in scope.
    pub fn lookup(&self, name: &str, item_path: &Path) -> Option<&FixtureDef> {
        let candidates = self.fixtures.get(name)?;
        candidates
            .iter()
            .filter(|def| reaches(&def.origin, item_path))
            .max_by_key(|def| specificity(&def.origin))
    }

    /// Autouse fixtures applicable to a test in `item_path`, in registration
    /// order (ancestor shared files before the test's own file). When the
    /// same name is autouse at several levels, only the innermost reachable
    /// definition applies.
    pub fn autouse_for(&self, item_path: &Path) -> Vec<&FixtureDef> {
        let mut applicable = Vec::new();
        for name in self.fixtures.keys() {
            if let Some(def) = self.lookup(name, item_path) {
                if def.autouse {
                    applicable.push(def);
                }
            }
        }
        applicable
    }
}

fn reaches(origin: &FixtureOrigin, item_path: &Path) -> bool {
    match origin {
        FixtureOrigin::File(path) => path == item_path,
        FixtureOrigin::Dir(dir) => item_path.starts_with(dir),
    }
}

/// Higher value wins lookup: the defining file itself beats any shared-file
/// ancestor, and deeper ancestors beat shallower ones.
fn specificity(origin: &FixtureOrigin) -> usize {
    match origin {
        FixtureOrigin::File(_) => usize::MAX,
        FixtureOrigin::Dir(dir) => dir.components().count(),
    }
}
