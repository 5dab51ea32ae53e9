//! Persisted last-run outcomes, backing `--lf` and `--ff`.
//!
//! A single JSON file in the cache directory maps item id to the outcome of
//! the most recent run. Reads are tolerant: a missing or unreadable cache
//! means "no prior record" and the plan falls back to discovery order.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::model::{Outcome, RunReport};

const LAST_RUN_FILE: &str = "lastrun.json";

#[derive(Debug, Default, Serialize, Deserialize)]
struct LastRunFile {
    outcomes: BTreeMap<String, String>,
}

fn last_run_path(cache_dir: &Path) -> PathBuf {
    cache_dir.join(LAST_RUN_FILE)
}

/// Read the previous run's outcomes. `None` when there is no usable record.
pub fn read_outcomes(cache_dir: &Path) -> Option<BTreeMap<String, Outcome>> {
    let path = last_run_path(cache_dir);
    if !path.exists() {
        return None;
    }

    let content = match fs::read_to_string(&path) {
        Ok(content) => content,
        Err(err) => {
            debug!("failed to read {}: {err}", path.display());
            return None;
        }
    };

    let parsed: LastRunFile = match serde_json::from_str(&content) {
        Ok(parsed) => parsed,
        Err(err) => {
            debug!("discarding unreadable cache {}: {err}", path.display());
            return None;
        }
    };

    Some(
        parsed
            .outcomes
            .into_iter()
            .filter_map(|(id, outcome)| Outcome::parse(&outcome).map(|o| (id, o)))
            .collect(),
    )
}

/// Rewrite the cache from a finished run, overlaying this run's outcomes on
/// the previous record so items outside the plan keep their last outcome.
/// Atomic: the new content lands in a sibling temp file first and is renamed
/// over the old one. Failures are logged and swallowed; cache IO must never
/// fail a run.
pub fn write_outcomes(
    cache_dir: &Path,
    report: &RunReport,
    previous: Option<&BTreeMap<String, Outcome>>,
) {
    let mut outcomes: BTreeMap<String, String> = previous
        .map(|map| {
            map.iter()
                .map(|(id, outcome)| (id.clone(), outcome.as_str().to_string()))
                .collect()
        })
        .unwrap_or_default();
    for result in &report.results {
        outcomes.insert(result.id.clone(), result.outcome.as_str().to_string());
    }
    let file = LastRunFile { outcomes };

    if let Err(err) = try_write(cache_dir, &file) {
        warn!("failed to write last-run cache: {err}");
    }
}

fn try_write(cache_dir: &Path, file: &LastRunFile) -> std::io::Result<()> {
    fs::create_dir_all(cache_dir)?;
    let path = last_run_path(cache_dir);
    let staged = path.with_extension("json.tmp");
    let content = serde_json::to_string_pretty(file)
        .map_err(|err| std::io::Error::other(err.to_string()))?;
    fs::write(&staged, content)?;
    fs::rename(&staged, &path)?;
    Ok(())
}
