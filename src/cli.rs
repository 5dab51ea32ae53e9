//! Thin CLI argument surface over the core.

use std::path::PathBuf;

use clap::Parser;

use crate::config::{ProjectConfig, RunConfig};

/// Exit codes for the CLI.
pub mod exit_codes {
    /// No test failed or errored.
    pub const OK: i32 = 0;
    /// Tests were collected and run but some failed or errored.
    pub const TESTS_FAILED: i32 = 1;
    /// Invalid invocation: conflicting flags or a missing input path.
    pub const USAGE_ERROR: i32 = 4;
}

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Test files or directories to run
    #[arg(help = "Test files or directories to run")]
    pub paths: Vec<PathBuf>,

    /// Stop after the first failing test
    #[arg(short = 'x', long = "fail-fast")]
    pub fail_fast: bool,

    /// Run only the tests that failed or errored last run
    #[arg(long = "lf", alias = "last-failed")]
    pub last_failed: bool,

    /// Run last run's failures first, then the rest in discovery order
    #[arg(long = "ff", alias = "failed-first")]
    pub failed_first: bool,

    /// Only run tests whose id contains the given substring
    #[arg(short = 'p', long)]
    pub pattern: Option<String>,

    /// Do not capture stdout/stderr
    #[arg(short = 's', long = "no-capture")]
    pub no_capture: bool,

    /// ASCII-only renderer output
    #[arg(long)]
    pub ascii: bool,

    /// Collect tests and print their ids without running them
    #[arg(long)]
    pub collect_only: bool,

    /// Cache directory (default: .presto_cache under the project root)
    #[arg(long)]
    pub cache_dir: Option<PathBuf>,
}

impl Args {
    pub fn validate(&self) -> Result<(), String> {
        if self.last_failed && self.failed_first {
            return Err("--lf and --ff are mutually exclusive".to_string());
        }
        Ok(())
    }

    /// Fold CLI flags over project-file configuration; flags win.
    pub fn to_run_config(&self, project: &ProjectConfig) -> RunConfig {
        let mut config = RunConfig {
            pythonpath: project.pythonpath.clone(),
            fail_fast: self.fail_fast,
            last_failed: self.last_failed,
            failed_first: self.failed_first,
            capture_output: !self.no_capture,
            pattern: self.pattern.clone(),
            ascii_mode: self.ascii,
            ..RunConfig::default()
        };
        if let Some(cache_dir) = &self.cache_dir {
            config.cache_dir = cache_dir.clone();
        }
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_parsing_defaults() {
        let args = Args::parse_from(["presto"]);

        assert!(args.paths.is_empty());
        assert!(!args.fail_fast);
        assert!(!args.last_failed);
        assert!(!args.failed_first);
        assert!(args.pattern.is_none());
        assert!(!args.no_capture);
        assert!(!args.ascii);
        assert!(!args.collect_only);
        assert!(args.cache_dir.is_none());
    }

    #[test]
    fn test_cli_parsing_paths_and_flags() {
        let args = Args::parse_from(["presto", "tests", "-x", "-p", "alpha", "--ascii"]);
        assert_eq!(args.paths, vec![PathBuf::from("tests")]);
        assert!(args.fail_fast);
        assert_eq!(args.pattern.as_deref(), Some("alpha"));
        assert!(args.ascii);
    }

    #[test]
    fn test_cli_parsing_cache_selection() {
        let args = Args::parse_from(["presto", "--lf"]);
        assert!(args.last_failed);
        assert!(args.validate().is_ok());

        let args = Args::parse_from(["presto", "--ff"]);
        assert!(args.failed_first);
        assert!(args.validate().is_ok());

        let args = Args::parse_from(["presto", "--lf", "--ff"]);
        assert!(args.validate().is_err());
    }

    #[test]
    fn test_cli_aliases() {
        let args = Args::parse_from(["presto", "--last-failed"]);
        assert!(args.last_failed);

        let args = Args::parse_from(["presto", "--failed-first"]);
        assert!(args.failed_first);
    }

    #[test]
    fn test_cli_help_generation() {
        let mut cmd = Args::command();
        let help = cmd.render_help();

        assert!(help.to_string().contains("fail-fast"));
        assert!(help.to_string().contains("collect-only"));
    }

    #[test]
    fn test_run_config_mapping() {
        let args = Args::parse_from([
            "presto",
            "-s",
            "-x",
            "--cache-dir",
            "/tmp/altcache",
        ]);
        let config = args.to_run_config(&ProjectConfig {
            pythonpath: vec![PathBuf::from("src")],
        });

        assert!(!config.capture_output);
        assert!(config.fail_fast);
        assert_eq!(config.cache_dir, PathBuf::from("/tmp/altcache"));
        assert_eq!(config.pythonpath, vec![PathBuf::from("src")]);
    }
}
