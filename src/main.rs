//! CLI binary: argument parsing, a minimal line renderer over the event
//! stream, and exit-code mapping.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;

use presto::cli::{exit_codes, Args};
use presto::config::read_project_config;
use presto::discovery::project_root;
use presto::events::{EventSink, RunEvent};
use presto::model::{Outcome, RunnerError};

/// Plain text renderer: one line per finished test, a failure block per red
/// outcome, and a summary line at the end.
struct LineRenderer {
    ascii: bool,
}

impl LineRenderer {
    fn glyph(&self, outcome: Outcome) -> &'static str {
        if self.ascii {
            match outcome {
                Outcome::Passed => "PASS",
                Outcome::Failed => "FAIL",
                Outcome::Skipped => "SKIP",
                Outcome::Xfailed => "XFAIL",
                Outcome::Xpassed => "XPASS",
                Outcome::Errored => "ERROR",
            }
        } else {
            match outcome {
                Outcome::Passed => "✓",
                Outcome::Failed => "✗",
                Outcome::Skipped => "∅",
                Outcome::Xfailed => "x✓",
                Outcome::Xpassed => "x✗",
                Outcome::Errored => "‼",
            }
        }
    }
}

impl EventSink for LineRenderer {
    fn emit(&mut self, event: &RunEvent) {
        match event {
            RunEvent::RunStarted { total_items, .. } => {
                println!("collected {total_items} test(s)");
            }
            RunEvent::TestStarted { .. } => {}
            RunEvent::TestEnded {
                id,
                outcome,
                duration,
                diagnostic,
                ..
            } => {
                println!("{} {} ({:.3}s)", self.glyph(*outcome), id, duration);
                if outcome.is_red() {
                    if let Some(diagnostic) = diagnostic {
                        println!("  {}: {}", diagnostic.exception, diagnostic.message);
                        for frame in &diagnostic.frames {
                            println!("    {}:{} in {}", frame.path, frame.line, frame.function);
                            if !frame.source.is_empty() {
                                println!("      {}", frame.source);
                            }
                        }
                        if let (Some(expected), Some(received)) =
                            (&diagnostic.expected, &diagnostic.received)
                        {
                            println!("    expected: {expected}");
                            println!("    received: {received}");
                        }
                    }
                }
            }
            RunEvent::Warning { message, .. } => {
                eprintln!("warning: {message}");
            }
            RunEvent::RunEnded { summary } => {
                let mut parts = Vec::new();
                for (count, label) in [
                    (summary.passed, "passed"),
                    (summary.failed, "failed"),
                    (summary.errored, "errored"),
                    (summary.skipped, "skipped"),
                    (summary.xfailed, "xfailed"),
                    (summary.xpassed, "xpassed"),
                ] {
                    if count > 0 {
                        parts.push(format!("{count} {label}"));
                    }
                }
                if parts.is_empty() {
                    parts.push("no tests ran".to_string());
                }
                println!("{} in {:.2}s", parts.join(", "), summary.duration);
            }
        }
    }
}

fn main() -> ExitCode {
    env_logger::init();
    let args = Args::parse();

    if let Err(message) = args.validate() {
        eprintln!("Error: {message}");
        return ExitCode::from(exit_codes::USAGE_ERROR as u8);
    }

    let root_guess = args
        .paths
        .first()
        .cloned()
        .or_else(|| std::env::current_dir().ok())
        .unwrap_or_else(|| PathBuf::from("."));
    let project = read_project_config(&project_root(&root_guess));
    let config = args.to_run_config(&project);

    if args.collect_only {
        return match presto::collect(&args.paths, &config) {
            Ok(ids) => {
                for id in &ids {
                    println!("{id}");
                }
                println!("collected {} test(s)", ids.len());
                ExitCode::from(exit_codes::OK as u8)
            }
            Err(err) => exit_for_error(err),
        };
    }

    let mut renderer = LineRenderer { ascii: args.ascii };
    match presto::run(&args.paths, &config, &mut renderer) {
        Ok(report) => ExitCode::from(report.exit_code() as u8),
        Err(err) => exit_for_error(err),
    }
}

fn exit_for_error(err: RunnerError) -> ExitCode {
    match err {
        RunnerError::PathNotFound(path) => {
            eprintln!("ERROR: file or directory not found: {}", path.display());
            ExitCode::from(exit_codes::USAGE_ERROR as u8)
        }
        err => {
            eprintln!("FATAL: {err}");
            ExitCode::from(exit_codes::TESTS_FAILED as u8)
        }
    }
}
