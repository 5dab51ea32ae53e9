//! End-to-end runs over real Python suites on an embedded interpreter.
//!
//! Each test builds its suite in a fresh temp directory, runs the full
//! pipeline, and asserts on the report, the event stream, and the persisted
//! cache.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, OnceLock};

use indoc::indoc;
use tempfile::TempDir;

use presto::events::RunEvent;
use presto::model::Outcome;
use presto::{CollectingSink, RunConfig};

/// Runs share interpreter-global state (stream capture, sys.path); keep
/// them from interleaving across test threads.
fn interpreter_lock() -> MutexGuard<'static, ()> {
    static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    match LOCK.get_or_init(|| Mutex::new(())).lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn write_file(root: &Path, rel: &str, content: &str) {
    let path = root.join(rel);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    fs::write(path, content).unwrap();
}

fn run_dir(dir: &Path, config: &RunConfig) -> (presto::RunReport, Vec<RunEvent>) {
    let _guard = interpreter_lock();
    let mut sink = CollectingSink::default();
    let report = presto::run(&[dir.to_path_buf()], config, &mut sink).unwrap();
    (report, sink.events)
}

fn outcomes(report: &presto::RunReport) -> Vec<(String, Outcome)> {
    report
        .results
        .iter()
        .map(|result| (result.id.clone(), result.outcome))
        .collect()
}

fn ended_ids(events: &[RunEvent]) -> Vec<String> {
    events
        .iter()
        .filter_map(|event| match event {
            RunEvent::TestEnded { id, .. } => Some(id.clone()),
            _ => None,
        })
        .collect()
}

fn started_ids(events: &[RunEvent]) -> Vec<String> {
    events
        .iter()
        .filter_map(|event| match event {
            RunEvent::TestStarted { id, .. } => Some(id.clone()),
            _ => None,
        })
        .collect()
}

fn read_log(path: &Path) -> Vec<String> {
    fs::read_to_string(path)
        .unwrap_or_default()
        .lines()
        .map(str::to_string)
        .collect()
}

#[test]
fn two_files_run_in_lexicographic_order_and_record_the_cache() {
    let dir = TempDir::new().unwrap();
    write_file(
        dir.path(),
        "test_alpha.py",
        indoc! {r#"
            def test_a():
                assert 1 + 1 == 2
        "#},
    );
    write_file(
        dir.path(),
        "test_beta.py",
        indoc! {r#"
            def test_b():
                assert 42 == 100
        "#},
    );

    let (report, events) = run_dir(dir.path(), &RunConfig::default());

    assert_eq!(
        outcomes(&report),
        vec![
            ("test_alpha.py::test_a".to_string(), Outcome::Passed),
            ("test_beta.py::test_b".to_string(), Outcome::Failed),
        ]
    );
    assert_eq!(report.summary.total, 2);
    assert_eq!(report.summary.passed, 1);
    assert_eq!(report.summary.failed, 1);
    assert_eq!(report.exit_code(), 1);

    // The failure diagnostic carries the compared values.
    let failure = &report.results[1];
    let diagnostic = failure.diagnostic.as_ref().unwrap();
    assert_eq!(diagnostic.exception, "AssertionError");
    assert_eq!(diagnostic.expected.as_deref(), Some("100"));
    assert_eq!(diagnostic.received.as_deref(), Some("42"));
    assert!(!diagnostic.frames.is_empty());

    // Start/end events pair up in plan order.
    assert_eq!(
        started_ids(&events),
        vec!["test_alpha.py::test_a", "test_beta.py::test_b"]
    );
    assert_eq!(started_ids(&events), ended_ids(&events));

    // The cache recorded the failure.
    let cache_dir = dir.path().join(".presto_cache");
    let cached = presto::cache::read_outcomes(&cache_dir).unwrap();
    assert_eq!(cached["test_beta.py::test_b"], Outcome::Failed);
    assert_eq!(cached["test_alpha.py::test_a"], Outcome::Passed);
}

#[test]
fn parametric_fixture_multiplies_dependent_tests() {
    let dir = TempDir::new().unwrap();
    let log = dir.path().join("fixture_calls.log");
    let source = indoc! {r#"
        import presto

        LOG = r"@LOG@"

        @presto.fixture(params=[1, 2, 3])
        def n(request):
            with open(LOG, "a") as fh:
                fh.write(f"{request.param}\n")
            return request.param

        def test_k(n):
            assert n > 0
    "#}
    .replace("@LOG@", &log.display().to_string());
    write_file(dir.path(), "test_params.py", &source);

    let (report, _) = run_dir(dir.path(), &RunConfig::default());

    assert_eq!(
        outcomes(&report),
        vec![
            ("test_params.py::test_k[1]".to_string(), Outcome::Passed),
            ("test_params.py::test_k[2]".to_string(), Outcome::Passed),
            ("test_params.py::test_k[3]".to_string(), Outcome::Passed),
        ]
    );
    assert_eq!(read_log(&log), vec!["1", "2", "3"]);
}

#[test]
fn async_batch_shares_wall_clock_and_session_fixture() {
    let dir = TempDir::new().unwrap();
    let log = dir.path().join("db_calls.log");
    let source = indoc! {r#"
        import asyncio
        import presto

        LOG = r"@LOG@"

        @presto.fixture(scope="session")
        def db():
            with open(LOG, "a") as fh:
                fh.write("db\n")
            return {"connected": True}

        async def test_q1(db):
            await asyncio.sleep(0.2)
            assert db["connected"]

        async def test_q2(db):
            await asyncio.sleep(0.2)
            assert db["connected"]

        async def test_q3(db):
            await asyncio.sleep(0.2)
            assert db["connected"]
    "#}
    .replace("@LOG@", &log.display().to_string());
    write_file(dir.path(), "test_async.py", &source);

    let (report, events) = run_dir(dir.path(), &RunConfig::default());
    let elapsed = report.summary.duration;

    assert_eq!(report.summary.total, 3);
    assert_eq!(report.summary.passed, 3);
    // Concurrent, not sequential: three 200ms sleeps share one loop.
    assert!(
        elapsed < 0.45,
        "batch took {elapsed:.3}s, expected concurrent execution"
    );
    // The session fixture was built exactly once.
    assert_eq!(read_log(&log), vec!["db"]);

    // All starts precede any end inside the batch.
    let first_end = events
        .iter()
        .position(|event| matches!(event, RunEvent::TestEnded { .. }))
        .unwrap();
    assert_eq!(started_ids(&events[..first_end]).len(), 3);
}

#[test]
fn batch_end_events_follow_plan_order_not_completion_order() {
    let dir = TempDir::new().unwrap();
    write_file(
        dir.path(),
        "test_order.py",
        indoc! {r#"
            import asyncio

            async def test_slow():
                await asyncio.sleep(0.3)

            async def test_fast():
                await asyncio.sleep(0.05)
        "#},
    );

    let (report, events) = run_dir(dir.path(), &RunConfig::default());

    assert_eq!(report.summary.passed, 2);
    assert_eq!(
        ended_ids(&events),
        vec!["test_order.py::test_slow", "test_order.py::test_fast"]
    );
}

#[test]
fn batch_members_keep_isolated_output() {
    let dir = TempDir::new().unwrap();
    write_file(
        dir.path(),
        "test_capture.py",
        indoc! {r#"
            import asyncio

            async def test_one():
                print("from one")
                await asyncio.sleep(0.05)
                print("one again")

            async def test_two():
                print("from two")
                await asyncio.sleep(0.05)
        "#},
    );

    let (report, _) = run_dir(dir.path(), &RunConfig::default());

    assert_eq!(report.summary.passed, 2);
    let one = &report.results[0];
    let two = &report.results[1];
    assert_eq!(one.stdout.as_deref(), Some("from one\none again\n"));
    assert_eq!(two.stdout.as_deref(), Some("from two\n"));
}

#[test]
fn yield_fixture_interleaves_setup_and_teardown_per_test() {
    let dir = TempDir::new().unwrap();
    let log = dir.path().join("tmp.log");
    let source = indoc! {r#"
        import presto

        LOG = r"@LOG@"
        count = 0

        @presto.fixture
        def tmp():
            global count
            count += 1
            me = count
            with open(LOG, "a") as fh:
                fh.write(f"setup{me}\n")
            yield me
            with open(LOG, "a") as fh:
                fh.write(f"teardown{me}\n")

        def test_first(tmp):
            assert tmp == 1

        def test_second(tmp):
            assert tmp == 2

        def test_third(tmp):
            assert tmp == 3
    "#}
    .replace("@LOG@", &log.display().to_string());
    write_file(dir.path(), "test_yield.py", &source);

    let (report, _) = run_dir(dir.path(), &RunConfig::default());

    assert_eq!(report.summary.passed, 3);
    assert_eq!(
        read_log(&log),
        vec![
            "setup1",
            "teardown1",
            "setup2",
            "teardown2",
            "setup3",
            "teardown3",
        ]
    );
}

#[test]
fn module_scope_fixture_is_shared_within_a_file_and_rebuilt_across_files() {
    let dir = TempDir::new().unwrap();
    let log = dir.path().join("module_res.log");
    for name in ["test_m1.py", "test_m2.py"] {
        let source = indoc! {r#"
            import presto

            LOG = r"@LOG@"

            @presto.fixture(scope="module")
            def res():
                with open(LOG, "a") as fh:
                    fh.write("build\n")
                return object()

            def test_a(res):
                assert res is not None

            def test_b(res):
                assert res is not None
        "#}
        .replace("@LOG@", &log.display().to_string());
        write_file(dir.path(), name, &source);
    }

    let (report, _) = run_dir(dir.path(), &RunConfig::default());

    assert_eq!(report.summary.passed, 4);
    // Once per module instance, not once per test.
    assert_eq!(read_log(&log).len(), 2);
}

#[test]
fn fail_fast_stops_issuing_after_the_first_failure() {
    let dir = TempDir::new().unwrap();
    write_file(
        dir.path(),
        "test_failfast.py",
        indoc! {r#"
            def test_a_passes():
                assert True

            def test_b_fails():
                assert False

            def test_c_never_runs():
                assert True
        "#},
    );

    let config = RunConfig {
        fail_fast: true,
        ..RunConfig::default()
    };
    let (report, events) = run_dir(dir.path(), &config);

    assert_eq!(
        outcomes(&report),
        vec![
            (
                "test_failfast.py::test_a_passes".to_string(),
                Outcome::Passed
            ),
            (
                "test_failfast.py::test_b_fails".to_string(),
                Outcome::Failed
            ),
        ]
    );
    assert_eq!(report.exit_code(), 1);
    assert!(!started_ids(&events)
        .iter()
        .any(|id| id.contains("test_c_never_runs")));
}

#[test]
fn last_failed_reruns_only_red_items_then_empties() {
    let dir = TempDir::new().unwrap();
    let flag = dir.path().join("fixed.flag");
    let source = indoc! {r#"
        import os

        FLAG = r"@FLAG@"

        def test_a():
            assert True

        def test_b():
            assert os.path.exists(FLAG)
    "#}
    .replace("@FLAG@", &flag.display().to_string());
    write_file(dir.path(), "test_lf.py", &source);

    // First run: test_b is red.
    let (report, _) = run_dir(dir.path(), &RunConfig::default());
    assert_eq!(report.summary.failed, 1);

    // Second run with --lf: only test_b, which now passes.
    fs::write(&flag, "").unwrap();
    let config = RunConfig {
        last_failed: true,
        ..RunConfig::default()
    };
    let (report, _) = run_dir(dir.path(), &config);
    assert_eq!(
        outcomes(&report),
        vec![("test_lf.py::test_b".to_string(), Outcome::Passed)]
    );

    // The cache kept test_a's record and cleared test_b's failure.
    let cached = presto::cache::read_outcomes(&dir.path().join(".presto_cache")).unwrap();
    assert_eq!(cached["test_lf.py::test_a"], Outcome::Passed);
    assert_eq!(cached["test_lf.py::test_b"], Outcome::Passed);

    // Third run with --lf: nothing left to rerun.
    let (report, events) = run_dir(dir.path(), &config);
    assert_eq!(report.summary.total, 0);
    assert_eq!(report.exit_code(), 0);
    assert!(matches!(
        events[0],
        RunEvent::RunStarted { total_items: 0, .. }
    ));
}

#[test]
fn failed_first_moves_red_items_to_the_front() {
    let dir = TempDir::new().unwrap();
    write_file(
        dir.path(),
        "test_ff.py",
        indoc! {r#"
            def test_a():
                assert True

            def test_b():
                assert False

            def test_c():
                assert True
        "#},
    );

    let (report, _) = run_dir(dir.path(), &RunConfig::default());
    assert_eq!(report.summary.failed, 1);

    let config = RunConfig {
        failed_first: true,
        ..RunConfig::default()
    };
    let (report, _) = run_dir(dir.path(), &config);
    let ids: Vec<String> = report.results.iter().map(|r| r.id.clone()).collect();
    assert_eq!(
        ids,
        vec![
            "test_ff.py::test_b",
            "test_ff.py::test_a",
            "test_ff.py::test_c"
        ]
    );
}

#[test]
fn conftest_chain_resolves_innermost_and_applies_autouse() {
    let dir = TempDir::new().unwrap();
    let log = dir.path().join("autouse.log");
    let root_conftest = indoc! {r#"
        import presto

        LOG = r"@LOG@"

        @presto.fixture
        def greeting():
            return "outer"

        @presto.fixture(autouse=True)
        def touch():
            with open(LOG, "a") as fh:
                fh.write("autouse\n")
    "#}
    .replace("@LOG@", &log.display().to_string());
    write_file(dir.path(), "conftest.py", &root_conftest);
    write_file(
        dir.path(),
        "sub/conftest.py",
        indoc! {r#"
            import presto

            @presto.fixture
            def greeting():
                return "inner"
        "#},
    );
    write_file(
        dir.path(),
        "test_outer.py",
        indoc! {r#"
            def test_greeting(greeting):
                assert greeting == "outer"
        "#},
    );
    write_file(
        dir.path(),
        "sub/test_inner.py",
        indoc! {r#"
            def test_greeting(greeting):
                assert greeting == "inner"
        "#},
    );

    let (report, _) = run_dir(dir.path(), &RunConfig::default());

    assert_eq!(report.summary.passed, 2);
    // The autouse fixture reached both tests.
    assert_eq!(read_log(&log).len(), 2);
}

#[test]
fn cyclic_fixtures_error_one_item_without_stopping_the_file() {
    let dir = TempDir::new().unwrap();
    write_file(
        dir.path(),
        "test_cycle.py",
        indoc! {r#"
            import presto

            @presto.fixture
            def a(b):
                return 1

            @presto.fixture
            def b(a):
                return 2

            def test_cyclic(a):
                pass

            def test_fine():
                assert True
        "#},
    );

    let (report, _) = run_dir(dir.path(), &RunConfig::default());

    assert_eq!(
        outcomes(&report),
        vec![
            ("test_cycle.py::test_cyclic".to_string(), Outcome::Errored),
            ("test_cycle.py::test_fine".to_string(), Outcome::Passed),
        ]
    );
    let diagnostic = report.results[0].diagnostic.as_ref().unwrap();
    assert!(diagnostic.message.contains("cyclic fixture dependency"));
    assert_eq!(report.exit_code(), 1);
}

#[test]
fn missing_fixture_errors_with_a_suggestion() {
    let dir = TempDir::new().unwrap();
    write_file(
        dir.path(),
        "test_missing.py",
        indoc! {r#"
            import presto

            @presto.fixture
            def database():
                return 1

            def test_needs(databse):
                pass
        "#},
    );

    let (report, _) = run_dir(dir.path(), &RunConfig::default());

    assert_eq!(report.summary.errored, 1);
    let diagnostic = report.results[0].diagnostic.as_ref().unwrap();
    assert!(diagnostic.message.contains("fixture 'databse' not found"));
    assert!(diagnostic.message.contains("did you mean 'database'"));
}

#[test]
fn skip_xfail_and_runtime_sentinels_classify_correctly() {
    let dir = TempDir::new().unwrap();
    write_file(
        dir.path(),
        "test_marks.py",
        indoc! {r#"
            import presto

            @presto.mark.skip(reason="not today")
            def test_skipped():
                assert False

            @presto.mark.skipif(True, reason="always")
            def test_skipped_cond():
                assert False

            @presto.mark.skipif("1 == 2")
            def test_condition_false_runs():
                assert True

            @presto.mark.xfail
            def test_expected_failure():
                raise ValueError("known breakage")

            @presto.mark.xfail
            def test_unexpected_pass():
                assert True

            def test_runtime_skip():
                presto.skip("later")
        "#},
    );

    let (report, _) = run_dir(dir.path(), &RunConfig::default());

    assert_eq!(
        outcomes(&report),
        vec![
            ("test_marks.py::test_skipped".to_string(), Outcome::Skipped),
            (
                "test_marks.py::test_skipped_cond".to_string(),
                Outcome::Skipped
            ),
            (
                "test_marks.py::test_condition_false_runs".to_string(),
                Outcome::Passed
            ),
            (
                "test_marks.py::test_expected_failure".to_string(),
                Outcome::Xfailed
            ),
            (
                "test_marks.py::test_unexpected_pass".to_string(),
                Outcome::Xpassed
            ),
            (
                "test_marks.py::test_runtime_skip".to_string(),
                Outcome::Skipped
            ),
        ]
    );
    // Neither skips nor expected failures make the run red.
    assert_eq!(report.exit_code(), 0);
}

#[test]
fn xfail_raises_matches_the_declared_exception_only() {
    let dir = TempDir::new().unwrap();
    write_file(
        dir.path(),
        "test_raises.py",
        indoc! {r#"
            import presto

            @presto.mark.xfail(raises=KeyError)
            def test_expected():
                raise KeyError("k")

            @presto.mark.xfail(raises=KeyError)
            def test_unexpected():
                raise ValueError("v")
        "#},
    );

    let (report, _) = run_dir(dir.path(), &RunConfig::default());

    assert_eq!(
        outcomes(&report),
        vec![
            ("test_raises.py::test_expected".to_string(), Outcome::Xfailed),
            ("test_raises.py::test_unexpected".to_string(), Outcome::Failed),
        ]
    );
}

#[test]
fn parametrize_expands_tuples_stacked_marks_and_classes() {
    let dir = TempDir::new().unwrap();
    write_file(
        dir.path(),
        "test_parametrize.py",
        indoc! {r#"
            import presto

            @presto.mark.parametrize("a,b", [(1, 2), (2, 3)])
            def test_sum(a, b):
                assert b == a + 1

            @presto.mark.parametrize("x", [1, 2])
            @presto.mark.parametrize("y", ["p", "q"])
            def test_product(x, y):
                assert isinstance(y, str) and x > 0

            @presto.mark.parametrize("v", [1, 2])
            class TestThings:
                def test_v(self, v):
                    assert v in (1, 2)
        "#},
    );

    let (report, _) = run_dir(dir.path(), &RunConfig::default());

    let ids: Vec<String> = report.results.iter().map(|r| r.id.clone()).collect();
    assert!(ids.contains(&"test_parametrize.py::test_sum[1-2]".to_string()));
    assert!(ids.contains(&"test_parametrize.py::test_sum[2-3]".to_string()));
    let product_count = ids.iter().filter(|id| id.contains("test_product[")).count();
    assert_eq!(product_count, 4);
    assert!(ids.contains(&"test_parametrize.py::TestThings::test_v[1]".to_string()));
    assert!(ids.contains(&"test_parametrize.py::TestThings::test_v[2]".to_string()));
    assert_eq!(report.summary.total, 8);
    assert_eq!(report.summary.passed, 8);
}

#[test]
fn a_broken_file_errors_without_aborting_the_run() {
    let dir = TempDir::new().unwrap();
    write_file(
        dir.path(),
        "test_bad.py",
        indoc! {r#"
            def test_broken(:
                pass
        "#},
    );
    write_file(
        dir.path(),
        "test_good.py",
        indoc! {r#"
            def test_ok():
                assert True
        "#},
    );

    let (report, events) = run_dir(dir.path(), &RunConfig::default());

    assert_eq!(report.summary.total, 2);
    assert_eq!(report.summary.errored, 1);
    assert_eq!(report.summary.passed, 1);
    assert_eq!(report.exit_code(), 1);
    assert_eq!(started_ids(&events).len(), ended_ids(&events).len());
}

#[test]
fn a_broken_conftest_errors_every_descendant_item() {
    let dir = TempDir::new().unwrap();
    write_file(
        dir.path(),
        "sub/conftest.py",
        indoc! {r#"
            raise RuntimeError("bad configuration")
        "#},
    );
    write_file(
        dir.path(),
        "sub/test_under.py",
        indoc! {r#"
            def test_anything():
                assert True
        "#},
    );

    let (report, _) = run_dir(dir.path(), &RunConfig::default());

    assert_eq!(report.summary.errored, 1);
    let diagnostic = report.results[0].diagnostic.as_ref().unwrap();
    assert!(diagnostic
        .message
        .contains("ancestor configuration failed to load"));
}

#[test]
fn captured_output_is_attached_per_item() {
    let dir = TempDir::new().unwrap();
    write_file(
        dir.path(),
        "test_noise.py",
        indoc! {r#"
            import sys

            def test_noisy():
                print("hello out")
                print("hello err", file=sys.stderr)

            def test_quiet():
                pass
        "#},
    );

    let (report, _) = run_dir(dir.path(), &RunConfig::default());

    let noisy = &report.results[0];
    assert_eq!(noisy.stdout.as_deref(), Some("hello out\n"));
    assert_eq!(noisy.stderr.as_deref(), Some("hello err\n"));
    let quiet = &report.results[1];
    assert!(quiet.stdout.is_none());
    assert!(quiet.stderr.is_none());

    // Without capture nothing is recorded.
    let config = RunConfig {
        capture_output: false,
        ..RunConfig::default()
    };
    let (report, _) = run_dir(dir.path(), &config);
    assert!(report.results[0].stdout.is_none());
}

#[test]
fn session_scoped_async_fixture_forces_the_sequential_path() {
    let dir = TempDir::new().unwrap();
    write_file(
        dir.path(),
        "test_broad.py",
        indoc! {r#"
            import asyncio
            import presto

            @presto.fixture(scope="session")
            async def conn():
                await asyncio.sleep(0)
                return 42

            async def test_one(conn):
                await asyncio.sleep(0.01)
                assert conn == 42

            async def test_two(conn):
                assert conn == 42
        "#},
    );

    let (report, events) = run_dir(dir.path(), &RunConfig::default());

    assert_eq!(report.summary.passed, 2);
    // Sequential path: each start is immediately followed by its own end.
    let sequence: Vec<&str> = events
        .iter()
        .filter_map(|event| match event {
            RunEvent::TestStarted { id, .. } => Some(id.as_str()),
            RunEvent::TestEnded { id, .. } => Some(id.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(
        sequence,
        vec![
            "test_broad.py::test_one",
            "test_broad.py::test_one",
            "test_broad.py::test_two",
            "test_broad.py::test_two",
        ]
    );
}

#[test]
fn usefixtures_materializes_without_injection() {
    let dir = TempDir::new().unwrap();
    let log = dir.path().join("used.log");
    let source = indoc! {r#"
        import presto

        LOG = r"@LOG@"

        @presto.fixture
        def marker():
            with open(LOG, "a") as fh:
                fh.write("used\n")
            return "x"

        @presto.mark.usefixtures("marker")
        def test_marked():
            assert True
    "#}
    .replace("@LOG@", &log.display().to_string());
    write_file(dir.path(), "test_use.py", &source);

    let (report, _) = run_dir(dir.path(), &RunConfig::default());

    assert_eq!(report.summary.passed, 1);
    assert_eq!(read_log(&log), vec!["used"]);
}

#[test]
fn pattern_filters_the_plan_by_substring() {
    let dir = TempDir::new().unwrap();
    write_file(
        dir.path(),
        "test_filter.py",
        indoc! {r#"
            def test_alpha():
                assert True

            def test_beta():
                assert True
        "#},
    );

    let config = RunConfig {
        pattern: Some("alpha".into()),
        ..RunConfig::default()
    };
    let (report, _) = run_dir(dir.path(), &config);

    assert_eq!(
        outcomes(&report),
        vec![("test_filter.py::test_alpha".to_string(), Outcome::Passed)]
    );
}

#[test]
fn finalizer_failure_warns_but_keeps_the_outcome() {
    let dir = TempDir::new().unwrap();
    write_file(
        dir.path(),
        "test_teardown.py",
        indoc! {r#"
            import presto

            @presto.fixture
            def cranky():
                yield 1
                raise RuntimeError("teardown exploded")

            def test_uses_cranky(cranky):
                assert cranky == 1
        "#},
    );

    let (report, events) = run_dir(dir.path(), &RunConfig::default());

    assert_eq!(
        outcomes(&report),
        vec![(
            "test_teardown.py::test_uses_cranky".to_string(),
            Outcome::Passed
        )]
    );
    assert_eq!(report.exit_code(), 0);
    assert!(events.iter().any(|event| matches!(
        event,
        RunEvent::Warning { message, .. } if message.contains("cranky")
    )));
}

#[test]
fn empty_directory_runs_green() {
    let dir = TempDir::new().unwrap();
    let (report, events) = run_dir(dir.path(), &RunConfig::default());

    assert_eq!(report.summary.total, 0);
    assert_eq!(report.exit_code(), 0);
    assert!(matches!(
        events[0],
        RunEvent::RunStarted { total_items: 0, .. }
    ));
    assert!(matches!(events.last().unwrap(), RunEvent::RunEnded { .. }));
}

#[test]
fn collect_lists_ids_from_the_static_suite_without_running() {
    let _guard = interpreter_lock();
    let suite = Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("python_suite");
    let ids = presto::collect(&[suite.clone()], &RunConfig::default()).unwrap();

    assert_eq!(
        ids,
        vec![
            "test_basic.py::test_addition",
            "test_basic.py::test_subtraction",
            "test_fixtures.py::test_uses_value",
        ]
    );
    // Collection must not create a cache directory in the suite.
    assert!(!suite.join(".presto_cache").exists());
}

#[test]
fn identical_invocations_produce_identical_plans() {
    let dir = TempDir::new().unwrap();
    write_file(
        dir.path(),
        "test_stable.py",
        indoc! {r#"
            import presto

            @presto.mark.parametrize("v", [3, 1, 2])
            def test_values(v):
                assert v > 0

            def test_plain():
                assert True
        "#},
    );

    let _guard = interpreter_lock();
    let config = RunConfig::default();
    let first = presto::collect(&[dir.path().to_path_buf()], &config).unwrap();
    let second = presto::collect(&[dir.path().to_path_buf()], &config).unwrap();
    assert_eq!(first, second);
}

#[test]
fn missing_input_path_is_a_usage_error() {
    let _guard = interpreter_lock();
    let missing = PathBuf::from("/definitely/not/here");
    let mut sink = CollectingSink::default();
    let err = presto::run(&[missing], &RunConfig::default(), &mut sink).unwrap_err();
    assert!(matches!(err, presto::RunnerError::PathNotFound(_)));
}
