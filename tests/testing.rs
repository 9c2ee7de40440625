//! Smoke-test behavior: tests gate publication and can be replayed against an
//! installed prefix.

use malt::formula;
use malt::{Cellar, InstallOptions, InstallationRecord, Orchestrator};
use std::path::{Path, PathBuf};
use tempfile::TempDir;

fn create_test_env() -> (TempDir, PathBuf, PathBuf, PathBuf) {
    let dir = TempDir::new().unwrap();
    let formulas_dir = dir.path().join("formulas");
    let cellar_root = dir.path().join("cellar");
    let build_root = dir.path().join("build");
    std::fs::create_dir_all(&formulas_dir).unwrap();
    (dir, formulas_dir, cellar_root, build_root)
}

fn write_formula(formulas_dir: &Path, name: &str, content: &str) {
    std::fs::write(formulas_dir.join(format!("{}.toml", name)), content).unwrap();
}

fn orchestrator(formulas_dir: &Path, cellar_root: &Path, build_root: &Path) -> Orchestrator {
    let formulas = formula::load_dir(formulas_dir).unwrap();
    Orchestrator::new(
        formulas,
        Cellar::new(cellar_root),
        build_root,
        build_root.join("cache"),
    )
    .with_options(InstallOptions {
        jobs: 1,
        ..Default::default()
    })
}

/// A formula whose installed program echoes a fixed string.
const ECHOER: &str = r#"
name = "echoer"
version = "1.0.0"

[[steps]]
phase = "install"
program = "sh"
args = ["-c", "mkdir -p $PREFIX/bin && printf '#!/bin/sh\necho genuine output\n' > $PREFIX/bin/echoer && chmod +x $PREFIX/bin/echoer"]

[[tests]]
program = "bin/echoer"
expect = "genuine output"
"#;

// =============================================================================
// Tests Gate Publication
// =============================================================================

#[test]
fn passing_smoke_test_allows_publish() {
    let (_dir, formulas_dir, cellar_root, build_root) = create_test_env();
    write_formula(&formulas_dir, "echoer", ECHOER);

    orchestrator(&formulas_dir, &cellar_root, &build_root)
        .install(&["echoer".to_string()])
        .unwrap();

    assert!(cellar_root.join("echoer/1.0.0/bin/echoer").is_file());
}

#[test]
fn failing_expectation_blocks_publish() {
    let (_dir, formulas_dir, cellar_root, build_root) = create_test_env();

    write_formula(
        &formulas_dir,
        "liar",
        r#"
name = "liar"
version = "1.0.0"

[[steps]]
phase = "install"
program = "sh"
args = ["-c", "mkdir -p $PREFIX/bin && printf '#!/bin/sh\necho wrong\n' > $PREFIX/bin/liar && chmod +x $PREFIX/bin/liar"]

[[tests]]
program = "bin/liar"
expect = "right"
"#,
    );

    let result = orchestrator(&formulas_dir, &cellar_root, &build_root)
        .install(&["liar".to_string()]);
    assert!(result.is_err());
    assert!(!cellar_root.join("liar").exists(), "failed tests must not publish");
}

#[test]
fn missing_test_program_blocks_publish() {
    let (_dir, formulas_dir, cellar_root, build_root) = create_test_env();

    write_formula(
        &formulas_dir,
        "hollow",
        r#"
name = "hollow"
version = "1.0.0"

[[steps]]
phase = "install"
program = "sh"
args = ["-c", "mkdir -p $PREFIX"]

[[tests]]
program = "bin/hollow"
"#,
    );

    let result = orchestrator(&formulas_dir, &cellar_root, &build_root)
        .install(&["hollow".to_string()]);
    assert!(result.is_err(), "test program absent from the prefix");
    assert!(!cellar_root.join("hollow").exists());
}

#[test]
fn skip_tests_publishes_despite_failing_tests() {
    let (_dir, formulas_dir, cellar_root, build_root) = create_test_env();

    write_formula(
        &formulas_dir,
        "liar",
        r#"
name = "liar"
version = "1.0.0"

[[steps]]
phase = "install"
program = "sh"
args = ["-c", "mkdir -p $PREFIX/bin && printf '#!/bin/sh\necho wrong\n' > $PREFIX/bin/liar && chmod +x $PREFIX/bin/liar"]

[[tests]]
program = "bin/liar"
expect = "right"
"#,
    );

    let formulas = formula::load_dir(&formulas_dir).unwrap();
    Orchestrator::new(
        formulas,
        Cellar::new(&cellar_root),
        &build_root,
        build_root.join("cache"),
    )
    .with_options(InstallOptions {
        jobs: 1,
        skip_tests: true,
        ..Default::default()
    })
    .install(&["liar".to_string()])
    .unwrap();

    assert!(cellar_root.join("liar/1.0.0/bin/liar").is_file());
}

#[test]
fn test_only_dependency_is_visible_to_smoke_tests() {
    let (_dir, formulas_dir, cellar_root, build_root) = create_test_env();

    write_formula(
        &formulas_dir,
        "testtool",
        r#"
name = "testtool"
version = "1.0.0"

[[steps]]
phase = "install"
program = "sh"
args = ["-c", "mkdir -p $PREFIX/bin && printf '#!/bin/sh\necho ok\n' > $PREFIX/bin/testtool && chmod +x $PREFIX/bin/testtool"]
"#,
    );
    // app-check finds testtool through the injected dependency PATH
    write_formula(
        &formulas_dir,
        "app",
        r#"
name = "app"
version = "1.0.0"

[[deps]]
name = "testtool"
kind = "test"

[[steps]]
phase = "install"
program = "sh"
args = ["-c", "mkdir -p $PREFIX/bin && printf '#!/bin/sh\ntesttool\n' > $PREFIX/bin/app-check && chmod +x $PREFIX/bin/app-check"]

[[tests]]
program = "bin/app-check"
expect = "ok"
"#,
    );

    orchestrator(&formulas_dir, &cellar_root, &build_root)
        .install(&["app".to_string()])
        .unwrap();

    assert!(cellar_root.join("app/1.0.0/bin/app-check").is_file());
    // a test-only dependency stays out of the runtime closure
    let record = InstallationRecord::read(&cellar_root.join("app/1.0.0")).unwrap();
    assert!(record.runtime_deps.is_empty());
}

// =============================================================================
// Replaying Tests Against an Installed Prefix
// =============================================================================

#[test]
fn test_command_runs_against_installed_prefix() {
    let (_dir, formulas_dir, cellar_root, build_root) = create_test_env();
    write_formula(&formulas_dir, "echoer", ECHOER);

    let orch = orchestrator(&formulas_dir, &cellar_root, &build_root);
    orch.install(&["echoer".to_string()]).unwrap();
    orch.test("echoer").unwrap();
}

#[test]
fn test_command_fails_for_uninstalled_formula() {
    let (_dir, formulas_dir, cellar_root, build_root) = create_test_env();
    write_formula(&formulas_dir, "echoer", ECHOER);

    let result = orchestrator(&formulas_dir, &cellar_root, &build_root).test("echoer");
    assert!(result.is_err());
}

#[test]
fn expect_contains_matches_substring() {
    let (_dir, formulas_dir, cellar_root, build_root) = create_test_env();

    write_formula(
        &formulas_dir,
        "verbose",
        r#"
name = "verbose"
version = "1.0.0"

[[steps]]
phase = "install"
program = "sh"
args = ["-c", "mkdir -p $PREFIX/bin && printf '#!/bin/sh\necho \"tool 1.0.0 (release build)\"\n' > $PREFIX/bin/verbose && chmod +x $PREFIX/bin/verbose"]

[[tests]]
program = "bin/verbose"
expect_contains = "1.0.0"
"#,
    );

    orchestrator(&formulas_dir, &cellar_root, &build_root)
        .install(&["verbose".to_string()])
        .unwrap();
    assert!(cellar_root.join("verbose/1.0.0").is_dir());
}
