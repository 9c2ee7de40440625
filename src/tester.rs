//! Test runner - smoke assertions against an installed prefix.
//!
//! Every declared assertion runs even if an earlier one fails; the report
//! aggregates them into one pass/fail. A missing program under the prefix is
//! an installation problem, not an assertion mismatch, and gets its own error
//! kind so failure reports distinguish "nothing was installed" from "it was
//! installed but behaves wrong".

use crate::env::{Environment, Vars, inject_search_paths};
use crate::executor::{CancelToken, run_captured};
use crate::formula::{Formula, TestSpec};
use crate::output;
use crate::resolver::ResolvedDependency;
use std::path::{Path, PathBuf};
use std::process::Command;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TestError {
    #[error("installed binary not found: {program} (installation incomplete?)")]
    InstallationIncomplete { program: String },

    #[error("assertion failed: {command}\n  expected: {expected}\n  actual:   {actual}")]
    Assertion {
        command: String,
        expected: String,
        actual: String,
    },

    #[error("cannot run test {command}: {reason}")]
    Run { command: String, reason: String },
}

/// Outcome of one assertion.
#[derive(Debug)]
pub struct AssertionResult {
    pub command: String,
    pub outcome: Result<(), TestError>,
}

/// Aggregate result of a formula's test suite.
#[derive(Debug)]
pub struct TestReport {
    pub formula: String,
    pub results: Vec<AssertionResult>,
}

impl TestReport {
    /// Overall pass only when every assertion passed.
    pub fn passed(&self) -> bool {
        self.results.iter().all(|r| r.outcome.is_ok())
    }

    pub fn failures(&self) -> impl Iterator<Item = &AssertionResult> {
        self.results.iter().filter(|r| r.outcome.is_err())
    }

    /// First failure, for error propagation.
    pub fn first_failure(&self) -> Option<&TestError> {
        self.failures().next().and_then(|r| r.outcome.as_ref().err())
    }
}

/// Run all of a formula's test assertions against `prefix`. Runtime and
/// test-only dependency prefixes are injected into the search paths and
/// exposed as `$DEP_<NAME>`, like build steps see them.
pub fn run_tests(
    formula: &Formula,
    prefix: &Path,
    deps: &[ResolvedDependency],
    base_env: &Environment,
    cancel: &CancelToken,
) -> TestReport {
    let vars = Vars {
        prefix: prefix.to_path_buf(),
        build_dir: prefix.to_path_buf(),
        nproc: num_cpus::get(),
        arch: std::env::consts::ARCH.to_string(),
        dep_prefixes: deps
            .iter()
            .map(|d| (d.name.clone(), d.prefix.clone()))
            .collect(),
    };

    let mut results = Vec::new();
    for test in &formula.tests {
        let command = command_line(test, &vars);
        let outcome = run_assertion(test, prefix, deps, base_env, &vars, cancel);
        match &outcome {
            Ok(()) => output::detail(&format!("ok: {}", command)),
            Err(e) => output::error(&e.to_string()),
        }
        results.push(AssertionResult { command, outcome });
    }

    TestReport {
        formula: formula.name.clone(),
        results,
    }
}

fn run_assertion(
    test: &TestSpec,
    prefix: &Path,
    deps: &[ResolvedDependency],
    base_env: &Environment,
    vars: &Vars,
    cancel: &CancelToken,
) -> Result<(), TestError> {
    let command = command_line(test, vars);
    let program = resolve_program(test, prefix, vars)?;

    let mut env = base_env.clone();
    inject_search_paths(&mut env, deps);
    let bin = prefix.join("bin");
    let inherited = env.get("PATH").unwrap_or("/usr/bin:/bin").to_string();
    env.set("PATH", format!("{}:{}", bin.display(), inherited));

    let mut cmd = Command::new(&program);
    for arg in &test.args {
        cmd.arg(vars.expand(arg));
    }
    cmd.current_dir(prefix);
    env.apply(&mut cmd);

    let captured = run_captured(cmd, &command, cancel).map_err(|e| TestError::Run {
        command: command.clone(),
        reason: e.to_string(),
    })?;

    let actual = captured.stdout.trim();

    if let Some(expected) = &test.expect {
        let expected = vars.expand(expected);
        if actual != expected.trim() {
            return Err(TestError::Assertion {
                command,
                expected: expected.trim().to_string(),
                actual: actual.to_string(),
            });
        }
        return Ok(());
    }

    if let Some(fragment) = &test.expect_contains {
        let fragment = vars.expand(fragment);
        if !captured.stdout.contains(&fragment) {
            return Err(TestError::Assertion {
                command,
                expected: format!("output containing {:?}", fragment),
                actual: actual.to_string(),
            });
        }
        return Ok(());
    }

    // No declared output: the exit code is the assertion.
    if !captured.success() {
        return Err(TestError::Assertion {
            command,
            expected: "exit code 0".to_string(),
            actual: format!("exit code {:?}\n{}", captured.code, captured.stderr.trim()),
        });
    }

    Ok(())
}

/// Locate the program under the prefix. A relative path that does not exist
/// there means the install left nothing behind.
fn resolve_program(test: &TestSpec, prefix: &Path, vars: &Vars) -> Result<PathBuf, TestError> {
    let program = vars.expand(&test.program);
    let path = if Path::new(&program).is_absolute() {
        PathBuf::from(&program)
    } else {
        prefix.join(&program)
    };
    if !path.is_file() {
        return Err(TestError::InstallationIncomplete {
            program: path.display().to_string(),
        });
    }
    Ok(path)
}

fn command_line(test: &TestSpec, vars: &Vars) -> String {
    let mut parts = vec![vars.expand(&test.program)];
    parts.extend(test.args.iter().map(|a| vars.expand(a)));
    parts.join(" ")
}
