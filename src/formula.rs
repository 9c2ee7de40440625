//! Formula model - the declarative record describing one package.
//!
//! A formula is a TOML file: metadata, an optional source archive, declared
//! dependencies, an ordered list of build steps, and smoke-test assertions.
//! Formulas are immutable once loaded; the executor never writes back.
//!
//! ```toml
//! name = "erlang"
//! version = "24.2.2"
//!
//! [source]
//! url = "https://github.com/erlang/otp/releases/download/OTP-24.2.2/otp_src_24.2.2.tar.gz"
//! checksum = "sha256:a87bcbdcdd1b99de7038030123b2d655d46d6e698a9143608618bdbec6ebbee7"
//!
//! [[deps]]
//! name = "openssl"
//!
//! [env]
//! unset = ["ERL_LIBS", "ERL_FLAGS", "ERL_AFLAGS", "ERL_ZFLAGS"]
//!
//! [[steps]]
//! phase = "configure"
//! program = "./otp_build"
//! args = ["autoconf"]
//! unless_exists = "configure"
//!
//! [[steps]]
//! phase = "configure"
//! program = "./configure"
//! args = ["--prefix=$PREFIX", "--disable-debug"]
//!
//! [[steps]]
//! phase = "build"
//! program = "make"
//! args = ["-j$NPROC"]
//!
//! [[steps]]
//! phase = "install"
//! program = "make"
//! args = ["install"]
//!
//! [[tests]]
//! program = "bin/erl"
//! args = ["-noshell", "-eval", "io:format(\"~p\", [2#101])", "-s", "init", "stop"]
//! expect = "5"
//! ```

use crate::platform::WhenClause;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FormulaError {
    #[error("cannot read formula {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("invalid formula: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("formula has an empty name")]
    EmptyName,
    #[error("formula '{0}' has an empty version")]
    EmptyVersion(String),
    #[error("formula '{0}' depends on itself")]
    SelfDependency(String),
    #[error("formula '{name}': step {index} ({later:?}) declared after a {earlier:?} step")]
    PhaseOrder {
        name: String,
        index: usize,
        earlier: Phase,
        later: Phase,
    },
    #[error("formula '{name}': step {index} has an empty program")]
    EmptyProgram { name: String, index: usize },
    #[error("formula '{name}': test {index} declares both expect and expect_contains")]
    ConflictingExpectations { name: String, index: usize },
}

/// How a dependency is used.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DepKind {
    /// Needed to build, not recorded in the runtime closure
    Build,
    /// Needed at run time
    #[default]
    Runtime,
    /// Needed only by the smoke tests
    Test,
}

/// A declared dependency: name plus how it is used.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Dependency {
    pub name: String,
    #[serde(default)]
    pub kind: DepKind,
}

/// Where the source comes from and how to check it.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SourceSpec {
    /// http(s) URL, file:// URL, or a local path
    pub url: String,
    /// "sha256:<hex>", "sha512:<hex>", "blake3:<hex>", or bare hex (sha256)
    pub checksum: Option<String>,
    /// Leading path components to strip when unpacking an archive
    #[serde(default)]
    pub strip_components: usize,
}

/// Which lifecycle phase a step belongs to. Steps must be declared in
/// non-decreasing phase order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Configure,
    Build,
    Install,
    Doc,
}

impl Phase {
    pub fn name(&self) -> &'static str {
        match self {
            Phase::Configure => "configure",
            Phase::Build => "build",
            Phase::Install => "install",
            Phase::Doc => "doc",
        }
    }
}

/// One external-process invocation within the install sequence.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StepSpec {
    pub phase: Phase,
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Working directory relative to the source tree
    #[serde(default)]
    pub dir: Option<String>,
    /// Environment overlay applied after the formula-level overrides
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Variables scrubbed for this and all later steps
    #[serde(default)]
    pub unset: Vec<String>,
    /// Skip the step when this path (relative to its working directory)
    /// already exists. Evaluated immediately before the step runs.
    #[serde(default)]
    pub unless_exists: Option<String>,
    /// Run the step only when the platform matches
    #[serde(default)]
    pub when: Option<WhenClause>,
    /// Treat a non-zero exit as a warning instead of aborting
    #[serde(default)]
    pub allow_failure: bool,
}

/// A smoke-test assertion run against the installed prefix.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TestSpec {
    /// Program path relative to the prefix (or absolute)
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Exact expected stdout (surrounding whitespace trimmed)
    #[serde(default)]
    pub expect: Option<String>,
    /// Substring expected somewhere in stdout
    #[serde(default)]
    pub expect_contains: Option<String>,
}

/// Environment hygiene declared by the formula.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EnvPolicy {
    /// Variables removed before any step runs (stale compiler flags and the
    /// like that would corrupt a nested sub-build)
    #[serde(default)]
    pub unset: Vec<String>,
    /// Formula-wide overrides
    #[serde(default)]
    pub set: BTreeMap<String, String>,
    /// Platform-conditional overlays, applied in declaration order
    #[serde(default)]
    pub platform: Vec<PlatformEnv>,
}

/// An environment overlay guarded by a platform predicate.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PlatformEnv {
    pub when: WhenClause,
    pub set: BTreeMap<String, String>,
}

/// A parsed package formula. Immutable after load.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Formula {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub source: Option<SourceSpec>,
    #[serde(default)]
    pub deps: Vec<Dependency>,
    #[serde(default)]
    pub env: EnvPolicy,
    #[serde(default)]
    pub steps: Vec<StepSpec>,
    #[serde(default)]
    pub tests: Vec<TestSpec>,
}

impl Formula {
    /// Load and validate a formula from a TOML file.
    pub fn load(path: &Path) -> Result<Self, FormulaError> {
        let text = std::fs::read_to_string(path).map_err(|source| FormulaError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml(&text)
    }

    /// Parse and validate a formula from TOML text.
    pub fn from_toml(text: &str) -> Result<Self, FormulaError> {
        let formula: Formula = toml::from_str(text)?;
        formula.validate()?;
        Ok(formula)
    }

    fn validate(&self) -> Result<(), FormulaError> {
        if self.name.trim().is_empty() {
            return Err(FormulaError::EmptyName);
        }
        if self.version.trim().is_empty() {
            return Err(FormulaError::EmptyVersion(self.name.clone()));
        }
        if self.deps.iter().any(|d| d.name == self.name) {
            return Err(FormulaError::SelfDependency(self.name.clone()));
        }

        let mut highest = Phase::Configure;
        for (index, step) in self.steps.iter().enumerate() {
            if step.program.trim().is_empty() {
                return Err(FormulaError::EmptyProgram {
                    name: self.name.clone(),
                    index,
                });
            }
            if step.phase < highest {
                return Err(FormulaError::PhaseOrder {
                    name: self.name.clone(),
                    index,
                    earlier: highest,
                    later: step.phase,
                });
            }
            highest = step.phase;
        }

        for (index, test) in self.tests.iter().enumerate() {
            if test.expect.is_some() && test.expect_contains.is_some() {
                return Err(FormulaError::ConflictingExpectations {
                    name: self.name.clone(),
                    index,
                });
            }
        }

        Ok(())
    }

    /// Dependencies needed to run the built package (the runtime closure
    /// recorded in the installation receipt excludes build and test deps).
    pub fn runtime_deps(&self) -> impl Iterator<Item = &Dependency> {
        self.deps.iter().filter(|d| d.kind == DepKind::Runtime)
    }

    /// Dependencies whose prefixes are injected into build environments.
    pub fn build_time_deps(&self) -> impl Iterator<Item = &Dependency> {
        self.deps
            .iter()
            .filter(|d| matches!(d.kind, DepKind::Build | DepKind::Runtime))
    }

    /// Dependencies visible to the smoke tests.
    pub fn test_time_deps(&self) -> impl Iterator<Item = &Dependency> {
        self.deps
            .iter()
            .filter(|d| matches!(d.kind, DepKind::Runtime | DepKind::Test))
    }

    /// All declared dependency names, in declaration order.
    pub fn dep_names(&self) -> Vec<String> {
        self.deps.iter().map(|d| d.name.clone()).collect()
    }
}

/// Load every `*.toml` formula in a directory, keyed by formula name.
pub fn load_dir(dir: &Path) -> Result<std::collections::BTreeMap<String, Formula>, FormulaError> {
    let mut formulas = std::collections::BTreeMap::new();
    let entries = std::fs::read_dir(dir).map_err(|source| FormulaError::Read {
        path: dir.display().to_string(),
        source,
    })?;
    for entry in entries {
        let entry = entry.map_err(|source| FormulaError::Read {
            path: dir.display().to_string(),
            source,
        })?;
        let path = entry.path();
        if path.extension().is_some_and(|e| e == "toml") {
            let formula = Formula::load(&path)?;
            formulas.insert(formula.name.clone(), formula);
        }
    }
    Ok(formulas)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
name = "hello"
version = "1.0"
"#;

    #[test]
    fn test_minimal_formula() {
        let f = Formula::from_toml(MINIMAL).unwrap();
        assert_eq!(f.name, "hello");
        assert_eq!(f.version, "1.0");
        assert!(f.source.is_none());
        assert!(f.steps.is_empty());
    }

    #[test]
    fn test_full_formula_parses() {
        let f = Formula::from_toml(
            r#"
name = "widget"
version = "2.1.0"
description = "A widget"

[source]
url = "https://example.org/widget-2.1.0.tar.gz"
checksum = "sha256:0000000000000000000000000000000000000000000000000000000000000000"

[[deps]]
name = "libfoo"

[[deps]]
name = "cmake"
kind = "build"

[env]
unset = ["WIDGET_FLAGS"]

[env.set]
LANG = "C"

[[env.platform]]
when = { os = "macos" }
set = { MACOSX_DEPLOYMENT_TARGET = "12.0" }

[[steps]]
phase = "configure"
program = "./configure"
args = ["--prefix=$PREFIX"]

[[steps]]
phase = "build"
program = "make"
allow_failure = false

[[steps]]
phase = "install"
program = "make"
args = ["install"]

[[tests]]
program = "bin/widget"
args = ["--version"]
expect_contains = "2.1.0"
"#,
        )
        .unwrap();

        assert_eq!(f.deps.len(), 2);
        assert_eq!(f.deps[1].kind, DepKind::Build);
        assert_eq!(f.runtime_deps().count(), 1);
        assert_eq!(f.steps.len(), 3);
        assert_eq!(f.env.platform.len(), 1);
    }

    #[test]
    fn test_phase_order_enforced() {
        let err = Formula::from_toml(
            r#"
name = "bad"
version = "1.0"

[[steps]]
phase = "install"
program = "true"

[[steps]]
phase = "build"
program = "true"
"#,
        )
        .unwrap_err();
        assert!(matches!(err, FormulaError::PhaseOrder { index: 1, .. }));
    }

    #[test]
    fn test_self_dependency_rejected() {
        let err = Formula::from_toml(
            r#"
name = "ouro"
version = "1.0"

[[deps]]
name = "ouro"
"#,
        )
        .unwrap_err();
        assert!(matches!(err, FormulaError::SelfDependency(_)));
    }

    #[test]
    fn test_conflicting_expectations_rejected() {
        let err = Formula::from_toml(
            r#"
name = "t"
version = "1.0"

[[tests]]
program = "bin/t"
expect = "a"
expect_contains = "b"
"#,
        )
        .unwrap_err();
        assert!(matches!(
            err,
            FormulaError::ConflictingExpectations { .. }
        ));
    }

    #[test]
    fn test_unknown_field_rejected() {
        assert!(Formula::from_toml("name = \"x\"\nversion = \"1\"\nbogus = 3\n").is_err());
    }
}
