//! Per-step build environment construction.
//!
//! Every step gets an explicit [`Environment`] value built from scratch:
//! ambient variables, minus everything the formula scrubs, plus dependency
//! search paths, plus declared overrides. Nothing is ever written to the
//! orchestrator's own process environment. Backed by a `BTreeMap`, so
//! identical inputs always produce byte-identical output.

use crate::formula::{Formula, StepSpec};
use crate::platform::Platform;
use crate::resolver::ResolvedDependency;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

/// Search-path variables that dependency prefixes are injected into,
/// paired with the prefix subdirectory each one receives.
const SEARCH_PATHS: &[(&str, &str)] = &[
    ("PATH", "bin"),
    ("CPATH", "include"),
    ("LIBRARY_PATH", "lib"),
    ("PKG_CONFIG_PATH", "lib/pkgconfig"),
];

/// An ordered, deterministic environment mapping.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Environment(BTreeMap<String, String>);

impl Environment {
    pub fn new() -> Self {
        Self::default()
    }

    /// Capture the ambient process environment.
    pub fn ambient() -> Self {
        Self(std::env::vars().collect())
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn remove(&mut self, key: &str) {
        self.0.remove(key);
    }

    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Apply to a command, replacing its inherited environment entirely.
    pub fn apply(&self, cmd: &mut std::process::Command) {
        cmd.env_clear();
        cmd.envs(&self.0);
    }
}

impl FromIterator<(String, String)> for Environment {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Variables substituted into step arguments, directories, and env values.
#[derive(Debug, Clone)]
pub struct Vars {
    pub prefix: PathBuf,
    pub build_dir: PathBuf,
    pub nproc: usize,
    pub arch: String,
    /// Resolved dependency prefixes, exposed as `$DEP_<NAME>`
    pub dep_prefixes: Vec<(String, PathBuf)>,
}

impl Vars {
    pub fn new(prefix: PathBuf, build_dir: PathBuf, platform: &Platform) -> Self {
        Self {
            prefix,
            build_dir,
            nproc: num_cpus::get(),
            arch: platform.arch.clone(),
            dep_prefixes: Vec::new(),
        }
    }

    pub fn with_deps(mut self, deps: &[ResolvedDependency]) -> Self {
        self.dep_prefixes = deps
            .iter()
            .map(|d| (d.name.clone(), d.prefix.clone()))
            .collect();
        self
    }

    /// Expand `$PREFIX`, `$BUILD_DIR`, `$NPROC`, `$ARCH`, and
    /// `$DEP_<NAME>` (name uppercased, `-` becomes `_`).
    pub fn expand(&self, s: &str) -> String {
        let mut out = s
            .replace("$PREFIX", &self.prefix.display().to_string())
            .replace("$BUILD_DIR", &self.build_dir.display().to_string())
            .replace("$NPROC", &self.nproc.to_string())
            .replace("$ARCH", &self.arch);
        for (name, prefix) in &self.dep_prefixes {
            let var = format!("$DEP_{}", name.to_uppercase().replace('-', "_"));
            out = out.replace(&var, &prefix.display().to_string());
        }
        out
    }
}

/// Build the environment for one step.
///
/// Applied in order: copy of `base`; removal of formula-, step-, and
/// previously-scrubbed variables; dependency search-path injection;
/// formula overrides; matching platform overlays; step overlay. A variable
/// scrubbed at an earlier step stays absent here even if `base` carries it.
pub fn build(
    base: &Environment,
    formula: &Formula,
    step: &StepSpec,
    scrubbed: &BTreeSet<String>,
    deps: &[ResolvedDependency],
    platform: &Platform,
    vars: &Vars,
) -> Environment {
    let mut env = base.clone();

    for key in formula
        .env
        .unset
        .iter()
        .chain(step.unset.iter())
        .map(String::as_str)
        .chain(scrubbed.iter().map(String::as_str))
    {
        env.remove(key);
    }

    inject_search_paths(&mut env, deps);

    for (key, value) in &formula.env.set {
        env.set(key, vars.expand(value));
    }
    for overlay in &formula.env.platform {
        if overlay.when.matches(platform) {
            for (key, value) in &overlay.set {
                env.set(key, vars.expand(value));
            }
        }
    }
    for (key, value) in &step.env {
        env.set(key, vars.expand(value));
    }

    env
}

/// Inject each dependency's subpaths into the search-path variables.
/// Dependency order is preserved, injected entries precede the inherited
/// value, and duplicates keep their first occurrence.
pub(crate) fn inject_search_paths(env: &mut Environment, deps: &[ResolvedDependency]) {
    for (var, subdir) in SEARCH_PATHS {
        let mut entries: Vec<String> = Vec::new();
        for dep in deps {
            let path = dep.prefix.join(subdir);
            if path.is_dir() {
                entries.push(path.display().to_string());
            }
        }
        if entries.is_empty() {
            continue;
        }
        if let Some(existing) = env.get(var) {
            entries.extend(existing.split(':').map(str::to_string));
        }
        env.set(*var, dedup_join(&entries));
    }
}

/// Join path entries with `:`, dropping later duplicates and empty entries.
fn dedup_join(entries: &[String]) -> String {
    let mut seen: BTreeSet<&str> = BTreeSet::new();
    let mut out: Vec<&str> = Vec::new();
    for entry in entries {
        if !entry.is_empty() && seen.insert(entry) {
            out.push(entry);
        }
    }
    out.join(":")
}

/// The absolute path a step runs in: the source tree, or `dir` under it.
pub fn step_workdir(src_dir: &Path, step: &StepSpec, vars: &Vars) -> PathBuf {
    match &step.dir {
        Some(dir) => src_dir.join(vars.expand(dir)),
        None => src_dir.to_path_buf(),
    }
}
