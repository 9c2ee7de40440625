//! Install orchestration - one worker per independent formula.
//!
//! The resolver fixes the order; workers claim any formula whose resolved
//! dependencies have all reached `Done`. Steps within one formula stay
//! strictly sequential on its worker. A dependency failure marks every
//! transitive dependent as skipped without starting it, and the error that
//! surfaces identifies the dependency's failing step.

use crate::cellar::{Cellar, InstallationRecord, collect_files};
use crate::env::{Environment, Vars};
use crate::executor::{CancelToken, Executor};
use crate::fetch::Fetcher;
use crate::formula::{Dependency, Formula};
use crate::output;
use crate::platform::Platform;
use crate::resolver::{ResolvedDependency, Resolver};
use crate::tester;
use anyhow::{Context, Result, anyhow, bail};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Condvar, Mutex};

/// Options for an install run.
#[derive(Debug, Clone)]
pub struct InstallOptions {
    /// Worker count for independent formulas
    pub jobs: usize,
    /// Skip the formulas' smoke tests
    pub skip_tests: bool,
    /// Rebuild targets even when the exact version is already installed
    pub force: bool,
    /// Echo every command as it runs
    pub verbose: bool,
}

impl Default for InstallOptions {
    fn default() -> Self {
        Self {
            jobs: num_cpus::get(),
            skip_tests: false,
            force: false,
            verbose: false,
        }
    }
}

/// Per-formula scheduling status.
#[derive(Debug, Clone)]
enum NodeStatus {
    Waiting,
    Running,
    Done,
    Failed(String),
    Skipped(String),
}

impl NodeStatus {
    fn is_terminal(&self) -> bool {
        matches!(
            self,
            NodeStatus::Done | NodeStatus::Failed(_) | NodeStatus::Skipped(_)
        )
    }
}

struct Scoreboard {
    nodes: Mutex<BTreeMap<String, NodeStatus>>,
    wakeup: Condvar,
}

/// Drives installs, tests, and uninstalls over a formula set and a cellar.
pub struct Orchestrator {
    formulas: BTreeMap<String, Formula>,
    cellar: Cellar,
    platform: Platform,
    build_root: PathBuf,
    cache_dir: PathBuf,
    cancel: CancelToken,
    options: InstallOptions,
}

impl Orchestrator {
    pub fn new(
        formulas: BTreeMap<String, Formula>,
        cellar: Cellar,
        build_root: impl Into<PathBuf>,
        cache_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            formulas,
            cellar,
            platform: Platform::host(),
            build_root: build_root.into(),
            cache_dir: cache_dir.into(),
            cancel: CancelToken::new(),
            options: InstallOptions::default(),
        }
    }

    pub fn with_options(mut self, options: InstallOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_platform(mut self, platform: Platform) -> Self {
        self.platform = platform;
        self
    }

    pub fn cellar(&self) -> &Cellar {
        &self.cellar
    }

    fn resolver(&self) -> Result<Resolver<'_>> {
        let satisfied = self.cellar.installed_names()?;
        Ok(Resolver::new(&self.formulas).with_satisfied(satisfied))
    }

    /// Install the targets and everything they depend on.
    pub fn install(&self, targets: &[String]) -> Result<()> {
        let resolver = self.resolver()?;
        let order = resolver.install_order(targets)?;

        let mut nodes: BTreeMap<String, NodeStatus> = BTreeMap::new();
        let mut pending = 0usize;
        for name in &order {
            let formula = &self.formulas[name];
            let installed = self.cellar.is_installed(name, &formula.version);
            let forced = self.options.force && targets.contains(name);
            if installed && !forced {
                output::skip(&format!(
                    "{} {} already installed, skipping",
                    name, formula.version
                ));
                nodes.insert(name.clone(), NodeStatus::Done);
                continue;
            }
            if installed && forced {
                self.cellar.uninstall(name, Some(&formula.version))?;
            }
            nodes.insert(name.clone(), NodeStatus::Waiting);
            pending += 1;
        }

        if pending == 0 {
            return Ok(());
        }

        let board = Scoreboard {
            nodes: Mutex::new(nodes),
            wakeup: Condvar::new(),
        };
        let workers = self.options.jobs.clamp(1, pending);
        std::thread::scope(|scope| {
            for _ in 0..workers {
                scope.spawn(|| self.worker(&board));
            }
        });

        self.summarize(board.nodes.into_inner().expect("no worker panicked"))
    }

    /// One worker: claim a ready formula, build it, repeat.
    fn worker(&self, board: &Scoreboard) {
        loop {
            let Some(name) = self.claim(board) else {
                return;
            };

            let result = self.build_one(&name);
            let status = match result {
                Ok(()) => NodeStatus::Done,
                Err(e) => {
                    output::error(&format!("{:#}", e));
                    NodeStatus::Failed(format!("{:#}", e))
                }
            };

            let mut nodes = board.nodes.lock().expect("scoreboard poisoned");
            nodes.insert(name, status);
            board.wakeup.notify_all();
        }
    }

    /// Pick the next buildable formula, blocking while everything ready is
    /// already being built. Returns `None` when no work remains.
    fn claim(&self, board: &Scoreboard) -> Option<String> {
        let mut nodes = board.nodes.lock().expect("scoreboard poisoned");
        loop {
            if self.cancel.is_cancelled() {
                for status in nodes.values_mut() {
                    if matches!(status, NodeStatus::Waiting) {
                        *status = NodeStatus::Skipped("cancelled".to_string());
                    }
                }
                board.wakeup.notify_all();
                return None;
            }

            // Propagate failures before looking for ready work, so skipped
            // nodes release their own dependents.
            loop {
                let mut newly_skipped: Option<(String, String)> = None;
                'outer: for (name, status) in nodes.iter() {
                    if !matches!(status, NodeStatus::Waiting) {
                        continue;
                    }
                    for dep in self.formulas[name].dep_names() {
                        match nodes.get(&dep) {
                            Some(NodeStatus::Failed(_)) => {
                                newly_skipped = Some((
                                    name.clone(),
                                    format!("not built: dependency '{}' failed", dep),
                                ));
                                break 'outer;
                            }
                            Some(NodeStatus::Skipped(why)) => {
                                newly_skipped = Some((name.clone(), why.clone()));
                                break 'outer;
                            }
                            _ => {}
                        }
                    }
                }
                match newly_skipped {
                    Some((name, why)) => {
                        output::warning(&format!("{}: {}", name, why));
                        nodes.insert(name, NodeStatus::Skipped(why));
                    }
                    None => break,
                }
            }

            if nodes.values().all(NodeStatus::is_terminal) {
                board.wakeup.notify_all();
                return None;
            }

            let ready = nodes.iter().find_map(|(name, status)| {
                if !matches!(status, NodeStatus::Waiting) {
                    return None;
                }
                let deps_done = self.formulas[name].dep_names().iter().all(|dep| {
                    // Absent from the board: already installed or satisfied
                    // on the host before this run started.
                    nodes
                        .get(dep)
                        .map(|s| matches!(s, NodeStatus::Done))
                        .unwrap_or(true)
                });
                deps_done.then(|| name.clone())
            });

            match ready {
                Some(name) => {
                    nodes.insert(name.clone(), NodeStatus::Running);
                    return Some(name);
                }
                None => {
                    nodes = board
                        .wakeup
                        .wait(nodes)
                        .expect("scoreboard poisoned");
                }
            }
        }
    }

    /// Fetch, build, test, and publish one formula.
    fn build_one(&self, name: &str) -> Result<()> {
        let formula = &self.formulas[name];
        let version = &formula.version;
        output::action(&format!("Installing {} {}", name, version));

        let deps = self.resolve_prefixes(formula, formula.build_time_deps())?;

        let build_dir = self.build_root.join(format!("{}-{}", name, version));
        if build_dir.exists() {
            std::fs::remove_dir_all(&build_dir)
                .with_context(|| format!("cleaning stale build dir for {}", name))?;
        }
        let src_dir = build_dir.join("src");

        if let Some(source) = &formula.source {
            output::sub_action("fetch");
            Fetcher::new(&self.cache_dir)
                .fetch(source, &src_dir)
                .with_context(|| format!("fetching {} {}", name, version))?;
        } else {
            std::fs::create_dir_all(&src_dir)?;
        }

        let staging = self.cellar.stage(name, version)?;
        let base_env = Environment::ambient();
        let vars = Vars::new(
            staging.path().to_path_buf(),
            build_dir.clone(),
            &self.platform,
        )
        .with_deps(&deps);

        let mut executor = Executor::new(
            formula,
            &src_dir,
            vars,
            base_env.clone(),
            &deps,
            &self.platform,
        )
        .with_cancel(self.cancel.clone())
        .verbose(self.options.verbose);

        executor
            .run()
            .with_context(|| format!("building {} {}", name, version))?;

        if !self.options.skip_tests && !formula.tests.is_empty() {
            output::sub_action("test");
            let test_deps = self.resolve_prefixes(formula, formula.test_time_deps())?;
            let report =
                tester::run_tests(formula, staging.path(), &test_deps, &base_env, &self.cancel);
            if let Some(failure) = report.first_failure() {
                bail!("testing {} {}: {}", name, version, failure);
            }
        }

        let files = collect_files(staging.path())?;
        let runtime_deps = self.resolver()?.runtime_closure(formula)?;
        let record = InstallationRecord::new(name, version, runtime_deps, files);
        let prefix = self.cellar.publish(staging, &record)?;

        let _ = std::fs::remove_dir_all(&build_dir);
        output::success(&format!("{} {} installed to {}", name, version, prefix.display()));
        Ok(())
    }

    /// Bind dependencies to their installed prefixes, declaration order
    /// preserved.
    fn resolve_prefixes<'f>(
        &self,
        formula: &Formula,
        deps: impl Iterator<Item = &'f Dependency>,
    ) -> Result<Vec<ResolvedDependency>> {
        deps.map(|dep| {
            let prefix = self.cellar.installed_prefix(&dep.name).ok_or_else(|| {
                anyhow!(
                    "dependency '{}' of '{}' is not installed",
                    dep.name,
                    formula.name
                )
            })?;
            Ok(ResolvedDependency {
                name: dep.name.clone(),
                prefix,
                kind: dep.kind,
            })
        })
        .collect()
    }

    fn summarize(&self, nodes: BTreeMap<String, NodeStatus>) -> Result<()> {
        let mut first_failed: Option<String> = None;
        let mut first_skipped: Option<String> = None;
        let mut failed = 0usize;
        let mut skipped = 0usize;
        for (name, status) in &nodes {
            match status {
                NodeStatus::Failed(why) => {
                    failed += 1;
                    if first_failed.is_none() {
                        first_failed = Some(format!("{}: {}", name, why));
                    }
                }
                NodeStatus::Skipped(why) => {
                    skipped += 1;
                    if first_skipped.is_none() {
                        first_skipped = Some(format!("{}: {}", name, why));
                    }
                }
                _ => {}
            }
        }

        // A real failure is more informative than the skips it caused.
        let first_failure = first_failed.or(first_skipped);
        match first_failure {
            None => Ok(()),
            Some(why) => {
                if failed + skipped > 1 {
                    output::warning(&format!(
                        "{} formula(s) failed, {} skipped",
                        failed, skipped
                    ));
                }
                bail!("{}", why)
            }
        }
    }

    /// Run a formula's tests against its installed prefix.
    pub fn test(&self, name: &str) -> Result<()> {
        let formula = self
            .formulas
            .get(name)
            .ok_or_else(|| anyhow!("unknown formula: {}", name))?;
        let prefix = self
            .cellar
            .installed_prefix(name)
            .ok_or_else(|| anyhow!("{} is not installed", name))?;

        output::action(&format!("Testing {} against {}", name, prefix.display()));
        if formula.tests.is_empty() {
            output::info("no tests declared");
            return Ok(());
        }

        let deps = self.resolve_prefixes(formula, formula.test_time_deps())?;
        let report =
            tester::run_tests(formula, &prefix, &deps, &Environment::ambient(), &self.cancel);
        if let Some(failure) = report.first_failure() {
            bail!("testing {}: {}", name, failure);
        }
        output::success(&format!("{}: {} assertion(s) passed", name, report.results.len()));
        Ok(())
    }

    /// Remove an installed formula (all versions unless one is given).
    pub fn uninstall(&self, name: &str, version: Option<&str>) -> Result<()> {
        let removed = self.cellar.uninstall(name, version)?;
        for version in &removed {
            output::success(&format!("removed {} {}", name, version));
        }
        Ok(())
    }
}
