//! malt CLI - formula build and install orchestrator.
//!
//! Usage:
//!   malt install <formula..>       Build and install formulas (and deps)
//!   malt test <formula>            Run a formula's tests against its install
//!   malt uninstall <formula>       Remove an installed formula
//!   malt list                      List installed formulas
//!   malt info <formula>            Show formula and install details

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use malt::executor::CancelToken;
use malt::{Cellar, InstallOptions, InstallationRecord, Orchestrator, formula, output};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Default data directory (XDG compliant)
fn default_data_dir() -> PathBuf {
    let data_home = std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".local/share")
        });
    data_home.join("malt")
}

#[derive(Parser)]
#[command(name = "malt")]
#[command(about = "Formula-driven build and install orchestrator")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Cellar root directory
    #[arg(long, global = true, env = "MALT_CELLAR")]
    cellar: Option<PathBuf>,

    /// Directory containing formula files
    #[arg(short = 'f', long, global = true, env = "MALT_FORMULAS")]
    formulas: Option<PathBuf>,

    /// Build directory (uses the data dir if not specified)
    #[arg(short, long, global = true)]
    build_dir: Option<PathBuf>,

    /// Print commands as they execute
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Build and install formulas together with their dependencies
    Install {
        /// Formula names
        #[arg(required = true)]
        formulas: Vec<String>,

        /// Parallel workers for independent formulas
        #[arg(short, long)]
        jobs: Option<usize>,

        /// Skip the formulas' smoke tests
        #[arg(long)]
        skip_tests: bool,

        /// Rebuild even when the exact version is already installed
        #[arg(long)]
        force: bool,
    },

    /// Run a formula's tests against its installed prefix
    Test {
        /// Formula name
        formula: String,
    },

    /// Remove an installed formula
    Uninstall {
        /// Formula name
        formula: String,

        /// Specific version (all versions if not given)
        #[arg(long)]
        version: Option<String>,
    },

    /// List installed formulas
    List,

    /// Show formula and installation details
    Info {
        /// Formula name
        formula: String,
    },
}

/// Set by the SIGINT handler; a watcher thread forwards it to the token.
static INTERRUPTED: AtomicBool = AtomicBool::new(false);

extern "C" fn on_sigint(_: libc::c_int) {
    INTERRUPTED.store(true, Ordering::SeqCst);
}

fn install_sigint_watcher(cancel: CancelToken) {
    unsafe {
        libc::signal(libc::SIGINT, on_sigint as libc::sighandler_t);
    }
    std::thread::spawn(move || {
        loop {
            if INTERRUPTED.load(Ordering::SeqCst) {
                output::warning("interrupt received, stopping builds");
                cancel.cancel();
                return;
            }
            std::thread::sleep(Duration::from_millis(100));
        }
    });
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let data_dir = default_data_dir();

    let cellar_root = cli.cellar.unwrap_or_else(|| data_dir.join("cellar"));
    let formulas_dir = cli.formulas.unwrap_or_else(|| data_dir.join("formulas"));
    let build_root = cli.build_dir.unwrap_or_else(|| data_dir.join("build"));
    let cache_dir = data_dir.join("cache");

    if !formulas_dir.exists() {
        std::fs::create_dir_all(&formulas_dir).with_context(|| {
            format!("creating formulas directory: {}", formulas_dir.display())
        })?;
    }

    let formulas = formula::load_dir(&formulas_dir)?;
    let cellar = Cellar::new(&cellar_root);
    let cancel = CancelToken::new();
    install_sigint_watcher(cancel.clone());

    match cli.command {
        Commands::Install {
            formulas: targets,
            jobs,
            skip_tests,
            force,
        } => {
            let options = InstallOptions {
                jobs: jobs.unwrap_or_else(num_cpus::get),
                skip_tests,
                force,
                verbose: cli.verbose,
            };
            let orch = Orchestrator::new(formulas, cellar, build_root, cache_dir)
                .with_options(options)
                .with_cancel(cancel);
            orch.install(&targets)
        }

        Commands::Test { formula } => {
            let orch = Orchestrator::new(formulas, cellar, build_root, cache_dir)
                .with_cancel(cancel);
            orch.test(&formula)
        }

        Commands::Uninstall { formula, version } => {
            let orch = Orchestrator::new(formulas, cellar, build_root, cache_dir);
            orch.uninstall(&formula, version.as_deref())
        }

        Commands::List => list(&cellar),

        Commands::Info { formula: name } => info(&cellar, &formulas, &name),
    }
}

fn list(cellar: &Cellar) -> Result<()> {
    let names = cellar.installed_names()?;
    if names.is_empty() {
        output::info("no formulas installed");
        return Ok(());
    }
    for name in names {
        let versions = cellar.installed_versions(&name)?;
        let active = cellar.active_version(&name);
        for version in versions {
            let is_active = active.as_deref() == Some(version.as_str());
            let marker = if is_active { "(active)" } else { "" };
            output::list_item(&name, &format!("{} {}", version, marker), is_active);
        }
    }
    Ok(())
}

fn info(
    cellar: &Cellar,
    formulas: &std::collections::BTreeMap<String, malt::Formula>,
    name: &str,
) -> Result<()> {
    if let Some(formula) = formulas.get(name) {
        output::action(&format!("{} {}", formula.name, formula.version));
        if let Some(desc) = &formula.description {
            println!("{}", desc);
        }
        if !formula.deps.is_empty() {
            let deps: Vec<String> = formula
                .deps
                .iter()
                .map(|d| format!("{} ({:?})", d.name, d.kind))
                .collect();
            println!("dependencies: {}", deps.join(", "));
        }
        println!("steps: {}, tests: {}", formula.steps.len(), formula.tests.len());
    } else {
        output::warning(&format!("no formula file for '{}'", name));
    }

    match cellar.installed_prefix(name) {
        Some(prefix) => {
            let record = InstallationRecord::read(&prefix)?;
            println!(
                "installed: {} at {} ({} files)",
                record.version,
                prefix.display(),
                record.files.len()
            );
            if !record.runtime_deps.is_empty() {
                println!("runtime deps: {}", record.runtime_deps.join(", "));
            }
        }
        None => println!("not installed"),
    }
    Ok(())
}
