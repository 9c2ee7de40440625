//! Formula-driven build and install orchestrator.
//!
//! Formulas are declarative TOML records describing how to fetch, configure,
//! compile, install, and smoke-test one package. The orchestrator resolves
//! their dependency graph, runs each formula's steps as captured subprocess
//! invocations inside explicitly constructed environments, and publishes the
//! result atomically into a versioned cellar.
//!
//! # Example Formula
//!
//! ```toml
//! name = "erlang"
//! version = "24.2.2"
//!
//! [source]
//! url = "https://github.com/erlang/otp/releases/download/OTP-24.2.2/otp_src_24.2.2.tar.gz"
//! checksum = "sha256:a87bcbdcdd1b99de7038030123b2d655d46d6e698a9143608618bdbec6ebbee7"
//! strip_components = 1
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
//! args = ["--prefix=$PREFIX", "--disable-debug", "--with-ssl=$DEP_OPENSSL"]
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
//!
//! # Lifecycle
//!
//! Each formula moves through
//! `Pending -> Configuring -> Building -> Installing -> DocBuilding -> Done`,
//! failing fast to `Failed` on the first fatal step error. Builds happen in a
//! staging prefix and become visible in the cellar through a single rename,
//! with `<cellar>/opt/<name>` pointing at the active version.
//!
//! # Variables Available in Steps
//!
//! - `$PREFIX` - installation prefix (the staged prefix during a build)
//! - `$BUILD_DIR` - temporary build directory
//! - `$NPROC` - number of CPUs
//! - `$ARCH` - target architecture (x86_64, aarch64)
//! - `$DEP_<NAME>` - installed prefix of a resolved dependency

pub mod cellar;
pub mod env;
pub mod executor;
pub mod fetch;
pub mod formula;
pub mod orchestrator;
pub mod output;
pub mod platform;
pub mod resolver;
pub mod tester;

pub use cellar::{Cellar, CellarError, InstallationRecord};
pub use executor::{CancelToken, ExecuteError, Executor, State};
pub use formula::{Formula, FormulaError};
pub use orchestrator::{InstallOptions, Orchestrator};
pub use platform::Platform;
pub use resolver::{ResolveError, ResolvedDependency, Resolver};
