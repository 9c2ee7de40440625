//! Step executor - runs a formula's steps as a strict state machine.
//!
//! Steps execute in declaration order, each as one subprocess with an
//! explicitly constructed environment. The first fatal failure aborts the
//! remaining steps; nothing is retried, since build tools are not assumed
//! idempotent. The executor records the state trace it actually took.

mod error;
mod process;
mod state;

pub use error::ExecuteError;
pub use process::{CancelToken, Captured, run_captured};
pub use state::State;

use crate::env::{self, Environment, Vars};
use crate::formula::{Formula, StepSpec};
use crate::output;
use crate::platform::Platform;
use crate::resolver::ResolvedDependency;
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::process::Command;

/// Executes one formula's steps against a source tree and a target prefix.
pub struct Executor<'a> {
    formula: &'a Formula,
    src_dir: PathBuf,
    vars: Vars,
    base_env: Environment,
    deps: &'a [ResolvedDependency],
    platform: &'a Platform,
    cancel: CancelToken,
    verbose: bool,
    state: State,
    trace: Vec<State>,
}

impl<'a> Executor<'a> {
    pub fn new(
        formula: &'a Formula,
        src_dir: impl Into<PathBuf>,
        vars: Vars,
        base_env: Environment,
        deps: &'a [ResolvedDependency],
        platform: &'a Platform,
    ) -> Self {
        Self {
            formula,
            src_dir: src_dir.into(),
            vars,
            base_env,
            deps,
            platform,
            cancel: CancelToken::new(),
            verbose: false,
            state: State::Pending,
            trace: vec![State::Pending],
        }
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    /// Current state.
    pub fn state(&self) -> State {
        self.state
    }

    /// The sequence of states this execution passed through.
    pub fn trace(&self) -> &[State] {
        &self.trace
    }

    /// Run every step. On the first fatal error the executor transitions to
    /// `Failed` and returns the error; later steps never run.
    pub fn run(&mut self) -> Result<(), ExecuteError> {
        match self.run_steps() {
            Ok(()) => {
                self.transition(State::Done);
                Ok(())
            }
            Err(e) => {
                self.transition(State::Failed);
                Err(e)
            }
        }
    }

    fn run_steps(&mut self) -> Result<(), ExecuteError> {
        std::fs::create_dir_all(&self.src_dir)?;
        let mut scrubbed: BTreeSet<String> = BTreeSet::new();

        let formula = self.formula;
        for step in &formula.steps {
            if self.cancel.is_cancelled() {
                return Err(ExecuteError::Cancelled {
                    command: self.command_line(step),
                });
            }

            // Skipped steps leave no mark on the state trace.
            if let Some(reason) = self.skip_reason(step) {
                output::detail(&format!(
                    "skipping {} ({})",
                    self.command_line(step),
                    reason
                ));
                scrubbed.extend(step.unset.iter().cloned());
                continue;
            }

            let phase_state = State::for_phase(step.phase);
            if self.state != phase_state {
                self.transition(phase_state);
                output::sub_action(step.phase.name());
            }

            self.run_step(step, &scrubbed)?;

            // A variable a step deletes stays deleted for every later step.
            scrubbed.extend(step.unset.iter().cloned());
        }

        Ok(())
    }

    /// Why a step will not run, if any. `unless_exists` is evaluated right
    /// before the spawn, never memoized: an earlier step may have created
    /// the file.
    fn skip_reason(&self, step: &StepSpec) -> Option<String> {
        if let Some(when) = &step.when
            && !when.matches(self.platform)
        {
            return Some("platform predicate not met".to_string());
        }
        if let Some(guard) = &step.unless_exists {
            let workdir = env::step_workdir(&self.src_dir, step, &self.vars);
            let guard_path = workdir.join(self.vars.expand(guard));
            if guard_path.exists() {
                return Some(format!("{} exists", guard_path.display()));
            }
        }
        None
    }

    fn run_step(&self, step: &StepSpec, scrubbed: &BTreeSet<String>) -> Result<(), ExecuteError> {
        let workdir = env::step_workdir(&self.src_dir, step, &self.vars);
        if !workdir.is_dir() {
            return Err(ExecuteError::WorkdirMissing(workdir.display().to_string()));
        }

        let step_env = env::build(
            &self.base_env,
            self.formula,
            step,
            scrubbed,
            self.deps,
            self.platform,
            &self.vars,
        );

        let command_line = self.command_line(step);
        if self.verbose {
            output::detail(&command_line);
        }

        let mut cmd = Command::new(self.vars.expand(&step.program));
        for arg in &step.args {
            cmd.arg(self.vars.expand(arg));
        }
        cmd.current_dir(&workdir);
        step_env.apply(&mut cmd);

        let captured = run_captured(cmd, &command_line, &self.cancel)?;
        if captured.success() {
            return Ok(());
        }

        if step.allow_failure {
            output::warning(&format!(
                "{} exited with {:?} (allowed to fail)",
                command_line, captured.code
            ));
            return Ok(());
        }

        Err(ExecuteError::StepFailed {
            command: command_line,
            code: captured.code,
            stdout: captured.stdout,
            stderr: captured.stderr,
        })
    }

    fn transition(&mut self, state: State) {
        self.state = state;
        self.trace.push(state);
    }

    /// Rendered command line for logs and errors.
    fn command_line(&self, step: &StepSpec) -> String {
        let mut parts = vec![self.vars.expand(&step.program)];
        parts.extend(step.args.iter().map(|a| self.vars.expand(a)));
        parts.join(" ")
    }
}
