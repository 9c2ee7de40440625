//! Subprocess invocation with captured output and cancellation.
//!
//! Every external tool runs as an opaque subprocess; the only structured
//! interface is its exit code plus captured stdout/stderr. Cancellation
//! delivers SIGTERM to the child (escalating to SIGKILL if it lingers)
//! rather than abandoning it.

use super::error::ExecuteError;
use std::io::Read;
use std::process::{Child, Command, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// Poll interval while waiting on a child process
const WAIT_POLL: Duration = Duration::from_millis(25);

/// Grace period between SIGTERM and SIGKILL
const TERM_GRACE: Duration = Duration::from_secs(5);

/// Cooperative cancellation flag shared between the CLI and workers.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Exit code and captured output of one finished subprocess.
#[derive(Debug)]
pub struct Captured {
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl Captured {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

/// Run a prepared command to completion, draining its output on helper
/// threads so a chatty build tool cannot deadlock on a full pipe.
pub fn run_captured(
    mut cmd: Command,
    command_line: &str,
    cancel: &CancelToken,
) -> Result<Captured, ExecuteError> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let mut child = cmd.spawn().map_err(|source| ExecuteError::Spawn {
        program: command_line.to_string(),
        source,
    })?;

    let stdout = drain(child.stdout.take());
    let stderr = drain(child.stderr.take());

    let status = loop {
        if cancel.is_cancelled() {
            terminate(&mut child);
            let _ = child.wait();
            return Err(ExecuteError::Cancelled {
                command: command_line.to_string(),
            });
        }
        match child.try_wait()? {
            Some(status) => break status,
            None => std::thread::sleep(WAIT_POLL),
        }
    };

    Ok(Captured {
        code: status.code(),
        stdout: join_drain(stdout),
        stderr: join_drain(stderr),
    })
}

/// Collect a pipe on a background thread.
fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> Option<std::thread::JoinHandle<String>> {
    pipe.map(|mut pipe| {
        std::thread::spawn(move || {
            let mut buf = String::new();
            let mut bytes = Vec::new();
            if pipe.read_to_end(&mut bytes).is_ok() {
                buf = String::from_utf8_lossy(&bytes).into_owned();
            }
            buf
        })
    })
}

fn join_drain(handle: Option<std::thread::JoinHandle<String>>) -> String {
    handle
        .and_then(|h| h.join().ok())
        .unwrap_or_default()
}

/// SIGTERM first; SIGKILL if the child ignores it past the grace period.
fn terminate(child: &mut Child) {
    let pid = child.id() as libc::pid_t;
    unsafe {
        libc::kill(pid, libc::SIGTERM);
    }
    let deadline = Instant::now() + TERM_GRACE;
    while Instant::now() < deadline {
        match child.try_wait() {
            Ok(Some(_)) => return,
            Ok(None) => std::thread::sleep(WAIT_POLL),
            Err(_) => break,
        }
    }
    let _ = child.kill();
}
