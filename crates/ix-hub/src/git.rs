//! Thin runner over the system `git` binary.
//!
//! Every invocation is non-interactive and bounded by a timeout: the child
//! is killed once the deadline passes. Failures are classified from git's
//! stderr so callers can map them onto the hub's error variants.

use std::ffi::OsString;
use std::io::Read;
use std::path::Path;
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::error::HubError;
use crate::reference::ComponentReference;

const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Why a git invocation failed.
#[derive(Debug)]
pub enum GitFailure {
    Authentication(String),
    NotFound(String),
    Network(String),
    TimedOut(Duration),
    /// Non-zero exit that matches no known pattern.
    Other(String),
    /// git could not be started at all.
    Spawn(std::io::Error),
}

impl GitFailure {
    /// Map onto a hub error for `reference`; `other` handles unclassified failures.
    pub(crate) fn into_hub_error(
        self,
        reference: &ComponentReference,
        other: impl FnOnce(String) -> HubError,
    ) -> HubError {
        let name = reference.to_string();
        let clean = |text: String| match reference.credentials() {
            Some(creds) if !creds.token().is_empty() => text.replace(creds.token(), "<redacted>"),
            _ => text,
        };
        match self {
            GitFailure::Authentication(detail) => HubError::Authentication {
                reference: name,
                detail: clean(detail),
            },
            GitFailure::NotFound(detail) => HubError::RepositoryNotFound {
                reference: name,
                detail: clean(detail),
            },
            GitFailure::Network(detail) => HubError::Network {
                reference: name,
                detail: clean(detail),
            },
            GitFailure::TimedOut(after) => HubError::Network {
                reference: name,
                detail: format!("git timed out after {}s", after.as_secs_f64()),
            },
            GitFailure::Other(detail) => other(clean(detail)),
            GitFailure::Spawn(e) => other(format!("failed to run git: {e}")),
        }
    }
}

/// Classify a failed invocation from its stderr.
pub fn classify(stderr: &str) -> GitFailure {
    let lower = stderr.to_ascii_lowercase();
    let detail = stderr.trim().to_string();
    const AUTH: [&str; 7] = [
        "authentication failed",
        "could not read username",
        "could not read password",
        "terminal prompts disabled",
        "permission denied (publickey",
        "access denied",
        "invalid username or password",
    ];
    const NOT_FOUND: [&str; 4] = [
        "repository not found",
        "does not appear to be a git repository",
        "not a git repository",
        "does not exist",
    ];
    const NETWORK: [&str; 10] = [
        "could not resolve host",
        "could not resolve hostname",
        "connection refused",
        "connection timed out",
        "operation timed out",
        "failed to connect",
        "network is unreachable",
        "unable to access",
        "early eof",
        "rpc failed",
    ];
    if AUTH.iter().any(|p| lower.contains(p)) {
        GitFailure::Authentication(detail)
    } else if NOT_FOUND.iter().any(|p| lower.contains(p)) {
        GitFailure::NotFound(detail)
    } else if NETWORK.iter().any(|p| lower.contains(p)) {
        GitFailure::Network(detail)
    } else {
        GitFailure::Other(detail)
    }
}

/// Runs git subcommands with a deadline.
#[derive(Debug, Clone)]
pub struct Git {
    program: OsString,
    timeout: Duration,
}

impl Git {
    pub fn new(timeout: Duration) -> Self {
        Git {
            program: OsString::from("git"),
            timeout,
        }
    }

    pub fn with_program(mut self, program: impl Into<OsString>) -> Self {
        self.program = program.into();
        self
    }

    /// Whether the git binary can be started.
    pub fn is_available(&self) -> bool {
        Command::new(&self.program)
            .arg("--version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map(|s| s.success())
            .unwrap_or(false)
    }

    /// Run `git <args>` in `cwd`, returning stdout on success.
    ///
    /// Arguments may carry credentials, so only the subcommand is logged.
    pub fn run(&self, cwd: Option<&Path>, args: &[&str]) -> Result<String, GitFailure> {
        let mut command = Command::new(&self.program);
        command
            .args(args)
            .env("GIT_TERMINAL_PROMPT", "0")
            .env("GIT_ASKPASS", "")
            .env("SSH_ASKPASS", "")
            .env("LC_ALL", "C")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = cwd {
            command.current_dir(dir);
        }
        let subcommand = args.first().copied().unwrap_or("");
        debug!(subcommand, "running git");

        let mut child = command.spawn().map_err(GitFailure::Spawn)?;
        let stdout = child.stdout.take().map(drain);
        let stderr = child.stderr.take().map(drain);

        let deadline = Instant::now() + self.timeout;
        let status = loop {
            match child.try_wait().map_err(GitFailure::Spawn)? {
                Some(status) => break status,
                None if Instant::now() >= deadline => {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(GitFailure::TimedOut(self.timeout));
                }
                None => thread::sleep(POLL_INTERVAL),
            }
        };

        let join = |h: Option<thread::JoinHandle<String>>| {
            h.and_then(|h| h.join().ok()).unwrap_or_default()
        };
        let out = join(stdout);
        let err = join(stderr);
        if status.success() {
            Ok(out)
        } else {
            Err(classify(&err))
        }
    }
}

fn drain<R: Read + Send + 'static>(mut pipe: R) -> thread::JoinHandle<String> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = pipe.read_to_end(&mut buf);
        String::from_utf8_lossy(&buf).into_owned()
    })
}
