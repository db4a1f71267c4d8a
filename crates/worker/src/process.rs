//! Worker command resolution and process spawning.
//!
//! The default worker is the workspace's own `vitest` binary when one is
//! installed under `node_modules/.bin`, falling back to `npx vitest`. The
//! resolved default is started with its API server bound to the configured
//! host and port. A user-supplied command is run verbatim; it learns the
//! API address from the `TESTBOOK_API_HOST` / `TESTBOOK_API_PORT`
//! environment variables instead.

use std::path::Path;
use std::process::Stdio;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};

/// Program plus arguments used to launch the worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerCommand {
    pub program: String,
    pub args: Vec<String>,
    /// Whether `--api.host` / `--api.port` flags are appended at spawn time.
    pub api_flags: bool,
}

impl WorkerCommand {
    /// A command that is run exactly as given.
    pub fn new<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
            api_flags: false,
        }
    }

    /// Parse a whitespace-separated command line. `None` if it is blank.
    pub fn parse(line: &str) -> Option<Self> {
        let mut parts = line.split_whitespace();
        let program = parts.next()?;
        Some(Self::new(program, parts))
    }

    /// The test runner installed in `workspace`, or `npx vitest`.
    pub fn resolve(workspace: &Path) -> Self {
        let local = workspace.join("node_modules").join(".bin").join("vitest");
        let mut command = if local.is_file() {
            Self::new(local.to_string_lossy(), std::iter::empty::<String>())
        } else {
            Self::new("npx", ["vitest"])
        };
        command.api_flags = true;
        command
    }

    /// Full argument list for an API server at `host:port`.
    pub fn spawn_args(&self, host: &str, port: u16) -> Vec<String> {
        let mut args = self.args.clone();
        if self.api_flags {
            args.extend([
                "--api.host".to_string(),
                host.to_string(),
                "--api.port".to_string(),
                port.to_string(),
            ]);
        }
        args
    }
}

impl std::fmt::Display for WorkerCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

/// Spawn the worker in `workspace` with its API at `host:port`.
///
/// The child is killed when its handle is dropped. Its stdout and stderr
/// are forwarded line by line to `tracing` at debug level.
pub fn spawn_worker(
    command: &WorkerCommand,
    workspace: &Path,
    host: &str,
    port: u16,
) -> std::io::Result<Child> {
    let mut cmd = Command::new(&command.program);
    cmd.args(command.spawn_args(host, port))
        .current_dir(workspace)
        .env("TESTBOOK_API_HOST", host)
        .env("TESTBOOK_API_PORT", port.to_string())
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = cmd.spawn()?;

    if let Some(stdout) = child.stdout.take() {
        tokio::spawn(forward_lines(stdout, "stdout"));
    }
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(forward_lines(stderr, "stderr"));
    }

    Ok(child)
}

/// Log every line of a child output stream until it closes.
async fn forward_lines<R: AsyncRead + Unpin>(stream: R, name: &'static str) {
    let mut lines = BufReader::new(stream).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => tracing::debug!(stream = name, "{line}"),
            Ok(None) => break,
            Err(e) => {
                tracing::debug!(stream = name, error = %e, "Stopped reading worker output");
                break;
            }
        }
    }
}
