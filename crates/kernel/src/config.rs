use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use testbook_worker::process::WorkerCommand;
use testbook_worker::reconnect::ReconnectConfig;
use testbook_worker::supervisor::DEFAULT_API_PORT;
use testbook_worker::WorkerConfig;

/// Kernel configuration loaded from environment variables.
///
/// All fields have defaults suitable for running inside a JavaScript
/// project checkout.
#[derive(Debug, Clone)]
pub struct KernelConfig {
    /// Workspace root; the worker runs here.
    pub workspace: PathBuf,
    /// Explicit worker command line. `None` resolves the test runner from
    /// the workspace.
    pub worker_command: Option<WorkerCommand>,
    pub api_host: String,
    pub api_port: u16,
    pub connect_initial_delay: Duration,
    pub connect_max_delay: Duration,
    /// How long the console runner waits for all cells to finish.
    pub run_timeout: Duration,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{var} has invalid value {value:?}: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },

    #[error("Workspace {0} is not a directory")]
    WorkspaceNotFound(PathBuf),
}

impl KernelConfig {
    /// Load configuration from the process environment.
    ///
    /// | Env Var                       | Default                 |
    /// |-------------------------------|-------------------------|
    /// | `TESTBOOK_WORKSPACE`          | current directory       |
    /// | `TESTBOOK_WORKER_CMD`         | resolved from workspace |
    /// | `TESTBOOK_API_HOST`           | `127.0.0.1`             |
    /// | `TESTBOOK_API_PORT`           | `51204`                 |
    /// | `TESTBOOK_CONNECT_INITIAL_MS` | `250`                   |
    /// | `TESTBOOK_CONNECT_MAX_MS`     | `5000`                  |
    /// | `TESTBOOK_RUN_TIMEOUT_SECS`   | `120`                   |
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Load configuration through `lookup`, which maps a variable name to
    /// its value.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |var: &str| lookup(var).filter(|v| !v.trim().is_empty());

        let workspace = match get("TESTBOOK_WORKSPACE") {
            Some(dir) => PathBuf::from(dir),
            None => std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
        };
        if !workspace.is_dir() {
            return Err(ConfigError::WorkspaceNotFound(workspace));
        }

        let worker_command = get("TESTBOOK_WORKER_CMD").and_then(|line| WorkerCommand::parse(&line));
        let api_host = get("TESTBOOK_API_HOST").unwrap_or_else(|| "127.0.0.1".into());
        let api_port = parse_or(&get, "TESTBOOK_API_PORT", DEFAULT_API_PORT)?;

        let defaults = ReconnectConfig::default();
        let initial_ms = parse_or(
            &get,
            "TESTBOOK_CONNECT_INITIAL_MS",
            defaults.initial_delay.as_millis() as u64,
        )?;
        let max_ms = parse_or(
            &get,
            "TESTBOOK_CONNECT_MAX_MS",
            defaults.max_delay.as_millis() as u64,
        )?;
        if max_ms < initial_ms {
            return Err(ConfigError::Invalid {
                var: "TESTBOOK_CONNECT_MAX_MS",
                value: max_ms.to_string(),
                reason: format!("must not be below TESTBOOK_CONNECT_INITIAL_MS ({initial_ms})"),
            });
        }
        let run_timeout_secs: u64 = parse_or(&get, "TESTBOOK_RUN_TIMEOUT_SECS", 120)?;

        Ok(Self {
            workspace,
            worker_command,
            api_host,
            api_port,
            connect_initial_delay: Duration::from_millis(initial_ms),
            connect_max_delay: Duration::from_millis(max_ms),
            run_timeout: Duration::from_secs(run_timeout_secs),
        })
    }

    /// Worker settings derived from this configuration.
    pub fn worker_config(&self) -> WorkerConfig {
        let mut config = WorkerConfig::new(&self.workspace);
        if let Some(command) = &self.worker_command {
            config.command = command.clone();
        }
        config.api_host = self.api_host.clone();
        config.api_port = self.api_port;
        config.reconnect = ReconnectConfig {
            initial_delay: self.connect_initial_delay,
            max_delay: self.connect_max_delay,
            ..ReconnectConfig::default()
        };
        config
    }
}

fn parse_or<T, G>(get: &G, var: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    match get(var) {
        None => Ok(default),
        Some(value) => value.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
            var,
            reason: e.to_string(),
            value,
        }),
    }
}
