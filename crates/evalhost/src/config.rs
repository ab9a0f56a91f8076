//! Host configuration: interpreter command line, protocol sentinels, and
//! lifecycle limits.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::EvalError;

/// Environment variable naming the interpreter command path.
pub const ENV_COMMAND: &str = "EVALHOST_COMMAND";
/// Environment variable carrying extra interpreter arguments (shell quoting).
pub const ENV_ARGS: &str = "EVALHOST_ARGS";
/// Environment variable naming the worker working directory.
pub const ENV_WORKING_DIR: &str = "EVALHOST_WORKING_DIR";
/// Environment variable forwarding a runtime-home assignment into workers,
/// in `NAME=VALUE` form (e.g. `JAVA_HOME=/opt/jdk`).
pub const ENV_RUNTIME_HOME: &str = "EVALHOST_RUNTIME_HOME";

/// Command line a worker subprocess is spawned with. Immutable per worker
/// instance; constructing a new worker is the only way to change it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessConfig {
    pub command: String,
    pub args: Vec<String>,
    pub working_directory: Option<PathBuf>,
    /// Extra environment forwarded into the subprocess, on top of the
    /// inherited environment.
    pub env: BTreeMap<String, String>,
}

impl ProcessConfig {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            working_directory: None,
            env: BTreeMap::new(),
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_working_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_directory = Some(dir.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Builds a config from the `EVALHOST_*` environment surface.
    pub fn from_env() -> Result<Self, EvalError> {
        let command = std::env::var(ENV_COMMAND)
            .map_err(|_| EvalError::InvalidConfig(format!("{ENV_COMMAND} is not set")))?;
        let mut config = Self::new(command);

        if let Ok(raw_args) = std::env::var(ENV_ARGS) {
            config.args = shell_words::split(&raw_args).map_err(|error| {
                EvalError::InvalidConfig(format!("{ENV_ARGS} is not valid shell quoting: {error}"))
            })?;
        }
        if let Ok(dir) = std::env::var(ENV_WORKING_DIR) {
            config.working_directory = Some(PathBuf::from(dir));
        }
        if let Ok(assignment) = std::env::var(ENV_RUNTIME_HOME) {
            let Some((name, value)) = assignment.split_once('=') else {
                return Err(EvalError::InvalidConfig(format!(
                    "{ENV_RUNTIME_HOME} must be NAME=VALUE, got '{assignment}'"
                )));
            };
            config.env.insert(name.trim().to_string(), value.to_string());
        }
        Ok(config)
    }
}

/// Timeouts and bounds governing worker lifecycle and pooling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostLimits {
    /// How long a booting worker may take to emit the ready marker.
    pub initialization_timeout: Duration,
    /// Upper bound on one evaluate call.
    pub execution_timeout: Duration,
    /// Grace window between the graceful termination signal and the kill.
    pub termination_grace: Duration,
    /// Idle workers unused beyond this are evicted from the pool.
    pub idle_timeout: Duration,
    /// Maximum outstanding workers (idle plus acquired) in the pool.
    pub max_pool_size: usize,
}

impl Default for HostLimits {
    fn default() -> Self {
        Self {
            initialization_timeout: Duration::from_secs(10),
            execution_timeout: Duration::from_secs(10 * 60),
            termination_grace: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(5 * 60),
            max_pool_size: 3,
        }
    }
}

/// Reserved control bytes delimiting protocol messages. Host and subprocess
/// must agree on the exact values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sentinels {
    /// Emitted once by the subprocess when its runtime finished booting.
    pub ready: u8,
    /// Delimits one evaluation unit (host to worker) and one response
    /// (worker to host).
    pub end_of_message: u8,
}

impl Sentinels {
    /// ASCII ACK / ETX, the default worker flavor.
    pub const DEFAULT: Self = Self {
        ready: 0x06,
        end_of_message: 0x03,
    };

    /// ASCII ACK / EOT, the alternate "end of transmission" worker flavor.
    pub const END_OF_TRANSMISSION: Self = Self {
        ready: 0x06,
        end_of_message: 0x04,
    };
}

impl Default for Sentinels {
    fn default() -> Self {
        Self::DEFAULT
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostConfig {
    pub process: ProcessConfig,
    pub limits: HostLimits,
    pub sentinels: Sentinels,
}

impl HostConfig {
    pub fn new(process: ProcessConfig) -> Self {
        Self {
            process,
            limits: HostLimits::default(),
            sentinels: Sentinels::default(),
        }
    }

    pub fn with_limits(mut self, limits: HostLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_sentinels(mut self, sentinels: Sentinels) -> Self {
        self.sentinels = sentinels;
        self
    }
}
