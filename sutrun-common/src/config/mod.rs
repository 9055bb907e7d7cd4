//! Runner configuration.
//!
//! Values come from (lowest to highest precedence) built-in defaults, an
//! optional TOML file and `SUTRUN_*` environment variables.

pub mod env;

pub use env::{ConfigSource, EnvError, EnvParser, Sourced, parse_duration};

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Configuration loading errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid environment: {}", .0.iter().map(ToString::to_string).collect::<Vec<_>>().join("; "))]
    Env(Vec<EnvError>),

    #[error("invalid config: {0}")]
    Invalid(String),
}

fn default_exec_timeout() -> f64 {
    3600.0
}

fn default_suite_timeout() -> f64 {
    3600.0
}

fn default_ping_timeout() -> f64 {
    10.0
}

fn default_max_workers() -> usize {
    1
}

fn default_write_kmsg() -> bool {
    true
}

fn default_reboot_retries() -> u32 {
    10
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Scheduling knobs shared by the test and suite schedulers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunnerConfig {
    /// Per-test execution timeout, in seconds.
    #[serde(default = "default_exec_timeout")]
    pub exec_timeout_secs: f64,
    /// Wall-clock budget of a whole suite, reboots included.
    #[serde(default = "default_suite_timeout")]
    pub suite_timeout_secs: f64,
    /// Bound on the health ping issued after a test timeout.
    #[serde(default = "default_ping_timeout")]
    pub ping_timeout_secs: f64,
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    /// Run every test in the parallel batch regardless of its flag.
    #[serde(default)]
    pub force_parallel: bool,
    /// Mark test starts in the SUT kernel log.
    #[serde(default = "default_write_kmsg")]
    pub write_kmsg: bool,
    /// `communicate` attempts when bringing the SUT back after a fault.
    #[serde(default = "default_reboot_retries")]
    pub reboot_retries: u32,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            exec_timeout_secs: default_exec_timeout(),
            suite_timeout_secs: default_suite_timeout(),
            ping_timeout_secs: default_ping_timeout(),
            max_workers: default_max_workers(),
            force_parallel: false,
            write_kmsg: default_write_kmsg(),
            reboot_retries: default_reboot_retries(),
            log_level: default_log_level(),
        }
    }
}

impl RunnerConfig {
    /// Defaults overridden by the environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Read a TOML file, then apply environment overrides.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config: Self = toml::from_str(&content)?;
        debug!(path = %path.display(), "Loaded config file");

        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Override fields with every `SUTRUN_*` variable that is set.
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        let mut parser = EnvParser::new();

        let exec = parser.get_duration("EXEC_TIMEOUT", self.exec_timeout());
        let suite = parser.get_duration("SUITE_TIMEOUT", self.suite_timeout());
        let ping = parser.get_duration("PING_TIMEOUT", self.ping_timeout());
        let workers = parser.get_u32_range("MAX_WORKERS", 1, 1, 4096);
        let force = parser.get_bool("FORCE_PARALLEL", self.force_parallel);
        let kmsg = parser.get_bool("WRITE_KMSG", self.write_kmsg);
        let retries = parser.get_u32_range("REBOOT_RETRIES", self.reboot_retries, 1, 1000);
        let level = parser.get_log_level("LOG_LEVEL", &self.log_level);

        if parser.has_errors() {
            return Err(ConfigError::Env(parser.take_errors()));
        }

        if exec.is_from_env() {
            self.exec_timeout_secs = exec.value.as_secs_f64();
        }
        if suite.is_from_env() {
            self.suite_timeout_secs = suite.value.as_secs_f64();
        }
        if ping.is_from_env() {
            self.ping_timeout_secs = ping.value.as_secs_f64();
        }
        if workers.is_from_env() {
            self.max_workers = workers.value as usize;
        }
        self.force_parallel = force.value;
        self.write_kmsg = kmsg.value;
        self.reboot_retries = retries.value;
        self.log_level = level.value;

        Ok(())
    }

    /// Reject timeouts that are negative or not finite and clamp workers.
    pub fn validate(&mut self) -> Result<(), ConfigError> {
        for (name, value) in [
            ("exec_timeout_secs", self.exec_timeout_secs),
            ("suite_timeout_secs", self.suite_timeout_secs),
            ("ping_timeout_secs", self.ping_timeout_secs),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(ConfigError::Invalid(format!(
                    "{name} must be a non-negative number, got {value}"
                )));
            }
        }
        self.max_workers = self.max_workers.max(1);
        self.reboot_retries = self.reboot_retries.max(1);
        Ok(())
    }

    pub fn exec_timeout(&self) -> Duration {
        secs(self.exec_timeout_secs)
    }

    pub fn suite_timeout(&self) -> Duration {
        secs(self.suite_timeout_secs)
    }

    pub fn ping_timeout(&self) -> Duration {
        secs(self.ping_timeout_secs)
    }
}

/// Negative and NaN values clamp to zero; only infinity means no limit.
fn secs(value: f64) -> Duration {
    Duration::try_from_secs_f64(value.max(0.0)).unwrap_or(Duration::MAX)
}

#[cfg(test)]
pub(crate) fn env_test_lock() -> std::sync::MutexGuard<'static, ()> {
    use std::sync::{Mutex, OnceLock};

    static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    ENV_LOCK
        .get_or_init(|| Mutex::new(()))
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
}
