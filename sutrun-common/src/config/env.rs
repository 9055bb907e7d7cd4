//! Environment variable parsing.
//!
//! Every getter records invalid values as [`EnvError`]s and falls back to the
//! default, so all problems can be reported at once.

use std::env;
use std::time::Duration;
use thiserror::Error;

/// Errors found while parsing `SUTRUN_*` variables.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EnvError {
    #[error("Invalid value for {var}: expected {expected}, got '{value}'")]
    InvalidValue {
        var: String,
        expected: String,
        value: String,
    },

    #[error("Invalid duration for {var}: {value}")]
    InvalidDuration { var: String, value: String },

    #[error("Value out of range for {var}: {value} (valid: {min}..={max})")]
    OutOfRange {
        var: String,
        value: String,
        min: String,
        max: String,
    },

    #[error("Invalid log level for {var}: {value}")]
    InvalidLogLevel { var: String, value: String },
}

/// Where a configuration value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSource {
    Default,
    Environment,
}

/// A value tagged with its source.
#[derive(Debug, Clone, PartialEq)]
pub struct Sourced<T> {
    pub value: T,
    pub source: ConfigSource,
    /// Variable the value was read from, if any.
    pub var: Option<String>,
}

impl<T> Sourced<T> {
    fn from_env(value: T, var: String) -> Self {
        Self {
            value,
            source: ConfigSource::Environment,
            var: Some(var),
        }
    }

    fn default_value(value: T) -> Self {
        Self {
            value,
            source: ConfigSource::Default,
            var: None,
        }
    }

    pub fn is_from_env(&self) -> bool {
        self.source == ConfigSource::Environment
    }
}

/// Type-safe parser for `SUTRUN_*` environment variables.
#[derive(Debug)]
pub struct EnvParser {
    prefix: &'static str,
    errors: Vec<EnvError>,
}

impl Default for EnvParser {
    fn default() -> Self {
        Self::new()
    }
}

impl EnvParser {
    pub fn new() -> Self {
        Self {
            prefix: "SUTRUN_",
            errors: Vec::new(),
        }
    }

    pub fn errors(&self) -> &[EnvError] {
        &self.errors
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    pub fn take_errors(&mut self) -> Vec<EnvError> {
        std::mem::take(&mut self.errors)
    }

    fn var_name(&self, name: &str) -> String {
        format!("{}{}", self.prefix, name)
    }

    pub fn get_string(&mut self, name: &str, default: &str) -> Sourced<String> {
        let var = self.var_name(name);
        match env::var(&var) {
            Ok(value) => Sourced::from_env(value, var),
            Err(_) => Sourced::default_value(default.to_string()),
        }
    }

    /// Empty or unset variables yield `None`.
    pub fn get_optional_string(&mut self, name: &str) -> Sourced<Option<String>> {
        let var = self.var_name(name);
        match env::var(&var) {
            Ok(value) if value.is_empty() => Sourced::from_env(None, var),
            Ok(value) => Sourced::from_env(Some(value), var),
            Err(_) => Sourced::default_value(None),
        }
    }

    /// Accepts 1/true/yes/on and 0/false/no/off/"" (case-insensitive).
    pub fn get_bool(&mut self, name: &str, default: bool) -> Sourced<bool> {
        let var = self.var_name(name);
        let Ok(value) = env::var(&var) else {
            return Sourced::default_value(default);
        };

        match value.to_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Sourced::from_env(true, var),
            "0" | "false" | "no" | "off" | "" => Sourced::from_env(false, var),
            _ => {
                self.errors.push(EnvError::InvalidValue {
                    var,
                    expected: "boolean (true/false/1/0/yes/no)".to_string(),
                    value,
                });
                Sourced::default_value(default)
            }
        }
    }

    pub fn get_u32_range(&mut self, name: &str, default: u32, min: u32, max: u32) -> Sourced<u32> {
        let var = self.var_name(name);
        let Ok(value) = env::var(&var) else {
            return Sourced::default_value(default);
        };

        match value.trim().parse::<u32>() {
            Ok(n) if (min..=max).contains(&n) => Sourced::from_env(n, var),
            Ok(n) => {
                self.errors.push(EnvError::OutOfRange {
                    var,
                    value: n.to_string(),
                    min: min.to_string(),
                    max: max.to_string(),
                });
                Sourced::default_value(default)
            }
            Err(_) => {
                self.errors.push(EnvError::InvalidValue {
                    var,
                    expected: "unsigned 32-bit integer".to_string(),
                    value,
                });
                Sourced::default_value(default)
            }
        }
    }

    /// Durations accept humantime syntax (`90s`, `1h 30m`) or plain seconds.
    pub fn get_duration(&mut self, name: &str, default: Duration) -> Sourced<Duration> {
        let var = self.var_name(name);
        let Ok(value) = env::var(&var) else {
            return Sourced::default_value(default);
        };

        match parse_duration(&value) {
            Some(duration) => Sourced::from_env(duration, var),
            None => {
                self.errors.push(EnvError::InvalidDuration { var, value });
                Sourced::default_value(default)
            }
        }
    }

    pub fn get_log_level(&mut self, name: &str, default: &str) -> Sourced<String> {
        let var = self.var_name(name);
        let Ok(value) = env::var(&var) else {
            return Sourced::default_value(default.to_string());
        };

        let lower = value.to_lowercase();
        match lower.as_str() {
            "trace" | "debug" | "info" | "warn" | "error" | "off" => Sourced::from_env(lower, var),
            _ => {
                self.errors.push(EnvError::InvalidLogLevel { var, value });
                Sourced::default_value(default.to_string())
            }
        }
    }
}

/// Parse plain (possibly fractional) seconds or a humantime duration.
pub fn parse_duration(value: &str) -> Option<Duration> {
    let value = value.trim();
    if let Ok(secs) = value.parse::<f64>() {
        return Duration::try_from_secs_f64(secs).ok();
    }
    humantime::parse_duration(value).ok()
}
