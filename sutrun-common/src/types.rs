//! Common types shared by the SUT layer and the schedulers.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Return code a test gets when it was never run because its suite timed out.
pub const SKIPPED_RETURNCODE: i32 = 32;

/// Return code used for synthetic results built when a command never
/// returned usable data (panic, timeout).
pub const BROKEN_RETURNCODE: i32 = -1;

/// Value reported for every [`SutInfo`] field a probe could not determine.
pub const UNKNOWN: &str = "unknown";

/// A single test to execute.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Test {
    /// Test name, unique within its suite.
    pub name: String,
    /// Executable or shell command.
    pub cmd: String,
    /// Positional arguments appended to `cmd`.
    #[serde(default)]
    pub args: Vec<String>,
    /// Working directory on the SUT.
    #[serde(default)]
    pub cwd: Option<String>,
    /// Extra environment variables.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Whether the test may run concurrently with other parallelizable tests.
    #[serde(default)]
    pub parallelizable: bool,
}

impl Test {
    pub fn new(name: impl Into<String>, cmd: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            cmd: cmd.into(),
            args: Vec::new(),
            cwd: None,
            env: BTreeMap::new(),
            parallelizable: false,
        }
    }

    #[must_use]
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn with_cwd(mut self, cwd: impl Into<String>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    #[must_use]
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn parallelizable(mut self, parallelizable: bool) -> Self {
        self.parallelizable = parallelizable;
        self
    }

    /// The command line executed on the SUT.
    pub fn full_command(&self) -> String {
        if self.args.is_empty() {
            return self.cmd.clone();
        }
        format!("{} {}", self.cmd, self.args.join(" "))
    }
}

/// A named, ordered collection of tests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Suite {
    pub name: String,
    pub tests: Vec<Test>,
}

impl Suite {
    pub fn new(name: impl Into<String>, tests: Vec<Test>) -> Self {
        Self {
            name: name.into(),
            tests,
        }
    }

    /// Name of the first test that appears more than once, if any.
    pub fn duplicate_test(&self) -> Option<&str> {
        let mut seen = std::collections::HashSet::new();
        self.tests
            .iter()
            .map(|t| t.name.as_str())
            .find(|name| !seen.insert(*name))
    }
}

/// Outcome of a single command executed on the SUT.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandOutput {
    pub command: String,
    pub stdout: String,
    pub returncode: i32,
    #[serde(with = "duration_secs")]
    pub exec_time: Duration,
}

/// Outcome of one test attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestResult {
    pub test: Test,
    pub passed: u32,
    pub failed: u32,
    pub broken: u32,
    pub skipped: u32,
    pub warnings: u32,
    pub returncode: i32,
    pub stdout: String,
    #[serde(with = "duration_secs")]
    pub exec_time: Duration,
}

impl TestResult {
    /// Result recorded for a test that never ran because its suite timed out.
    pub fn skipped_by_timeout(test: &Test) -> Self {
        Self {
            test: test.clone(),
            passed: 0,
            failed: 0,
            broken: 0,
            skipped: 1,
            warnings: 0,
            returncode: SKIPPED_RETURNCODE,
            stdout: String::new(),
            exec_time: Duration::ZERO,
        }
    }

    /// Result of a test whose output couldn't be used.
    pub fn broken(test: &Test, stdout: impl Into<String>, exec_time: Duration) -> Self {
        Self {
            test: test.clone(),
            passed: 0,
            failed: 0,
            broken: 1,
            skipped: 0,
            warnings: 0,
            returncode: BROKEN_RETURNCODE,
            stdout: stdout.into(),
            exec_time,
        }
    }
}

/// Environment metadata collected from the SUT.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SutInfo {
    pub distro: String,
    pub distro_ver: String,
    pub kernel: String,
    pub arch: String,
    pub cpu: String,
    pub ram: String,
    pub swap: String,
}

impl Default for SutInfo {
    fn default() -> Self {
        Self {
            distro: UNKNOWN.to_string(),
            distro_ver: UNKNOWN.to_string(),
            kernel: UNKNOWN.to_string(),
            arch: UNKNOWN.to_string(),
            cpu: UNKNOWN.to_string(),
            ram: UNKNOWN.to_string(),
            swap: UNKNOWN.to_string(),
        }
    }
}

/// Results of a whole suite run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuiteResult {
    pub suite: Suite,
    pub tests: Vec<TestResult>,
    #[serde(flatten)]
    pub info: SutInfo,
    #[serde(with = "duration_secs")]
    pub exec_time: Duration,
}

impl SuiteResult {
    pub fn passed(&self) -> u32 {
        self.tests.iter().map(|r| r.passed).sum()
    }

    pub fn failed(&self) -> u32 {
        self.tests.iter().map(|r| r.failed).sum()
    }

    pub fn broken(&self) -> u32 {
        self.tests.iter().map(|r| r.broken).sum()
    }

    pub fn skipped(&self) -> u32 {
        self.tests.iter().map(|r| r.skipped).sum()
    }

    pub fn warnings(&self) -> u32 {
        self.tests.iter().map(|r| r.warnings).sum()
    }

    /// Result recorded for the test with the given name.
    pub fn result_for(&self, name: &str) -> Option<&TestResult> {
        self.tests.iter().find(|r| r.test.name == name)
    }
}

/// Serialize durations as fractional seconds.
pub mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}
