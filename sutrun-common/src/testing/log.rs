//! JSONL logging for tests.
//!
//! Disabled by default on developer machines. Set `SUTRUN_TEST_LOGGING=1`
//! (or run with `CI` set) to get one `target/test-logs/<test>.jsonl` file per
//! guarded test plus an aggregated `all_tests.jsonl` of every tracing event.

use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Mutex, Once, PoisonError};
use std::time::Instant;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::prelude::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestPhase {
    Setup,
    Execute,
    Verify,
}

impl std::fmt::Display for TestPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Setup => write!(f, "setup"),
            Self::Execute => write!(f, "execute"),
            Self::Verify => write!(f, "verify"),
        }
    }
}

static GLOBAL_LOGGING_INIT: Once = Once::new();

/// Install a global subscriber writing JSON to `all_tests.jsonl` and compact
/// text to the test writer. Only the first call does anything.
///
/// `SUTRUN_TEST_LOG_FILE` overrides the file, `SUTRUN_TEST_LOG_LEVEL` the
/// filter level (default `info`).
pub fn init_global_test_logging() {
    GLOBAL_LOGGING_INIT.call_once(|| {
        let file_layer = create_global_log_file().map(|file| {
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(Mutex::new(file))
                .with_span_events(FmtSpan::CLOSE)
                .with_thread_ids(true)
                .with_line_number(true)
        });

        let stderr_layer = tracing_subscriber::fmt::layer()
            .with_test_writer()
            .with_target(true)
            .compact();

        let level = std::env::var("SUTRUN_TEST_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
        let filter = tracing_subscriber::EnvFilter::try_new(format!(
            "sutrun_common={level},sutrun_sched={level}"
        ))
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(file_layer)
            .with(stderr_layer);

        let _ = tracing::subscriber::set_global_default(subscriber);
    });
}

fn create_global_log_file() -> Option<std::fs::File> {
    if let Ok(custom) = std::env::var("SUTRUN_TEST_LOG_FILE") {
        if let Some(parent) = PathBuf::from(&custom).parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        return std::fs::File::create(custom).ok();
    }

    let dir = test_log_dir();
    std::fs::create_dir_all(&dir).ok()?;
    std::fs::File::create(dir.join("all_tests.jsonl")).ok()
}

/// `target/test-logs`, searching upwards from the current directory.
fn test_log_dir() -> PathBuf {
    if let Ok(target) = std::env::var("CARGO_TARGET_DIR") {
        return PathBuf::from(target).join("test-logs");
    }

    let mut cwd = std::env::current_dir().unwrap_or_default();
    loop {
        let target = cwd.join("target");
        if target.is_dir() {
            return target.join("test-logs");
        }
        if !cwd.pop() {
            return PathBuf::from("target/test-logs");
        }
    }
}

/// One line of a per-test log file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestLogEntry {
    pub timestamp: String,
    pub test_name: String,
    pub phase: TestPhase,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    pub duration_ms: u64,
}

struct TestLogger {
    test_name: String,
    started: Instant,
    file: Option<Mutex<std::fs::File>>,
}

impl TestLogger {
    fn for_test(test_name: &str) -> Self {
        let file = Self::create_log_file(test_name).ok().map(Mutex::new);
        let logger = Self {
            test_name: test_name.to_string(),
            started: Instant::now(),
            file,
        };
        logger.log(TestPhase::Setup, "TEST START", None);
        logger
    }

    fn create_log_file(test_name: &str) -> std::io::Result<std::fs::File> {
        let dir = test_log_dir();
        std::fs::create_dir_all(&dir)?;
        let safe_name = test_name.replace("::", "_").replace(['/', '\\'], "_");
        std::fs::File::create(dir.join(format!("{safe_name}.jsonl")))
    }

    fn log(&self, phase: TestPhase, message: &str, data: Option<serde_json::Value>) {
        let entry = TestLogEntry {
            timestamp: chrono::Utc::now().to_rfc3339(),
            test_name: self.test_name.clone(),
            phase,
            message: message.to_string(),
            data,
            duration_ms: self.started.elapsed().as_millis() as u64,
        };

        if let Some(file) = &self.file
            && let Ok(json) = serde_json::to_string(&entry)
        {
            let mut file = file.lock().unwrap_or_else(PoisonError::into_inner);
            let _ = writeln!(file, "{json}");
        }

        tracing::info!(
            test = %self.test_name,
            phase = %entry.phase,
            duration_ms = entry.duration_ms,
            "{}",
            entry.message
        );
    }
}

/// Logs TEST START on creation and TEST PASS / TEST FAIL when dropped.
///
/// A no-op unless test logging is enabled.
pub struct TestGuard {
    inner: Option<TestLogger>,
}

impl TestGuard {
    pub fn new(test_name: &str) -> Self {
        let inner = Self::is_enabled().then(|| {
            init_global_test_logging();
            TestLogger::for_test(test_name)
        });
        Self { inner }
    }

    /// `SUTRUN_TEST_LOGGING=1|true` enables, `0|false` disables, otherwise
    /// enabled only when `CI` is set.
    pub fn is_enabled() -> bool {
        match std::env::var("SUTRUN_TEST_LOGGING").as_deref() {
            Ok("1" | "true") => true,
            Ok("0" | "false") => false,
            _ => std::env::var("CI").is_ok(),
        }
    }

    pub fn log(&self, phase: TestPhase, message: impl Into<String>) {
        if let Some(logger) = &self.inner {
            logger.log(phase, &message.into(), None);
        }
    }

    pub fn log_with_data(&self, phase: TestPhase, message: impl Into<String>, data: serde_json::Value) {
        if let Some(logger) = &self.inner {
            logger.log(phase, &message.into(), Some(data));
        }
    }
}

impl Drop for TestGuard {
    fn drop(&mut self) {
        if let Some(logger) = self.inner.take() {
            if std::thread::panicking() {
                logger.log(
                    TestPhase::Verify,
                    "TEST FAIL",
                    Some(serde_json::json!({ "reason": "test panicked" })),
                );
            } else {
                logger.log(TestPhase::Verify, "TEST PASS", None);
            }
        }
    }
}

/// Create a [`TestGuard`] named after the enclosing function.
#[macro_export]
macro_rules! test_guard {
    () => {{
        fn _f() {}
        fn _type_name_of<T>(_: T) -> &'static str {
            std::any::type_name::<T>()
        }
        let name = _type_name_of(_f);
        let name = name.strip_suffix("::_f").unwrap_or(name);
        // async test bodies show up as closures
        let name = name.trim_end_matches("::{{closure}}");
        let name = name.rsplit("::").next().unwrap_or(name);
        $crate::testing::TestGuard::new(name)
    }};
}
