//! Scriptable SUT for tests.
//!
//! [`MockSut`] runs no processes. Every command is matched against a table of
//! [`MockBehavior`]s keyed by the exact command line; unknown commands succeed
//! with empty output. The taint bitmask, communication failures and ping
//! responsiveness can be driven from the test.

use crate::errors::SutError;
use crate::sut::tainted::TAINTED_COMMAND;
use crate::sut::{OutputSink, Sut, TaintMonitor};
use crate::types::CommandOutput;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

/// Marker written to the sink when a behavior simulates a kernel panic.
pub const MOCK_PANIC_OUTPUT: &str = "Kernel panic - not syncing: mock\n";

/// How the mock answers one command.
#[derive(Debug, Clone, Default)]
pub struct MockBehavior {
    pub stdout: String,
    pub returncode: i32,
    pub delay: Duration,
    /// Remaining executions that end in a kernel panic.
    pub panics: u32,
    /// Bits OR-ed into the taint mask once the command completes.
    pub taint_after: Option<u64>,
    /// Never complete.
    pub hang: bool,
}

impl MockBehavior {
    pub fn output(stdout: impl Into<String>, returncode: i32) -> Self {
        Self {
            stdout: stdout.into(),
            returncode,
            ..Self::default()
        }
    }

    pub fn success() -> Self {
        Self::output("", 0)
    }

    pub fn kernel_panic() -> Self {
        Self {
            panics: u32::MAX,
            ..Self::default()
        }
    }

    pub fn kernel_panic_once() -> Self {
        Self {
            panics: 1,
            ..Self::default()
        }
    }

    pub fn hang() -> Self {
        Self {
            hang: true,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    #[must_use]
    pub fn with_taint(mut self, bits: u64) -> Self {
        self.taint_after = Some(bits);
        self
    }
}

/// In-memory SUT driven by [`MockBehavior`]s.
#[derive(Debug)]
pub struct MockSut {
    name: String,
    parallel: bool,
    running: AtomicBool,
    tainted: AtomicU64,
    unresponsive: AtomicBool,
    communicate_failures: AtomicU32,
    communicate_calls: AtomicU32,
    stop_calls: AtomicU32,
    active: AtomicUsize,
    max_active: AtomicUsize,
    behaviors: Mutex<HashMap<String, MockBehavior>>,
    files: Mutex<HashMap<String, Vec<u8>>>,
    commands: Mutex<Vec<String>>,
    taint: TaintMonitor,
}

impl Default for MockSut {
    fn default() -> Self {
        Self::new()
    }
}

impl MockSut {
    pub fn new() -> Self {
        Self {
            name: "mock".to_string(),
            parallel: true,
            running: AtomicBool::new(false),
            tainted: AtomicU64::new(0),
            unresponsive: AtomicBool::new(false),
            communicate_failures: AtomicU32::new(0),
            communicate_calls: AtomicU32::new(0),
            stop_calls: AtomicU32::new(0),
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
            behaviors: Mutex::new(HashMap::new()),
            files: Mutex::new(HashMap::new()),
            commands: Mutex::new(Vec::new()),
            taint: TaintMonitor::new(),
        }
    }

    /// Mock that reports it can't run commands concurrently.
    pub fn serial() -> Self {
        Self {
            parallel: false,
            ..Self::new()
        }
    }

    pub fn set_behavior(&self, command: impl Into<String>, behavior: MockBehavior) {
        lock(&self.behaviors).insert(command.into(), behavior);
    }

    pub fn set_file(&self, path: impl Into<String>, data: impl Into<Vec<u8>>) {
        lock(&self.files).insert(path.into(), data.into());
    }

    pub fn set_tainted(&self, code: u64) {
        self.tainted.store(code, Ordering::SeqCst);
    }

    /// Make `ping` hang forever.
    pub fn set_unresponsive(&self, unresponsive: bool) {
        self.unresponsive.store(unresponsive, Ordering::SeqCst);
    }

    /// Fail the next `count` calls to `communicate`.
    pub fn fail_communicate(&self, count: u32) {
        self.communicate_failures.store(count, Ordering::SeqCst);
    }

    pub fn communicate_calls(&self) -> u32 {
        self.communicate_calls.load(Ordering::SeqCst)
    }

    pub fn stop_calls(&self) -> u32 {
        self.stop_calls.load(Ordering::SeqCst)
    }

    /// Highest number of commands observed running at the same time.
    pub fn max_active(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    /// Every command executed so far, in start order.
    pub fn commands(&self) -> Vec<String> {
        lock(&self.commands).clone()
    }

    /// Take the behavior for `command`, consuming one scripted panic.
    fn next_behavior(&self, command: &str) -> MockBehavior {
        let mut behaviors = lock(&self.behaviors);
        match behaviors.get_mut(command) {
            Some(stored) => {
                let current = stored.clone();
                if stored.panics > 0 && stored.panics != u32::MAX {
                    stored.panics -= 1;
                }
                current
            }
            None if command == TAINTED_COMMAND => MockBehavior::output(
                format!("{}\n", self.tainted.load(Ordering::SeqCst)),
                0,
            ),
            None => MockBehavior::success(),
        }
    }
}

struct ActiveGuard<'a>(&'a AtomicUsize);

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl Sut for MockSut {
    fn name(&self) -> &str {
        &self.name
    }

    fn parallel_execution(&self) -> bool {
        self.parallel
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn taint_monitor(&self) -> &TaintMonitor {
        &self.taint
    }

    async fn ping(&self) -> Result<Duration, SutError> {
        if !self.is_running() {
            return Err(SutError::NotRunning);
        }
        if self.unresponsive.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        Ok(Duration::from_millis(1))
    }

    async fn communicate(&self, _sink: Option<&dyn OutputSink>) -> Result<(), SutError> {
        self.communicate_calls.fetch_add(1, Ordering::SeqCst);

        let failures = self.communicate_failures.load(Ordering::SeqCst);
        if failures > 0 {
            self.communicate_failures
                .store(failures - 1, Ordering::SeqCst);
            return Err(SutError::Communication("mock communication failure".into()));
        }

        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(SutError::AlreadyRunning);
        }
        Ok(())
    }

    async fn stop(&self, _sink: Option<&dyn OutputSink>) -> Result<(), SutError> {
        self.stop_calls.fetch_add(1, Ordering::SeqCst);
        // a stopped machine comes back with a clean kernel
        self.tainted.store(0, Ordering::SeqCst);
        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn run_command(
        &self,
        command: &str,
        _cwd: Option<&str>,
        _env: Option<&BTreeMap<String, String>>,
        sink: Option<&dyn OutputSink>,
    ) -> Result<CommandOutput, SutError> {
        if command.is_empty() {
            return Err(SutError::InvalidArgument("command is empty".into()));
        }
        if !self.is_running() {
            return Err(SutError::NotRunning);
        }

        lock(&self.commands).push(command.to_string());
        let behavior = self.next_behavior(command);
        let started = Instant::now();

        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(active, Ordering::SeqCst);
        let _active = ActiveGuard(&self.active);

        if !behavior.delay.is_zero() {
            tokio::time::sleep(behavior.delay).await;
        }
        if behavior.hang {
            std::future::pending::<()>().await;
        }

        if let Some(sink) = sink
            && !behavior.stdout.is_empty()
        {
            sink.write(&behavior.stdout);
        }

        if behavior.panics > 0 {
            if let Some(sink) = sink {
                sink.write(MOCK_PANIC_OUTPUT);
            }
            return Err(SutError::KernelPanic);
        }

        if let Some(bits) = behavior.taint_after {
            self.tainted.fetch_or(bits, Ordering::SeqCst);
        }

        Ok(CommandOutput {
            command: command.to_string(),
            stdout: behavior.stdout,
            returncode: behavior.returncode,
            exec_time: started.elapsed(),
        })
    }

    async fn fetch_file(&self, path: &str) -> Result<Vec<u8>, SutError> {
        if path.is_empty() {
            return Err(SutError::InvalidArgument("target path is empty".into()));
        }
        if !self.is_running() {
            return Err(SutError::NotRunning);
        }
        lock(&self.files)
            .get(path)
            .cloned()
            .ok_or_else(|| SutError::FileNotFound(path.to_string()))
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
