//! Runs whole suites, rebooting the SUT when the kernel breaks.
//!
//! A kernel fault only costs the tests that had not produced a result yet:
//! after the reboot the outstanding tests are recomputed by name and
//! scheduled again, until the suite deadline expires.

use crate::scheduler::Scheduler;
use crate::test_scheduler::TestScheduler;
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use sutrun_common::events::{Event, EventBus};
use sutrun_common::reader::ResultReader;
use sutrun_common::sut::{OutputSink, Sut};
use sutrun_common::types::{Suite, SuiteResult, Test, TestResult};
use sutrun_common::{RunnerConfig, SchedulerError, SutError};
use tracing::{debug, info, warn};

/// Far enough in the future to never fire.
const NO_DEADLINE: Duration = Duration::from_secs(100 * 365 * 24 * 3600);

/// How long `stop` waits for the suite loop before poking the inner
/// scheduler again.
const STOP_POLL: Duration = Duration::from_millis(100);

/// Forwards SUT output produced while rebooting to the event bus.
struct SutStdout {
    sut: String,
    events: EventBus,
}

impl OutputSink for SutStdout {
    fn write(&self, data: &str) {
        self.events.emit(&Event::SutStdout {
            sut: self.sut.clone(),
            data: data.to_string(),
        });
    }
}

/// Schedules suites on top of a test scheduler.
pub struct SuiteScheduler<S = TestScheduler> {
    sut: Arc<dyn Sut>,
    inner: S,
    events: EventBus,
    suite_timeout: Duration,
    reboot_retries: u32,
    lock: tokio::sync::Mutex<()>,
    stop: AtomicBool,
    stopped: AtomicBool,
    results: Mutex<Vec<SuiteResult>>,
}

impl SuiteScheduler<TestScheduler> {
    pub fn new(
        sut: Arc<dyn Sut>,
        reader: Arc<dyn ResultReader>,
        config: &RunnerConfig,
        events: EventBus,
    ) -> Self {
        let inner = TestScheduler::new(Arc::clone(&sut), reader, config, events.clone());
        Self::with_scheduler(sut, inner, config, events)
    }
}

impl<S> SuiteScheduler<S>
where
    S: Scheduler<Job = Test, Output = TestResult>,
{
    /// Wrap an existing test scheduler.
    pub fn with_scheduler(sut: Arc<dyn Sut>, inner: S, config: &RunnerConfig, events: EventBus) -> Self {
        Self {
            sut,
            inner,
            events,
            suite_timeout: config.suite_timeout(),
            reboot_retries: config.reboot_retries.max(1),
            lock: tokio::sync::Mutex::new(()),
            stop: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            results: Mutex::new(Vec::new()),
        }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    async fn restart_sut(&self) -> Result<(), SutError> {
        info!(sut = self.sut.name(), "Rebooting SUT");
        self.events.emit(&Event::SutRestart {
            sut: self.sut.name().to_string(),
        });

        let sink = SutStdout {
            sut: self.sut.name().to_string(),
            events: self.events.clone(),
        };

        self.inner.stop().await;
        self.sut.stop(Some(&sink)).await?;
        self.sut
            .ensure_communicate(Some(&sink), self.reboot_retries)
            .await?;

        info!(sut = self.sut.name(), "SUT rebooted");
        Ok(())
    }

    async fn run_suite(&self, suite: &Suite) -> Result<(), SchedulerError> {
        info!(suite = %suite.name, tests = suite.tests.len(), "Running suite");
        self.events.emit(&Event::SuiteStarted {
            suite: suite.name.clone(),
            tests: suite.tests.len(),
        });

        let info = self.sut.get_info().await;
        let started = Instant::now();
        let now = tokio::time::Instant::now();
        let deadline = now
            .checked_add(self.suite_timeout)
            .unwrap_or_else(|| now + NO_DEADLINE);

        let mut recorded: Vec<TestResult> = Vec::new();
        let mut outstanding = suite.tests.clone();
        let mut failure = None;

        while !self.stop.load(Ordering::SeqCst) && !outstanding.is_empty() {
            let run = tokio::time::timeout_at(deadline, self.inner.schedule(outstanding.clone())).await;

            merge_results(suite, &mut recorded, self.inner.results());
            outstanding = remaining_tests(suite, &recorded);

            match run {
                Ok(Ok(())) => break,
                Ok(Err(err)) if err.is_kernel_fault() => {
                    warn!(suite = %suite.name, outstanding = outstanding.len(), "{}", err);
                    if self.stop.load(Ordering::SeqCst) {
                        break;
                    }
                    if let Err(err) = self.restart_sut().await {
                        warn!(suite = %suite.name, "SUT didn't come back: {}", err);
                        failure = Some(SchedulerError::Sut(err));
                        break;
                    }
                }
                Ok(Err(err)) => {
                    warn!(suite = %suite.name, "Suite aborted: {}", err);
                    failure = Some(err);
                    break;
                }
                Err(_) => {
                    info!(suite = %suite.name, skipped = outstanding.len(), "Testing suite timed out");
                    self.events.emit(&Event::SuiteTimeout {
                        suite: suite.name.clone(),
                        timeout_secs: self.suite_timeout.as_secs_f64(),
                    });
                    recorded.extend(outstanding.drain(..).map(|test| TestResult::skipped_by_timeout(&test)));
                    break;
                }
            }
        }

        let exec_time = started.elapsed();
        let result = SuiteResult {
            suite: suite.clone(),
            tests: recorded,
            info,
            exec_time,
        };

        info!(
            suite = %suite.name,
            passed = result.passed(),
            failed = result.failed(),
            broken = result.broken(),
            skipped = result.skipped(),
            warnings = result.warnings(),
            "Suite completed"
        );
        self.events.emit(&Event::SuiteCompleted {
            result: result.clone(),
            exec_time_secs: exec_time.as_secs_f64(),
        });
        self.results
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(result);

        match failure {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

/// Append results of `suite` tests that are not recorded yet.
fn merge_results(suite: &Suite, recorded: &mut Vec<TestResult>, latest: Vec<TestResult>) {
    let wanted: HashSet<&str> = suite.tests.iter().map(|t| t.name.as_str()).collect();
    let mut seen: HashSet<String> = recorded.iter().map(|r| r.test.name.clone()).collect();

    for result in latest {
        if !wanted.contains(result.test.name.as_str()) {
            debug!(test = %result.test.name, "Dropping result of a test outside the suite");
            continue;
        }
        if seen.insert(result.test.name.clone()) {
            recorded.push(result);
        }
    }
}

/// Suite tests without a recorded result, in suite order.
fn remaining_tests(suite: &Suite, recorded: &[TestResult]) -> Vec<Test> {
    let done: HashSet<&str> = recorded.iter().map(|r| r.test.name.as_str()).collect();
    suite
        .tests
        .iter()
        .filter(|t| !done.contains(t.name.as_str()))
        .cloned()
        .collect()
}

#[async_trait]
impl<S> Scheduler for SuiteScheduler<S>
where
    S: Scheduler<Job = Test, Output = TestResult>,
{
    type Job = Suite;
    type Output = SuiteResult;

    fn results(&self) -> Vec<SuiteResult> {
        self.results
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    async fn stop(&self) {
        if self.lock.try_lock().is_ok() {
            return;
        }

        info!("Stopping suites execution");
        self.stop.store(true, Ordering::SeqCst);

        // the suite loop may start a new inner run right after we stopped the
        // previous one, so keep stopping until the loop is gone
        loop {
            self.inner.stop().await;
            if let Ok(_guard) = tokio::time::timeout(STOP_POLL, self.lock.lock()).await {
                break;
            }
        }

        self.stop.store(false, Ordering::SeqCst);
        self.stopped.store(true, Ordering::SeqCst);
        info!("Suites execution has stopped");
    }

    async fn schedule(&self, jobs: Vec<Suite>) -> Result<(), SchedulerError> {
        if jobs.is_empty() {
            return Err(SchedulerError::InvalidArgument("jobs list is empty".into()));
        }
        for suite in &jobs {
            if let Some(name) = suite.duplicate_test() {
                return Err(SchedulerError::InvalidArgument(format!(
                    "suite '{}' has duplicate test '{}'",
                    suite.name, name
                )));
            }
        }

        let _guard = self.lock.lock().await;
        self.stopped.store(false, Ordering::SeqCst);
        self.results
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();

        for suite in &jobs {
            if self.stop.load(Ordering::SeqCst) {
                break;
            }
            self.run_suite(suite).await?;
        }

        Ok(())
    }
}
