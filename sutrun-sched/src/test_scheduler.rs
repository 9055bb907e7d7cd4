//! Runs tests on a SUT while watching kernel health.
//!
//! Parallelizable tests run first under a worker cap, then the remaining tests
//! one at a time in input order. Every attempt is recorded as a
//! [`TestResult`] before a kernel fault (panic, taint, unresponsive SUT)
//! aborts the batch.

use crate::scheduler::Scheduler;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use sutrun_common::events::{Event, EventBus};
use sutrun_common::reader::ResultReader;
use sutrun_common::sut::{OutputSink, Sut};
use sutrun_common::types::{BROKEN_RETURNCODE, Test, TestResult};
use sutrun_common::{RunnerConfig, SchedulerError, SutError, mask_sensitive_command};
use tokio::sync::{Semaphore, watch};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

type Results = Arc<Mutex<Vec<TestResult>>>;

/// Classification of a single test attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
enum TestStatus {
    Ok,
    TestTimeout,
    /// The command couldn't run at all, e.g. a missing cwd.
    CommandFailed,
    KernelPanic,
    KernelTainted(Vec<String>),
    KernelTimeout,
}

/// Forwards test stdout to the event bus and keeps a copy.
struct TestStdout {
    test: String,
    events: EventBus,
    buffer: Mutex<String>,
}

impl TestStdout {
    fn new(test: &str, events: &EventBus) -> Self {
        Self {
            test: test.to_string(),
            events: events.clone(),
            buffer: Mutex::new(String::new()),
        }
    }

    fn contents(&self) -> String {
        self.buffer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl OutputSink for TestStdout {
    fn write(&self, data: &str) {
        self.buffer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_str(data);
        self.events.emit(&Event::TestStdout {
            test: self.test.clone(),
            data: data.to_string(),
        });
    }
}

/// Everything a test task needs, shared by all tasks of one `schedule` call.
struct RunContext {
    sut: Arc<dyn Sut>,
    reader: Arc<dyn ResultReader>,
    events: EventBus,
    exec_timeout: Duration,
    ping_timeout: Duration,
    write_kmsg: bool,
    stop: Arc<AtomicBool>,
    results: Results,
}

impl RunContext {
    async fn taint_code(&self) -> Result<(u64, Vec<String>), SutError> {
        let status = self.sut.get_tainted_info().await?;
        if status.is_tainted() {
            debug!(code = status.code, reasons = ?status.reasons, "Kernel is tainted");
        }
        Ok((status.code, status.reasons))
    }

    /// Mark the test start in the kernel log when running as root.
    async fn write_kmsg(&self, test: &Test) {
        let write = async {
            let user = self.sut.run_command("id -u", None, None, None).await?;
            if user.stdout != "0\n" {
                debug!("Can't write on /dev/kmsg from user");
                return Ok::<(), SutError>(());
            }

            let message = format!(
                "{}[{}]: starting test {} ({})\n",
                program_name(),
                std::process::id(),
                test.name,
                test.full_command()
            );
            let command = format!("printf '%s' {} > /dev/kmsg", shell_quote(&message));
            self.sut.run_command(&command, None, None, None).await?;
            Ok(())
        };

        match tokio::time::timeout(self.ping_timeout, write).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => debug!(test = %test.name, "Failed to write on /dev/kmsg: {}", err),
            Err(_) => debug!(test = %test.name, "Timed out writing on /dev/kmsg"),
        }
    }

    async fn run_test(self: Arc<Self>, test: Test, sem: Arc<Semaphore>) -> Result<(), SchedulerError> {
        let _permit = sem
            .acquire_owned()
            .await
            .map_err(|_| SchedulerError::Task("worker semaphore closed".into()))?;

        if self.stop.load(Ordering::SeqCst) {
            return Ok(());
        }

        let command = test.full_command();
        info!(test = %test.name, command = %mask_sensitive_command(&command), "Running test");
        self.events.emit(&Event::TestStarted { test: test.clone() });

        if self.write_kmsg {
            self.write_kmsg(&test).await;
        }

        let sink = TestStdout::new(&test.name, &self.events);
        let started = Instant::now();
        let (taint_before, _) = self.taint_code().await?;

        let run = self.sut.run_command(
            &command,
            test.cwd.as_deref(),
            Some(&test.env),
            Some(&sink),
        );

        // session errors are raised once the attempt is recorded
        let mut failure = None;

        let (status, output) = match tokio::time::timeout(self.exec_timeout, run).await {
            Ok(Ok(output)) => match self.taint_code().await {
                Ok((taint_after, _)) if taint_after == taint_before => (TestStatus::Ok, Some(output)),
                Ok((_, reasons)) => {
                    info!(test = %test.name, ?reasons, "Recognised kernel tainted");
                    (TestStatus::KernelTainted(reasons), Some(output))
                }
                Err(err) => {
                    failure = Some(err);
                    (TestStatus::Ok, Some(output))
                }
            },
            Ok(Err(err)) if err.is_kernel_panic() => {
                info!(test = %test.name, "Recognised kernel panic");
                (TestStatus::KernelPanic, None)
            }
            Ok(Err(err)) if err.is_command_failure() => {
                warn!(test = %test.name, "Test command failed: {}", err);
                (TestStatus::CommandFailed, None)
            }
            Ok(Err(err)) => {
                failure = Some(err);
                (TestStatus::CommandFailed, None)
            }
            Err(_) => {
                info!(test = %test.name, "Test timed out, checking if SUT is still replying");
                match tokio::time::timeout(self.ping_timeout, self.sut.ping()).await {
                    Ok(Ok(latency)) => {
                        info!(latency_ms = latency.as_millis() as u64, "SUT replied");
                        (TestStatus::TestTimeout, None)
                    }
                    Ok(Err(err)) => {
                        warn!("SUT ping failed: {}", err);
                        (TestStatus::KernelTimeout, None)
                    }
                    Err(_) => {
                        warn!("SUT is not replying");
                        (TestStatus::KernelTimeout, None)
                    }
                }
            }
        };

        let (stdout, returncode, exec_time) = match output {
            Some(output) => (output.stdout, output.returncode, output.exec_time),
            None => (sink.contents(), BROKEN_RETURNCODE, started.elapsed()),
        };

        let result = match self.reader.read_result(&test, &stdout, returncode, exec_time) {
            Ok(result) => result,
            Err(err) => {
                warn!(test = %test.name, "Can't read test result: {}", err);
                TestResult::broken(&test, stdout, exec_time)
            }
        };
        debug!(test = %test.name, ?status, returncode, "Recording result");
        self.results
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(result.clone());

        if let Some(err) = failure {
            warn!(test = %test.name, "SUT failed while running test: {}", err);
            return Err(err.into());
        }

        // faults are raised only after the result is safely recorded
        match status {
            TestStatus::KernelTainted(reasons) => {
                self.events.emit(&Event::KernelTainted {
                    reasons: reasons.clone(),
                });
                Err(SchedulerError::KernelTainted {
                    test: test.name,
                    reasons,
                })
            }
            TestStatus::KernelPanic => {
                self.events.emit(&Event::KernelPanic);
                Err(SchedulerError::KernelPanic { test: test.name })
            }
            TestStatus::KernelTimeout => {
                self.events.emit(&Event::SutNotResponding);
                Err(SchedulerError::KernelTimeout { test: test.name })
            }
            TestStatus::Ok | TestStatus::TestTimeout | TestStatus::CommandFailed => {
                info!(test = %test.name, "Test completed");
                self.events.emit(&Event::TestCompleted { result });
                Ok(())
            }
        }
    }
}

/// Schedules single tests on a SUT.
pub struct TestScheduler {
    sut: Arc<dyn Sut>,
    reader: Arc<dyn ResultReader>,
    events: EventBus,
    exec_timeout: Duration,
    ping_timeout: Duration,
    max_workers: usize,
    force_parallel: bool,
    write_kmsg: bool,
    lock: tokio::sync::Mutex<()>,
    stop: Arc<AtomicBool>,
    stop_tx: watch::Sender<bool>,
    stopped: AtomicBool,
    results: Mutex<Results>,
}

impl TestScheduler {
    pub fn new(
        sut: Arc<dyn Sut>,
        reader: Arc<dyn ResultReader>,
        config: &RunnerConfig,
        events: EventBus,
    ) -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self {
            sut,
            reader,
            events,
            exec_timeout: config.exec_timeout(),
            ping_timeout: config.ping_timeout(),
            max_workers: config.max_workers.max(1),
            force_parallel: config.force_parallel,
            write_kmsg: config.write_kmsg,
            lock: tokio::sync::Mutex::new(()),
            stop: Arc::new(AtomicBool::new(false)),
            stop_tx,
            stopped: AtomicBool::new(false),
            results: Mutex::new(Arc::new(Mutex::new(Vec::new()))),
        }
    }

    /// Effective worker count: a SUT that can't run commands concurrently
    /// gets a single worker.
    pub fn workers(&self) -> usize {
        if self.sut.parallel_execution() {
            self.max_workers
        } else {
            1
        }
    }

    async fn run_parallel(
        &self,
        ctx: &Arc<RunContext>,
        tests: Vec<Test>,
        stop_rx: &mut watch::Receiver<bool>,
    ) -> Result<(), SchedulerError> {
        if tests.is_empty() {
            return Ok(());
        }

        let workers = self.workers();
        info!(tests = tests.len(), workers, "Scheduling tests in parallel");

        let sem = Arc::new(Semaphore::new(workers));
        let mut tasks = JoinSet::new();
        for test in tests {
            tasks.spawn(Arc::clone(ctx).run_test(test, Arc::clone(&sem)));
        }
        drive(tasks, stop_rx).await
    }

    async fn run_sequential(
        &self,
        ctx: &Arc<RunContext>,
        tests: Vec<Test>,
        stop_rx: &mut watch::Receiver<bool>,
    ) -> Result<(), SchedulerError> {
        if tests.is_empty() {
            return Ok(());
        }

        info!(tests = tests.len(), "Scheduling tests on a single worker");

        let sem = Arc::new(Semaphore::new(1));
        for test in tests {
            if self.stop.load(Ordering::SeqCst) {
                break;
            }
            let mut tasks = JoinSet::new();
            tasks.spawn(Arc::clone(ctx).run_test(test, Arc::clone(&sem)));
            drive(tasks, stop_rx).await?;
        }
        Ok(())
    }
}

/// Wait for every task in `tasks`. The first failure, or a stop request,
/// aborts the remaining tasks and waits for them to unwind.
async fn drive(
    mut tasks: JoinSet<Result<(), SchedulerError>>,
    stop_rx: &mut watch::Receiver<bool>,
) -> Result<(), SchedulerError> {
    loop {
        tokio::select! {
            () = stop_requested(stop_rx) => {
                debug!(tasks = tasks.len(), "Stop requested, cancelling tasks");
                cancel(&mut tasks).await;
                return Ok(());
            }
            joined = tasks.join_next() => match joined {
                None => return Ok(()),
                Some(Ok(Ok(()))) => {}
                Some(Ok(Err(err))) => {
                    info!(tasks = tasks.len(), "{} caught, cancelling tasks", err);
                    cancel(&mut tasks).await;
                    return Err(err);
                }
                Some(Err(err)) if err.is_cancelled() => {}
                Some(Err(err)) => {
                    cancel(&mut tasks).await;
                    return Err(SchedulerError::Task(err.to_string()));
                }
            }
        }
    }
}

async fn cancel(tasks: &mut JoinSet<Result<(), SchedulerError>>) {
    tasks.abort_all();
    while tasks.join_next().await.is_some() {}
}

async fn stop_requested(rx: &mut watch::Receiver<bool>) {
    loop {
        let stop = *rx.borrow_and_update();
        if stop {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

fn program_name() -> String {
    std::env::args()
        .next()
        .as_deref()
        .and_then(|arg0| std::path::Path::new(arg0).file_name())
        .and_then(|name| name.to_str())
        .unwrap_or("sutrun")
        .to_string()
}

fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

#[async_trait]
impl Scheduler for TestScheduler {
    type Job = Test;
    type Output = TestResult;

    fn results(&self) -> Vec<TestResult> {
        let current = Arc::clone(&self.results.lock().unwrap_or_else(PoisonError::into_inner));
        let results = current.lock().unwrap_or_else(PoisonError::into_inner).clone();
        results
    }

    fn stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    async fn stop(&self) {
        if self.lock.try_lock().is_ok() {
            return;
        }

        info!("Stopping tests execution");
        self.stop.store(true, Ordering::SeqCst);
        self.stop_tx.send_replace(true);

        let _guard = self.lock.lock().await;

        self.stop.store(false, Ordering::SeqCst);
        self.stop_tx.send_replace(false);
        self.stopped.store(true, Ordering::SeqCst);
        info!("Tests execution has stopped");
    }

    async fn schedule(&self, jobs: Vec<Test>) -> Result<(), SchedulerError> {
        if jobs.is_empty() {
            return Err(SchedulerError::InvalidArgument("jobs list is empty".into()));
        }

        let _guard = self.lock.lock().await;
        self.stopped.store(false, Ordering::SeqCst);

        let ctx = Arc::new(RunContext {
            sut: Arc::clone(&self.sut),
            reader: Arc::clone(&self.reader),
            events: self.events.clone(),
            exec_timeout: self.exec_timeout,
            ping_timeout: self.ping_timeout,
            write_kmsg: self.write_kmsg,
            stop: Arc::clone(&self.stop),
            results: Arc::new(Mutex::new(Vec::new())),
        });
        *self.results.lock().unwrap_or_else(PoisonError::into_inner) = Arc::clone(&ctx.results);

        let (parallel, sequential): (Vec<Test>, Vec<Test>) = if self.force_parallel {
            (jobs, Vec::new())
        } else {
            jobs.into_iter().partition(|test| test.parallelizable)
        };

        let mut stop_rx = self.stop_tx.subscribe();
        let outcome = match self.run_parallel(&ctx, parallel, &mut stop_rx).await {
            Ok(()) => self.run_sequential(&ctx, sequential, &mut stop_rx).await,
            Err(err) => Err(err),
        };

        match outcome {
            Err(err) if self.stop.load(Ordering::SeqCst) => {
                debug!("Ignoring {} raised while stopping", err);
                Ok(())
            }
            Err(err) => {
                warn!("Tests execution aborted: {}", err);
                Err(err)
            }
            Ok(()) => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sutrun_common::mock::{MockBehavior, MockSut};
    use sutrun_common::reader::SummaryReader;

    fn config() -> RunnerConfig {
        RunnerConfig {
            exec_timeout_secs: 5.0,
            ping_timeout_secs: 0.5,
            max_workers: 4,
            write_kmsg: false,
            ..RunnerConfig::default()
        }
    }

    async fn scheduler(sut: Arc<MockSut>, config: &RunnerConfig) -> TestScheduler {
        sut.communicate(None).await.unwrap();
        TestScheduler::new(
            sut,
            Arc::new(SummaryReader::new().unwrap()),
            config,
            EventBus::default(),
        )
    }

    #[tokio::test]
    async fn empty_batch_is_rejected() {
        let sched = scheduler(Arc::new(MockSut::new()), &config()).await;
        assert!(matches!(
            sched.schedule(Vec::new()).await,
            Err(SchedulerError::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn results_are_recorded_and_reset_per_call() {
        let sut = Arc::new(MockSut::new());
        sut.set_behavior("ok01", MockBehavior::output("TPASS: fine\n", 0));
        let sched = scheduler(Arc::clone(&sut), &config()).await;

        sched.schedule(vec![Test::new("ok01", "ok01")]).await.unwrap();
        assert_eq!(sched.results().len(), 1);
        assert_eq!(sched.results()[0].passed, 1);

        sched.schedule(vec![Test::new("ok02", "ok02")]).await.unwrap();
        let names: Vec<_> = sched.results().into_iter().map(|r| r.test.name).collect();
        assert_eq!(names, vec!["ok02"]);
    }

    #[tokio::test]
    async fn timeout_with_live_sut_records_broken_result() {
        let sut = Arc::new(MockSut::new());
        sut.set_behavior("slow", MockBehavior::output("TINFO\n", 0).with_delay(Duration::from_secs(30)));
        let config = RunnerConfig {
            exec_timeout_secs: 0.1,
            ..config()
        };
        let sched = scheduler(Arc::clone(&sut), &config).await;

        sched.schedule(vec![Test::new("slow", "slow")]).await.unwrap();

        let result = &sched.results()[0];
        assert_eq!(result.returncode, BROKEN_RETURNCODE);
        assert_eq!(result.broken, 1);
    }

    #[tokio::test]
    async fn unresponsive_sut_after_timeout_is_kernel_timeout() {
        let sut = Arc::new(MockSut::new());
        sut.set_behavior("hang", MockBehavior::hang());
        sut.set_unresponsive(true);
        let config = RunnerConfig {
            exec_timeout_secs: 0.1,
            ping_timeout_secs: 0.1,
            ..config()
        };
        let sched = scheduler(Arc::clone(&sut), &config).await;

        let err = sched.schedule(vec![Test::new("hang", "hang")]).await.unwrap_err();

        assert!(matches!(err, SchedulerError::KernelTimeout { ref test } if test == "hang"));
        assert_eq!(sched.results().len(), 1);
    }

    #[tokio::test]
    async fn panic_output_is_taken_from_the_stream() {
        let sut = Arc::new(MockSut::new());
        sut.set_behavior(
            "crash",
            MockBehavior {
                stdout: "TINFO: about to crash\n".into(),
                ..MockBehavior::kernel_panic()
            },
        );
        let sched = scheduler(Arc::clone(&sut), &config()).await;

        let err = sched.schedule(vec![Test::new("crash", "crash")]).await.unwrap_err();

        assert!(err.is_kernel_fault());
        let result = &sched.results()[0];
        assert!(result.stdout.contains("about to crash"));
        assert!(result.stdout.contains("Kernel panic"));
        assert_eq!(result.broken, 1);
    }

    #[tokio::test]
    async fn serial_sut_gets_one_worker() {
        let sut = Arc::new(MockSut::serial());
        let sched = scheduler(Arc::clone(&sut), &config()).await;
        assert_eq!(sched.workers(), 1);

        let sut = Arc::new(MockSut::new());
        let sched = scheduler(sut, &config()).await;
        assert_eq!(sched.workers(), 4);
    }

    #[tokio::test]
    async fn stop_when_idle_is_noop() {
        let sched = scheduler(Arc::new(MockSut::new()), &config()).await;
        sched.stop().await;
        assert!(!sched.stopped());
    }

    #[tokio::test]
    async fn kmsg_is_written_only_as_root() {
        let sut = Arc::new(MockSut::new());
        let config = RunnerConfig {
            write_kmsg: true,
            ..config()
        };
        let sched = scheduler(Arc::clone(&sut), &config).await;

        sched.schedule(vec![Test::new("user", "true")]).await.unwrap();
        assert!(!sut.commands().iter().any(|c| c.contains("/dev/kmsg")));

        sut.set_behavior("id -u", MockBehavior::output("0\n", 0));
        sched.schedule(vec![Test::new("root", "true")]).await.unwrap();
        let kmsg: Vec<_> = sut
            .commands()
            .into_iter()
            .filter(|c| c.ends_with("> /dev/kmsg"))
            .collect();
        assert_eq!(kmsg.len(), 1);
        assert!(kmsg[0].contains("starting test root (true)"));
    }

    #[test]
    fn shell_quote_escapes_single_quotes() {
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
        assert_eq!(shell_quote("plain"), "'plain'");
    }
}
