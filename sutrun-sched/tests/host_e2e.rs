//! Suites executed on the local host with real processes.

#![cfg(target_os = "linux")]

use std::sync::Arc;
use std::time::Duration;
use sutrun_common::events::{EventBus, drain_event_names};
use sutrun_common::reader::SummaryReader;
use sutrun_common::sut::Sut;
use sutrun_common::types::{Suite, Test};
use sutrun_common::{HostSut, RunnerConfig, test_guard};
use sutrun_sched::{Scheduler, SuiteScheduler};

fn config() -> RunnerConfig {
    RunnerConfig {
        exec_timeout_secs: 10.0,
        suite_timeout_secs: 60.0,
        ping_timeout_secs: 5.0,
        max_workers: 2,
        write_kmsg: false,
        reboot_retries: 2,
        ..RunnerConfig::default()
    }
}

async fn host_scheduler(config: &RunnerConfig) -> (Arc<HostSut>, SuiteScheduler, EventBus) {
    let sut = Arc::new(HostSut::new());
    sut.communicate(None).await.unwrap();
    let events = EventBus::default();
    let sched = SuiteScheduler::new(
        Arc::clone(&sut) as Arc<dyn Sut>,
        Arc::new(SummaryReader::new().unwrap()),
        config,
        events.clone(),
    );
    (sut, sched, events)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn host_suite_reads_results_from_real_commands() {
    let _guard = test_guard!();
    let (sut, sched, _) = host_scheduler(&config()).await;

    let tests = vec![
        Test::new("pass", "echo").with_args(["TPASS: fine"]),
        Test::new("fail", "sh").with_args(["-c", "'echo TFAIL: nope; exit 1'"]),
        Test::new("env", "sh")
            .with_args(["-c", "'test \"$SUTRUN_VALUE\" = yes'"])
            .with_env("SUTRUN_VALUE", "yes")
            .parallelizable(true),
        Test::new("skip", "sh").with_args(["-c", "'exit 32'"]),
    ];
    sched.schedule(vec![Suite::new("host", tests)]).await.unwrap();

    let result = &sched.results()[0];
    assert_eq!(result.tests.len(), 4);
    assert_eq!(result.result_for("pass").unwrap().passed, 1);
    assert_eq!(result.result_for("fail").unwrap().failed, 1);
    assert_eq!(result.result_for("env").unwrap().returncode, 0);
    assert_eq!(result.result_for("skip").unwrap().skipped, 1);
    assert!(!result.info.kernel.is_empty());

    sut.stop(None).await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn panic_marker_on_host_triggers_a_restart() {
    let _guard = test_guard!();
    let (sut, sched, events) = host_scheduler(&config()).await;
    let mut rx = events.subscribe();

    let tests = vec![
        Test::new("before", "echo").with_args(["TPASS"]),
        Test::new("panic", "echo").with_args(["'Kernel panic - not syncing: fake'"]),
        Test::new("after", "echo").with_args(["TPASS"]),
    ];
    tokio::time::timeout(
        Duration::from_secs(30),
        sched.schedule(vec![Suite::new("host-panic", tests)]),
    )
    .await
    .expect("suite should finish")
    .unwrap();

    let result = &sched.results()[0];
    assert_eq!(result.tests.len(), 3);
    assert_eq!(result.result_for("panic").unwrap().broken, 1);
    assert_eq!(result.result_for("after").unwrap().passed, 1);
    assert!(sut.is_running());

    let names = drain_event_names(&mut rx);
    assert!(names.iter().any(|n| n == "kernel_panic"));
    assert!(names.iter().any(|n| n == "sut_restart"));

    sut.stop(None).await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn missing_cwd_is_recorded_as_broken() {
    let _guard = test_guard!();
    let (sut, sched, _) = host_scheduler(&config()).await;

    let tests = vec![
        Test::new("badcwd", "echo")
            .with_args(["TPASS"])
            .with_cwd("/nonexistent/sutrun/dir"),
        Test::new("ok", "echo").with_args(["TPASS"]),
    ];
    sched.schedule(vec![Suite::new("cwd", tests)]).await.unwrap();

    let result = &sched.results()[0];
    let badcwd = result.result_for("badcwd").unwrap();
    assert_eq!(badcwd.broken, 1);
    assert_eq!(badcwd.returncode, -1);
    assert_eq!(result.result_for("ok").unwrap().passed, 1);
    // no reboot for a test that couldn't start
    assert!(sut.is_running());

    sut.stop(None).await.unwrap();
}
