//! TestScheduler against the scriptable mock SUT.
//!
//! Covers worker caps, ordering of the sequential batch, fault escalation
//! after recording and cooperative stop.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use sutrun_common::events::{EventBus, drain_event_names};
use sutrun_common::mock::{MockBehavior, MockSut};
use sutrun_common::reader::{ResultReader, SummaryReader};
use sutrun_common::sut::Sut;
use sutrun_common::types::{Test, TestResult};
use sutrun_common::{FrameworkError, RunnerConfig, SchedulerError, test_guard};
use sutrun_sched::{Scheduler, TestScheduler};

fn config(max_workers: usize) -> RunnerConfig {
    RunnerConfig {
        exec_timeout_secs: 10.0,
        ping_timeout_secs: 1.0,
        max_workers,
        write_kmsg: false,
        ..RunnerConfig::default()
    }
}

async fn setup(sut: &Arc<MockSut>, config: &RunnerConfig) -> (TestScheduler, EventBus) {
    sut.communicate(None).await.unwrap();
    let events = EventBus::default();
    let sched = TestScheduler::new(
        Arc::clone(sut) as Arc<dyn Sut>,
        Arc::new(SummaryReader::new().unwrap()),
        config,
        events.clone(),
    );
    (sched, events)
}

fn names(sched: &TestScheduler) -> Vec<String> {
    sched.results().into_iter().map(|r| r.test.name).collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn parallel_panic_keeps_completed_siblings() {
    let _guard = test_guard!();
    let sut = Arc::new(MockSut::new());
    sut.set_behavior(
        "crash",
        MockBehavior::kernel_panic().with_delay(Duration::from_millis(300)),
    );
    for name in ["p1", "p2", "p3"] {
        sut.set_behavior(name, MockBehavior::output("TPASS: ok\n", 0));
    }
    let (sched, _) = setup(&sut, &config(4)).await;

    let tests = ["p1", "p2", "crash", "p3"]
        .into_iter()
        .map(|n| Test::new(n, n).parallelizable(true))
        .collect();
    let err = sched.schedule(tests).await.unwrap_err();

    assert!(matches!(err, SchedulerError::KernelPanic { ref test } if test == "crash"));
    let recorded: HashSet<_> = names(&sched).into_iter().collect();
    assert_eq!(
        recorded,
        HashSet::from(["p1", "p2", "p3", "crash"].map(String::from))
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn sequential_batch_preserves_input_order() {
    let _guard = test_guard!();
    let sut = Arc::new(MockSut::new());
    let order = ["s5", "s1", "s4", "s2", "s3"];
    for (i, name) in order.iter().enumerate() {
        // earlier tests take longer
        let delay = Duration::from_millis(10 * (order.len() - i) as u64);
        sut.set_behavior(*name, MockBehavior::output("TPASS\n", 0).with_delay(delay));
    }
    let (sched, _) = setup(&sut, &config(4)).await;

    sched
        .schedule(order.iter().map(|n| Test::new(*n, *n)).collect())
        .await
        .unwrap();

    assert_eq!(names(&sched), order.map(String::from).to_vec());
    assert_eq!(sut.max_active(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn parallel_batch_respects_worker_cap() {
    let _guard = test_guard!();
    let sut = Arc::new(MockSut::new());
    let tests: Vec<Test> = (0..6)
        .map(|i| {
            let name = format!("par{i}");
            sut.set_behavior(
                name.clone(),
                MockBehavior::output("TPASS\n", 0).with_delay(Duration::from_millis(100)),
            );
            Test::new(name.clone(), name).parallelizable(true)
        })
        .collect();
    let expected: HashSet<String> = tests.iter().map(|t| t.name.clone()).collect();
    let (sched, _) = setup(&sut, &config(2)).await;

    sched.schedule(tests).await.unwrap();

    assert_eq!(names(&sched).into_iter().collect::<HashSet<_>>(), expected);
    assert!(sut.max_active() <= 2, "max active {}", sut.max_active());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn parallelizable_tests_run_before_sequential_ones() {
    let _guard = test_guard!();
    let sut = Arc::new(MockSut::new());
    let (sched, _) = setup(&sut, &config(2)).await;

    sched
        .schedule(vec![
            Test::new("seq1", "seq1"),
            Test::new("par1", "par1").parallelizable(true),
            Test::new("seq2", "seq2"),
        ])
        .await
        .unwrap();

    assert_eq!(names(&sched), vec!["par1", "seq1", "seq2"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn force_parallel_ignores_the_flag() {
    let _guard = test_guard!();
    let sut = Arc::new(MockSut::new());
    for name in ["f1", "f2", "f3"] {
        sut.set_behavior(
            name,
            MockBehavior::success().with_delay(Duration::from_millis(200)),
        );
    }
    let config = RunnerConfig {
        force_parallel: true,
        ..config(3)
    };
    let (sched, _) = setup(&sut, &config).await;

    sched
        .schedule(["f1", "f2", "f3"].map(|n| Test::new(n, n)).to_vec())
        .await
        .unwrap();

    assert_eq!(sched.results().len(), 3);
    assert!(sut.max_active() > 1);
}

#[tokio::test]
async fn serial_sut_never_runs_commands_concurrently() {
    let _guard = test_guard!();
    let sut = Arc::new(MockSut::serial());
    for name in ["a", "b", "c"] {
        sut.set_behavior(
            name,
            MockBehavior::success().with_delay(Duration::from_millis(50)),
        );
    }
    let (sched, _) = setup(&sut, &config(8)).await;

    sched
        .schedule(["a", "b", "c"].map(|n| Test::new(n, n).parallelizable(true)).to_vec())
        .await
        .unwrap();

    assert_eq!(sut.max_active(), 1);
}

#[tokio::test]
async fn taint_change_is_recorded_then_raised() {
    let _guard = test_guard!();
    let sut = Arc::new(MockSut::new());
    sut.set_behavior(
        "warn01",
        MockBehavior::output("TPASS: but the kernel warned\n", 0).with_taint(1 << 9),
    );
    let (sched, events) = setup(&sut, &config(1)).await;
    let mut rx = events.subscribe();

    let err = sched
        .schedule(vec![Test::new("warn01", "warn01"), Test::new("after", "after")])
        .await
        .unwrap_err();

    match err {
        SchedulerError::KernelTainted { test, reasons } => {
            assert_eq!(test, "warn01");
            assert_eq!(reasons, vec!["kernel issued warning"]);
        }
        other => panic!("unexpected error: {other}"),
    }

    let results = sched.results();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].passed, 1);
    assert_eq!(results[0].returncode, 0);

    let names = drain_event_names(&mut rx);
    assert_eq!(
        names,
        vec!["test_started", "test_stdout", "kernel_tainted"]
    );
}

#[tokio::test]
async fn already_tainted_kernel_is_not_a_fault() {
    let _guard = test_guard!();
    let sut = Arc::new(MockSut::new());
    sut.set_tainted(1 << 12);
    let (sched, _) = setup(&sut, &config(1)).await;

    sched.schedule(vec![Test::new("oot", "oot")]).await.unwrap();
    assert_eq!(sched.results()[0].passed, 1);
}

#[tokio::test]
async fn completed_test_emits_lifecycle_events_in_order() {
    let _guard = test_guard!();
    let sut = Arc::new(MockSut::new());
    sut.set_behavior("chatty", MockBehavior::output("TPASS: hello\n", 0));
    let (sched, events) = setup(&sut, &config(1)).await;
    let mut rx = events.subscribe();

    sched.schedule(vec![Test::new("chatty", "chatty")]).await.unwrap();

    assert_eq!(
        drain_event_names(&mut rx),
        vec!["test_started", "test_stdout", "test_completed"]
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn stop_cancels_running_tests() {
    let _guard = test_guard!();
    let sut = Arc::new(MockSut::new());
    sut.set_behavior("hang1", MockBehavior::hang());
    sut.set_behavior("hang2", MockBehavior::hang());
    let (sched, _) = setup(&sut, &config(2)).await;
    let sched = Arc::new(sched);

    let runner = Arc::clone(&sched);
    let task = tokio::spawn(async move {
        runner
            .schedule(vec![
                Test::new("hang1", "hang1").parallelizable(true),
                Test::new("hang2", "hang2"),
            ])
            .await
    });

    tokio::time::sleep(Duration::from_millis(200)).await;
    tokio::time::timeout(Duration::from_secs(5), sched.stop())
        .await
        .expect("stop should not hang");

    let outcome = tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .unwrap()
        .unwrap();
    assert!(outcome.is_ok());
    assert!(sched.stopped());
    assert!(sched.results().is_empty());
    // the sequential test never started
    assert!(!sut.commands().iter().any(|c| c == "hang2"));
}

#[tokio::test]
async fn sut_errors_are_fatal() {
    let _guard = test_guard!();
    let sut = Arc::new(MockSut::new());
    let sched = TestScheduler::new(
        Arc::clone(&sut) as Arc<dyn Sut>,
        Arc::new(SummaryReader::new().unwrap()),
        &config(1),
        EventBus::default(),
    );

    let err = sched.schedule(vec![Test::new("a", "a")]).await.unwrap_err();
    assert!(matches!(err, SchedulerError::Sut(_)));
    assert!(!err.is_kernel_fault());
}

#[tokio::test]
async fn command_that_cannot_start_is_recorded_and_batch_continues() {
    let _guard = test_guard!();
    let sut = Arc::new(MockSut::new());
    let (sched, events) = setup(&sut, &config(1)).await;
    let mut rx = events.subscribe();

    sched
        .schedule(vec![Test::new("blank", ""), Test::new("next", "next")])
        .await
        .unwrap();

    let results = sched.results();
    assert_eq!(names(&sched), vec!["blank", "next"]);
    assert_eq!(results[0].broken, 1);
    assert_eq!(results[0].returncode, -1);
    assert_eq!(results[1].passed, 1);

    let completed = drain_event_names(&mut rx)
        .into_iter()
        .filter(|n| n == "test_completed")
        .count();
    assert_eq!(completed, 2);
}

struct RejectingReader;

impl ResultReader for RejectingReader {
    fn read_result(
        &self,
        test: &Test,
        _stdout: &str,
        _returncode: i32,
        _exec_time: Duration,
    ) -> Result<TestResult, FrameworkError> {
        Err(FrameworkError::InvalidData {
            test: test.name.clone(),
            reason: "unreadable".into(),
        })
    }
}

#[tokio::test]
async fn unreadable_output_is_recorded_as_broken() {
    let _guard = test_guard!();
    let sut = Arc::new(MockSut::new());
    sut.set_behavior("odd", MockBehavior::output("garbage\n", 0));
    sut.communicate(None).await.unwrap();
    let sched = TestScheduler::new(
        Arc::clone(&sut) as Arc<dyn Sut>,
        Arc::new(RejectingReader),
        &config(1),
        EventBus::default(),
    );

    sched
        .schedule(vec![Test::new("odd", "odd"), Test::new("next", "next")])
        .await
        .unwrap();

    let results = sched.results();
    assert_eq!(results.len(), 2);
    assert_eq!(results[0].broken, 1);
    assert_eq!(results[0].stdout, "garbage\n");
}
