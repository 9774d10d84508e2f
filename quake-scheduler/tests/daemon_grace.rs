//! A scheduler that outlives the shutdown grace period is aborted.
#![cfg(unix)]

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use nix::sys::signal::{Signal, raise};
use quake_scheduler::Error;
use quake_scheduler::config::{DaemonSettings, ScheduleConfig};
use quake_scheduler::daemon::DaemonManager;
use quake_scheduler::scheduler::Scheduler;
use quake_scheduler::task::{FnRunner, TaskError, TaskOutput, TaskSpec};

#[tokio::test]
async fn stuck_task_exceeds_shutdown_grace() {
    let dir = tempfile::tempdir().unwrap();
    let grace = Duration::from_millis(200);
    let handle = DaemonManager::new(DaemonSettings {
        pid_file: Some(dir.path().join("quake.pid")),
        shutdown_grace: grace,
        ..Default::default()
    })
    .prepare()
    .unwrap();
    let pid_path = handle.pid_file().unwrap().to_path_buf();

    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();
    let runner = Arc::new(FnRunner::new(move |_spec: TaskSpec| {
        counter.fetch_add(1, Ordering::SeqCst);
        async {
            std::future::pending::<()>().await;
            Ok::<_, TaskError>(TaskOutput::default())
        }
    }));
    let config = ScheduleConfig {
        interval: Duration::from_millis(20),
        ..Default::default()
    };
    let scheduler = Arc::new(
        Scheduler::builder(config, runner)
            .cancellation_token(handle.cancellation_token())
            .build()
            .unwrap(),
    );

    let supervised = tokio::spawn(handle.supervise(
        scheduler,
        TaskSpec::new("fetch-usgs", Vec::<String>::new()),
    ));
    while calls.load(Ordering::SeqCst) == 0 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    raise(Signal::SIGTERM).unwrap();
    let err = tokio::time::timeout(Duration::from_secs(10), supervised)
        .await
        .unwrap()
        .unwrap()
        .unwrap_err();

    assert!(matches!(err, Error::ShutdownTimeout(d) if d == grace));
    assert!(!pid_path.exists());
}
