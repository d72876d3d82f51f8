use anyhow::Result;
use async_trait::async_trait;
use isoforge::core::image_builder::ImageBuilderType;
use isoforge::core::models::FileSystemType;
use isoforge::core::orchestrator::{
    JobEvent, JobState, JobTimeouts, Orchestrator, ProcessLauncher, Worker, WorkerLauncher,
    WorkerPoll,
};
use isoforge::core::request::JobRequest;
use isoforge::core::result::ResultCategory;
use std::ffi::OsString;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Counts releases of every worker it hands out.
struct CountingLauncher {
    inner: ProcessLauncher,
    releases: Arc<AtomicUsize>,
}

struct CountingWorker {
    inner: Box<dyn Worker>,
    releases: Arc<AtomicUsize>,
}

#[async_trait]
impl WorkerLauncher for CountingLauncher {
    async fn launch(&self, job_id: &str, request: &JobRequest) -> Result<Box<dyn Worker>> {
        let inner = self.inner.launch(job_id, request).await?;
        Ok(Box::new(CountingWorker {
            inner,
            releases: self.releases.clone(),
        }))
    }
}

#[async_trait]
impl Worker for CountingWorker {
    fn pid(&self) -> Option<u32> {
        self.inner.pid()
    }

    async fn poll(&mut self) -> Result<WorkerPoll> {
        self.inner.poll().await
    }

    async fn terminate(&mut self) -> Result<()> {
        self.inner.terminate().await
    }

    fn release(&mut self) {
        self.releases.fetch_add(1, Ordering::SeqCst);
        self.inner.release();
    }
}

fn shell(script: &str) -> ProcessLauncher {
    // Trailing "sh" becomes $0; worker arguments land in $@ and are ignored
    let args: Vec<OsString> = vec!["-c".into(), script.into(), "sh".into()];
    ProcessLauncher::new("sh", args)
}

fn timeouts(soft: Duration, hard: Duration) -> JobTimeouts {
    JobTimeouts {
        poll_interval: Duration::from_millis(25),
        progress_interval: Duration::from_millis(100),
        soft_timeout: soft,
        hard_timeout: hard,
    }
}

fn request() -> JobRequest {
    JobRequest {
        source: PathBuf::from("/nonexistent/source"),
        destination: PathBuf::from("/nonexistent/out.iso"),
        label: "STALL".to_string(),
        file_system: FileSystemType::Udf,
        overwrite: false,
        builder: ImageBuilderType::Simulated,
    }
}

#[tokio::test]
async fn test_stalled_worker_hits_hard_timeout() {
    let releases = Arc::new(AtomicUsize::new(0));
    let launcher = CountingLauncher {
        inner: shell("sleep 30"),
        releases: releases.clone(),
    };
    let orchestrator = Orchestrator::new(
        Arc::new(launcher),
        timeouts(Duration::from_millis(150), Duration::from_millis(400)),
    );

    let (tx, mut rx) = mpsc::channel(256);
    let collector = tokio::spawn(async move {
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        events
    });

    let report = orchestrator
        .run(&request(), tx, CancellationToken::new())
        .await;
    let events = collector.await.unwrap();

    assert_eq!(report.state, JobState::TimedOut);
    assert_eq!(report.result.category, ResultCategory::Timeout);
    assert!(report.elapsed >= Duration::from_millis(400));
    assert!(report.elapsed < Duration::from_secs(10));
    assert_eq!(releases.load(Ordering::SeqCst), 1);

    assert_eq!(
        events
            .iter()
            .filter(|e| matches!(e, JobEvent::SlowJob { .. }))
            .count(),
        1
    );
    assert!(events.iter().any(|e| matches!(e, JobEvent::Heartbeat { .. })));
}

#[tokio::test]
async fn test_slow_worker_survives_soft_timeout() {
    let releases = Arc::new(AtomicUsize::new(0));
    let launcher = CountingLauncher {
        inner: shell(r#"sleep 0.3; echo '{"event":"result","code":0}'"#),
        releases: releases.clone(),
    };
    let orchestrator = Orchestrator::new(
        Arc::new(launcher),
        timeouts(Duration::from_millis(50), Duration::from_secs(10)),
    );

    let (tx, _rx) = mpsc::channel(256);
    let report = orchestrator
        .run(&request(), tx, CancellationToken::new())
        .await;

    // The code is success but no image exists at the destination
    assert_eq!(report.state, JobState::Faulted);
    assert_eq!(report.result.category, ResultCategory::OutputStreamError);
    assert_eq!(releases.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_reported_code_crosses_process_boundary() {
    let orchestrator = Orchestrator::new(
        Arc::new(shell(
            r#"echo 'not json'; echo '{"event":"result","code":-2147024891}'; exit 1"#,
        )),
        timeouts(Duration::from_secs(5), Duration::from_secs(10)),
    );

    let (tx, _rx) = mpsc::channel(256);
    let report = orchestrator
        .run(&request(), tx, CancellationToken::new())
        .await;

    assert_eq!(report.state, JobState::Faulted);
    assert_eq!(report.result.category, ResultCategory::AccessDenied);
}

#[tokio::test]
async fn test_silent_exit_is_worker_crash() {
    let orchestrator = Orchestrator::new(
        Arc::new(shell("exit 0")),
        timeouts(Duration::from_secs(5), Duration::from_secs(10)),
    );

    let (tx, _rx) = mpsc::channel(256);
    let report = orchestrator
        .run(&request(), tx, CancellationToken::new())
        .await;

    assert_eq!(report.result.category, ResultCategory::WorkerCrash);
}

#[tokio::test]
async fn test_cancel_kills_running_worker() {
    let releases = Arc::new(AtomicUsize::new(0));
    let launcher = CountingLauncher {
        inner: shell("sleep 30"),
        releases: releases.clone(),
    };
    let orchestrator = Orchestrator::new(
        Arc::new(launcher),
        timeouts(Duration::from_secs(5), Duration::from_secs(10)),
    );

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        trigger.cancel();
    });

    let (tx, _rx) = mpsc::channel(256);
    let report = orchestrator.run(&request(), tx, cancel).await;

    assert_eq!(report.state, JobState::Cancelled);
    assert_eq!(report.result.category, ResultCategory::Cancelled);
    assert!(report.elapsed < Duration::from_secs(5));
    assert_eq!(releases.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_missing_worker_binary_is_crash() {
    let orchestrator = Orchestrator::new(
        Arc::new(ProcessLauncher::new("/nonexistent/isoforge-worker", Vec::new())),
        timeouts(Duration::from_secs(5), Duration::from_secs(10)),
    );

    let (tx, _rx) = mpsc::channel(256);
    let report = orchestrator
        .run(&request(), tx, CancellationToken::new())
        .await;

    assert_eq!(report.state, JobState::Faulted);
    assert_eq!(report.result.category, ResultCategory::WorkerCrash);
}

#[tokio::test]
async fn test_chatty_worker_with_unread_events_still_times_out() {
    let script = r#"
        i=0
        while [ $i -lt 100 ]; do
            echo '{"event":"progress","bytes_written":1,"total_bytes":2}'
            i=$((i + 1))
        done
        exec sleep 30
    "#;
    let orchestrator = Orchestrator::new(
        Arc::new(shell(script)),
        timeouts(Duration::from_millis(150), Duration::from_millis(400)),
    );

    // Nobody drains the channel
    let (tx, _rx) = mpsc::channel(16);
    let report = tokio::time::timeout(
        Duration::from_secs(5),
        orchestrator.run(&request(), tx, CancellationToken::new()),
    )
    .await
    .expect("orchestrator stalled on a full event channel");

    assert_eq!(report.state, JobState::TimedOut);
    assert_eq!(report.result.category, ResultCategory::Timeout);
}

#[tokio::test]
async fn test_worker_ignoring_sigterm_is_killed_after_grace() {
    let releases = Arc::new(AtomicUsize::new(0));
    let launcher = CountingLauncher {
        inner: shell("trap '' TERM; sleep 5").with_terminate_grace(Duration::from_millis(200)),
        releases: releases.clone(),
    };
    let orchestrator = Orchestrator::new(
        Arc::new(launcher),
        timeouts(Duration::from_millis(100), Duration::from_millis(300)),
    );

    let (tx, _rx) = mpsc::channel(256);
    let report = orchestrator
        .run(&request(), tx, CancellationToken::new())
        .await;

    assert_eq!(report.state, JobState::TimedOut);
    assert!(report.elapsed >= Duration::from_millis(500));
    assert!(report.elapsed < Duration::from_secs(4));
    assert_eq!(releases.load(Ordering::SeqCst), 1);
}
