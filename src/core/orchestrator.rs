//! Job orchestration.
//!
//! Runs each image job in an isolated worker, watches it on a fixed polling
//! cadence and enforces the timeout ladder:
//!
//! ```text
//!   Created ──launch──▶ Running ──exit, code 0──────▶ Completed
//!                          │    ──exit, code != 0───▶ Faulted
//!                          │    ──exit, no code─────▶ Faulted (WorkerCrash)
//!                          │    ──soft timeout──────▶ (warn, keep waiting)
//!                          │    ──hard timeout──────▶ TimedOut (worker killed)
//!                          └────cancel──────────────▶ Cancelled (worker killed)
//! ```
//!
//! Whatever the exit path, the worker is released exactly once before the
//! job report is returned.

use anyhow::{Context, Result};
use async_trait::async_trait;
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use std::ffi::OsString;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval, interval_at};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};
use uuid::Uuid;

use crate::config::TimeoutConfig;
use crate::core::copier::discard_staging;
use crate::core::models::{BootPlatform, ImageDescriptor};
use crate::core::request::JobRequest;
use crate::core::result::{
    CANCELLED_CODE, COPY_OUTPUT_STREAM, JobResult, ResultCategory, SUCCESS, TIMEOUT_CODE,
    WORKER_CRASH_CODE, interpret,
};
use crate::core::worker::WorkerMessage;

const READER_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Time a worker gets to clean up after SIGTERM before it is killed.
pub const DEFAULT_TERMINATE_GRACE: Duration = Duration::from_secs(5);

/// Floor for the poll and heartbeat periods.
const MIN_INTERVAL: Duration = Duration::from_millis(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobState {
    Created,
    Running,
    Completed,
    Faulted,
    TimedOut,
    Cancelled,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Created | Self::Running)
    }
}

/// Timing for the poll loop and the timeout ladder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobTimeouts {
    pub poll_interval: Duration,
    pub progress_interval: Duration,
    /// Past this the job is reported as slow but left running
    pub soft_timeout: Duration,
    /// Past this the worker is killed
    pub hard_timeout: Duration,
}

impl Default for JobTimeouts {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            progress_interval: Duration::from_secs(30),
            soft_timeout: Duration::from_secs(10 * 60),
            hard_timeout: Duration::from_secs(30 * 60),
        }
    }
}

impl From<&TimeoutConfig> for JobTimeouts {
    fn from(config: &TimeoutConfig) -> Self {
        Self {
            poll_interval: Duration::from_secs(config.poll_interval_secs),
            progress_interval: Duration::from_secs(config.progress_interval_secs),
            soft_timeout: Duration::from_secs(config.soft_timeout_secs),
            hard_timeout: Duration::from_secs(config.hard_timeout_secs),
        }
    }
}

/// Events emitted while a job runs.
#[derive(Debug, Clone, PartialEq)]
pub enum JobEvent {
    Started {
        job_id: String,
        pid: Option<u32>,
    },
    BootCatalog {
        platforms: Vec<BootPlatform>,
    },
    BootSkipped {
        platform: BootPlatform,
        path: PathBuf,
        reason: String,
    },
    Progress {
        bytes_written: u64,
        total_bytes: u64,
    },
    Heartbeat {
        elapsed: Duration,
        bytes_written: u64,
        total_bytes: u64,
    },
    SlowJob {
        elapsed: Duration,
    },
    Finished {
        state: JobState,
        result: JobResult,
    },
}

/// What a single liveness poll observed.
#[derive(Debug, Default)]
pub struct WorkerPoll {
    /// Messages received since the previous poll
    pub messages: Vec<WorkerMessage>,
    /// Set once the worker has exited
    pub exited: bool,
}

/// Isolated execution context running one job.
#[async_trait]
pub trait Worker: Send {
    fn pid(&self) -> Option<u32>;

    /// Non-blocking liveness check.
    async fn poll(&mut self) -> Result<WorkerPoll>;

    /// Force the worker to stop.
    async fn terminate(&mut self) -> Result<()>;

    /// Release everything the worker holds. Called exactly once per job.
    fn release(&mut self);
}

#[async_trait]
pub trait WorkerLauncher: Send + Sync {
    async fn launch(&self, job_id: &str, request: &JobRequest) -> Result<Box<dyn Worker>>;
}

/// Runs workers as child processes of a worker-capable binary.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    program: PathBuf,
    base_args: Vec<OsString>,
    terminate_grace: Duration,
}

impl ProcessLauncher {
    pub fn new(program: impl Into<PathBuf>, base_args: Vec<OsString>) -> Self {
        Self {
            program: program.into(),
            base_args,
            terminate_grace: DEFAULT_TERMINATE_GRACE,
        }
    }

    pub fn with_terminate_grace(mut self, grace: Duration) -> Self {
        self.terminate_grace = grace;
        self
    }

    /// Re-execute the running binary with its hidden `worker` subcommand.
    pub fn current_exe(config_path: Option<PathBuf>) -> Result<Self> {
        let program = std::env::current_exe().context("Failed to determine binary path")?;
        let mut base_args: Vec<OsString> = vec!["worker".into()];
        if let Some(path) = config_path {
            base_args.push("--config".into());
            base_args.push(path.into());
        }
        Ok(Self::new(program, base_args))
    }
}

#[async_trait]
impl WorkerLauncher for ProcessLauncher {
    async fn launch(&self, job_id: &str, request: &JobRequest) -> Result<Box<dyn Worker>> {
        let mut child = Command::new(&self.program)
            .args(&self.base_args)
            .args(request.worker_args())
            .env("ISOFORGE_JOB_ID", job_id)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to spawn worker {}", self.program.display()))?;

        let stdout = child
            .stdout
            .take()
            .context("Failed to capture worker stdout")?;

        let (tx, rx) = mpsc::unbounded_channel();
        let reader = tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                match serde_json::from_str::<WorkerMessage>(&line) {
                    Ok(message) => {
                        if tx.send(message).is_err() {
                            break;
                        }
                    }
                    Err(_) => debug!(line = %line, "Ignoring non-protocol worker output"),
                }
            }
        });

        Ok(Box::new(ProcessWorker {
            child,
            messages: rx,
            reader: Some(reader),
            terminate_grace: self.terminate_grace,
        }))
    }
}

struct ProcessWorker {
    child: Child,
    messages: mpsc::UnboundedReceiver<WorkerMessage>,
    reader: Option<JoinHandle<()>>,
    terminate_grace: Duration,
}

impl ProcessWorker {
    fn drain(&mut self, into: &mut Vec<WorkerMessage>) {
        while let Ok(message) = self.messages.try_recv() {
            into.push(message);
        }
    }
}

#[async_trait]
impl Worker for ProcessWorker {
    fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    async fn poll(&mut self) -> Result<WorkerPoll> {
        let mut poll = WorkerPoll::default();

        match self.child.try_wait().context("Failed to poll worker")? {
            Some(status) => {
                // Stdout hits EOF once the process is gone, unless a grandchild
                // still holds the pipe
                if let Some(mut reader) = self.reader.take() {
                    if tokio::time::timeout(READER_DRAIN_TIMEOUT, &mut reader)
                        .await
                        .is_err()
                    {
                        warn!("Worker stdout still open after exit");
                        reader.abort();
                    }
                }
                self.drain(&mut poll.messages);
                debug!(%status, "Worker exited");
                poll.exited = true;
            }
            None => self.drain(&mut poll.messages),
        }

        Ok(poll)
    }

    /// SIGTERM first so the worker can discard its staged image, SIGKILL
    /// once the grace period runs out.
    async fn terminate(&mut self) -> Result<()> {
        if let Some(pid) = self.child.id() {
            match kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                Ok(()) => {
                    match tokio::time::timeout(self.terminate_grace, self.child.wait()).await {
                        Ok(status) => {
                            let status = status.context("Failed to wait for worker")?;
                            debug!(%status, "Worker stopped after SIGTERM");
                            return Ok(());
                        }
                        Err(_) => warn!(
                            grace_ms = self.terminate_grace.as_millis() as u64,
                            "Worker ignored SIGTERM, killing"
                        ),
                    }
                }
                Err(errno) => debug!(%errno, "Failed to signal worker"),
            }
        }

        self.child.kill().await.context("Failed to kill worker")
    }

    fn release(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        self.messages.close();
        // Reaps the child if it is still around
        let _ = self.child.start_kill();
        let _ = self.child.try_wait();
    }
}

/// Final report for one job.
#[derive(Debug, Clone)]
pub struct JobReport {
    pub job_id: String,
    pub state: JobState,
    pub result: JobResult,
    pub image: Option<ImageDescriptor>,
    pub elapsed: Duration,
}

#[derive(Debug, Error)]
#[error("{result}: {diagnosis}")]
pub struct JobFailure {
    pub state: JobState,
    pub result: JobResult,
    pub diagnosis: String,
}

impl JobReport {
    pub fn into_result(self) -> Result<ImageDescriptor, JobFailure> {
        match (self.state, self.image) {
            (JobState::Completed, Some(image)) => Ok(image),
            (state, _) => Err(JobFailure {
                state,
                diagnosis: self.result.describe(),
                result: self.result,
            }),
        }
    }
}

/// Owned state of one job run.
struct JobHandle {
    job_id: String,
    state: JobState,
}

impl JobHandle {
    fn new() -> Self {
        Self {
            job_id: Uuid::now_v7().to_string(),
            state: JobState::Created,
        }
    }

    fn transition(&mut self, next: JobState) {
        if self.state.is_terminal() {
            warn!(from = ?self.state, to = ?next, "Ignoring transition out of terminal state");
            return;
        }
        debug!(from = ?self.state, to = ?next, "Job state change");
        self.state = next;
    }
}

enum Termination {
    Exited,
    Crashed,
    TimedOut,
    Cancelled,
}

/// Everything gathered from worker messages.
#[derive(Default)]
struct Observed {
    result_code: Option<i32>,
    boot_platforms: Vec<BootPlatform>,
    bytes_written: u64,
    total_bytes: u64,
    digest: Option<String>,
}

pub struct Orchestrator {
    launcher: Arc<dyn WorkerLauncher>,
    timeouts: JobTimeouts,
}

impl Orchestrator {
    pub fn new(launcher: Arc<dyn WorkerLauncher>, timeouts: JobTimeouts) -> Self {
        // tokio intervals reject a zero period
        let timeouts = JobTimeouts {
            poll_interval: timeouts.poll_interval.max(MIN_INTERVAL),
            progress_interval: timeouts.progress_interval.max(MIN_INTERVAL),
            ..timeouts
        };
        Self { launcher, timeouts }
    }

    /// Run one job to a terminal state.
    pub async fn run(
        &self,
        request: &JobRequest,
        events: mpsc::Sender<JobEvent>,
        cancel: CancellationToken,
    ) -> JobReport {
        let mut job = JobHandle::new();
        let span = info_span!("job", job_id = %job.job_id);

        async {
            let start = Instant::now();
            info!(
                source = %request.source.display(),
                destination = %request.destination.display(),
                "Launching image worker"
            );

            let mut worker = match self.launcher.launch(&job.job_id, request).await {
                Ok(worker) => worker,
                Err(e) => {
                    error!(error = %e, "Failed to launch worker");
                    job.transition(JobState::Faulted);
                    return finish(&mut job, interpret(WORKER_CRASH_CODE), None, start, &events);
                }
            };

            job.transition(JobState::Running);
            emit(
                &events,
                JobEvent::Started {
                    job_id: job.job_id.clone(),
                    pid: worker.pid(),
                },
            );

            let mut observed = Observed::default();
            let termination = self
                .supervise(worker.as_mut(), &mut observed, &events, &cancel, start)
                .await;

            worker.release();

            let (mut state, mut result) = match termination {
                Termination::Exited => match observed.result_code {
                    Some(SUCCESS) => (JobState::Completed, interpret(SUCCESS)),
                    Some(code) => (JobState::Faulted, interpret(code)),
                    None => {
                        warn!("Worker exited without reporting a result");
                        (JobState::Faulted, interpret(WORKER_CRASH_CODE))
                    }
                },
                Termination::Crashed => (JobState::Faulted, interpret(WORKER_CRASH_CODE)),
                Termination::TimedOut => (JobState::TimedOut, interpret(TIMEOUT_CODE)),
                Termination::Cancelled => (JobState::Cancelled, interpret(CANCELLED_CODE)),
            };

            // A killed worker can't clean up after itself
            if matches!(state, JobState::TimedOut | JobState::Cancelled)
                || result.category == ResultCategory::WorkerCrash
            {
                match discard_staging(&request.destination) {
                    Ok(true) => warn!("Removed partial image left by the worker"),
                    Ok(false) => {}
                    Err(e) => warn!(error = %e, "Failed to remove partial image"),
                }
            }

            let mut image = None;
            if state == JobState::Completed {
                match std::fs::metadata(&request.destination) {
                    Ok(metadata) => {
                        image = Some(ImageDescriptor {
                            path: request.destination.clone(),
                            size_bytes: metadata.len(),
                            boot_platforms: observed.boot_platforms.clone(),
                            digest: observed.digest.clone(),
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "Worker reported success but the image is missing");
                        state = JobState::Faulted;
                        result = interpret(COPY_OUTPUT_STREAM);
                    }
                }
            }

            job.transition(state);
            finish(&mut job, result, image, start, &events)
        }
        .instrument(span)
        .await
    }

    async fn supervise(
        &self,
        worker: &mut dyn Worker,
        observed: &mut Observed,
        events: &mpsc::Sender<JobEvent>,
        cancel: &CancellationToken,
        start: Instant,
    ) -> Termination {
        let timeouts = self.timeouts;

        let mut poll = interval(timeouts.poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let heartbeat_start = tokio::time::Instant::now() + timeouts.progress_interval;
        let mut heartbeat = interval_at(heartbeat_start, timeouts.progress_interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let mut warned_slow = false;

        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    warn!("Job cancelled, terminating worker");
                    if let Err(e) = worker.terminate().await {
                        error!(error = %e, "Failed to terminate worker");
                    }
                    return Termination::Cancelled;
                }

                _ = poll.tick() => {
                    match worker.poll().await {
                        Ok(update) => {
                            for message in update.messages {
                                observe(message, observed, events);
                            }
                            if update.exited {
                                return Termination::Exited;
                            }
                        }
                        Err(e) => {
                            error!(error = %e, "Lost track of worker");
                            let _ = worker.terminate().await;
                            return Termination::Crashed;
                        }
                    }

                    let elapsed = start.elapsed();
                    if elapsed >= timeouts.hard_timeout {
                        error!(
                            elapsed_secs = elapsed.as_secs(),
                            limit_secs = timeouts.hard_timeout.as_secs(),
                            "Worker exceeded hard timeout, terminating"
                        );
                        if let Err(e) = worker.terminate().await {
                            error!(error = %e, "Failed to terminate worker");
                        }
                        return Termination::TimedOut;
                    }
                    if elapsed >= timeouts.soft_timeout && !warned_slow {
                        warned_slow = true;
                        warn!(
                            elapsed_secs = elapsed.as_secs(),
                            "Image job is taking longer than expected, still waiting"
                        );
                        emit(events, JobEvent::SlowJob { elapsed });
                    }
                }

                _ = heartbeat.tick() => {
                    let elapsed = start.elapsed();
                    info!(
                        elapsed_secs = elapsed.as_secs(),
                        bytes_written = observed.bytes_written,
                        total_bytes = observed.total_bytes,
                        "Image job in progress"
                    );
                    emit(
                        events,
                        JobEvent::Heartbeat {
                            elapsed,
                            bytes_written: observed.bytes_written,
                            total_bytes: observed.total_bytes,
                        },
                    );
                }
            }
        }
    }
}

/// Deliver an event without waiting on the consumer. The supervision loop
/// must keep ticking even when nobody reads the channel.
fn emit(events: &mpsc::Sender<JobEvent>, event: JobEvent) {
    match events.try_send(event) {
        Ok(()) | Err(TrySendError::Closed(_)) => {}
        Err(TrySendError::Full(event)) => debug!(?event, "Event channel full, dropping event"),
    }
}

fn observe(message: WorkerMessage, observed: &mut Observed, events: &mpsc::Sender<JobEvent>) {
    match message {
        WorkerMessage::BootCatalog { platforms } => {
            info!(?platforms, "Boot catalog built");
            observed.boot_platforms = platforms.clone();
            emit(events, JobEvent::BootCatalog { platforms });
        }
        WorkerMessage::BootSkipped {
            platform,
            path,
            reason,
        } => {
            warn!(%platform, path = %path.display(), %reason, "Boot platform skipped");
            emit(
                events,
                JobEvent::BootSkipped {
                    platform,
                    path,
                    reason,
                },
            );
        }
        WorkerMessage::Geometry {
            block_size,
            total_blocks,
        } => {
            observed.total_bytes = (block_size as u64).saturating_mul(total_blocks);
            debug!(block_size, total_blocks, "Image geometry");
        }
        WorkerMessage::Progress {
            bytes_written,
            total_bytes,
        } => {
            observed.bytes_written = bytes_written;
            observed.total_bytes = total_bytes;
            emit(
                events,
                JobEvent::Progress {
                    bytes_written,
                    total_bytes,
                },
            );
        }
        WorkerMessage::Completed { size_bytes, digest } => {
            observed.bytes_written = size_bytes;
            observed.digest = Some(digest);
        }
        WorkerMessage::Result { code } => match observed.result_code {
            None => observed.result_code = Some(code),
            Some(first) => warn!(first, ignored = code, "Worker reported more than one result"),
        },
    }
}

fn finish(
    job: &mut JobHandle,
    result: JobResult,
    image: Option<ImageDescriptor>,
    start: Instant,
    events: &mpsc::Sender<JobEvent>,
) -> JobReport {
    let elapsed = start.elapsed();

    if result.is_success() {
        info!(elapsed_secs = elapsed.as_secs(), "Image job completed");
    } else {
        error!(
            state = ?job.state,
            result = %result,
            diagnosis = %result.describe(),
            "Image job failed"
        );
    }

    emit(
        events,
        JobEvent::Finished {
            state: job.state,
            result,
        },
    );

    JobReport {
        job_id: job.job_id.clone(),
        state: job.state,
        result,
        image,
        elapsed,
    }
}
