//! Worker side of an image job.
//!
//! The worker runs boot catalog discovery, the image build and the stream
//! copy strictly in sequence and reports over stdout as newline-delimited
//! JSON [`WorkerMessage`]s. The last message is always a single `result`
//! carrying the job's result code.

use serde::{Deserialize, Serialize};
use std::io::{self, Write};
use std::path::PathBuf;
use tokio::signal::unix::{SignalKind, signal};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn};

use crate::core::boot_catalog;
use crate::core::copier::{self, CopySummary};
use crate::core::error::PipelineError;
use crate::core::image_builder::ImageBuilder;
use crate::core::models::BootPlatform;
use crate::core::request::JobRequest;
use crate::core::result::{SUCCESS, WORKER_CRASH_CODE};

/// Minimum bytes between two progress messages.
const PROGRESS_MESSAGE_INTERVAL: u64 = 16 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum WorkerMessage {
    BootCatalog {
        platforms: Vec<BootPlatform>,
    },
    BootSkipped {
        platform: BootPlatform,
        path: PathBuf,
        reason: String,
    },
    Geometry {
        block_size: u32,
        total_blocks: u64,
    },
    Progress {
        bytes_written: u64,
        total_bytes: u64,
    },
    Completed {
        size_bytes: u64,
        digest: String,
    },
    Result {
        code: i32,
    },
}

/// Run catalog → build → copy for one job.
pub fn run_pipeline(
    request: &JobRequest,
    builder: &dyn ImageBuilder,
    cancel: &CancellationToken,
    emit: &mut dyn FnMut(WorkerMessage),
) -> Result<CopySummary, PipelineError> {
    let catalog = boot_catalog::discover(&request.source);
    for skipped in catalog.skipped() {
        emit(WorkerMessage::BootSkipped {
            platform: skipped.platform,
            path: skipped.path.clone(),
            reason: skipped.reason.clone(),
        });
    }
    emit(WorkerMessage::BootCatalog {
        platforms: catalog.platforms(),
    });

    let image = builder.build(&request.build_request(), catalog.entries())?;

    // Boot image handles are released as soon as the image exists
    drop(catalog);

    emit(WorkerMessage::Geometry {
        block_size: image.geometry.block_size,
        total_blocks: image.geometry.total_blocks,
    });

    let mut last_reported = 0u64;
    let summary = copier::copy_image(
        image.stream,
        image.geometry,
        &request.destination,
        &request.copy_options(),
        cancel,
        |progress| {
            if progress.bytes_written - last_reported >= PROGRESS_MESSAGE_INTERVAL
                || progress.bytes_written == progress.total_bytes
            {
                last_reported = progress.bytes_written;
                emit(WorkerMessage::Progress {
                    bytes_written: progress.bytes_written,
                    total_bytes: progress.total_bytes,
                });
            }
        },
    )?;

    emit(WorkerMessage::Completed {
        size_bytes: summary.bytes_written,
        digest: summary.digest.clone(),
    });

    Ok(summary)
}

/// Run the pipeline on a blocking thread, streaming messages to stdout.
/// Returns the result code, which is also the final message written.
///
/// SIGTERM or SIGINT cancels the job at the next transfer boundary, which
/// removes the staged image before the worker exits.
pub async fn run(request: JobRequest, builder: Box<dyn ImageBuilder>) -> i32 {
    let span = info_span!(
        "worker",
        source = %request.source.display(),
        destination = %request.destination.display()
    );

    let cancel = CancellationToken::new();
    let listener = tokio::spawn(cancel_on_signal(cancel.clone()));

    let handle = tokio::task::spawn_blocking(move || {
        let _enter = span.enter();
        info!(label = %request.label, file_system = request.file_system.as_str(), "Worker started");

        let mut emit = message_sink(io::stdout(), cancel.clone());

        let code = match run_pipeline(&request, builder.as_ref(), &cancel, &mut emit) {
            Ok(summary) => {
                info!(
                    bytes = summary.bytes_written,
                    transfers = summary.transfers,
                    duration_secs = summary.duration.as_secs(),
                    "Worker finished"
                );
                SUCCESS
            }
            Err(e) => {
                error!(error = %e, code = e.code(), "Worker failed");
                e.code()
            }
        };

        emit(WorkerMessage::Result { code });
        code
    });

    let code = match handle.await {
        Ok(code) => code,
        Err(e) => {
            error!(error = %e, "Worker pipeline panicked");
            let _ = write_message(
                &mut io::stdout(),
                &WorkerMessage::Result {
                    code: WORKER_CRASH_CODE,
                },
            );
            WORKER_CRASH_CODE
        }
    };

    listener.abort();
    code
}

async fn cancel_on_signal(cancel: CancellationToken) {
    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(terminate) => terminate,
        Err(e) => {
            warn!(error = %e, "Failed to install SIGTERM handler");
            return;
        }
    };

    tokio::select! {
        _ = terminate.recv() => warn!("SIGTERM received, cancelling image job"),
        _ = tokio::signal::ctrl_c() => warn!("Interrupt received, cancelling image job"),
    }
    cancel.cancel();
}

/// Message emitter writing to `out`. A failed write means nobody is reading
/// any more, so the job is cancelled instead of running on unobserved.
pub fn message_sink<W: Write>(
    mut out: W,
    cancel: CancellationToken,
) -> impl FnMut(WorkerMessage) {
    move |message| {
        if let Err(e) = write_message(&mut out, &message) {
            if !cancel.is_cancelled() {
                warn!(error = %e, "Failed to write worker message, cancelling image job");
                cancel.cancel();
            }
        }
    }
}

fn write_message<W: Write>(out: &mut W, message: &WorkerMessage) -> io::Result<()> {
    let line = serde_json::to_string(message).map_err(io::Error::other)?;
    writeln!(out, "{line}")?;
    out.flush()
}
