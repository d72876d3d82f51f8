//! Chunked image stream copier.
//!
//! Writes a finished image stream to its destination file in bounded
//! transfers of up to [`MAX_CHUNK_BLOCKS`] blocks. Any remainder that doesn't
//! fill a whole chunk goes first, so every later transfer has the same size.
//! Bytes are written strictly in stream order.
//!
//! The image is staged next to the destination and only committed into place
//! after the final flush and sync succeed. A failed copy never leaves a file
//! at the destination path that looks complete.

use nix::fcntl::{Flock, FlockArg};
use std::fs::{self, File, OpenOptions};
use std::io::{self, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn};

use crate::core::error::CopyError;
use crate::core::models::ImageGeometry;
use crate::logging::LogThrottle;

/// Upper bound on filesystem blocks grouped into one transfer.
pub const MAX_CHUNK_BLOCKS: u64 = 1024;

/// Largest block size accepted from an image builder.
pub const MAX_BLOCK_SIZE: u32 = 64 * 1024;

const STAGING_SUFFIX: &str = "partial";

/// How often chunk progress is logged at debug level
const PROGRESS_LOG_INTERVAL: Duration = Duration::from_secs(2);

/// Transfer schedule derived from an image's geometry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CopyPlan {
    pub block_size: u64,
    /// Blocks grouped per full chunk
    pub chunk_divider: u64,
    /// Blocks transferred up front as a single short chunk
    pub padding_blocks: u64,
    /// Bytes per full chunk
    pub chunk_bytes: u64,
    pub full_chunk_count: u64,
}

impl CopyPlan {
    pub fn new(geometry: ImageGeometry) -> Result<Self, CopyError> {
        if geometry.block_size == 0 {
            return Err(CopyError::InvalidGeometry(
                "block size must be positive".to_string(),
            ));
        }
        if geometry.block_size > MAX_BLOCK_SIZE {
            return Err(CopyError::InvalidGeometry(format!(
                "block size {} exceeds {}",
                geometry.block_size, MAX_BLOCK_SIZE
            )));
        }
        if geometry.total_bytes().is_none() {
            return Err(CopyError::InvalidGeometry(format!(
                "{} blocks of {} bytes overflows the image length",
                geometry.total_blocks, geometry.block_size
            )));
        }

        let block_size = geometry.block_size as u64;
        let total_blocks = geometry.total_blocks;
        let chunk_divider = total_blocks.min(MAX_CHUNK_BLOCKS).max(1);
        let padding_blocks = total_blocks % chunk_divider;

        Ok(Self {
            block_size,
            chunk_divider,
            padding_blocks,
            chunk_bytes: block_size * chunk_divider,
            full_chunk_count: (total_blocks - padding_blocks) / chunk_divider,
        })
    }

    pub fn padding_bytes(&self) -> u64 {
        self.padding_blocks * self.block_size
    }

    pub fn total_bytes(&self) -> u64 {
        self.padding_bytes() + self.full_chunk_count * self.chunk_bytes
    }

    pub fn transfer_count(&self) -> u64 {
        self.full_chunk_count + u64::from(self.padding_blocks > 0)
    }

    /// Transfer sizes in bytes, in the order they are performed.
    pub fn transfers(&self) -> impl Iterator<Item = u64> + '_ {
        let padding = (self.padding_blocks > 0).then(|| self.padding_bytes());
        padding.into_iter().chain(
            std::iter::repeat_n(self.chunk_bytes, self.full_chunk_count as usize),
        )
    }
}

/// Options for the copy operation
#[derive(Debug, Clone, Default)]
pub struct CopyOptions {
    /// Replace an existing destination file
    pub overwrite: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CopyProgress {
    pub bytes_written: u64,
    pub total_bytes: u64,
    pub transfers_done: u64,
    pub transfers_total: u64,
}

#[derive(Debug, Clone)]
pub struct CopySummary {
    pub bytes_written: u64,
    pub transfers: u64,
    /// BLAKE3 digest of the written bytes, hex encoded
    pub digest: String,
    pub duration: Duration,
}

/// Copy an image stream to `destination` following the geometry's copy plan.
///
/// A cancellation request is honoured between transfers only; a transfer in
/// flight always runs to completion first.
pub fn copy_image<R: Read>(
    mut reader: R,
    geometry: ImageGeometry,
    destination: &Path,
    options: &CopyOptions,
    cancel: &CancellationToken,
    mut on_progress: impl FnMut(CopyProgress),
) -> Result<CopySummary, CopyError> {
    let plan = CopyPlan::new(geometry)?;

    let span = info_span!(
        "copy_image",
        destination = %destination.display(),
        total_bytes = plan.total_bytes()
    );
    let _enter = span.enter();

    if !options.overwrite && destination.exists() {
        return Err(CopyError::OpenDestination {
            path: destination.to_path_buf(),
            source: io::Error::new(
                ErrorKind::AlreadyExists,
                "destination already exists and overwrite is not permitted",
            ),
        });
    }

    let staging = staging_path(destination);
    let mut file = open_staging(&staging).map_err(|source| CopyError::OpenDestination {
        path: destination.to_path_buf(),
        source,
    })?;

    info!(
        transfers = plan.transfer_count(),
        chunk_bytes = plan.chunk_bytes,
        padding_bytes = plan.padding_bytes(),
        "Starting image copy"
    );
    let start_time = Instant::now();

    let result = transfer_chunks(&mut reader, &mut *file, &plan, cancel, &mut on_progress)
        .and_then(|digest| {
            commit(file, &staging, destination, options)?;
            Ok(digest)
        });

    match result {
        Ok(digest) => {
            let duration = start_time.elapsed();
            let secs = duration.as_secs_f64();
            let speed_mbps = if secs > 0.0 {
                plan.total_bytes() as f64 / (1024.0 * 1024.0) / secs
            } else {
                0.0
            };

            info!(
                total_bytes = plan.total_bytes(),
                duration_secs = duration.as_secs(),
                speed_mbps = format!("{:.2}", speed_mbps),
                "Image copy complete"
            );

            Ok(CopySummary {
                bytes_written: plan.total_bytes(),
                transfers: plan.transfer_count(),
                digest,
                duration,
            })
        }
        Err(e) => {
            if let Err(remove_err) = fs::remove_file(&staging) {
                if remove_err.kind() != ErrorKind::NotFound {
                    warn!(
                        path = %staging.display(),
                        error = %remove_err,
                        "Failed to remove staged image"
                    );
                }
            }
            Err(e)
        }
    }
}

fn transfer_chunks<R: Read, W: Write>(
    reader: &mut R,
    writer: &mut W,
    plan: &CopyPlan,
    cancel: &CancellationToken,
    on_progress: &mut impl FnMut(CopyProgress),
) -> Result<String, CopyError> {
    let total_bytes = plan.total_bytes();
    let transfers_total = plan.transfer_count();
    let mut buffer = allocate_buffer(plan.chunk_bytes.max(plan.padding_bytes()) as usize)?;
    let mut hasher = blake3::Hasher::new();
    let throttle = LogThrottle::new(PROGRESS_LOG_INTERVAL);
    let mut offset: u64 = 0;

    for (index, len) in plan.transfers().enumerate() {
        if cancel.is_cancelled() {
            return Err(CopyError::Cancelled {
                bytes_written: offset,
            });
        }

        let chunk = &mut buffer[..len as usize];

        reader.read_exact(chunk).map_err(|e| match e.kind() {
            ErrorKind::UnexpectedEof => CopyError::ShortTransfer {
                offset,
                expected: len,
            },
            _ => CopyError::Transfer { offset, source: e },
        })?;

        writer.write_all(chunk).map_err(|e| match e.kind() {
            ErrorKind::WriteZero => CopyError::ShortTransfer {
                offset,
                expected: len,
            },
            _ => CopyError::Transfer { offset, source: e },
        })?;

        hasher.update(chunk);
        offset += len;

        let progress = CopyProgress {
            bytes_written: offset,
            total_bytes,
            transfers_done: index as u64 + 1,
            transfers_total,
        };
        if throttle.should_log() {
            debug!(
                bytes_written = progress.bytes_written,
                transfers_done = progress.transfers_done,
                transfers_total,
                "Copy progress"
            );
        }
        on_progress(progress);
    }

    // The stream must end exactly where the geometry says it does
    let mut extra = [0u8; 1];
    match reader.read(&mut extra) {
        Ok(0) => {}
        Ok(_) => return Err(CopyError::TrailingData { expected: offset }),
        Err(e) => return Err(CopyError::Transfer { offset, source: e }),
    }

    writer
        .flush()
        .map_err(|e| CopyError::Transfer { offset, source: e })?;

    Ok(hasher.finalize().to_hex().to_string())
}

fn commit(
    file: Flock<File>,
    staging: &Path,
    destination: &Path,
    options: &CopyOptions,
) -> Result<(), CopyError> {
    file.sync_all().map_err(|source| CopyError::Commit {
        path: destination.to_path_buf(),
        source,
    })?;
    // Unlocks and closes
    drop(file);

    let rename = || {
        fs::rename(staging, destination).map_err(|source| CopyError::Commit {
            path: destination.to_path_buf(),
            source,
        })
    };

    if options.overwrite {
        return rename();
    }

    // Linking refuses to replace a destination created while we were copying
    match fs::hard_link(staging, destination) {
        Ok(()) => {
            if let Err(e) = fs::remove_file(staging) {
                warn!(path = %staging.display(), error = %e, "Failed to remove staged image");
            }
            Ok(())
        }
        Err(e) if e.kind() == ErrorKind::AlreadyExists => Err(CopyError::OpenDestination {
            path: destination.to_path_buf(),
            source: e,
        }),
        // Filesystems without hard links
        Err(_) => rename(),
    }
}

fn allocate_buffer(len: usize) -> Result<Vec<u8>, CopyError> {
    let mut buffer = Vec::new();
    buffer
        .try_reserve_exact(len)
        .map_err(|_| CopyError::OutOfMemory { bytes: len })?;
    buffer.resize(len, 0);
    Ok(buffer)
}

/// Path the image is written to before it is committed.
pub fn staging_path(destination: &Path) -> PathBuf {
    let mut name = destination
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".");
    name.push(STAGING_SUFFIX);
    destination.with_file_name(name)
}

/// Open the staging file under a non-blocking exclusive advisory lock. A
/// second writer to the same destination gets `EWOULDBLOCK`.
fn open_staging(path: &Path) -> io::Result<Flock<File>> {
    let file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)?;
    let file = Flock::lock(file, FlockArg::LockExclusiveNonblock)
        .map_err(|(_, errno)| io::Error::from(errno))?;
    // Truncate only once the lock is held
    file.set_len(0)?;
    Ok(file)
}

/// Remove a stage abandoned by a writer that was killed mid-copy.
///
/// Returns `Ok(false)` when there is no stage, or when a live writer still
/// holds its lock.
pub fn discard_staging(destination: &Path) -> io::Result<bool> {
    let staging = staging_path(destination);
    let file = match File::open(&staging) {
        Ok(file) => file,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e),
    };
    let lock = match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
        Ok(lock) => lock,
        Err((_, errno)) if io::Error::from(errno).kind() == ErrorKind::WouldBlock => {
            debug!(path = %staging.display(), "Stage still locked by a writer");
            return Ok(false);
        }
        Err((_, errno)) => return Err(errno.into()),
    };

    let removed = match fs::remove_file(&staging) {
        Ok(()) => true,
        Err(e) if e.kind() == ErrorKind::NotFound => false,
        Err(e) => return Err(e),
    };
    drop(lock);
    Ok(removed)
}
