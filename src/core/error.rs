//! Typed failures raised inside the worker pipeline.
//!
//! Each error knows the result code it reduces to, so the worker can report a
//! single integer and the orchestrator can interpret it without seeing the
//! original error value.

use std::io::{self, ErrorKind};
use std::path::PathBuf;
use thiserror::Error;

use crate::core::result::{
    CANCELLED_CODE, COPY_ACCESS_DENIED, COPY_GENERAL_ERROR, COPY_OUT_OF_MEMORY,
    COPY_OUTPUT_STREAM, E_ACCESSDENIED, E_FAIL, E_INVALID_DATA, E_INVALIDARG,
    E_NOT_ENOUGH_RESOURCES, E_OUTOFMEMORY,
};

/// Failures of the filesystem image builder.
#[derive(Debug, Error)]
pub enum BuildError {
    #[error("Invalid build parameter: {0}")]
    InvalidParameter(String),

    #[error("Failed to read source tree at {path}: {source}")]
    Source { path: PathBuf, source: io::Error },

    #[error("Image builder tool '{program}' could not be started: {source}")]
    ToolUnavailable { program: String, source: io::Error },

    #[error("Image builder failed: {message}")]
    Builder { message: String, code: i32 },

    #[error("Image builder I/O error: {0}")]
    Io(#[from] io::Error),
}

impl BuildError {
    pub fn code(&self) -> i32 {
        match self {
            Self::InvalidParameter(_) => E_INVALIDARG,
            Self::Source { source, .. } => native_code(source),
            Self::ToolUnavailable { source, .. } => native_code(source),
            Self::Builder { code, .. } => *code,
            Self::Io(e) => native_code(e),
        }
    }
}

/// Failures of the image stream copier.
#[derive(Debug, Error)]
pub enum CopyError {
    #[error("Invalid image geometry: {0}")]
    InvalidGeometry(String),

    #[error("Failed to open destination {path}: {source}")]
    OpenDestination { path: PathBuf, source: io::Error },

    #[error("Failed to allocate {bytes} byte transfer buffer")]
    OutOfMemory { bytes: usize },

    #[error("Short transfer at byte offset {offset}: expected {expected} bytes")]
    ShortTransfer { offset: u64, expected: u64 },

    #[error("Image stream produced more data than its geometry declares ({expected} bytes)")]
    TrailingData { expected: u64 },

    #[error("Transfer failed at byte offset {offset}: {source}")]
    Transfer { offset: u64, source: io::Error },

    #[error("Failed to commit destination {path}: {source}")]
    Commit { path: PathBuf, source: io::Error },

    #[error("Copy cancelled after {bytes_written} bytes")]
    Cancelled { bytes_written: u64 },
}

impl CopyError {
    pub fn code(&self) -> i32 {
        match self {
            Self::InvalidGeometry(_) => E_INVALIDARG,
            Self::OpenDestination { .. } => COPY_OUTPUT_STREAM,
            Self::OutOfMemory { .. } => COPY_OUT_OF_MEMORY,
            Self::ShortTransfer { .. } | Self::TrailingData { .. } => COPY_GENERAL_ERROR,
            Self::Transfer { source, .. } | Self::Commit { source, .. } => copy_code(source),
            Self::Cancelled { .. } => CANCELLED_CODE,
        }
    }
}

/// Either half of the worker pipeline failing.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Build(#[from] BuildError),

    #[error(transparent)]
    Copy(#[from] CopyError),
}

impl PipelineError {
    pub fn code(&self) -> i32 {
        match self {
            Self::Build(e) => e.code(),
            Self::Copy(e) => e.code(),
        }
    }
}

/// Classify an I/O error into the copier's 1-4 code space.
pub fn copy_code(error: &io::Error) -> i32 {
    match error.kind() {
        ErrorKind::OutOfMemory => return COPY_OUT_OF_MEMORY,
        ErrorKind::PermissionDenied => return COPY_ACCESS_DENIED,
        _ => {}
    }

    match error.raw_os_error() {
        Some(libc::ENOMEM) => COPY_OUT_OF_MEMORY,
        Some(libc::EACCES) | Some(libc::EPERM) => COPY_ACCESS_DENIED,
        _ => COPY_GENERAL_ERROR,
    }
}

/// Classify an I/O error into the builder's HRESULT-style code space.
pub fn native_code(error: &io::Error) -> i32 {
    if let Some(os_error) = error.raw_os_error() {
        match os_error {
            libc::ENOMEM => return E_OUTOFMEMORY,
            libc::EACCES | libc::EPERM => return E_ACCESSDENIED,
            libc::EINVAL => return E_INVALIDARG,
            libc::ENOSPC | libc::EMFILE | libc::ENFILE | libc::EDQUOT => {
                return E_NOT_ENOUGH_RESOURCES;
            }
            _ => {}
        }
    }

    match error.kind() {
        ErrorKind::OutOfMemory => E_OUTOFMEMORY,
        ErrorKind::PermissionDenied => E_ACCESSDENIED,
        ErrorKind::InvalidInput => E_INVALIDARG,
        ErrorKind::InvalidData => E_INVALID_DATA,
        _ => E_FAIL,
    }
}
