//! Job parameters and pre-flight checks.

use serde::{Deserialize, Serialize};
use std::ffi::OsString;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{info, warn};

use crate::core::copier::CopyOptions;
use crate::core::image_builder::{BuildRequest, ImageBuilderType};
use crate::core::label::sanitize_label;
use crate::core::models::FileSystemType;
use crate::core::scan::scan_directory;

/// Single-layer DVD capacity; larger sources still build but won't fit.
pub const DVD_CAPACITY_BYTES: u64 = 4_700_000_000;

#[derive(Debug, Error)]
pub enum RequestError {
    #[error("Source directory does not exist: {0}")]
    SourceMissing(PathBuf),

    #[error("Source is not a directory: {0}")]
    SourceNotDirectory(PathBuf),

    #[error("Cannot derive a destination path from source {0}")]
    NoDefaultDestination(PathBuf),

    #[error("Destination already exists: {0}. Pass --overwrite to replace it.")]
    DestinationExists(PathBuf),

    #[error("Failed to create destination directory {path}: {source}")]
    CreateParent { path: PathBuf, source: io::Error },

    #[error("Failed to inspect {path}: {source}")]
    Io { path: PathBuf, source: io::Error },
}

/// Raw, possibly incomplete job parameters.
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    pub source: PathBuf,
    pub destination: Option<PathBuf>,
    pub label: Option<String>,
    pub file_system: FileSystemType,
    pub overwrite: bool,
    pub builder: ImageBuilderType,
}

/// Fully resolved parameters for one image job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRequest {
    pub source: PathBuf,
    pub destination: PathBuf,
    pub label: String,
    pub file_system: FileSystemType,
    pub overwrite: bool,
    pub builder: ImageBuilderType,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreflightReport {
    pub source_bytes: u64,
    pub file_count: usize,
    pub exceeds_media: bool,
}

impl JobRequest {
    /// Fill in defaults: destination `<source>.iso` beside the source, label
    /// from the destination's base name.
    pub fn resolve(options: RequestOptions) -> Result<Self, RequestError> {
        let source = fs::canonicalize(&options.source).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => RequestError::SourceMissing(options.source.clone()),
            _ => RequestError::Io {
                path: options.source.clone(),
                source: e,
            },
        })?;

        if !source.is_dir() {
            return Err(RequestError::SourceNotDirectory(source));
        }

        let destination = match options.destination {
            Some(dest) => std::path::absolute(&dest).map_err(|e| RequestError::Io {
                path: dest.clone(),
                source: e,
            })?,
            None => default_destination(&source)?,
        };

        let label = match options.label {
            Some(label) => sanitize_label(&label),
            None => sanitize_label(
                &destination
                    .file_stem()
                    .map(|s| s.to_string_lossy().into_owned())
                    .unwrap_or_default(),
            ),
        };

        Ok(Self {
            source,
            destination,
            label,
            file_system: options.file_system,
            overwrite: options.overwrite,
            builder: options.builder,
        })
    }

    /// Check the destination, create its parent and size up the source.
    pub fn preflight(&self) -> Result<PreflightReport, RequestError> {
        if self.destination.exists() && !self.overwrite {
            return Err(RequestError::DestinationExists(self.destination.clone()));
        }

        if let Some(parent) = self.destination.parent() {
            fs::create_dir_all(parent).map_err(|source| RequestError::CreateParent {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let scan = scan_directory(&self.source).map_err(|source| RequestError::Io {
            path: self.source.clone(),
            source,
        })?;

        let exceeds_media = scan.total_bytes > DVD_CAPACITY_BYTES;
        if exceeds_media {
            warn!(
                source_bytes = scan.total_bytes,
                capacity = DVD_CAPACITY_BYTES,
                "Source exceeds single-layer DVD capacity; the image will need larger media"
            );
        }

        info!(
            files = scan.files.len(),
            source_bytes = scan.total_bytes,
            "Pre-flight checks passed"
        );

        Ok(PreflightReport {
            source_bytes: scan.total_bytes,
            file_count: scan.files.len(),
            exceeds_media,
        })
    }

    pub fn build_request(&self) -> BuildRequest {
        BuildRequest {
            source: self.source.clone(),
            file_systems: self.file_system.flags(),
            volume_label: self.label.clone(),
        }
    }

    pub fn copy_options(&self) -> CopyOptions {
        CopyOptions {
            overwrite: self.overwrite,
        }
    }

    /// Arguments for the hidden `worker` subcommand.
    pub fn worker_args(&self) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec![
            "--source".into(),
            self.source.clone().into(),
            "--destination".into(),
            self.destination.clone().into(),
            "--label".into(),
            self.label.clone().into(),
            "--file-system".into(),
            self.file_system.as_str().into(),
            "--builder".into(),
            self.builder.as_str().into(),
        ];
        if self.overwrite {
            args.push("--overwrite".into());
        }
        args
    }
}

fn default_destination(source: &Path) -> Result<PathBuf, RequestError> {
    let name = source
        .file_name()
        .ok_or_else(|| RequestError::NoDefaultDestination(source.to_path_buf()))?;
    let parent = source
        .parent()
        .ok_or_else(|| RequestError::NoDefaultDestination(source.to_path_buf()))?;

    let mut file_name = name.to_os_string();
    file_name.push(".iso");
    Ok(parent.join(file_name))
}
