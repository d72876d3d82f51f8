use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::io::Read;
use std::path::PathBuf;

use crate::core::boot_catalog::BootEntry;
use crate::core::error::BuildError;
use crate::core::models::{FileSystemFlags, ImageGeometry};

pub mod mkisofs;
pub mod simulated;

pub use mkisofs::MkisofsBuilder;
pub use simulated::SimulatedBuilder;

/// Inputs to a filesystem image build.
#[derive(Debug, Clone)]
pub struct BuildRequest {
    pub source: PathBuf,
    pub file_systems: FileSystemFlags,
    pub volume_label: String,
}

/// A finished image: its geometry plus a stream positioned at offset 0.
pub struct BuiltImage {
    pub geometry: ImageGeometry,
    pub stream: Box<dyn Read + Send>,
}

impl std::fmt::Debug for BuiltImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BuiltImage")
            .field("geometry", &self.geometry)
            .finish_non_exhaustive()
    }
}

/// Assembles the ISO9660/Joliet/UDF structure for a source tree.
///
/// Implementations must accept an empty boot entry list (non-bootable image)
/// as well as several entries (multi-platform boot). Boot entries are only
/// borrowed for the duration of the call.
pub trait ImageBuilder: Send + Sync {
    fn build(&self, request: &BuildRequest, boot: &[BootEntry]) -> Result<BuiltImage, BuildError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ImageBuilderType {
    #[default]
    Mkisofs,
    Simulated,
}

impl ImageBuilderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Mkisofs => "mkisofs",
            Self::Simulated => "simulated",
        }
    }
}

/// Settings for the external mkisofs-compatible tool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MkisofsConfig {
    pub program: String,
    /// Arguments placed before the generated ones, e.g. `-as mkisofs`
    pub prefix_args: Vec<String>,
}

impl Default for MkisofsConfig {
    fn default() -> Self {
        Self {
            program: "xorriso".to_string(),
            prefix_args: vec!["-as".to_string(), "mkisofs".to_string()],
        }
    }
}

pub fn create_builder(builder_type: ImageBuilderType, config: &MkisofsConfig) -> Box<dyn ImageBuilder> {
    match builder_type {
        ImageBuilderType::Mkisofs => Box::new(MkisofsBuilder::new(config.clone())),
        ImageBuilderType::Simulated => Box::new(SimulatedBuilder::default()),
    }
}

/// Shared parameter validation for builder implementations.
pub(crate) fn validate_request(request: &BuildRequest) -> Result<(), BuildError> {
    if request.volume_label.is_empty() {
        return Err(BuildError::InvalidParameter(
            "volume label must not be empty".to_string(),
        ));
    }
    if !request.source.is_dir() {
        return Err(BuildError::InvalidParameter(format!(
            "source {} is not a directory",
            request.source.display()
        )));
    }
    Ok(())
}
