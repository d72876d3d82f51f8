pub mod boot_catalog;
pub mod copier;
pub mod error;
pub mod image_builder;
pub mod label;
pub mod models;
pub mod orchestrator;
pub mod request;
pub mod result;
pub mod scan;
pub mod worker;

pub use boot_catalog::{BootCatalog, BootEntry};
pub use copier::{CopyPlan, copy_image};
pub use error::{BuildError, CopyError, PipelineError};
pub use image_builder::{ImageBuilder, ImageBuilderType, create_builder};
pub use models::{BootPlatform, FileSystemType, ImageDescriptor, ImageGeometry};
pub use orchestrator::{JobEvent, JobReport, JobState, JobTimeouts, Orchestrator, ProcessLauncher};
pub use request::{JobRequest, RequestOptions};
pub use result::{JobResult, ResultCategory, interpret};
