//! Boot catalog discovery.
//!
//! Looks for the well-known BIOS and UEFI boot sector files in the source
//! tree and opens each one that is present. A missing file means the image
//! simply won't boot on that platform; a file that exists but can't be loaded
//! is logged and skipped. Neither case fails the job.

use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Component, Path, PathBuf};
use tracing::{debug, info, warn};

use crate::core::models::{BootPlatform, EmulationMode};

pub const BOOT_MANUFACTURER: &str = "Microsoft";

/// Boot sector files looked up, in catalog order.
pub const BOOT_FILES: [(&str, BootPlatform); 2] = [
    ("boot/etfsboot.com", BootPlatform::Bios),
    ("efi/microsoft/boot/efisys.bin", BootPlatform::Uefi),
];

/// One boot catalog entry backed by an open, read-only boot image handle.
///
/// The handle is closed when the entry is dropped, which happens as soon as
/// the filesystem image has been built from the catalog.
#[derive(Debug)]
pub struct BootEntry {
    platform: BootPlatform,
    emulation: EmulationMode,
    manufacturer: String,
    relative_path: PathBuf,
    image: File,
    size: u64,
}

impl BootEntry {
    pub fn platform(&self) -> BootPlatform {
        self.platform
    }

    pub fn emulation(&self) -> EmulationMode {
        self.emulation
    }

    pub fn manufacturer(&self) -> &str {
        &self.manufacturer
    }

    /// Location of the boot image relative to the source root, with the
    /// on-disk casing.
    pub fn relative_path(&self) -> &Path {
        &self.relative_path
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Read the whole boot image from the held handle.
    pub fn read_image(&self) -> io::Result<Vec<u8>> {
        let mut handle = &self.image;
        handle.seek(SeekFrom::Start(0))?;
        let mut bytes = Vec::with_capacity(self.size as usize);
        handle.read_to_end(&mut bytes)?;
        Ok(bytes)
    }
}

/// A boot file that was present but could not be loaded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkippedBoot {
    pub platform: BootPlatform,
    pub path: PathBuf,
    pub reason: String,
}

#[derive(Debug, Default)]
pub struct BootCatalog {
    entries: Vec<BootEntry>,
    skipped: Vec<SkippedBoot>,
}

impl BootCatalog {
    pub fn entries(&self) -> &[BootEntry] {
        &self.entries
    }

    pub fn skipped(&self) -> &[SkippedBoot] {
        &self.skipped
    }

    pub fn platforms(&self) -> Vec<BootPlatform> {
        self.entries.iter().map(|e| e.platform).collect()
    }
}

/// Discover boot entries for the canonical BIOS/UEFI boot files.
pub fn discover(source: &Path) -> BootCatalog {
    discover_with(source, &BOOT_FILES)
}

/// Discover boot entries for an explicit ordered list of candidates.
pub fn discover_with(source: &Path, candidates: &[(&str, BootPlatform)]) -> BootCatalog {
    let mut catalog = BootCatalog::default();

    for (relative, platform) in candidates {
        let Some(resolved) = resolve_case_insensitive(source, Path::new(relative)) else {
            debug!(platform = %platform, file = relative, "Boot file not present, skipping");
            continue;
        };

        match load_entry(source, &resolved, *platform) {
            Ok(entry) => {
                info!(
                    platform = %platform,
                    file = %entry.relative_path.display(),
                    size = entry.size,
                    "Added boot entry"
                );
                catalog.entries.push(entry);
            }
            Err(e) => {
                warn!(
                    platform = %platform,
                    file = %resolved.display(),
                    error = %e,
                    "Boot file could not be loaded, image will not boot on this platform"
                );
                catalog.skipped.push(SkippedBoot {
                    platform: *platform,
                    path: resolved,
                    reason: e.to_string(),
                });
            }
        }
    }

    catalog
}

fn load_entry(source: &Path, path: &Path, platform: BootPlatform) -> io::Result<BootEntry> {
    let metadata = fs::metadata(path)?;
    if !metadata.is_file() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "boot image is not a regular file",
        ));
    }

    let mut image = File::open(path)?;

    // Readability check; contents are not validated beyond this
    let mut first_byte = [0u8; 1];
    image.read(&mut first_byte).map(|_| ())?;
    image.seek(SeekFrom::Start(0))?;

    let relative_path = path.strip_prefix(source).unwrap_or(path).to_path_buf();

    Ok(BootEntry {
        platform,
        emulation: EmulationMode::NoEmulation,
        manufacturer: BOOT_MANUFACTURER.to_string(),
        relative_path,
        image,
        size: metadata.len(),
    })
}

/// Resolve `relative` under `base`, matching each component without regard
/// to ASCII case. Source trees copied from Windows media use `EFI/Microsoft`.
fn resolve_case_insensitive(base: &Path, relative: &Path) -> Option<PathBuf> {
    let mut current = base.to_path_buf();

    for component in relative.components() {
        let Component::Normal(wanted) = component else {
            return None;
        };

        let exact = current.join(wanted);
        if exact.symlink_metadata().is_ok() {
            current = exact;
            continue;
        }

        let wanted = wanted.to_str()?;
        let found = fs::read_dir(&current)
            .ok()?
            .filter_map(|e| e.ok())
            .find(|e| e.file_name().to_str().is_some_and(|n| n.eq_ignore_ascii_case(wanted)))?;
        current = found.path();
    }

    Some(current)
}
