use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Firmware platform a boot entry targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BootPlatform {
    Bios,
    Uefi,
}

impl BootPlatform {
    /// El Torito platform id written into the boot catalog.
    pub fn platform_id(&self) -> u8 {
        match self {
            Self::Bios => 0x00,
            Self::Uefi => 0xEF,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Bios => "bios",
            Self::Uefi => "uefi",
        }
    }
}

impl fmt::Display for BootPlatform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmulationMode {
    NoEmulation,
}

impl fmt::Display for EmulationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoEmulation => f.write_str("none"),
        }
    }
}

/// Bit set of file systems the image builder should emit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FileSystemFlags(u8);

impl FileSystemFlags {
    pub const ISO9660: Self = Self(1);
    pub const JOLIET: Self = Self(2);
    pub const UDF: Self = Self(4);
    pub const ALL: Self = Self(7);

    pub fn contains(&self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl Default for FileSystemFlags {
    /// UDF, so files above 4 GiB survive.
    fn default() -> Self {
        Self::UDF
    }
}

impl fmt::Display for FileSystemFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names = Vec::new();
        if self.contains(Self::ISO9660) {
            names.push("iso9660");
        }
        if self.contains(Self::JOLIET) {
            names.push("joliet");
        }
        if self.contains(Self::UDF) {
            names.push("udf");
        }
        f.write_str(&names.join("+"))
    }
}

/// User-facing file system selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum FileSystemType {
    Iso9660,
    Joliet,
    #[default]
    Udf,
    All,
}

impl FileSystemType {
    pub fn flags(&self) -> FileSystemFlags {
        match self {
            Self::Iso9660 => FileSystemFlags::ISO9660,
            Self::Joliet => FileSystemFlags::JOLIET,
            Self::Udf => FileSystemFlags::UDF,
            Self::All => FileSystemFlags::ALL,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Iso9660 => "iso9660",
            Self::Joliet => "joliet",
            Self::Udf => "udf",
            Self::All => "all",
        }
    }
}

/// Physical layout of a built image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageGeometry {
    pub block_size: u32,
    pub total_blocks: u64,
}

impl ImageGeometry {
    pub fn new(block_size: u32, total_blocks: u64) -> Self {
        Self {
            block_size,
            total_blocks,
        }
    }

    /// Total image length in bytes, `None` on overflow.
    pub fn total_bytes(&self) -> Option<u64> {
        (self.block_size as u64).checked_mul(self.total_blocks)
    }
}

/// Descriptor of a successfully written image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageDescriptor {
    pub path: PathBuf,
    pub size_bytes: u64,
    pub boot_platforms: Vec<BootPlatform>,
    /// BLAKE3 digest of the image bytes, hex encoded
    pub digest: Option<String>,
}

impl ImageDescriptor {
    pub fn is_bootable(&self) -> bool {
        !self.boot_platforms.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_system_flags_bits() {
        assert_eq!(FileSystemType::All.flags(), FileSystemFlags::ALL);
        assert!(FileSystemFlags::ALL.contains(FileSystemFlags::JOLIET));
        assert!(!FileSystemFlags::UDF.contains(FileSystemFlags::ISO9660));
        assert_eq!(FileSystemFlags::default(), FileSystemFlags::UDF);
        assert_eq!(FileSystemFlags::ALL.to_string(), "iso9660+joliet+udf");
        assert_eq!(FileSystemFlags::UDF.to_string(), "udf");
    }

    #[test]
    fn test_geometry_total_bytes() {
        assert_eq!(ImageGeometry::new(2048, 10).total_bytes(), Some(20480));
        assert_eq!(ImageGeometry::new(2048, 0).total_bytes(), Some(0));
        assert_eq!(ImageGeometry::new(u32::MAX, u64::MAX).total_bytes(), None);
    }

    #[test]
    fn test_platform_ids() {
        assert_eq!(BootPlatform::Bios.platform_id(), 0x00);
        assert_eq!(BootPlatform::Uefi.platform_id(), 0xEF);
    }
}
