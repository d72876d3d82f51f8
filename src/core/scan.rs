use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Result of scanning a source tree.
#[derive(Debug, Default)]
pub struct ScanResult {
    /// All regular files, sorted by path
    pub files: Vec<FileInfo>,
    /// Total size of all files in bytes
    pub total_bytes: u64,
}

#[derive(Debug, Clone)]
pub struct FileInfo {
    /// Absolute path to the file
    pub path: PathBuf,
    /// Path relative to the scan root
    pub relative: PathBuf,
    pub size: u64,
}

/// Scan a directory recursively. Symlinks and special files are skipped.
pub fn scan_directory(source: &Path) -> io::Result<ScanResult> {
    let mut result = ScanResult::default();
    scan_directory_recursive(source, source, &mut result)?;
    result.files.sort_by(|a, b| a.relative.cmp(&b.relative));
    Ok(result)
}

fn scan_directory_recursive(base: &Path, current: &Path, result: &mut ScanResult) -> io::Result<()> {
    let mut entries = fs::read_dir(current)?.collect::<io::Result<Vec<_>>>()?;
    entries.sort_by_key(|e| e.file_name());

    for entry in entries {
        let path = entry.path();

        // Use symlink_metadata to avoid following symlinks
        let metadata = match path.symlink_metadata() {
            Ok(m) => m,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Skipping unreadable entry");
                continue;
            }
        };

        if metadata.is_dir() {
            scan_directory_recursive(base, &path, result)?;
        } else if metadata.is_file() {
            let relative = path.strip_prefix(base).unwrap_or(&path).to_path_buf();
            result.total_bytes += metadata.len();
            result.files.push(FileInfo {
                path,
                relative,
                size: metadata.len(),
            });
        }
    }

    Ok(())
}
