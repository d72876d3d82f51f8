use std::ffi::OsString;
use std::io::{self, Read};
use std::process::{Child, ChildStdout, Command, Stdio};
use tracing::{debug, info, warn};

use super::{BuildRequest, BuiltImage, ImageBuilder, MkisofsConfig, validate_request};
use crate::core::boot_catalog::BootEntry;
use crate::core::error::BuildError;
use crate::core::models::{BootPlatform, FileSystemFlags, ImageGeometry};
use crate::core::result::E_FAIL;

/// Logical block size of ISO9660 images.
pub const MKISOFS_BLOCK_SIZE: u32 = 2048;

const BOOT_CATALOG_NAME: &str = "boot.catalog";

/// BIOS boot sectors load this many 512-byte sectors in no-emulation mode.
const BIOS_LOAD_SECTORS: &str = "8";

/// Builds images with an external mkisofs-compatible tool.
///
/// The tool is run twice: once with `-print-size` to learn the block count,
/// then for real with the image written to its stdout. The returned stream
/// owns the child process and kills it if dropped before the end.
#[derive(Debug, Clone)]
pub struct MkisofsBuilder {
    config: MkisofsConfig,
}

impl MkisofsBuilder {
    pub fn new(config: MkisofsConfig) -> Self {
        Self { config }
    }

    fn image_args(&self, request: &BuildRequest, boot: &[BootEntry]) -> Vec<OsString> {
        let mut args: Vec<OsString> = self.config.prefix_args.iter().map(OsString::from).collect();

        args.push("-V".into());
        args.push(request.volume_label.clone().into());

        let flags = request.file_systems;
        if flags.contains(FileSystemFlags::ISO9660) {
            args.extend(["-iso-level", "3"].map(OsString::from));
        }
        if flags.contains(FileSystemFlags::JOLIET) {
            args.extend(["-J", "-joliet-long"].map(OsString::from));
        }
        if flags.contains(FileSystemFlags::UDF) {
            args.push("-udf".into());
        }

        for (index, entry) in boot.iter().enumerate() {
            if index > 0 {
                args.push("-eltorito-alt-boot".into());
            }
            match entry.platform() {
                BootPlatform::Bios => {
                    args.push("-b".into());
                    args.push(entry.relative_path().into());
                    args.extend(["-no-emul-boot", "-boot-load-size", BIOS_LOAD_SECTORS].map(OsString::from));
                }
                BootPlatform::Uefi => {
                    args.push("-e".into());
                    args.push(entry.relative_path().into());
                    args.push("-no-emul-boot".into());
                }
            }
        }
        if !boot.is_empty() {
            args.push("-c".into());
            args.push(BOOT_CATALOG_NAME.into());
        }

        args
    }

    fn print_size(&self, args: &[OsString], request: &BuildRequest) -> Result<u64, BuildError> {
        let output = Command::new(&self.config.program)
            .args(args)
            .args(["-quiet", "-print-size"])
            .arg(&request.source)
            .stdin(Stdio::null())
            .output()
            .map_err(|source| BuildError::ToolUnavailable {
                program: self.config.program.clone(),
                source,
            })?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);

        if !output.status.success() {
            return Err(BuildError::Builder {
                message: format!(
                    "{} -print-size failed with {}: {}",
                    self.config.program,
                    output.status,
                    stderr.trim()
                ),
                code: E_FAIL,
            });
        }

        parse_print_size(&stdout, &stderr).ok_or_else(|| BuildError::Builder {
            message: format!(
                "could not parse image size from {} output",
                self.config.program
            ),
            code: E_FAIL,
        })
    }
}

impl ImageBuilder for MkisofsBuilder {
    fn build(&self, request: &BuildRequest, boot: &[BootEntry]) -> Result<BuiltImage, BuildError> {
        validate_request(request)?;

        let args = self.image_args(request, boot);
        debug!(program = %self.config.program, ?args, "Image builder arguments");

        let total_blocks = self.print_size(&args, request)?;
        let geometry = ImageGeometry::new(MKISOFS_BLOCK_SIZE, total_blocks);

        let mut child = Command::new(&self.config.program)
            .args(&args)
            .arg("-quiet")
            .arg(&request.source)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|source| BuildError::ToolUnavailable {
                program: self.config.program.clone(),
                source,
            })?;

        let stdout = match child.stdout.take() {
            Some(stdout) => stdout,
            None => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(BuildError::Builder {
                    message: "image builder stdout was not captured".to_string(),
                    code: E_FAIL,
                });
            }
        };

        info!(
            program = %self.config.program,
            total_blocks,
            boot_entries = boot.len(),
            "Image builder started"
        );

        Ok(BuiltImage {
            geometry,
            stream: Box::new(ChildStream {
                program: self.config.program.clone(),
                child,
                stdout,
                finished: false,
            }),
        })
    }
}

/// Find the block count printed by `-print-size`.
///
/// xorriso prints the bare number on stdout; genisoimage prints
/// "Total extents scheduled to be written = N" on stderr.
pub fn parse_print_size(stdout: &str, stderr: &str) -> Option<u64> {
    let bare = stdout
        .lines()
        .rev()
        .find_map(|line| line.trim().parse::<u64>().ok());
    if bare.is_some() {
        return bare;
    }

    stderr
        .lines()
        .rev()
        .filter(|line| line.contains('='))
        .find_map(|line| line.rsplit('=').next()?.trim().parse::<u64>().ok())
}

/// Image bytes read from the builder's stdout.
struct ChildStream {
    program: String,
    child: Child,
    stdout: ChildStdout,
    finished: bool,
}

impl Read for ChildStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.stdout.read(buf)?;
        if n == 0 && !buf.is_empty() && !self.finished {
            self.finished = true;
            let status = self.child.wait()?;
            if !status.success() {
                return Err(io::Error::other(format!(
                    "{} exited with {}",
                    self.program, status
                )));
            }
        }
        Ok(n)
    }
}

impl Drop for ChildStream {
    fn drop(&mut self) {
        if !self.finished {
            warn!(program = %self.program, "Image stream dropped early, killing builder");
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::boot_catalog;
    use crate::core::copier::{self, CopyOptions};
    use crate::core::error::CopyError;
    use crate::core::result::{ResultCategory, interpret};
    use std::fs;
    use std::path::Path;
    use std::time::{Duration, Instant};
    use tempfile::tempdir;
    use tokio_util::sync::CancellationToken;

    /// A stand-in tool: answers `-print-size` with `size`, otherwise runs `image`.
    fn fake_tool(size: &str, image: &str) -> MkisofsBuilder {
        let script = format!(
            "case \" $* \" in *\" -print-size \"*) {size};; *) {image};; esac"
        );
        MkisofsBuilder::new(MkisofsConfig {
            program: "sh".to_string(),
            prefix_args: vec!["-c".to_string(), script, "fake-mkisofs".to_string()],
        })
    }

    fn data_request(source: &Path) -> BuildRequest {
        BuildRequest {
            source: source.to_path_buf(),
            file_systems: FileSystemFlags::UDF,
            volume_label: "DATA".to_string(),
        }
    }

    fn create_file(path: &Path, content: &[u8]) {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(path, content).unwrap();
    }

    fn strings(args: &[OsString]) -> Vec<String> {
        args.iter().map(|a| a.to_string_lossy().into_owned()).collect()
    }

    #[test]
    fn test_args_for_dual_boot_all_file_systems() {
        let temp = tempdir().unwrap();
        create_file(&temp.path().join("boot/etfsboot.com"), b"bios");
        create_file(&temp.path().join("efi/microsoft/boot/efisys.bin"), b"uefi");
        let catalog = boot_catalog::discover(temp.path());

        let builder = MkisofsBuilder::new(MkisofsConfig::default());
        let request = BuildRequest {
            source: temp.path().to_path_buf(),
            file_systems: FileSystemFlags::ALL,
            volume_label: "WIN11".to_string(),
        };
        let args = strings(&builder.image_args(&request, catalog.entries()));

        assert_eq!(
            args,
            vec![
                "-as", "mkisofs", "-V", "WIN11", "-iso-level", "3", "-J", "-joliet-long",
                "-udf", "-b", "boot/etfsboot.com", "-no-emul-boot", "-boot-load-size", "8",
                "-eltorito-alt-boot", "-e", "efi/microsoft/boot/efisys.bin", "-no-emul-boot",
                "-c", "boot.catalog",
            ]
        );
    }

    #[test]
    fn test_args_without_boot_entries() {
        let temp = tempdir().unwrap();
        let builder = MkisofsBuilder::new(MkisofsConfig {
            program: "genisoimage".to_string(),
            prefix_args: Vec::new(),
        });
        let request = BuildRequest {
            source: temp.path().to_path_buf(),
            file_systems: FileSystemFlags::UDF,
            volume_label: "DATA".to_string(),
        };
        let args = strings(&builder.image_args(&request, &[]));

        assert_eq!(args, vec!["-V", "DATA", "-udf"]);
    }

    #[test]
    fn test_parse_print_size_xorriso() {
        assert_eq!(parse_print_size("12345\n", ""), Some(12345));
    }

    #[test]
    fn test_parse_print_size_genisoimage() {
        let stderr = "I: -input-charset not specified\nTotal extents scheduled to be written = 2048\n";
        assert_eq!(parse_print_size("", stderr), Some(2048));
    }

    #[test]
    fn test_parse_print_size_garbage() {
        assert_eq!(parse_print_size("hello\n", "world\n"), None);
    }

    #[test]
    fn test_missing_tool_is_reported() {
        let temp = tempdir().unwrap();
        let builder = MkisofsBuilder::new(MkisofsConfig {
            program: "/nonexistent/isoforge-mkisofs".to_string(),
            prefix_args: Vec::new(),
        });
        let request = BuildRequest {
            source: temp.path().to_path_buf(),
            file_systems: FileSystemFlags::UDF,
            volume_label: "DATA".to_string(),
        };

        let err = builder.build(&request, &[]).unwrap_err();
        assert!(matches!(err, BuildError::ToolUnavailable { .. }));
    }

    #[test]
    fn test_streams_tool_output_into_copier() {
        let temp = tempdir().unwrap();
        let source = temp.path().join("src");
        fs::create_dir(&source).unwrap();
        let dest = temp.path().join("out.iso");
        let builder = fake_tool("echo 4", "dd if=/dev/zero bs=2048 count=4 2>/dev/null");

        let image = builder.build(&data_request(&source), &[]).unwrap();
        assert_eq!(image.geometry, ImageGeometry::new(MKISOFS_BLOCK_SIZE, 4));

        let summary = copier::copy_image(
            image.stream,
            image.geometry,
            &dest,
            &CopyOptions::default(),
            &CancellationToken::new(),
            |_| {},
        )
        .unwrap();

        assert_eq!(summary.bytes_written, 8192);
        assert_eq!(fs::read(&dest).unwrap(), vec![0u8; 8192]);
    }

    #[test]
    fn test_tool_failure_after_streaming_fails_copy() {
        let temp = tempdir().unwrap();
        let source = temp.path().join("src");
        fs::create_dir(&source).unwrap();
        let dest = temp.path().join("out.iso");
        let builder = fake_tool("echo 4", "dd if=/dev/zero bs=2048 count=4 2>/dev/null; exit 3");

        let image = builder.build(&data_request(&source), &[]).unwrap();
        let err = copier::copy_image(
            image.stream,
            image.geometry,
            &dest,
            &CopyOptions::default(),
            &CancellationToken::new(),
            |_| {},
        )
        .unwrap_err();

        assert_eq!(interpret(err.code()).category, ResultCategory::GeneralError);
        assert!(!dest.exists());
        assert!(!copier::staging_path(&dest).exists());
    }

    #[test]
    fn test_tool_stream_shorter_than_print_size() {
        let temp = tempdir().unwrap();
        let source = temp.path().join("src");
        fs::create_dir(&source).unwrap();
        let dest = temp.path().join("out.iso");
        let builder = fake_tool("echo 8", "dd if=/dev/zero bs=2048 count=4 2>/dev/null");

        let image = builder.build(&data_request(&source), &[]).unwrap();
        let err = copier::copy_image(
            image.stream,
            image.geometry,
            &dest,
            &CopyOptions::default(),
            &CancellationToken::new(),
            |_| {},
        )
        .unwrap_err();

        assert!(matches!(err, CopyError::ShortTransfer { .. }));
        assert!(!dest.exists());
    }

    #[test]
    fn test_print_size_failure_is_builder_error() {
        let temp = tempdir().unwrap();
        let builder = fake_tool("echo 'no such option' >&2; exit 2", "exit 0");

        let err = builder.build(&data_request(temp.path()), &[]).unwrap_err();

        match err {
            BuildError::Builder { message, code } => {
                assert!(message.contains("no such option"));
                assert_eq!(code, E_FAIL);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_unparseable_print_size_is_builder_error() {
        let temp = tempdir().unwrap();
        let builder = fake_tool("echo 'lots of blocks'", "exit 0");

        let err = builder.build(&data_request(temp.path()), &[]).unwrap_err();
        assert!(matches!(err, BuildError::Builder { .. }));
    }

    #[test]
    fn test_dropping_stream_kills_tool() {
        let temp = tempdir().unwrap();
        let builder = fake_tool("echo 4", "exec sleep 30");

        let image = builder.build(&data_request(temp.path()), &[]).unwrap();
        let start = Instant::now();
        drop(image);

        assert!(start.elapsed() < Duration::from_secs(10));
    }
}
