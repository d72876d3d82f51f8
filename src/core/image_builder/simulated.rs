use std::collections::VecDeque;
use std::fmt::Write as _;
use std::fs::File;
use std::io::{self, Cursor, Read};
use std::path::PathBuf;
use tracing::{debug, info};

use super::{BuildRequest, BuiltImage, ImageBuilder, validate_request};
use crate::core::boot_catalog::BootEntry;
use crate::core::error::BuildError;
use crate::core::models::ImageGeometry;
use crate::core::scan::{ScanResult, scan_directory};

pub const SIMULATED_BLOCK_SIZE: u32 = 2048;

const HEADER_MAGIC: &str = "ISOFORGE-SIMULATED-IMAGE";

/// Deterministic stand-in for a real image builder.
///
/// Lays out a header block describing the volume and boot catalog, then each
/// boot image, then every source file, each padded to a whole block. Source
/// files are streamed from disk lazily, so large trees don't sit in memory.
#[derive(Debug, Default)]
pub struct SimulatedBuilder;

impl ImageBuilder for SimulatedBuilder {
    fn build(&self, request: &BuildRequest, boot: &[BootEntry]) -> Result<BuiltImage, BuildError> {
        validate_request(request)?;

        let scan = scan_directory(&request.source).map_err(|source| BuildError::Source {
            path: request.source.clone(),
            source,
        })?;

        let mut layout = Layout::default();
        layout.push_bytes(render_header(request, boot, &scan).into_bytes());

        // Boot images are copied out now; the handles don't outlive this call
        for entry in boot {
            layout.push_bytes(entry.read_image()?);
        }

        for file in &scan.files {
            layout.push_file(file.path.clone(), file.size);
        }

        let geometry = ImageGeometry::new(SIMULATED_BLOCK_SIZE, layout.blocks);

        info!(
            files = scan.files.len(),
            boot_entries = boot.len(),
            total_blocks = geometry.total_blocks,
            "Simulated image laid out"
        );

        Ok(BuiltImage {
            geometry,
            stream: Box::new(SegmentReader {
                segments: layout.segments,
                current: None,
            }),
        })
    }
}

fn render_header(request: &BuildRequest, boot: &[BootEntry], scan: &ScanResult) -> String {
    let mut header = String::new();
    let _ = writeln!(header, "{}", HEADER_MAGIC);
    let _ = writeln!(header, "label={}", request.volume_label);
    let _ = writeln!(header, "filesystems={}", request.file_systems);
    for entry in boot {
        let _ = writeln!(
            header,
            "boot platform={} id=0x{:02X} emulation={} manufacturer={} path={} size={}",
            entry.platform(),
            entry.platform().platform_id(),
            entry.emulation(),
            entry.manufacturer(),
            entry.relative_path().display(),
            entry.size()
        );
    }
    let _ = writeln!(
        header,
        "files={} bytes={}",
        scan.files.len(),
        scan.total_bytes
    );
    header
}

enum Segment {
    Bytes(Vec<u8>),
    File { path: PathBuf, size: u64 },
    Zeros(u64),
}

impl Segment {
    fn open(self) -> io::Result<Box<dyn Read + Send>> {
        Ok(match self {
            Self::Bytes(bytes) => Box::new(Cursor::new(bytes)),
            Self::File { path, size } => Box::new(File::open(path)?.take(size)),
            Self::Zeros(len) => Box::new(io::repeat(0).take(len)),
        })
    }
}

#[derive(Default)]
struct Layout {
    segments: VecDeque<Segment>,
    blocks: u64,
}

impl Layout {
    fn push_bytes(&mut self, bytes: Vec<u8>) {
        let len = bytes.len() as u64;
        self.segments.push_back(Segment::Bytes(bytes));
        self.pad(len);
    }

    fn push_file(&mut self, path: PathBuf, size: u64) {
        debug!(path = %path.display(), size, "Adding file");
        self.segments.push_back(Segment::File { path, size });
        self.pad(size);
    }

    fn pad(&mut self, len: u64) {
        let block = SIMULATED_BLOCK_SIZE as u64;
        let blocks = len.div_ceil(block);
        let padding = blocks * block - len;
        if padding > 0 {
            self.segments.push_back(Segment::Zeros(padding));
        }
        self.blocks += blocks;
    }
}

/// Reads each segment to exhaustion in order.
struct SegmentReader {
    segments: VecDeque<Segment>,
    current: Option<Box<dyn Read + Send>>,
}

impl Read for SegmentReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        loop {
            if let Some(reader) = self.current.as_mut() {
                let n = reader.read(buf)?;
                if n > 0 {
                    return Ok(n);
                }
                self.current = None;
            }

            match self.segments.pop_front() {
                Some(segment) => self.current = Some(segment.open()?),
                None => return Ok(0),
            }
        }
    }
}
