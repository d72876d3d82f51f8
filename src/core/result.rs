//! Result code interpretation.
//!
//! Every job reduces to a single integer result code. Codes 1-4 come from the
//! image stream copier, HRESULT-style codes come from the image builder (or
//! from OS errors classified into the same space), and a few synthetic codes
//! are produced by the orchestrator itself when the worker never reports.
//!
//! All of them are mapped through [`RESULT_TABLE`] so the taxonomy stays in
//! one place.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Converts an HRESULT bit pattern into the signed code carried by jobs.
const fn hresult(bits: u32) -> i32 {
    bits as i32
}

pub const SUCCESS: i32 = 0;

pub const COPY_OUTPUT_STREAM: i32 = 1;
pub const COPY_OUT_OF_MEMORY: i32 = 2;
pub const COPY_ACCESS_DENIED: i32 = 3;
pub const COPY_GENERAL_ERROR: i32 = 4;

/// ERROR_NOT_ENOUGH_MEMORY: storage/resources exhausted
pub const E_NOT_ENOUGH_RESOURCES: i32 = hresult(0x8007_0008);
pub const E_OUTOFMEMORY: i32 = hresult(0x8007_000E);
pub const E_ACCESSDENIED: i32 = hresult(0x8007_0005);
pub const E_INVALIDARG: i32 = hresult(0x8007_0057);
/// ERROR_INVALID_DATA: a value handed to the builder was rejected
pub const E_INVALID_DATA: i32 = hresult(0x8007_000D);
pub const E_FAIL: i32 = hresult(0x8000_4005);

/// ERROR_TIMEOUT
pub const TIMEOUT_CODE: i32 = hresult(0x8007_05B4);
/// ERROR_PROCESS_ABORTED
pub const WORKER_CRASH_CODE: i32 = hresult(0x8007_042B);
/// ERROR_CANCELLED
pub const CANCELLED_CODE: i32 = hresult(0x8007_04C7);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResultCategory {
    Success,
    OutputStreamError,
    OutOfMemory,
    AccessDenied,
    GeneralError,
    ResourceExhausted,
    InvalidParameter,
    UnknownComError,
    Timeout,
    WorkerCrash,
    Cancelled,
}

/// Code to category lookup. Codes missing here fall through to
/// `UnknownComError`.
pub const RESULT_TABLE: &[(i32, ResultCategory)] = &[
    (SUCCESS, ResultCategory::Success),
    (COPY_OUTPUT_STREAM, ResultCategory::OutputStreamError),
    (COPY_OUT_OF_MEMORY, ResultCategory::OutOfMemory),
    (COPY_ACCESS_DENIED, ResultCategory::AccessDenied),
    (COPY_GENERAL_ERROR, ResultCategory::GeneralError),
    (E_NOT_ENOUGH_RESOURCES, ResultCategory::ResourceExhausted),
    (E_OUTOFMEMORY, ResultCategory::OutOfMemory),
    (E_ACCESSDENIED, ResultCategory::AccessDenied),
    (E_INVALIDARG, ResultCategory::InvalidParameter),
    (E_INVALID_DATA, ResultCategory::InvalidParameter),
    (E_FAIL, ResultCategory::GeneralError),
    (TIMEOUT_CODE, ResultCategory::Timeout),
    (WORKER_CRASH_CODE, ResultCategory::WorkerCrash),
    (CANCELLED_CODE, ResultCategory::Cancelled),
];

impl ResultCategory {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }

    /// Stable, human-readable diagnosis for the category.
    pub fn diagnosis(&self) -> &'static str {
        match self {
            Self::Success => "Image created successfully.",
            Self::OutputStreamError => {
                "The destination file could not be created or opened. Check that the path is valid and not in use."
            }
            Self::OutOfMemory => {
                "The system ran out of memory while building or writing the image. Close other applications and retry."
            }
            Self::AccessDenied => {
                "Access was denied. Check permissions on the source tree and the destination directory."
            }
            Self::GeneralError => {
                "The image builder or copier failed. See the log output for the underlying error."
            }
            Self::ResourceExhausted => {
                "The image builder ran out of system resources. Free disk space or file handles and retry."
            }
            Self::InvalidParameter => {
                "An invalid parameter reached the image builder. Check the volume label, paths and file system selection."
            }
            Self::UnknownComError => {
                "The image builder reported an unrecognized failure code."
            }
            Self::Timeout => {
                "The image worker exceeded the maximum allowed duration and was terminated."
            }
            Self::WorkerCrash => "The image worker exited without reporting a result.",
            Self::Cancelled => "The job was cancelled and the image worker was terminated.",
        }
    }
}

impl fmt::Display for ResultCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Terminal result of one job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobResult {
    pub code: i32,
    pub category: ResultCategory,
}

impl JobResult {
    pub fn is_success(&self) -> bool {
        self.category.is_success()
    }

    /// Diagnosis text, with the raw code appended for unmapped failures.
    pub fn describe(&self) -> String {
        match self.category {
            ResultCategory::UnknownComError => format!(
                "{} (code 0x{:08X})",
                self.category.diagnosis(),
                self.code as u32
            ),
            _ => self.category.diagnosis().to_string(),
        }
    }
}

impl fmt::Display for JobResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (0x{:08X})", self.category, self.code as u32)
    }
}

/// Map a result code to its category. Never fails.
pub fn interpret(code: i32) -> JobResult {
    let category = RESULT_TABLE
        .iter()
        .find(|(known, _)| *known == code)
        .map(|(_, category)| *category)
        .unwrap_or(ResultCategory::UnknownComError);

    JobResult { code, category }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_copier_codes() {
        assert_eq!(interpret(0).category, ResultCategory::Success);
        assert_eq!(interpret(1).category, ResultCategory::OutputStreamError);
        assert_eq!(interpret(2).category, ResultCategory::OutOfMemory);
        assert_eq!(interpret(3).category, ResultCategory::AccessDenied);
        assert_eq!(interpret(4).category, ResultCategory::GeneralError);
    }

    #[test]
    fn test_native_codes() {
        assert_eq!(
            interpret(E_NOT_ENOUGH_RESOURCES).category,
            ResultCategory::ResourceExhausted
        );
        assert_eq!(interpret(E_OUTOFMEMORY).category, ResultCategory::OutOfMemory);
        assert_eq!(interpret(E_INVALIDARG).category, ResultCategory::InvalidParameter);
        assert_eq!(interpret(E_ACCESSDENIED).category, ResultCategory::AccessDenied);
        assert_eq!(interpret(E_INVALID_DATA).category, ResultCategory::InvalidParameter);
        assert_eq!(interpret(E_FAIL).category, ResultCategory::GeneralError);
        assert_eq!(interpret(-2147024882).category, ResultCategory::OutOfMemory);
    }

    #[test]
    fn test_synthetic_codes() {
        assert_eq!(interpret(TIMEOUT_CODE).category, ResultCategory::Timeout);
        assert_eq!(interpret(WORKER_CRASH_CODE).category, ResultCategory::WorkerCrash);
        assert_eq!(interpret(CANCELLED_CODE).category, ResultCategory::Cancelled);
    }

    #[test]
    fn test_unknown_code_preserved() {
        let result = interpret(hresult(0xC0AA_B101));
        assert_eq!(result.category, ResultCategory::UnknownComError);
        assert_eq!(result.code, hresult(0xC0AA_B101));
        assert!(result.describe().contains("0xC0AAB101"));

        let small = interpret(42);
        assert_eq!(small.category, ResultCategory::UnknownComError);
        assert_eq!(small.code, 42);
    }

    #[test]
    fn test_table_has_no_duplicate_codes() {
        for (i, (code, _)) in RESULT_TABLE.iter().enumerate() {
            assert!(
                RESULT_TABLE[i + 1..].iter().all(|(other, _)| other != code),
                "duplicate code {:#X}",
                code
            );
        }
    }

    #[test]
    fn test_every_category_has_a_diagnosis() {
        for (_, category) in RESULT_TABLE {
            assert!(!category.diagnosis().is_empty());
        }
        assert!(!ResultCategory::UnknownComError.diagnosis().is_empty());
    }
}
