//! Error types for the all-reduce run

use std::fmt;
use std::panic::Location;

use serde::Serialize;
use thiserror::Error;

/// Result type used throughout the crate
pub type Result<T> = std::result::Result<T, ReduceError>;

/// Source location of a checked library call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CallSite {
    pub file: &'static str,
    pub line: u32,
}

impl CallSite {
    /// Location of whoever called the (track_caller) function this is used in
    #[track_caller]
    pub fn here() -> Self {
        let loc = Location::caller();
        Self {
            file: loc.file(),
            line: loc.line(),
        }
    }
}

impl fmt::Display for CallSite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.file, self.line)
    }
}

/// Error types
#[derive(Debug, Error)]
pub enum ReduceError {
    // Library call failures
    #[error("Cuda error {site} '{call}: {message}'")]
    Cuda {
        site: CallSite,
        call: &'static str,
        message: String,
    },

    #[error("NCCL error {site} '{call}: {message}'")]
    Nccl {
        site: CallSite,
        call: &'static str,
        message: String,
    },

    #[error("VMM error: {0}")]
    Vmm(String),

    // Configuration errors
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // Device errors
    #[error("GPU {device} not available")]
    DeviceUnavailable { device: usize },

    #[error("Insufficient memory on GPU {device}: required {required_mb:.1}MB, available {available_mb:.1}MB")]
    InsufficientMemory {
        device: usize,
        required_mb: f64,
        available_mb: f64,
    },

    #[error("GPU {device} does not support virtual address management")]
    VmmUnsupported { device: usize },

    // Collective errors
    #[error("Collective error: {0}")]
    Collective(String),

    #[error("Verification failed on GPU {device} at element {index}: expected {expected}, got {got}")]
    VerificationFailed {
        device: usize,
        index: usize,
        expected: String,
        got: String,
    },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ReduceError {
    /// Everything except a missing VMM capability ends the run with a failure.
    /// A device without VMM support is reported and the run is skipped.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, ReduceError::VmmUnsupported { .. })
    }

    /// Call site of the failing library call, if there was one
    pub fn call_site(&self) -> Option<CallSite> {
        match self {
            ReduceError::Cuda { site, .. } | ReduceError::Nccl { site, .. } => Some(*site),
            _ => None,
        }
    }

    /// Build a runtime/driver failure at the caller's location
    #[track_caller]
    pub fn cuda(call: &'static str, message: impl fmt::Display) -> Self {
        ReduceError::Cuda {
            site: CallSite::here(),
            call,
            message: message.to_string(),
        }
    }

    /// Build a collective-library failure at the caller's location
    #[track_caller]
    pub fn nccl(call: &'static str, message: impl fmt::Display) -> Self {
        ReduceError::Nccl {
            site: CallSite::here(),
            call,
            message: message.to_string(),
        }
    }
}

/// Check a GPU runtime/driver result, recording the call site on failure
#[track_caller]
pub fn check_cuda<T, E: fmt::Debug>(result: std::result::Result<T, E>, call: &'static str) -> Result<T> {
    let site = CallSite::here();
    match result {
        Ok(v) => Ok(v),
        Err(e) => Err(ReduceError::Cuda {
            site,
            call,
            message: format!("{:?}", e),
        }),
    }
}

/// Check a collective-library result, recording the call site on failure
///
/// The error is the library's own message (from `ncclGetErrorString`).
#[track_caller]
pub fn check_nccl<T, E: fmt::Display>(
    result: std::result::Result<T, E>,
    call: &'static str,
) -> Result<T> {
    let site = CallSite::here();
    match result {
        Ok(v) => Ok(v),
        Err(e) => Err(ReduceError::Nccl {
            site,
            call,
            message: e.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_cuda_records_caller_line() {
        let expected_line = line!() + 1;
        let err = check_cuda::<(), _>(Err("out of memory"), "cudaMalloc").unwrap_err();
        let site = err.call_site().unwrap();
        assert_eq!(site.line, expected_line);
        assert!(site.file.ends_with("error.rs"));
        assert!(err.to_string().contains("cudaMalloc"));
        assert!(err.to_string().contains("out of memory"));
    }

    #[test]
    fn test_check_passes_values_through() {
        assert_eq!(check_nccl::<_, String>(Ok(7), "ncclGroupEnd").unwrap(), 7);
    }

    #[test]
    fn test_check_nccl_keeps_library_message() {
        let expected_line = line!() + 1;
        let err = check_nccl::<(), _>(Err("unhandled cuda error".to_string()), "ncclAllReduce").unwrap_err();
        assert_eq!(err.call_site().unwrap().line, expected_line);
        assert!(matches!(err, ReduceError::Nccl { call: "ncclAllReduce", .. }));
        // No Debug quoting around the message
        assert!(err.to_string().ends_with("'ncclAllReduce: unhandled cuda error'"));
    }

    #[test]
    fn test_vmm_unsupported_is_not_fatal() {
        assert!(!ReduceError::VmmUnsupported { device: 1 }.is_fatal());
        assert!(ReduceError::nccl("ncclAllReduce", "unhandled cuda error").is_fatal());
        assert!(ReduceError::InvalidConfig("x".into()).is_fatal());
    }
}
